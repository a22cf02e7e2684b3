//! Canal requête/réponse HTTPS avec TLS mutuel optionnel.

use crate::{Backoff, Result, TransportError};
use panoidentity::IdentityMaterial;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Réponse HTTP décodée en mémoire.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Désérialise le corps JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| TransportError::Transport(format!(
            "Invalid JSON body: {}",
            e
        )))
    }
}

/// Client HTTP du plan de contrôle.
///
/// Toutes les méthodes retentent sur erreur transport et 5xx, avec un
/// backoff exponentiel borné (base 1 s, plafond 60 s, full jitter). Les
/// 4xx sont retournées immédiatement, sauf 429 qui honore l'en-tête
/// `Retry-After`.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    base_url: String,
    retry_attempts: u32,
    timeout_ms: u64,
}

impl HttpChannel {
    /// Construit un canal sans certificat client (phase de pairing).
    pub fn new(base_url: &str, timeout_ms: u64, retry_attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| TransportError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_attempts,
            timeout_ms,
        })
    }

    /// Construit un canal authentifié par le matériel d'identité (mTLS).
    ///
    /// La clé et le certificat client forment l'identité TLS ; la CA
    /// émettrice est ajoutée aux racines de confiance pour que le plan
    /// de contrôle puisse présenter un certificat signé par elle.
    pub fn with_identity(
        base_url: &str,
        timeout_ms: u64,
        retry_attempts: u32,
        material: &IdentityMaterial,
    ) -> Result<Self> {
        let identity_pem = format!("{}{}", material.key_pem, material.cert_pem);
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
            .map_err(|e| TransportError::Identity(e.to_string()))?;
        let ca = reqwest::Certificate::from_pem(material.ca_pem.as_bytes())
            .map_err(|e| TransportError::Identity(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .identity(identity)
            .add_root_certificate(ca)
            .build()
            .map_err(|e| TransportError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_attempts,
            timeout_ms,
        })
    }

    /// URL de base du plan de contrôle.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Client `reqwest` sous-jacent.
    ///
    /// Utilisé par le téléchargeur du cache pour ses requêtes Range en
    /// streaming ; le retry y est géré par l'appelant.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// GET avec désérialisation JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(reqwest::Method::GET, path, None::<&()>)
            .await?
            .json()
    }

    /// POST d'un corps JSON avec désérialisation de la réponse.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(reqwest::Method::POST, path, Some(body))
            .await?
            .json()
    }

    /// POST d'un corps JSON sans décodage de la réponse.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HttpResponse> {
        self.request(reqwest::Method::POST, path, Some(body)).await
    }

    /// Envoie une requête arbitraire avec la politique de retry.
    ///
    /// # Arguments
    ///
    /// * `method` - Méthode HTTP
    /// * `path` - Chemin relatif à l'URL de base, ou URL absolue
    /// * `body` - Corps JSON optionnel
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<HttpResponse> {
        let url = self.url(path);
        let mut backoff = Backoff::transport();
        let mut last_status: Option<u16> = None;

        for attempt in 0..self.retry_attempts {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Ok(HttpResponse {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    if status.as_u16() == 429 {
                        // Honorer l'indication du serveur avant de retenter
                        let wait = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| backoff.peek_max());
                        warn!(url = %url, wait_secs = wait.as_secs(), "Rate limited by server");
                        last_status = Some(429);
                        tokio::time::sleep(wait.min(Duration::from_secs(60))).await;
                        backoff.next_delay();
                        continue;
                    }

                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(TransportError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    // 5xx : transitoire, retenter
                    last_status = Some(status.as_u16());
                    debug!(url = %url, status = status.as_u16(), attempt, "Server error, will retry");
                }
                Err(e) if e.is_timeout() => {
                    last_status = None;
                    debug!(url = %url, attempt, "Request timed out, will retry");
                }
                Err(e) => {
                    last_status = None;
                    debug!(url = %url, attempt, error = %e, "Transport failure, will retry");
                }
            }

            if attempt + 1 < self.retry_attempts {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }

        Err(TransportError::RetriesExhausted {
            attempts: self.retry_attempts,
            last_status,
        })
    }

    /// PUT d'octets bruts vers une URL absolue (upload indirect).
    pub async fn put_bytes(
        &self,
        url: &str,
        bytes: bytes::Bytes,
        content_type: &str,
    ) -> Result<()> {
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout_ms)
                } else {
                    TransportError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    /// Sonde de connectivité : vrai si le plan de contrôle répond,
    /// quel que soit le code de statut.
    pub async fn probe(&self) -> bool {
        match self
            .client
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Connectivity probe failed");
                false
            }
        }
    }
}
