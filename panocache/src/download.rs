//! Téléchargement repris et vérification d'empreinte.

use crate::{CacheError, RateLimiter, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Résultat d'un téléchargement terminé.
#[derive(Debug)]
pub struct DownloadOutcome {
    /// Taille finale du fichier en octets
    pub size: u64,
    /// Entity tag renvoyé par le serveur, pour une reprise ultérieure
    pub etag: Option<String>,
}

/// Télécharge `url` vers `dest`, en reprenant un fichier partiel
/// existant si le serveur accepte la requête Range.
///
/// La reprise n'est tentée que si un entity tag de la session
/// précédente est connu : il est envoyé en `If-Range` pour que le
/// serveur reparte de zéro si le contenu a changé entre-temps.
///
/// # Arguments
///
/// * `client` - Client HTTP partagé
/// * `url` - Source du média
/// * `dest` - Fichier de destination (`.part`)
/// * `previous_etag` - Entity tag de la tentative précédente
/// * `limiter` - Budget de bande passante, `None` = débit libre
/// * `cancel` - Annulation coopérative (arrêt de l'agent)
pub async fn download_resumable(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    previous_etag: Option<&str>,
    limiter: Option<&dyn RateLimiter>,
    cancel: &CancellationToken,
) -> Result<DownloadOutcome> {
    let map_err = |reason: String| CacheError::Download {
        media_id: dest
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
        reason,
    };

    let existing = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);

    let mut request = client.get(url);
    let resuming = existing > 0 && previous_etag.is_some();
    if resuming {
        request = request
            .header(reqwest::header::RANGE, format!("bytes={}-", existing))
            .header(reqwest::header::IF_RANGE, previous_etag.unwrap());
        debug!(url, offset = existing, "Resuming interrupted download");
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(map_err("cancelled".into())),
        result = request.send() => result.map_err(|e| map_err(e.to_string()))?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(map_err(format!("HTTP status {}", status)));
    }

    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    // 206 : le serveur accepte la reprise ; tout autre succès repart du
    // début du fichier
    let append = resuming && status == reqwest::StatusCode::PARTIAL_CONTENT;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(dest)
        .await?;

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                file.flush().await?;
                return Err(map_err("cancelled".into()));
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if let Some(limiter) = limiter {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            file.flush().await?;
                            return Err(map_err("cancelled".into()));
                        }
                        _ = limiter.acquire(bytes.len()) => {}
                    }
                }
                file.write_all(&bytes).await.map_err(|e| {
                    // Disque plein pendant l'écriture : remonté tel quel,
                    // l'appelant supprime le fichier temporaire
                    CacheError::Io(e)
                })?;
            }
            Some(Err(e)) => return Err(map_err(e.to_string())),
            None => break,
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    let size = file.metadata().await?.len();

    Ok(DownloadOutcome { size, etag })
}

/// Calcule l'empreinte SHA-256 d'un fichier, en hexadécimal.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
