//! Client des endpoints du plan de contrôle.

use crate::models::*;
use crate::{ApiError, Result};
use panotransport::{HttpChannel, TransportError};
use tracing::info;

/// Client typé du plan de contrôle.
///
/// Enveloppe un [`HttpChannel`] (authentifié mTLS après pairing, nu
/// pendant) et traduit chaque endpoint en méthode typée.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: HttpChannel,
}

impl ControlPlaneClient {
    pub fn new(http: HttpChannel) -> Self {
        Self { http }
    }

    /// Canal HTTP sous-jacent (utilisé par le draineur de la file
    /// sortante et le téléchargeur du cache).
    pub fn http(&self) -> &HttpChannel {
        &self.http
    }

    // ===== Pairing =====

    /// Demande un code de pairing pour cet écran.
    pub async fn request_pairing(
        &self,
        device_uuid: &str,
        description: &str,
    ) -> Result<PairingRequestResponse> {
        let body = PairingRequest {
            device_uuid: device_uuid.to_string(),
            description: description.to_string(),
        };
        self.http
            .post_json("/device-pairing/request", &body)
            .await
            .map_err(|e| ApiError::from_transport(e, "/device-pairing/request"))
    }

    /// Interroge le statut de pairing.
    pub async fn pairing_status(&self, device_uuid: &str) -> Result<bool> {
        let path = format!("/device-pairing/status?device_id={}", device_uuid);
        let response: PairingStatusResponse = self
            .http
            .get_json(&path)
            .await
            .map_err(|e| ApiError::from_transport(e, "/device-pairing/status"))?;
        Ok(response.paired)
    }

    /// Soumet la CSR pour terminer le pairing.
    ///
    /// Le code est validé localement avant tout appel réseau : seuls les
    /// caractères alphanumériques (et tirets) sont acceptés.
    pub async fn complete_pairing(
        &self,
        pairing_code: &str,
        csr: &str,
    ) -> Result<PairingCompleteResponse> {
        if !is_valid_pairing_code(pairing_code) {
            return Err(ApiError::BadPairingCode);
        }

        let body = PairingCompleteRequest {
            pairing_code: pairing_code.to_string(),
            csr: csr.to_string(),
        };

        match self
            .http
            .post_json::<_, PairingCompleteResponse>("/device-pairing/complete", &body)
            .await
        {
            Ok(response) => {
                info!(device_id = %response.device_id, "Pairing completed");
                Ok(response)
            }
            Err(TransportError::Rejected { status: 400, .. })
            | Err(TransportError::Rejected { status: 404, .. }) => Err(ApiError::BadPairingCode),
            Err(TransportError::Rejected { status: 409, .. }) => Err(ApiError::AlreadyPaired),
            Err(e) => Err(ApiError::from_transport(e, "/device-pairing/complete")),
        }
    }

    // ===== Snapshot =====

    /// Récupère le snapshot courant de l'écran.
    pub async fn fetch_snapshot(&self, device_id: &str) -> Result<SnapshotPayload> {
        let path = format!("/device/{}/snapshot", device_id);
        self.http
            .get_json(&path)
            .await
            .map_err(|e| ApiError::from_transport(e, "snapshot"))
    }

    // ===== Commandes =====

    /// Récupère les commandes en attente.
    pub async fn fetch_commands(&self, device_id: &str) -> Result<Vec<CommandEnvelope>> {
        let path = format!("/device/{}/commands", device_id);
        self.http
            .get_json(&path)
            .await
            .map_err(|e| ApiError::from_transport(e, "commands"))
    }

    /// Chemin d'acquittement d'une commande, pour construire un
    /// enregistrement durable de la file sortante.
    pub fn command_ack_path(device_id: &str, command_id: &str) -> String {
        format!("/device/{}/commands/{}/ack", device_id, command_id)
    }

    // ===== Upload indirect =====

    /// Demande une URL d'upload pour une capture d'écran.
    pub async fn screenshot_presigned_url(&self, device_id: &str) -> Result<PresignedUrlResponse> {
        let path = format!("/device/{}/screenshot/presigned-url", device_id);
        self.http
            .post_json(&path, &serde_json::json!({}))
            .await
            .map_err(|e| ApiError::from_transport(e, "screenshot/presigned-url"))
    }

    /// Demande une URL d'upload pour un bundle de logs.
    pub async fn logs_presigned_url(&self, device_id: &str) -> Result<PresignedUrlResponse> {
        let path = format!("/device/{}/logs/presigned-url", device_id);
        self.http
            .post_json(&path, &serde_json::json!({}))
            .await
            .map_err(|e| ApiError::from_transport(e, "logs/presigned-url"))
    }

    /// PUT des octets vers une URL indirecte.
    pub async fn upload_to_presigned(
        &self,
        url: &str,
        data: bytes::Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.http
            .put_bytes(url, data, content_type)
            .await
            .map_err(|e| ApiError::from_transport(e, "presigned upload"))
    }
}

/// Validation locale d'un code de pairing.
///
/// Les codes émis par le plan de contrôle sont alphanumériques, avec
/// tirets de présentation optionnels.
pub fn is_valid_pairing_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= 32
        && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
