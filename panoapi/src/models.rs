//! Modèles de fil du plan de contrôle.
//!
//! Les corps sont du JSON ; les timestamps sont en RFC3339. Les types
//! de ce module reflètent le contrat serveur tel quel, la normalisation
//! métier (validation, résolution des URLs média) vit dans
//! `panosnapshot`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ===== Pairing =====

#[derive(Debug, Clone, Serialize)]
pub struct PairingRequest {
    /// Nom local provisoire (uuid de premier démarrage)
    pub device_uuid: String,
    /// Description lisible de l'écran
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairingRequestResponse {
    /// Code à présenter à l'opérateur
    pub pairing_code: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairingStatusResponse {
    pub paired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingCompleteRequest {
    pub pairing_code: String,
    /// Demande PKCS#10, PEM
    pub csr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairingCompleteResponse {
    pub device_id: String,
    /// Certificat client signé, PEM
    pub client_cert: String,
    /// Certificat de la CA émettrice, PEM
    pub ca_cert: String,
}

// ===== Snapshot =====

/// Snapshot brut tel que servi par `GET /device/{id}/snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub snapshot_id: String,
    pub schedule_id: String,
    pub version: u64,
    #[serde(default)]
    pub items: Vec<PlaylistItemPayload>,
    /// Item d'urgence, prioritaire sur la grille si présent
    #[serde(default)]
    pub emergency: Option<PlaylistItemPayload>,
    /// Item par défaut, affiché quand la grille est vide
    #[serde(default)]
    pub default: Option<PlaylistItemPayload>,
    /// Correspondance media id → URL de téléchargement
    #[serde(default)]
    pub media_urls: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItemPayload {
    pub item_id: String,
    #[serde(default)]
    pub media_id: Option<String>,
    pub media_type: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub fit: Option<String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub transition_ms: u64,
    /// URL source pour les items de type `url`
    #[serde(default)]
    pub source_url: Option<String>,
    /// Empreinte SHA-256 attendue du média, hex
    #[serde(default)]
    pub digest: Option<String>,
    /// Taille attendue en octets
    #[serde(default)]
    pub size: Option<u64>,
}

// ===== Commandes =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Résultat d'exécution renvoyé en acquittement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandAck {
    pub command_id: String,
    /// `ok`, `error`, `rate-limited` ou `expired`
    pub status: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

// ===== Télémétrie =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub device_id: String,
    pub cpu_percent: f32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub media_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ===== Proof-of-play =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfPlayEvent {
    pub device_id: String,
    pub schedule_id: String,
    pub media_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub completed: bool,
    /// Clé d'idempotence `device:media:start`
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfPlayBatch {
    pub events: Vec<ProofOfPlayEvent>,
}

// ===== Upload indirect =====

#[derive(Debug, Clone, Deserialize)]
pub struct PresignedUrlResponse {
    /// URL courte durée vers laquelle PUT les octets
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}
