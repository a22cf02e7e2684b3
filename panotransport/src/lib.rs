//! # panotransport - Couche transport de PanoSign
//!
//! Fournit les deux modalités de communication avec le plan de
//! contrôle :
//!
//! - [`HttpChannel`] : requête/réponse HTTPS avec TLS mutuel optionnel,
//!   retry borné avec backoff exponentiel et jitter, sonde de
//!   connectivité
//! - [`DuplexChannel`] : canal websocket persistant avec ping de
//!   vivacité, reconnexion automatique et file de messages sortants
//!   rejoués dans l'ordre
//!
//! La durabilité des effets de bord ne vit PAS ici : un message perdu
//! pendant une coupure du canal duplex est au mieux rejoué à la
//! reconnexion ; ce qui doit survivre à un redémarrage passe par la file
//! sortante de `panoqueue`.

pub mod backoff;
pub mod duplex;
pub mod http;

pub use backoff::Backoff;
pub use duplex::{DuplexChannel, DuplexMessage};
pub use http::{HttpChannel, HttpResponse};

use thiserror::Error;

/// Erreurs de la couche transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Échec réseau, DNS ou TLS ; candidat au retry
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Dépassement du délai de la requête
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Réponse 4xx : erreur définitive, pas de retry
    #[error("Server rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Réponse 5xx après épuisement des tentatives
    #[error("Retries exhausted after {attempts} attempts, last status {last_status:?}")]
    RetriesExhausted {
        attempts: u32,
        last_status: Option<u16>,
    },

    /// Le canal duplex est fermé
    #[error("Duplex channel closed")]
    ChannelClosed,

    /// Matériel d'identité inutilisable pour le TLS mutuel
    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
