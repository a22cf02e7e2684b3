//! # panoqueue - File sortante durable
//!
//! File d'intentions d'effets de bord distants (heartbeats, acquittements
//! de commandes, proof-of-play, bundles de logs) persistée en SQLite :
//!
//! - l'enfilement est une écriture unique, sûre en cas de crash
//! - FIFO par genre, alternance entre genres au drainage pour éviter la
//!   famine
//! - un 2xx supprime l'enregistrement ; un 5xx ou une coupure le
//!   conserve avec tentative+1 ; un 4xx le jette, sauf le 409 des
//!   proof-of-play qui vaut succès (doublon déjà connu du serveur)
//! - un plafond dur borne la file ; au-delà, le plus ancien
//!   enregistrement du même genre est écarté en premier
//!
//! Un seul drainage est en vol à la fois ; le drainage final d'arrêt est
//! borné par la fenêtre de grâce de la racine de composition.

pub mod drainer;
pub mod store;

pub use drainer::{DrainReport, QueueDrainer};
pub use store::{OutboundRecord, QueueStore, RecordKind};

use thiserror::Error;

/// Erreurs de la file sortante
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue persistence error: {0}")]
    Persistence(String),

    #[error("Unknown record kind: {0}")]
    UnknownKind(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
