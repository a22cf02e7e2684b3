//! # panocache - Cache média adressé par contenu
//!
//! Cette crate stocke les médias de l'écran sur disque, avec un index
//! SQLite pour les métadonnées :
//!
//! - chaque entrée est identifiée par son media id et porte l'empreinte
//!   SHA-256 attendue ; un fichier dont l'empreinte ne correspond pas
//!   est mis en quarantaine, jamais écrasé silencieusement
//! - les téléchargements sont repris par requêtes Range validées par
//!   entity tag, atterrissent dans un fichier temporaire puis sont
//!   renommés atomiquement dans le répertoire d'objets
//! - la taille totale des entrées prêtes est bornée ; l'éviction est
//!   LRU et ne touche jamais une entrée épinglée
//! - un seul téléchargement est en vol par media id : un second appel
//!   `install` rejoint le travail du premier
//!
//! ## Arborescence
//!
//! ```text
//! <cache>/objects/<media-id>      - objets prêts
//! <cache>/objects/.tmp/*.part     - téléchargements en cours
//! <cache>/objects/quarantine/*    - empreintes invalides
//! <cache>/index.db                - index SQLite
//! ```

pub mod cache;
pub mod db;
pub mod download;

pub use cache::{CacheStats, MediaCache};
pub use db::{MediaDb, MediaRow, MediaStatus};

use thiserror::Error;

/// Limiteur de débit appliqué aux téléchargements du cache.
///
/// Implémenté par le planificateur de préchargement (token bucket sur le
/// budget Mbit/s configuré). `acquire` rend la main quand l'appelant a
/// le droit de consommer `bytes` octets ; avec un budget nul, l'attente
/// ne se termine jamais et les téléchargements sont de fait suspendus.
pub trait RateLimiter: Send + Sync {
    fn acquire(&self, bytes: usize) -> futures_util::future::BoxFuture<'_, ()>;
}

/// Erreurs du cache média
#[derive(Debug, Error)]
pub enum CacheError {
    /// L'empreinte du fichier téléchargé ne correspond pas
    #[error("Integrity mismatch for {media_id}: expected {expected}, got {actual}")]
    Integrity {
        media_id: String,
        expected: String,
        actual: String,
    },

    /// Le budget ne peut pas être respecté sans toucher aux épinglés
    #[error("Cache full: need {needed} bytes, only {reclaimable} reclaimable")]
    CacheFull { needed: u64, reclaimable: u64 },

    #[error("Media not found in cache: {0}")]
    NotFound(String),

    #[error("Download failed for {media_id}: {reason}")]
    Download { media_id: String, reason: String },

    #[error("Cache persistence error: {0}")]
    Persistence(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
