//! # panosnapshot - Décision de diffusion
//!
//! Un snapshot est la décision complète, à un instant donné, de ce que
//! l'écran doit présenter : la grille ordonnée d'items, un éventuel item
//! d'urgence qui préempte tout, et un item par défaut affiché quand la
//! grille est vide.
//!
//! Le gestionnaire :
//! - récupère le snapshot via `panoapi` (un seul refresh en vol)
//! - valide et normalise la charge utile (fonction pure des octets)
//! - persiste le dernier snapshot valide (« last-known-good ») et le
//!   recharge au démarrage : une fois qu'un snapshot valide a été reçu,
//!   l'écran reste présentable après un redémarrage sans réseau
//! - signale les changements de version aux abonnés

pub mod manager;
pub mod model;

pub use manager::{SnapshotEvent, SnapshotManager};
pub use model::{normalize, FitMode, MediaType, PlaylistItem, Snapshot};

use thiserror::Error;

/// Erreurs du gestionnaire de snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// La charge utile viole le contrat (structure ou valeurs)
    #[error("Snapshot validation failed: {0}")]
    Validation(String),

    /// Aucun snapshot n'a jamais été reçu
    #[error("No snapshot available")]
    NoSnapshot,

    #[error("Snapshot persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Api(#[from] panoapi::ApiError),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
