//! # panoplayer - Contrôleur de lecture
//!
//! Le contrôleur possède la machine à états de l'agent et arbitre entre
//! la grille normale, l'item d'urgence, l'item par défaut et le repli
//! hors ligne. C'est le seul abonné de l'échéancier et du gestionnaire
//! de snapshot : ni l'un ni l'autre ne le connaissent.
//!
//! La crate porte aussi :
//! - le déroulé de pairing (code affiché à l'écran, CSR, installation
//!   des certificats)
//! - l'enregistreur de proof-of-play (déduplication, lots, file durable)
//! - le canal de commandes (limites de débit par genre, acquittements
//!   idempotents)
//! - le trait [`RenderSurface`] que la surface de rendu implémente hors
//!   du cœur

pub mod commands;
pub mod controller;
pub mod pairing;
pub mod pop;
pub mod state;
pub mod surface;

pub use commands::{AgentAction, CommandChannel};
pub use controller::{ControllerDeps, PlaybackController};
pub use pairing::ensure_paired;
pub use pop::ProofOfPlayRecorder;
pub use state::PlayerState;
pub use surface::{PresentRequest, RenderSurface};

use thiserror::Error;

/// Erreurs du contrôleur de lecture
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Identity(#[from] panoidentity::IdentityError),

    #[error(transparent)]
    Api(#[from] panoapi::ApiError),

    #[error(transparent)]
    Snapshot(#[from] panosnapshot::SnapshotError),

    #[error("Render surface error: {0}")]
    Surface(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fatal player error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
