//! # panoapi - Client typé du plan de contrôle
//!
//! Expose chaque endpoint consommé par l'agent sous forme de méthode
//! typée, au-dessus de [`panotransport::HttpChannel`] :
//!
//! - pairing (demande de code, statut, complétion avec CSR)
//! - snapshot de diffusion
//! - commandes en attente et acquittements
//! - URLs d'upload indirect (captures d'écran, bundles de logs)
//!
//! Les enregistrements durables (heartbeat, proof-of-play, acks) ne
//! passent pas par ici : ils sont construits par leurs producteurs et
//! drainés génériquement par `panoqueue`.

pub mod client;
pub mod models;

pub use client::ControlPlaneClient;
pub use models::*;

use thiserror::Error;

/// Erreurs du client du plan de contrôle
#[derive(Debug, Error)]
pub enum ApiError {
    /// Code de pairing refusé par le serveur
    #[error("Pairing code rejected")]
    BadPairingCode,

    /// Le device est déjà appairé avec ce code
    #[error("Device already paired")]
    AlreadyPaired,

    /// Endpoint non fourni par ce plan de contrôle (404/501)
    #[error("Endpoint not implemented by control plane: {0}")]
    EndpointMissing(String),

    /// Refus définitif du serveur
    #[error("Server rejected request with status {status}: {body}")]
    ServerRejected { status: u16, body: String },

    /// Réponse imparsable ou contraire au contrat
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Échec transport (retries épuisés inclus)
    #[error(transparent)]
    Transport(#[from] panotransport::TransportError),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Classifie une erreur transport en erreur API, en distinguant les
    /// endpoints absents (404/501) qui déclenchent l'auto-désactivation
    /// de la fonctionnalité appelante.
    pub(crate) fn from_transport(err: panotransport::TransportError, endpoint: &str) -> Self {
        match err {
            panotransport::TransportError::Rejected { status, body: _ }
                if status == 404 || status == 501 =>
            {
                ApiError::EndpointMissing(endpoint.to_string())
            }
            panotransport::TransportError::Rejected { status, body } => {
                ApiError::ServerRejected { status, body }
            }
            other => ApiError::Transport(other),
        }
    }

    /// Vrai si l'erreur relève d'une coupure réseau plutôt que d'un
    /// refus du serveur.
    pub fn is_offline(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}
