//! # panoidentity - Identité cryptographique de l'écran
//!
//! Gère le matériel d'identité de l'agent : clé privée P-256, demande de
//! certificat PKCS#10 et certificats installés (client + CA émettrice).
//!
//! Tous les fichiers vivent dans un répertoire de secrets en mode 0700 :
//!
//! ```text
//! <secrets>/client.key   - clé privée P-256, PEM, mode 0600
//! <secrets>/client.crt   - certificat client, PEM
//! <secrets>/ca.crt       - certificat de la CA émettrice, PEM
//! ```
//!
//! L'identité est considérée présente uniquement si les trois fichiers
//! existent et se parsent ; tout état partiel vaut « non appairé ».

mod store;

pub use store::{IdentityMaterial, IdentityState, IdentityStore};

use thiserror::Error;

/// Erreurs de gestion du matériel d'identité
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    #[error("Certificate parse error: {0}")]
    CertificateParse(String),

    #[error("Identity material is incomplete: missing {0}")]
    Incomplete(&'static str),

    #[error("No identity installed")]
    NotInstalled,

    #[error("I/O error on identity store: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
