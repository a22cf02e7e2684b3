//! Magasin des clés et certificats de l'agent.

use crate::{IdentityError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

const KEY_FILE: &str = "client.key";
const CERT_FILE: &str = "client.crt";
const CA_FILE: &str = "ca.crt";

/// État du matériel d'identité.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// Aucun fichier présent
    Absent,
    /// Clé présente, certificat pas encore installé (CSR émise)
    CsrSent,
    /// Clé + certificats installés et valides
    Installed,
    /// Installé mais la fenêtre de validité restante est sous le seuil
    Expiring,
}

/// Matériel d'identité chargé, prêt pour le transport mTLS.
#[derive(Clone)]
pub struct IdentityMaterial {
    /// Clé privée, PEM
    pub key_pem: String,
    /// Certificat client, PEM
    pub cert_pem: String,
    /// Certificat de la CA émettrice, PEM
    pub ca_pem: String,
    /// Fin de validité du certificat client
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Ne jamais exposer le PEM de la clé dans les logs
        f.debug_struct("IdentityMaterial")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Magasin d'identité sur disque.
///
/// Le répertoire de secrets doit avoir été créé en mode 0700 par la
/// configuration ; le magasin n'écrit la clé privée qu'en mode 0600 via
/// une écriture atomique.
#[derive(Debug)]
pub struct IdentityStore {
    secrets_dir: PathBuf,
}

impl IdentityStore {
    pub fn new(secrets_dir: PathBuf) -> Self {
        Self { secrets_dir }
    }

    fn key_path(&self) -> PathBuf {
        self.secrets_dir.join(KEY_FILE)
    }

    fn cert_path(&self) -> PathBuf {
        self.secrets_dir.join(CERT_FILE)
    }

    fn ca_path(&self) -> PathBuf {
        self.secrets_dir.join(CA_FILE)
    }

    /// Génère une nouvelle clé P-256 et l'écrit sur disque (0600).
    ///
    /// Toute clé existante est remplacée ; les certificats associés à
    /// l'ancienne clé sont supprimés puisqu'ils ne correspondent plus.
    pub fn generate_key(&self) -> Result<()> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| IdentityError::KeyGeneration(e.to_string()))?;

        panoutils::atomic_write_with_mode(
            &self.key_path(),
            key_pair.serialize_pem().as_bytes(),
            0o600,
        )
        .map_err(|e| IdentityError::Other(e.to_string()))?;

        let _ = fs::remove_file(self.cert_path());
        let _ = fs::remove_file(self.ca_path());

        info!("Generated new P-256 device key");
        Ok(())
    }

    /// Produit une demande de certificat PKCS#10 liée à la clé du magasin.
    ///
    /// # Arguments
    ///
    /// * `common_name` - Nom auquel la CSR s'engage : le device id
    ///   attribué si connu, sinon le uuid local de premier démarrage
    ///
    /// # Returns
    ///
    /// La CSR au format PEM.
    pub fn create_csr(&self, common_name: &str) -> Result<String> {
        let key_pem = fs::read_to_string(self.key_path())
            .map_err(|_| IdentityError::Incomplete("private key"))?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| IdentityError::CsrGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| IdentityError::CsrGeneration(e.to_string()))?;

        csr.pem()
            .map_err(|e| IdentityError::CsrGeneration(e.to_string()))
    }

    /// Installe le certificat client et le certificat CA reçus du plan
    /// de contrôle.
    ///
    /// Les deux fichiers sont écrits atomiquement ; le certificat est
    /// parsé avant écriture pour refuser un matériel corrompu.
    pub fn install_certificates(&self, cert_pem: &str, ca_pem: &str) -> Result<()> {
        // Validation avant toute écriture
        parse_cert_expiry(cert_pem)?;
        parse_cert_expiry(ca_pem)?;

        panoutils::atomic_write_with_mode(&self.cert_path(), cert_pem.as_bytes(), 0o600)
            .map_err(|e| IdentityError::Other(e.to_string()))?;
        panoutils::atomic_write_with_mode(&self.ca_path(), ca_pem.as_bytes(), 0o600)
            .map_err(|e| IdentityError::Other(e.to_string()))?;

        info!("Installed client certificate and issuing CA");
        Ok(())
    }

    /// Charge le matériel d'identité complet.
    ///
    /// Retourne [`IdentityError::NotInstalled`] si aucun fichier n'est
    /// présent, [`IdentityError::Incomplete`] si seul un sous-ensemble
    /// existe (l'agent est alors considéré non appairé).
    pub fn load(&self) -> Result<IdentityMaterial> {
        let key = fs::read_to_string(self.key_path()).ok();
        let cert = fs::read_to_string(self.cert_path()).ok();
        let ca = fs::read_to_string(self.ca_path()).ok();

        match (key, cert, ca) {
            (None, None, None) => Err(IdentityError::NotInstalled),
            (Some(key_pem), Some(cert_pem), Some(ca_pem)) => {
                let expires_at = parse_cert_expiry(&cert_pem)?;
                Ok(IdentityMaterial {
                    key_pem,
                    cert_pem,
                    ca_pem,
                    expires_at,
                })
            }
            (key, cert, _) => {
                let missing = if key.is_none() {
                    "private key"
                } else if cert.is_none() {
                    "client certificate"
                } else {
                    "CA certificate"
                };
                warn!(missing, "Identity material is incomplete, device is unpaired");
                Err(IdentityError::Incomplete(missing))
            }
        }
    }

    /// État courant du magasin.
    ///
    /// # Arguments
    ///
    /// * `renew_before_days` - Seuil sous lequel un certificat installé
    ///   passe à l'état [`IdentityState::Expiring`]
    pub fn state(&self, renew_before_days: u64) -> IdentityState {
        match self.load() {
            Ok(material) => {
                let remaining = material.expires_at - Utc::now();
                if remaining.num_days() < renew_before_days as i64 {
                    IdentityState::Expiring
                } else {
                    IdentityState::Installed
                }
            }
            Err(IdentityError::Incomplete("client certificate")) => IdentityState::CsrSent,
            Err(_) => IdentityState::Absent,
        }
    }

    /// Vrai si le certificat doit être renouvelé (fenêtre restante sous
    /// le seuil, ou déjà expiré).
    pub fn needs_renewal(&self, renew_before_days: u64) -> bool {
        matches!(self.state(renew_before_days), IdentityState::Expiring)
    }

    /// Supprime tout le matériel d'identité (désappairage explicite).
    pub fn unpair(&self) -> Result<()> {
        for path in [self.key_path(), self.cert_path(), self.ca_path()] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        info!("Identity material removed, device is unpaired");
        Ok(())
    }
}

/// Extrait la fin de validité d'un certificat PEM.
fn parse_cert_expiry(pem: &str) -> Result<DateTime<Utc>> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| IdentityError::CertificateParse(e.to_string()))?;
    let (_, cert) = X509Certificate::from_der(&parsed.contents)
        .map_err(|e| IdentityError::CertificateParse(e.to_string()))?;

    let ts = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| IdentityError::CertificateParse("invalid notAfter timestamp".into()))
}
