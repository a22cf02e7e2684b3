//! # panologship - Expédition des journaux
//!
//! Regroupe les fichiers de log tournés (bruts et déjà compressés) dans
//! une enveloppe JSON unique compressée gzip, identifiée par un bundle
//! id, puis la transfère via le protocole d'URL indirecte : demander une
//! URL d'upload courte durée au plan de contrôle, puis `PUT` des octets
//! directement vers la cible.
//!
//! Tourne sur une cadence quotidienne et sur commande explicite. Les
//! vieux bundles sont supprimés après la fenêtre de rétention. Si le
//! plan de contrôle n'offre pas l'endpoint d'URL indirecte (404/501),
//! l'expédition se désactive pour la durée du processus.

use base64::Engine;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use panoapi::{ApiError, ControlPlaneClient};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cadence d'expédition.
const SHIP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Erreurs de l'expéditeur de journaux
#[derive(Debug, Error)]
pub enum LogShipError {
    /// L'expédition s'est auto-désactivée pour ce processus
    #[error("Log shipping is disabled for this process lifetime")]
    Disabled,

    #[error("Bundle I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Bundle serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, LogShipError>;

/// Enveloppe d'un bundle de logs.
#[derive(Debug, Serialize)]
struct LogBundle {
    bundle_id: String,
    device_id: String,
    created_at: chrono::DateTime<Utc>,
    files: Vec<BundledFile>,
}

#[derive(Debug, Serialize)]
struct BundledFile {
    name: String,
    /// Contenu du fichier, base64 (le fichier peut déjà être compressé)
    content: String,
}

/// Expéditeur de journaux.
pub struct LogShipper {
    api: ControlPlaneClient,
    device_id: String,
    logs_dir: PathBuf,
    bundles_dir: PathBuf,
    retention: Duration,
    disabled: AtomicBool,
}

impl LogShipper {
    /// # Arguments
    ///
    /// * `api` - Client du plan de contrôle
    /// * `device_id` - Identifiant de l'écran
    /// * `logs_dir` - Répertoire des fichiers de log tournés
    /// * `retention_days` - Âge au-delà duquel un bundle est supprimé
    pub fn new(
        api: ControlPlaneClient,
        device_id: String,
        logs_dir: PathBuf,
        retention_days: u64,
    ) -> std::io::Result<Self> {
        let bundles_dir = logs_dir.join("bundles");
        std::fs::create_dir_all(&bundles_dir)?;

        Ok(Self {
            api,
            device_id,
            logs_dir,
            bundles_dir,
            retention: Duration::from_secs(retention_days * 24 * 3600),
            disabled: AtomicBool::new(false),
        })
    }

    /// Vrai si l'expédition s'est auto-désactivée.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Construit un bundle gzip depuis les fichiers de log courants.
    ///
    /// Retourne `None` s'il n'y a aucun fichier à expédier.
    pub fn bundle(&self) -> Result<Option<PathBuf>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.logs_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let content = std::fs::read(&path)?;
            files.push(BundledFile {
                name,
                content: base64::engine::general_purpose::STANDARD.encode(content),
            });
        }

        if files.is_empty() {
            return Ok(None);
        }

        let bundle = LogBundle {
            bundle_id: uuid::Uuid::new_v4().to_string(),
            device_id: self.device_id.clone(),
            created_at: Utc::now(),
            files,
        };

        let json =
            serde_json::to_vec(&bundle).map_err(|e| LogShipError::Serialization(e.to_string()))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;

        let path = self.bundles_dir.join(format!("{}.json.gz", bundle.bundle_id));
        panoutils::atomic_write(&path, &compressed)
            .map_err(|e| LogShipError::Serialization(e.to_string()))?;

        info!(
            bundle_id = %bundle.bundle_id,
            files = bundle.files.len(),
            bytes = compressed.len(),
            "Log bundle created"
        );
        Ok(Some(path))
    }

    /// Expédie un bundle via le protocole d'URL indirecte.
    pub async fn ship(&self, bundle_path: &Path) -> Result<()> {
        if self.is_disabled() {
            return Err(LogShipError::Disabled);
        }

        let presigned = match self.api.logs_presigned_url(&self.device_id).await {
            Ok(presigned) => presigned,
            Err(ApiError::EndpointMissing(endpoint)) => {
                warn!(
                    endpoint = %endpoint,
                    "Log upload endpoint not provided, disabling shipping for this process"
                );
                self.disabled.store(true, Ordering::Relaxed);
                return Err(LogShipError::Disabled);
            }
            Err(e) => return Err(e.into()),
        };

        let bytes = std::fs::read(bundle_path)?;
        self.api
            .upload_to_presigned(&presigned.url, bytes::Bytes::from(bytes), "application/gzip")
            .await?;

        info!(bundle = %bundle_path.display(), "Log bundle uploaded");
        Ok(())
    }

    /// Supprime les bundles plus vieux que la fenêtre de rétention.
    pub fn sweep_retention(&self) -> Result<usize> {
        let now = std::time::SystemTime::now();
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.bundles_dir)? {
            let entry = entry?;
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .map(|age| age > self.retention)
                .unwrap_or(false);

            if expired {
                debug!(bundle = %entry.path().display(), "Removing expired log bundle");
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Un cycle complet : bundle, expédition, rétention.
    pub async fn ship_now(&self) -> Result<()> {
        if let Some(path) = self.bundle()? {
            self.ship(&path).await?;
        }
        self.sweep_retention()?;
        Ok(())
    }

    /// Boucle de fond quotidienne.
    pub async fn run(self: std::sync::Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(SHIP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Le premier tick est immédiat : expédier au démarrage, les
        // fichiers de la session précédente attendent peut-être
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match self.ship_now().await {
                        Ok(()) => {}
                        Err(LogShipError::Disabled) => {}
                        Err(e) => warn!(error = %e, "Log shipping cycle failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use panotransport::HttpChannel;
    use std::io::Read;

    fn shipper(dir: &tempfile::TempDir) -> LogShipper {
        let http = HttpChannel::new("http://127.0.0.1:1", 500, 1).unwrap();
        LogShipper::new(
            ControlPlaneClient::new(http),
            "screen-1".to_string(),
            dir.path().to_path_buf(),
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_bundle_contains_all_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.log"), b"line one\n").unwrap();
        std::fs::write(dir.path().join("agent.log.1.gz"), b"\x1f\x8b_pretend").unwrap();

        let shipper = shipper(&dir);
        let path = shipper.bundle().unwrap().expect("bundle should exist");

        // Décompresser et vérifier l'enveloppe
        let mut decoder = GzDecoder::new(std::fs::File::open(&path).unwrap());
        let mut json = String::new();
        decoder.read_to_string(&mut json).unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(envelope["device_id"], "screen-1");
        assert!(!envelope["bundle_id"].as_str().unwrap().is_empty());
        let names: Vec<_> = envelope["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"agent.log".to_string()));
        assert!(names.contains(&"agent.log.1.gz".to_string()));
    }

    #[test]
    fn test_empty_logs_dir_produces_no_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = shipper(&dir);
        assert!(shipper.bundle().unwrap().is_none());
    }

    #[test]
    fn test_sweep_keeps_fresh_bundles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.log"), b"data").unwrap();

        let shipper = shipper(&dir);
        let path = shipper.bundle().unwrap().unwrap();

        // Bundle tout neuf : la rétention ne doit rien supprimer
        assert_eq!(shipper.sweep_retention().unwrap(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_ship_disabled_after_endpoint_missing_is_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = shipper(&dir);

        // Désactivation simulée (le plan de contrôle a répondu 404/501)
        shipper.disabled.store(true, Ordering::Relaxed);

        std::fs::write(dir.path().join("agent.log"), b"data").unwrap();
        let bundle = shipper.bundle().unwrap().unwrap();
        assert!(matches!(
            shipper.ship(&bundle).await,
            Err(LogShipError::Disabled)
        ));
    }
}
