//! Gestionnaire de snapshot : refresh, persistance, notifications.

use crate::model::{normalize, Snapshot};
use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use panoapi::{ApiError, ControlPlaneClient, SnapshotPayload};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Évènement émis aux abonnés du gestionnaire.
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    /// Un snapshot d'une nouvelle version (ou d'un nouvel id) est actif
    Changed(Arc<Snapshot>),
}

/// Enveloppe persistée du last-known-good.
///
/// On persiste la charge utile brute : la normalisation est rejouée au
/// chargement, avec la politique de domaines du moment.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    fetched_at: DateTime<Utc>,
    payload: SnapshotPayload,
}

/// Gestionnaire du snapshot actif.
///
/// Possède exclusivement le fichier last-known-good ; un seul `refresh`
/// est en vol à la fois.
pub struct SnapshotManager {
    api: ControlPlaneClient,
    device_id: String,
    allowed_domains: Vec<String>,
    lkg_path: PathBuf,
    current: RwLock<Option<Arc<Snapshot>>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<SnapshotEvent>,
    refresh_notify: Notify,
    degraded: AtomicBool,
    /// L'endpoint snapshot n'existe pas sur ce plan de contrôle ;
    /// latche le bruit de log pour la durée du processus
    endpoint_missing: AtomicBool,
}

impl SnapshotManager {
    /// Construit le gestionnaire et recharge le last-known-good.
    ///
    /// # Arguments
    ///
    /// * `api` - Client du plan de contrôle
    /// * `device_id` - Identifiant de l'écran
    /// * `allowed_domains` - Domaines autorisés pour les items `url`
    /// * `lkg_path` - Fichier du dernier snapshot valide
    pub fn new(
        api: ControlPlaneClient,
        device_id: String,
        allowed_domains: Vec<String>,
        lkg_path: PathBuf,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);

        let manager = Self {
            api,
            device_id,
            allowed_domains,
            lkg_path,
            current: RwLock::new(None),
            last_sync: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            events,
            refresh_notify: Notify::new(),
            degraded: AtomicBool::new(false),
            endpoint_missing: AtomicBool::new(false),
        };

        manager.load_last_known_good();
        Arc::new(manager)
    }

    /// Recharge le dernier snapshot valide depuis le disque.
    fn load_last_known_good(&self) {
        let Ok(bytes) = std::fs::read(&self.lkg_path) else {
            info!("No last-known-good snapshot on disk");
            return;
        };

        match serde_json::from_slice::<StoredSnapshot>(&bytes) {
            Ok(stored) => match normalize(&stored.payload, &self.allowed_domains) {
                Ok(snapshot) => {
                    info!(
                        schedule_id = %snapshot.schedule_id,
                        version = snapshot.version,
                        fetched_at = %stored.fetched_at,
                        "Loaded last-known-good snapshot"
                    );
                    *self.last_sync.write().unwrap() = Some(stored.fetched_at);
                    *self.current.write().unwrap() = Some(Arc::new(snapshot));
                }
                Err(e) => warn!(error = %e, "Persisted snapshot no longer validates, ignoring"),
            },
            Err(e) => warn!(error = %e, "Corrupt last-known-good snapshot file, ignoring"),
        }
    }

    /// Snapshot courant, s'il en existe un.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().unwrap().clone()
    }

    /// Date du dernier fetch réussi.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().unwrap()
    }

    /// Vrai si le dernier refresh n'a pas pu joindre le plan de contrôle.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// S'abonne aux changements de snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }

    /// Demande un refresh immédiat à la boucle de fond.
    pub fn kick(&self) {
        self.refresh_notify.notify_one();
    }

    /// Récupère le snapshot courant auprès du plan de contrôle.
    ///
    /// Sérialisé : un seul refresh en vol. Sur coupure réseau ou
    /// endpoint absent (404/501), retourne le last-known-good sans
    /// erreur et marque l'agent dégradé.
    pub async fn refresh(&self) -> Result<Option<Arc<Snapshot>>> {
        let _guard = self.refresh_lock.lock().await;

        let payload = match self.api.fetch_snapshot(&self.device_id).await {
            Ok(payload) => payload,
            Err(ApiError::EndpointMissing(endpoint)) => {
                if !self.endpoint_missing.swap(true, Ordering::Relaxed) {
                    warn!(endpoint = %endpoint, "Snapshot endpoint not provided by control plane, serving last-known-good");
                }
                self.degraded.store(true, Ordering::Relaxed);
                return Ok(self.current());
            }
            Err(e) if e.is_offline() => {
                self.degraded.store(true, Ordering::Relaxed);
                warn!(error = %e, "Snapshot fetch failed, serving last-known-good");
                return Ok(self.current());
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        self.adopt(payload)
    }

    /// Adopte une charge utile de snapshot : validation, persistance du
    /// last-known-good et notification si la version change.
    ///
    /// Utilisé par `refresh` et par le chemin poussé du canal duplex
    /// quand le serveur livre le snapshot en ligne.
    pub fn adopt(&self, payload: SnapshotPayload) -> Result<Option<Arc<Snapshot>>> {
        let snapshot = match normalize(&payload, &self.allowed_domains) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Control plane served an invalid snapshot");
                self.degraded.store(true, Ordering::Relaxed);
                return Err(e);
            }
        };

        self.degraded.store(false, Ordering::Relaxed);
        *self.last_sync.write().unwrap() = Some(Utc::now());

        let changed = {
            let current = self.current.read().unwrap();
            match current.as_ref() {
                Some(existing) => {
                    existing.snapshot_id != snapshot.snapshot_id
                        || existing.version != snapshot.version
                }
                None => true,
            }
        };

        if changed {
            self.persist(&payload)?;

            let snapshot = Arc::new(snapshot);
            *self.current.write().unwrap() = Some(snapshot.clone());
            info!(
                schedule_id = %snapshot.schedule_id,
                version = snapshot.version,
                items = snapshot.items.len(),
                emergency = snapshot.emergency.is_some(),
                "Snapshot changed"
            );
            let _ = self.events.send(SnapshotEvent::Changed(snapshot));
        }

        Ok(self.current())
    }

    /// Persiste le last-known-good (écriture atomique).
    fn persist(&self, payload: &SnapshotPayload) -> Result<()> {
        let stored = StoredSnapshot {
            fetched_at: Utc::now(),
            payload: payload.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&stored)
            .map_err(|e| SnapshotError::Persistence(e.to_string()))?;
        panoutils::atomic_write(&self.lkg_path, &bytes)
            .map_err(|e| SnapshotError::Persistence(e.to_string()))
    }

    /// Boucle de fond : refresh périodique plus refresh à la demande.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.refresh_notify.notified() => {}
            }

            if let Err(e) = self.refresh().await {
                error!(error = %e, "Snapshot refresh failed");
            }
        }
    }
}
