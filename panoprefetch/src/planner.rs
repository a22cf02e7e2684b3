//! Boucle du planificateur de préchargement.

use crate::TokenBucket;
use panocache::MediaCache;
use panosnapshot::{PlaylistItem, SnapshotManager};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Position de lecture publiée par le contrôleur.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackPosition {
    /// Index de l'item en cours dans la grille
    pub index: usize,
    /// Media id en cours de présentation
    pub media_id: Option<String>,
}

/// Réglages du planificateur.
#[derive(Debug, Clone)]
pub struct PrefetchSettings {
    /// Nombre d'items préchargés devant la tête de lecture
    pub horizon: usize,
    /// Téléchargements simultanés
    pub concurrency: usize,
    /// Budget de bande passante en Mbit/s, 0 = suspendu
    pub bandwidth_mbits: u64,
}

/// Planificateur de préchargement.
///
/// Réagit aux changements de snapshot et à l'avancement de la lecture ;
/// chaque réveil recalcule le plan, met à jour les épingles puis lance
/// les installations manquantes sous le sémaphore de concurrence.
pub struct PrefetchPlanner {
    cache: Arc<MediaCache>,
    snapshots: Arc<SnapshotManager>,
    position_rx: watch::Receiver<PlaybackPosition>,
    settings: PrefetchSettings,
    workers: Arc<Semaphore>,
}

impl PrefetchPlanner {
    pub fn new(
        cache: Arc<MediaCache>,
        snapshots: Arc<SnapshotManager>,
        position_rx: watch::Receiver<PlaybackPosition>,
        settings: PrefetchSettings,
    ) -> Self {
        let bucket = Arc::new(TokenBucket::from_mbits(settings.bandwidth_mbits));
        cache.set_rate_limiter(Some(bucket));

        let workers = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            cache,
            snapshots,
            position_rx,
            settings,
            workers,
        }
    }

    /// Boucle de fond du planificateur.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut snapshot_events = self.snapshots.subscribe();

        // Premier plan au démarrage (last-known-good éventuel)
        self.replan();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = snapshot_events.recv() => {
                    if event.is_err() {
                        // Émetteur fermé : l'agent s'arrête
                        break;
                    }
                    self.replan();
                }
                changed = self.position_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.replan();
                }
            }
        }
    }

    /// Recalcule le plan et lance les téléchargements manquants.
    fn replan(&self) {
        let Some(snapshot) = self.snapshots.current() else {
            return;
        };
        let position = self.position_rx.borrow().clone();

        let plan = plan_items(&snapshot.items, position.index, self.settings.horizon);

        // Épingles : en cours de lecture ∪ horizon, plus urgence/défaut
        let mut pins: Vec<String> = Vec::new();
        let mut add_pin = |media_id: &Option<String>, pins: &mut Vec<String>| {
            if let Some(id) = media_id {
                pins.push(id.clone());
            }
        };
        add_pin(&position.media_id, &mut pins);
        if let Some(emergency) = &snapshot.emergency {
            add_pin(&emergency.media_id, &mut pins);
        }
        if let Some(default_item) = &snapshot.default_item {
            add_pin(&default_item.media_id, &mut pins);
        }
        for item in &plan {
            add_pin(&item.media_id, &mut pins);
        }
        let mut seen: HashSet<String> = HashSet::new();
        pins.retain(|id| seen.insert(id.clone()));

        if let Err(e) = self.cache.replace_pins(&pins) {
            warn!(error = %e, "Failed to update cache pin set");
        }

        // L'urgence et le défaut sont téléchargés avant la grille
        let mut downloads: Vec<&PlaylistItem> = Vec::new();
        if let Some(emergency) = &snapshot.emergency {
            downloads.push(emergency);
        }
        downloads.extend(plan.iter().copied());
        if let Some(default_item) = &snapshot.default_item {
            downloads.push(default_item);
        }

        for item in downloads {
            let (Some(media_id), Some(digest), Some(url)) =
                (&item.media_id, &item.digest, &item.download_url)
            else {
                continue;
            };

            // Déjà en cache : rien à faire, pas de réseau
            if self.cache.is_ready(media_id) {
                continue;
            }

            let cache = self.cache.clone();
            let workers = self.workers.clone();
            let media_id = media_id.clone();
            let digest = digest.clone();
            let url = url.clone();
            let size = item.size;

            tokio::spawn(async move {
                let Ok(_permit) = workers.acquire().await else {
                    return;
                };
                debug!(media_id = %media_id, "Prefetching media");
                if let Err(e) = cache.install(&media_id, &digest, &url, size).await {
                    warn!(media_id = %media_id, error = %e, "Prefetch failed");
                }
            });
        }
    }
}

/// Sélectionne les `horizon` prochains items depuis `current_index`,
/// par distance de lecture croissante, en bouclant sur la grille.
pub fn plan_items(
    items: &[PlaylistItem],
    current_index: usize,
    horizon: usize,
) -> Vec<&PlaylistItem> {
    if items.is_empty() || horizon == 0 {
        return Vec::new();
    }

    let len = items.len();
    let mut seen_media: HashSet<&str> = HashSet::new();
    let mut plan = Vec::new();

    for distance in 0..len.min(horizon) {
        let index = (current_index + distance) % len;
        let item = &items[index];
        // Un même média planifié deux fois ne compte qu'une fois
        if let Some(media_id) = &item.media_id {
            if !seen_media.insert(media_id) {
                continue;
            }
        }
        plan.push(item);
    }

    plan
}
