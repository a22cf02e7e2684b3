//! Enregistreur de proof-of-play.
//!
//! Capture les débuts et fins de présentation, déduplique sur la clé
//! d'idempotence `(device, media, début)` et spoule les évènements par
//! lots dans la file sortante durable.

use chrono::{DateTime, Utc};
use panoapi::{ProofOfPlayBatch, ProofOfPlayEvent};
use panoqueue::{QueueDrainer, QueueStore, RecordKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Taille maximale d'un lot avant enfilement.
const BATCH_LIMIT: usize = 25;
/// Intervalle de vidage des lots partiels.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Capacité de l'ensemble de déduplication.
const DEDUP_CAPACITY: usize = 4096;

/// Ensemble borné de clés d'idempotence déjà vues.
#[derive(Default)]
struct BoundedKeySet {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl BoundedKeySet {
    /// Insère la clé ; retourne faux si elle était déjà connue.
    fn insert(&mut self, key: String) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.order.len() == DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

struct Inner {
    /// Débuts sans fin encore vue : (schedule, media) → début
    open_starts: HashMap<(String, String), DateTime<Utc>>,
    seen: BoundedKeySet,
    batch: Vec<ProofOfPlayEvent>,
}

/// Enregistreur de proof-of-play.
pub struct ProofOfPlayRecorder {
    device_id: String,
    queue: Arc<QueueStore>,
    drainer: Arc<QueueDrainer>,
    inner: Mutex<Inner>,
}

impl ProofOfPlayRecorder {
    pub fn new(device_id: String, queue: Arc<QueueStore>, drainer: Arc<QueueDrainer>) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            queue,
            drainer,
            inner: Mutex::new(Inner {
                open_starts: HashMap::new(),
                seen: BoundedKeySet::default(),
                batch: Vec::new(),
            }),
        })
    }

    /// Enregistre le début d'une présentation.
    pub fn record_start(&self, schedule_id: &str, media_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .open_starts
            .insert((schedule_id.to_string(), media_id.to_string()), Utc::now());
    }

    /// Enregistre la fin d'une présentation.
    ///
    /// Une fin sans début correspondant est journalisée puis ignorée.
    pub fn record_end(&self, schedule_id: &str, media_id: &str, completed: bool) {
        let mut inner = self.inner.lock().unwrap();

        let key = (schedule_id.to_string(), media_id.to_string());
        let Some(started_at) = inner.open_starts.remove(&key) else {
            warn!(schedule_id, media_id, "Proof-of-play end without a start, dropping");
            return;
        };

        let ended_at = Utc::now();
        let idempotency_key = format!(
            "{}:{}:{}",
            self.device_id,
            media_id,
            started_at.timestamp_millis()
        );

        if !inner.seen.insert(idempotency_key.clone()) {
            debug!(key = %idempotency_key, "Duplicate proof-of-play event, dropping");
            return;
        }

        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        inner.batch.push(ProofOfPlayEvent {
            device_id: self.device_id.clone(),
            schedule_id: schedule_id.to_string(),
            media_id: media_id.to_string(),
            started_at,
            ended_at,
            duration_ms,
            completed,
            idempotency_key,
        });

        if inner.batch.len() >= BATCH_LIMIT {
            let batch = std::mem::take(&mut inner.batch);
            drop(inner);
            self.enqueue_batch(batch);
        }
    }

    /// Abandonne les débuts orphelins (réinitialisation de
    /// l'échéancier) : ils ne produiront aucun évènement.
    pub fn abandon_open_starts(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open_starts.is_empty() {
            debug!(
                abandoned = inner.open_starts.len(),
                "Abandoning open proof-of-play starts after scheduler reset"
            );
            inner.open_starts.clear();
        }
    }

    /// Vide le lot courant vers la file sortante.
    pub fn flush(&self) {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.batch)
        };
        if !batch.is_empty() {
            self.enqueue_batch(batch);
        }
    }

    fn enqueue_batch(&self, events: Vec<ProofOfPlayEvent>) {
        let batch = ProofOfPlayBatch { events };
        let body = match serde_json::to_string(&batch) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize proof-of-play batch");
                return;
            }
        };

        if let Err(e) =
            self.queue
                .enqueue(RecordKind::ProofOfPlay, "POST", "/device/proof-of-play", &body)
        {
            warn!(error = %e, "Failed to enqueue proof-of-play batch");
            return;
        }
        self.drainer.kick();
    }

    /// Boucle de vidage périodique des lots partiels.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.flush(),
            }
        }

        // Dernier vidage avant arrêt
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panotransport::HttpChannel;

    fn recorder(dir: &tempfile::TempDir) -> (Arc<QueueStore>, Arc<ProofOfPlayRecorder>) {
        let queue = Arc::new(QueueStore::open(&dir.path().join("queue.db"), 100, 5).unwrap());
        let http = HttpChannel::new("http://127.0.0.1:1", 500, 1).unwrap();
        let drainer = QueueDrainer::new(queue.clone(), http);
        let recorder = ProofOfPlayRecorder::new("screen-1".to_string(), queue.clone(), drainer);
        (queue, recorder)
    }

    #[tokio::test]
    async fn test_start_end_produces_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, recorder) = recorder(&dir);

        recorder.record_start("sched-1", "media-1");
        recorder.record_end("sched-1", "media-1", true);
        recorder.flush();

        assert_eq!(queue.size_of_kind(RecordKind::ProofOfPlay).unwrap(), 1);
        let record = queue.peek_kind(RecordKind::ProofOfPlay).unwrap().unwrap();
        let batch: ProofOfPlayBatch = serde_json::from_str(&record.body).unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(batch.events[0].completed);
        assert!(batch.events[0]
            .idempotency_key
            .starts_with("screen-1:media-1:"));
    }

    #[tokio::test]
    async fn test_end_without_start_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, recorder) = recorder(&dir);

        recorder.record_end("sched-1", "media-1", true);
        recorder.flush();

        assert_eq!(queue.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_starts_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, recorder) = recorder(&dir);

        recorder.record_start("sched-1", "media-1");
        recorder.abandon_open_starts();
        recorder.record_end("sched-1", "media-1", false);
        recorder.flush();

        assert_eq!(queue.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bounded_key_set_dedups() {
        let mut set = BoundedKeySet::default();
        assert!(set.insert("a".to_string()));
        assert!(!set.insert("a".to_string()));
        assert!(set.insert("b".to_string()));
    }
}
