//! Tâche de heartbeat.

use chrono::Utc;
use panoapi::HeartbeatRecord;
use panoprefetch::PlaybackPosition;
use panoqueue::{QueueDrainer, QueueStore, RecordKind};
use panosnapshot::SnapshotManager;
use panoutils::SystemStatsCollector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Tâche périodique d'émission du heartbeat.
///
/// Le relevé part dans la file sortante : hors ligne, les heartbeats
/// s'accumulent et seront livrés dans l'ordre au retour du réseau.
pub struct HeartbeatTask {
    device_id: String,
    queue: Arc<QueueStore>,
    drainer: Arc<QueueDrainer>,
    collector: Arc<SystemStatsCollector>,
    snapshots: Arc<SnapshotManager>,
    position_rx: watch::Receiver<PlaybackPosition>,
    /// Chemin mesuré pour l'usage disque (racine du cache)
    disk_path: PathBuf,
}

impl HeartbeatTask {
    pub fn new(
        device_id: String,
        queue: Arc<QueueStore>,
        drainer: Arc<QueueDrainer>,
        collector: Arc<SystemStatsCollector>,
        snapshots: Arc<SnapshotManager>,
        position_rx: watch::Receiver<PlaybackPosition>,
        disk_path: PathBuf,
    ) -> Self {
        Self {
            device_id,
            queue,
            drainer,
            collector,
            snapshots,
            position_rx,
            disk_path,
        }
    }

    /// Construit le relevé courant.
    pub fn collect(&self) -> HeartbeatRecord {
        let stats = self.collector.collect(&self.disk_path);
        let position = self.position_rx.borrow().clone();

        HeartbeatRecord {
            device_id: self.device_id.clone(),
            cpu_percent: stats.cpu_percent,
            memory_used: stats.memory_used,
            memory_total: stats.memory_total,
            disk_used: stats.disk_used,
            disk_total: stats.disk_total,
            uptime_secs: self.collector.process_uptime_secs(),
            temperature: stats.temperature,
            schedule_id: self.snapshots.current().map(|s| s.schedule_id.clone()),
            media_id: position.media_id,
            recorded_at: Utc::now(),
        }
    }

    /// Mesure et enfile un heartbeat.
    pub fn beat(&self) {
        let record = self.collect();
        let body = match serde_json::to_string(&record) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize heartbeat");
                return;
            }
        };

        if let Err(e) = self
            .queue
            .enqueue(RecordKind::Heartbeat, "POST", "/device/heartbeat", &body)
        {
            warn!(error = %e, "Failed to enqueue heartbeat");
            return;
        }
        self.drainer.kick();
    }

    /// Boucle de fond.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.beat(),
            }
        }
    }
}
