//! Auto-surveillance périodique de la santé.
//!
//! À la cadence configurée, recalcule le statut global de l'agent et
//! journalise les transitions (healthy ↔ degraded ↔ unhealthy). C'est le
//! même verdict que `/healthz`, mais poussé dans les logs pour les
//! parcs sans supervision active de la surface locale.

use panoplayer::PlayerState;
use panosnapshot::SnapshotManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Statut global, du meilleur au pire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Verdict de santé à partir de l'état du lecteur et de la fraîcheur du
/// plan de contrôle. Partagé entre `/healthz` et la tâche de veille.
pub fn evaluate(state: PlayerState, snapshot_degraded: bool) -> HealthStatus {
    if state == PlayerState::Error {
        HealthStatus::Unhealthy
    } else if snapshot_degraded || state == PlayerState::OfflineFallback {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Tâche de veille : journalise les transitions de statut.
pub async fn run_health_watch(
    state_rx: watch::Receiver<PlayerState>,
    snapshots: Arc<SnapshotManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut previous = HealthStatus::Healthy;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let status = evaluate(*state_rx.borrow(), snapshots.is_degraded());
        if status != previous {
            match status {
                HealthStatus::Healthy => {
                    info!(from = previous.as_str(), "Agent back to healthy")
                }
                HealthStatus::Degraded => {
                    warn!(from = previous.as_str(), "Agent degraded")
                }
                HealthStatus::Unhealthy => {
                    warn!(from = previous.as_str(), "Agent unhealthy")
                }
            }
            previous = status;
        }
    }
}
