//! Drainage de la file sortante.

use crate::{OutboundRecord, QueueStore, RecordKind, Result};
use panotransport::{HttpChannel, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bilan d'une passe de drainage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Livrés (2xx, ou 409 pour les genres où le conflit vaut succès)
    pub delivered: usize,
    /// Jetés (4xx définitif ou tentatives épuisées)
    pub dropped: usize,
    /// Conservés pour une passe ultérieure (coupure, 5xx)
    pub retained: usize,
}

/// Draineur de la file sortante.
///
/// Une seule passe est en vol à la fois (verrou interne) ; la passe
/// alterne entre les genres en attente pour qu'un genre volumineux
/// n'affame pas les autres.
pub struct QueueDrainer {
    store: Arc<QueueStore>,
    http: HttpChannel,
    drain_lock: Mutex<()>,
    notify: Notify,
}

impl QueueDrainer {
    pub fn new(store: Arc<QueueStore>, http: HttpChannel) -> Arc<Self> {
        Arc::new(Self {
            store,
            http,
            drain_lock: Mutex::new(()),
            notify: Notify::new(),
        })
    }

    /// Réveille la boucle de drainage (après un enfilement ou un retour
    /// de connectivité).
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Boucle de fond : draine sur réveil explicite et sur tick
    /// périodique de rattrapage.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tick.tick() => {}
            }

            match self.drain().await {
                Ok(report) if report.delivered > 0 || report.dropped > 0 => {
                    debug!(
                        delivered = report.delivered,
                        dropped = report.dropped,
                        retained = report.retained,
                        "Outbound queue drained"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Outbound queue drain failed"),
            }
        }

        // Drainage final, borné par la fenêtre de grâce de l'appelant
        info!("Final outbound drain before shutdown");
        let _ = self.drain().await;
    }

    /// Une passe de drainage complète.
    ///
    /// Réentrant-sûr : si une passe est déjà en vol, retourne
    /// immédiatement un bilan vide.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return Ok(DrainReport::default());
        };

        let mut report = DrainReport::default();
        // Genres encore éligibles dans cette passe ; un genre en échec
        // transitoire en sort, les autres continuent
        let mut kinds: Vec<RecordKind> = self.store.pending_kinds()?;

        while !kinds.is_empty() {
            let mut next_round = Vec::with_capacity(kinds.len());

            for kind in kinds {
                let Some(record) = self.store.peek_kind(kind)? else {
                    continue;
                };

                match self.deliver(&record).await {
                    Delivery::Delivered => {
                        self.store.remove(record.id)?;
                        report.delivered += 1;
                        next_round.push(kind);
                    }
                    Delivery::Dropped(reason) => {
                        warn!(
                            kind = kind.as_str(),
                            record_id = record.id,
                            reason = %reason,
                            "Dropping outbound record"
                        );
                        self.store.remove(record.id)?;
                        report.dropped += 1;
                        next_round.push(kind);
                    }
                    Delivery::Retained => {
                        if record.attempts + 1 >= record.max_attempts {
                            warn!(
                                kind = kind.as_str(),
                                record_id = record.id,
                                attempts = record.attempts + 1,
                                "Outbound record exceeded max attempts, dropping"
                            );
                            self.store.remove(record.id)?;
                            report.dropped += 1;
                            next_round.push(kind);
                        } else {
                            self.store.mark_attempt(record.id)?;
                            report.retained += 1;
                            // Le genre sort de la passe ; le backoff du
                            // transport espace naturellement la suivante
                        }
                    }
                }
            }

            kinds = next_round;
        }

        Ok(report)
    }

    async fn deliver(&self, record: &OutboundRecord) -> Delivery {
        let method = match record.method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => return Delivery::Dropped(format!("invalid method '{}'", record.method)),
        };

        let body: serde_json::Value = match serde_json::from_str(&record.body) {
            Ok(v) => v,
            Err(e) => return Delivery::Dropped(format!("invalid body: {}", e)),
        };

        match self.http.request(method, &record.path, Some(&body)).await {
            Ok(_) => Delivery::Delivered,
            Err(TransportError::Rejected { status: 409, .. })
                if record.kind.conflict_is_success() =>
            {
                Delivery::Delivered
            }
            Err(TransportError::Rejected { status, body }) => {
                Delivery::Dropped(format!("status {}: {}", status, body))
            }
            Err(_) => Delivery::Retained,
        }
    }
}

enum Delivery {
    Delivered,
    Dropped(String),
    Retained,
}
