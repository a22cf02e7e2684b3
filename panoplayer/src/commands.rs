//! Canal de commandes distantes.
//!
//! Les commandes arrivent par polling et par le canal duplex. Chaque
//! genre est limité en cadence (une exécution par fenêtre configurée,
//! 60 s par défaut) ; une commande limitée est acquittée avec le
//! résultat explicite `rate-limited`. Les acquittements passent par la
//! file sortante durable et survivent donc à un redémarrage.
//!
//! Idempotence : un command id déjà acquitté n'est jamais ré-exécuté ;
//! le résultat antérieur est renvoyé tel quel.

use crate::surface::RenderSurface;
use chrono::Utc;
use panoapi::{CommandAck, CommandEnvelope, ControlPlaneClient};
use panocache::MediaCache;
use panoqueue::{QueueDrainer, QueueStore, RecordKind};
use panosnapshot::SnapshotManager;
use panotransport::DuplexMessage;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Nombre maximal d'acquittements retenus pour l'idempotence.
const ACKED_CAPACITY: usize = 1024;

/// Action demandée à la racine de composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    /// Redémarrage ordonné de l'agent
    Reboot,
    /// Expédition immédiate des journaux
    UploadLogs,
}

struct RateState {
    last_exec: HashMap<String, Instant>,
    acked: HashMap<String, CommandAck>,
    acked_order: VecDeque<String>,
}

/// Canal de commandes.
pub struct CommandChannel {
    api: ControlPlaneClient,
    device_id: String,
    queue: Arc<QueueStore>,
    drainer: Arc<QueueDrainer>,
    surface: Arc<dyn RenderSurface>,
    cache: Arc<MediaCache>,
    snapshots: Arc<SnapshotManager>,
    actions_tx: mpsc::UnboundedSender<AgentAction>,
    rate_window: Duration,
    version: String,
    started_at: Instant,
    state: Mutex<RateState>,
}

impl CommandChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: ControlPlaneClient,
        device_id: String,
        queue: Arc<QueueStore>,
        drainer: Arc<QueueDrainer>,
        surface: Arc<dyn RenderSurface>,
        cache: Arc<MediaCache>,
        snapshots: Arc<SnapshotManager>,
        actions_tx: mpsc::UnboundedSender<AgentAction>,
        rate_window: Duration,
        version: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            device_id,
            queue,
            drainer,
            surface,
            cache,
            snapshots,
            actions_tx,
            rate_window,
            version,
            started_at: Instant::now(),
            state: Mutex::new(RateState {
                last_exec: HashMap::new(),
                acked: HashMap::new(),
                acked_order: VecDeque::new(),
            }),
        })
    }

    /// Boucle de fond : polling périodique plus commandes poussées.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: Duration,
        mut pushed: broadcast::Receiver<DuplexMessage>,
        shutdown: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = tick.tick() => {
                    match self.api.fetch_commands(&self.device_id).await {
                        Ok(commands) => {
                            for command in commands {
                                self.handle(command).await;
                            }
                        }
                        Err(e) if e.is_offline() => {}
                        Err(e) => warn!(error = %e, "Command poll failed"),
                    }
                }

                message = pushed.recv() => {
                    match message {
                        Ok(DuplexMessage::Command { command }) => {
                            match serde_json::from_value::<CommandEnvelope>(command) {
                                Ok(envelope) => self.handle(envelope).await,
                                Err(e) => warn!(error = %e, "Unparseable pushed command"),
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Pushed command stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Traite une commande, avec idempotence et limite de cadence.
    pub async fn handle(&self, envelope: CommandEnvelope) {
        // Redélivraison d'une commande déjà acquittée : renvoyer le
        // résultat antérieur sans ré-exécuter
        let prior = {
            let state = self.state.lock().unwrap();
            state.acked.get(&envelope.command_id).cloned()
        };
        if let Some(prior) = prior {
            info!(command_id = %envelope.command_id, "Command redelivered, re-sending prior ack");
            self.enqueue_ack(&prior);
            return;
        }

        let ack = self.execute(&envelope).await;

        {
            let mut state = self.state.lock().unwrap();
            if state.acked_order.len() == ACKED_CAPACITY {
                if let Some(oldest) = state.acked_order.pop_front() {
                    state.acked.remove(&oldest);
                }
            }
            state
                .acked
                .insert(envelope.command_id.clone(), ack.clone());
            state.acked_order.push_back(envelope.command_id.clone());
        }

        self.enqueue_ack(&ack);
    }

    async fn execute(&self, envelope: &CommandEnvelope) -> CommandAck {
        // Commande périmée : acquittée avec raison, jamais exécutée
        if let Some(expires_at) = envelope.expires_at {
            if Utc::now() > expires_at {
                return CommandAck {
                    command_id: envelope.command_id.clone(),
                    status: "expired".to_string(),
                    result: serde_json::json!({ "reason": "command expired before execution" }),
                };
            }
        }

        // Limite de cadence par genre
        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.last_exec.get(&envelope.kind) {
                if last.elapsed() < self.rate_window {
                    return CommandAck {
                        command_id: envelope.command_id.clone(),
                        status: "rate-limited".to_string(),
                        result: serde_json::json!({
                            "retry_after_secs": (self.rate_window - last.elapsed()).as_secs(),
                        }),
                    };
                }
            }
            state
                .last_exec
                .insert(envelope.kind.clone(), Instant::now());
        }

        info!(command_id = %envelope.command_id, kind = %envelope.kind, "Executing command");

        let result = match envelope.kind.as_str() {
            "reboot" => {
                let _ = self.actions_tx.send(AgentAction::Reboot);
                Ok(serde_json::json!({ "scheduled": true }))
            }
            "refresh" => {
                self.snapshots.kick();
                Ok(serde_json::json!({ "refreshed": true }))
            }
            "screenshot" => self.take_screenshot().await,
            "test-pattern" => self
                .surface
                .show_test_pattern()
                .await
                .map(|_| serde_json::json!({ "displayed": true }))
                .map_err(|e| format!("surface error: {}", e)),
            "clear-cache" => self
                .cache
                .clear(true)
                .map(|_| serde_json::json!({ "cleared": true }))
                .map_err(|e| e.to_string()),
            "upload-logs" => {
                let _ = self.actions_tx.send(AgentAction::UploadLogs);
                Ok(serde_json::json!({ "scheduled": true }))
            }
            "ping" => Ok(serde_json::json!({
                "uptime_secs": self.started_at.elapsed().as_secs(),
                "version": self.version,
            })),
            other => Err(format!("unknown command kind '{}'", other)),
        };

        match result {
            Ok(result) => CommandAck {
                command_id: envelope.command_id.clone(),
                status: "ok".to_string(),
                result,
            },
            Err(reason) => CommandAck {
                command_id: envelope.command_id.clone(),
                status: "error".to_string(),
                result: serde_json::json!({ "reason": reason }),
            },
        }
    }

    async fn take_screenshot(&self) -> std::result::Result<serde_json::Value, String> {
        let frame = self.surface.capture_frame().await?;

        let presigned = self
            .api
            .screenshot_presigned_url(&self.device_id)
            .await
            .map_err(|e| e.to_string())?;

        self.api
            .upload_to_presigned(&presigned.url, frame, "image/png")
            .await
            .map_err(|e| e.to_string())?;

        Ok(serde_json::json!({ "uploaded": true }))
    }

    /// Enfile l'acquittement dans la file sortante durable.
    fn enqueue_ack(&self, ack: &CommandAck) {
        let path = ControlPlaneClient::command_ack_path(&self.device_id, &ack.command_id);
        let body = match serde_json::to_string(ack) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize command ack");
                return;
            }
        };

        if let Err(e) = self
            .queue
            .enqueue(RecordKind::CommandAck, "POST", &path, &body)
        {
            warn!(error = %e, "Failed to enqueue command ack");
            return;
        }
        self.drainer.kick();
    }
}
