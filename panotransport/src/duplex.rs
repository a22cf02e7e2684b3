//! Canal duplex persistant vers le plan de contrôle.
//!
//! Un websocket unique porte les notifications poussées
//! (`schedule_update`, `emergency`, `command`) et la vivacité
//! (`ping`/`pong`). La tâche de fond gère la reconnexion sous backoff ;
//! les messages sortants émis pendant une coupure sont rejoués dans
//! l'ordre à la reconnexion (au mieux : la durabilité réelle passe par
//! `panoqueue`).

use crate::Backoff;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Délai maximal du handshake websocket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence des pings de vivacité.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Délai de réponse au ping avant reconnexion forcée.
const PONG_DEADLINE: Duration = Duration::from_secs(10);

/// Message typé du canal duplex.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DuplexMessage {
    /// Le snapshot a changé côté serveur, l'agent doit re-fetcher
    ScheduleUpdate,
    /// Bascule d'urgence (le contenu arrive via le snapshot)
    Emergency,
    /// Commande poussée, même enveloppe JSON que le polling
    Command { command: serde_json::Value },
    Ping,
    Pong,
}

/// Poignée du canal duplex.
///
/// La tâche de fond vit tant que le token d'arrêt n'est pas annulé.
pub struct DuplexChannel {
    inbound_tx: broadcast::Sender<DuplexMessage>,
    outbound_tx: mpsc::UnboundedSender<DuplexMessage>,
    connected_rx: watch::Receiver<bool>,
}

impl DuplexChannel {
    /// Démarre le canal vers `url`.
    pub fn spawn(url: String, shutdown: CancellationToken) -> Self {
        let (inbound_tx, _) = broadcast::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);

        let task_inbound = inbound_tx.clone();
        tokio::spawn(async move {
            run_channel(url, task_inbound, outbound_rx, connected_tx, shutdown).await;
        });

        Self {
            inbound_tx,
            outbound_tx,
            connected_rx,
        }
    }

    /// S'abonne aux messages entrants (hors ping/pong).
    pub fn subscribe(&self) -> broadcast::Receiver<DuplexMessage> {
        self.inbound_tx.subscribe()
    }

    /// Enfile un message sortant.
    ///
    /// Le message part immédiatement si le canal est ouvert, sinon à la
    /// prochaine reconnexion, dans l'ordre d'émission.
    pub fn send(&self, message: DuplexMessage) {
        let _ = self.outbound_tx.send(message);
    }

    /// Observateur de l'état de connexion.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }
}

async fn run_channel(
    url: String,
    inbound_tx: broadcast::Sender<DuplexMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<DuplexMessage>,
    connected_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::transport();
    // Messages repris d'une session précédente, à rejouer en premier
    let mut pending: VecDeque<DuplexMessage> = VecDeque::new();

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let connect = timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()));
        let ws = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = connect => result,
        };

        let (mut ws, _) = match ws {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "Duplex connect failed");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            Err(_) => {
                debug!(url = %url, "Duplex handshake timed out");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        info!(url = %url, "Duplex channel connected");
        backoff.reset();
        let _ = connected_tx.send(true);

        // Rejouer ce qui attendait pendant la coupure
        let mut replay_failed = false;
        while let Some(msg) = pending.front() {
            if send_message(&mut ws, msg).await.is_err() {
                replay_failed = true;
                break;
            }
            pending.pop_front();
        }

        if !replay_failed {
            session_loop(
                &mut ws,
                &inbound_tx,
                &mut outbound_rx,
                &mut pending,
                &shutdown,
            )
            .await;
        }

        let _ = connected_tx.send(false);
        let _ = ws.close(None).await;

        if shutdown.is_cancelled() {
            return;
        }
        warn!(url = %url, "Duplex channel lost, reconnecting");
        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Boucle d'une session connectée. Retourne quand le lien doit être
/// refait (erreur, pong manquant) ou que l'arrêt est demandé.
async fn session_loop<S>(
    ws: &mut S,
    inbound_tx: &broadcast::Sender<DuplexMessage>,
    outbound_rx: &mut mpsc::UnboundedReceiver<DuplexMessage>,
    pending: &mut VecDeque<DuplexMessage>,
    shutdown: &CancellationToken,
) where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Sink<Message>
        + Unpin,
{
    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_timer.reset();

    // Instant limite de réception du pong en attente, None si aucun
    let mut pong_due: Option<Instant> = None;

    loop {
        let pong_check = async {
            match pong_due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,

            _ = ping_timer.tick() => {
                if send_message(ws, &DuplexMessage::Ping).await.is_err() {
                    return;
                }
                if pong_due.is_none() {
                    pong_due = Some(Instant::now() + PONG_DEADLINE);
                }
            }

            _ = pong_check => {
                warn!("Duplex keepalive pong missing, forcing reconnect");
                return;
            }

            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { return };
                if send_message(ws, &message).await.is_err() {
                    // Conservé pour rejeu à la reconnexion
                    pending.push_back(message);
                    return;
                }
            }

            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DuplexMessage>(&text) {
                            Ok(DuplexMessage::Ping) => {
                                if send_message(ws, &DuplexMessage::Pong).await.is_err() {
                                    return;
                                }
                            }
                            Ok(DuplexMessage::Pong) => {
                                pong_due = None;
                            }
                            Ok(message) => {
                                let _ = inbound_tx.send(message);
                            }
                            Err(e) => {
                                debug!(error = %e, "Unparseable duplex message ignored");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Duplex read error");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_message<S>(ws: &mut S, message: &DuplexMessage) -> std::result::Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|_| ())?;
    ws.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_string(&DuplexMessage::ScheduleUpdate).unwrap();
        assert_eq!(json, r#"{"type":"schedule_update"}"#);

        let parsed: DuplexMessage =
            serde_json::from_str(r#"{"type":"command","command":{"id":"c1"}}"#).unwrap();
        match parsed {
            DuplexMessage::Command { command } => assert_eq!(command["id"], "c1"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let json = serde_json::to_string(&DuplexMessage::Ping).unwrap();
        let parsed: DuplexMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, DuplexMessage::Ping);
    }
}
