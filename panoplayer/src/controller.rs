//! Contrôleur de lecture : arbitrage et machine à états.

use crate::pop::ProofOfPlayRecorder;
use crate::state::PlayerState;
use crate::surface::{PresentRequest, RenderSurface};
use crate::Result;
use panocache::MediaCache;
use panoprefetch::PlaybackPosition;
use panoschedule::{ScheduledEvent, TimelineEvent, TimelineScheduler};
use panosnapshot::{Snapshot, SnapshotEvent, SnapshotManager};
use panotransport::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Échecs de rendu consécutifs avant la diapositive d'erreur terminale.
const RENDER_FAILURE_THRESHOLD: u32 = 3;

/// Dépendances du contrôleur, câblées par la racine de composition.
pub struct ControllerDeps {
    pub surface: Arc<dyn RenderSurface>,
    pub cache: Arc<MediaCache>,
    pub snapshots: Arc<SnapshotManager>,
    pub scheduler: TimelineScheduler,
    pub pop: Arc<ProofOfPlayRecorder>,
    /// Fenêtre d'allumage du power schedule ; `true` = écran actif
    pub power_rx: watch::Receiver<bool>,
}

/// Contrôleur de lecture.
///
/// Seul abonné de l'échéancier et du gestionnaire de snapshot ; publie
/// l'état de l'agent et la position de lecture pour la télémétrie et le
/// préchargement.
pub struct PlaybackController {
    deps: ControllerDeps,
    state_tx: watch::Sender<PlayerState>,
    position_tx: watch::Sender<PlaybackPosition>,
    render_failures: AtomicU32,
}

impl PlaybackController {
    pub fn new(deps: ControllerDeps) -> Self {
        let (state_tx, _) = watch::channel(PlayerState::Boot);
        let (position_tx, _) = watch::channel(PlaybackPosition::default());
        Self {
            deps,
            state_tx,
            position_tx,
            render_failures: AtomicU32::new(0),
        }
    }

    /// Observateur de l'état de l'agent.
    pub fn state_rx(&self) -> watch::Receiver<PlayerState> {
        self.state_tx.subscribe()
    }

    /// Émetteur d'état, utilisé par le déroulé de pairing au démarrage.
    pub fn state_tx(&self) -> watch::Sender<PlayerState> {
        self.state_tx.clone()
    }

    /// Observateur de la position de lecture (pour le préchargement).
    pub fn position_rx(&self) -> watch::Receiver<PlaybackPosition> {
        self.position_tx.subscribe()
    }

    fn set_state(&self, state: PlayerState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            info!(state = %state, "Player state changed");
            let _ = self.state_tx.send(state);
        }
    }

    /// Boucle principale : sessions de lecture avec ré-entrée bornée
    /// dans `boot` sur erreur fatale.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300));

        loop {
            match self.session(&shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    error!(error = %e, "Player session failed, scheduling re-initialisation");
                    self.set_state(PlayerState::Error);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.set_state(PlayerState::Boot);
                }
            }
        }
    }

    /// Une session de lecture : attendre un snapshot puis arbitrer
    /// jusqu'à l'arrêt.
    async fn session(&self, shutdown: &CancellationToken) -> Result<()> {
        self.set_state(PlayerState::CertIssued);

        let mut snapshot_events = self.deps.snapshots.subscribe();
        let mut timeline_events = self.deps.scheduler.subscribe();
        let mut power_rx = self.deps.power_rx.clone();

        // Un refresh immédiat ; le last-known-good suffit s'il existe
        self.deps.snapshots.kick();

        let mut snapshot = match self.deps.snapshots.current() {
            Some(snapshot) => snapshot,
            None => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    event = snapshot_events.recv() => {
                        match event {
                            Ok(SnapshotEvent::Changed(snapshot)) => break snapshot,
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                if let Some(snapshot) = self.deps.snapshots.current() {
                                    break snapshot;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            },
        };

        self.apply_snapshot(&snapshot).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.deps.scheduler.stop();
                    self.deps.pop.flush();
                    return Ok(());
                }

                event = snapshot_events.recv() => {
                    match event {
                        Ok(SnapshotEvent::Changed(new_snapshot)) => {
                            snapshot = new_snapshot;
                            self.apply_snapshot(&snapshot).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            if let Some(current) = self.deps.snapshots.current() {
                                snapshot = current;
                                self.apply_snapshot(&snapshot).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                event = timeline_events.recv() => {
                    match event {
                        Ok(event) => self.on_timeline_event(event, &snapshot).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Timeline event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                changed = power_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let on = *power_rx.borrow();
                    if on {
                        info!("Power window open, resuming playback");
                        self.deps.scheduler.resume();
                    } else {
                        info!("Power window closed, blanking display");
                        self.deps.scheduler.pause();
                        if let Err(e) = self.deps.surface.blank().await {
                            warn!(error = %e, "Failed to blank display");
                        }
                    }
                }
            }
        }
    }

    /// Applique un snapshot : choisit le mode et relance l'échéancier.
    ///
    /// L'urgence préempte tout ; à sa levée, la grille normale reprend
    /// depuis l'index 0, jamais au milieu d'un item.
    async fn apply_snapshot(&self, snapshot: &Snapshot) {
        // Les débuts en cours ne produiront pas d'évènements
        self.deps.pop.abandon_open_starts();

        if let Some(emergency) = &snapshot.emergency {
            info!(item_id = %emergency.item_id, "Emergency item active, pre-empting schedule");
            self.deps.scheduler.start(vec![emergency.clone()]);
            self.set_state(PlayerState::Emergency);
            return;
        }

        if snapshot.items.is_empty() {
            match &snapshot.default_item {
                Some(default_item) => {
                    info!("Schedule empty, presenting default item");
                    self.deps.scheduler.start(vec![default_item.clone()]);
                }
                None => {
                    info!("Schedule empty and no default item, blanking");
                    self.deps.scheduler.stop();
                    if let Err(e) = self.deps.surface.blank().await {
                        warn!(error = %e, "Failed to blank display");
                    }
                }
            }
            self.set_state(PlayerState::Empty);
            return;
        }

        self.deps.scheduler.start(snapshot.items.clone());
        self.refresh_online_state();
    }

    /// Ajuste `playback-running` / `offline-fallback` selon la santé du
    /// dernier refresh.
    fn refresh_online_state(&self) {
        let state = *self.state_tx.borrow();
        if !matches!(
            state,
            PlayerState::CertIssued | PlayerState::PlaybackRunning | PlayerState::OfflineFallback
        ) {
            return;
        }
        if self.deps.snapshots.is_degraded() {
            self.set_state(PlayerState::OfflineFallback);
        } else {
            self.set_state(PlayerState::PlaybackRunning);
        }
    }

    async fn on_timeline_event(&self, event: TimelineEvent, snapshot: &Snapshot) {
        match event {
            TimelineEvent::ItemStart(event) => {
                let _ = self.position_tx.send(PlaybackPosition {
                    index: event.index,
                    media_id: event.item.media_id.clone(),
                });

                if let Some(media_id) = &event.item.media_id {
                    self.deps.pop.record_start(&snapshot.schedule_id, media_id);
                }

                // En mode normal, re-évaluer la dégradation réseau
                if matches!(
                    *self.state_tx.borrow(),
                    PlayerState::PlaybackRunning | PlayerState::OfflineFallback
                ) {
                    self.refresh_online_state();
                }

                self.present(&event).await;
            }

            TimelineEvent::ItemEnd(event) => {
                if let Some(media_id) = &event.item.media_id {
                    self.deps.pop.record_end(&snapshot.schedule_id, media_id, true);
                }
            }

            TimelineEvent::TransitionStart { current, next } => {
                // La transition visuelle appartient à la surface ; la
                // durée reste modélisée ici pour le jitter et la
                // préemption
                debug!(
                    current = %current.item.item_id,
                    next = %next.item_id,
                    "Transition window opened"
                );
            }

            TimelineEvent::LoopComplete { loop_count } => {
                debug!(loop_count, "Playlist loop complete");
            }

            TimelineEvent::Stopped => {
                debug!("Timeline stopped");
            }
        }
    }

    /// Présente un item, avec retentatives bornées puis diapositive
    /// d'erreur terminale sans arrêter l'agent.
    async fn present(&self, event: &ScheduledEvent) {
        let media_path = event
            .item
            .media_id
            .as_deref()
            .and_then(|media_id| self.deps.cache.get(media_id));

        if event.item.media_id.is_some() && media_path.is_none() {
            warn!(
                item_id = %event.item.item_id,
                "Media not yet cached, surface will hold the previous frame"
            );
        }

        let request = PresentRequest {
            item: event.item.clone(),
            media_path,
            transition: event.item.transition,
        };

        match self.deps.surface.present(request.clone()).await {
            Ok(()) => {
                self.render_failures.store(0, Ordering::Relaxed);
            }
            Err(first_error) => {
                warn!(error = %first_error, "Render surface failed, retrying once");
                tokio::time::sleep(Duration::from_millis(250)).await;

                if let Err(e) = self.deps.surface.present(request).await {
                    let failures = self.render_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(error = %e, failures, "Render surface failed again");

                    if failures >= RENDER_FAILURE_THRESHOLD {
                        warn!("Render failure threshold reached, showing terminal fallback slide");
                        if let Err(e) = self
                            .deps
                            .surface
                            .show_error_slide("Display temporarily unavailable")
                            .await
                        {
                            error!(error = %e, "Even the fallback slide failed");
                        }
                    }
                } else {
                    self.render_failures.store(0, Ordering::Relaxed);
                }
            }
        }
    }
}
