//! Boucle de l'échéancier.

use panosnapshot::PlaylistItem;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Seuil d'avertissement pour un jitter unitaire, en millisecondes.
pub const JITTER_WARN_MS: u64 = 100;

/// Taille de la fenêtre glissante de jitter.
const JITTER_WINDOW: usize = 32;

/// Créneau concret calculé par l'échéancier. Transitoire, jamais persisté.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub item: PlaylistItem,
    /// Index de l'item dans la boucle
    pub index: usize,
    /// Numéro de boucle depuis le dernier `start`
    pub loop_count: u64,
    pub planned_start: Instant,
    pub planned_end: Instant,
}

/// Évènements émis par l'échéancier.
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    ItemStart(ScheduledEvent),
    ItemEnd(ScheduledEvent),
    /// La fenêtre de transition vers l'item suivant commence
    TransitionStart {
        current: ScheduledEvent,
        next: PlaylistItem,
    },
    /// La liste a été jouée en entier, retour à l'index 0
    LoopComplete { loop_count: u64 },
    /// L'échéancier s'est arrêté (stop explicite ou arrêt de l'agent)
    Stopped,
}

/// Statistiques de jitter.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub samples: usize,
    pub max_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug)]
enum Command {
    Start(Vec<PlaylistItem>),
    Stop,
    Pause,
    Resume,
    SkipNext,
}

#[derive(Debug, Default)]
struct JitterWindow {
    samples: VecDeque<f64>,
}

impl JitterWindow {
    fn record(&mut self, jitter_ms: f64) {
        if self.samples.len() == JITTER_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(jitter_ms);
    }

    fn stats(&self) -> SchedulerStats {
        if self.samples.is_empty() {
            return SchedulerStats::default();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let max_ms = *sorted.last().unwrap();
        let p95_index = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let p95_ms = sorted[p95_index.saturating_sub(1).min(sorted.len() - 1)];
        SchedulerStats {
            samples: sorted.len(),
            max_ms,
            p95_ms,
        }
    }
}

/// Échéancier de présentation.
///
/// Les opérations sont des envois non bloquants vers la tâche interne ;
/// les évènements sortent sur un canal broadcast. Les clones partagent
/// la même tâche et la même fenêtre de jitter.
#[derive(Clone)]
pub struct TimelineScheduler {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TimelineEvent>,
    jitter: Arc<Mutex<JitterWindow>>,
}

impl TimelineScheduler {
    /// Démarre la tâche de l'échéancier.
    pub fn spawn(shutdown: CancellationToken) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let jitter = Arc::new(Mutex::new(JitterWindow::default()));

        let task_events = events.clone();
        let task_jitter = jitter.clone();
        tokio::spawn(async move {
            run_scheduler(commands_rx, task_events, task_jitter, shutdown).await;
        });

        Self {
            commands,
            events,
            jitter,
        }
    }

    /// Lance (ou relance) la lecture d'une liste d'items.
    pub fn start(&self, items: Vec<PlaylistItem>) {
        let _ = self.commands.send(Command::Start(items));
    }

    /// Arrête la lecture ; un évènement `Stopped` est émis.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Gèle la durée restante de l'item courant. Idempotent.
    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    /// Replanifie depuis l'instant courant. Idempotent.
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Termine l'item courant immédiatement.
    pub fn skip_next(&self) {
        let _ = self.commands.send(Command::SkipNext);
    }

    /// S'abonne aux évènements de présentation.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    /// Statistiques de jitter sur la fenêtre glissante.
    pub fn stats(&self) -> SchedulerStats {
        self.jitter.lock().unwrap().stats()
    }
}

/// Issue d'une attente de phase.
enum WaitOutcome {
    /// L'échéance est atteinte
    Reached,
    /// La lecture doit s'arrêter (stop ou arrêt agent)
    Stop,
    /// Une nouvelle liste remplace la courante
    Restart(Vec<PlaylistItem>),
}

async fn run_scheduler(
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TimelineEvent>,
    jitter: Arc<Mutex<JitterWindow>>,
    shutdown: CancellationToken,
) {
    'idle: loop {
        // État repos : attendre une liste à jouer
        let mut items = loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => return,
                command = commands.recv() => command,
            };
            match command {
                Some(Command::Start(items)) if !items.is_empty() => break items,
                Some(Command::Start(_)) => debug!("Ignoring start with empty playlist"),
                Some(Command::Stop) => {
                    // Déjà arrêté : stop idempotent, pas de double évènement
                }
                Some(_) => {}
                None => return,
            }
        };

        info!(items = items.len(), "Timeline started");
        let mut index = 0usize;
        let mut loop_count = 0u64;
        let mut planned_start = Instant::now();

        'playback: loop {
            let item = items[index].clone();
            let mut start_at = planned_start;
            let mut end_at = start_at + item.duration;
            // La transition démarre avant la fin ; bornée au début de
            // l'item pour une durée égale à la transition
            let transition = item.transition.min(item.duration);
            let mut transition_at = end_at - transition;

            // Phase 1 : attendre le début planifié
            match wait_phase(
                &mut start_at,
                &mut [&mut transition_at, &mut end_at],
                &mut commands,
                &shutdown,
            )
            .await
            {
                WaitOutcome::Reached => {}
                WaitOutcome::Stop => {
                    let _ = events.send(TimelineEvent::Stopped);
                    continue 'idle;
                }
                WaitOutcome::Restart(new_items) => {
                    items = new_items;
                    index = 0;
                    loop_count = 0;
                    planned_start = Instant::now();
                    continue 'playback;
                }
            }

            let observed = Instant::now();
            let jitter_ms = observed.duration_since(start_at).as_secs_f64() * 1000.0;
            if jitter_ms > JITTER_WARN_MS as f64 {
                warn!(
                    item_id = %item.item_id,
                    jitter_ms = jitter_ms as u64,
                    "Presentation start drifted beyond threshold"
                );
            }
            jitter.lock().unwrap().record(jitter_ms);

            let event = ScheduledEvent {
                item: item.clone(),
                index,
                loop_count,
                planned_start: start_at,
                planned_end: end_at,
            };
            let _ = events.send(TimelineEvent::ItemStart(event.clone()));

            // Phase 2 : fenêtre de transition
            match wait_phase(
                &mut transition_at,
                &mut [&mut end_at],
                &mut commands,
                &shutdown,
            )
            .await
            {
                WaitOutcome::Reached => {
                    let next_index = (index + 1) % items.len();
                    let _ = events.send(TimelineEvent::TransitionStart {
                        current: event.clone(),
                        next: items[next_index].clone(),
                    });
                }
                WaitOutcome::Stop => {
                    let _ = events.send(TimelineEvent::ItemEnd(event));
                    let _ = events.send(TimelineEvent::Stopped);
                    continue 'idle;
                }
                WaitOutcome::Restart(new_items) => {
                    let _ = events.send(TimelineEvent::ItemEnd(event));
                    items = new_items;
                    index = 0;
                    loop_count = 0;
                    planned_start = Instant::now();
                    continue 'playback;
                }
            }

            // Phase 3 : fin de l'item
            match wait_phase(&mut end_at, &mut [], &mut commands, &shutdown).await {
                WaitOutcome::Reached => {}
                WaitOutcome::Stop => {
                    let _ = events.send(TimelineEvent::ItemEnd(event));
                    let _ = events.send(TimelineEvent::Stopped);
                    continue 'idle;
                }
                WaitOutcome::Restart(new_items) => {
                    let _ = events.send(TimelineEvent::ItemEnd(event));
                    items = new_items;
                    index = 0;
                    loop_count = 0;
                    planned_start = Instant::now();
                    continue 'playback;
                }
            }

            let _ = events.send(TimelineEvent::ItemEnd(event));

            // Planification sans dérive : le début suivant est la fin
            // planifiée courante
            planned_start = end_at;
            index += 1;
            if index == items.len() {
                index = 0;
                loop_count += 1;
                let _ = events.send(TimelineEvent::LoopComplete { loop_count });
            }
        }
    }
}

/// Attend `deadline` en traitant les commandes reçues entre-temps.
///
/// - `Pause` gèle toutes les échéances restantes (celle-ci comprise) et
///   attend `Resume` ; la durée de pause décale les échéances d'autant
/// - `SkipNext` ramène toutes les échéances à maintenant
/// - `Pause`/`Resume` redondants sont ignorés
async fn wait_phase(
    deadline: &mut Instant,
    later_deadlines: &mut [&mut Instant],
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &CancellationToken,
) -> WaitOutcome {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => return WaitOutcome::Stop,
            _ = sleep_until(*deadline) => return WaitOutcome::Reached,
            command = commands.recv() => command,
        };

        match command {
            None => return WaitOutcome::Stop,
            Some(Command::Stop) => return WaitOutcome::Stop,
            Some(Command::Start(items)) if !items.is_empty() => {
                return WaitOutcome::Restart(items)
            }
            Some(Command::Start(_)) => debug!("Ignoring start with empty playlist"),
            Some(Command::SkipNext) => {
                let now = Instant::now();
                *deadline = now;
                for later in later_deadlines.iter_mut() {
                    **later = now;
                }
            }
            Some(Command::Resume) => {
                // Pas en pause : idempotent
            }
            Some(Command::Pause) => {
                let paused_at = Instant::now();
                debug!("Timeline paused");

                // Attendre la reprise
                loop {
                    let command = tokio::select! {
                        _ = shutdown.cancelled() => return WaitOutcome::Stop,
                        command = commands.recv() => command,
                    };
                    match command {
                        None => return WaitOutcome::Stop,
                        Some(Command::Stop) => return WaitOutcome::Stop,
                        Some(Command::Start(items)) if !items.is_empty() => {
                            return WaitOutcome::Restart(items)
                        }
                        Some(Command::Resume) => break,
                        Some(Command::Pause) => {
                            // Déjà en pause : idempotent
                        }
                        Some(_) => {}
                    }
                }

                // Replanifier depuis maintenant : tout est décalé de la
                // durée de la pause
                let paused_for = Instant::now().duration_since(paused_at);
                *deadline += paused_for;
                for later in later_deadlines.iter_mut() {
                    **later += paused_for;
                }
                debug!(paused_ms = paused_for.as_millis() as u64, "Timeline resumed");
            }
        }
    }
}
