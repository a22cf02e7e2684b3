//! PanoSign : agent d'affichage dynamique.
//!
//! Racine de composition : charge la configuration, vérifie l'identité,
//! câble chaque sous-système explicitement puis surveille l'arrêt. Les
//! composants ne se connaissent que par les dépendances reçues ici.

mod power;
mod surface;

use panoapi::ControlPlaneClient;
use panocache::MediaCache;
use panoconfig::Config;
use panoidentity::{IdentityState, IdentityStore};
use panologship::LogShipper;
use panoplayer::{
    ensure_paired, AgentAction, CommandChannel, ControllerDeps, PlaybackController, PlayerState,
    ProofOfPlayRecorder, RenderSurface,
};
use panoprefetch::{PrefetchPlanner, PrefetchSettings};
use panoqueue::{QueueDrainer, QueueStore};
use panoschedule::TimelineScheduler;
use panosnapshot::SnapshotManager;
use panotelemetry::{BufferLayer, HealthDeps, HealthServer, HeartbeatTask, LogBuffer};
use panotransport::{DuplexChannel, DuplexMessage, HttpChannel};
use panoutils::SystemStatsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Codes de sortie interprétés par le service superviseur
const EXIT_CONFIG: i32 = 10;
const EXIT_IDENTITY: i32 = 11;
const EXIT_RUNTIME: i32 = 12;

/// Fenêtre de grâce de l'arrêt : drainage final et arrêt des tâches.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let code = runtime.block_on(run());
    // Laisser les tâches de fond se terminer proprement
    runtime.shutdown_timeout(Duration::from_secs(2));
    std::process::exit(code);
}

async fn run() -> i32 {
    // ========== PHASE 1 : Configuration et journalisation ==========

    let config = match Config::load_config("") {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Fatal: configuration error: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let log_buffer = LogBuffer::new(1000);
    let log_level = config.get_log_level().unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BufferLayer::new(log_buffer.clone()))
        .init();

    info!(version = VERSION, "🖥️  PanoSign agent starting");

    match run_agent(config, log_buffer).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Fatal runtime error");
            EXIT_RUNTIME
        }
    }
}

async fn run_agent(config: Arc<Config>, log_buffer: LogBuffer) -> anyhow::Result<i32> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let cache_dir = config.get_cache_dir()?;
    let secrets_dir = config.get_secrets_dir()?;
    let base_url = config.get_base_url()?;
    let timeout_ms = config.get_request_timeout_ms()?;
    let retry_attempts = config.get_retry_attempts()?;

    let identity = Arc::new(IdentityStore::new(secrets_dir));
    let surface: Arc<dyn RenderSurface> = Arc::new(surface::LoggingSurface);

    // ========== PHASE 2 : Identité et pairing ==========

    let state_seed: watch::Sender<PlayerState> = watch::channel(PlayerState::Boot).0;

    let device_id = match (identity.load(), config.get_device_id()?) {
        (Ok(_), Some(device_id)) => {
            info!(device_id = %device_id, "Identity present");
            device_id
        }
        (identity_result, _) => {
            if identity_result.is_err() {
                info!("No identity material, entering pairing");
            } else {
                warn!("Identity present but no device id, re-pairing");
            }
            let _ = state_seed.send(PlayerState::NeedPairing);

            let plain = HttpChannel::new(&base_url, timeout_ms, retry_attempts)?;
            let pairing_api = ControlPlaneClient::new(plain);

            match ensure_paired(
                &pairing_api,
                &identity,
                &config,
                &surface,
                &state_seed,
                &shutdown,
            )
            .await
            {
                Ok(device_id) => device_id,
                Err(e) => {
                    error!(error = %e, "Pairing failed fatally");
                    return Ok(EXIT_IDENTITY);
                }
            }
        }
    };

    // ========== PHASE 3 : Transport authentifié ==========

    let http = if config.get_mtls_enabled()? {
        let material = match identity.load() {
            Ok(material) => material,
            Err(e) => {
                error!(error = %e, "Identity unusable after pairing");
                return Ok(EXIT_IDENTITY);
            }
        };
        info!(expires_at = %material.expires_at, "Mutual TLS enabled");
        HttpChannel::with_identity(&base_url, timeout_ms, retry_attempts, &material)?
    } else {
        warn!("Mutual TLS disabled by configuration");
        HttpChannel::new(&base_url, timeout_ms, retry_attempts)?
    };
    let api = ControlPlaneClient::new(http.clone());

    // Surveillance de l'expiration du certificat
    spawn_identity_watch(
        identity.clone(),
        config.get_renew_before_days()?,
        shutdown.clone(),
    );

    // ========== PHASE 4 : Sous-systèmes ==========

    info!("📦 Opening media cache and outbound queue");

    let cache = Arc::new(MediaCache::open(
        &cache_dir,
        config.get_cache_max_bytes()?,
        http.client().clone(),
        shutdown.clone(),
    )?);

    let queue = Arc::new(QueueStore::open(
        &cache_dir.join("outbound-queue.db"),
        config.get_queue_max_records()?,
        config.get_queue_max_attempts()?,
    )?);
    let drainer = QueueDrainer::new(queue.clone(), http.clone());

    let snapshots = SnapshotManager::new(
        api.clone(),
        device_id.clone(),
        config.get_allowed_domains()?,
        cache_dir.join("last-snapshot.json"),
    );

    let scheduler = TimelineScheduler::spawn(shutdown.clone());
    let pop = ProofOfPlayRecorder::new(device_id.clone(), queue.clone(), drainer.clone());

    let (power_tx, power_rx) = watch::channel(true);

    let controller = Arc::new(PlaybackController::new(ControllerDeps {
        surface: surface.clone(),
        cache: cache.clone(),
        snapshots: snapshots.clone(),
        scheduler: scheduler.clone(),
        pop: pop.clone(),
        power_rx,
    }));

    let planner = PrefetchPlanner::new(
        cache.clone(),
        snapshots.clone(),
        controller.position_rx(),
        PrefetchSettings {
            horizon: config.get_prefetch_horizon()?,
            concurrency: config.get_prefetch_concurrency()?,
            bandwidth_mbits: config.get_bandwidth_mbits()?,
        },
    );

    let collector = Arc::new(SystemStatsCollector::new());

    let heartbeat = HeartbeatTask::new(
        device_id.clone(),
        queue.clone(),
        drainer.clone(),
        collector.clone(),
        snapshots.clone(),
        controller.position_rx(),
        cache_dir.clone(),
    );

    let shipper = Arc::new(LogShipper::new(
        api.clone(),
        device_id.clone(),
        config.get_logs_dir()?,
        config.get_logship_retention_days()?,
    )?);

    let (actions_tx, actions_rx) = mpsc::unbounded_channel();

    let duplex = DuplexChannel::spawn(config.get_duplex_url()?, shutdown.clone());

    let commands = CommandChannel::new(
        api.clone(),
        device_id.clone(),
        queue.clone(),
        drainer.clone(),
        surface.clone(),
        cache.clone(),
        snapshots.clone(),
        actions_tx,
        Duration::from_secs(config.get_command_rate_limit_secs()?),
        VERSION.to_string(),
    );

    // ========== PHASE 5 : Démarrage des tâches ==========

    info!("🚀 Starting background tasks");

    let drainer_handle = {
        let drainer = drainer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { drainer.run(shutdown).await })
    };

    {
        let snapshots = snapshots.clone();
        let interval = Duration::from_millis(config.get_snapshot_poll_interval_ms()?);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { snapshots.run(interval, shutdown).await });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { planner.run(shutdown).await });
    }

    {
        let pop = pop.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pop.run(shutdown).await });
    }

    {
        let interval = Duration::from_millis(config.get_heartbeat_interval_ms()?);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { heartbeat.run(interval, shutdown).await });
    }

    {
        let commands = commands.clone();
        let interval = Duration::from_millis(config.get_command_poll_interval_ms()?);
        let pushed = duplex.subscribe();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { commands.run(interval, pushed, shutdown).await });
    }

    // Notifications poussées : re-fetch du snapshot, drainage sur
    // retour de connectivité
    {
        let snapshots = snapshots.clone();
        let drainer = drainer.clone();
        let mut pushed = duplex.subscribe();
        let mut connected = duplex.connected();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = pushed.recv() => {
                        match message {
                            Ok(DuplexMessage::ScheduleUpdate) | Ok(DuplexMessage::Emergency) => {
                                snapshots.kick();
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                    changed = connected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *connected.borrow() {
                            info!("Control plane reachable again, draining outbound queue");
                            drainer.kick();
                        }
                    }
                }
            }
        });
    }

    if config.get_logship_enabled()? {
        let shipper = shipper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shipper.run(shutdown).await });
    }

    {
        let deps = HealthDeps {
            version: VERSION.to_string(),
            collector: collector.clone(),
            cache: cache.clone(),
            queue: queue.clone(),
            snapshots: snapshots.clone(),
            scheduler: scheduler.clone(),
            state_rx: controller.state_rx(),
            log_buffer,
            disk_path: cache_dir.clone(),
        };
        let port = config.get_health_port()?;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = HealthServer::serve(port, deps, shutdown).await {
                error!(error = %e, "Health surface failed");
            }
        });
    }

    {
        // Vérification d'empreinte au fil de l'eau, une entrée par heure
        let cache = cache.clone();
        tokio::spawn(async move { cache.run_maintenance(Duration::from_secs(3600)).await });
    }

    {
        let state_rx = controller.state_rx();
        let snapshots = snapshots.clone();
        let interval = Duration::from_millis(config.get_health_interval_ms()?);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            panotelemetry::run_health_watch(state_rx, snapshots, interval, shutdown).await;
        });
    }

    {
        let power_enabled = config.get_power_enabled()?;
        let on_time = config.get_power_on_time()?;
        let off_time = config.get_power_off_time()?;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            power::run_power_schedule(power_enabled, on_time, off_time, power_tx, shutdown).await;
        });
    }

    spawn_action_handler(actions_rx, shipper, shutdown.clone());

    // ========== PHASE 6 : Lecture ==========

    info!(device_id = %device_id, "✅ Agent ready, entering playback");
    controller.run(shutdown.clone()).await;

    // ========== PHASE 7 : Arrêt ==========

    info!("Shutting down, waiting for final outbound drain");
    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, drainer_handle)
        .await
        .is_err()
    {
        warn!("Final drain did not finish within the grace window");
    }

    info!("👋 PanoSign agent stopped");
    Ok(0)
}

/// SIGINT/SIGTERM déclenchent l'arrêt coopératif.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Ctrl+C received");
        }

        shutdown.cancel();
    });
}

/// Surveille quotidiennement la validité du certificat client.
///
/// Un certificat expiré force l'arrêt avec le code identité : le
/// superviseur redémarre l'agent, qui repassera par le pairing.
fn spawn_identity_watch(
    identity: Arc<IdentityStore>,
    renew_before_days: u64,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            match identity.state(renew_before_days) {
                IdentityState::Installed => {}
                IdentityState::Expiring => {
                    warn!(
                        renew_before_days,
                        "Client certificate enters its renewal window"
                    );
                }
                _ => {
                    error!("Identity material lost or expired, requesting restart");
                    shutdown.cancel();
                    std::process::exit(EXIT_IDENTITY);
                }
            }
        }
    });
}

/// Traite les actions demandées par les commandes distantes.
fn spawn_action_handler(
    mut actions_rx: mpsc::UnboundedReceiver<AgentAction>,
    shipper: Arc<LogShipper>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        while let Some(action) = actions_rx.recv().await {
            match action {
                AgentAction::Reboot => {
                    info!("Reboot command accepted, shutting down for supervisor restart");
                    // Laisser le temps à l'acquittement d'être drainé
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    shutdown.cancel();
                }
                AgentAction::UploadLogs => {
                    let shipper = shipper.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shipper.ship_now().await {
                            warn!(error = %e, "On-demand log shipping failed");
                        }
                    });
                }
            }
        }
    });
}
