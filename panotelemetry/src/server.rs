//! Serveur HTTP local de santé et de métriques.
//!
//! Lié exclusivement à l'interface de loopback : aucun octet de cette
//! surface ne sort de la machine, il n'y a donc pas d'authentification.

use crate::logbuffer::LogBuffer;
use crate::metrics::{render_metrics, Metric};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use panocache::MediaCache;
use panoplayer::PlayerState;
use panoqueue::QueueStore;
use panoschedule::TimelineScheduler;
use panosnapshot::SnapshotManager;
use panoutils::SystemStatsCollector;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Dépendances de la surface de santé.
#[derive(Clone)]
pub struct HealthDeps {
    pub version: String,
    pub collector: Arc<SystemStatsCollector>,
    pub cache: Arc<MediaCache>,
    pub queue: Arc<QueueStore>,
    pub snapshots: Arc<SnapshotManager>,
    pub scheduler: TimelineScheduler,
    pub state_rx: watch::Receiver<PlayerState>,
    pub log_buffer: LogBuffer,
    /// Chemin mesuré pour l'usage disque
    pub disk_path: PathBuf,
}

/// Serveur de la surface locale.
pub struct HealthServer;

impl HealthServer {
    /// Démarre le serveur sur `127.0.0.1:port`.
    pub async fn serve(
        port: u16,
        deps: HealthDeps,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Self::serve_listener(listener, deps, shutdown).await
    }

    /// Variante sur un listener déjà lié (tests, port éphémère).
    pub async fn serve_listener(
        listener: tokio::net::TcpListener,
        deps: HealthDeps,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics))
            .route("/logs", get(logs_dump))
            .with_state(deps);

        info!(addr = %listener.local_addr()?, "Health surface listening on loopback");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

async fn healthz(State(deps): State<HealthDeps>) -> impl IntoResponse {
    let state = *deps.state_rx.borrow();
    let status = crate::watcher::evaluate(state, deps.snapshots.is_degraded());

    let code = if status == crate::watcher::HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let status = status.as_str();

    let cache_stats = deps.cache.stats().ok();
    let queue_pending = deps.queue.size().unwrap_or(0);
    let system = deps.collector.collect(&deps.disk_path);

    let body = serde_json::json!({
        "status": status,
        "state": state.as_str(),
        "version": deps.version,
        "uptime_secs": deps.collector.process_uptime_secs(),
        "last_sync": deps.snapshots.last_sync(),
        "cache": cache_stats,
        "queue_pending": queue_pending,
        "recent_errors": deps.log_buffer.recent_errors(10),
        "system": system,
    });

    (code, Json(body))
}

/// Copie JSON du tampon de logs récents, pour le diagnostic local.
async fn logs_dump(State(deps): State<HealthDeps>) -> impl IntoResponse {
    Json(deps.log_buffer.dump())
}

async fn metrics(State(deps): State<HealthDeps>) -> impl IntoResponse {
    let mut out: Vec<Metric> = Vec::new();

    out.push(Metric::gauge(
        "agent",
        "uptime_seconds",
        "Agent process uptime in seconds",
        deps.collector.process_uptime_secs() as f64,
    ));
    out.push(Metric::gauge(
        "agent",
        "presenting",
        "1 when the agent is presenting content",
        if deps.state_rx.borrow().is_presenting() {
            1.0
        } else {
            0.0
        },
    ));

    if let Ok(stats) = deps.cache.stats() {
        out.push(Metric::gauge(
            "cache",
            "ready_bytes",
            "Bytes of ready cache entries",
            stats.ready_bytes as f64,
        ));
        out.push(Metric::gauge(
            "cache",
            "max_bytes",
            "Configured cache budget in bytes",
            stats.max_bytes as f64,
        ));
        out.push(Metric::gauge(
            "cache",
            "entries",
            "Number of index entries",
            stats.entries as f64,
        ));
        out.push(Metric::gauge(
            "cache",
            "quarantined",
            "Entries quarantined after integrity failure",
            stats.quarantined as f64,
        ));
        out.push(Metric::gauge(
            "cache",
            "pinned",
            "Pinned entries",
            stats.pinned as f64,
        ));
        out.push(Metric::counter(
            "cache",
            "hits",
            "Cache lookup hits",
            stats.hits as f64,
        ));
        out.push(Metric::counter(
            "cache",
            "misses",
            "Cache lookup misses",
            stats.misses as f64,
        ));
    }

    out.push(Metric::gauge(
        "queue",
        "pending",
        "Outbound records waiting for delivery",
        deps.queue.size().unwrap_or(0) as f64,
    ));

    let scheduler_stats = deps.scheduler.stats();
    out.push(Metric::gauge(
        "scheduler",
        "jitter_p95_ms",
        "p95 of presentation start jitter",
        scheduler_stats.p95_ms,
    ));
    out.push(Metric::gauge(
        "scheduler",
        "jitter_max_ms",
        "Maximum presentation start jitter in the window",
        scheduler_stats.max_ms,
    ));

    let system = deps.collector.collect(&deps.disk_path);
    out.push(Metric::gauge(
        "system",
        "cpu_percent",
        "Global CPU usage",
        system.cpu_percent as f64,
    ));
    out.push(Metric::gauge(
        "system",
        "memory_used_bytes",
        "Memory in use",
        system.memory_used as f64,
    ));
    out.push(Metric::gauge(
        "system",
        "disk_used_bytes",
        "Disk in use on the cache filesystem",
        system.disk_used as f64,
    ));

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&out),
    )
}
