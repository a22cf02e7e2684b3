//! # panotelemetry - Télémétrie et surface de santé
//!
//! Deux sorties :
//!
//! - le **heartbeat** : à cadence fixe, un relevé {CPU, mémoire, disque,
//!   uptime, température, schedule et média courants} part dans la file
//!   sortante durable
//! - la **surface locale** : un serveur HTTP lié à la seule interface de
//!   loopback (pas d'authentification, précisément parce qu'il n'écoute
//!   que là) expose `/healthz` (résumé JSON, 200 pour healthy/degraded,
//!   503 pour unhealthy), `/metrics` (format texte ligne à ligne) et
//!   `/logs` (copie du tampon de logs récents)
//!
//! Les erreurs récentes du résumé de santé proviennent d'un tampon
//! circulaire alimenté par une couche `tracing`.

pub mod heartbeat;
pub mod logbuffer;
pub mod metrics;
pub mod server;
pub mod watcher;

pub use heartbeat::HeartbeatTask;
pub use logbuffer::{BufferLayer, LogBuffer, LogEntry};
pub use metrics::{render_metrics, Metric, MetricType};
pub use server::{HealthDeps, HealthServer};
pub use watcher::{evaluate, run_health_watch, HealthStatus};
