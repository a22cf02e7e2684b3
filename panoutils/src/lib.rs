//! Utilitaires partagés de PanoSign.
//!
//! Cette crate regroupe les petites briques utilisées par le reste du
//! workspace :
//!
//! - [`fsutil`] : écritures atomiques (temp puis rename) avec contrôle
//!   des permissions, création idempotente de répertoires
//! - [`system`] : instantané des statistiques système (CPU, mémoire,
//!   disque, uptime, température) via `sysinfo`

pub mod fsutil;
pub mod system;

pub use fsutil::{atomic_write, atomic_write_with_mode, ensure_dir, ensure_private_dir};
pub use system::{SystemStats, SystemStatsCollector};
