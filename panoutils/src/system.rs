//! Instantané des statistiques système.
//!
//! Utilisé par le heartbeat et la surface de santé locale. Le collecteur
//! garde un `System` de `sysinfo` vivant entre deux mesures pour que le
//! pourcentage CPU soit calculé sur un intervalle réel.

use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::{Components, Disks, System};

/// Statistiques système à un instant donné.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Charge CPU globale en pourcentage (0-100)
    pub cpu_percent: f32,
    /// Mémoire utilisée en octets
    pub memory_used: u64,
    /// Mémoire totale en octets
    pub memory_total: u64,
    /// Octets utilisés sur le disque portant le cache
    pub disk_used: u64,
    /// Capacité totale du disque portant le cache
    pub disk_total: u64,
    /// Uptime du système en secondes
    pub uptime_secs: u64,
    /// Température CPU en degrés Celsius, si disponible
    pub temperature: Option<f32>,
}

/// Collecteur réutilisable de statistiques système.
pub struct SystemStatsCollector {
    system: Mutex<System>,
    started_at: SystemTime,
}

impl SystemStatsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            started_at: SystemTime::now(),
        }
    }

    /// Uptime du processus agent en secondes.
    pub fn process_uptime_secs(&self) -> u64 {
        self.started_at
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    /// Timestamp Unix du démarrage du processus.
    pub fn started_at_unix(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    /// Mesure les statistiques courantes.
    ///
    /// # Arguments
    ///
    /// * `disk_path` - Chemin dont le système de fichiers est mesuré
    ///   (typiquement la racine du cache)
    pub fn collect(&self, disk_path: &Path) -> SystemStats {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage();
        let memory_used = system.used_memory();
        let memory_total = system.total_memory();

        let (disk_used, disk_total) = disk_usage_for(disk_path);

        let temperature = Components::new_with_refreshed_list()
            .iter()
            .find(|c| {
                let label = c.label().to_lowercase();
                label.contains("cpu") || label.contains("core") || label.contains("soc")
            })
            .map(|c| c.temperature());

        SystemStats {
            cpu_percent,
            memory_used,
            memory_total,
            disk_used,
            disk_total,
            uptime_secs: System::uptime(),
            temperature,
        }
    }
}

impl Default for SystemStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Retourne `(utilisé, total)` pour le disque portant `path`.
///
/// Choisit le point de montage le plus long qui préfixe `path`, ce qui
/// gère les montages imbriqués (`/` et `/var`).
fn disk_usage_for(path: &Path) -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64, u64)> = None;
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.as_os_str().len();
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());
            if best.map(|(d, _, _)| depth > d).unwrap_or(true) {
                best = Some((depth, used, total));
            }
        }
    }

    best.map(|(_, used, total)| (used, total))
        .unwrap_or((0, 0))
}
