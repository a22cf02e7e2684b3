//! # Configuration de PanoSign
//!
//! Cette crate gère la configuration de l'agent :
//! - Chargement depuis un fichier YAML externe (`panosign.yaml`)
//! - Fusion avec la configuration par défaut intégrée
//! - Surcharge par variables d'environnement (`PANOSIGN_CONFIG__*`)
//! - Getters/setters typés pour chaque valeur
//! - Persistance de l'identité locale (device id, uuid de premier
//!   démarrage)
//!
//! Les valeurs sont adressées par chemins pointés (`cache.max_bytes`) ;
//! la fusion du fichier externe fonctionne par aplatissement en
//! feuilles, ré-appliquées une à une sur l'arbre des défauts, puis les
//! variables d'environnement s'appliquent de la même manière (`__`
//! sépare les segments). Les clés sont insensibles à la casse.
//!
//! Contrairement aux habitudes du reste de l'écosystème, il n'y a pas de
//! singleton global : la racine de composition charge une [`Config`] et
//! la passe explicitement à chaque composant.
//!
//! ## Utilisation
//!
//! ```no_run
//! use panoconfig::Config;
//!
//! let config = Config::load_config("")?;
//! let base_url = config.get_base_url()?;
//! let max_bytes = config.get_cache_max_bytes()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, bail, Result};
use dirs::home_dir;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{info, warn};
use uuid::Uuid;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("panosign.yaml");

const ENV_CONFIG_DIR: &str = "PANOSIGN_CONFIG";
const ENV_PREFIX: &str = "PANOSIGN_CONFIG__";

const CONFIG_FILE_NAME: &str = "panosign.yaml";
const LOCAL_DIR_NAME: &str = ".panosign";

// Valeurs de repli si le YAML est incomplet
const DEFAULT_CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_PREFETCH_HORIZON: usize = 5;
const DEFAULT_PREFETCH_CONCURRENCY: usize = 2;
const DEFAULT_BANDWIDTH_MBITS: u64 = 50;
const DEFAULT_HEARTBEAT_MS: u64 = 60_000;
const DEFAULT_SNAPSHOT_POLL_MS: u64 = 300_000;
const DEFAULT_COMMAND_POLL_MS: u64 = 30_000;
const DEFAULT_HEALTH_MS: u64 = 30_000;
const DEFAULT_RENEW_BEFORE_DAYS: u64 = 30;
const DEFAULT_RATE_LIMIT_SECS: u64 = 60;
const DEFAULT_QUEUE_MAX_RECORDS: usize = 10_000;
const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_HEALTH_PORT: u16 = 9901;
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_LOG_ROTATION_BYTES: u64 = 10 * 1024 * 1024;

/// Macro générant getter/setter pour une valeur u64 avec défaut
macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<u64> {
            match self.get_value($path)? {
                Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap()),
                Value::Number(n) if n.is_i64() => Ok(n.as_i64().unwrap().max(0) as u64),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Macro générant getter/setter pour une valeur usize avec défaut
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<usize> {
            match self.get_value($path)? {
                Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap() as usize),
                Value::Number(n) if n.is_i64() => Ok(n.as_i64().unwrap().max(0) as usize),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: usize) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Macro générant getter/setter pour une valeur bool avec défaut
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path)? {
                Value::Bool(b) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Macro générant getter/setter pour une chaîne avec défaut
macro_rules! impl_string_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<String> {
            match self.get_value($path)? {
                Value::String(s) if !s.is_empty() => Ok(s),
                _ => Ok($default.to_string()),
            }
        }

        pub fn $setter(&self, value: &str) -> Result<()> {
            self.set_value($path, Value::String(value.to_string()))
        }
    };
}

/// Gestionnaire de configuration de PanoSign
///
/// Charge `panosign.yaml` depuis le répertoire de configuration, le
/// fusionne avec la configuration par défaut intégrée puis applique les
/// surcharges d'environnement. Toute modification via un setter est
/// immédiatement réécrite sur disque.
#[derive(Debug)]
pub struct Config {
    config_dir: PathBuf,
    path: PathBuf,
    tree: Mutex<Value>,
}

impl Config {
    /// Choisit le répertoire de configuration.
    ///
    /// Le paramètre explicite puis `PANOSIGN_CONFIG` l'emportent ;
    /// sinon le premier répertoire `.panosign` déjà présent (répertoire
    /// courant, puis home) est retenu, et à défaut celui du home est
    /// créé.
    fn resolve_config_dir(explicit: &str) -> PathBuf {
        if !explicit.is_empty() {
            return PathBuf::from(explicit);
        }
        if let Ok(env_dir) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_dir, "Using config directory from env");
            return PathBuf::from(env_dir);
        }

        let local = PathBuf::from(LOCAL_DIR_NAME);
        let in_home = home_dir().map(|home| home.join(LOCAL_DIR_NAME));

        if local.is_dir() {
            local
        } else if let Some(in_home) = in_home.filter(|p| p.is_dir()) {
            in_home
        } else {
            home_dir()
                .map(|home| home.join(LOCAL_DIR_NAME))
                .unwrap_or(local)
        }
    }

    /// Charge la configuration depuis `directory` (ou l'emplacement par
    /// défaut si vide).
    ///
    /// Étapes :
    /// 1. Choix et création du répertoire de configuration
    /// 2. Arbre des défauts intégrés
    /// 3. Feuilles du `panosign.yaml` externe ré-appliquées dessus
    /// 4. Surcharges `PANOSIGN_CONFIG__*`
    /// 5. Génération du uuid de premier démarrage si absent
    /// 6. Sauvegarde de la configuration fusionnée
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::resolve_config_dir(directory);
        fs::create_dir_all(&config_dir)?;
        if !config_dir.is_dir() {
            bail!("Config path {:?} is not a directory", config_dir);
        }
        info!(config_dir = %config_dir.display(), "Using config directory");

        let path = config_dir.join(CONFIG_FILE_NAME);

        let mut tree: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        match fs::read(&path) {
            Ok(bytes) => {
                let external: Value = serde_yaml::from_slice(&bytes)?;
                for (key, value) in flatten_leaves(&external) {
                    store(&mut tree, &key, value)?;
                }
                info!(config_file = %path.display(), "Loaded config file");
            }
            Err(_) => {
                info!(config_file = %path.display(), "Config file not found, using embedded defaults");
            }
        }

        for (key, value) in env_overrides() {
            if let Err(e) = store(&mut tree, &key, value) {
                warn!(key = %key, error = %e, "Ignoring unusable env override");
            }
        }

        let config = Config {
            config_dir,
            path,
            tree: Mutex::new(tree),
        };

        // uuid de premier démarrage, persisté pour servir de nom
        // provisoire avant le pairing
        if config.get_device_uuid()?.is_empty() {
            config.set_device_uuid(&Uuid::new_v4().to_string())?;
        }

        config.save()?;
        Ok(config)
    }

    /// Sauvegarde la configuration courante dans `panosign.yaml`.
    ///
    /// L'écriture est atomique (temp puis rename), le fichier peut
    /// contenir le device id qui conditionne tout le reste du démarrage.
    pub fn save(&self) -> Result<()> {
        let yaml = {
            let tree = self.tree.lock().unwrap();
            serde_yaml::to_string(&*tree)?
        };
        panoutils::atomic_write(&self.path, yaml.as_bytes())
    }

    /// Répertoire de configuration résolu.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Positionne une valeur au chemin pointé donné puis sauvegarde.
    ///
    /// # Arguments
    ///
    /// * `path` - Chemin pointé (ex: `"cache.max_bytes"`)
    /// * `value` - Valeur YAML à écrire
    pub fn set_value(&self, path: &str, value: Value) -> Result<()> {
        {
            let mut tree = self.tree.lock().unwrap();
            store(&mut tree, path, value)?;
        }
        self.save()
    }

    /// Lit une valeur au chemin pointé donné.
    ///
    /// # Arguments
    ///
    /// * `path` - Chemin pointé (ex: `"intervals.heartbeat_ms"`)
    pub fn get_value(&self, path: &str) -> Result<Value> {
        let tree = self.tree.lock().unwrap();
        lookup(&tree, path)
            .cloned()
            .ok_or_else(|| anyhow!("No value at '{path}'"))
    }

    // ===== Identité =====

    impl_string_config!(get_device_id_raw, set_device_id, "device.id", "");
    impl_string_config!(get_device_uuid, set_device_uuid, "device.uuid", "");
    impl_string_config!(
        get_device_description,
        set_device_description,
        "device.description",
        "PanoSign display"
    );

    /// Device id attribué par le plan de contrôle, `None` si non appairé.
    pub fn get_device_id(&self) -> Result<Option<String>> {
        let id = self.get_device_id_raw()?;
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    // ===== Endpoints =====

    impl_string_config!(get_base_url, set_base_url, "endpoints.base_url", "");
    impl_string_config!(get_duplex_url, set_duplex_url, "endpoints.duplex_url", "");

    // ===== Cache =====

    impl_u64_config!(
        get_cache_max_bytes,
        set_cache_max_bytes,
        "cache.max_bytes",
        DEFAULT_CACHE_MAX_BYTES
    );
    impl_usize_config!(
        get_prefetch_horizon,
        set_prefetch_horizon,
        "cache.prefetch.horizon",
        DEFAULT_PREFETCH_HORIZON
    );
    impl_usize_config!(
        get_prefetch_concurrency,
        set_prefetch_concurrency,
        "cache.prefetch.concurrency",
        DEFAULT_PREFETCH_CONCURRENCY
    );
    impl_u64_config!(
        get_bandwidth_mbits,
        set_bandwidth_mbits,
        "cache.prefetch.bandwidth_mbits",
        DEFAULT_BANDWIDTH_MBITS
    );

    /// Racine du cache, créée si nécessaire.
    ///
    /// Un chemin relatif est résolu sous le répertoire de configuration.
    pub fn get_cache_dir(&self) -> Result<PathBuf> {
        let raw = match self.get_value("cache.dir") {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => "cache".to_string(),
        };
        self.resolve_and_create_dir(&raw)
    }

    /// Répertoire des logs tournés, sous la racine du cache.
    pub fn get_logs_dir(&self) -> Result<PathBuf> {
        let dir = self.get_cache_dir()?.join("logs");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Répertoire des secrets (clés et certificats), mode 0700.
    pub fn get_secrets_dir(&self) -> Result<PathBuf> {
        let dir = self.config_dir.join("secrets");
        panoutils::ensure_private_dir(&dir)?;
        Ok(dir)
    }

    // ===== Intervalles =====

    impl_u64_config!(
        get_heartbeat_interval_ms,
        set_heartbeat_interval_ms,
        "intervals.heartbeat_ms",
        DEFAULT_HEARTBEAT_MS
    );
    impl_u64_config!(
        get_snapshot_poll_interval_ms,
        set_snapshot_poll_interval_ms,
        "intervals.snapshot_poll_ms",
        DEFAULT_SNAPSHOT_POLL_MS
    );
    impl_u64_config!(
        get_command_poll_interval_ms,
        set_command_poll_interval_ms,
        "intervals.command_poll_ms",
        DEFAULT_COMMAND_POLL_MS
    );
    impl_u64_config!(
        get_health_interval_ms,
        set_health_interval_ms,
        "intervals.health_ms",
        DEFAULT_HEALTH_MS
    );

    // ===== mTLS =====

    impl_bool_config!(get_mtls_enabled, set_mtls_enabled, "mtls.enabled", true);
    impl_bool_config!(
        get_mtls_auto_renew,
        set_mtls_auto_renew,
        "mtls.auto_renew",
        true
    );
    impl_u64_config!(
        get_renew_before_days,
        set_renew_before_days,
        "mtls.renew_before_days",
        DEFAULT_RENEW_BEFORE_DAYS
    );

    // ===== Logs =====

    impl_string_config!(get_log_level, set_log_level, "log.level", "info");
    impl_u64_config!(
        get_log_rotation_max_bytes,
        set_log_rotation_max_bytes,
        "log.rotation_max_bytes",
        DEFAULT_LOG_ROTATION_BYTES
    );
    impl_bool_config!(get_log_compress, set_log_compress, "log.compress", true);

    // ===== Power schedule =====

    impl_bool_config!(get_power_enabled, set_power_enabled, "power.enabled", false);
    impl_string_config!(get_power_on_time, set_power_on_time, "power.on_time", "07:00");
    impl_string_config!(get_power_off_time, set_power_off_time, "power.off_time", "22:00");

    // ===== Sécurité =====

    /// Domaines autorisés pour les items de type URL.
    pub fn get_allowed_domains(&self) -> Result<Vec<String>> {
        match self.get_value("security.allowed_domains") {
            Ok(Value::Sequence(seq)) => Ok(seq
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    // ===== Commandes =====

    impl_u64_config!(
        get_command_rate_limit_secs,
        set_command_rate_limit_secs,
        "commands.rate_limit_secs",
        DEFAULT_RATE_LIMIT_SECS
    );

    // ===== File sortante =====

    impl_usize_config!(
        get_queue_max_records,
        set_queue_max_records,
        "queue.max_records",
        DEFAULT_QUEUE_MAX_RECORDS
    );

    pub fn get_queue_max_attempts(&self) -> Result<u32> {
        match self.get_value("queue.max_attempts")? {
            Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap() as u32),
            _ => Ok(DEFAULT_QUEUE_MAX_ATTEMPTS),
        }
    }

    // ===== Transport =====

    impl_u64_config!(
        get_request_timeout_ms,
        set_request_timeout_ms,
        "transport.request_timeout_ms",
        DEFAULT_REQUEST_TIMEOUT_MS
    );

    pub fn get_retry_attempts(&self) -> Result<u32> {
        match self.get_value("transport.retry_attempts")? {
            Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap() as u32),
            _ => Ok(DEFAULT_RETRY_ATTEMPTS),
        }
    }

    // ===== Surface locale =====

    pub fn get_health_port(&self) -> Result<u16> {
        match self.get_value("health.port")? {
            Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap() as u16),
            _ => Ok(DEFAULT_HEALTH_PORT),
        }
    }

    // ===== Expédition des logs =====

    impl_bool_config!(get_logship_enabled, set_logship_enabled, "logship.enabled", true);
    impl_u64_config!(
        get_logship_retention_days,
        set_logship_retention_days,
        "logship.retention_days",
        DEFAULT_RETENTION_DAYS
    );

    /// Résout un chemin relatif sous le répertoire de configuration et
    /// crée le répertoire si nécessaire.
    fn resolve_and_create_dir(&self, dir_path: &str) -> Result<PathBuf> {
        let path = Path::new(dir_path);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        };
        fs::create_dir_all(&resolved)?;
        Ok(resolved)
    }
}

// Implémentation manuelle de Clone (Mutex n'est pas Clone)
impl Clone for Config {
    fn clone(&self) -> Self {
        let tree = self.tree.lock().unwrap().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            tree: Mutex::new(tree),
        }
    }
}

/// Descend l'arbre le long d'un chemin pointé, clés insensibles à la
/// casse. `None` si un segment manque ou traverse autre chose qu'un
/// mapping.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Mapping(map) => map.get(Value::String(segment.to_ascii_lowercase())),
        _ => None,
    })
}

/// Écrit `value` au chemin pointé, en créant les mappings intermédiaires.
///
/// Les segments sont normalisés en minuscules à l'écriture : combiné au
/// `lookup` insensible à la casse, l'arbre ne contient que des clés
/// minuscules.
fn store(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<String> = path
        .split('.')
        .map(|s| s.to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    let Some((last, parents)) = segments.split_last() else {
        bail!("Empty config path");
    };

    let mut node = root;
    for segment in parents {
        let Value::Mapping(map) = node else {
            bail!("'{path}' crosses a non-mapping node at '{segment}'");
        };
        node = map
            .entry(Value::String(segment.clone()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    let Value::Mapping(map) = node else {
        bail!("'{path}' ends on a non-mapping node");
    };
    map.insert(Value::String(last.clone()), value);
    Ok(())
}

/// Aplatit un arbre YAML en feuilles `(chemin pointé, valeur)`.
///
/// Les mappings sont parcourus ; tout le reste (scalaires, séquences,
/// null) est une feuille qui remplacera la valeur correspondante de
/// l'arbre des défauts.
fn flatten_leaves(root: &Value) -> Vec<(String, Value)> {
    fn walk(prefix: &str, node: &Value, out: &mut Vec<(String, Value)>) {
        match node {
            Value::Mapping(map) => {
                for (key, child) in map {
                    let Some(key) = key.as_str() else { continue };
                    let path = if prefix.is_empty() {
                        key.to_ascii_lowercase()
                    } else {
                        format!("{}.{}", prefix, key.to_ascii_lowercase())
                    };
                    walk(&path, child, out);
                }
            }
            leaf => {
                if !prefix.is_empty() {
                    out.push((prefix.to_string(), leaf.clone()));
                }
            }
        }
    }

    let mut out = Vec::new();
    walk("", root, &mut out);
    out
}

/// Collecte les surcharges `PANOSIGN_CONFIG__SECTION__KEY`, triées pour
/// une application déterministe.
fn env_overrides() -> Vec<(String, Value)> {
    let mut entries: Vec<(String, Value)> = env::vars()
        .filter_map(|(key, raw)| {
            let suffix = key.strip_prefix(ENV_PREFIX)?;
            if suffix.is_empty() {
                return None;
            }
            Some((suffix.replace("__", "."), parse_env_scalar(&raw)))
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Interprète la valeur d'une variable d'environnement.
///
/// Booléens et nombres sont reconnus explicitement ; une valeur entre
/// crochets est tentée comme YAML (listes, ex: domaines autorisés) ;
/// tout le reste est une chaîne telle quelle.
fn parse_env_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(n));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::Number(Number::from(f));
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(trimmed) {
            return parsed;
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let tree: Value = serde_yaml::from_str("cache:\n  max_bytes: 42\n").unwrap();
        assert_eq!(
            lookup(&tree, "CACHE.Max_Bytes").and_then(|v| v.as_u64()),
            Some(42)
        );
        assert!(lookup(&tree, "cache.missing").is_none());
        assert!(lookup(&tree, "cache.max_bytes.deeper").is_none());
    }

    #[test]
    fn test_store_creates_intermediate_mappings() {
        let mut tree = Value::Mapping(Mapping::new());
        store(&mut tree, "A.B.C", Value::Bool(true)).unwrap();
        assert_eq!(lookup(&tree, "a.b.c"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_store_refuses_to_cross_scalar() {
        let mut tree: Value = serde_yaml::from_str("log:\n  level: info\n").unwrap();
        assert!(store(&mut tree, "log.level.nested", Value::Bool(true)).is_err());
    }

    #[test]
    fn test_flatten_keeps_sequences_whole() {
        let external: Value = serde_yaml::from_str(
            "security:\n  allowed_domains:\n    - a.com\n    - b.org\nlog:\n  level: debug\n",
        )
        .unwrap();

        let mut leaves = flatten_leaves(&external);
        leaves.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].0, "log.level");
        assert_eq!(leaves[1].0, "security.allowed_domains");
        assert!(matches!(leaves[1].1, Value::Sequence(_)));
    }

    #[test]
    fn test_parse_env_scalar_kinds() {
        assert_eq!(parse_env_scalar("true"), Value::Bool(true));
        assert_eq!(parse_env_scalar("777"), Value::Number(Number::from(777)));
        assert_eq!(
            parse_env_scalar("07:00"),
            Value::String("07:00".to_string())
        );
        assert!(matches!(
            parse_env_scalar("[a.com, b.org]"),
            Value::Sequence(_)
        ));
    }
}
