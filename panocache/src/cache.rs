//! Cache média : installation, éviction, épinglage.

use crate::db::{MediaDb, MediaStatus};
use crate::download::{download_resumable, sha256_file};
use crate::{CacheError, RateLimiter, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INDEX_FILE: &str = "index.db";
const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = ".tmp";
const QUARANTINE_DIR: &str = "quarantine";

/// Âge au-delà duquel un `.part` abandonné est nettoyé au démarrage.
const STALE_PART_SECS: u64 = 24 * 3600;

/// Statistiques du cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub ready_bytes: u64,
    pub max_bytes: u64,
    pub quarantined: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Issue d'une installation, partagée entre appelants concurrents.
#[derive(Debug, Clone)]
enum InstallOutcome {
    Ready(PathBuf),
    Failed(String),
}

/// Cache média adressé par contenu.
///
/// Conçu pour vivre derrière un `Arc` ; le cache possède exclusivement
/// son arborescence disque et son index.
pub struct MediaCache {
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    quarantine_dir: PathBuf,
    db: Arc<MediaDb>,
    max_bytes: u64,
    client: reqwest::Client,
    /// Un seul téléchargement en vol par media id
    inflight: Mutex<HashMap<String, broadcast::Sender<InstallOutcome>>>,
    /// Budget de bande passante des téléchargements
    limiter: std::sync::RwLock<Option<Arc<dyn RateLimiter>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: CancellationToken,
}

impl MediaCache {
    /// Ouvre le cache sous `cache_root` et répare l'index.
    ///
    /// # Arguments
    ///
    /// * `cache_root` - Racine du cache (contiendra `objects/` et `index.db`)
    /// * `max_bytes` - Budget des entrées prêtes
    /// * `client` - Client HTTP partagé pour les téléchargements
    /// * `shutdown` - Annulation coopérative des téléchargements
    pub fn open(
        cache_root: &Path,
        max_bytes: u64,
        client: reqwest::Client,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let objects_dir = cache_root.join(OBJECTS_DIR);
        let tmp_dir = objects_dir.join(TMP_DIR);
        let quarantine_dir = objects_dir.join(QUARANTINE_DIR);
        std::fs::create_dir_all(&tmp_dir)?;
        std::fs::create_dir_all(&quarantine_dir)?;

        let db = Arc::new(MediaDb::open(&cache_root.join(INDEX_FILE))?);

        let cache = Self {
            objects_dir,
            tmp_dir,
            quarantine_dir,
            db,
            max_bytes,
            client,
            inflight: Mutex::new(HashMap::new()),
            limiter: std::sync::RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown,
        };

        cache.repair()?;
        Ok(cache)
    }

    /// Répare l'index après un arrêt brutal.
    ///
    /// - une entrée prête sans fichier repasse en `pending`
    /// - un fichier objet sans ligne prête est un orphelin, supprimé
    /// - les `.part` vieux d'un jour sont nettoyés
    fn repair(&self) -> Result<()> {
        let rows = self.db.all()?;

        for row in &rows {
            if row.status == MediaStatus::Ready && !Path::new(&row.path).exists() {
                warn!(media_id = %row.media_id, "Ready entry lost its file, demoting to pending");
                self.db.set_status(&row.media_id, MediaStatus::Pending)?;
            }
        }

        let ready_ids: std::collections::HashSet<String> = rows
            .iter()
            .filter(|r| r.status == MediaStatus::Ready)
            .map(|r| r.media_id.clone())
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.objects_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !ready_ids.contains(&name) {
                    debug!(file = %name, "Removing orphan cache object");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        if let Ok(entries) = std::fs::read_dir(&self.tmp_dir) {
            let now = std::time::SystemTime::now();
            for entry in entries.filter_map(|e| e.ok()) {
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| now.duration_since(t).ok())
                    .map(|age| age.as_secs() > STALE_PART_SECS)
                    .unwrap_or(false);
                if stale {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        Ok(())
    }

    fn object_path(&self, media_id: &str) -> PathBuf {
        self.objects_dir.join(media_id)
    }

    fn part_path(&self, media_id: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}.part", media_id))
    }

    /// Chemin local d'un média prêt, `None` si absent.
    pub fn get(&self, media_id: &str) -> Option<PathBuf> {
        match self.db.get(media_id) {
            Ok(Some(row)) if row.status == MediaStatus::Ready => {
                let path = PathBuf::from(&row.path);
                if path.exists() {
                    let _ = self.db.touch(media_id);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(path)
                } else {
                    // Fichier disparu sous nos pieds
                    let _ = self.db.set_status(media_id, MediaStatus::Pending);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Vrai si le média est prêt, sans compter un accès.
    pub fn is_ready(&self, media_id: &str) -> bool {
        matches!(
            self.db.get(media_id),
            Ok(Some(row)) if row.status == MediaStatus::Ready && Path::new(&row.path).exists()
        )
    }

    /// Installe un média dans le cache.
    ///
    /// Un second appel concurrent pour le même media id rejoint le
    /// téléchargement en cours au lieu d'en lancer un autre.
    ///
    /// # Arguments
    ///
    /// * `media_id` - Identifiant du média
    /// * `expected_digest` - Empreinte SHA-256 attendue, hex
    /// * `url` - Source de téléchargement
    /// * `size_hint` - Taille annoncée, pour évincer avant de télécharger
    pub async fn install(
        &self,
        media_id: &str,
        expected_digest: &str,
        url: &str,
        size_hint: Option<u64>,
    ) -> Result<PathBuf> {
        // Déjà prêt avec la bonne empreinte : rien à faire
        if let Ok(Some(row)) = self.db.get(media_id) {
            if row.status == MediaStatus::Ready
                && row.digest == expected_digest
                && Path::new(&row.path).exists()
            {
                let _ = self.db.touch(media_id);
                return Ok(PathBuf::from(row.path));
            }
        }

        // Coordination mono-écrivain par media id
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(media_id) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(media_id.to_string(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            // Un autre appelant télécharge déjà : attendre son issue
            return match rx.recv().await {
                Ok(InstallOutcome::Ready(path)) => Ok(path),
                Ok(InstallOutcome::Failed(reason)) => Err(CacheError::Download {
                    media_id: media_id.to_string(),
                    reason,
                }),
                Err(_) => Err(CacheError::Download {
                    media_id: media_id.to_string(),
                    reason: "install aborted".to_string(),
                }),
            };
        }

        let result = self
            .install_inner(media_id, expected_digest, url, size_hint)
            .await;

        let mut inflight = self.inflight.lock().await;
        if let Some(tx) = inflight.remove(media_id) {
            let outcome = match &result {
                Ok(path) => InstallOutcome::Ready(path.clone()),
                Err(e) => InstallOutcome::Failed(e.to_string()),
            };
            let _ = tx.send(outcome);
        }

        result
    }

    async fn install_inner(
        &self,
        media_id: &str,
        expected_digest: &str,
        url: &str,
        size_hint: Option<u64>,
    ) -> Result<PathBuf> {
        self.db.upsert_pending(media_id, expected_digest)?;

        if let Some(size) = size_hint {
            self.ensure_budget(size)?;
        }

        self.db.set_status(media_id, MediaStatus::Downloading)?;
        let part = self.part_path(media_id);

        let previous_etag = self
            .db
            .get(media_id)?
            .and_then(|row| row.etag);

        let limiter = self.limiter.read().unwrap().clone();
        let outcome = match download_resumable(
            &self.client,
            url,
            &part,
            previous_etag.as_deref(),
            limiter.as_deref(),
            &self.shutdown,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(CacheError::Io(e)) if is_disk_full(&e) => {
                let _ = tokio::fs::remove_file(&part).await;
                self.db.set_status(media_id, MediaStatus::Error)?;
                return Err(CacheError::CacheFull {
                    needed: size_hint.unwrap_or(0),
                    reclaimable: 0,
                });
            }
            Err(e) => {
                self.db.set_status(media_id, MediaStatus::Error)?;
                return Err(e);
            }
        };

        self.db.set_etag(media_id, outcome.etag.as_deref())?;

        self.finalize_part(media_id, expected_digest, &part, outcome.size)
            .await
    }

    /// Installe un média depuis un fichier local.
    ///
    /// Même chemin de vérification et d'éviction que le téléchargement ;
    /// utilisé pour le contenu préchargé et par les tests.
    pub async fn install_from_file(
        &self,
        media_id: &str,
        expected_digest: &str,
        source: &Path,
    ) -> Result<PathBuf> {
        self.db.upsert_pending(media_id, expected_digest)?;
        self.db.set_status(media_id, MediaStatus::Downloading)?;

        let part = self.part_path(media_id);
        tokio::fs::copy(source, &part).await?;
        let size = tokio::fs::metadata(&part).await?.len();

        self.finalize_part(media_id, expected_digest, &part, size)
            .await
    }

    /// Vérifie l'empreinte d'un `.part` complet puis l'installe
    /// atomiquement dans le répertoire d'objets.
    async fn finalize_part(
        &self,
        media_id: &str,
        expected_digest: &str,
        part: &Path,
        size: u64,
    ) -> Result<PathBuf> {
        // Vérification d'intégrité avant toute installation
        let actual = sha256_file(part).await?;
        if actual != expected_digest {
            let quarantined = self.quarantine_dir.join(media_id);
            tokio::fs::rename(part, &quarantined).await?;
            self.db.set_status(media_id, MediaStatus::Quarantined)?;
            error!(
                media_id,
                expected = expected_digest,
                actual = %actual,
                "Integrity mismatch, blob quarantined"
            );
            return Err(CacheError::Integrity {
                media_id: media_id.to_string(),
                expected: expected_digest.to_string(),
                actual,
            });
        }

        // Budget vérifié sur la taille réelle ; en cas d'échec le
        // fichier temporaire est supprimé
        if let Err(e) = self.ensure_budget(size) {
            let _ = tokio::fs::remove_file(part).await;
            self.db.set_status(media_id, MediaStatus::Error)?;
            return Err(e);
        }

        let final_path = self.object_path(media_id);
        tokio::fs::rename(part, &final_path).await?;
        self.db
            .set_ready(media_id, size, &final_path.to_string_lossy())?;

        info!(media_id, size, "Media installed in cache");
        Ok(final_path)
    }

    /// Vérifie explicitement l'empreinte d'une entrée prête.
    ///
    /// En cas d'écart, le fichier part en quarantaine.
    pub async fn verify(&self, media_id: &str) -> Result<bool> {
        let row = self
            .db
            .get(media_id)?
            .ok_or_else(|| CacheError::NotFound(media_id.to_string()))?;

        if row.status != MediaStatus::Ready {
            return Ok(false);
        }

        let path = PathBuf::from(&row.path);
        let actual = sha256_file(&path).await?;
        if actual == row.digest {
            self.db.mark_verified(media_id)?;
            return Ok(true);
        }

        let quarantined = self.quarantine_dir.join(media_id);
        tokio::fs::rename(&path, &quarantined).await?;
        self.db.set_status(media_id, MediaStatus::Quarantined)?;
        error!(media_id, "Stored blob failed verification, quarantined");
        Ok(false)
    }

    /// Libère assez de place pour `incoming` octets supplémentaires.
    ///
    /// Les candidats sont les entrées prêtes non épinglées, du moins
    /// récemment utilisé au plus récent. Le fichier est supprimé avant
    /// la ligne d'index, pour qu'un crash au milieu soit réparable.
    fn ensure_budget(&self, incoming: u64) -> Result<()> {
        if incoming > self.max_bytes {
            return Err(CacheError::CacheFull {
                needed: incoming,
                reclaimable: 0,
            });
        }

        let ready = self.db.ready_bytes()?;
        if ready + incoming <= self.max_bytes {
            return Ok(());
        }

        let needed = ready + incoming - self.max_bytes;
        let candidates = self.db.eviction_candidates()?;
        let reclaimable: u64 = candidates.iter().map(|r| r.size).sum();

        if reclaimable < needed {
            return Err(CacheError::CacheFull {
                needed,
                reclaimable,
            });
        }

        let mut freed = 0u64;
        for row in candidates {
            if freed >= needed {
                break;
            }
            // Fichier d'abord, ligne ensuite
            if let Err(e) = std::fs::remove_file(&row.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(media_id = %row.media_id, error = %e, "Failed to unlink evicted object");
                    continue;
                }
            }
            self.db.delete(&row.media_id)?;
            freed += row.size;
            debug!(media_id = %row.media_id, size = row.size, "Evicted cache entry");
        }

        Ok(())
    }

    /// Épingle une entrée (jamais évincée tant qu'épinglée).
    pub fn pin(&self, media_id: &str) -> Result<()> {
        self.db.set_pinned(media_id, true)
    }

    /// Désépingle une entrée.
    pub fn unpin(&self, media_id: &str) -> Result<()> {
        self.db.set_pinned(media_id, false)
    }

    /// Remplace l'ensemble des épingles (now-playing ∪ horizon de
    /// prefetch), en une transaction.
    pub fn replace_pins(&self, media_ids: &[String]) -> Result<()> {
        self.db.replace_pins(media_ids)
    }

    /// Vide le cache.
    ///
    /// Sans `force`, les entrées épinglées sont conservées. Avec
    /// `force`, tout part, quarantaine et fichiers temporaires compris.
    pub fn clear(&self, force: bool) -> Result<()> {
        let removed = self.db.purge(force)?;
        for row in &removed {
            if !row.path.is_empty() {
                let _ = std::fs::remove_file(&row.path);
            }
        }

        if force {
            for dir in [&self.tmp_dir, &self.quarantine_dir] {
                if let Ok(entries) = std::fs::read_dir(dir) {
                    for entry in entries.filter_map(|e| e.ok()) {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
        }

        info!(force, removed = removed.len(), "Cache cleared");
        Ok(())
    }

    /// Statistiques courantes.
    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.db.count()?,
            ready_bytes: self.db.ready_bytes()?,
            max_bytes: self.max_bytes,
            quarantined: self.db.count_status(MediaStatus::Quarantined)?,
            pinned: self.db.count_pinned()?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    /// Vérifie paresseusement les entrées prêtes les moins récemment
    /// vérifiées. Retourne le nombre d'entrées saines.
    pub async fn verify_sweep(&self, limit: usize) -> Result<usize> {
        let mut healthy = 0;
        for media_id in self.db.verification_candidates(limit)? {
            match self.verify(&media_id).await {
                Ok(true) => healthy += 1,
                Ok(false) => {}
                Err(e) => warn!(media_id = %media_id, error = %e, "Background verification failed"),
            }
        }
        Ok(healthy)
    }

    /// Tâche d'entretien : vérification d'empreinte au fil de l'eau,
    /// une entrée par tick.
    pub async fn run_maintenance(self: Arc<Self>, interval: std::time::Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.verify_sweep(1).await {
                        warn!(error = %e, "Cache maintenance sweep failed");
                    }
                }
            }
        }
    }

    /// Installe le budget de bande passante des téléchargements.
    pub fn set_rate_limiter(&self, limiter: Option<Arc<dyn RateLimiter>>) {
        *self.limiter.write().unwrap() = limiter;
    }

    /// Index sous-jacent (tests et outillage).
    pub fn db(&self) -> &MediaDb {
        &self.db
    }
}

/// Détection d'un disque plein (ENOSPC).
fn is_disk_full(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(28)
}
