//! Index SQLite du cache média.
//!
//! Toutes les mutations passent par la tâche du cache ; la connexion est
//! protégée par un `Mutex`. Les lecteurs obtiennent des copies des
//! lignes, jamais de référence sur l'état interne.

use crate::{CacheError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Statut d'une entrée du cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Pending,
    Downloading,
    Ready,
    Quarantined,
    Error,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Downloading => "downloading",
            MediaStatus::Ready => "ready",
            MediaStatus::Quarantined => "quarantined",
            MediaStatus::Error => "error",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "downloading" => MediaStatus::Downloading,
            "ready" => MediaStatus::Ready,
            "quarantined" => MediaStatus::Quarantined,
            "error" => MediaStatus::Error,
            _ => MediaStatus::Pending,
        }
    }
}

/// Ligne de l'index pour un média.
#[derive(Debug, Clone)]
pub struct MediaRow {
    pub media_id: String,
    pub digest: String,
    pub size: u64,
    pub path: String,
    pub status: MediaStatus,
    pub etag: Option<String>,
    pub last_used: Option<String>,
    pub pinned: bool,
}

/// Index du cache.
#[derive(Debug)]
pub struct MediaDb {
    conn: Mutex<Connection>,
}

impl MediaDb {
    /// Ouvre (ou crée) l'index dans `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS media (
                media_id TEXT PRIMARY KEY,
                digest TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                path TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                etag TEXT,
                last_used TEXT,
                pinned INTEGER NOT NULL DEFAULT 0,
                verified_at TEXT
            )",
            [],
        )?;

        // Index composite pour la politique d'éviction LRU
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_media_lru
                 ON media (status, pinned, last_used ASC)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Crée ou réinitialise une entrée en `pending`.
    pub fn upsert_pending(&self, media_id: &str, digest: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO media (media_id, digest, status, last_used)
             VALUES (?1, ?2, 'pending', ?3)
             ON CONFLICT(media_id) DO UPDATE SET
                 digest = excluded.digest,
                 status = 'pending'",
            params![media_id, digest, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Change le statut d'une entrée.
    pub fn set_status(&self, media_id: &str, status: MediaStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE media SET status = ?2 WHERE media_id = ?1",
            params![media_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(CacheError::NotFound(media_id.to_string()));
        }
        Ok(())
    }

    /// Marque une entrée prête après vérification d'empreinte.
    pub fn set_ready(&self, media_id: &str, size: u64, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media SET status = 'ready', size = ?2, path = ?3, last_used = ?4
             WHERE media_id = ?1",
            params![media_id, size as i64, path, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Enregistre l'entity tag du téléchargement en cours (reprise).
    pub fn set_etag(&self, media_id: &str, etag: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media SET etag = ?2 WHERE media_id = ?1",
            params![media_id, etag],
        )?;
        Ok(())
    }

    /// Récupère une entrée.
    pub fn get(&self, media_id: &str) -> Result<Option<MediaRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT media_id, digest, size, path, status, etag, last_used, pinned
             FROM media WHERE media_id = ?1",
            params![media_id],
            row_to_media,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Met à jour la date de dernier accès.
    pub fn touch(&self, media_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media SET last_used = ?2 WHERE media_id = ?1",
            params![media_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Épingle ou désépingle une entrée.
    pub fn set_pinned(&self, media_id: &str, pinned: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media SET pinned = ?2 WHERE media_id = ?1",
            params![media_id, pinned as i64],
        )?;
        Ok(())
    }

    /// Remplace l'ensemble des épingles.
    ///
    /// Les entrées listées sont épinglées, toutes les autres sont
    /// désépinglées, en une seule transaction.
    pub fn replace_pins(&self, media_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("UPDATE media SET pinned = 0 WHERE pinned = 1", [])?;
        for media_id in media_ids {
            tx.execute(
                "UPDATE media SET pinned = 1 WHERE media_id = ?1",
                params![media_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Octets cumulés des entrées prêtes.
    pub fn ready_bytes(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM media WHERE status = 'ready'",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Date la plus récente de vérification d'empreinte.
    pub fn mark_verified(&self, media_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media SET verified_at = ?2 WHERE media_id = ?1",
            params![media_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Entrées prêtes jamais vérifiées ou vérifiées le plus anciennement,
    /// pour la vérification paresseuse de fond.
    pub fn verification_candidates(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT media_id FROM media
             WHERE status = 'ready'
             ORDER BY verified_at ASC NULLS FIRST
             LIMIT ?1",
        )?;
        let ids = stmt
            .query_map([limit], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Candidats à l'éviction : prêts, non épinglés, du moins récemment
    /// utilisé au plus récent.
    pub fn eviction_candidates(&self) -> Result<Vec<MediaRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT media_id, digest, size, path, status, etag, last_used, pinned
             FROM media
             WHERE status = 'ready' AND pinned = 0
             ORDER BY last_used ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_media)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Toutes les entrées de l'index.
    pub fn all(&self) -> Result<Vec<MediaRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT media_id, digest, size, path, status, etag, last_used, pinned
             FROM media",
        )?;
        let rows = stmt
            .query_map([], row_to_media)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Supprime une entrée de l'index.
    pub fn delete(&self, media_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM media WHERE media_id = ?1", params![media_id])?;
        Ok(())
    }

    /// Compte les entrées dans un statut donné.
    pub fn count_status(&self, status: MediaStatus) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM media WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Compte les entrées épinglées.
    pub fn count_pinned(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM media WHERE pinned = 1", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    /// Nombre total d'entrées.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Purge toutes les entrées, épinglées comprises si `force`.
    pub fn purge(&self, force: bool) -> Result<Vec<MediaRow>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let removed = {
            let filter = if force { "" } else { " WHERE pinned = 0" };
            let mut stmt = tx.prepare(&format!(
                "SELECT media_id, digest, size, path, status, etag, last_used, pinned
                 FROM media{}",
                filter
            ))?;
            let rows = stmt
                .query_map([], row_to_media)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            if force {
                tx.execute("DELETE FROM media", [])?;
            } else {
                tx.execute("DELETE FROM media WHERE pinned = 0", [])?;
            }
            rows
        };

        tx.commit()?;
        Ok(removed)
    }
}

fn row_to_media(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRow> {
    let status: String = row.get(4)?;
    let size: i64 = row.get(2)?;
    let pinned: i64 = row.get(7)?;
    Ok(MediaRow {
        media_id: row.get(0)?,
        digest: row.get(1)?,
        size: size.max(0) as u64,
        path: row.get(3)?,
        status: MediaStatus::from_str(&status),
        etag: row.get(5)?,
        last_used: row.get(6)?,
        pinned: pinned != 0,
    })
}
