//! Persistance SQLite de la file sortante.

use crate::{QueueError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Genre d'un enregistrement sortant.
///
/// Le drainage est FIFO à l'intérieur d'un genre ; entre genres, l'ordre
/// n'est pas spécifié.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Heartbeat,
    ProofOfPlay,
    CommandAck,
    LogBundle,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Heartbeat,
        RecordKind::ProofOfPlay,
        RecordKind::CommandAck,
        RecordKind::LogBundle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Heartbeat => "heartbeat",
            RecordKind::ProofOfPlay => "pop",
            RecordKind::CommandAck => "command-ack",
            RecordKind::LogBundle => "log-bundle",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "heartbeat" => Ok(RecordKind::Heartbeat),
            "pop" => Ok(RecordKind::ProofOfPlay),
            "command-ack" => Ok(RecordKind::CommandAck),
            "log-bundle" => Ok(RecordKind::LogBundle),
            other => Err(QueueError::UnknownKind(other.to_string())),
        }
    }

    /// Vrai si un 409 du serveur vaut livraison réussie (le serveur
    /// connaît déjà l'enregistrement, cas des proof-of-play rejoués).
    pub fn conflict_is_success(&self) -> bool {
        matches!(self, RecordKind::ProofOfPlay)
    }
}

/// Intention durable d'effet de bord distant.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub id: i64,
    pub kind: RecordKind,
    pub method: String,
    pub path: String,
    pub body: String,
    pub created_at: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Magasin SQLite de la file sortante.
///
/// Toutes les mutations passent par ce composant ; la connexion est
/// protégée par un `Mutex` comme dans les autres magasins du workspace.
#[derive(Debug)]
pub struct QueueStore {
    conn: Mutex<Connection>,
    max_records: usize,
    default_max_attempts: u32,
}

impl QueueStore {
    /// Ouvre (ou crée) la file dans `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Fichier SQLite, typiquement `<cache>/outbound-queue.db`
    /// * `max_records` - Plafond dur de la file
    /// * `default_max_attempts` - Tentatives maximales par enregistrement
    pub fn open(path: &Path, max_records: usize, default_max_attempts: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Persistence(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbound (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outbound_kind ON outbound (kind, id)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_records,
            default_max_attempts,
        })
    }

    /// Enfile un enregistrement.
    ///
    /// Si la file est au plafond, le plus ancien enregistrement du même
    /// genre est écarté d'abord ; à défaut, le plus ancien tous genres
    /// confondus.
    pub fn enqueue(&self, kind: RecordKind, method: &str, path: &str, body: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbound", [], |row| row.get(0))?;
        if count as usize >= self.max_records {
            let evicted = conn.execute(
                "DELETE FROM outbound WHERE id = (
                    SELECT id FROM outbound WHERE kind = ?1 ORDER BY id ASC LIMIT 1
                )",
                params![kind.as_str()],
            )?;
            if evicted == 0 {
                conn.execute(
                    "DELETE FROM outbound WHERE id = (
                        SELECT id FROM outbound ORDER BY id ASC LIMIT 1
                    )",
                    [],
                )?;
            }
            tracing::warn!(kind = kind.as_str(), "Outbound queue at capacity, discarded oldest record");
        }

        conn.execute(
            "INSERT INTO outbound (kind, method, path, body, created_at, attempts, max_attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                kind.as_str(),
                method,
                path,
                body,
                Utc::now().to_rfc3339(),
                self.default_max_attempts
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Tête de file d'un genre (FIFO).
    pub fn peek_kind(&self, kind: RecordKind) -> Result<Option<OutboundRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, kind, method, path, body, created_at, attempts, max_attempts
             FROM outbound WHERE kind = ?1 ORDER BY id ASC LIMIT 1",
            params![kind.as_str()],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Genres ayant au moins un enregistrement en attente.
    pub fn pending_kinds(&self) -> Result<Vec<RecordKind>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT kind FROM outbound ORDER BY kind")?;
        let kinds = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(kinds
            .iter()
            .filter_map(|s| RecordKind::from_str(s).ok())
            .collect())
    }

    /// Incrémente le compteur de tentatives.
    pub fn mark_attempt(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE outbound SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Supprime un enregistrement livré ou abandonné.
    pub fn remove(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM outbound WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Nombre total d'enregistrements en attente.
    pub fn size(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbound", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Nombre d'enregistrements d'un genre.
    pub fn size_of_kind(&self, kind: RecordKind) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbound WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Vide complètement la file.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM outbound", [])?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundRecord> {
    let kind_str: String = row.get(1)?;
    let kind = RecordKind::from_str(&kind_str).map_err(|_| {
        rusqlite::Error::InvalidParameterName(format!("unknown record kind '{}'", kind_str))
    })?;
    Ok(OutboundRecord {
        id: row.get(0)?,
        kind,
        method: row.get(2)?,
        path: row.get(3)?,
        body: row.get(4)?,
        created_at: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
    })
}
