// Clip index
//
// Exported clips outlive the rolling buffer, so they get a small SQLite
// index of their own: the UI lists past exports without scanning the
// export directory, and rows for files the user deleted externally are
// pruned on listing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::export::ClipDescriptor;

/// Error type for clip index operations
#[derive(Debug, thiserror::Error)]
pub enum ClipIndexError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("clip not found: {0}")]
    NotFound(Uuid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClipIndexError>;

/// One exported clip as stored in the index
#[derive(Debug, Clone, Serialize)]
pub struct ClipRecord {
    pub id: Uuid,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub content_start: DateTime<Utc>,
    pub content_end: DateTime<Utc>,
}

pub struct ClipIndex {
    conn: Mutex<Connection>,
}

impl ClipIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self> {
        let index = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clips (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                duration_secs REAL NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_start TEXT NOT NULL,
                content_end TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clips_created_at ON clips(created_at);",
        )?;
        Ok(())
    }

    /// Record a finished export
    pub fn insert(&self, clip: &ClipDescriptor) -> Result<ClipRecord> {
        let record = ClipRecord {
            id: Uuid::new_v4(),
            path: clip.path.clone(),
            created_at: clip.created_at,
            duration_secs: clip.duration_secs,
            size_bytes: clip.size_bytes,
            content_start: clip.content_start,
            content_end: clip.content_end,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO clips (id, path, created_at, duration_secs, size_bytes, content_start, content_end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.path.to_string_lossy().into_owned(),
                record.created_at.to_rfc3339(),
                record.duration_secs,
                record.size_bytes as i64,
                record.content_start.to_rfc3339(),
                record.content_end.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    /// List clips newest-first, dropping rows whose file no longer exists
    pub fn list(&self) -> Result<Vec<ClipRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, path, created_at, duration_secs, size_bytes, content_start, content_end
                 FROM clips ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let (kept, missing): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|r| r.path.exists());
        for record in &missing {
            log::info!("Pruning clip {} whose file is gone", record.id);
            let conn = self.conn.lock();
            conn.execute("DELETE FROM clips WHERE id = ?1", params![record.id.to_string()])?;
        }
        Ok(kept)
    }

    /// Delete a clip's file and its index row
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let path: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT path FROM clips WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };

        let Some(path) = path else {
            return Err(ClipIndexError::NotFound(id));
        };

        let file = PathBuf::from(path);
        if file.exists() {
            std::fs::remove_file(&file)?;
        }
        let conn = self.conn.lock();
        conn.execute("DELETE FROM clips WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClipRecord> {
    let id: String = row.get(0)?;
    let path: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let content_start: String = row.get(5)?;
    let content_end: String = row.get(6)?;
    Ok(ClipRecord {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        path: PathBuf::from(path),
        created_at: parse_time(&created_at),
        duration_secs: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)? as u64,
        content_start: parse_time(&content_start),
        content_end: parse_time(&content_end),
    })
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(path: PathBuf) -> ClipDescriptor {
        let now = Utc::now();
        ClipDescriptor {
            path,
            duration_secs: 30.0,
            size_bytes: 1024,
            created_at: now,
            content_start: now - chrono::Duration::seconds(30),
            content_end: now,
        }
    }

    #[test]
    fn insert_then_list_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("clip.mkv");
        std::fs::write(&file, b"clip").unwrap();

        let index = ClipIndex::open_in_memory().unwrap();
        let record = index.insert(&descriptor(file.clone())).unwrap();

        let listed = index.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
        assert_eq!(listed[0].path, file);
        assert!((listed[0].duration_secs - 30.0).abs() < 1e-9);
    }

    #[test]
    fn listing_prunes_rows_for_deleted_files() {
        let tmp = tempfile::tempdir().unwrap();
        let kept = tmp.path().join("kept.mkv");
        let gone = tmp.path().join("gone.mkv");
        std::fs::write(&kept, b"clip").unwrap();
        std::fs::write(&gone, b"clip").unwrap();

        let index = ClipIndex::open_in_memory().unwrap();
        index.insert(&descriptor(kept.clone())).unwrap();
        index.insert(&descriptor(gone.clone())).unwrap();

        std::fs::remove_file(&gone).unwrap();
        let listed = index.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, kept);
        // The pruned row stays gone
        assert_eq!(index.list().unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_file_and_row() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("clip.mkv");
        std::fs::write(&file, b"clip").unwrap();

        let index = ClipIndex::open_in_memory().unwrap();
        let record = index.insert(&descriptor(file.clone())).unwrap();

        index.delete(record.id).unwrap();
        assert!(!file.exists());
        assert!(index.list().unwrap().is_empty());
        assert!(matches!(
            index.delete(record.id),
            Err(ClipIndexError::NotFound(_))
        ));
    }
}
