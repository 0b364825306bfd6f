//! agg_state
//!
//! The relational state repository: per-source cursors, the seen-file
//! log, the append-only record store, and the published-artifact history.
//! Backed by `rusqlite` in WAL mode behind a single-writer mutex, so reader
//! and writer transactions never starve each other under the orchestrator's
//! bounded worker pools.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone)]
pub struct SourceState {
    pub source_id: String,
    pub source_type: String,
    pub state: Value,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewSeenFile {
    pub source_id: String,
    pub external_id: String,
    pub raw_hash: String,
    pub file_size: i64,
    pub filename: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SeenFileRow {
    pub id: i64,
    pub source_id: String,
    pub external_id: String,
    pub raw_hash: String,
    pub filename: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct NewRecord {
    pub source_file_hash: String,
    pub record_type: String,
    pub unique_hash: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: i64,
    pub record_type: String,
    pub unique_hash: String,
    pub data: Value,
}

pub struct StateRepo {
    conn: Mutex<Connection>,
}

impl StateRepo {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StateError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get_source_state(&self, source_id: &str) -> Result<Option<SourceState>, StateError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT source_type, state_json, updated_at FROM source_state WHERE source_id = ?1",
                [source_id],
                |r| {
                    let source_type: String = r.get(0)?;
                    let state_json: String = r.get(1)?;
                    let updated_at: i64 = r.get(2)?;
                    Ok((source_type, state_json, updated_at))
                },
            )
            .optional()?;
        Ok(match row {
            Some((source_type, state_json, updated_at)) => Some(SourceState {
                source_id: source_id.to_string(),
                source_type,
                state: serde_json::from_str(&state_json)?,
                updated_at,
            }),
            None => None,
        })
    }

    pub fn update_source_state(
        &self,
        source_id: &str,
        source_type: &str,
        state: &Value,
    ) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO source_state (source_id, source_type, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_id) DO UPDATE SET
                source_type = excluded.source_type,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
            rusqlite::params![source_id, source_type, serde_json::to_string(state)?, now_unix()],
        )?;
        Ok(())
    }

    pub fn has_seen_file(&self, source_id: &str, external_id: &str) -> Result<bool, StateError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM seen_files WHERE source_id = ?1 AND external_id = ?2",
            [source_id, external_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Batched presence check: which of `external_ids` already have a
    /// seen_files row for `source_id`.
    pub fn get_seen_files_batch(
        &self,
        source_id: &str,
        external_ids: &[String],
    ) -> Result<std::collections::HashSet<String>, StateError> {
        if external_ids.is_empty() {
            return Ok(Default::default());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = external_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT external_id FROM seen_files WHERE source_id = ? AND external_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&source_id];
        for id in external_ids {
            params.push(id);
        }
        let rows = stmt.query_map(params_from_iter(params), |r| r.get::<_, String>(0))?;
        let mut out = std::collections::HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// INSERT OR IGNORE semantics on `(source_id, external_id)`.
    pub fn record_files_batch(&self, rows: &[NewSeenFile]) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO seen_files
                    (source_id, external_id, raw_hash, file_size, filename, status, metadata_json, first_seen_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
            )?;
            let ts = now_unix();
            for row in rows {
                let metadata_json = row
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(rusqlite::params![
                    row.source_id,
                    row.external_id,
                    row.raw_hash,
                    row.file_size,
                    row.filename,
                    metadata_json,
                    ts,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_file_status_batch(
        &self,
        updates: &[(String, String, Option<String>)],
    ) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE seen_files SET status = ?2, error_msg = ?3 WHERE raw_hash = ?1",
            )?;
            for (raw_hash, status, error_msg) in updates {
                stmt.execute(rusqlite::params![raw_hash, status, error_msg])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_pending_files(&self) -> Result<Vec<SeenFileRow>, StateError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, source_id, external_id, raw_hash, filename, status
             FROM seen_files WHERE status = 'pending' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(SeenFileRow {
                id: r.get(0)?,
                source_id: r.get(1)?,
                external_id: r.get(2)?,
                raw_hash: r.get(3)?,
                filename: r.get(4)?,
                status: r.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn max_seen_file_id(&self) -> Result<i64, StateError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn.query_row("SELECT MAX(id) FROM seen_files", [], |r| r.get(0))?;
        Ok(id.unwrap_or(0))
    }

    pub fn add_records_batch(&self, rows: &[NewRecord]) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO records (source_file_hash, record_type, unique_hash, data_json, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            )?;
            let ts = now_unix();
            for row in rows {
                stmt.execute(rusqlite::params![
                    row.source_file_hash,
                    row.record_type,
                    row.unique_hash,
                    serde_json::to_string(&row.data)?,
                    ts,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch deduplicated build input: at most one row per
    /// `(record_type, unique_hash)` (the row with the greatest id), ordered
    /// by that id ascending.
    pub fn get_records_for_build(
        &self,
        record_types: &[String],
        source_ids: &[String],
        min_seen_file_id: Option<i64>,
    ) -> Result<Vec<RecordRow>, StateError> {
        if record_types.is_empty() || source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let type_placeholders = record_types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let source_placeholders = source_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let mut sql = format!(
            "SELECT r.id, r.record_type, r.unique_hash, r.data_json
             FROM records r
             JOIN seen_files s ON s.raw_hash = r.source_file_hash
             WHERE r.is_active = 1
               AND r.record_type IN ({type_placeholders})
               AND s.source_id IN ({source_placeholders})"
        );
        if min_seen_file_id.is_some() {
            sql.push_str(" AND s.id > ?");
        }
        sql.push_str(" ORDER BY r.id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for t in record_types {
            params.push(t);
        }
        for s in source_ids {
            params.push(s);
        }
        if let Some(ref min_id) = min_seen_file_id {
            params.push(min_id);
        }

        let rows = stmt.query_map(params_from_iter(params), |r| {
            let id: i64 = r.get(0)?;
            let record_type: String = r.get(1)?;
            let unique_hash: String = r.get(2)?;
            let data_json: String = r.get(3)?;
            Ok((id, record_type, unique_hash, data_json))
        })?;

        let mut dedup: HashMap<(String, String), (i64, String)> = HashMap::new();
        for row in rows {
            let (id, record_type, unique_hash, data_json) = row?;
            let key = (record_type, unique_hash);
            match dedup.get(&key) {
                Some((existing_id, _)) if *existing_id >= id => {}
                _ => {
                    dedup.insert(key, (id, data_json));
                }
            }
        }

        let mut out: Vec<RecordRow> = Vec::with_capacity(dedup.len());
        for ((record_type, unique_hash), (id, data_json)) in dedup {
            out.push(RecordRow {
                id,
                record_type,
                unique_hash,
                data: serde_json::from_str(&data_json)?,
            });
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    /// Raw hashes no longer pending, that are not referenced by any active
    /// record of a blob-dependent format (passed by the caller, since this
    /// crate has no notion of which formats are blob-dependent).
    pub fn get_processed_hashes(
        &self,
        blob_dependent_types: &[String],
    ) -> Result<Vec<String>, StateError> {
        let conn = self.conn.lock().unwrap();
        let type_placeholders = if blob_dependent_types.is_empty() {
            "''".to_string()
        } else {
            blob_dependent_types.iter().map(|_| "?").collect::<Vec<_>>().join(",")
        };
        let sql = format!(
            "SELECT raw_hash FROM seen_files
             WHERE status != 'pending'
               AND raw_hash NOT IN (
                 SELECT r.source_file_hash FROM records r
                 WHERE r.is_active = 1 AND r.record_type IN ({type_placeholders})
               )"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = if blob_dependent_types.is_empty() {
            stmt.query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params_from_iter(blob_dependent_types.iter()), |r| {
                r.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    pub fn is_artifact_published(&self, unique_id: &str, hash: &str) -> Result<bool, StateError> {
        Ok(self.get_last_published_hash(unique_id)?.as_deref() == Some(hash))
    }

    pub fn get_last_published_hash(&self, unique_id: &str) -> Result<Option<String>, StateError> {
        let conn = self.conn.lock().unwrap();
        let hash = conn
            .query_row(
                "SELECT artifact_hash FROM published_artifacts
                 WHERE route_name = ?1 ORDER BY id DESC LIMIT 1",
                [unique_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn mark_published(
        &self,
        unique_id: &str,
        artifact_hash: &str,
        metadata: Option<&Value>,
    ) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap();
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO published_artifacts (route_name, artifact_hash, metadata_json, published_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![unique_id, artifact_hash, metadata_json, now_unix()],
        )?;
        Ok(())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS source_state (
    source_id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    state_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS seen_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    raw_hash TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    filename TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    error_msg TEXT,
    metadata_json TEXT,
    first_seen_ts INTEGER NOT NULL,
    UNIQUE(source_id, external_id)
);
CREATE INDEX IF NOT EXISTS idx_seen_files_status ON seen_files(status);
CREATE INDEX IF NOT EXISTS idx_seen_files_raw_hash ON seen_files(raw_hash);

CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_file_hash TEXT NOT NULL,
    record_type TEXT NOT NULL,
    unique_hash TEXT NOT NULL,
    data_json TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_type_hash ON records(record_type, unique_hash);
CREATE INDEX IF NOT EXISTS idx_records_source_file_hash ON records(source_file_hash);

CREATE TABLE IF NOT EXISTS published_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    route_name TEXT NOT NULL,
    artifact_hash TEXT NOT NULL,
    metadata_json TEXT,
    published_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_published_route ON published_artifacts(route_name);
";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seen_file_unique_constraint_dedups_ingest() {
        let repo = StateRepo::open_in_memory().unwrap();
        let row = NewSeenFile {
            source_id: "s1".into(),
            external_id: "e1".into(),
            raw_hash: "h1".into(),
            file_size: 10,
            filename: None,
            metadata: None,
        };
        repo.record_files_batch(&[row.clone()]).unwrap();
        repo.record_files_batch(&[row]).unwrap();
        let pending = repo.get_pending_files().unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn records_for_build_dedups_and_orders_by_max_id() {
        let repo = StateRepo::open_in_memory().unwrap();
        repo.record_files_batch(&[NewSeenFile {
            source_id: "s1".into(),
            external_id: "e1".into(),
            raw_hash: "h1".into(),
            file_size: 1,
            filename: None,
            metadata: None,
        }])
        .unwrap();
        repo.add_records_batch(&[
            NewRecord {
                source_file_hash: "h1".into(),
                record_type: "npvt".into(),
                unique_hash: "u1".into(),
                data: json!({"line": "old"}),
            },
            NewRecord {
                source_file_hash: "h1".into(),
                record_type: "npvt".into(),
                unique_hash: "u1".into(),
                data: json!({"line": "new"}),
            },
        ])
        .unwrap();

        let built = repo
            .get_records_for_build(&["npvt".to_string()], &["s1".to_string()], None)
            .unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].data.get("line").unwrap(), "new");
    }

    #[test]
    fn publish_hash_tracking_roundtrips() {
        let repo = StateRepo::open_in_memory().unwrap();
        assert_eq!(repo.get_last_published_hash("r1:npvt").unwrap(), None);
        repo.mark_published("r1:npvt", "abc123", None).unwrap();
        assert_eq!(
            repo.get_last_published_hash("r1:npvt").unwrap(),
            Some("abc123".to_string())
        );
        assert!(repo.is_artifact_published("r1:npvt", "abc123").unwrap());
        assert!(!repo.is_artifact_published("r1:npvt", "other").unwrap());
    }
}
