//! SQLite storage backend

use super::traits::{OpenStore, RollResult, StateStore, StorageError, StorageResult};
use crate::pipeline::PersistedRunState;
use crate::worldbook::{HistoryRecord, Worldbook};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Key of the single run-state row.
const CURRENT_RUN: &str = "current";

/// SQLite-backed state store
///
/// Uses a single SQLite database file with tables for the run state,
/// history and roll results. Thread-safe via internal mutex on the connection.
///
/// History and roll-result ids come from `AUTOINCREMENT` columns, so a
/// deleted id is never handed out again and sequence order survives
/// rollbacks.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

type HistoryRow = (i64, i64, String, String, String, String, String);

impl SqliteStateStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Resumable run state (one row per slot; the pipeline uses 'current')
            CREATE TABLE IF NOT EXISTS run_state (
                slot TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only merge history
            CREATE TABLE IF NOT EXISTS history (
                sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item_index INTEGER NOT NULL,
                title TEXT NOT NULL,
                previous_json TEXT NOT NULL,
                resulting_json TEXT NOT NULL,
                changes_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_title
                ON history(title);

            -- Every result produced per work item
            CREATE TABLE IF NOT EXISTS roll_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_index INTEGER NOT NULL,
                result_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_roll_results_item
                ON roll_results(item_index);

            -- Enable WAL mode for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::DateParse(e.to_string()))
    }

    /// Deserialize a history record from database columns
    fn row_to_history(row: HistoryRow) -> StorageResult<HistoryRecord> {
        let (sequence_id, work_item_index, title, previous, resulting, changes, created_at) = row;
        Ok(HistoryRecord {
            sequence_id,
            work_item_index: work_item_index as usize,
            title,
            previous_snapshot: serde_json::from_str(&previous)?,
            resulting_snapshot: serde_json::from_str(&resulting)?,
            changed_entries: serde_json::from_str(&changes)?,
            timestamp: Self::parse_timestamp(&created_at)?,
        })
    }

    fn read_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }
}

impl OpenStore for SqliteStateStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateStore for SqliteStateStore {
    // === Run State ===

    fn save_run_state(&self, state: &PersistedRunState) -> StorageResult<()> {
        let state_json = serde_json::to_string(state)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO run_state (slot, fingerprint, state_json, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(slot) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
            params![
                CURRENT_RUN,
                state.file_fingerprint,
                state_json,
                state.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_run_state(&self) -> StorageResult<Option<PersistedRunState>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM run_state WHERE slot = ?1",
                params![CURRENT_RUN],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn clear_run_state(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM run_state WHERE slot = ?1", params![CURRENT_RUN])?;
        Ok(())
    }

    // === History ===

    fn append_history(&self, record: &HistoryRecord) -> StorageResult<i64> {
        let previous = serde_json::to_string(&record.previous_snapshot)?;
        let resulting = serde_json::to_string(&record.resulting_snapshot)?;
        let changes = serde_json::to_string(&record.changed_entries)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO history (work_item_index, title, previous_json, resulting_json, changes_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.work_item_index as i64,
                record.title,
                previous,
                resulting,
                changes,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_history(&self) -> StorageResult<Vec<HistoryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence_id, work_item_index, title, previous_json, resulting_json, changes_json, created_at
             FROM history ORDER BY sequence_id",
        )?;
        let rows = stmt.query_map([], Self::read_history_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Self::row_to_history(row?)?);
        }
        Ok(records)
    }

    fn get_history(&self, sequence_id: i64) -> StorageResult<Option<HistoryRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT sequence_id, work_item_index, title, previous_json, resulting_json, changes_json, created_at
                 FROM history WHERE sequence_id = ?1",
                params![sequence_id],
                Self::read_history_row,
            )
            .optional()?;

        row.map(Self::row_to_history).transpose()
    }

    fn delete_history(&self, sequence_id: i64) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM history WHERE sequence_id = ?1",
            params![sequence_id],
        )?;
        Ok(deleted > 0)
    }

    fn delete_history_from(&self, sequence_id: i64) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM history WHERE sequence_id >= ?1",
            params![sequence_id],
        )?;
        Ok(deleted)
    }

    fn clear_history(&self) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM history", [])?)
    }

    // === Roll Results ===

    fn save_roll_result(&self, item_index: usize, result: &Worldbook) -> StorageResult<i64> {
        let result_json = serde_json::to_string(result)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO roll_results (item_index, result_json, created_at) VALUES (?1, ?2, ?3)",
            params![item_index as i64, result_json, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_roll_results(&self, item_index: usize) -> StorageResult<Vec<RollResult>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, result_json, created_at FROM roll_results
             WHERE item_index = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![item_index as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, json, created_at) = row?;
            results.push(RollResult {
                id,
                item_index,
                result: serde_json::from_str(&json)?,
                created_at: Self::parse_timestamp(&created_at)?,
            });
        }
        Ok(results)
    }

    fn clear_roll_results(&self, item_index: usize) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM roll_results WHERE item_index = ?1",
            params![item_index as i64],
        )?;
        Ok(deleted)
    }

    fn shift_roll_results(&self, from_index: usize, delta: usize) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE roll_results SET item_index = item_index + ?2 WHERE item_index >= ?1",
            params![from_index as i64, delta as i64],
        )?;
        Ok(())
    }
}
