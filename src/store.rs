use crate::{config::Config, error::StoreError, record::JobRecord, util::sha256_hex};
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Counter that issues task IDs.
pub const TASK_COUNTER: &str = "taskid";
const SNL_COUNTER: &str = "snl_id";
const SNLGROUP_COUNTER: &str = "snlgroup_id";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS counters (
  id TEXT PRIMARY KEY,
  c INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
  dir_name TEXT PRIMARY KEY,
  task_id INTEGER NOT NULL UNIQUE,
  state TEXT NOT NULL,
  last_updated TEXT NOT NULL,
  doc TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS blobs (
  bucket TEXT NOT NULL,
  blob_id TEXT NOT NULL,
  data BLOB NOT NULL,
  PRIMARY KEY (bucket, blob_id)
);
CREATE TABLE IF NOT EXISTS snl (
  snl_id INTEGER PRIMARY KEY,
  fingerprint TEXT NOT NULL,
  snlgroup_id INTEGER NOT NULL,
  doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS snl_fingerprint ON snl(fingerprint);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another writer already stored this `dir_name` under a different task ID.
    Conflict { existing_task_id: i64 },
}

/// Handle to the shared task store. Each pipeline instance owns one.
pub trait TaskStore {
    fn find_task_id(&self, dir_name: &str) -> Result<Option<i64>, StoreError>;
    /// Atomically increments `key` and returns the new value. Missing counters
    /// start at zero, so the first call returns 1.
    fn increment_counter(&mut self, key: &str) -> Result<i64, StoreError>;
    fn counter_value(&self, key: &str) -> Result<i64, StoreError>;
    fn set_counter(&mut self, key: &str, value: i64) -> Result<(), StoreError>;
    fn put_blob(&mut self, bucket: &str, blob_id: &str, data: &[u8]) -> Result<(), StoreError>;
    /// Upserts keyed by `dir_name`. A stored row keeps its task ID forever.
    fn write_task(&mut self, record: &JobRecord) -> Result<WriteOutcome, StoreError>;
    fn get_task(&self, dir_name: &str) -> Result<Option<JobRecord>, StoreError>;
    fn count_tasks(&self) -> Result<i64, StoreError>;
}

/// Registers derived structure records and assigns their group identity.
pub trait StructureRegistry {
    fn register(&mut self, derived: &Value) -> Result<(Value, i64)>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(cfg: &Config) -> Result<Self> {
        let conn = if cfg.store.path == ":memory:" {
            Connection::open_in_memory().with_context(|| "open in-memory store")?
        } else {
            let path = Path::new(&cfg.store.path);
            Connection::open(path)
                .with_context(|| format!("open store: {}", path.display()))?
        };
        conn.busy_timeout(Duration::from_millis(cfg.store.busy_timeout_ms))
            .with_context(|| "set busy timeout")?;
        if cfg.store.path != ":memory:" {
            let mode: String = conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                .with_context(|| "enable WAL")?;
            debug!("store journal_mode={mode}");
        }
        conn.execute_batch(SCHEMA).with_context(|| "create schema")?;
        Ok(Self { conn })
    }
}

impl TaskStore for SqliteStore {
    fn find_task_id(&self, dir_name: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT task_id FROM tasks WHERE dir_name = ?1",
                params![dir_name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn increment_counter(&mut self, key: &str) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            r#"
            INSERT INTO counters(id, c) VALUES (?1, 1)
            ON CONFLICT(id) DO UPDATE SET c = c + 1
            RETURNING c
            "#,
            params![key],
            |row| row.get(0),
        )?)
    }

    fn counter_value(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT c FROM counters WHERE id = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0))
    }

    fn set_counter(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO counters(id, c) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET c = excluded.c",
            params![key, value],
        )?;
        Ok(())
    }

    fn put_blob(&mut self, bucket: &str, blob_id: &str, data: &[u8]) -> Result<(), StoreError> {
        // Blob IDs are content hashes, so an existing row already holds these bytes.
        self.conn.execute(
            "INSERT OR IGNORE INTO blobs(bucket, blob_id, data) VALUES (?1, ?2, ?3)",
            params![bucket, blob_id, data],
        )?;
        Ok(())
    }

    fn write_task(&mut self, record: &JobRecord) -> Result<WriteOutcome, StoreError> {
        let doc = serde_json::to_string(record)?;
        let changed = self.conn.execute(
            r#"
            INSERT INTO tasks(dir_name, task_id, state, last_updated, doc)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(dir_name) DO UPDATE SET
              state = excluded.state,
              last_updated = excluded.last_updated,
              doc = excluded.doc
            WHERE tasks.task_id = excluded.task_id
            "#,
            params![
                record.dir_name,
                record.task_id,
                record.state.to_string(),
                record.last_updated.as_deref().unwrap_or_default(),
                doc,
            ],
        )?;
        if changed > 0 {
            return Ok(WriteOutcome::Written);
        }
        match self.find_task_id(&record.dir_name)? {
            Some(existing_task_id) => Ok(WriteOutcome::Conflict { existing_task_id }),
            None => Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows)),
        }
    }

    fn get_task(&self, dir_name: &str) -> Result<Option<JobRecord>, StoreError> {
        let doc: Option<String> = self
            .conn
            .query_row(
                "SELECT doc FROM tasks WHERE dir_name = ?1",
                params![dir_name],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn count_tasks(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }
}

impl StructureRegistry for SqliteStore {
    /// Records sharing a structure fingerprint share a group.
    fn register(&mut self, derived: &Value) -> Result<(Value, i64)> {
        let structure = derived.get("structure").cloned().unwrap_or(Value::Null);
        let fingerprint = sha256_hex(&serde_json::to_vec(&structure)?);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| "begin registry transaction")?;

        let existing_group: Option<i64> = tx
            .query_row(
                "SELECT snlgroup_id FROM snl WHERE fingerprint = ?1 ORDER BY snl_id LIMIT 1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        let group_id = match existing_group {
            Some(g) => g,
            None => next_counter_tx(&tx, SNLGROUP_COUNTER)?,
        };
        let snl_id = next_counter_tx(&tx, SNL_COUNTER)?;

        let mut registered = derived.clone();
        if let Some(obj) = registered.as_object_mut() {
            obj.insert("snl_id".into(), Value::from(snl_id));
            obj.insert("snlgroup_key".into(), Value::from(fingerprint.clone()));
        }
        tx.execute(
            "INSERT INTO snl(snl_id, fingerprint, snlgroup_id, doc) VALUES (?1, ?2, ?3, ?4)",
            params![snl_id, fingerprint, group_id, serde_json::to_string(&registered)?],
        )?;
        tx.commit().with_context(|| "commit registry transaction")?;

        debug!("registered snl_id={snl_id} snlgroup_id={group_id}");
        Ok((registered, group_id))
    }
}

fn next_counter_tx(tx: &rusqlite::Transaction<'_>, key: &str) -> Result<i64, StoreError> {
    Ok(tx.query_row(
        "INSERT INTO counters(id, c) VALUES (?1, 1) ON CONFLICT(id) DO UPDATE SET c = c + 1 RETURNING c",
        params![key],
        |row| row.get(0),
    )?)
}
