//! SQLite Checkpoint 存储
//!
//! 单连接放在 Mutex 中，所有读写串行执行；(coordinator_id, seq) 为主键。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
use crate::core::{OrchestratorError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    coordinator_id   TEXT NOT NULL,
    seq              INTEGER NOT NULL,
    kind             TEXT NOT NULL,
    request          TEXT,
    response         TEXT,
    review_materials TEXT,
    finished         INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (coordinator_id, seq)
);
";

const COLUMNS: &str =
    "coordinator_id, seq, kind, request, response, review_materials, finished, created_at, updated_at";

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// 打开（或创建）数据库文件，父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OrchestratorError::Checkpoint(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OrchestratorError::Checkpoint("connection lock poisoned".to_string()))
    }
}

fn encode(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn decode(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let kind: String = row.get(2)?;
    let created_at: DateTime<Utc> = row.get(7)?;
    let updated_at: DateTime<Utc> = row.get(8)?;
    Ok(Checkpoint {
        coordinator_id: row.get(0)?,
        seq: row.get(1)?,
        kind: CheckpointKind::parse(&kind).unwrap_or(CheckpointKind::Review),
        request: decode(row.get(3)?),
        response: decode(row.get(4)?),
        review_materials: decode(row.get(5)?),
        finished: row.get::<_, i64>(6)? != 0,
        created_at,
        updated_at,
    })
}

fn select_one(conn: &Connection, coordinator_id: &str, seq: i64) -> Result<Option<Checkpoint>> {
    let sql = format!("SELECT {COLUMNS} FROM checkpoints WHERE coordinator_id = ?1 AND seq = ?2");
    Ok(conn
        .query_row(&sql, params![coordinator_id, seq], row_to_checkpoint)
        .optional()?)
}

fn ensure_updated(changed: usize, coordinator_id: &str, seq: i64) -> Result<()> {
    if changed == 0 {
        return Err(OrchestratorError::Checkpoint(format!(
            "checkpoint {coordinator_id}/{seq} not found"
        )));
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get_or_create(
        &self,
        coordinator_id: &str,
        seq: i64,
        kind: CheckpointKind,
    ) -> Result<Checkpoint> {
        let conn = self.lock()?;
        let fresh = Checkpoint::new(coordinator_id, seq, kind);
        conn.execute(
            "INSERT OR IGNORE INTO checkpoints (coordinator_id, seq, kind, finished, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![coordinator_id, seq, kind.as_str(), fresh.created_at, fresh.updated_at],
        )?;
        select_one(&conn, coordinator_id, seq)?.ok_or_else(|| {
            OrchestratorError::Checkpoint(format!("checkpoint {coordinator_id}/{seq} vanished"))
        })
    }

    async fn get(&self, coordinator_id: &str, seq: i64) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        select_one(&conn, coordinator_id, seq)
    }

    async fn submit_request(
        &self,
        coordinator_id: &str,
        seq: i64,
        request: Value,
        review_materials: Option<Value>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE checkpoints
             SET request = ?3, review_materials = COALESCE(?4, review_materials), updated_at = ?5
             WHERE coordinator_id = ?1 AND seq = ?2",
            params![
                coordinator_id,
                seq,
                request.to_string(),
                encode(&review_materials),
                Utc::now()
            ],
        )?;
        ensure_updated(changed, coordinator_id, seq)
    }

    async fn submit_response(
        &self,
        coordinator_id: &str,
        seq: i64,
        response: Value,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE checkpoints SET response = ?3, finished = 1, updated_at = ?4
             WHERE coordinator_id = ?1 AND seq = ?2",
            params![coordinator_id, seq, response.to_string(), Utc::now()],
        )?;
        ensure_updated(changed, coordinator_id, seq)
    }

    async fn latest_unfinished(&self, coordinator_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM checkpoints WHERE coordinator_id = ?1 AND finished = 0
             ORDER BY seq DESC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![coordinator_id], row_to_checkpoint)
            .optional()?)
    }

    async fn list(&self, coordinator_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.lock()?;
        let sql =
            format!("SELECT {COLUMNS} FROM checkpoints WHERE coordinator_id = ?1 ORDER BY seq ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![coordinator_id], row_to_checkpoint)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
