//! PgTaskStore - PostgreSQL 上の正本（feature = "postgres"）
//!
//! 条件付き更新は 1 本の `UPDATE ... WHERE ... RETURNING` で行う。
//! 行が返らなければ precondition 不成立として現在の行を読み直す。

use crate::domain::{Precondition, TaskId, TaskKind, TaskRecord, TaskStatus, TaskUpdate};
use crate::ports::{StoreError, TaskStore, UpdateOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ferry_tasks (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    payload       TEXT NOT NULL,
    status        TEXT NOT NULL,
    result        TEXT NOT NULL DEFAULT '',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
)"#;

const CREATE_STALE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ferry_tasks_active_updated_at
    ON ferry_tasks (updated_at) WHERE status IN ('pending', 'running')"#;

const COLUMNS: &str = "id, kind, payload, status, result, attempt_count, created_at, updated_at";

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn attempt_to_db(attempt_count: u32) -> Result<i32, StoreError> {
    i32::try_from(attempt_count)
        .map_err(|_| StoreError::Corrupt(format!("attempt_count {attempt_count} exceeds INTEGER")))
}

fn record_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let corrupt = |e: sqlx::Error| StoreError::Corrupt(e.to_string());

    let id: String = row.try_get("id").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(corrupt)?;

    Ok(TaskRecord {
        id: id
            .parse()
            .map_err(|e: crate::domain::ParseTaskIdError| StoreError::Corrupt(e.to_string()))?,
        kind: TaskKind::new(row.try_get::<String, _>("kind").map_err(corrupt)?),
        payload: row.try_get("payload").map_err(corrupt)?,
        status: status
            .parse()
            .map_err(|e: crate::domain::ParseStatusError| StoreError::Corrupt(e.to_string()))?,
        result: row.try_get("result").map_err(corrupt)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StoreError::Corrupt(format!("negative attempt_count {attempt_count}")))?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(unavailable)?;
        info!(max_connections, "Connected to PostgreSQL task store");
        Ok(Self::new(pool))
    }

    /// Create the table and index if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        sqlx::query(CREATE_STALE_INDEX)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let attempt_count = attempt_to_db(record.attempt_count)?;
        let result = sqlx::query(
            "INSERT INTO ferry_tasks (id, kind, payload, status, result, attempt_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(&record.result)
        .bind(attempt_count)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.id))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn get_by_id(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM ferry_tasks WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn update_fields(
        &self,
        id: TaskId,
        update: &TaskUpdate,
        precondition: Precondition,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let attempt_count = update.attempt_count.map(attempt_to_db).transpose()?;
        let expected_attempt = precondition.attempt_count.map(attempt_to_db).transpose()?;
        let statuses: Vec<String> = precondition
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let row = sqlx::query(&format!(
            "UPDATE ferry_tasks SET \
                status = COALESCE($2, status), \
                result = COALESCE($3, result), \
                attempt_count = COALESCE($4, attempt_count), \
                updated_at = $5 \
             WHERE id = $1 AND status = ANY($6) AND ($7::INTEGER IS NULL OR attempt_count = $7) \
             RETURNING {COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(update.status.map(TaskStatus::as_str))
        .bind(update.result.as_deref())
        .bind(attempt_count)
        .bind(now)
        .bind(statuses)
        .bind(expected_attempt)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            Some(row) => Ok(UpdateOutcome::Applied(record_from_row(&row)?)),
            None => Ok(UpdateOutcome::Rejected(self.get_by_id(id).await?)),
        }
    }

    async fn list_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM ferry_tasks \
             WHERE status IN ('pending', 'running') AND updated_at < $1 \
             ORDER BY updated_at, id LIMIT $2"
        ))
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter().map(record_from_row).collect()
    }
}
