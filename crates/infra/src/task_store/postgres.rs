//! Postgres-backed task store.
//!
//! ## Schema
//!
//! One row per task in `tasks`, keyed by `id`, with indexes on `status` and
//! `created_at`. `seq` is a `BIGSERIAL` insertion counter used as the
//! tie-breaker when two tasks share a `created_at`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | TaskStoreError |
//! |------------|----------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | Other | `Storage` |
//!
//! Status updates run in a transaction: `SELECT … FOR UPDATE` locks the row,
//! the update is validated with [`Task::apply`], then the row is overwritten.
//! Concurrent writers to the same id queue up on the row lock.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use taskflow_core::{NewTask, Progress, StatusUpdate, Task, TaskId, TaskStatus};

use super::{TaskStore, TaskStoreError};

const SELECT_COLUMNS: &str = r#"
    id, name, description, status, progress, result, error,
    retries, attempt, created_at, updated_at
"#;

/// Postgres-backed task store.
///
/// `Send + Sync`; all connection management is delegated to the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect to `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, TaskStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the `tasks` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id UUID PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                progress SMALLINT NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
                result JSONB,
                error TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                attempt INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS tasks_status_idx ON tasks (status)",
            "CREATE INDEX IF NOT EXISTS tasks_created_at_idx ON tasks (created_at DESC)",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, input), fields(task_id = tracing::field::Empty), err)]
    async fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        let task = Task::new(input, Utc::now());
        Span::current().record("task_id", tracing::field::display(task.id));

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, name, description, status, progress, result, error,
                retries, attempt, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(i16::from(task.progress.value()))
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.retries as i32)
        .bind(task.attempt as i32)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;

        Ok(task)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;

        match row {
            Some(row) => TaskRow::from_row(&row)
                .map_err(|e| map_sqlx_error("decode_task", e))?
                .try_into(),
            None => Err(TaskStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks ORDER BY created_at DESC, seq ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let task: Task = TaskRow::from_row(&row)
                .map_err(|e| map_sqlx_error("decode_task", e))?
                .try_into()?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    #[instrument(
        skip(self, update),
        fields(task_id = %id, attempt = update.attempt, status = %update.transition.status()),
        err
    )]
    async fn update_status(&self, id: TaskId, update: &StatusUpdate) -> Result<Task, TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_task", e))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(TaskStoreError::NotFound(id));
        };

        let mut task: Task = TaskRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_task", e))?
            .try_into()?;

        if let Err(e) = task.apply(update, Utc::now()) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(TaskStoreError::from_transition(id, e));
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, progress = $3, result = $4, error = $5,
                retries = $6, attempt = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(task.status.as_str())
        .bind(i16::from(task.progress.value()))
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.retries as i32)
        .bind(task.attempt as i32)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_task", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(task)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn increment_retries(&self, id: TaskId) -> Result<u32, TaskStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET retries = retries + 1, updated_at = GREATEST(updated_at, NOW())
            WHERE id = $1
            RETURNING retries
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_retries", e))?;

        let row = row.ok_or(TaskStoreError::NotFound(id))?;
        let retries: i32 = row
            .try_get("retries")
            .map_err(|e| map_sqlx_error("decode_retries", e))?;
        Ok(retries as u32)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            TaskStoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    name: String,
    description: String,
    status: String,
    progress: i16,
    result: Option<JsonValue>,
    error: Option<String>,
    retries: i32,
    attempt: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for TaskRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            retries: row.try_get("retries")?,
            attempt: row.try_get("attempt")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .map_err(|e| TaskStoreError::Storage(format!("corrupt status column: {e}")))?;

        Ok(Task {
            id: TaskId::from_uuid(row.id),
            name: row.name,
            description: row.description,
            status,
            progress: Progress::clamped(i64::from(row.progress)),
            result: row.result,
            error: row.error,
            retries: row.retries.max(0) as u32,
            attempt: row.attempt.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
