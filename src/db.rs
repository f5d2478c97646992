//! Read-only database access.
//!
//! The pool is opened with `SQLITE_OPEN_READONLY`, so even a statement that
//! slipped past the gateway could not write. Each `execute_readonly` call
//! borrows one pooled connection for its duration.
//!
//! The statement timeout is enforced by SQLite itself: a progress handler
//! installed on the borrowed connection aborts the running statement once
//! the deadline passes or once the calling future has been dropped. The
//! worker thread is then free again and the connection returns to the pool,
//! whether the caller timed out, was cancelled, or simply went away.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, SqliteConnection, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;

use crate::config::DbConfig;
use crate::error::{DbError, DbErrorKind, ExecutionError};
use crate::models::RowSet;

/// SQLite VM instructions between two progress-handler checks.
const PROGRESS_INTERVAL_OPS: i32 = 1_000;

/// How long past the deadline the runtime waits for SQLite to abort on its
/// own before giving up on the future.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Capability the gateway needs from the database.
#[async_trait]
pub trait ReadOnlyDatabase: Send + Sync {
    /// Run one statement, returning at most `row_limit` rows.
    async fn execute_readonly(&self, sql: &str, row_limit: usize)
        -> Result<RowSet, ExecutionError>;
}

pub async fn connect(config: &DbConfig) -> Result<SqlitePool> {
    let db_path = &config.path;
    if !db_path.exists() {
        anyhow::bail!("database not found: {}", db_path.display());
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.statement_timeout())
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    Ok(pool)
}

pub struct SqliteDatabase {
    pool: SqlitePool,
    statement_timeout: Duration,
}

impl SqliteDatabase {
    pub fn new(pool: SqlitePool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = connect(config).await?;
        Ok(Self::new(pool, config.statement_timeout()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ReadOnlyDatabase for SqliteDatabase {
    async fn execute_readonly(
        &self,
        sql: &str,
        row_limit: usize,
    ) -> Result<RowSet, ExecutionError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;

        let deadline = Instant::now() + self.statement_timeout;
        let abort = Arc::new(AtomicBool::new(false));
        let _abort_on_drop = AbortOnDrop(abort.clone());
        install_interrupt(&mut conn, deadline, abort).await?;

        let result = match tokio::time::timeout(
            self.statement_timeout + TIMEOUT_GRACE,
            fetch_rows(&mut conn, sql, row_limit),
        )
        .await
        {
            Ok(Err(ExecutionError::Database(DbError {
                kind: DbErrorKind::Timeout,
                ..
            })))
            | Err(_) => Err(self.timeout_error()),
            Ok(result) => result,
        };

        // A stale handler would abort the next statement on this connection.
        if let Ok(Ok(mut handle)) = tokio::time::timeout(TIMEOUT_GRACE, conn.lock_handle()).await {
            handle.remove_progress_handler();
        }

        result
    }
}

impl SqliteDatabase {
    fn timeout_error(&self) -> ExecutionError {
        DbError::new(
            DbErrorKind::Timeout,
            format!(
                "statement exceeded {}s timeout",
                self.statement_timeout.as_secs_f32()
            ),
        )
        .into()
    }
}

/// Raises the abort flag when the executing future is dropped.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Make SQLite interrupt the connection's current statement once `deadline`
/// passes or `abort` is raised. The statement then fails with
/// "interrupted", which classifies as a timeout.
async fn install_interrupt(
    conn: &mut SqliteConnection,
    deadline: Instant,
    abort: Arc<AtomicBool>,
) -> Result<(), ExecutionError> {
    let mut handle = conn.lock_handle().await.map_err(map_sqlx_error)?;
    handle.set_progress_handler(PROGRESS_INTERVAL_OPS, move || {
        !abort.load(Ordering::Relaxed) && Instant::now() < deadline
    });
    Ok(())
}

async fn fetch_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    row_limit: usize,
) -> Result<RowSet, ExecutionError> {
    let mut columns: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    let mut truncated = false;

    {
        let mut stream = sqlx::query(sql).persistent(false).fetch(&mut *conn);
        while let Some(row) = stream.next().await {
            let row = row.map_err(map_sqlx_error)?;
            if rows.len() == row_limit {
                truncated = true;
                break;
            }
            if columns.is_none() {
                columns = Some(row.columns().iter().map(|c| c.name().to_string()).collect());
            }
            rows.push(row_values(&row).map_err(map_sqlx_error)?);
        }
    }

    // Column names are still useful for an empty result.
    let columns = match columns {
        Some(columns) => columns,
        None => (&mut *conn)
            .describe(sql)
            .await
            .map(|d| d.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default(),
    };

    Ok(RowSet {
        columns,
        rows,
        truncated,
    })
}

fn row_values(row: &SqliteRow) -> Result<Vec<serde_json::Value>, sqlx::Error> {
    (0..row.len()).map(|i| value_at(row, i)).collect()
}

/// Decode by the value's runtime storage class.
fn value_at(row: &SqliteRow, index: usize) -> Result<serde_json::Value, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(serde_json::Value::Null);
        }
        raw.type_info().name().to_string()
    };

    let value = match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => serde_json::Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" | "NUMERIC" => serde_json::Value::from(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get_unchecked(index)?;
            serde_json::Value::String(format!("<{} bytes>", bytes.len()))
        }
        _ => serde_json::Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

fn map_sqlx_error(err: sqlx::Error) -> ExecutionError {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            DbError::new(DbErrorKind::classify(&message), message).into()
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ExecutionError::Unavailable(err.to_string())
        }
        other => {
            let message = other.to_string();
            DbError::new(DbErrorKind::classify(&message), message).into()
        }
    }
}
