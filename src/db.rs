use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Sqlite, Transaction};
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::{AppError, AppResult, ErrorKind};

pub type WriteTx = Transaction<'static, Sqlite>;

pub fn connect_options(path: &Path, busy_timeout: Duration) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(busy_timeout)
        .log_statements(log::LevelFilter::Off)
}

pub async fn open_pool(config: &CoreConfig) -> AppResult<SqlitePool> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    target: "routinely",
                    error = %e,
                    event = "db_dir_create_failed",
                    path = %parent.display()
                );
                AppError::from(e).with_context("path", parent.display().to_string())
            })?;
        }
    }
    info!(target: "routinely", event = "db_path", path = %config.db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.store_timeout)
        .connect_with(connect_options(&config.db_path, config.store_timeout))
        .await?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

/// Single-connection in-memory store. Every connection to `:memory:` is a
/// separate database, so the pool never grows past one.
pub async fn open_memory_pool() -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let sync: (i64,) = sqlx::query_as("PRAGMA synchronous;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "routinely",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        synchronous = %sync.0,
        foreign_keys = %fks.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "routinely",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Opens a write transaction that already holds SQLite's write lock.
///
/// The first statement is a write, so concurrent writers in any process queue
/// on the busy handler here instead of racing later read-modify-write steps.
/// Dropping the returned transaction without `commit` rolls it back.
pub async fn begin_write(pool: &SqlitePool) -> AppResult<WriteTx> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE store_write_lock SET epoch = epoch + 1 WHERE id = 1")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

pub async fn commit(tx: WriteTx) -> AppResult<()> {
    tx.commit().await.map_err(AppError::from)
}

/// Runs a pure read, retrying once when the store reports a transient failure.
pub async fn retry_read_once<T, F, Fut>(mut read: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match read().await {
        Err(err) if err.kind() == ErrorKind::StoreUnavailable => {
            warn!(
                target: "routinely",
                event = "store_read_retry",
                code = err.code(),
                message = err.message()
            );
            read().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_read_once_retries_store_unavailable_only_once() {
        let calls = AtomicUsize::new(0);
        let result: AppResult<()> = retry_read_once(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ErrorKind::StoreUnavailable.error("BUSY", "busy")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_read_once_does_not_retry_caller_errors() {
        let calls = AtomicUsize::new(0);
        let result: AppResult<()> = retry_read_once(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::not_found("routine", "r1")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_read_once_recovers_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry_read_once(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ErrorKind::StoreUnavailable.error("BUSY", "busy"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
