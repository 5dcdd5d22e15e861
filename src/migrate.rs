use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use tracing::{error, info};

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    match trimmed.char_indices().nth(160) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

pub static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202601100900_families_profiles.sql",
        include_str!("../migrations/202601100900_families_profiles.sql"),
    ),
    (
        "202601100910_routines.sql",
        include_str!("../migrations/202601100910_routines.sql"),
    ),
    (
        "202601100920_sessions.sql",
        include_str!("../migrations/202601100920_sessions.sql"),
    ),
    (
        "202601100930_points_ledger.sql",
        include_str!("../migrations/202601100930_points_ledger.sql"),
    ),
    (
        "202601100940_rewards.sql",
        include_str!("../migrations/202601100940_rewards.sql"),
    ),
    (
        "202601100950_write_lock.sql",
        include_str!("../migrations/202601100950_write_lock.sql"),
    ),
];

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn checksum(raw_sql: &str) -> String {
    format!("{:x}", Sha256::digest(strip_comments(raw_sql).as_bytes()))
}

/// Splits a migration into statements. Trigger bodies contain `;` and are kept
/// whole until their closing `END`.
pub fn split_statements(cleaned: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();
    for piece in cleaned.split(';') {
        if !pending.is_empty() {
            pending.push(';');
        }
        pending.push_str(piece);

        let upper = pending.trim().to_ascii_uppercase();
        let in_trigger = upper.starts_with("CREATE TRIGGER")
            || upper.starts_with("CREATE TEMP TRIGGER");
        if in_trigger && !upper.ends_with("END") {
            continue;
        }
        let stmt = pending.trim().to_string();
        pending.clear();
        if stmt.is_empty() {
            continue;
        }
        let upper = stmt.to_ascii_uppercase();
        if upper == "BEGIN" || upper == "COMMIT" {
            continue;
        }
        out.push(stmt);
    }
    let rest = pending.trim();
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }

    for (filename, raw_sql) in MIGRATIONS {
        let checksum = checksum(raw_sql);

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            info!(target: "routinely", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in split_statements(&strip_comments(raw_sql)) {
            info!(target: "routinely", event = "migration_stmt", file = %filename, sql = %preview(&stmt));
            if let Err(e) = sqlx::query(&stmt).execute(&mut *tx).await {
                error!(target: "routinely", event = "migration_stmt_error", file = %filename, sql = %preview(&stmt), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "routinely", event = "migration_file_applied", file = %filename);
    }

    Ok(())
}

/// Versions recorded in `schema_migrations`, oldest first.
pub async fn applied_versions(pool: &SqlitePool) -> anyhow::Result<Vec<String>> {
    let versions = sqlx::query_scalar::<_, String>(
        "SELECT version FROM schema_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await?;
    Ok(versions)
}
