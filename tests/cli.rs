use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use routinely_lib::config::{CoreConfig, ENV_DB, ENV_LOG, ENV_LOG_DIR};
use routinely_lib::ledger::{self, NewTransaction, TransactionType};
use routinely_lib::CoreState;
use serde_json::Value;
use tempfile::tempdir;
#[path = "util.rs"]
mod util;

use util::{CHILD_A, FAMILY};

fn routinely(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("routinely").expect("binary built");
    cmd.env_remove(ENV_LOG_DIR)
        .env_remove(ENV_DB)
        .env(ENV_LOG, "off")
        .arg("--db")
        .arg(db);
    cmd
}

fn stdout_json(output: &std::process::Output) -> Result<Value> {
    Ok(serde_json::from_slice(&output.stdout)?)
}

async fn seeded_store(db: &Path, credits: &[i64]) -> Result<CoreState> {
    let db = db.display().to_string();
    let config = CoreConfig::from_lookup(|key| (key == ENV_DB).then(|| db.clone()))?;
    let state = CoreState::open(&config).await?;
    util::seed(&state.pool, "UTC").await?;
    for &points in credits {
        ledger::append_transaction(
            &state,
            NewTransaction::new(CHILD_A, FAMILY, TransactionType::TaskCompletion, points),
        )
        .await?;
    }
    Ok(state)
}

#[test]
fn migrate_reports_applied_versions() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("routinely.sqlite3");

    let output = routinely(&db).args(["migrate", "--json"]).output()?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let body = stdout_json(&output)?;
    let applied = body["applied"].as_array().expect("applied list");
    assert!(!applied.is_empty());
    assert!(db.exists());

    // Re-running is a no-op with the same history.
    let again = routinely(&db).args(["migrate", "--json"]).output()?;
    assert!(again.status.success());
    assert_eq!(stdout_json(&again)?["applied"], body["applied"]);
    Ok(())
}

#[tokio::test]
async fn balance_and_verify_on_a_seeded_store() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("routinely.sqlite3");
    let state = seeded_store(&db, &[5, 7]).await?;
    state.pool.close().await;

    let output = routinely(&db).args(["balance", CHILD_A, "--json"]).output()?;
    assert!(output.status.success());
    let body = stdout_json(&output)?;
    assert_eq!(body["profileId"], CHILD_A);
    assert_eq!(body["balance"], 12);

    let output = routinely(&db).args(["balance", "prof-nobody"]).output()?;
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?.trim(), "prof-nobody: 0");

    let output = routinely(&db).args(["verify-ledger", "--json"]).output()?;
    assert!(output.status.success());
    let report = stdout_json(&output)?;
    assert_eq!(report["rowsChecked"], 2);
    assert_eq!(report["violations"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn verify_ledger_exits_with_violation_code() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("routinely.sqlite3");
    let state = seeded_store(&db, &[5, 7]).await?;
    sqlx::query("DROP TRIGGER IF EXISTS point_transactions_no_update")
        .execute(&state.pool)
        .await?;
    sqlx::query("UPDATE point_transactions SET balance_after = 40 WHERE sequence = 2")
        .execute(&state.pool)
        .await?;
    state.pool.close().await;

    let output = routinely(&db).arg("verify-ledger").output()?;
    assert_eq!(output.status.code(), Some(2));
    let text = String::from_utf8(output.stdout)?;
    assert!(text.contains("VIOLATION"), "{text}");
    assert!(text.contains(CHILD_A));
    Ok(())
}

#[test]
fn sweep_on_an_empty_store_closes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("routinely.sqlite3");

    let output = routinely(&db).args(["sweep", "--limit", "5", "--json"]).output()?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)?["closed"], 0);
    Ok(())
}

#[test]
fn invalid_configuration_exits_with_an_error() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("routinely.sqlite3");

    let output = routinely(&db)
        .env("ROUTINELY_DB_MAX_CONNECTIONS", "zero")
        .arg("migrate")
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
    Ok(())
}
