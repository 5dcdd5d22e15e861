use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use routinely_lib::config::CoreConfig;
use routinely_lib::db::retry_read_once;
use routinely_lib::{db, ledger, migrate, session, CoreState};

#[derive(Debug, Parser)]
#[command(name = "routinely", about = "Family routine sessions and points ledger", version)]
struct Cli {
    /// Database file. Overrides ROUTINELY_DB.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Emit machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate,
    /// Auto-close every overdue in-progress session once.
    Sweep {
        /// Maximum sessions to close. Defaults to ROUTINELY_SWEEP_BATCH.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print the current points balance of a profile.
    Balance { profile_id: String },
    /// Replay the ledger and report balance or sequence breaks.
    VerifyLedger { profile_id: Option<String> },
}

/// Exit code when `verify-ledger` finds a violation.
const LEDGER_VIOLATION_EXIT_CODE: i32 = 2;

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = CoreConfig::from_env().context("load configuration")?;
    if let Some(path) = cli.db {
        config.db_path = path;
    }
    let _log_guard = routinely_lib::init_logging(&config.log).context("initialise logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(handle(cli.command, cli.json, config))
}

async fn handle(command: Commands, emit_json: bool, config: CoreConfig) -> Result<i32> {
    match command {
        Commands::Migrate => {
            let pool = db::open_pool(&config).await?;
            migrate::apply_migrations(&pool).await.context("apply migrations")?;
            let versions = migrate::applied_versions(&pool).await.context("read applied migrations")?;
            pool.close().await;
            if emit_json {
                println!("{}", json!({ "applied": versions }));
            } else {
                println!("Schema up to date ({} migrations applied).", versions.len());
            }
            Ok(0)
        }
        Commands::Sweep { limit } => {
            let state = CoreState::open(&config).await?;
            let limit = limit.unwrap_or(config.sweep_batch);
            let closed = session::sweep_overdue(&state, limit).await?;
            state.pool.close().await;
            if emit_json {
                println!("{}", json!({ "closed": closed }));
            } else {
                println!("Auto-closed {closed} overdue session(s).");
            }
            Ok(0)
        }
        Commands::Balance { profile_id } => {
            let state = CoreState::open(&config).await?;
            let pool = &state.pool;
            let profile = profile_id.as_str();
            let balance = retry_read_once(|| async move {
                let mut conn = pool.acquire().await?;
                ledger::balance_in(&mut conn, profile).await
            })
            .await?;
            state.pool.close().await;
            if emit_json {
                println!("{}", json!({ "profileId": profile_id, "balance": balance }));
            } else {
                println!("{profile_id}: {balance}");
            }
            Ok(0)
        }
        Commands::VerifyLedger { profile_id } => {
            let state = CoreState::open(&config).await?;
            let report = ledger::verify_ledger(&state.pool, profile_id.as_deref()).await?;
            state.pool.close().await;
            if emit_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize ledger report")?
                );
            } else {
                println!(
                    "Checked {} profile(s), {} row(s).",
                    report.profiles_checked, report.rows_checked
                );
                for violation in &report.violations {
                    println!(
                        "VIOLATION profile={} tx={} sequence={} (expected {}) balance={} (expected {})",
                        violation.profile_id,
                        violation.transaction_id,
                        violation.sequence,
                        violation.expected_sequence,
                        violation.actual_balance,
                        violation.expected_balance
                    );
                }
            }
            Ok(if report.is_consistent() {
                0
            } else {
                LEDGER_VIOLATION_EXIT_CODE
            })
        }
    }
}
