//! core_bank - ledger self-check runner
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌────────────────┐    ┌──────────┐
//! │  Config  │───▶│ Ledger Store │───▶│ TransferEngine │───▶│  Report  │
//! │  (YAML)  │    │ (mem / pg)   │    │ (N concurrent) │    │  (log)   │
//! └──────────┘    └──────────────┘    └────────────────┘    └──────────┘
//! ```
//!
//! Usage: `core_bank [--env dev] [--transfers 1000]`

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use core_bank::config::{AppConfig, LedgerBackend};
use core_bank::db::Database;
use core_bank::ledger::{LedgerStore, MemoryLedger, PgLedger};
use core_bank::money::Amount;
use core_bank::selfcheck::run_self_check;
use core_bank::transfer::TransferEngine;

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_transfers() -> anyhow::Result<usize> {
    match arg_value(&["--transfers", "-n"]) {
        Some(v) => v.parse().with_context(|| format!("invalid --transfers value: {}", v)),
        None => Ok(1000),
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    let lock_timeout = config.ledger.lock_timeout();
    match config.ledger.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::new(lock_timeout))),
        LedgerBackend::Postgres => {
            let url = config
                .postgres_url
                .as_deref()
                .context("postgres_url is required for the postgres backend")?;
            let db = Database::connect(url, config.ledger.max_connections).await?;
            db.health_check().await?;
            let ledger = PgLedger::new(db.pool().clone(), lock_timeout);
            ledger.ensure_schema().await?;
            Ok(Arc::new(ledger))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let transfers = get_transfers()?;

    let app_config = AppConfig::load(&env)?;
    let _log_guard = core_bank::logging::init_logging(&app_config);

    info!(
        git = env!("GIT_HASH"),
        backend = ?app_config.ledger.backend,
        lock_timeout_ms = app_config.ledger.lock_timeout_ms,
        "Starting core_bank in {} mode",
        env
    );

    let store = open_store(&app_config).await?;
    let engine = Arc::new(TransferEngine::new(store));

    let report = run_self_check(
        engine,
        transfers,
        Amount::from_units(1000),
        Amount::from_units(500),
        Amount::from_units(1),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.passed() {
        error!(?report, "Ledger invariants violated");
        anyhow::bail!("ledger self-check failed");
    }
    info!("Ledger self-check passed");
    Ok(())
}
