use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use basekit_idempotency::config::{
    ConfigLayer, ConfigResolver, ResolvedConfig, StoreBackend, StoreLayer, SweeperLayer, explain,
};
use basekit_idempotency::{IdempotencyKey, ResponseCache, Sweeper};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Maintenance tool for the basekit idempotency store")]
struct Cli {
    /// Config file (TOML, or JSON by extension) applied below env and flags.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding idempotency records; implies the sqlite backend.
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show resolved configuration or explain provenance.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the record stored under a key.
    Inspect {
        /// Full key, e.g. `revoke:key-123`.
        #[arg(long)]
        key: String,
    },
    /// Delete expired records once and exit.
    Purge,
    /// Run the expiry sweeper until interrupted.
    Sweep {
        /// Override the sweep interval.
        #[arg(long, value_name = "SECS")]
        interval_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the resolved config.
    Show {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print provenance and warnings for the resolved config.
    Explain {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let interval_override = match &cli.command {
        Command::Sweep { interval_secs } => *interval_secs,
        _ => None,
    };
    let resolved = resolve_config(&cli, interval_override)?;

    match cli.command {
        Command::Config { command } => handle_config_command(command, &resolved),
        Command::Inspect { key } => inspect(&resolved, &key).await,
        Command::Purge => purge(&resolved).await,
        Command::Sweep { .. } => sweep(&resolved).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli, interval_secs: Option<u64>) -> Result<ResolvedConfig> {
    let mut resolver = ConfigResolver::new();
    if let Some(path) = &cli.config {
        resolver = resolver.with_file(path);
    }

    let mut overrides = ConfigLayer::default();
    if let Some(db) = &cli.db {
        overrides.store = Some(StoreLayer {
            backend: Some(StoreBackend::Sqlite),
            path: Some(db.clone()),
            busy_timeout_ms: None,
        });
    }
    if interval_secs.is_some() {
        overrides.sweeper = Some(SweeperLayer {
            interval_secs,
            ..Default::default()
        });
    }

    resolver
        .with_cli_overrides(overrides)
        .load()
        .context("resolve idempotency config")
}

fn handle_config_command(cmd: ConfigCommand, resolved: &ResolvedConfig) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&resolved.config)
                        .context("serialize config to json")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&resolved.config).context("serialize config to toml")?
                );
            }
        }
        ConfigCommand::Explain { json } => {
            let report = explain(resolved);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report.json)
                        .context("serialize explain report to json")?
                );
            } else {
                print!("{}", report.text);
            }
        }
    }
    Ok(())
}

fn open_cache(resolved: &ResolvedConfig) -> Result<ResponseCache> {
    if resolved.config.store.backend == StoreBackend::Memory {
        return Err(anyhow!(
            "the memory store is empty in a fresh process; pass --db or configure store.path"
        ));
    }
    let store = resolved.config.store.open().context("open idempotency store")?;
    Ok(ResponseCache::new(store))
}

async fn inspect(resolved: &ResolvedConfig, key: &str) -> Result<()> {
    let cache = open_cache(resolved)?;
    let key = IdempotencyKey::parse(key);
    let record = cache
        .backing_store()
        .fetch(&key)
        .await
        .with_context(|| format!("fetch {key}"))?
        .ok_or_else(|| anyhow!("no record stored under {key}"))?;

    let expired = record.is_expired_at(Utc::now());
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "record": record,
            "expired": expired,
        }))
        .context("serialize record")?
    );
    Ok(())
}

async fn purge(resolved: &ResolvedConfig) -> Result<()> {
    let cache = open_cache(resolved)?;
    let removed = Sweeper::from_config(cache, &resolved.config.sweeper)
        .run_once()
        .await
        .context("purge expired records")?;
    println!("removed {removed} expired record(s)");
    Ok(())
}

async fn sweep(resolved: &ResolvedConfig) -> Result<()> {
    let cache = open_cache(resolved)?;
    let metrics = cache.metrics().clone();
    let handle = Sweeper::from_config(cache, &resolved.config.sweeper).spawn();
    tracing::info!(
        interval_secs = resolved.config.sweeper.interval_secs,
        "sweeper running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    handle.shutdown().await.context("stop sweeper")?;
    tracing::info!(
        purged = metrics.purged_total.load(std::sync::atomic::Ordering::Relaxed),
        "sweeper stopped"
    );
    Ok(())
}
