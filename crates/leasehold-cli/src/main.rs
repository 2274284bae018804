//! Leasehold CLI - operator tooling for distributed record leases

use clap::{Parser, Subcommand};
use leasehold_core::Error;
use leasehold_core::config::LeaseConfig;
use leasehold_core::locking::{LeaseInfo, LockManager, Reaper};
use leasehold_core::store::KeyTtl;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author, version, about = "Distributed per-record leases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Coordination store URL (redis:// or rediss://)
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Key namespace
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Show whether a record is leased and for how long
    Status {
        /// Record ID
        record_id: String,
    },

    /// Release a lease by owner token, or force it
    Release {
        /// Record ID
        record_id: String,
        /// Owner token printed by the holder
        #[arg(long)]
        token: Option<String>,
        /// Delete regardless of owner
        #[arg(long, conflicts_with = "token")]
        force: bool,
    },

    /// Sweep the namespace once for leases outliving max age
    Cleanup {
        /// Age bound in seconds (defaults to 60)
        #[arg(long, value_name = "SECS")]
        max_age: Option<u64>,
    },

    /// Sweep periodically until Ctrl-C
    Reap {
        /// Seconds between sweeps (defaults to max age)
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Age bound in seconds (defaults to 60)
        #[arg(long, value_name = "SECS")]
        max_age: Option<u64>,
    },

    /// Acquire a lease, hold it, then release
    Hold {
        /// Record ID
        record_id: String,
        /// Lease TTL in seconds (defaults to 5)
        #[arg(long, value_name = "SECS")]
        ttl: Option<u64>,
        /// Seconds to hold before releasing (defaults to until Ctrl-C)
        #[arg(long = "for", value_name = "SECS")]
        hold_for: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leasehold=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    let result = run(cli).await;
    if let Err(err) = &result {
        if let Some(e) = err.downcast_ref::<Error>() {
            report_error(e, format);
        }
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli);
    // Validates URL and prefix; no connection is opened yet
    let manager = Arc::new(LockManager::redis(config)?);
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        Commands::Status { record_id } => cmd_status(&manager, &record_id, out).await,
        Commands::Release {
            record_id,
            token,
            force,
        } => cmd_release(&manager, &record_id, token.as_deref(), force, out).await,
        Commands::Cleanup { max_age } => cmd_cleanup(&manager, max_age, out).await,
        Commands::Reap { interval, max_age } => {
            cmd_reap(manager.clone(), interval, max_age, out).await
        }
        Commands::Hold {
            record_id,
            ttl,
            hold_for,
        } => cmd_hold(&manager, &record_id, ttl, hold_for, out).await,
    };

    manager.disconnect().await;
    result
}

fn build_config(cli: &Cli) -> LeaseConfig {
    let mut config = LeaseConfig::default();
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.trim());
    }
    if let Some(prefix) = &cli.prefix {
        config = config.with_key_prefix(prefix.as_str());
    }
    config
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn text(&self, line: impl AsRef<str>) {
        if self.format == OutputFormat::Text && !self.quiet {
            println!("{}", line.as_ref());
        }
    }

    fn json(&self, value: serde_json::Value) {
        if self.format == OutputFormat::Json {
            println!("{}", value);
        }
    }
}

fn report_error(e: &Error, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let body = json!({
                "error": {
                    "code": e.code(),
                    "message": e.to_string(),
                    "suggestion": e.suggestion(),
                }
            });
            println!("{}", body);
        }
        OutputFormat::Text => {
            if let Some(suggestion) = e.suggestion() {
                eprintln!("[{}] Try: {}", e.code(), suggestion);
            }
        }
    }
}

fn describe_ttl(ttl: KeyTtl) -> String {
    match ttl {
        KeyTtl::Expires(secs) => format!("expires in {}s", secs),
        KeyTtl::Persistent => "no expiry (run `leasehold cleanup`)".to_string(),
        KeyTtl::Missing => "gone".to_string(),
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_status(manager: &LockManager, record_id: &str, out: Output) -> anyhow::Result<()> {
    let key = manager.key_for(record_id)?;
    let info: Option<LeaseInfo> = manager.lease_info(record_id).await?;

    match &info {
        Some(info) => out.text(format!("{}: locked, {}", key, describe_ttl(info.ttl))),
        None => out.text(format!("{}: unlocked", key)),
    }
    out.json(json!({
        "record_id": record_id,
        "key": key.as_str(),
        "locked": info.is_some(),
        "lease": info,
    }));
    Ok(())
}

async fn cmd_release(
    manager: &LockManager,
    record_id: &str,
    token: Option<&str>,
    force: bool,
    out: Output,
) -> anyhow::Result<()> {
    let key = manager.key_for(record_id)?;

    let removed = match (token, force) {
        (Some(token), _) => {
            manager.release_with_token(record_id, token).await?;
            out.text(format!("Released {}", key));
            true
        }
        (None, true) => {
            let removed = manager.force_release(record_id).await?;
            if removed {
                out.text(format!("Force-released {}", key));
            } else {
                out.text(format!("No lease for {}", key));
            }
            removed
        }
        (None, false) => {
            anyhow::bail!("Specify --token <TOKEN> for an owner release or --force to delete regardless of owner")
        }
    };

    out.json(json!({
        "record_id": record_id,
        "key": key.as_str(),
        "released": removed,
        "forced": force,
    }));
    Ok(())
}

async fn cmd_cleanup(manager: &LockManager, max_age: Option<u64>, out: Output) -> anyhow::Result<()> {
    let max_age = secs_or(max_age, manager.config().cleanup_max_age);
    // Surface connectivity problems; the sweep itself only logs them
    manager.connect().await?;

    let cleaned = manager.cleanup_expired_locks(max_age).await;
    out.text(format!(
        "Removed {} lease(s) outliving {}s",
        cleaned,
        max_age.as_secs()
    ));
    out.json(json!({
        "cleaned": cleaned,
        "max_age_secs": max_age.as_secs(),
    }));
    Ok(())
}

async fn cmd_reap(
    manager: Arc<LockManager>,
    interval: Option<u64>,
    max_age: Option<u64>,
    out: Output,
) -> anyhow::Result<()> {
    let max_age = secs_or(max_age, manager.config().cleanup_max_age);
    let interval = secs_or(interval, max_age);
    let reaper = Reaper::new(manager.clone(), interval, max_age)?;
    manager.connect().await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping reaper");
        }
        on_signal.cancel();
    });

    out.text(format!(
        "Sweeping every {}s for leases outliving {}s (Ctrl-C to stop)",
        interval.as_secs(),
        max_age.as_secs()
    ));
    let total = reaper.run(cancel).await;

    out.text(format!("Removed {} lease(s) in total", total));
    out.json(json!({
        "cleaned": total,
        "interval_secs": interval.as_secs(),
        "max_age_secs": max_age.as_secs(),
    }));
    Ok(())
}

async fn cmd_hold(
    manager: &LockManager,
    record_id: &str,
    ttl: Option<u64>,
    hold_for: Option<u64>,
    out: Output,
) -> anyhow::Result<()> {
    let ttl = secs_or(ttl, manager.config().default_ttl);
    let hold_for = hold_for.map(Duration::from_secs);
    if let Some(hold_for) = hold_for {
        if hold_for > ttl {
            warn!(
                ttl_secs = ttl.as_secs(),
                hold_secs = hold_for.as_secs(),
                "Holding longer than the lease TTL; the lease will expire first"
            );
        }
    }

    let mut lease = manager.lock(record_id, ttl).await?;
    let token = lease
        .token()
        .map(|t| t.to_string())
        .unwrap_or_default();

    out.text(format!("Holding {}", lease.key()));
    out.text(format!("  Token: {}", token));
    out.text(format!("  TTL: {}s", lease.ttl().as_secs()));
    out.json(json!({
        "record_id": record_id,
        "key": lease.key().as_str(),
        "token": token,
        "ttl_secs": lease.ttl().as_secs(),
    }));

    match hold_for {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupt received, releasing early"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    let held_ms = lease.held_for().map(|d| d.as_millis() as u64).unwrap_or(0);
    lease.release().await?;
    out.text(format!("Released {} after {}ms", lease.key(), held_ms));
    Ok(())
}
