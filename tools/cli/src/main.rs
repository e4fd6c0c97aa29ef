//! offsync CLI - Command line interface for the offline sync core.
//!
//! This tool inspects and manipulates the persisted action queue and
//! response cache, and drains the queue against a remote API.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use offsync_app::{CoreConfig, OfflineCore, CONFIG_FILENAME};
use offsync_cache::CacheStore;
use offsync_common::{HttpMethod, Priority, SystemClock};
use offsync_storage::StorageBackend;
use offsync_sync::{ActionQueue, NewAction, SyncOutcome};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - Offline-first action queue and response cache")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (default: platform data dir).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pending actions and cache usage.
    Status,

    /// Queue an action for delivery.
    Enqueue {
        /// Action label (e.g., "create-sale").
        #[arg(short, long)]
        name: String,

        /// Endpoint relative to the API base URL.
        #[arg(short, long)]
        endpoint: String,

        /// HTTP method.
        #[arg(short, long, default_value = "POST")]
        method: HttpMethod,

        /// JSON request body.
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Priority: high, medium, or low.
        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// Cache keys to invalidate once delivered.
        #[arg(long, value_delimiter = ',')]
        invalidates: Vec<String>,
    },

    /// Deliver pending actions.
    Sync {
        /// API base URL (overrides the configuration file).
        #[arg(short, long)]
        base_url: Option<Url>,

        /// Treat the device as offline (nothing is sent).
        #[arg(long)]
        offline: bool,
    },

    /// Inspect or edit the response cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show entry count, size and age.
    Stats,

    /// Print a cached value.
    Get {
        key: String,

        /// Only return values younger than this (default: any age).
        #[arg(long)]
        max_age_ms: Option<u64>,
    },

    /// Store a JSON value.
    Set {
        key: String,

        /// JSON value.
        value: String,

        /// Time to live (default: configured default ttl).
        #[arg(long)]
        ttl_ms: Option<u64>,
    },

    /// Remove one entry.
    Remove { key: String },

    /// Remove entries older than the given age.
    Purge {
        #[arg(long)]
        max_age_ms: u64,
    },

    /// Remove every entry.
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a configuration file for the data directory.
    Init {
        /// API base URL.
        #[arg(short, long)]
        base_url: Option<Url>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    match cli.command {
        Commands::Status => cmd_status(&data_dir).await,

        Commands::Enqueue {
            name,
            endpoint,
            method,
            payload,
            priority,
            invalidates,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let action = NewAction::new(name, method, endpoint, payload)
                .with_priority(priority)
                .invalidating(invalidates);
            cmd_enqueue(&data_dir, action).await
        }

        Commands::Sync { base_url, offline } => cmd_sync(&data_dir, base_url, offline).await,

        Commands::Cache { command } => cmd_cache(&data_dir, command).await,

        Commands::Config { command } => match command {
            ConfigCommands::Init { base_url, force } => {
                cmd_config_init(&data_dir, base_url, force).await
            }
            ConfigCommands::Show => cmd_config_show(&data_dir).await,
        },

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "offsync", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("Could not determine the local data directory")?;
    Ok(base.join("offsync"))
}

/// Load the configuration file, or fall back to local storage in `data_dir`.
async fn load_config(data_dir: &Path) -> Result<CoreConfig> {
    let path = data_dir.join(CONFIG_FILENAME);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        CoreConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))
    } else {
        Ok(CoreConfig::local(data_dir))
    }
}

fn open_backend(config: &CoreConfig) -> Result<Arc<dyn StorageBackend>> {
    config.open_backend().context("Failed to open storage")
}

async fn open_queue(config: &CoreConfig) -> Result<ActionQueue> {
    ActionQueue::open(open_backend(config)?, Arc::new(SystemClock))
        .await
        .context("Failed to open action queue")
}

async fn open_cache(config: &CoreConfig) -> Result<CacheStore> {
    CacheStore::open(open_backend(config)?, Arc::new(SystemClock))
        .await
        .context("Failed to open cache")
}

/// Show pending actions and cache usage.
async fn cmd_status(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir).await?;
    let queue = open_queue(&config).await?;
    let cache = open_cache(&config).await?;

    let pending = queue.pending().await;
    println!("Data directory: {}", data_dir.display());
    println!("Pending actions: {}", pending.len());
    for action in &pending {
        println!(
            "  [{}] {} {} {} (attempts: {})",
            action.priority, action.action_name, action.method, action.endpoint, action.attempts
        );
        if let Some(error) = &action.last_error {
            println!("         last error: {}", error);
        }
    }

    let stats = cache.stats().await;
    println!("Cache entries: {} ({} bytes)", stats.count, stats.total_size);

    Ok(())
}

/// Queue an action.
async fn cmd_enqueue(data_dir: &Path, action: NewAction) -> Result<()> {
    info!("Queueing {} {}", action.method, action.endpoint);

    let config = load_config(data_dir).await?;
    let queue = open_queue(&config).await?;
    let id = queue
        .enqueue_action(action)
        .await
        .context("Failed to queue action")?;

    println!("Action queued: {}", id);
    println!("  Pending: {}", queue.size().await);

    Ok(())
}

/// Drain the queue once.
async fn cmd_sync(data_dir: &Path, base_url: Option<Url>, offline: bool) -> Result<()> {
    let mut config = load_config(data_dir).await?;
    if let Some(base_url) = base_url {
        config.transport.base_url = Some(base_url);
    }
    if config.transport.base_url.is_none() {
        anyhow::bail!("No API base URL. Pass --base-url or run `offsync config init --base-url <URL>`");
    }

    let core = OfflineCore::builder(config)
        .online(!offline)
        .init()
        .await
        .context("Failed to start offline core")?;

    match core.sync_all().await {
        Some(outcome) => print_outcome(&outcome),
        None => println!("A sync is already running."),
    }

    core.dispose().await;
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    if outcome.aborted_offline {
        println!("Offline, nothing was sent.");
    }
    println!("Sync finished in {} ms", outcome.duration.as_millis());
    println!("  Delivered: {}", outcome.succeeded);
    println!("  Retrying:  {}", outcome.retried);
    println!("  Failed:    {}", outcome.failed);
    println!("  Remaining: {}", outcome.remaining);
    for failure in &outcome.failures {
        println!(
            "  - {} {} ({}): {}",
            failure.action_name, failure.endpoint, failure.id, failure.reason
        );
    }
}

/// Cache subcommands.
async fn cmd_cache(data_dir: &Path, command: CacheCommands) -> Result<()> {
    let config = load_config(data_dir).await?;
    let cache = open_cache(&config).await?;

    match command {
        CacheCommands::Stats => {
            let stats = cache.stats().await;
            println!("Entries: {}", stats.count);
            println!("Total size: {} bytes", stats.total_size);
            for entry in stats.per_key {
                println!(
                    "  {} ({} bytes, {} s old)",
                    entry.key,
                    entry.size_bytes,
                    entry.age_ms / 1000
                );
            }
        }

        CacheCommands::Get { key, max_age_ms } => {
            let value = match max_age_ms {
                Some(ms) => cache.get(&key, Duration::from_millis(ms)).await,
                None => cache.get_entry(&key).await.map(|entry| {
                    if entry.stale {
                        eprintln!("(stale)");
                    }
                    entry.value
                }),
            };
            match value {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No cached value for '{}'", key),
            }
        }

        CacheCommands::Set { key, value, ttl_ms } => {
            let value: Value = serde_json::from_str(&value).context("Value is not valid JSON")?;
            let ttl = ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(config.cache.default_ttl);
            cache
                .set(key.clone(), value, ttl)
                .await
                .context("Failed to store value")?;
            println!("Cached: {}", key);
        }

        CacheCommands::Remove { key } => {
            if cache.remove(&key).await.context("Failed to remove entry")? {
                println!("Removed: {}", key);
            } else {
                println!("Not cached: {}", key);
            }
        }

        CacheCommands::Purge { max_age_ms } => {
            let purged = cache
                .purge_expired(Duration::from_millis(max_age_ms))
                .await
                .context("Failed to purge cache")?;
            println!("Purged {} entries", purged);
        }

        CacheCommands::Clear => {
            cache.clear().await.context("Failed to clear cache")?;
            println!("Cache cleared.");
        }
    }

    Ok(())
}

/// Write a configuration file.
async fn cmd_config_init(data_dir: &Path, base_url: Option<Url>, force: bool) -> Result<()> {
    let path = data_dir.join(CONFIG_FILENAME);
    if !force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut config = CoreConfig::local(data_dir);
    config.transport.base_url = base_url;
    config
        .save(&path)
        .await
        .context("Failed to write configuration")?;

    println!("Configuration written: {}", path.display());
    Ok(())
}

/// Print the effective configuration.
async fn cmd_config_show(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir).await?;
    println!("{}", config.to_json()?);
    Ok(())
}
