//! Poolbot CLI
//!
//! Command-line interface for the account-pool chat bot

mod console;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poolbot_config::Config;
use poolbot_core::{bootstrap, credential_resolver, AccountPool, BotRuntime};
use poolbot_ipc::EventBus;
use poolbot_providers::OpenAICompatibleFactory;
use poolbot_storage::CredentialCache;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REDACTED: &str = "***REDACTED***";
const CONSOLE_REPLY_SLACK_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "poolbot")]
#[command(about = "Chat bot backed by a pool of upstream accounts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (defaults to core.log_level from the config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot in the foreground, reading messages from stdin
    Start,

    /// Resolve every account and show pool membership
    Accounts,

    /// Cached session credentials
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List identities with a cached credential
    List,
    /// Remove one cached credential, or all of them
    Clear {
        /// Account identity to forget
        identity: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the loaded config with secrets redacted
    Show,
    /// Load and validate the config
    Validate,
    /// Print the config path in use
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config)?;
            run_foreground(config, cli.log_level).await
        }
        Commands::Accounts => {
            let config = load_config(cli.config)?;
            init_short_logging(&config, cli.log_level.as_deref())?;
            show_accounts(&config).await
        }
        Commands::Cache { action } => {
            let config = load_config(cli.config)?;
            init_short_logging(&config, cli.log_level.as_deref())?;
            let cache = CredentialCache::load(config.cache_path()?);
            match action {
                CacheCommands::List => {
                    let keys = cache.keys().await;
                    if keys.is_empty() {
                        println!("No cached credentials ({})", cache.path().display());
                    } else {
                        println!("Cached credentials ({}):", cache.path().display());
                        for key in keys {
                            println!("  {}", key);
                        }
                    }
                }
                CacheCommands::Clear { identity: Some(identity) } => {
                    if cache.remove(&identity).await? {
                        println!("Removed cached credential for '{}'", identity);
                    } else {
                        println!("No cached credential for '{}'", identity);
                    }
                }
                CacheCommands::Clear { identity: None } => {
                    let removed = cache.clear().await?;
                    println!("Removed {} cached credential(s)", removed);
                }
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                let config = load_config(cli.config)?;
                print_redacted_config(&config)
            }
            ConfigCommands::Validate => {
                let path = config_path(cli.config)?;
                Config::load(&path)
                    .with_context(|| format!("Invalid config {}", path.display()))?;
                println!("Config OK: {}", path.display());
                Ok(())
            }
            ConfigCommands::Path => {
                let path = config_path(cli.config)?;
                let state = if path.exists() { "" } else { " (missing)" };
                println!("{}{}", path.display(), state);
                Ok(())
            }
        },
    }
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().context("No config file found"),
    }
}

fn load_config(config_path_arg: Option<String>) -> Result<Config> {
    let path = config_path(config_path_arg)?;
    Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn init_short_logging(config: &Config, log_level: Option<&str>) -> Result<()> {
    logging::init_stderr_logging(log_level.unwrap_or_else(|| config.log_level()))
}

async fn run_foreground(config: Config, log_level: Option<String>) -> Result<()> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let level = log_level.unwrap_or_else(|| config.log_level().to_string());
    let _guard = logging::init_logging(&data_dir.join("logs"), &level)?;

    info!(
        "Starting poolbot '{}' with {} configured account(s)",
        config.bot.name,
        config.accounts.len()
    );

    let cache = Arc::new(CredentialCache::load(config.cache_path()?));
    let resolver = Arc::new(credential_resolver(&config, cache)?);
    let factory = OpenAICompatibleFactory::new(&config.upstream.base_url, &config.upstream.model)?;
    let bot = bootstrap(&config, resolver, &factory).await?;

    let event_bus = EventBus::new();
    let runtime = BotRuntime::new(
        bot,
        event_bus.clone(),
        config.router.max_inbound_concurrency,
    );
    let inbound_rx = event_bus.subscribe();
    let runtime_task = tokio::spawn(async move { runtime.run(inbound_rx).await });

    let reply_timeout = console_reply_timeout(&config);
    tokio::select! {
        result = console::run(event_bus.clone(), reply_timeout) => {
            if let Err(err) = result {
                warn!("Console adapter stopped: {}", err);
            }
            info!("Input closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    drop(event_bus);
    runtime_task.abort();
    Ok(())
}

/// Upper bound on how long the console waits for one reply, covering every
/// attempt the router may make.
fn console_reply_timeout(config: &Config) -> Duration {
    let router = &config.router;
    let attempts = u64::from(router.retry.max_retries) + 1;
    let backoff_ms = router.retry.max_delay_ms * u64::from(router.retry.max_retries);
    Duration::from_secs(router.send_timeout_secs * attempts + CONSOLE_REPLY_SLACK_SECS)
        + Duration::from_millis(backoff_ms)
}

async fn show_accounts(config: &Config) -> Result<()> {
    let cache = Arc::new(CredentialCache::load(config.cache_path()?));
    let resolver = Arc::new(credential_resolver(config, cache)?);
    let factory = OpenAICompatibleFactory::new(&config.upstream.base_url, &config.upstream.model)?;
    let pool = AccountPool::initialize(&config.accounts, resolver, &factory).await;

    println!("Pool: {} usable / {} configured", pool.len(), config.accounts.len());
    for entry in pool.entries() {
        println!("  [ok]       {} ({})", entry.identity(), entry.source().label());
    }
    for excluded in pool.excluded() {
        println!("  [excluded] {}: {}", excluded.identity, excluded.reason);
    }

    pool.ensure_usable()?;
    Ok(())
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;

    if let Some(accounts) = value.get_mut("accounts").and_then(|a| a.as_array_mut()) {
        for account in accounts {
            for field in ["session_token", "password"] {
                if let Some(secret) = account.get_mut(field) {
                    if !secret.is_null() {
                        *secret = json!(REDACTED);
                    }
                }
            }
        }
    }

    Ok(value)
}

fn print_redacted_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&redacted_config(config)?)?);
    Ok(())
}
