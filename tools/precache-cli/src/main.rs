//! Deployment checker for the precache offline agent.
//!
//! ## Usage
//!
//! ```bash
//! # Validate a config and list the cache generation and assets
//! precache validate --config precache.json
//!
//! # Install and activate against the live origin, then resolve URLs
//! precache check --config precache.json https://example.com/app/app.js
//!
//! # Send a control message once the agent is active
//! precache check --config precache.json --message '{"type":"FORCE_CACHE_REFRESH"}'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use precache_common::{init_logging, LogConfig, LogFormat};
use precache_net::{HttpFetcher, LoaderConfig, Request};
use precache_sw::{
    AgentConfig, CacheAgent, ClientRegistry, FetchOutcome, MemoryCacheStore, Registration,
    ResponseSource,
};
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "precache")]
#[command(about = "Check a precache deployment against its origin")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a config file
    Validate {
        /// Agent config (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Install and activate an agent, then resolve URLs through it
    Check {
        /// Agent config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Control message (JSON) to post to the active agent
        #[arg(short, long)]
        message: Option<String>,
        /// Per-request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// URLs to resolve after activation
        urls: Vec<Url>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))
        .context("failed to initialize logging")?;

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Check {
            config,
            message,
            timeout,
            urls,
        } => check(&config, message.as_deref(), timeout, urls).await,
    }
}

fn load(path: &Path) -> Result<AgentConfig> {
    AgentConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let config = load(path)?;

    println!("Cache:  {}", config.versions()?.cache_name());
    println!("Scope:  {}", config.scope);
    println!("Policy: {:?}", config.policy);
    println!("Assets:");
    for asset in config.resolved_assets()? {
        println!("  {asset}");
    }
    Ok(())
}

async fn check(path: &Path, message: Option<&str>, timeout: u64, urls: Vec<Url>) -> Result<()> {
    let config = load(path)?;
    let payload = message
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--message is not valid JSON")?;

    let loader = LoaderConfig {
        timeout: Some(std::time::Duration::from_secs(timeout)),
        ..Default::default()
    };
    let network = Arc::new(HttpFetcher::new(loader)?.with_scope(&config.scope));
    let store = Arc::new(MemoryCacheStore::new(network.clone()));
    let clients = Arc::new(ClientRegistry::new(config.scope.clone()));
    let registration = Registration::new(config.scope.clone());

    let agent = Arc::new(
        CacheAgent::builder(config)
            .network(network)
            .store(store)
            .clients(clients)
            .build()?,
    );
    let cache_name = agent.versions().cache_name().to_string();

    registration
        .register(agent.clone())
        .await
        .with_context(|| format!("installing {cache_name}"))?;
    if registration.active().await.is_none() {
        registration.activate_waiting().await?;
    }
    info!(agent = %agent.id(), state = ?agent.state(), "Agent ready");
    println!("Installed and activated {cache_name}");

    if let Some(payload) = payload {
        registration.post_message(&payload).await?;
        println!("Posted {payload}");
    }

    let mut failures = 0;
    for url in urls {
        match registration.handle_fetch(Request::get(url.clone())).await {
            Ok(FetchOutcome::Respond { response, source }) => {
                let from = match source {
                    ResponseSource::Cache => "cache",
                    ResponseSource::Network => "network",
                };
                println!(
                    "{url}  {}  {} bytes from {from}",
                    response.status,
                    response.body().len()
                );
            }
            Ok(FetchOutcome::PassThrough(_)) => println!("{url}  not intercepted"),
            Err(e) => {
                failures += 1;
                println!("{url}  error: {e}");
            }
        }
    }
    agent.settle().await;

    if failures > 0 {
        anyhow::bail!("{failures} URL(s) failed to resolve");
    }
    Ok(())
}
