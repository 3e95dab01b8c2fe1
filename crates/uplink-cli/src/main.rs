//! Standalone runner for the uplink agent.
//!
//! Connects to the relay with an in-memory store behind it. Real
//! deployments embed `uplink-agent` as a library and plug in their own
//! [`uplink_agent::Store`] implementation; this binary exists to exercise
//! a relay endpoint and app key end to end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uplink_agent::session::generate_session_id;
use uplink_agent::store::CallOptions;
use uplink_agent::{AgentConfig, MemoryStore, Store, Supervisor, Termination, WsDialer};

#[derive(Parser)]
#[command(name = "uplink", version, about = "Cloud relay agent")]
struct Cli {
    /// Path to the TOML config file
    #[arg(
        short,
        long,
        global = true,
        default_value = "~/.config/uplink/config.toml"
    )]
    config: String,

    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the relay and serve remote sessions
    Run {
        /// Relay endpoint override
        #[arg(long)]
        url: Option<String>,
        /// App key override
        #[arg(long)]
        apikey: Option<String>,
    },
    /// Validate the config file and print the resolved endpoint
    CheckConfig,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn load_config(
    path: &PathBuf,
    url: Option<String>,
    apikey: Option<String>,
) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    if url.is_some() {
        config.relay.url = url;
    }
    if let Some(apikey) = apikey {
        config.relay.apikey = apikey;
    }
    config.normalize().context("invalid configuration")?;
    Ok(config)
}

async fn run(path: &PathBuf, url: Option<String>, apikey: Option<String>) -> Result<()> {
    let mut config = load_config(path, url, apikey)?;
    if config.relay.uuid.is_none() {
        // the in-memory store has no installation uuid to read
        let uuid = generate_session_id();
        warn!(uuid = %uuid, "no uuid configured, using a generated one");
        config.relay.uuid = Some(uuid);
    }

    let (events_tx, events_rx) = unbounded_channel();
    let store = MemoryStore::with_events(events_tx);
    store
        .seed_object(
            &config.session.instance,
            json!({"common": {"enabled": true}, "native": {}}),
        )
        .await;
    let _ = store
        .set_state(
            &format!("{}.info.connection", config.namespace()),
            json!({"val": false, "ack": true}),
            &CallOptions::default(),
        )
        .await;

    info!(endpoint = %config.endpoint(), "starting uplink agent");
    let (supervisor, shutdown) = Supervisor::new(config, store, WsDialer, events_rx);
    let mut task = tokio::spawn(supervisor.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            shutdown.shutdown();
            task.await.context("supervisor panicked")??;
        }
        result = &mut task => {
            match result.context("supervisor panicked")?? {
                Termination::Stopped { reason } => {
                    warn!(reason = ?reason, "agent stopped by relay");
                }
                Termination::Shutdown => {}
            }
        }
    }
    Ok(())
}

fn check_config(path: &PathBuf) -> Result<()> {
    let config = load_config(path, None, None)?;
    println!("config ok");
    println!("endpoint:  {}", config.endpoint());
    println!(
        "tier:      {}",
        if config.is_premium() { "premium" } else { "standard" }
    );
    println!("instance:  {}", config.session.instance);
    println!("whitelist: {} entries", config.access.whitelist.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let path = expand_tilde(&cli.config);

    match cli.command {
        Command::Run { url, apikey } => run(&path, url, apikey).await,
        Command::CheckConfig => check_config(&path),
    }
}
