//! # vl-runner
//!
//! Demo entry point for the venue link client.
//!
//! Loads a JSON configuration file, connects to the venue, logs every push
//! event, optionally issues one command, and runs until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! vl-runner config.json --log-level info
//! vl-runner config.json --command getBalance --data '{"account":1}'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use vl_client::{Channel, ConnState, Message, VenueClient};
use vl_core::logging::{LogFormat, init_logging};

/// Venue Link Runner.
#[derive(Parser)]
#[command(name = "vl-runner", about = "Venue Link line-JSON client runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output (overrides the config file).
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit console logs as JSON.
    #[arg(long)]
    json_logs: bool,

    /// Command to issue once connected.
    #[arg(long)]
    command: Option<String>,

    /// JSON data for `--command`.
    #[arg(long, default_value = "{}", requires = "command")]
    data: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = vl_core::config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name(), format)?;

    info!("vl-runner starting — config={}, venue={}", cli.config.display(), config.client.address);

    // 3. Build the client and attach logging listeners
    let client = Arc::new(VenueClient::new(config.client)?);
    for channel in Channel::ALL {
        let name = client.channel_name(channel);
        client.on(channel, move |msg| log_event(&name, msg));
    }
    client.start()?;
    let settings = client.config();
    if !settings.subscribe.is_empty() {
        info!("[{}] auto-subscribe to {:?} after {:?}", settings.name, settings.subscribe, settings.subscribe_settle());
    }

    // 4. Optional one-shot command
    if let Some(command) = cli.command.as_deref() {
        let data: serde_json::Value = serde_json::from_str(&cli.data).context("--data is not valid JSON")?;
        let mut state = client.watch_state();
        state.wait_for(|s| *s == ConnState::Connected).await?;
        match client.call(command, data).await {
            Ok(reply) => info!("{command} -> {reply}"),
            Err(e) => error!("{command} failed: {e}"),
        }
    }

    info!("running — press Ctrl+C to stop");

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    client.dispose().await;
    info!("client disposed — goodbye");
    Ok(())
}

fn log_event(channel: &str, msg: &Message) {
    match msg {
        Message::Quote(q) => {
            info!("[{channel}] {} bid={} ask={} spread={:.5} ts={:?}", q.symbol, q.bid, q.ask, q.spread(), q.timestamp)
        }
        Message::Notify(n) => info!("[{channel}] {} ({}) token={} code={:?}", n.message, n.level, n.token, n.code),
        Message::UserEvent(e) => info!("[{channel}] {}: {}", e.event, e.body),
        Message::SymbolsReindex(v) | Message::SecurityReindex(v) => info!("[{channel}] {v}"),
        Message::Response { .. } | Message::Unknown(_) => {}
    }
}
