//! Edgepact Agreement Bot Server
//!
//! Wires the agreement bot core to its collaborators and runs it:
//! the exchange HTTP adapter, the ledger client factory, the worker
//! pool, the command router and the timer sweeps.
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! edgepact-agbotd
//!
//! # Start with a config file
//! edgepact-agbotd --config /etc/edgepact/agbotd.toml
//!
//! # Environment overrides
//! EDGEPACT__AGBOT__AGREEMENT_WORKERS=8 edgepact-agbotd
//! ```

mod config;
mod exchange;
mod ledger;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgepact_agbot::capabilities::LedgerProtocol;
use edgepact_agbot::handler::{ConsumerProtocolHandler, HandlerRegistry};
use edgepact_agbot::router::CommandRouter;
use edgepact_agbot::sweeps::SweepDriver;
use edgepact_agbot::worker::WorkerPool;
use edgepact_crypto::KeyPair;
use edgepact_store::MemoryStore;
use edgepact_types::NewLedgerClientRequest;

use crate::config::ServerConfig;
use crate::exchange::HttpExchange;
use crate::ledger::HttpLedgerFactory;

/// Edgepact agreement bot server
#[derive(Parser, Debug)]
#[command(name = "edgepact-agbotd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "EDGEPACT_CONFIG")]
    config: Option<String>,

    /// Exchange base URL
    #[arg(long, env = "EDGEPACT_EXCHANGE_URL")]
    exchange_url: Option<String>,

    /// Exchange identity of this bot
    #[arg(long, env = "EDGEPACT_BOT_ID")]
    bot_id: Option<String>,

    /// Exchange credential
    #[arg(long, env = "EDGEPACT_TOKEN")]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "EDGEPACT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (json, pretty)
    #[arg(long, env = "EDGEPACT_LOG_FORMAT", default_value = "pretty")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    if let Some(url) = args.exchange_url {
        server_config.agbot.exchange_url = url;
    }
    if let Some(bot_id) = args.bot_id {
        server_config.agbot.bot_id = bot_id;
    }
    if let Some(token) = args.token {
        server_config.agbot.token = token;
    }
    server_config.logging.level = args.log_level;
    server_config.logging.format = args.log_format;

    init_logging(&server_config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bot = %server_config.agbot.bot_id,
        "starting edgepact agreement bot"
    );

    // A missing signing key is fatal; nothing can be negotiated
    // without it.
    let keypair = load_keypair(&server_config)?;

    let agbot_config = server_config.agbot.clone();
    let exchange = Arc::new(HttpExchange::new(
        agbot_config.exchange_url.clone(),
        agbot_config.bot_id.clone(),
        agbot_config.token.clone(),
        keypair.clone(),
    ));
    let store = Arc::new(MemoryStore::new());
    let capabilities = Arc::new(LedgerProtocol::new(keypair));
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<NewLedgerClientRequest>();

    let handler = ConsumerProtocolHandler::new(
        agbot_config.clone(),
        capabilities,
        store,
        exchange.clone(),
        Arc::new(HttpLedgerFactory),
        control_tx,
    );

    let mut registry = HandlerRegistry::new();
    registry.register(handler.clone());
    let registry = Arc::new(registry);
    let router = Arc::new(CommandRouter::new(registry));

    // Worker pool and timer driver.
    let pool = WorkerPool::start(handler.clone(), agbot_config.agreement_workers)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeps = tokio::spawn(SweepDriver::new(handler.clone(), shutdown_rx.clone()).run());

    // Ledger client instantiation requests go back out through the
    // exchange.
    let control_task = tokio::spawn(async move {
        while let Some(request) = control_rx.recv().await {
            tracing::info!(
                org = %request.ledger.org,
                kind = %request.ledger.kind,
                name = %request.ledger.name,
                "new ledger client container requested"
            );
        }
    });

    // Poll the exchange event feed and route everything inbound.
    let poller = {
        let router = router.clone();
        let exchange = exchange.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let poll_interval = Duration::from_secs(server_config.poll_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match exchange.poll_events().await {
                            Ok(events) => {
                                for event in events {
                                    router.route(event).await;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "event poll failed"),
                        }
                    }
                }
            }
        })
    };

    shutdown_signal().await;

    // Cooperative shutdown: stop accepting, stop the timers, let
    // every worker finish its current item.
    tracing::info!("shutting down");
    router.stop_accepting();
    let _ = shutdown_tx.send(true);
    let _ = poller.await;
    let _ = sweeps.await;
    pool.shutdown().await;
    control_task.abort();

    tracing::info!("shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = tracing_subscriber::registry().with(env_filter);
    match config.format.as_str() {
        "json" => subscriber.with(fmt::layer().json().with_target(true)).init(),
        _ => subscriber.with(fmt::layer().pretty().with_target(true)).init(),
    }
    Ok(())
}

/// Load the bot's Ed25519 signing key from disk.
fn load_keypair(config: &ServerConfig) -> anyhow::Result<KeyPair> {
    let raw = std::fs::read_to_string(&config.key_file).map_err(|e| {
        anyhow::anyhow!(
            "cannot read signing key {}: {}",
            config.key_file.display(),
            e
        )
    })?;
    let bytes = hex::decode(raw.trim())
        .map_err(|e| anyhow::anyhow!("signing key is not valid hex: {}", e))?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
    Ok(KeyPair::from_bytes(&key))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_overrides() {
        let args = Args::parse_from([
            "edgepact-agbotd",
            "--bot-id",
            "agbot-9",
            "--exchange-url",
            "http://exchange:8080",
        ]);
        assert_eq!(args.bot_id.as_deref(), Some("agbot-9"));
        assert_eq!(args.exchange_url.as_deref(), Some("http://exchange:8080"));
    }
}
