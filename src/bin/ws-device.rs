//! Device WebSocket server.
//!
//! Serves one WebSocket client at a time and echoes every text frame back
//! through the live connection.

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tower_service::Service;
use tracing::{error, info};

use ws_device::{dispatch, Config, Endpoint, Error, LiveConnection, Message, SendError, Server};

/// Exit status asking the supervisor for a restart.
const EXIT_RESTART: i32 = 75;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "WS_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port, overrides the configuration file
    #[arg(short, long, env = "WS_DEVICE_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "WS_DEVICE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Logs each text message and sends it back to the peer.
struct Echo {
    live: LiveConnection,
}

impl Service<Message> for Echo {
    type Response = ();
    type Error = SendError;
    type Future = Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), SendError>> {
        Ok(()).into()
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let live = self.live.clone();

        Box::pin(async move {
            info!(
                connection = %message.connection,
                text = %String::from_utf8_lossy(&message.payload),
                "text received"
            );

            match live.send_text(&message.payload).await {
                Err(SendError::NotConnected) => Ok(()),
                res => res,
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;

    let (mailbox, inbox) = config.mailbox();
    let endpoint = Endpoint::from_config(&config, mailbox);
    let live = endpoint.live_connection().clone();
    tokio::spawn(dispatch::drain(inbox, Echo { live }));

    let server = Server::bind(&config, endpoint)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr()))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server.local_addr()?,
        "websocket server listening"
    );

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            futures::future::pending::<()>().await;
        }
    };

    match server.run_until(shutdown).await {
        Ok(()) => Ok(()),
        Err(Error::Exhausted(err)) => {
            error!(error = %err, "payload memory exhausted, requesting restart");
            std::process::exit(EXIT_RESTART);
        }
        Err(err) => Err(err).context("Server failed"),
    }
}
