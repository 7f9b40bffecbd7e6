//! framelink command line.
//!
//! ```text
//! framelink listen [--config f] [--bind addr] [--plain]   echo server
//! framelink send <host:port> <message> [--plain] [--count n]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use framelink::config::loader::load_config;
use framelink::observability::init_logging;
use framelink::{Client, FramelinkConfig, Listener};

#[derive(Debug, Parser)]
#[command(name = "framelink", version, about = "Framed TCP sessions with confirmed delivery")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable end-to-end encryption.
    #[arg(long, global = true)]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept connections and echo every payload back.
    Listen {
        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Connect, send a message and print the echoes.
    Send {
        /// Target as host:port.
        target: String,
        message: String,
        /// How many times to send the message.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("framelink: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => FramelinkConfig::default(),
    };
    init_logging(&config.observability);

    let result = match cli.command {
        Command::Listen { bind } => listen(config, bind, cli.plain).await,
        Command::Send {
            target,
            message,
            count,
        } => send(config, &target, &message, count, cli.plain).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "framelink failed");
            ExitCode::FAILURE
        }
    }
}

async fn listen(mut config: FramelinkConfig, bind: Option<String>, plain: bool) -> framelink::Result<()> {
    if let Some(bind) = bind {
        config.listener.bind_address = bind;
    }
    if plain {
        config.listener.encrypted = false;
    }

    let listener = Listener::open(&config.listener, config.session.clone()).await?;
    tracing::info!(address = %listener.local_addr(), "framelink listening");

    loop {
        let client = tokio::select! {
            client = listener.next_client(None) => client?,
            _ = tokio::signal::ctrl_c() => break,
        };

        tokio::spawn(async move {
            let session = client.session_id().await.unwrap_or_default();
            tracing::info!(connection_id = %client.id(), peer_addr = ?client.remote_addr(), session_id = %session, "Client connected");

            while let Ok(Some(payload)) = client.get_payload(true).await {
                if let Err(e) = client.send_bytes(payload).await {
                    tracing::warn!(connection_id = %client.id(), error = %e, "Echo failed");
                    break;
                }
            }
            tracing::info!(connection_id = %client.id(), graceful = ?client.graceful_disconnect(), "Client gone");
        });
    }

    tracing::info!("Shutting down");
    listener.close();
    listener.disconnect_all().await;
    Ok(())
}

async fn send(config: FramelinkConfig, target: &str, message: &str, count: u32, plain: bool) -> framelink::Result<()> {
    let client = Client::new(config.session, !plain);
    client.connect_host(target, None).await?;
    println!("session {}", client.session_id().await?);

    for _ in 0..count {
        client.send_bytes(message.as_bytes()).await?;
        if let Some(echo) = client.get_payload(true).await? {
            println!("{}", String::from_utf8_lossy(&echo));
        }
    }

    let graceful = client.disconnect().await;
    println!("disconnected (graceful: {graceful})");
    client.dispose();
    Ok(())
}
