//! CLI for relaysub
//!
//! Subcommands:
//! - `serve`: run both transports until Ctrl-C
//! - `send`: write one packet to a broker (line or `--ws`) and print the reply

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use relaysub::broker::{Broker, BrokerEvent};
use relaysub::client::remote::{REPLY_TIMEOUT, send_frame_packet, send_packet};
use relaysub::config::load_config;
use relaysub::transport::{FrameServer, LineServer};
use relaysub::utils::logging;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "relaysub", version, about = "Line + WebSocket pub/sub broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the line and frame servers
    Serve {
        /// Override the configured line (TCP) port
        #[arg(long)]
        line_port: Option<u16>,
        /// Override the configured frame (WebSocket) port
        #[arg(long)]
        frame_port: Option<u16>,
    },
    /// Send a single packet and print the first reply, if any
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5051)]
        port: u16,
        /// SUB, UNSUB or PUB
        #[arg(long, default_value = "PUB")]
        action: String,
        #[arg(long)]
        topic: String,
        /// JSON payload for PUB
        #[arg(long)]
        data: Option<String>,
        /// Seconds to wait for a reply
        #[arg(long, default_value_t = REPLY_TIMEOUT.as_secs_f64())]
        wait: f64,
        /// Speak WebSocket instead of the line protocol
        #[arg(long)]
        ws: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            line_port,
            frame_port,
        } => {
            if let Err(e) = run_server(line_port, frame_port).await {
                error!("Server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Send {
            host,
            port,
            action,
            topic,
            data,
            wait,
            ws,
        } => {
            logging::init("warn");
            if let Err(e) = run_send(&host, port, &action, &topic, data.as_deref(), wait, ws).await
            {
                eprintln!("send failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(
    line_port: Option<u16>,
    frame_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config()?;
    logging::init(&config.logging.level);
    if let Some(port) = line_port {
        config.server.line_port = port;
    }
    if let Some(port) = frame_port {
        config.server.frame_port = port;
    }

    let broker = Arc::new(Broker::new(&config.broker));
    let mut events = broker.subscribe_events();

    let mut line = LineServer::start(
        broker.clone(),
        &config.line_addr(),
        Duration::from_millis(config.broker.read_poll_ms),
    )?;
    let mut frame = FrameServer::start(broker.clone(), &config.frame_addr())?;
    info!(
        line = %line.local_addr(),
        frame = %frame.local_addr(),
        wildcard = ?config.broker.wildcard,
        "broker running"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
            event = events.recv() => match event {
                Ok(BrokerEvent::Published { topic, delivered, .. }) => {
                    info!("PUBLISHED {topic} -> {delivered} line subscribers");
                }
                Ok(BrokerEvent::ClientDisconnect { .. }) => {
                    for snap in broker.connections() {
                        info!("  {snap}");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("event stream lagged by {n}"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    // stopping may block on thread joins
    tokio::task::spawn_blocking(move || {
        frame.stop();
        line.stop();
    })
    .await?;
    Ok(())
}

async fn run_send(
    host: &str,
    port: u16,
    action: &str,
    topic: &str,
    data: Option<&str>,
    wait: f64,
    ws: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut packet = json!({ "action": action.to_uppercase(), "topic": topic });
    if let Some(raw) = data {
        let data: Value = serde_json::from_str(raw)?;
        packet["data"] = data;
    }

    let addr = format!("{host}:{port}");
    let wait = Duration::from_secs_f64(wait.max(0.0));
    let reply = if ws {
        send_frame_packet(&addr, &packet, wait).await?
    } else {
        send_packet(&addr, &packet, wait).await?
    };
    match reply {
        Some(reply) => println!("{reply}"),
        None => println!("(no reply)"),
    }
    Ok(())
}
