use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{MessageType, WsMessage};

#[derive(Parser, Debug)]
#[command(name = "mirage")]
#[command(about = "Session-multiplexed HTTP execution gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port
    #[arg(long)]
    pub port: Option<u16>,

    /// Server-wide cap on simultaneous in-flight REST requests
    #[arg(long)]
    pub max_concurrent_requests: Option<usize>,

    /// REST request timeout in seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Flags override the environment-derived configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max) = self.max_concurrent_requests {
            config.max_concurrent_requests = max;
        }
        if let Some(secs) = self.request_timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running gateway over WebSocket and issue one command
    Client {
        /// Gateway WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,

        #[command(subcommand)]
        command: ClientCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClientCommands {
    /// Ask the gateway for its health summary
    Health,

    /// Create a session and fetch one URL through it
    Get {
        /// URL to fetch
        url: String,

        /// Proxy applied to the throwaway session
        #[arg(long)]
        proxy: Option<String>,
    },
}

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run_client(url: String, command: ClientCommands) -> Result<()> {
    debug!("connecting to {url}");
    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(anyhow!("connection to {url} failed: {e}")),
        Err(_) => bail!("connection timeout - is the gateway running?"),
    };
    let (mut write, mut read) = ws_stream.split();

    match command {
        ClientCommands::Health => {
            let id = correlation_id();
            send(&mut write, &WsMessage::new(MessageType::Health, id.clone(), None)).await?;
            let reply = await_reply(&mut read, &id).await?;
            print_reply(&reply)?;
        }
        ClientCommands::Get { url, proxy } => {
            let create_id = correlation_id();
            let config = match proxy {
                Some(proxy) => json!({ "proxy": proxy }),
                None => json!({}),
            };
            send(
                &mut write,
                &WsMessage::new(MessageType::CreateSession, create_id.clone(), Some(config)),
            )
            .await?;
            let created = await_reply(&mut read, &create_id).await?;
            if created.kind == MessageType::Error {
                print_reply(&created)?;
                bail!("session creation failed");
            }

            let request_id = correlation_id();
            send(
                &mut write,
                &WsMessage::new(
                    MessageType::Request,
                    request_id.clone(),
                    Some(json!({ "method": "GET", "url": url })),
                ),
            )
            .await?;
            let reply = await_reply(&mut read, &request_id).await?;
            print_reply(&reply)?;
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

async fn send(
    write: &mut futures_util::stream::SplitSink<WsClient, Message>,
    message: &WsMessage,
) -> Result<()> {
    let text = serde_json::to_string(message)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Reads until the reply correlated with `id` arrives, answering heartbeats
/// along the way.
async fn await_reply(
    read: &mut futures_util::stream::SplitStream<WsClient>,
    id: &str,
) -> Result<WsMessage> {
    timeout(Duration::from_secs(30), async {
        while let Some(frame) = read.next().await {
            let frame = frame?;
            let Message::Text(text) = frame else { continue };
            let message: WsMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    debug!("skipping unparseable frame: {e}");
                    continue;
                }
            };
            match message.kind {
                MessageType::Ping | MessageType::Session => continue,
                _ if message.id == id => return Ok(message),
                _ => continue,
            }
        }
        bail!("connection closed before a reply arrived")
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for a reply"))?
}

fn print_reply(message: &WsMessage) -> Result<()> {
    match &message.payload {
        Some(payload) => println!("{}", serde_json::to_string_pretty(payload)?),
        None => println!("({:?} with no payload)", message.kind),
    }
    Ok(())
}
