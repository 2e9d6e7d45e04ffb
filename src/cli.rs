use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::{CacheBackend, Config};

#[derive(Parser, Debug)]
#[command(name = "driftboard")]
#[command(about = "LAN clipboard board and WebRTC signaling server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides DRIFTBOARD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Board cache backend (overrides DRIFTBOARD_CACHE)
    #[arg(long, value_enum)]
    pub cache: Option<CacheBackend>,

    /// Redis connection URL (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running server as a peer and print the assigned
    /// display name and the current room roster
    Probe {
        /// Server base URL
        #[arg(short, long, default_value = "ws://localhost:18128")]
        url: String,
    },
}

impl Cli {
    /// Env config with CLI flags layered on top.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cache) = self.cache {
            config.cache = cache;
        }
        if let Some(redis_url) = &self.redis_url {
            config.redis_url = redis_url.clone();
        }
        config
    }
}

/// Debug client: upgrade like a browser peer would, report what the server
/// says about us and who else is in the room, then disconnect cleanly.
pub async fn run_probe(url: String) -> Result<()> {
    let ws_url = format!("{}/server/webrtc", url.trim_end_matches('/'));

    let (stream, _) = timeout(Duration::from_secs(5), connect_async(&ws_url))
        .await
        .context("connection timed out")?
        .with_context(|| format!("failed to connect to {}", ws_url))?;
    let (mut write, mut read) = stream.split();
    println!("connected to {}", ws_url);

    let mut saw_name = false;
    let mut saw_roster = false;
    while !(saw_name && saw_roster) {
        let frame = timeout(Duration::from_secs(5), read.next())
            .await
            .context("timed out waiting for server frames")?;
        let Some(frame) = frame else { break };
        let Message::Text(text) = frame? else {
            continue;
        };
        let value: Value = serde_json::from_str(&text)?;

        match value["type"].as_str() {
            Some("display-name") => {
                println!(
                    "you are: {} ({})",
                    value["message"]["displayName"].as_str().unwrap_or("?"),
                    value["message"]["deviceName"].as_str().unwrap_or("?"),
                );
                saw_name = true;
            }
            Some("peers") => {
                let peers = value["peers"].as_array().cloned().unwrap_or_default();
                println!("{} peer(s) in your room", peers.len());
                for peer in peers {
                    println!(
                        "  {}  {} ({})",
                        peer["id"].as_str().unwrap_or("?"),
                        peer["name"]["displayName"].as_str().unwrap_or("?"),
                        peer["name"]["deviceName"].as_str().unwrap_or("?"),
                    );
                }
                saw_roster = true;
            }
            _ => {}
        }
    }

    let disconnect = json!({"type": "disconnect"}).to_string();
    write.send(Message::Text(disconnect.into())).await?;
    write.send(Message::Close(None)).await?;
    Ok(())
}
