use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use portal_peer::telemetry::logging::{self, LogConfig, LogLevel};
use portal_peer::{PeerConfig, PeerId, PeerLayer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "portal-peer", about = "Join a rendezvous service and exchange messages with peers")]
struct Cli {
    /// Rendezvous host; overrides PORTAL_SIGNALING_HOST
    #[arg(long)]
    host: Option<String>,

    /// Rendezvous port; overrides PORTAL_SIGNALING_PORT
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// STUN/TURN url, repeatable; replaces PORTAL_ICE_SERVERS
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Peer to connect to once an id has been assigned; numeric input is
    /// taken as an integer id
    #[arg(long, short = 'c')]
    connect: Option<PeerId>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn peer_config(&self) -> PeerConfig {
        let mut config = PeerConfig::from_env();
        if let Some(host) = &self.host {
            config.signaling = portal_peer::SignalingEndpoint::new(host.clone(), config.signaling.port);
        }
        if let Some(port) = self.port {
            config.signaling.port = port;
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let layer = PeerLayer::new(cli.peer_config());
    let mut events = layer.subscribe();
    layer.fire_up().context("failed to start peer layer")?;
    eprintln!("connecting to {}", layer.config().signaling.url());

    let mut pending_connect = cli.connect.clone();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(event, portal_peer::PeerEvent::LocalIdentityAssigned { .. }) {
                        if let Some(target) = pending_connect.take() {
                            if let Err(err) = layer.connect_to_peer(target).await {
                                eprintln!("connect failed: {err}");
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => eprintln!("skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => {
                    for (peer, delivery) in layer.broadcast(line).await? {
                        eprintln!("{peer}: {delivery:?}");
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    layer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_target_keeps_numeric_ids_numeric() {
        let cli = Cli::try_parse_from(["portal-peer", "--connect", "42"]).unwrap();
        assert_eq!(cli.connect, Some(PeerId::from(42u64)));

        let cli = Cli::try_parse_from(["portal-peer", "-c", "peer-7"]).unwrap();
        assert_eq!(cli.connect, Some(PeerId::from("peer-7")));
    }
}
