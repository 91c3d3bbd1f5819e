mod command;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use switchboard::{CallEvent, Client, ClientConfig, ClientHandle, MessageChannel, PeerId};

use crate::command::{Command, HELP};

#[derive(Parser, Debug)]
#[command(name = "switchboard-peer")]
#[command(about = "Terminal peer: list peers, place calls and chat over the message channel")]
struct Cli {
    /// Relay websocket endpoint (overrides SWITCHBOARD_RELAY_URL)
    #[arg(long)]
    relay: Option<String>,

    /// Identity to announce to the relay
    #[arg(long, env = "SWITCHBOARD_PEER_ID")]
    id: String,

    /// Peer to call as soon as it shows up in the peer list
    #[arg(long)]
    call: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env().context("invalid client configuration")?;
    if let Some(relay) = cli.relay.as_deref() {
        config = config.with_relay_url(relay).context("invalid --relay")?;
    }

    let (client, mut events) = Client::connect(config, &cli.id)
        .await
        .context("failed to reach the relay")?;
    println!("{HELP}");

    let mut peer = Peer {
        client: client.clone(),
        active: None,
        pending_call: cli.call,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !peer.handle_command(Command::parse(&line)).await {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                peer.handle_event(event).await;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

struct Peer {
    client: ClientHandle,
    active: Option<(PeerId, MessageChannel)>,
    pending_call: Option<String>,
}

impl Peer {
    /// Returns false when the user asked to quit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Empty => {}
            Command::Quit => return false,
            Command::Peers => {
                if let Err(err) = self.client.refresh_peers() {
                    println!("! {err}");
                }
            }
            Command::Call(target) => self.call(&target).await,
            Command::HangUp(target) => {
                let target = target.or_else(|| self.active.as_ref().map(|(peer, _)| peer.to_string()));
                match target {
                    Some(target) => {
                        if let Err(err) = self.client.hang_up(&target) {
                            println!("! {err}");
                        }
                    }
                    None => println!("! no active call"),
                }
            }
            Command::Say(text) => match &self.active {
                Some((peer, channel)) => {
                    if let Err(err) = channel.send_text(&text).await {
                        println!("! cannot send to {peer}: {err}");
                    }
                }
                None => println!("! no open channel; /call someone first"),
            },
            Command::Unknown(line) => println!("! unknown command {line:?}; {HELP}"),
        }
        true
    }

    async fn call(&mut self, target: &str) {
        match self.client.call(target).await {
            Ok(_) => println!("* calling {target}"),
            Err(err) => println!("! cannot call {target}: {err}"),
        }
    }

    async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::RelayConnected { identity } => println!("* connected as {identity}"),
            CallEvent::RelayDisconnected { reason } => match reason {
                Some(reason) => println!("* relay lost: {reason}"),
                None => println!("* relay disconnected"),
            },
            CallEvent::PeersUpdated(peers) => {
                if peers.is_empty() {
                    println!("* nobody else is online");
                } else {
                    let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
                    println!("* online: {}", names.join(", "));
                }
                let listed = self
                    .pending_call
                    .as_deref()
                    .is_some_and(|target| peers.iter().any(|peer| peer.as_str() == target));
                if listed {
                    if let Some(target) = self.pending_call.take() {
                        self.call(&target).await;
                    }
                }
            }
            CallEvent::CallIncoming { peer } => println!("* incoming call from {peer}"),
            CallEvent::CallConnected { peer } => println!("* connected to {peer}"),
            CallEvent::ChannelReady { peer, channel } => {
                println!("* chat with {peer} is open");
                self.active = Some((peer, channel));
            }
            CallEvent::MessageReceived { peer, payload } => {
                println!("{peer}> {}", String::from_utf8_lossy(&payload));
            }
            CallEvent::RemoteTrack { peer, track } => {
                let kind = track.kind.map(|kind| kind.to_string()).unwrap_or_else(|| "unknown".into());
                println!("* {peer} is sending {kind}");
            }
            CallEvent::StatusChanged { peer, state } => {
                tracing::debug!(peer = %peer, state = %state, "session state");
            }
            CallEvent::CallClosed { peer, reason } => {
                println!("* call with {peer} closed: {reason}");
                if self.active.as_ref().is_some_and(|(active, _)| *active == peer) {
                    self.active = None;
                }
            }
        }
    }
}
