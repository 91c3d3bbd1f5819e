use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "switchboard-relay")]
#[command(about = "Relay that forwards negotiation envelopes between switchboard peers")]
pub struct Cli {
    /// Address to listen on (overrides SWITCHBOARD_RELAY_BIND)
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}
