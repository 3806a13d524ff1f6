use std::path::PathBuf;

use clap::Parser;

/// Threshold signature scheme node.
#[derive(Debug, Parser)]
#[command(name = "tss-node", version, about)]
pub struct Cli {
    /// TCP port for the p2p host; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 6668)]
    pub p2p_port: u16,

    /// Bootstrap peer multiaddr, repeatable (e.g. /ip4/1.2.3.4/tcp/6668/p2p/<peer-id>).
    #[arg(long = "peer")]
    pub bootstrap_peers: Vec<String>,

    /// Network namespace announced to peers.
    #[arg(long, default_value = "tss")]
    pub rendezvous: String,

    /// Where key shares, the node key and the address book live.
    #[arg(long, default_value = ".tss")]
    pub base_folder: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// External IP to announce, for nodes behind NAT.
    #[arg(long)]
    pub external_ip: Option<String>,

    /// Log filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
