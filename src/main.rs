//! TSS node daemon.
//!
//! Brings up a node with the simulated MPC backend: p2p host, party
//! coordination, routing and storage are all real; the round arithmetic is
//! the deterministic simulation. Deployments with a production round
//! library supply their own [`tss_server::mpc::MpcFactory`].

mod cli;
mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tss_server::{Server, SimulatedMpc, TssServer};

use crate::cli::Cli;
use crate::config::AppConfig;

const NODE_KEY_FILE: &str = "node_key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut app_config = AppConfig::load(cli.config.as_deref())?;
    app_config.apply_cli(&cli);
    app_config.validate()?;

    let secret = load_or_create_node_key(&app_config.node.base_folder)?;

    let bootstrap_peers = app_config
        .network
        .bootstrap_peers
        .iter()
        .map(|addr| addr.parse().with_context(|| format!("bad peer addr {addr}")))
        .collect::<Result<Vec<_>>>()?;

    let server = TssServer::new(
        bootstrap_peers,
        app_config.network.port,
        &secret,
        &app_config.network.rendezvous,
        app_config.node.base_folder.clone(),
        app_config.tss_config(),
        None,
        app_config.network.external_ip.clone(),
        Arc::new(SimulatedMpc::new()),
    )
    .await
    .context("constructing tss server")?;

    server.start().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    info!(
        peer_id = server.local_peer_id(),
        pub_key = server.local_pub_key(),
        "node is up"
    );
    for addr in server.listen_addrs().await.unwrap_or_default() {
        info!(%addr, "listening");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    server.stop().await;
    Ok(())
}

/// The node's long-lived secp256k1 secret, created on first boot.
fn load_or_create_node_key(base_folder: &Path) -> Result<Vec<u8>> {
    std::fs::create_dir_all(base_folder)
        .with_context(|| format!("creating {}", base_folder.display()))?;
    let path = base_folder.join(NODE_KEY_FILE);
    if path.exists() {
        let encoded = std::fs::read_to_string(&path)?;
        let secret = hex::decode(encoded.trim()).context("node key is not hex")?;
        anyhow::ensure!(secret.len() == 32, "node key must be 32 bytes");
        return Ok(secret);
    }
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    std::fs::write(&path, hex::encode(secret))
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "generated a new node key");
    Ok(secret.to_vec())
}
