//! Layered node configuration: defaults, then an optional TOML file, then
//! environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use tss_types::TssConfig;

use crate::cli::Cli;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkSection,
    pub node: NodeSection,
    pub tss: TssSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub port: u16,
    pub rendezvous: String,
    pub bootstrap_peers: Vec<String>,
    pub external_ip: Option<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            port: 6668,
            rendezvous: "tss".to_string(),
            bootstrap_peers: Vec::new(),
            external_ip: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub base_folder: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            base_folder: PathBuf::from(".tss"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TssSection {
    pub keygen_timeout_secs: u64,
    pub keysign_timeout_secs: u64,
    pub party_timeout_secs: u64,
    pub pre_param_timeout_secs: u64,
    pub sig_notify_timeout_secs: u64,
    pub enable_monitor: bool,
}

impl Default for TssSection {
    fn default() -> Self {
        let defaults = TssConfig::default();
        Self {
            keygen_timeout_secs: defaults.keygen_timeout.as_secs(),
            keysign_timeout_secs: defaults.keysign_timeout.as_secs(),
            party_timeout_secs: defaults.party_timeout.as_secs(),
            pre_param_timeout_secs: defaults.pre_param_timeout.as_secs(),
            sig_notify_timeout_secs: defaults.sig_notify_timeout.as_secs(),
            enable_monitor: defaults.enable_monitor,
        }
    }
}

impl AppConfig {
    /// Load the file (when present) and apply `TSS_`-prefixed environment
    /// overrides, e.g. `TSS_NETWORK__PORT=7000`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TSS")
                .separator("__")
                .list_separator(",")
                .try_parsing(true),
        );
        let settings = builder.build().context("building configuration")?;
        settings
            .try_deserialize::<AppConfig>()
            .context("deserializing configuration")
    }

    /// Command-line flags win over file and environment.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.p2p_port != 6668 {
            self.network.port = cli.p2p_port;
        }
        if !cli.bootstrap_peers.is_empty() {
            self.network.bootstrap_peers = cli.bootstrap_peers.clone();
        }
        if cli.rendezvous != "tss" {
            self.network.rendezvous = cli.rendezvous.clone();
        }
        if cli.base_folder != PathBuf::from(".tss") {
            self.node.base_folder = cli.base_folder.clone();
        }
        if cli.external_ip.is_some() {
            self.network.external_ip = cli.external_ip.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.network.rendezvous.is_empty(),
            "rendezvous cannot be empty"
        );
        anyhow::ensure!(
            self.tss.party_timeout_secs > 0 && self.tss.keygen_timeout_secs > 0,
            "timeouts must be positive"
        );
        Ok(())
    }

    pub fn tss_config(&self) -> TssConfig {
        TssConfig {
            keygen_timeout: Duration::from_secs(self.tss.keygen_timeout_secs),
            keysign_timeout: Duration::from_secs(self.tss.keysign_timeout_secs),
            party_timeout: Duration::from_secs(self.tss.party_timeout_secs),
            pre_param_timeout: Duration::from_secs(self.tss.pre_param_timeout_secs),
            sig_notify_timeout: Duration::from_secs(self.tss.sig_notify_timeout_secs),
            enable_monitor: self.tss.enable_monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent_with_tss_config() {
        let app = AppConfig::default();
        let conf = app.tss_config();
        assert_eq!(conf.party_timeout, TssConfig::default().party_timeout);
        assert!(!conf.enable_monitor);
        app.validate().unwrap();
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[network]\nport = 7100\n[tss]\nenable_monitor = true\n",
        )
        .unwrap();
        let app = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(app.network.port, 7100);
        assert!(app.tss.enable_monitor);
        // Untouched sections keep their defaults.
        assert_eq!(app.network.rendezvous, "tss");
    }
}
