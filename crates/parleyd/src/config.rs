//! Configuration for parleyd

use clap::Parser;
use parley_core::{Metadata, PeerId, Profile};
use parley_net::{PeerBook, ProtocolConfig, RegistryConfig, SessionConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// parleyd - parley peer messaging daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "parleyd")]
#[command(about = "Encrypted peer-to-peer messaging and RPC daemon")]
pub struct Config {
    /// Our peer id
    #[arg(long, env = "PARLEY_ID")]
    pub id: String,

    /// Display name presented to peers
    #[arg(long)]
    pub name: Option<String>,

    /// Contact email presented to peers
    #[arg(long)]
    pub email: Option<String>,

    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Known peers (comma-separated id=host:port)
    #[arg(long, value_delimiter = ',', value_parser = PeerBook::parse_entry)]
    pub peers: Vec<(PeerId, SocketAddr)>,

    /// Shared passphrase for payload encryption
    #[arg(long, env = "PARLEY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,

    /// Directory for received resources
    #[arg(short, long, default_value = "./data/parleyd")]
    pub store_dir: PathBuf,

    /// Directories whose files may be sent as resources (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub share_dirs: Vec<PathBuf>,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "5")]
    pub max_retries: u32,

    /// Seconds to wait for an RPC reply
    #[arg(long, default_value = "30")]
    pub invoke_timeout_secs: u64,

    /// Send RPC arguments and results unencrypted
    #[arg(long)]
    pub plain_rpc: bool,

    /// Peers to ping once the endpoint is up (comma-separated ids)
    #[arg(long, value_delimiter = ',')]
    pub dial: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Peer id cannot be empty");
        }
        if self.passphrase.is_empty() {
            anyhow::bail!("Passphrase cannot be empty");
        }
        if self.invoke_timeout_secs == 0 {
            anyhow::bail!("Invoke timeout must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?} (expected json or pretty)", self.log_format);
        }
        for peer in &self.dial {
            if !self.peers.iter().any(|(id, _)| id.as_str() == peer) {
                anyhow::bail!("Cannot dial {}: not listed in --peers", peer);
            }
        }
        Ok(())
    }

    /// Metadata presented to peers
    pub fn metadata(&self) -> Metadata {
        let profile = Profile {
            uuid: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            email: self.email.clone(),
            avatar: None,
        };
        Metadata::new(self.id.as_str(), profile)
    }

    pub fn peer_book(&self) -> PeerBook {
        self.peers.iter().cloned().collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_retries: self.max_retries,
            protocol: ProtocolConfig {
                invoke_timeout: Duration::from_secs(self.invoke_timeout_secs),
                seal_rpc: !self.plain_rpc,
                ..ProtocolConfig::default()
            },
            registry: RegistryConfig::default(),
            ..SessionConfig::new(self.metadata())
        }
    }
}
