//! Storage network node daemon.
//!
//! Provides:
//! - Overlay participation (signed RPC, routing, tunneling)
//! - Shard storage and serving under signed contracts
//! - The contract market farmer loop
//! - Data-channel shard transfer

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use storj_core::{Config, KeyPair};
use storj_net::{LocalOverlay, Network, NetworkOptions};
use storj_proto::Contact;
use storj_store::{FsAdapter, KvAdapter, MemoryAdapter, StorageAdapter};

/// Storage node daemon.
#[derive(Parser)]
#[command(name = "storjd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.storjd/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Run {
        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Offer storage on published contracts
        #[arg(long)]
        farm: bool,
    },

    /// Show node status
    Status,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// Node identity key path
    identity_file: PathBuf,
    /// Listen address
    listen_addr: String,
    /// Address advertised to peers
    advertise_address: Option<String>,
    /// Seed contact URIs
    seeds: Vec<String>,
    /// Data directory
    data_dir: PathBuf,
    /// Storage backend: "kv", "fs", or "memory"
    backend: String,
    /// Capacity offered to the network, in gigabytes
    capacity_gb: u64,
    /// Whether to farm by default
    farm: bool,
    /// Relay slots offered when publicly reachable
    tunnel_slots: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity_file: PathBuf::from("~/.storjd/identity.key"),
            listen_addr: "0.0.0.0:4000".to_string(),
            advertise_address: None,
            seeds: Vec::new(),
            data_dir: PathBuf::from("~/.storjd/shards"),
            backend: "kv".to_string(),
            capacity_gb: 8,
            farm: false,
            tunnel_slots: 0,
        }
    }
}

/// Load configuration from a TOML file.
fn load_config(path: &PathBuf) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    let mut config = DaemonConfig::default();

    if let Some(node) = toml.get("node") {
        if let Some(identity) = node.get("identity_file").and_then(|v| v.as_str()) {
            config.identity_file = PathBuf::from(identity);
        }
        if let Some(farm) = node.get("farm").and_then(|v| v.as_bool()) {
            config.farm = farm;
        }
        if let Some(slots) = node.get("tunnel_slots").and_then(|v| v.as_integer()) {
            config.tunnel_slots = slots.max(0) as usize;
        }
    }

    if let Some(network) = toml.get("network") {
        if let Some(listen) = network.get("listen").and_then(|v| v.as_str()) {
            config.listen_addr = listen.to_string();
        }
        if let Some(advertise) = network.get("advertise").and_then(|v| v.as_str()) {
            config.advertise_address = Some(advertise.to_string());
        }
        if let Some(seeds) = network.get("seeds").and_then(|v| v.as_array()) {
            config.seeds = seeds
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
    }

    if let Some(storage) = toml.get("storage") {
        if let Some(data_dir) = storage.get("data_dir").and_then(|v| v.as_str()) {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(backend) = storage.get("backend").and_then(|v| v.as_str()) {
            config.backend = backend.to_string();
        }
        if let Some(capacity) = storage.get("capacity_gb").and_then(|v| v.as_integer()) {
            config.capacity_gb = capacity.max(0) as u64;
        }
    }

    Ok(config)
}

/// Expand ~ to the home directory.
fn expand_tilde(path: &PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    path.clone()
}

/// Load or generate the node identity.
fn load_identity(path: &PathBuf) -> Result<KeyPair> {
    let path = expand_tilde(path);

    if path.exists() {
        let content = std::fs::read_to_string(&path).context("Failed to read identity file")?;

        for line in content.lines() {
            if let Some(hex_key) = line.strip_prefix("private: ") {
                let keypair =
                    KeyPair::from_hex(hex_key.trim()).context("Invalid private key in identity file")?;
                return Ok(keypair);
            }
        }
        anyhow::bail!("No private key found in identity file");
    }

    info!("Generating new node identity");
    let keypair = KeyPair::generate();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create identity directory")?;
    }
    let key_data = format!(
        "# Node Identity Key\n# Node ID: {}\nprivate: {}\npublic: {}\n",
        keypair.node_id().to_hex(),
        keypair.secret_hex(),
        hex::encode(keypair.public_key_bytes()),
    );
    std::fs::write(&path, key_data).context("Failed to write identity file")?;

    info!("Saved new identity to {:?}", path);
    Ok(keypair)
}

/// Open the configured storage backend.
fn open_adapter(config: &DaemonConfig) -> Result<Arc<dyn StorageAdapter>> {
    let data_dir = expand_tilde(&config.data_dir);
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    Ok(match config.backend.as_str() {
        "memory" => Arc::new(MemoryAdapter::new()),
        "fs" => Arc::new(FsAdapter::open(&data_dir).context("Failed to open shard directory")?),
        "kv" => Arc::new(KvAdapter::open(&data_dir).context("Failed to open shard database")?),
        other => anyhow::bail!("Unknown storage backend: {other}"),
    })
}

fn parse_seeds(uris: &[String]) -> Vec<Contact> {
    uris.iter()
        .filter_map(|uri| match Contact::from_uri(uri) {
            Ok(contact) => Some(contact),
            Err(e) => {
                warn!(uri = %uri, error = %e, "Ignoring invalid seed URI");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let mut daemon_config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run {
        listen: None,
        farm: false,
    }) {
        Commands::Run { listen, farm } => {
            if let Some(addr) = listen {
                daemon_config.listen_addr = addr;
            }
            daemon_config.farm |= farm;

            let keypair = load_identity(&daemon_config.identity_file)?;
            info!("Node ID: {}", keypair.node_id().to_hex());

            let adapter = open_adapter(&daemon_config)?;

            let mut config = Config::from_env();
            config.max_capacity = daemon_config.capacity_gb * 1024 * 1024 * 1024;
            config.max_tunnel_slots = daemon_config.tunnel_slots;

            let options = NetworkOptions {
                listen_addr: daemon_config.listen_addr.clone(),
                advertise_address: daemon_config.advertise_address.clone(),
                farm: daemon_config.farm,
                seeds: parse_seeds(&daemon_config.seeds),
            };

            let network = Network::create(
                keypair,
                adapter,
                Arc::new(LocalOverlay::new()),
                config,
                options,
            )
            .await
            .context("Failed to create node")?;

            network.join().await.context("Failed to join overlay")?;

            println!("storjd running");
            println!("  Contact: {}", network.contact());
            println!("  Farming: {}", daemon_config.farm);
            println!();
            println!("Press Ctrl+C to stop");

            signal::ctrl_c().await.context("Signal handler failed")?;
            info!("Received shutdown signal");

            network.leave().await;
            info!("Daemon stopped");
        }

        Commands::Status => {
            let keypair = load_identity(&daemon_config.identity_file)?;
            let adapter = open_adapter(&daemon_config)?;

            println!("storjd status");
            println!("=============");
            println!();
            println!("Node ID: {}", keypair.node_id().to_hex());
            println!("Listen:  {}", daemon_config.listen_addr);
            println!("Backend: {}", daemon_config.backend);

            let keys = adapter.keys().await.unwrap_or_default();
            let size = adapter.size().await.unwrap_or(0);
            println!("Shards:  {}", keys.len());
            println!("Bytes:   {}", size);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = PathBuf::from("~/.storjd/config.toml");
        let expanded = expand_tilde(&path);

        if let Some(home) = dirs::home_dir() {
            assert!(expanded.starts_with(&home));
            assert!(expanded.ends_with(".storjd/config.toml"));
        }
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.backend, "kv");
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn test_parse_seeds_skips_invalid() {
        let id = "00".repeat(20);
        let seeds = vec![
            format!("storj://198.51.100.4:4000/{id}"),
            "not-a-uri".to_string(),
        ];
        let contacts = parse_seeds(&seeds);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].port, 4000);
    }
}
