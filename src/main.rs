//! PeerDB - Peer-to-Peer SQL Middleware
//!
//! Node binary: loads the static cluster configuration, connects the local
//! storage engine and runs one cluster node until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerdb::config::{default_config_path, LoggingConfig, PeerDbConfig, StorageEngine};
use peerdb::error::Result;
use peerdb::node::Node;
use peerdb::protocol::NodeId;
use peerdb::storage::{MariaDbStorage, MemoryStorage, StorageAdapter};

/// PeerDB - Peer-to-Peer SQL Middleware
#[derive(Parser)]
#[command(name = "peerdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a PeerDB node
    Start {
        /// Node id to run as (overrides node.id)
        #[arg(long)]
        id: Option<NodeId>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value_os_t = default_config_path())]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value_t = 1)]
        node_id: NodeId,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let mut logging = PeerDbConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    init_logging(&logging);

    match cli.command {
        Commands::Start { id } => run_start(cli.config, id).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the PeerDB node
async fn run_start(config_path: PathBuf, id: Option<NodeId>) -> Result<()> {
    tracing::info!("Starting PeerDB node...");

    // Load configuration
    let mut config = match PeerDbConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    if let Some(id) = id {
        config = match config.with_node_id(id) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Cannot run as node {}: {}", id, e);
                return Err(e);
            }
        };
    }
    tracing::info!(
        "Loaded configuration for node {} ({} nodes in cluster)",
        config.node.id,
        config.cluster.nodes.len()
    );

    let storage = open_storage(&config).await?;

    let node = match Node::new(config, storage).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            return Err(e);
        }
    };

    let handle = node.start().await?;
    tracing::info!(
        "Node {} serving on {} as {}",
        handle.id(),
        handle.local_addr(),
        handle.membership().role().await
    );

    let summary = handle.membership().snapshot().await;
    tracing::debug!("Cluster view: {}", serde_json::to_string(&summary).unwrap_or_default());

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    handle.shutdown().await;
    tracing::info!("PeerDB node stopped");
    Ok(())
}

/// Connect the configured storage engine
async fn open_storage(config: &PeerDbConfig) -> Result<Arc<dyn StorageAdapter>> {
    let database = config.local_database();

    match database.engine {
        StorageEngine::Memory => {
            tracing::warn!("Using in-memory storage: data is lost on exit");
            Ok(Arc::new(MemoryStorage::new()?))
        }
        StorageEngine::Mariadb => {
            tracing::info!("Connecting to MariaDB at {}:{}...", database.host, database.port);
            let storage = match MariaDbStorage::connect(database).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to connect to MariaDB: {}", e);
                    tracing::error!("  Host: {}:{}", database.host, database.port);
                    tracing::error!("  User: {}", database.user);
                    return Err(e);
                }
            };

            match storage.health_check().await {
                Ok(true) => tracing::info!("Database connection established"),
                Ok(false) => tracing::warn!("Database health check returned false"),
                Err(e) => {
                    tracing::error!("Database health check failed: {}", e);
                    return Err(e);
                }
            }
            Ok(Arc::new(storage))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: NodeId) -> Result<()> {
    std::fs::write(&output, PeerDbConfig::template(node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the node table and database settings for your cluster.");
    println!("Then start with: peerdb --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match PeerDbConfig::from_file(&config_path) {
        Ok(config) => {
            let database = config.local_database();
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Listen:  {}", config.self_entry()?.address());
            println!(
                "  Database: {}@{}:{}/{}",
                database.user,
                database.host,
                database.port,
                database.database.as_deref().unwrap_or("(all)")
            );
            println!("  Peers: {}", config.peers().count());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = PeerDbConfig::from_file(&config_path)?;
    let database = config.local_database();

    println!("PeerDB Node Information");
    println!("=======================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Listen Address:   {}", config.self_entry()?.address());
    println!();
    println!("Storage:");
    println!("  Engine:         {:?}", database.engine);
    println!("  Host:           {}:{}", database.host, database.port);
    println!("  Database:       {}", database.database.as_deref().unwrap_or("(all - server-wide)"));
    println!("  Pool Size:      {}", database.pool_size);
    println!();
    println!("Cluster:");
    for entry in &config.cluster.nodes {
        let marker = if entry.id == config.node.id { " (this node)" } else { "" };
        println!("  Node {:<4}       {}{}", entry.id, entry.address(), marker);
    }
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!("  Control:        {} ms", config.cluster.control_timeout_ms);
    println!("  Query:          {} ms", config.cluster.query_timeout_ms);
    println!("  Sync:           {} ms", config.cluster.sync_timeout_ms);
    println!("  Discovery:      {} ms", config.cluster.discovery_wait_ms);

    Ok(())
}
