//! Gridion - Distributed Database Cluster Control Plane
//!
//! The daemon binary: runs a cluster server, an api node or the host
//! process controller, depending on the subcommand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridion::conf_file::ConfigDir;
use gridion::mgmt::{ClusterServer, ConfigClient};
use gridion::model::NodeKind;
use gridion::params::version;
use gridion::pcntrl::ProcessController;
use gridion::{Error, GridionConfig};

/// Composite version this build announces: NDB half and gridion half.
const NDB_VERSION: u32 = 0x5011E;
const IC_VERSION: u32 = 0x000300;

/// Gridion - Distributed Database Cluster Control Plane
#[derive(Parser)]
#[command(name = "gridion")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gridion.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster server
    ClusterServer {
        /// Bootstrap the grid configuration from installed config.ini
        /// files when no versioned configuration exists yet
        #[arg(long)]
        bootstrap: bool,
    },

    /// Run an api node: fetch the configuration and connect to peers
    Api,

    /// Run the host process controller
    Pcntrl,

    /// Query the cluster list from a cluster server
    Status {
        /// Cluster server address
        #[arg(short, long, default_value = "localhost:1186")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "gridion.toml")]
        output: PathBuf,

        /// Grid name
        #[arg(long, default_value = "my_grid")]
        grid: String,

        /// Node name
        #[arg(long, default_value = "node-1")]
        node_name: String,
    },
}

fn init_logging(config: Option<&GridionConfig>, override_level: Option<&str>) {
    let level = override_level
        .map(str::to_string)
        .or_else(|| config.map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let json = config.map(|c| c.logging.format == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => gridion::error::exit_code::OK,
        Err(e) => {
            eprintln!("gridion: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> gridion::Result<()> {
    if let Commands::Init {
        output,
        grid,
        node_name,
    } = &cli.command
    {
        init_logging(None, cli.log_level.as_deref());
        return write_starter_config(output, grid, node_name);
    }

    let config = GridionConfig::from_file(&cli.config)?;
    init_logging(Some(&config), cli.log_level.as_deref());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(
        grid = %config.node.grid,
        node = %config.node.name,
        host = %host,
        "gridion starting"
    );

    match cli.command {
        Commands::ClusterServer { bootstrap } => run_cluster_server(config, bootstrap).await,
        Commands::Api => run_api_node(config).await,
        Commands::Pcntrl => run_pcntrl(config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { .. } => unreachable!("handled above"),
    }
}

async fn run_cluster_server(config: GridionConfig, bootstrap: bool) -> gridion::Result<()> {
    let config_dir = ConfigDir::new(config.config_dir());
    let mut version_number = config_dir.recover()?;
    if version_number == 0 {
        if !bootstrap {
            return Err(Error::Config(
                "no configuration present; start with --bootstrap after installing config files"
                    .into(),
            ));
        }
        let install_dir = config
            .config_dir()
            .join(format!("node{}", config.cluster_server.node_id));
        version_number = config_dir.bootstrap_from_installed(&install_dir)?;
    }
    let (grid, loaded_version) = config_dir.load()?;
    tracing::info!(
        version = loaded_version,
        clusters = grid.len(),
        "serving grid configuration"
    );
    debug_assert_eq!(version_number, loaded_version);

    let server = ClusterServer::new(
        grid,
        config.cluster_server.node_id,
        config.cluster_server.bind_address.clone(),
    );
    tokio::select! {
        result = server.run(None) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            server.shutdown();
            Ok(())
        }
    }
}

async fn run_api_node(config: GridionConfig) -> gridion::Result<()> {
    if config.api.cluster_servers.is_empty() {
        return Err(Error::Config(
            "api.cluster_servers must list at least one address".into(),
        ));
    }
    let kind = config.api_node_kind().unwrap_or(NodeKind::Client);
    let composite = version::make(NDB_VERSION, IC_VERSION);
    let client = ConfigClient::new(config.api.cluster_servers.clone(), kind, composite);
    let api_config = client.fetch_all().await?;

    let mut cores = Vec::new();
    for entry in api_config.iter() {
        let core = gridion::apid::ApidGlobal::new(
            entry.config.cluster_id,
            entry.our_node_id,
            config.api.receive_threads,
            config.api.user_threads,
        );
        for (a, b) in entry.config.connected_pairs(composite) {
            let peer = if a == entry.our_node_id {
                b
            } else if b == entry.our_node_id {
                a
            } else {
                continue;
            };
            core.add_peer(&entry.config, peer).await?;
        }
        tracing::info!(
            cluster = entry.config.cluster_id,
            node = entry.our_node_id,
            "data-api core started"
        );
        cores.push(core);
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested");
    for core in cores {
        core.shutdown().await;
    }
    Ok(())
}

async fn run_pcntrl(config: GridionConfig) -> gridion::Result<()> {
    let controller = ProcessController::new(
        config.pcntrl.bind_address.clone(),
        config.pcntrl.base_dir.clone(),
        config.config_dir(),
    );
    tokio::select! {
        result = controller.run(None) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            controller.shutdown();
            Ok(())
        }
    }
}

async fn run_status(address: String) -> gridion::Result<()> {
    let client = ConfigClient::new(
        vec![address],
        NodeKind::ClusterMgr,
        version::make(NDB_VERSION, IC_VERSION),
    );
    let clusters = client.get_cluster_list().await?;
    println!("clusters: {}", clusters.len());
    for (name, id) in clusters {
        println!("  {} (id {})", name, id);
    }
    Ok(())
}

fn write_starter_config(output: &PathBuf, grid: &str, node_name: &str) -> gridion::Result<()> {
    let content = format!(
        r#"# gridion configuration

[node]
grid = "{grid}"
name = "{node_name}"
data_dir = "/var/lib/gridion"

[cluster_server]
node_id = 1
bind_address = "0.0.0.0:1186"

[api]
cluster_servers = ["localhost:1186"]
node_type = "client"

[pcntrl]
bind_address = "127.0.0.1:{pcntrl_port}"
base_dir = "/usr/local/gridion"

[logging]
level = "info"
format = "pretty"
"#,
        grid = grid,
        node_name = node_name,
        pcntrl_port = gridion::pcntrl::DEF_PCNTRL_PORT,
    );
    std::fs::write(output, content)?;
    println!("wrote {}", output.display());
    Ok(())
}
