//! GridCtl - Command line tool for managing gridion hosts
//!
//! Talks the process controller protocol to a gridion pcntrl daemon:
//! start, stop, kill and list node processes, install cluster server
//! configuration files, and query host inventory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use gridion::pcntrl::proto_str;
use gridion::proto::text::{rec_number, rec_string, send_with_num, send_two_strings};
use gridion::proto::Connection;

/// Gridion Host Control Tool
#[derive(Parser)]
#[command(name = "gridctl")]
#[command(about = "Control and monitor gridion node processes", long_about = None)]
struct Cli {
    /// Process controller endpoint
    #[arg(short, long, default_value = "127.0.0.1:11860")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node process
    Start {
        /// Program to start, e.g. gridion
        program: String,
        /// Installed version, e.g. gridion-0.3.1
        #[arg(long)]
        version: String,
        #[arg(long)]
        grid: String,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        node: String,
        /// Restart the process automatically after a failure
        #[arg(long)]
        autorestart: bool,
        /// Parameters passed to the program
        #[arg(last = true)]
        parameters: Vec<String>,
    },

    /// Stop a node process gracefully
    Stop {
        #[arg(long)]
        grid: String,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        node: String,
    },

    /// Kill a node process forcefully
    Kill {
        #[arg(long)]
        grid: String,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        node: String,
    },

    /// List node processes; key parts narrow the listing
    List {
        #[arg(long)]
        grid: Option<String>,
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        node: Option<String>,
        /// Also print start parameters
        #[arg(long)]
        full: bool,
    },

    /// Install cluster server configuration files
    CopyConfig {
        /// Cluster server node id
        #[arg(long)]
        node_id: u32,
        /// Grid index file (config.ini)
        #[arg(long)]
        config: PathBuf,
        /// Grid common file (grid_common.ini)
        #[arg(long)]
        grid_common: PathBuf,
        /// One file per cluster, named <cluster_name>.ini
        cluster_files: Vec<PathBuf>,
    },

    /// Query CPU topology of the host
    CpuInfo,

    /// Query memory of the host
    MemInfo,

    /// Query free disk space below a directory
    DiskInfo {
        dir: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("gridctl: {:#}", e);
        std::process::exit(1);
    }
}

async fn connect(endpoint: &str) -> anyhow::Result<Connection> {
    Connection::connect(endpoint, Duration::from_secs(10))
        .await
        .with_context(|| format!("cannot reach process controller at {}", endpoint))
}

/// Read `ok` or `error` + message.
async fn expect_ok(conn: &mut Connection) -> anyhow::Result<()> {
    let line = conn.rec_with_cr().await?;
    match line.as_str() {
        proto_str::OK => {
            let _ = conn.rec_with_cr().await?;
            Ok(())
        }
        proto_str::ERROR => {
            let text = rec_string(conn, proto_str::ERROR_PREFIX).await?;
            let _ = conn.rec_with_cr().await?;
            bail!("{}", text)
        }
        other => bail!("unexpected reply '{}'", other),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut conn = connect(&cli.endpoint).await?;
    match cli.command {
        Commands::Start {
            program,
            version,
            grid,
            cluster,
            node,
            autorestart,
            parameters,
        } => {
            conn.send_with_cr(proto_str::START).await?;
            send_two_strings(&mut conn, proto_str::PROGRAM_PREFIX, &program).await?;
            send_two_strings(&mut conn, proto_str::VERSION_PREFIX, &version).await?;
            send_two_strings(&mut conn, proto_str::GRID_PREFIX, &grid).await?;
            send_two_strings(&mut conn, proto_str::CLUSTER_PREFIX, &cluster).await?;
            send_two_strings(&mut conn, proto_str::NODE_PREFIX, &node).await?;
            send_two_strings(
                &mut conn,
                proto_str::AUTORESTART_PREFIX,
                if autorestart { "true" } else { "false" },
            )
            .await?;
            send_with_num(&mut conn, proto_str::NUM_PARAMETERS_PREFIX, parameters.len() as u64)
                .await?;
            for p in &parameters {
                send_two_strings(&mut conn, proto_str::PARAMETER_PREFIX, p).await?;
            }
            conn.send_empty_line().await?;
            let line = conn.rec_with_cr().await?;
            if line == proto_str::OK {
                let pid = rec_number(&mut conn, proto_str::PID_PREFIX).await?;
                let _ = conn.rec_with_cr().await?;
                println!("started, pid {}", pid);
            } else if line == proto_str::ERROR {
                let text = rec_string(&mut conn, proto_str::ERROR_PREFIX).await?;
                bail!("{}", text);
            } else {
                bail!("unexpected reply '{}'", line);
            }
        }
        Commands::Stop { grid, cluster, node } => {
            conn.send_with_cr(proto_str::STOP).await?;
            send_key(&mut conn, &grid, &cluster, &node).await?;
            expect_ok(&mut conn).await?;
            println!("stopped");
        }
        Commands::Kill { grid, cluster, node } => {
            conn.send_with_cr(proto_str::KILL).await?;
            send_key(&mut conn, &grid, &cluster, &node).await?;
            expect_ok(&mut conn).await?;
            println!("killed");
        }
        Commands::List {
            grid,
            cluster,
            node,
            full,
        } => {
            conn.send_with_cr(if full { proto_str::LIST_FULL } else { proto_str::LIST })
                .await?;
            if let Some(grid) = &grid {
                send_two_strings(&mut conn, proto_str::GRID_PREFIX, grid).await?;
                if let Some(cluster) = &cluster {
                    send_two_strings(&mut conn, proto_str::CLUSTER_PREFIX, cluster).await?;
                    if let Some(node) = &node {
                        send_two_strings(&mut conn, proto_str::NODE_PREFIX, node).await?;
                    }
                }
            }
            conn.send_empty_line().await?;
            list_entries(&mut conn, full).await?;
        }
        Commands::CopyConfig {
            node_id,
            config,
            grid_common,
            cluster_files,
        } => {
            conn.send_with_cr(proto_str::COPY_CLUSTER_SERVER_FILES).await?;
            send_with_num(&mut conn, proto_str::CS_NODE_ID_PREFIX, node_id as u64).await?;
            send_with_num(
                &mut conn,
                proto_str::NUM_CLUSTERS_PREFIX,
                cluster_files.len() as u64,
            )
            .await?;
            conn.send_with_cr(proto_str::RECEIVE_CONFIG_INI).await?;
            send_file(&mut conn, &config).await?;
            conn.send_with_cr(proto_str::RECEIVE_GRID_COMMON_INI).await?;
            send_file(&mut conn, &grid_common).await?;
            for path in &cluster_files {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context("cluster file has no name")?;
                send_two_strings(&mut conn, proto_str::RECEIVE_CLUSTER_FILE_PREFIX, name).await?;
                send_file(&mut conn, path).await?;
            }
            println!("installed {} files", cluster_files.len() + 2);
        }
        Commands::CpuInfo => {
            conn.send_with_cr(proto_str::GET_CPU_INFO).await?;
            conn.send_empty_line().await?;
            print_until_empty(&mut conn).await?;
        }
        Commands::MemInfo => {
            conn.send_with_cr(proto_str::GET_MEM_INFO).await?;
            conn.send_empty_line().await?;
            print_until_empty(&mut conn).await?;
        }
        Commands::DiskInfo { dir } => {
            conn.send_with_cr(proto_str::GET_DISK_INFO).await?;
            send_two_strings(&mut conn, proto_str::DIR_PREFIX, &dir).await?;
            conn.send_empty_line().await?;
            print_until_empty(&mut conn).await?;
        }
    }
    Ok(())
}

async fn send_key(
    conn: &mut Connection,
    grid: &str,
    cluster: &str,
    node: &str,
) -> anyhow::Result<()> {
    send_two_strings(conn, proto_str::GRID_PREFIX, grid).await?;
    send_two_strings(conn, proto_str::CLUSTER_PREFIX, cluster).await?;
    send_two_strings(conn, proto_str::NODE_PREFIX, node).await?;
    conn.send_empty_line().await?;
    Ok(())
}

async fn send_file(conn: &mut Connection, path: &PathBuf) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    send_with_num(conn, proto_str::NUM_LINES_PREFIX, lines.len() as u64).await?;
    for line in lines {
        conn.send_with_cr(line).await?;
    }
    conn.send_empty_line().await?;
    let reply = conn.rec_with_cr().await?;
    if reply == proto_str::ERROR {
        let text = rec_string(conn, proto_str::ERROR_PREFIX).await?;
        bail!("{}", text);
    }
    if reply != proto_str::RECEIVE_FILE_OK {
        bail!("unexpected reply '{}'", reply);
    }
    let _ = conn.rec_with_cr().await?;
    Ok(())
}

/// Print each line received until the server sends a terminating
/// empty line.
async fn print_until_empty(conn: &mut Connection) -> anyhow::Result<()> {
    loop {
        let line = conn.rec_with_cr().await?;
        if line.is_empty() {
            break;
        }
        println!("{}", line);
    }
    Ok(())
}

/// Walk the list protocol, printing entries and requesting the next
/// one, until the server says stop.
async fn list_entries(conn: &mut Connection, full: bool) -> anyhow::Result<()> {
    let mut count = 0usize;
    loop {
        let line = conn.rec_with_cr().await?;
        match line.as_str() {
            proto_str::LIST_NODE => {
                let program = rec_string(conn, proto_str::PROGRAM_PREFIX).await?;
                let version = rec_string(conn, proto_str::VERSION_PREFIX).await?;
                let grid = rec_string(conn, proto_str::GRID_PREFIX).await?;
                let cluster = rec_string(conn, proto_str::CLUSTER_PREFIX).await?;
                let node = rec_string(conn, proto_str::NODE_PREFIX).await?;
                let start_time = rec_number(conn, proto_str::START_TIME_PREFIX).await?;
                let pid = rec_number(conn, proto_str::PID_PREFIX).await?;
                let num_params = rec_number(conn, proto_str::NUM_PARAMETERS_PREFIX).await?;
                let mut params = Vec::new();
                if full {
                    for _ in 0..num_params {
                        params.push(rec_string(conn, proto_str::PARAMETER_PREFIX).await?);
                    }
                }
                let _ = conn.rec_with_cr().await?; // terminating empty line
                count += 1;
                println!(
                    "{}/{}/{}: {} {} pid {} start_id {}",
                    grid, cluster, node, program, version, pid, start_time
                );
                if full && !params.is_empty() {
                    println!("    parameters: {}", params.join(" "));
                }
                conn.send_with_cr(proto_str::LIST_NEXT).await?;
                conn.send_empty_line().await?;
            }
            proto_str::LIST_STOP => {
                let _ = conn.rec_with_cr().await?;
                break;
            }
            proto_str::ERROR => {
                let text = rec_string(conn, proto_str::ERROR_PREFIX).await?;
                bail!("{}", text);
            }
            other => bail!("unexpected reply '{}'", other),
        }
    }
    println!("{} process(es)", count);
    Ok(())
}
