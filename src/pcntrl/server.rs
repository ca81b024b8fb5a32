//! Process controller wire protocol.
//!
//! One command handler per connection. Requests and replies are CR
//! lines ending with an empty line; a declined command answers with an
//! `error` line plus one free-text line and keeps the connection open,
//! while protocol and memory errors close it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::proto::text::{
    rec_boolean, rec_empty_line, rec_number, rec_opt_string, rec_simple_str, rec_string,
    send_with_num, send_two_strings,
};
use crate::proto::{Connection, Listener};

use super::hostinfo;
use super::registry::{ProcessEntry, ProcessFilter, ProcessKey, ProcessRegistry};

/// Protocol literals of the process controller.
pub mod proto_str {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const KILL: &str = "kill";
    pub const LIST: &str = "list";
    pub const LIST_FULL: &str = "list full";
    pub const LIST_NODE: &str = "list node";
    pub const LIST_NEXT: &str = "list next";
    pub const LIST_STOP: &str = "list stop";
    pub const COPY_CLUSTER_SERVER_FILES: &str = "copy cluster server files";
    pub const GET_CPU_INFO: &str = "get cpu info";
    pub const GET_MEM_INFO: &str = "get memory info";
    pub const GET_DISK_INFO: &str = "get disk info";

    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
    pub const ERROR_PREFIX: &str = "error: ";
    pub const PROGRAM_PREFIX: &str = "program: ";
    pub const VERSION_PREFIX: &str = "version: ";
    pub const GRID_PREFIX: &str = "grid: ";
    pub const CLUSTER_PREFIX: &str = "cluster: ";
    pub const NODE_PREFIX: &str = "node: ";
    pub const AUTORESTART_PREFIX: &str = "autorestart: ";
    pub const NUM_PARAMETERS_PREFIX: &str = "num parameters: ";
    pub const PARAMETER_PREFIX: &str = "parameter: ";
    pub const PID_PREFIX: &str = "pid: ";
    pub const START_TIME_PREFIX: &str = "start time: ";

    pub const CS_NODE_ID_PREFIX: &str = "cluster server node id: ";
    pub const NUM_CLUSTERS_PREFIX: &str = "number of clusters: ";
    pub const RECEIVE_CONFIG_INI: &str = "receive config.ini";
    pub const RECEIVE_GRID_COMMON_INI: &str = "receive grid_common.ini";
    pub const RECEIVE_CLUSTER_FILE_PREFIX: &str = "receive cluster config file: ";
    pub const NUM_LINES_PREFIX: &str = "number of lines: ";
    pub const RECEIVE_FILE_OK: &str = "receive config file ok";

    pub const NUM_CPUS_PREFIX: &str = "number of cpus: ";
    pub const NUM_NUMA_NODES_PREFIX: &str = "number of NUMA nodes: ";
    pub const NUM_CPUS_PER_CORE_PREFIX: &str = "number of cpus per core: ";
    pub const CPU_PREFIX: &str = "cpu: ";
    pub const NO_CPU_INFO: &str = "no cpu info available";

    pub const MB_USER_MEMORY_PREFIX: &str = "number of MBytes user memory: ";
    pub const MEM_NODE_PREFIX: &str = "memory node: ";
    pub const NO_MEM_INFO: &str = "no memory info available";

    pub const DIR_PREFIX: &str = "dir: ";
    pub const DISK_SPACE_PREFIX: &str = "disk space: ";
    pub const NO_DISK_INFO: &str = "no disk info available";
}

/// The host-local process controller daemon.
pub struct ProcessController {
    registry: Arc<ProcessRegistry>,
    /// Installation base; version binaries live under
    /// `<base>/<version>/bin/<program>`.
    base_dir: PathBuf,
    /// Where cluster server config files get installed.
    config_dir: PathBuf,
    bind_address: String,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessController {
    pub fn new(
        bind_address: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(ProcessRegistry::new()),
            base_dir: base_dir.into(),
            config_dir: config_dir.into(),
            bind_address: bind_address.into(),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn run(
        &self,
        bound_tx: Option<tokio::sync::oneshot::Sender<std::net::SocketAddr>>,
    ) -> Result<()> {
        let mut listener = Listener::bind(&self.bind_address, self.shutdown_tx.subscribe()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "process controller listening");
        if let Some(tx) = bound_tx {
            let _ = tx.send(addr);
        }
        while let Some(conn) = listener.accept().await? {
            let ctx = SessionCtx {
                registry: Arc::clone(&self.registry),
                base_dir: self.base_dir.clone(),
                config_dir: self.config_dir.clone(),
            };
            tokio::spawn(async move {
                let peer = conn.peer_addr().to_string();
                if let Err(e) = run_command_handler(ctx, conn).await {
                    debug!(peer = %peer, error = %e, "command session ended");
                }
            });
        }
        info!("process controller stopped");
        Ok(())
    }
}

struct SessionCtx {
    registry: Arc<ProcessRegistry>,
    base_dir: PathBuf,
    config_dir: PathBuf,
}

async fn send_error_reply(conn: &mut Connection, text: &str) -> Result<()> {
    conn.send_with_cr(proto_str::ERROR).await?;
    send_two_strings(conn, proto_str::ERROR_PREFIX, text).await?;
    conn.send_empty_line().await?;
    Ok(())
}

async fn send_ok_reply(conn: &mut Connection) -> Result<()> {
    conn.send_with_cr(proto_str::OK).await?;
    conn.send_empty_line().await?;
    Ok(())
}

/// Dispatch commands until the peer disconnects or commits a protocol
/// error. Environmental declines are reported and the loop continues.
async fn run_command_handler(ctx: SessionCtx, mut conn: Connection) -> Result<()> {
    loop {
        let line = match conn.rec_with_cr().await {
            Ok(line) => line,
            Err(Error::Network(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let result = match line.as_str() {
            proto_str::START => handle_start(&ctx, &mut conn).await,
            proto_str::STOP => handle_stop(&ctx, &mut conn, false).await,
            proto_str::KILL => handle_stop(&ctx, &mut conn, true).await,
            proto_str::LIST => handle_list(&ctx, &mut conn, false).await,
            proto_str::LIST_FULL => handle_list(&ctx, &mut conn, true).await,
            proto_str::COPY_CLUSTER_SERVER_FILES => handle_copy_files(&ctx, &mut conn).await,
            proto_str::GET_CPU_INFO => handle_cpu_info(&mut conn).await,
            proto_str::GET_MEM_INFO => handle_mem_info(&mut conn).await,
            proto_str::GET_DISK_INFO => handle_disk_info(&mut conn).await,
            other => {
                warn!(command = other, "unexpected command");
                return Err(Error::Protocol(format!("unknown command '{}'", other)));
            }
        };
        match result {
            Ok(()) => {}
            Err(e) if e.keeps_session() => {
                debug!(error = %e, "command declined");
                send_error_reply(&mut conn, &e.to_string()).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn rec_key(conn: &mut Connection) -> Result<ProcessKey> {
    Ok(ProcessKey {
        grid: rec_string(conn, proto_str::GRID_PREFIX).await?,
        cluster: rec_string(conn, proto_str::CLUSTER_PREFIX).await?,
        node: rec_string(conn, proto_str::NODE_PREFIX).await?,
    })
}

/// Read the rest of a start request into a registry entry.
async fn rec_start_message(conn: &mut Connection) -> Result<ProcessEntry> {
    let program = rec_string(conn, proto_str::PROGRAM_PREFIX).await?;
    let version_string = rec_string(conn, proto_str::VERSION_PREFIX).await?;
    let key = rec_key(conn).await?;
    let autorestart = rec_boolean(conn, proto_str::AUTORESTART_PREFIX).await?;
    let num_parameters = rec_number(conn, proto_str::NUM_PARAMETERS_PREFIX).await?;
    if num_parameters > 256 {
        return Err(Error::Protocol("too many parameters".into()));
    }
    let mut parameters = Vec::with_capacity(num_parameters as usize);
    for _ in 0..num_parameters {
        parameters.push(rec_string(conn, proto_str::PARAMETER_PREFIX).await?);
    }
    rec_empty_line(conn).await?;
    Ok(ProcessEntry {
        key,
        program,
        version_string,
        autorestart,
        parameters,
        pid: 0,
        start_id: 0,
        started_at: chrono::Utc::now(),
        kill_ongoing: false,
    })
}

async fn handle_start(ctx: &SessionCtx, conn: &mut Connection) -> Result<()> {
    let entry = rec_start_message(conn).await?;
    let key = entry.key.clone();
    let program = entry.program.clone();
    let version = entry.version_string.clone();
    let parameters = entry.parameters.clone();

    ctx.registry.begin_start(entry).await?;

    let spawn_result = spawn_process(ctx, &program, &version, &parameters).await;
    let pid = match spawn_result {
        Ok(pid) => pid,
        Err(e) => {
            ctx.registry.abort_start(&key);
            return Err(e);
        }
    };
    // let the exec settle, then make sure the child did not die on
    // the spot
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    match crate::osutil::is_pid_alive(pid) {
        Ok(true) => {}
        Ok(false) => {
            ctx.registry.abort_start(&key);
            return Err(Error::ChildSpawnFailed(format!(
                "{} exited immediately",
                program
            )));
        }
        Err(e) => {
            ctx.registry.abort_start(&key);
            return Err(e);
        }
    }
    ctx.registry.commit_start(&key, pid)?;
    info!(pid, program = %program, "process started");
    conn.send_with_cr(proto_str::OK).await?;
    send_with_num(conn, proto_str::PID_PREFIX, pid as u64).await?;
    conn.send_empty_line().await?;
    Ok(())
}

/// Spawn the program from its versioned binary directory.
async fn spawn_process(
    ctx: &SessionCtx,
    program: &str,
    version: &str,
    parameters: &[String],
) -> Result<u32> {
    let bin_dir = ctx.base_dir.join(version).join("bin");
    let binary = bin_dir.join(program);
    let mut cmd = tokio::process::Command::new(&binary);
    cmd.args(parameters)
        .current_dir(&ctx.base_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let child = cmd
        .spawn()
        .map_err(|e| Error::ChildSpawnFailed(format!("{}: {}", binary.display(), e)))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::ChildSpawnFailed("child has no pid".into()))?;
    // the child lives on after the handle is dropped
    drop(child);
    Ok(pid)
}

async fn handle_stop(ctx: &SessionCtx, conn: &mut Connection, hard: bool) -> Result<()> {
    let key = rec_key(conn).await?;
    rec_empty_line(conn).await?;
    ctx.registry.stop(&key, hard).await?;
    send_ok_reply(conn).await
}

/// Read an optional partial key: grid, grid+cluster, or full key.
async fn rec_opt_filter(conn: &mut Connection) -> Result<ProcessFilter> {
    let mut filter = ProcessFilter::default();
    let Some(grid) = rec_opt_string(conn, proto_str::GRID_PREFIX).await? else {
        rec_empty_line(conn).await?;
        return Ok(filter);
    };
    filter.grid = Some(grid);
    let Some(cluster) = rec_opt_string(conn, proto_str::CLUSTER_PREFIX).await? else {
        rec_empty_line(conn).await?;
        return Ok(filter);
    };
    filter.cluster = Some(cluster);
    let Some(node) = rec_opt_string(conn, proto_str::NODE_PREFIX).await? else {
        rec_empty_line(conn).await?;
        return Ok(filter);
    };
    filter.node = Some(node);
    rec_empty_line(conn).await?;
    Ok(filter)
}

async fn send_list_entry(
    conn: &mut Connection,
    entry: &ProcessEntry,
    list_full: bool,
) -> Result<()> {
    conn.send_with_cr(proto_str::LIST_NODE).await?;
    send_two_strings(conn, proto_str::PROGRAM_PREFIX, &entry.program).await?;
    send_two_strings(conn, proto_str::VERSION_PREFIX, &entry.version_string).await?;
    send_two_strings(conn, proto_str::GRID_PREFIX, &entry.key.grid).await?;
    send_two_strings(conn, proto_str::CLUSTER_PREFIX, &entry.key.cluster).await?;
    send_two_strings(conn, proto_str::NODE_PREFIX, &entry.key.node).await?;
    send_with_num(conn, proto_str::START_TIME_PREFIX, entry.start_id).await?;
    send_with_num(conn, proto_str::PID_PREFIX, entry.pid as u64).await?;
    send_with_num(
        conn,
        proto_str::NUM_PARAMETERS_PREFIX,
        entry.parameters.len() as u64,
    )
    .await?;
    if list_full {
        for p in &entry.parameters {
            send_two_strings(conn, proto_str::PARAMETER_PREFIX, p).await?;
        }
    }
    conn.send_empty_line().await?;
    Ok(())
}

async fn handle_list(ctx: &SessionCtx, conn: &mut Connection, list_full: bool) -> Result<()> {
    let filter = rec_opt_filter(conn).await?;
    // snapshot under the lock, stream without it
    let entries = ctx.registry.list(&filter);
    for entry in &entries {
        send_list_entry(conn, entry, list_full).await?;
        let line = conn.rec_with_cr().await?;
        rec_empty_line(conn).await?;
        if line == proto_str::LIST_STOP {
            break;
        }
        if line != proto_str::LIST_NEXT {
            return Err(Error::Protocol(format!(
                "expected list next or list stop, got '{}'",
                line
            )));
        }
    }
    conn.send_with_cr(proto_str::LIST_STOP).await?;
    conn.send_empty_line().await?;
    Ok(())
}

/// Receive `number of lines` CR lines into a new file. The file name is
/// recorded so the whole transfer can be rolled back.
async fn receive_file(
    conn: &mut Connection,
    dir: &std::path::Path,
    file_name: &str,
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    let num_lines = rec_number(conn, proto_str::NUM_LINES_PREFIX).await?;
    let path = dir.join(file_name);
    let mut content = String::new();
    for _ in 0..num_lines {
        let line = conn.rec_with_cr().await?;
        content.push_str(&line);
        content.push('\n');
    }
    rec_empty_line(conn).await?;
    if path.exists() {
        return Err(Error::Config(format!(
            "config file {} already installed",
            file_name
        )));
    }
    std::fs::write(&path, content)?;
    created.push(path);
    conn.send_with_cr(proto_str::RECEIVE_FILE_OK).await?;
    conn.send_empty_line().await?;
    Ok(())
}

/// Install N+2 cluster server config files atomically: on any error all
/// files created so far are removed.
async fn handle_copy_files(ctx: &SessionCtx, conn: &mut Connection) -> Result<()> {
    let node_id = rec_number(conn, proto_str::CS_NODE_ID_PREFIX).await?;
    let num_clusters = rec_number(conn, proto_str::NUM_CLUSTERS_PREFIX).await?;
    let dir = ctx.config_dir.join(format!("node{}", node_id));
    std::fs::create_dir_all(&dir)?;
    let mut created: Vec<PathBuf> = Vec::new();

    let result = async {
        rec_simple_str(conn, proto_str::RECEIVE_CONFIG_INI).await?;
        receive_file(conn, &dir, "config.ini", &mut created).await?;
        rec_simple_str(conn, proto_str::RECEIVE_GRID_COMMON_INI).await?;
        receive_file(conn, &dir, "grid_common.ini", &mut created).await?;
        for _ in 0..num_clusters {
            let name = rec_string(conn, proto_str::RECEIVE_CLUSTER_FILE_PREFIX).await?;
            if name.contains('/') || name.contains("..") {
                return Err(Error::Protocol(format!("illegal file name '{}'", name)));
            }
            receive_file(conn, &dir, &name, &mut created).await?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(files = created.len(), dir = %dir.display(), "config files installed");
            Ok(())
        }
        Err(e) => {
            for path in created {
                let _ = std::fs::remove_file(path);
            }
            Err(e)
        }
    }
}

async fn handle_cpu_info(conn: &mut Connection) -> Result<()> {
    rec_empty_line(conn).await?;
    let Some(topo) = hostinfo::cpu_topology() else {
        conn.send_with_cr(proto_str::NO_CPU_INFO).await?;
        conn.send_empty_line().await?;
        return Ok(());
    };
    send_with_num(conn, proto_str::NUM_CPUS_PREFIX, topo.num_cpus as u64).await?;
    send_with_num(conn, proto_str::NUM_NUMA_NODES_PREFIX, topo.num_numa_nodes as u64).await?;
    send_with_num(conn, proto_str::NUM_CPUS_PER_CORE_PREFIX, topo.cpus_per_core as u64).await?;
    for cpu in &topo.cpus {
        conn.send_with_cr(&format!(
            "{}{} node: {} core: {}",
            proto_str::CPU_PREFIX,
            cpu.cpu_id,
            cpu.numa_node_id,
            cpu.core_id
        ))
        .await?;
    }
    conn.send_empty_line().await?;
    Ok(())
}

async fn handle_mem_info(conn: &mut Connection) -> Result<()> {
    rec_empty_line(conn).await?;
    let Some(topo) = hostinfo::mem_topology() else {
        conn.send_with_cr(proto_str::NO_MEM_INFO).await?;
        conn.send_empty_line().await?;
        return Ok(());
    };
    send_with_num(conn, proto_str::MB_USER_MEMORY_PREFIX, topo.total_megabytes).await?;
    send_with_num(conn, proto_str::NUM_NUMA_NODES_PREFIX, topo.nodes.len() as u64).await?;
    for node in &topo.nodes {
        conn.send_with_cr(&format!(
            "{}{} MB user memory: {}",
            proto_str::MEM_NODE_PREFIX,
            node.numa_node_id,
            node.megabytes
        ))
        .await?;
    }
    conn.send_empty_line().await?;
    Ok(())
}

async fn handle_disk_info(conn: &mut Connection) -> Result<()> {
    let dir = rec_string(conn, proto_str::DIR_PREFIX).await?;
    rec_empty_line(conn).await?;
    match hostinfo::disk_free_bytes(&dir) {
        Some(free) => {
            send_two_strings(conn, proto_str::DIR_PREFIX, &dir).await?;
            send_with_num(conn, proto_str::DISK_SPACE_PREFIX, free).await?;
        }
        None => {
            // deliberately silent about the reason
            conn.send_with_cr(proto_str::NO_DISK_INFO).await?;
        }
    }
    conn.send_empty_line().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn start_controller(base: &std::path::Path, config: &std::path::Path) -> std::net::SocketAddr {
        let pc = ProcessController::new("127.0.0.1:0", base, config);
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move { pc.run(Some(tx)).await });
        rx.await.unwrap()
    }

    async fn connect(addr: std::net::SocketAddr) -> Connection {
        Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap()
    }

    /// Install a tiny long-running shell script as a version binary.
    fn install_program(base: &std::path::Path, version: &str, name: &str) {
        use std::os::unix::fs::PermissionsExt;
        let bin = base.join(version).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn send_start(conn: &mut Connection, node: &str, program: &str) {
        conn.send_with_cr(proto_str::START).await.unwrap();
        conn.send_with_cr(&format!("program: {}", program)).await.unwrap();
        conn.send_with_cr("version: gridion-0.3.1").await.unwrap();
        conn.send_with_cr("grid: my_grid").await.unwrap();
        conn.send_with_cr("cluster: my_cluster").await.unwrap();
        conn.send_with_cr(&format!("node: {}", node)).await.unwrap();
        conn.send_with_cr("autorestart: false").await.unwrap();
        conn.send_with_cr("num parameters: 2").await.unwrap();
        conn.send_with_cr("parameter: --node_id").await.unwrap();
        conn.send_with_cr("parameter: 1").await.unwrap();
        conn.send_empty_line().await.unwrap();
    }

    async fn send_stop(conn: &mut Connection, node: &str, hard: bool) {
        conn.send_with_cr(if hard { proto_str::KILL } else { proto_str::STOP })
            .await
            .unwrap();
        conn.send_with_cr("grid: my_grid").await.unwrap();
        conn.send_with_cr("cluster: my_cluster").await.unwrap();
        conn.send_with_cr(&format!("node: {}", node)).await.unwrap();
        conn.send_empty_line().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_list_stop_cycle() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        install_program(base.path(), "gridion-0.3.1", "ic_csd");
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;

        // start
        send_start(&mut conn, "my_csd_node", "ic_csd").await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
        let pid_line = conn.rec_with_cr().await.unwrap();
        let pid: u32 = pid_line.strip_prefix("pid: ").unwrap().parse().unwrap();
        assert!(pid > 0);
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");

        // list with grid prefix finds exactly that entry
        conn.send_with_cr(proto_str::LIST).await.unwrap();
        conn.send_with_cr("grid: my_grid").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "list node");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "program: ic_csd");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "version: gridion-0.3.1");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "grid: my_grid");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "cluster: my_cluster");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "node: my_csd_node");
        let _start_time = conn.rec_with_cr().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), format!("pid: {}", pid));
        assert_eq!(conn.rec_with_cr().await.unwrap(), "num parameters: 2");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        conn.send_with_cr(proto_str::LIST_NEXT).await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "list stop");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");

        // stop succeeds, and stopping again is still Ok
        send_stop(&mut conn, "my_csd_node", false).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        send_stop(&mut conn, "my_csd_node", false).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        assert!(!crate::osutil::is_pid_alive(pid).unwrap_or(true));
    }

    #[tokio::test]
    async fn test_start_twice_declined_but_session_survives() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        install_program(base.path(), "gridion-0.3.1", "ic_csd");
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;

        send_start(&mut conn, "n1", "ic_csd").await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
        let _pid = conn.rec_with_cr().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");

        send_start(&mut conn, "n1", "ic_csd").await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "error");
        let text = conn.rec_with_cr().await.unwrap();
        assert!(text.starts_with("error: "));
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");

        // connection still usable
        send_stop(&mut conn, "n1", true).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_start_missing_binary_fails_cleanly() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;
        send_start(&mut conn, "n1", "no_such_program").await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "error");
        let _ = conn.rec_with_cr().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        // the key was rolled back: a new start with a real binary works
        install_program(base.path(), "gridion-0.3.1", "no_such_program");
        send_start(&mut conn, "n1", "no_such_program").await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
        let _ = conn.rec_with_cr().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        send_stop(&mut conn, "n1", true).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_copy_cluster_server_files_atomic() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;

        conn.send_with_cr(proto_str::COPY_CLUSTER_SERVER_FILES).await.unwrap();
        conn.send_with_cr("cluster server node id: 4").await.unwrap();
        conn.send_with_cr("number of clusters: 1").await.unwrap();
        conn.send_with_cr(proto_str::RECEIVE_CONFIG_INI).await.unwrap();
        conn.send_with_cr("number of lines: 2").await.unwrap();
        conn.send_with_cr("[cluster]").await.unwrap();
        conn.send_with_cr("cluster_name: kalmar").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "receive config file ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        conn.send_with_cr(proto_str::RECEIVE_GRID_COMMON_INI).await.unwrap();
        conn.send_with_cr("number of lines: 1").await.unwrap();
        conn.send_with_cr("# common").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "receive config file ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        conn.send_with_cr("receive cluster config file: kalmar.ini").await.unwrap();
        conn.send_with_cr("number of lines: 1").await.unwrap();
        conn.send_with_cr("[data server]").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "receive config file ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");

        let dir = config.path().join("node4");
        assert!(dir.join("config.ini").exists());
        assert!(dir.join("grid_common.ini").exists());
        assert!(dir.join("kalmar.ini").exists());
        let content = std::fs::read_to_string(dir.join("config.ini")).unwrap();
        assert_eq!(content, "[cluster]\ncluster_name: kalmar\n");
    }

    #[tokio::test]
    async fn test_copy_files_rolls_back_on_error() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;

        conn.send_with_cr(proto_str::COPY_CLUSTER_SERVER_FILES).await.unwrap();
        conn.send_with_cr("cluster server node id: 4").await.unwrap();
        conn.send_with_cr("number of clusters: 1").await.unwrap();
        conn.send_with_cr(proto_str::RECEIVE_CONFIG_INI).await.unwrap();
        conn.send_with_cr("number of lines: 1").await.unwrap();
        conn.send_with_cr("[cluster]").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "receive config file ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        // violate the protocol mid-transfer
        conn.send_with_cr("something unexpected").await.unwrap();
        // the already-written file must be gone again
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!config.path().join("node4").join("config.ini").exists());
    }

    #[tokio::test]
    async fn test_cpu_and_mem_info() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;

        conn.send_with_cr(proto_str::GET_CPU_INFO).await.unwrap();
        conn.send_empty_line().await.unwrap();
        let first = conn.rec_with_cr().await.unwrap();
        assert!(first.starts_with("number of cpus: "));
        loop {
            if conn.rec_with_cr().await.unwrap().is_empty() {
                break;
            }
        }

        conn.send_with_cr(proto_str::GET_MEM_INFO).await.unwrap();
        conn.send_empty_line().await.unwrap();
        let first = conn.rec_with_cr().await.unwrap();
        assert!(first.starts_with("number of MBytes user memory: "));
        loop {
            if conn.rec_with_cr().await.unwrap().is_empty() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_disk_info_hides_absent_paths() {
        let base = tempdir().unwrap();
        let config = tempdir().unwrap();
        let addr = start_controller(base.path(), config.path()).await;
        let mut conn = connect(addr).await;

        conn.send_with_cr(proto_str::GET_DISK_INFO).await.unwrap();
        conn.send_with_cr("dir: /tmp").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "dir: /tmp");
        let space = conn.rec_with_cr().await.unwrap();
        assert!(space.starts_with("disk space: "));
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");

        conn.send_with_cr(proto_str::GET_DISK_INFO).await.unwrap();
        conn.send_with_cr("dir: /definitely/not/here").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "no disk info available");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
    }
}
