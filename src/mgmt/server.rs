//! Cluster server side of the management protocol.
//!
//! Every connection walks the same path: from `Initial` a client may
//! list clusters, report an event, or request a node id followed by the
//! configuration; after that the connection can be converted into a
//! transporter. A non-master standby and a server still starting up
//! decline node-id requests with an error the client can act on.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{GridConfig, NodeKind};
use crate::params::{version, MAX_NODE_ID};
use crate::proto::text::{rec_empty_line, rec_number, rec_simple_str, send_with_num};
use crate::proto::{encode_config_base64, Connection, Listener};

use super::transporter;
use super::{proto_str, result_error_line};

/// A management connection that completed transporter conversion.
pub struct TransporterConn {
    pub conn: Connection,
    pub cluster_id: u32,
    pub client_node_id: u32,
}

/// Shared state of a running cluster server.
pub struct ClusterServerState {
    grid: GridConfig,
    cs_nodeid: u32,
    started: AtomicBool,
    is_master: AtomicBool,
    /// (cluster_id, node_id) pairs currently handed out.
    assigned: Mutex<HashSet<(u32, u32)>>,
}

impl ClusterServerState {
    pub fn new(grid: GridConfig, cs_nodeid: u32) -> Arc<Self> {
        let mut assigned = HashSet::new();
        for cluster in grid.iter() {
            // our own slot is never handed to a client
            if cluster.node(cs_nodeid).is_some() {
                assigned.insert((cluster.cluster_id, cs_nodeid));
            }
        }
        Arc::new(Self {
            grid,
            cs_nodeid,
            started: AtomicBool::new(false),
            is_master: AtomicBool::new(true),
            assigned: Mutex::new(assigned),
        })
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub fn cs_nodeid(&self) -> u32 {
        self.cs_nodeid
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn set_master(&self, master: bool) {
        self.is_master.store(master, Ordering::SeqCst);
    }

    /// Validate or pick a node id for a connecting client.
    fn assign_node_id(&self, cluster_id: u32, requested: u32, kind: NodeKind) -> Result<u32> {
        let cluster = self
            .grid
            .cluster(cluster_id)
            .ok_or(Error::NoSuchCluster(cluster_id))?;
        let mut assigned = self.assigned.lock().expect("assigned lock");
        if requested != 0 {
            let node = cluster.node(requested).ok_or(Error::NoSuchNode(requested))?;
            if node.kind != kind {
                return Err(Error::PeerDeclined(format!(
                    "node {} is a {}, not a {}",
                    requested, node.kind, kind
                )));
            }
            if !assigned.insert((cluster_id, requested)) {
                return Err(Error::PeerDeclined(format!(
                    "node id {} already in use",
                    requested
                )));
            }
            return Ok(requested);
        }
        for id in cluster.node_ids_of_kind(kind) {
            if assigned.insert((cluster_id, id)) {
                return Ok(id);
            }
        }
        Err(Error::PeerDeclined(format!(
            "no free node id of type {}",
            kind
        )))
    }

    /// Release a node id when its session ends.
    fn release_node_id(&self, cluster_id: u32, node_id: u32) {
        if node_id == self.cs_nodeid {
            return;
        }
        let mut assigned = self.assigned.lock().expect("assigned lock");
        assigned.remove(&(cluster_id, node_id));
    }
}

/// The cluster server: accept loop plus per-connection session tasks.
pub struct ClusterServer {
    state: Arc<ClusterServerState>,
    bind_address: String,
    shutdown_tx: watch::Sender<bool>,
    transporter_tx: Option<mpsc::Sender<TransporterConn>>,
}

impl ClusterServer {
    pub fn new(grid: GridConfig, cs_nodeid: u32, bind_address: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: ClusterServerState::new(grid, cs_nodeid),
            bind_address: bind_address.into(),
            shutdown_tx,
            transporter_tx: None,
        }
    }

    pub fn state(&self) -> Arc<ClusterServerState> {
        Arc::clone(&self.state)
    }

    /// Receive converted transporter connections on this channel.
    pub fn set_transporter_channel(&mut self, tx: mpsc::Sender<TransporterConn>) {
        self.transporter_tx = Some(tx);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Bind and serve until shutdown. Returns the bound address through
    /// `bound_tx` once listening, so callers can use port 0.
    pub async fn run(&self, bound_tx: Option<tokio::sync::oneshot::Sender<std::net::SocketAddr>>) -> Result<()> {
        let mut listener = Listener::bind(&self.bind_address, self.shutdown_tx.subscribe()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "cluster server listening");
        if let Some(tx) = bound_tx {
            let _ = tx.send(addr);
        }
        self.state.set_started(true);
        while let Some(conn) = listener.accept().await? {
            let state = Arc::clone(&self.state);
            let transporter_tx = self.transporter_tx.clone();
            tokio::spawn(async move {
                let peer = conn.peer_addr().to_string();
                if let Err(e) = run_session(state, conn, transporter_tx).await {
                    if e.keeps_session() {
                        debug!(peer = %peer, error = %e, "management session ended");
                    } else {
                        warn!(peer = %peer, error = %e, "management session failed");
                    }
                }
            });
        }
        info!("cluster server stopped");
        Ok(())
    }
}

enum SessionState {
    Initial,
    WaitGetNodeid,
    WaitGetMgmdNodeid,
    WaitSetConnection,
    WaitConvertTransporter,
}

struct SessionCtx {
    cluster_id: u32,
    client_nodeid: u32,
}

async fn run_session(
    state: Arc<ClusterServerState>,
    mut conn: Connection,
    transporter_tx: Option<mpsc::Sender<TransporterConn>>,
) -> Result<()> {
    let mut session = SessionState::Initial;
    let mut ctx = SessionCtx {
        cluster_id: 0,
        client_nodeid: 0,
    };
    match session_loop(&state, &mut conn, &mut session, &mut ctx).await {
        Ok(Some(client_node_id)) => {
            // ownership of the connection moves to the data-api side;
            // the node id stays assigned for the transporter's lifetime
            if let Some(tx) = transporter_tx {
                let _ = tx
                    .send(TransporterConn {
                        conn,
                        cluster_id: ctx.cluster_id,
                        client_node_id,
                    })
                    .await;
            } else {
                state.release_node_id(ctx.cluster_id, ctx.client_nodeid);
            }
            Ok(())
        }
        other => {
            if ctx.client_nodeid != 0 {
                state.release_node_id(ctx.cluster_id, ctx.client_nodeid);
            }
            other.map(|_| ())
        }
    }
}

/// Drive one session; `Ok(Some(node_id))` means the connection finished
/// the transporter conversion and should be handed over.
async fn session_loop(
    state: &ClusterServerState,
    conn: &mut Connection,
    session: &mut SessionState,
    ctx: &mut SessionCtx,
) -> Result<Option<u32>> {
    loop {
        let line = match conn.rec_with_cr().await {
            Ok(line) => line,
            Err(Error::Network(_)) => return Ok(None), // peer closed
            Err(e) => return Err(e),
        };
        match session {
            SessionState::Initial => {
                if line == proto_str::GET_CLUSTER_LIST {
                    handle_get_cluster_list(state, conn).await?;
                    *session = SessionState::WaitGetNodeid;
                } else if line == proto_str::GET_NODEID {
                    if handle_config_request(state, conn, ctx).await? {
                        *session = SessionState::WaitGetMgmdNodeid;
                    }
                } else if line == proto_str::REPORT_EVENT {
                    handle_report_event(conn).await?;
                } else {
                    return Err(Error::Protocol(format!("unexpected request '{}'", line)));
                }
            }
            SessionState::WaitGetNodeid => {
                if line == proto_str::GET_NODEID {
                    if handle_config_request(state, conn, ctx).await? {
                        *session = SessionState::WaitGetMgmdNodeid;
                    }
                } else {
                    return Err(Error::Protocol(format!("unexpected request '{}'", line)));
                }
            }
            SessionState::WaitGetMgmdNodeid => {
                if line == proto_str::GET_MGMD_NODEID {
                    handle_get_mgmd_nodeid(state, conn).await?;
                    *session = SessionState::WaitSetConnection;
                } else {
                    return Err(Error::Protocol(format!("unexpected request '{}'", line)));
                }
            }
            SessionState::WaitSetConnection => {
                if line == proto_str::SET_CONNECTION_PARAMETER {
                    handle_set_connection_parameter(state, conn, ctx).await?;
                    *session = SessionState::WaitConvertTransporter;
                } else if line == proto_str::CONVERT_TRANSPORTER {
                    // the set-connection step is optional
                    return finish_transporter(state, conn, ctx).await.map(Some);
                } else {
                    return Err(Error::Protocol(format!("unexpected request '{}'", line)));
                }
            }
            SessionState::WaitConvertTransporter => {
                if line == proto_str::CONVERT_TRANSPORTER {
                    return finish_transporter(state, conn, ctx).await.map(Some);
                } else {
                    return Err(Error::Protocol(format!("unexpected request '{}'", line)));
                }
            }
        }
    }
}

async fn handle_get_cluster_list(state: &ClusterServerState, conn: &mut Connection) -> Result<()> {
    rec_empty_line(conn).await?;
    conn.send_with_cr(proto_str::GET_CLUSTER_LIST_REPLY).await?;
    for cluster in state.grid.iter() {
        conn.send_with_cr(&format!(
            "{}{}",
            proto_str::CLUSTER_NAME_PREFIX,
            cluster.cluster_name
        ))
        .await?;
        send_with_num(conn, proto_str::CLUSTER_ID_LIST_PREFIX, cluster.cluster_id as u64).await?;
    }
    conn.send_with_cr(proto_str::END_GET_CLUSTER_LIST).await?;
    conn.send_empty_line().await?;
    Ok(())
}

struct GetNodeidReq {
    version: u64,
    node_type: u64,
    node_id: u64,
    cluster_id: u64,
}

/// Receive the body of a get-nodeid request; the command line itself
/// has already been consumed.
async fn rec_get_nodeid_req(conn: &mut Connection) -> Result<GetNodeidReq> {
    let version_number = rec_number(conn, proto_str::VERSION_PREFIX).await?;
    let node_type = rec_number(conn, proto_str::NODETYPE_PREFIX).await?;
    let node_id = rec_number(conn, proto_str::NODEID_PREFIX).await?;
    if node_id > MAX_NODE_ID as u64 {
        return Err(Error::Protocol(format!("node id {} out of range", node_id)));
    }
    rec_simple_str(conn, proto_str::USER_LINE).await?;
    rec_simple_str(conn, proto_str::PASSWORD_LINE).await?;
    rec_simple_str(conn, proto_str::PUBLIC_KEY_LINE).await?;
    let endian = conn.rec_with_cr().await?;
    match endian.strip_prefix(proto_str::ENDIAN_PREFIX) {
        Some(proto_str::ENDIAN_LITTLE) | Some(proto_str::ENDIAN_BIG) => {}
        _ => {
            return Err(Error::Protocol(format!(
                "bad endian declaration '{}'",
                endian
            )))
        }
    }
    rec_simple_str(conn, proto_str::LOG_EVENT_LINE).await?;
    let cluster_id = if version::is_iclaustron(version_number) {
        rec_number(conn, proto_str::CLUSTER_ID_PREFIX).await?
    } else {
        0
    };
    rec_empty_line(conn).await?;
    Ok(GetNodeidReq {
        version: version_number,
        node_type,
        node_id,
        cluster_id,
    })
}

async fn send_error_reply(conn: &mut Connection, text: &str) -> Result<()> {
    conn.send_with_cr(proto_str::GET_NODEID_REPLY).await?;
    conn.send_with_cr(&result_error_line(text)).await?;
    conn.send_empty_line().await?;
    Ok(())
}

/// The get-nodeid plus get-config exchange. Returns `true` when the
/// client got its configuration and the session advances.
async fn handle_config_request(
    state: &ClusterServerState,
    conn: &mut Connection,
    ctx: &mut SessionCtx,
) -> Result<bool> {
    let req = rec_get_nodeid_req(conn).await?;
    if !state.started.load(Ordering::SeqCst) {
        send_error_reply(conn, "cluster server not ready").await?;
        return Ok(false);
    }
    if !state.is_master.load(Ordering::SeqCst) {
        send_error_reply(conn, "not master: try another cluster server").await?;
        return Ok(false);
    }
    let kind = NodeKind::from_wire(req.node_type as u32)
        .ok_or_else(|| Error::Protocol(format!("unknown node type {}", req.node_type)))?;
    let assigned =
        match state.assign_node_id(req.cluster_id as u32, req.node_id as u32, kind) {
            Ok(id) => id,
            Err(Error::PeerDeclined(text)) => {
                send_error_reply(conn, &text).await?;
                return Ok(false);
            }
            Err(Error::NoSuchCluster(id)) => {
                send_error_reply(conn, &format!("no such cluster {}", id)).await?;
                return Ok(false);
            }
            Err(Error::NoSuchNode(id)) => {
                send_error_reply(conn, &format!("no such node {}", id)).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
    ctx.cluster_id = req.cluster_id as u32;
    ctx.client_nodeid = assigned;

    conn.send_with_cr(proto_str::GET_NODEID_REPLY).await?;
    send_with_num(conn, proto_str::NODEID_PREFIX, assigned as u64).await?;
    conn.send_with_cr(proto_str::RESULT_OK).await?;
    conn.send_empty_line().await?;

    // get config
    rec_simple_str(conn, proto_str::GET_CONFIG).await?;
    let read_version = rec_number(conn, proto_str::VERSION_PREFIX).await?;
    if read_version != req.version {
        return Err(Error::Protocol(format!(
            "version changed between requests: {} then {}",
            req.version, read_version
        )));
    }
    rec_empty_line(conn).await?;

    let cluster = state
        .grid
        .cluster(ctx.cluster_id)
        .ok_or(Error::NoSuchCluster(ctx.cluster_id))?;
    let body = encode_config_base64(cluster, req.version)?;
    conn.send_with_cr(proto_str::GET_CONFIG_REPLY).await?;
    conn.send_with_cr(proto_str::RESULT_OK).await?;
    send_with_num(conn, proto_str::CONTENT_LENGTH_PREFIX, body.len() as u64).await?;
    conn.send_with_cr(proto_str::CONTENT_TYPE_LINE).await?;
    conn.send_with_cr(proto_str::CONTENT_ENCODING_LINE).await?;
    conn.send_empty_line().await?;
    conn.write_all(body.as_bytes()).await?;
    conn.send_empty_line().await?;
    info!(
        cluster = ctx.cluster_id,
        node = assigned,
        "configuration served"
    );
    Ok(true)
}

async fn handle_get_mgmd_nodeid(state: &ClusterServerState, conn: &mut Connection) -> Result<()> {
    rec_empty_line(conn).await?;
    conn.send_with_cr(proto_str::GET_MGMD_NODEID_REPLY).await?;
    send_with_num(conn, proto_str::NODEID_PREFIX, state.cs_nodeid as u64).await?;
    conn.send_empty_line().await?;
    Ok(())
}

async fn handle_set_connection_parameter(
    state: &ClusterServerState,
    conn: &mut Connection,
    ctx: &SessionCtx,
) -> Result<()> {
    let client = rec_number(conn, proto_str::NODEID_PREFIX).await?;
    let server = rec_number(conn, proto_str::NODEID_PREFIX).await?;
    rec_empty_line(conn).await?;
    if client != ctx.client_nodeid as u64 || server != state.cs_nodeid as u64 {
        return Err(Error::Protocol(format!(
            "set connection parameter for {}/{} does not match session {}/{}",
            client, server, ctx.client_nodeid, state.cs_nodeid
        )));
    }
    conn.send_with_cr(proto_str::SET_CONNECTION_PARAMETER_REPLY)
        .await?;
    conn.send_with_cr(proto_str::RESULT_OK).await?;
    conn.send_empty_line().await?;
    Ok(())
}

async fn finish_transporter(
    state: &ClusterServerState,
    conn: &mut Connection,
    ctx: &mut SessionCtx,
) -> Result<u32> {
    rec_empty_line(conn).await?;
    let client_id = transporter::server_handshake(conn, state.cs_nodeid).await?;
    if ctx.client_nodeid != 0 && client_id != ctx.client_nodeid {
        return Err(Error::Protocol(format!(
            "transporter for node {} on a session that assigned {}",
            client_id, ctx.client_nodeid
        )));
    }
    info!(
        cluster = ctx.cluster_id,
        node = client_id,
        "connection converted to transporter"
    );
    Ok(client_id)
}

async fn handle_report_event(conn: &mut Connection) -> Result<()> {
    let length = rec_number(conn, proto_str::LENGTH_PREFIX).await?;
    if length > 32 {
        return Err(Error::Protocol(format!("event length {} too large", length)));
    }
    let data =
        crate::proto::text::rec_number_list(conn, proto_str::DATA_PREFIX, length as usize).await?;
    rec_empty_line(conn).await?;
    conn.send_with_cr(proto_str::REPORT_EVENT_REPLY).await?;
    conn.send_with_cr(proto_str::RESULT_OK).await?;
    conn.send_empty_line().await?;

    if data.len() >= 2 {
        let node_id = (data[0] >> 16) as u32;
        let restart_kind = data[1];
        if data.len() >= 6 {
            warn!(
                node = node_id,
                os_signal = data[2],
                error = data[3],
                start_phase = data[4],
                "node reported shutdown due to error"
            );
        } else {
            match restart_kind {
                0 => info!(node = node_id, "node reported shutdown"),
                1 => info!(node = node_id, "node reported restart"),
                _ => info!(node = node_id, "node reported initial restart"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{section_ids, ClusterConfig, NodeConfig};
    use crate::params::ParamRegistry;
    use crate::proto::codec::decode_base64;
    use crate::proto::decode_config;
    use std::time::Duration;

    fn node(kind: NodeKind, id: u32, host: &str) -> NodeConfig {
        let reg = ParamRegistry::global();
        let mut n = NodeConfig::new(kind);
        n.params.set_num(section_ids::NODE_ID, id as u64);
        n.params.set_str(section_ids::HOSTNAME, host);
        n.params.set_str(section_ids::NODE_DATA_PATH, "/var/lib/gridion");
        if kind == NodeKind::DataServer {
            n.params.set_num(101, 2);
        }
        for e in reg.iter_kind(kind.section()).filter(|e| e.is_mandatory) {
            if n.params.is_set(e.id) {
                n.mandatory_mask |= 1 << e.mandatory_bit;
            }
        }
        n
    }

    fn sample_grid() -> GridConfig {
        let mut c = ClusterConfig::new(0, "kalmar", "pw");
        c.add_node(node(NodeKind::DataServer, 1, "ds1")).unwrap();
        c.add_node(node(NodeKind::DataServer, 2, "ds2")).unwrap();
        c.add_node(node(NodeKind::Client, 3, "api1")).unwrap();
        c.add_node(node(NodeKind::ClusterServer, 4, "cs1")).unwrap();
        let mut grid = GridConfig::new();
        grid.insert(c).unwrap();
        grid
    }

    async fn start_server() -> (Arc<ClusterServerState>, std::net::SocketAddr) {
        let server = ClusterServer::new(sample_grid(), 4, "127.0.0.1:0");
        let state = server.state();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move { server.run(Some(tx)).await });
        let addr = rx.await.unwrap();
        (state, addr)
    }

    async fn send_get_nodeid(conn: &mut Connection, node_type: u32, node_id: u32) {
        conn.send_with_cr(proto_str::GET_NODEID).await.unwrap();
        conn.send_with_cr("version: 327948").await.unwrap();
        conn.send_with_cr(&format!("nodetype: {}", node_type)).await.unwrap();
        conn.send_with_cr(&format!("nodeid: {}", node_id)).await.unwrap();
        conn.send_with_cr(proto_str::USER_LINE).await.unwrap();
        conn.send_with_cr(proto_str::PASSWORD_LINE).await.unwrap();
        conn.send_with_cr(proto_str::PUBLIC_KEY_LINE).await.unwrap();
        conn.send_with_cr("endian: little").await.unwrap();
        conn.send_with_cr(proto_str::LOG_EVENT_LINE).await.unwrap();
        conn.send_empty_line().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_nodeid_session() {
        let (_state, addr) = start_server().await;
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        send_get_nodeid(&mut conn, NodeKind::Client as u32, 0).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "get nodeid reply");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "nodeid: 3");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "result: Ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_get_config_body_decodes() {
        let (_state, addr) = start_server().await;
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        send_get_nodeid(&mut conn, NodeKind::Client as u32, 3).await;
        for _ in 0..4 {
            conn.rec_with_cr().await.unwrap();
        }
        conn.send_with_cr(proto_str::GET_CONFIG).await.unwrap();
        conn.send_with_cr("version: 327948").await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "get config reply");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "result: Ok");
        let len_line = conn.rec_with_cr().await.unwrap();
        let content_len: usize = len_line
            .strip_prefix("Content-Length: ")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(
            conn.rec_with_cr().await.unwrap(),
            "Content-Type: ndbconfig/octet-stream"
        );
        assert_eq!(
            conn.rec_with_cr().await.unwrap(),
            "Content-Transfer-Encoding: base64"
        );
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        let mut body = vec![0u8; content_len];
        conn.read_exact(&mut body).await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        let bytes = decode_base64(std::str::from_utf8(&body).unwrap()).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.num_nodes(), 4);
        assert_eq!(decoded.num_comms(), 5);
    }

    #[tokio::test]
    async fn test_requested_id_already_in_use() {
        let (_state, addr) = start_server().await;
        let mut first = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        send_get_nodeid(&mut first, NodeKind::Client as u32, 3).await;
        for _ in 0..4 {
            first.rec_with_cr().await.unwrap();
        }
        // second client asks for the same id while the first session is open
        let mut second = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        send_get_nodeid(&mut second, NodeKind::Client as u32, 3).await;
        assert_eq!(second.rec_with_cr().await.unwrap(), "get nodeid reply");
        let result = second.rec_with_cr().await.unwrap();
        assert!(result.starts_with("result: Error ("), "got '{}'", result);
    }

    #[tokio::test]
    async fn test_standby_declines() {
        let (state, addr) = start_server().await;
        state.set_master(false);
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        send_get_nodeid(&mut conn, NodeKind::Client as u32, 0).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "get nodeid reply");
        let result = conn.rec_with_cr().await.unwrap();
        assert!(result.contains("not master"));
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
        // the session survives the decline
        state.set_master(true);
        send_get_nodeid(&mut conn, NodeKind::Client as u32, 0).await;
        assert_eq!(conn.rec_with_cr().await.unwrap(), "get nodeid reply");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "nodeid: 3");
    }

    #[tokio::test]
    async fn test_get_cluster_list() {
        let (_state, addr) = start_server().await;
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        conn.send_with_cr(proto_str::GET_CLUSTER_LIST).await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "get cluster list reply");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "clustername: kalmar");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "clusterid: 0");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "end get cluster list");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_report_event() {
        let (_state, addr) = start_server().await;
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        conn.send_with_cr(proto_str::REPORT_EVENT).await.unwrap();
        conn.send_with_cr("length: 3").await.unwrap();
        let node_down: u64 = (7 << 16) | 59;
        conn.send_with_cr(&format!("data:  {} 0 0", node_down)).await.unwrap();
        conn.send_empty_line().await.unwrap();
        assert_eq!(conn.rec_with_cr().await.unwrap(), "report event reply");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "result: Ok");
        assert_eq!(conn.rec_with_cr().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_node_id_released_on_disconnect() {
        let (state, addr) = start_server().await;
        {
            let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
                .await
                .unwrap();
            send_get_nodeid(&mut conn, NodeKind::Client as u32, 3).await;
            for _ in 0..4 {
                conn.rec_with_cr().await.unwrap();
            }
            conn.close().await.unwrap();
        }
        // give the session task a moment to clean up
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(state
            .assigned
            .lock()
            .unwrap()
            .iter()
            .all(|&(_, n)| n != 3));
    }
}
