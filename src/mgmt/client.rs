//! Client side of the management protocol.
//!
//! Fetches the grid configuration from a cluster server at startup or
//! reconnection: list the clusters, then for each cluster run the
//! get-nodeid and get-config exchange on a fresh connection and decode
//! the envelope into the configuration model.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{ApiConfig, ClusterConfig, NodeKind};
use crate::params::version;
use crate::proto::codec::{decode_base64, decode_config};
use crate::proto::text::{rec_empty_line, rec_number, rec_opt_number, rec_simple_str, send_with_num};
use crate::proto::Connection;

use super::{proto_str, transporter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client fetching configurations from a set of cluster servers.
pub struct ConfigClient {
    addresses: Vec<String>,
    node_kind: NodeKind,
    composite_version: u64,
}

impl ConfigClient {
    pub fn new(addresses: Vec<String>, node_kind: NodeKind, composite_version: u64) -> Self {
        Self {
            addresses,
            node_kind,
            composite_version,
        }
    }

    /// Connect to the first cluster server that answers.
    async fn connect_any(&self) -> Result<Connection> {
        let mut last_err = Error::Network("no cluster server addresses configured".into());
        for addr in &self.addresses {
            match Connection::connect(addr, CONNECT_TIMEOUT).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(address = %addr, error = %e, "cluster server not reachable");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// `get cluster list` against any reachable cluster server.
    pub async fn get_cluster_list(&self) -> Result<Vec<(String, u32)>> {
        let mut conn = self.connect_any().await?;
        conn.send_with_cr(proto_str::GET_CLUSTER_LIST).await?;
        conn.send_empty_line().await?;
        rec_simple_str(&mut conn, proto_str::GET_CLUSTER_LIST_REPLY).await?;
        let mut clusters = Vec::new();
        loop {
            let line = conn.rec_with_cr().await?;
            if line == proto_str::END_GET_CLUSTER_LIST {
                break;
            }
            let name = line
                .strip_prefix(proto_str::CLUSTER_NAME_PREFIX)
                .ok_or_else(|| Error::Protocol(format!("unexpected line '{}'", line)))?
                .to_string();
            let id = rec_number(&mut conn, proto_str::CLUSTER_ID_LIST_PREFIX).await?;
            clusters.push((name, id as u32));
        }
        rec_empty_line(&mut conn).await?;
        Ok(clusters)
    }

    /// Fetch the configuration of every cluster in the grid.
    pub async fn fetch_all(&self) -> Result<ApiConfig> {
        let clusters = self.get_cluster_list().await?;
        if clusters.is_empty() {
            return Err(Error::Config("cluster server reports no clusters".into()));
        }
        let mut api = ApiConfig::default();
        for (name, cluster_id) in clusters {
            let (config, node_id) = self.fetch_cluster(cluster_id, &name).await?;
            info!(cluster = cluster_id, node = node_id, "configuration fetched");
            api.insert(config, node_id);
        }
        Ok(api)
    }

    /// Fetch one cluster's configuration; returns it together with the
    /// node id the cluster server assigned to us.
    pub async fn fetch_cluster(
        &self,
        cluster_id: u32,
        cluster_name: &str,
    ) -> Result<(ClusterConfig, u32)> {
        let mut conn = self.connect_any().await?;
        let node_id =
            send_get_nodeid(&mut conn, self.composite_version, self.node_kind, 0, cluster_id)
                .await?;
        let bytes = send_get_config(&mut conn, self.composite_version).await?;
        let mut config = decode_config(&bytes)?;
        config.cluster_id = cluster_id;
        config.cluster_name = cluster_name.to_string();
        config.my_node_id = node_id;
        Ok((config, node_id))
    }
}

/// Run the get-nodeid exchange. `requested_node_id` 0 asks the server
/// to pick any free id of our type.
pub async fn send_get_nodeid(
    conn: &mut Connection,
    composite_version: u64,
    node_kind: NodeKind,
    requested_node_id: u32,
    cluster_id: u32,
) -> Result<u32> {
    conn.send_with_cr(proto_str::GET_NODEID).await?;
    send_with_num(conn, proto_str::VERSION_PREFIX, composite_version).await?;
    send_with_num(conn, proto_str::NODETYPE_PREFIX, node_kind as u64).await?;
    send_with_num(conn, proto_str::NODEID_PREFIX, requested_node_id as u64).await?;
    conn.send_with_cr(proto_str::USER_LINE).await?;
    conn.send_with_cr(proto_str::PASSWORD_LINE).await?;
    conn.send_with_cr(proto_str::PUBLIC_KEY_LINE).await?;
    let endian = if cfg!(target_endian = "little") {
        proto_str::ENDIAN_LITTLE
    } else {
        proto_str::ENDIAN_BIG
    };
    conn.send_with_cr(&format!("{}{}", proto_str::ENDIAN_PREFIX, endian))
        .await?;
    conn.send_with_cr(proto_str::LOG_EVENT_LINE).await?;
    if version::is_iclaustron(composite_version) {
        send_with_num(conn, proto_str::CLUSTER_ID_PREFIX, cluster_id as u64).await?;
    }
    conn.send_empty_line().await?;

    rec_simple_str(conn, proto_str::GET_NODEID_REPLY).await?;
    match rec_opt_number(conn, proto_str::NODEID_PREFIX).await? {
        Some(node_id) => {
            rec_simple_str(conn, proto_str::RESULT_OK).await?;
            rec_empty_line(conn).await?;
            Ok(node_id as u32)
        }
        None => {
            let text = read_error_result(conn).await?;
            rec_empty_line(conn).await?;
            warn!(error = %text, "cluster server declined node id request");
            Err(Error::PeerDeclined(text))
        }
    }
}

/// Run the get-config exchange, returning the decoded binary envelope.
pub async fn send_get_config(conn: &mut Connection, composite_version: u64) -> Result<Vec<u8>> {
    conn.send_with_cr(proto_str::GET_CONFIG).await?;
    send_with_num(conn, proto_str::VERSION_PREFIX, composite_version).await?;
    conn.send_empty_line().await?;

    rec_simple_str(conn, proto_str::GET_CONFIG_REPLY).await?;
    let result = conn.rec_with_cr().await?;
    if result != proto_str::RESULT_OK {
        let text = parse_error_result(&result)?;
        rec_empty_line(conn).await?;
        return Err(Error::PeerDeclined(text));
    }
    let content_len = rec_number(conn, proto_str::CONTENT_LENGTH_PREFIX).await? as usize;
    if content_len > crate::proto::codec::MAX_CONTENT_LEN {
        return Err(Error::Protocol(format!(
            "content length {} exceeds limit",
            content_len
        )));
    }
    rec_simple_str(conn, proto_str::CONTENT_TYPE_LINE).await?;
    rec_simple_str(conn, proto_str::CONTENT_ENCODING_LINE).await?;
    rec_empty_line(conn).await?;
    let mut body = vec![0u8; content_len];
    conn.read_exact(&mut body).await?;
    rec_empty_line(conn).await?;
    let text = std::str::from_utf8(&body)
        .map_err(|_| Error::Protocol("configuration body is not ASCII".into()))?;
    decode_base64(text)
}

/// Convert an established management connection into a transporter.
pub async fn convert_to_transporter(
    conn: &mut Connection,
    my_node_id: u32,
    set_connection_parameter: bool,
) -> Result<u32> {
    conn.send_with_cr(proto_str::GET_MGMD_NODEID).await?;
    conn.send_empty_line().await?;
    rec_simple_str(conn, proto_str::GET_MGMD_NODEID_REPLY).await?;
    let cs_nodeid = rec_number(conn, proto_str::NODEID_PREFIX).await? as u32;
    rec_empty_line(conn).await?;

    if set_connection_parameter {
        conn.send_with_cr(proto_str::SET_CONNECTION_PARAMETER).await?;
        send_with_num(conn, proto_str::NODEID_PREFIX, my_node_id as u64).await?;
        send_with_num(conn, proto_str::NODEID_PREFIX, cs_nodeid as u64).await?;
        conn.send_empty_line().await?;
        rec_simple_str(conn, proto_str::SET_CONNECTION_PARAMETER_REPLY).await?;
        rec_simple_str(conn, proto_str::RESULT_OK).await?;
        rec_empty_line(conn).await?;
    }

    conn.send_with_cr(proto_str::CONVERT_TRANSPORTER).await?;
    conn.send_empty_line().await?;
    transporter::client_handshake(conn, my_node_id, cs_nodeid).await?;
    Ok(cs_nodeid)
}

/// Report a node-down event to a cluster server.
pub async fn report_event(conn: &mut Connection, data: &[u64]) -> Result<()> {
    conn.send_with_cr(proto_str::REPORT_EVENT).await?;
    send_with_num(conn, proto_str::LENGTH_PREFIX, data.len() as u64).await?;
    let nums: Vec<String> = data.iter().map(|d| d.to_string()).collect();
    conn.send_with_cr(&format!("{} {}", proto_str::DATA_PREFIX.trim_end(), nums.join(" ")))
        .await?;
    conn.send_empty_line().await?;
    rec_simple_str(conn, proto_str::REPORT_EVENT_REPLY).await?;
    rec_simple_str(conn, proto_str::RESULT_OK).await?;
    rec_empty_line(conn).await?;
    Ok(())
}

async fn read_error_result(conn: &mut Connection) -> Result<String> {
    let line = conn.rec_with_cr().await?;
    parse_error_result(&line)
}

fn parse_error_result(line: &str) -> Result<String> {
    line.strip_prefix(proto_str::RESULT_ERROR_PREFIX)
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Protocol(format!("unexpected result line '{}'", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::server::ClusterServer;
    use crate::model::{section_ids, GridConfig, NodeConfig};
    use crate::params::ParamRegistry;

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
        let mut c = crate::model::ClusterConfig::new(0, "kalmar", "pw");
        c.add_node(node(NodeKind::DataServer, 1, "ds1")).unwrap();
        c.add_node(node(NodeKind::DataServer, 2, "ds2")).unwrap();
        c.add_node(node(NodeKind::Client, 3, "api1")).unwrap();
        c.add_node(node(NodeKind::ClusterServer, 4, "cs1")).unwrap();
        let mut grid = GridConfig::new();
        grid.insert(c).unwrap();
        grid
    }

    async fn start_server() -> std::net::SocketAddr {
        let server = ClusterServer::new(sample_grid(), 4, "127.0.0.1:0");
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move { server.run(Some(tx)).await });
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_fetch_all() {
        let addr = start_server().await;
        let client = ConfigClient::new(
            vec![addr.to_string()],
            NodeKind::Client,
            version::make(0x5011E, 0x10002),
        );
        let api = client.fetch_all().await.unwrap();
        let entry = api.cluster(0).unwrap();
        assert_eq!(entry.our_node_id, 3);
        assert_eq!(entry.config.cluster_name, "kalmar");
        assert_eq!(entry.config.num_nodes(), 4);
        assert_eq!(entry.config.my_node_id, 3);
        // fully connected grid for an iClaustron client
        assert_eq!(entry.config.num_comms(), 6);
    }

    #[tokio::test]
    async fn test_fetch_legacy_version() {
        let addr = start_server().await;
        let client = ConfigClient::new(
            vec![addr.to_string()],
            NodeKind::Client,
            version::make(0x5011E, 0),
        );
        let api = client.fetch_all().await.unwrap();
        let entry = api.cluster(0).unwrap();
        assert_eq!(entry.config.num_comms(), 5);
    }

    #[tokio::test]
    async fn test_cluster_list() {
        let addr = start_server().await;
        let client = ConfigClient::new(
            vec![addr.to_string()],
            NodeKind::Client,
            version::make(0x5011E, 0x10002),
        );
        let list = client.get_cluster_list().await.unwrap();
        assert_eq!(list, vec![("kalmar".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_first_address_down_second_wins() {
        let addr = start_server().await;
        let client = ConfigClient::new(
            vec!["127.0.0.1:1".to_string(), addr.to_string()],
            NodeKind::Client,
            version::make(0x5011E, 0x10002),
        );
        assert!(client.fetch_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_standby_decline_is_peer_declined() {
        let server = ClusterServer::new(sample_grid(), 4, "127.0.0.1:0");
        let state = server.state();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move { server.run(Some(tx)).await });
        let addr = rx.await.unwrap();
        state.set_master(false);
        let client = ConfigClient::new(
            vec![addr.to_string()],
            NodeKind::Client,
            version::make(0x5011E, 0x10002),
        );
        let err = client.fetch_all().await.unwrap_err();
        match err {
            Error::PeerDeclined(text) => assert!(text.contains("not master")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_session_to_transporter() {
        let addr = start_server().await;
        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        let v = version::make(0x5011E, 0x10002);
        let node_id = send_get_nodeid(&mut conn, v, NodeKind::Client, 0, 0)
            .await
            .unwrap();
        assert_eq!(node_id, 3);
        let bytes = send_get_config(&mut conn, v).await.unwrap();
        assert!(decode_config(&bytes).is_ok());
        let cs = convert_to_transporter(&mut conn, node_id, true).await.unwrap();
        assert_eq!(cs, 4);
    }
}
