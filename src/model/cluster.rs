//! Per-cluster configuration: the sparse node array, the ordered comm
//! sections and the hash index on unordered node pairs.

use std::collections::HashMap;

use super::section::{
    CommConfig, NodeConfig, NodeKind, SystemConfig, ID_CLIENT_PORT, ID_FIRST_HOSTNAME,
    ID_SECOND_HOSTNAME, ID_SERVER_NODE_ID, ID_SERVER_PORT,
};
use crate::error::{Error, Result};
use crate::params::version;

/// Node counts per type, maintained by `add_node`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub data_servers: u32,
    pub clients: u32,
    pub cluster_servers: u32,
    pub sql_servers: u32,
    pub rep_servers: u32,
    pub file_servers: u32,
    pub restore_nodes: u32,
    pub cluster_mgrs: u32,
}

impl NodeCounts {
    fn bump(&mut self, kind: NodeKind) {
        match kind {
            NodeKind::DataServer => self.data_servers += 1,
            NodeKind::Client => self.clients += 1,
            NodeKind::ClusterServer => self.cluster_servers += 1,
            NodeKind::SqlServer => self.sql_servers += 1,
            NodeKind::RepServer => self.rep_servers += 1,
            NodeKind::FileServer => self.file_servers += 1,
            NodeKind::Restore => self.restore_nodes += 1,
            NodeKind::ClusterMgr => self.cluster_mgrs += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.data_servers
            + self.clients
            + self.cluster_servers
            + self.sql_servers
            + self.rep_servers
            + self.file_servers
            + self.restore_nodes
            + self.cluster_mgrs
    }
}

/// Configuration of one cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterConfig {
    pub cluster_id: u32,
    pub cluster_name: String,
    pub password: String,
    /// Node id of this process within the cluster, 0 when not a member.
    pub my_node_id: u32,
    pub counts: NodeCounts,
    pub system: SystemConfig,
    /// Sparse array indexed by node id; slot 0 is never used.
    nodes: Vec<Option<NodeConfig>>,
    /// Explicitly configured comm sections in definition order.
    comms: Vec<CommConfig>,
    /// Unordered pair -> index into `comms`.
    comm_index: HashMap<(u32, u32), usize>,
}

impl ClusterConfig {
    pub fn new(cluster_id: u32, cluster_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            cluster_id,
            cluster_name: cluster_name.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn max_node_id(&self) -> u32 {
        self.nodes.len().saturating_sub(1) as u32
    }

    pub fn num_nodes(&self) -> u32 {
        self.counts.total()
    }

    pub fn num_comms(&self) -> u32 {
        self.comms.len() as u32
    }

    /// Insert a node at its node id. Duplicate definitions are an error.
    pub fn add_node(&mut self, node: NodeConfig) -> Result<()> {
        let id = node.node_id();
        if id == 0 {
            return Err(Error::Config("node id 0 is not allowed".into()));
        }
        let ix = id as usize;
        if self.nodes.len() <= ix {
            self.nodes.resize_with(ix + 1, || None);
        }
        if self.nodes[ix].is_some() {
            return Err(Error::Config(format!("node {} defined twice", id)));
        }
        self.counts.bump(node.kind);
        self.nodes[ix] = Some(node);
        Ok(())
    }

    pub fn node(&self, node_id: u32) -> Option<&NodeConfig> {
        self.nodes.get(node_id as usize)?.as_ref()
    }

    pub fn node_mut(&mut self, node_id: u32) -> Option<&mut NodeConfig> {
        self.nodes.get_mut(node_id as usize)?.as_mut()
    }

    pub fn node_kind(&self, node_id: u32) -> Option<NodeKind> {
        self.node(node_id).map(|n| n.kind)
    }

    /// Populated node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| i as u32)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter_map(|n| n.as_ref())
    }

    /// Configured node ids of one kind in ascending order. Used by the
    /// cluster server when a client asks for "any" node id.
    pub fn node_ids_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = u32> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(move |(_, n)| n.as_ref().map(|n| n.kind) == Some(kind))
            .map(|(id, _)| id as u32)
    }

    /// Insert an explicitly configured comm section. Default sections
    /// are never inserted; synthesis happens at serialization time.
    pub fn add_comm(&mut self, comm: CommConfig) -> Result<()> {
        let key = comm.pair_key();
        if self.comm_index.contains_key(&key) {
            return Err(Error::Config(format!(
                "socket section for nodes {} and {} defined twice",
                key.0, key.1
            )));
        }
        self.comm_index.insert(key, self.comms.len());
        self.comms.push(comm);
        Ok(())
    }

    /// O(1) lookup of an explicit comm section; symmetric in (a, b).
    pub fn lookup_comm(&self, a: u32, b: u32) -> Option<&CommConfig> {
        let key = (a.min(b), a.max(b));
        self.comm_index.get(&key).map(|&ix| &self.comms[ix])
    }

    pub fn comms(&self) -> impl Iterator<Item = &CommConfig> {
        self.comms.iter()
    }

    /// All node pairs that need a comm section when serializing for
    /// `composite_version`. Legacy peers connect data servers only; an
    /// iClaustron grid is fully connected.
    pub fn connected_pairs(&self, composite_version: u64) -> Vec<(u32, u32)> {
        let fully_connected = version::is_iclaustron(composite_version);
        let ids: Vec<u32> = self.node_ids().collect();
        let mut pairs = Vec::new();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                let a_ds = self.node_kind(a) == Some(NodeKind::DataServer);
                let b_ds = self.node_kind(b) == Some(NodeKind::DataServer);
                if fully_connected || a_ds || b_ds {
                    pairs.push((a, b));
                }
            }
        }
        pairs
    }

    /// The comm section for a pair: the explicit one if configured,
    /// otherwise one synthesized from defaults plus the endpoints'
    /// hostname and port number. `a < b` is not required.
    pub fn comm_for_pair(&self, a: u32, b: u32) -> Result<CommConfig> {
        if let Some(c) = self.lookup_comm(a, b) {
            return Ok(c.clone());
        }
        let (node1, node2) = (a.min(b), a.max(b));
        let kind1 = self.node_kind(node1).ok_or(Error::NoSuchNode(node1))?;
        let kind2 = self.node_kind(node2).ok_or(Error::NoSuchNode(node2))?;

        // The data-server side serves when exactly one endpoint is a
        // data server; otherwise the numerically lower node id does.
        let server_id = if kind1 == NodeKind::DataServer || kind2 != NodeKind::DataServer {
            node1
        } else {
            node2
        };
        let client_id = if server_id == node1 { node2 } else { node1 };
        let server = self.node(server_id).ok_or(Error::NoSuchNode(server_id))?;
        let client = self.node(client_id).ok_or(Error::NoSuchNode(client_id))?;

        let mut comm = CommConfig::new(node1, node2);
        comm.params.set_num(ID_SERVER_NODE_ID, server_id as u64);
        comm.params
            .set_num(ID_SERVER_PORT, server.port_number() as u64);
        comm.params
            .set_num(ID_CLIENT_PORT, client.port_number() as u64);
        comm.params.set_str(ID_FIRST_HOSTNAME, server.hostname());
        comm.params.set_str(ID_SECOND_HOSTNAME, client.hostname());
        Ok(comm)
    }

    /// Apply the path derivation rules to every data server.
    pub fn apply_derived_defaults(&mut self) {
        for node in self.nodes.iter_mut().filter_map(|n| n.as_mut()) {
            node.apply_derived_paths();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::section::{ID_HOSTNAME, ID_NODE_DATA_PATH, ID_NODE_ID, ID_PORT_NUMBER};

    fn node(kind: NodeKind, id: u32, host: &str, port: u64) -> NodeConfig {
        let mut n = NodeConfig::new(kind);
        n.params.set_num(ID_NODE_ID, id as u64);
        n.params.set_str(ID_HOSTNAME, host);
        n.params.set_str(ID_NODE_DATA_PATH, "/var/lib/gridion");
        n.params.set_num(ID_PORT_NUMBER, port);
        n
    }

    /// Two data servers, one client, one cluster server.
    fn four_node_cluster() -> ClusterConfig {
        let mut c = ClusterConfig::new(0, "kalmar", "secret");
        c.add_node(node(NodeKind::DataServer, 1, "ds1", 1500)).unwrap();
        c.add_node(node(NodeKind::DataServer, 2, "ds2", 1501)).unwrap();
        c.add_node(node(NodeKind::Client, 3, "api1", 1502)).unwrap();
        c.add_node(node(NodeKind::ClusterServer, 4, "cs1", 1186)).unwrap();
        c
    }

    #[test]
    fn test_counts_and_pairs() {
        let c = four_node_cluster();
        assert_eq!(c.num_nodes(), 4);
        assert_eq!(c.max_node_id(), 4);
        // every data server to every other node, plus data-to-data
        let pairs = c.connected_pairs(version::make(0x5011E, 0));
        assert_eq!(pairs.len(), 5);
        assert!(pairs.contains(&(1, 2)));
        assert!(!pairs.contains(&(3, 4)));
        // a grid peer gets the fully connected set
        let pairs = c.connected_pairs(version::make(0x5011E, 0x10001));
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn test_synthesized_comm_server_side() {
        let c = four_node_cluster();
        // data-to-data: lower id serves
        let comm = c.comm_for_pair(1, 2).unwrap();
        assert_eq!(comm.server_node_id(), 1);
        assert_eq!(comm.server_port(), 1500);
        assert_eq!(comm.first_hostname(), "ds1");
        assert_eq!(comm.second_hostname(), "ds2");
        // data server vs client: the data server serves
        let comm = c.comm_for_pair(3, 2).unwrap();
        assert_eq!(comm.server_node_id(), 2);
        assert_eq!(comm.first_hostname(), "ds2");
        // no data server involved: lower id serves
        let comm = c.comm_for_pair(4, 3).unwrap();
        assert_eq!(comm.server_node_id(), 3);
    }

    #[test]
    fn test_explicit_comm_wins() {
        let mut c = four_node_cluster();
        let mut comm = CommConfig::new(1, 2);
        comm.params.set_num(ID_SERVER_NODE_ID, 2);
        comm.params.set_num(ID_SERVER_PORT, 7777);
        c.add_comm(comm).unwrap();
        assert_eq!(c.num_comms(), 1);
        let found = c.comm_for_pair(2, 1).unwrap();
        assert_eq!(found.server_node_id(), 2);
        assert_eq!(found.server_port(), 7777);
    }

    #[test]
    fn test_lookup_comm_symmetric() {
        let mut c = four_node_cluster();
        c.add_comm(CommConfig::new(1, 3)).unwrap();
        assert!(c.lookup_comm(1, 3).is_some());
        assert!(c.lookup_comm(3, 1).is_some());
        assert!(c.lookup_comm(1, 2).is_none());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut c = four_node_cluster();
        let err = c.add_node(node(NodeKind::Client, 3, "dup", 1000));
        assert!(err.is_err());
    }

    #[test]
    fn test_duplicate_comm_rejected() {
        let mut c = four_node_cluster();
        c.add_comm(CommConfig::new(1, 2)).unwrap();
        assert!(c.add_comm(CommConfig::new(2, 1)).is_err());
    }
}
