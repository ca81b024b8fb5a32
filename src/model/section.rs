//! Section records: node configurations, communication links and the
//! grid system section, all backed by a tagged-field map keyed by the
//! wire config id.

use std::collections::HashMap;

use crate::params::{ParamEntry, ParamRegistry, ParamType, SectionKind};

/// One stored parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Num(u64),
    Str(String),
}

/// Tagged-field storage for one section. Only explicitly assigned
/// values are stored; reads fall back to the registry default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMap {
    values: HashMap<u16, ParamValue>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_num(&mut self, id: u16, value: u64) {
        self.values.insert(id, ParamValue::Num(value));
    }

    pub fn set_str(&mut self, id: u16, value: impl Into<String>) {
        self.values.insert(id, ParamValue::Str(value.into()));
    }

    pub fn unset(&mut self, id: u16) {
        self.values.remove(&id);
    }

    pub fn is_set(&self, id: u16) -> bool {
        self.values.contains_key(&id)
    }

    pub fn get(&self, id: u16) -> Option<&ParamValue> {
        self.values.get(&id)
    }

    pub fn get_num(&self, id: u16) -> Option<u64> {
        match self.values.get(&id) {
            Some(ParamValue::Num(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, id: u16) -> Option<&str> {
        match self.values.get(&id) {
            Some(ParamValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric value with registry-default fallback.
    pub fn num(&self, entry: &ParamEntry) -> u64 {
        self.get_num(entry.id).unwrap_or(entry.default_num)
    }

    /// String value with registry-default fallback.
    pub fn str<'a>(&'a self, entry: &'a ParamEntry) -> &'a str {
        self.get_str(entry.id).unwrap_or(entry.default_str)
    }

    pub fn num_by_id(&self, id: u16) -> u64 {
        match ParamRegistry::global().by_id(id) {
            Some(e) => self.num(e),
            None => self.get_num(id).unwrap_or(0),
        }
    }

    pub fn str_by_id(&self, id: u16) -> &str {
        match ParamRegistry::global().by_id(id) {
            Some(e) => self.str(e),
            None => self.get_str(id).unwrap_or(""),
        }
    }

    /// Fill in every applicable parameter of `kind` that is unset with
    /// its default, for the entries visible in `version`. Used before
    /// comparing a locally built section against a decoded one.
    pub fn materialize(&mut self, kind: SectionKind, version: u64) {
        for e in ParamRegistry::global().iter_kind(kind) {
            if e.is_deprecated || e.is_not_sent {
                continue;
            }
            if !ParamRegistry::is_entry_used_in_version(e, version) {
                continue;
            }
            if !self.values.contains_key(&e.id) {
                match e.data_type {
                    ParamType::Str => self.set_str(e.id, e.default_str),
                    _ => self.set_num(e.id, e.default_num),
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u16, &ParamValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The node types a cluster can contain. Discriminants are the wire
/// values of the node-type key in every node section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NodeKind {
    DataServer = 1,
    Client = 2,
    ClusterServer = 3,
    SqlServer = 4,
    RepServer = 5,
    FileServer = 6,
    Restore = 7,
    ClusterMgr = 8,
}

impl NodeKind {
    pub fn from_wire(v: u32) -> Option<NodeKind> {
        Some(match v {
            1 => NodeKind::DataServer,
            2 => NodeKind::Client,
            3 => NodeKind::ClusterServer,
            4 => NodeKind::SqlServer,
            5 => NodeKind::RepServer,
            6 => NodeKind::FileServer,
            7 => NodeKind::Restore,
            8 => NodeKind::ClusterMgr,
            _ => return None,
        })
    }

    pub fn section(self) -> SectionKind {
        match self {
            NodeKind::DataServer => SectionKind::DataServer,
            NodeKind::Client => SectionKind::Client,
            NodeKind::ClusterServer => SectionKind::ClusterServer,
            NodeKind::SqlServer => SectionKind::SqlServer,
            NodeKind::RepServer => SectionKind::RepServer,
            NodeKind::FileServer => SectionKind::FileServer,
            NodeKind::Restore => SectionKind::Restore,
            NodeKind::ClusterMgr => SectionKind::ClusterMgr,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::DataServer => "data server",
            NodeKind::Client => "client",
            NodeKind::ClusterServer => "cluster server",
            NodeKind::SqlServer => "sql server",
            NodeKind::RepServer => "replication server",
            NodeKind::FileServer => "file server",
            NodeKind::Restore => "restore",
            NodeKind::ClusterMgr => "cluster manager",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration record of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub kind: NodeKind,
    /// OR of `1 << mandatory_bit` for every mandatory parameter that has
    /// been explicitly assigned.
    pub mandatory_mask: u64,
    pub params: ParamMap,
}

pub const ID_NODE_ID: u16 = 3;
pub const ID_HOSTNAME: u16 = 5;
pub const ID_NODE_DATA_PATH: u16 = 7;
pub const ID_PORT_NUMBER: u16 = 997;
pub const ID_FILESYSTEM_PATH: u16 = 125;
pub const ID_CHECKPOINT_PATH: u16 = 158;

impl NodeConfig {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            mandatory_mask: 0,
            params: ParamMap::new(),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.params.num_by_id(ID_NODE_ID) as u32
    }

    pub fn hostname(&self) -> &str {
        self.params.str_by_id(ID_HOSTNAME)
    }

    pub fn node_data_path(&self) -> &str {
        self.params.str_by_id(ID_NODE_DATA_PATH)
    }

    pub fn port_number(&self) -> u16 {
        self.params.num_by_id(ID_PORT_NUMBER) as u16
    }

    /// Missing mandatory parameters for this node's section kind, by name.
    pub fn missing_mandatory(&self) -> Option<&'static str> {
        let reg = ParamRegistry::global();
        let required = reg.mandatory_mask(self.kind.section());
        let missing = required & !self.mandatory_mask;
        if missing == 0 {
            return None;
        }
        reg.iter_kind(self.kind.section())
            .find(|e| e.is_mandatory && missing & (1 << e.mandatory_bit) != 0)
            .map(|e| e.name)
    }

    /// Apply the derivation rules for unset path parameters.
    pub fn apply_derived_paths(&mut self) {
        if self.kind != NodeKind::DataServer {
            return;
        }
        if !self.params.is_set(ID_FILESYSTEM_PATH) {
            let data_path = self.node_data_path().to_string();
            self.params.set_str(ID_FILESYSTEM_PATH, data_path);
        }
        if !self.params.is_set(ID_CHECKPOINT_PATH) {
            let fs_path = self.params.str_by_id(ID_FILESYSTEM_PATH).to_string();
            self.params.set_str(ID_CHECKPOINT_PATH, fs_path);
        }
    }
}

/// Configuration of one communication link. The unordered node-id pair
/// is the key.
#[derive(Debug, Clone, PartialEq)]
pub struct CommConfig {
    pub mandatory_mask: u64,
    pub params: ParamMap,
}

pub const ID_FIRST_NODE_ID: u16 = 400;
pub const ID_SECOND_NODE_ID: u16 = 401;
pub const ID_USE_MESSAGE_ID: u16 = 402;
pub const ID_USE_CHECKSUM: u16 = 403;
pub const ID_SERVER_PORT: u16 = 406;
pub const ID_FIRST_HOSTNAME: u16 = 407;
pub const ID_SECOND_HOSTNAME: u16 = 408;
pub const ID_SERVER_NODE_ID: u16 = 410;
pub const ID_CLIENT_PORT: u16 = 420;
pub const ID_WRITE_BUFFER_SIZE: u16 = 454;
pub const ID_READ_BUFFER_SIZE: u16 = 455;
pub const ID_BIND_ADDRESS: u16 = 460;
pub const ID_MAX_WAIT_IN_NANOS: u16 = 489;

impl CommConfig {
    pub fn new(first_node_id: u32, second_node_id: u32) -> Self {
        let mut c = Self {
            mandatory_mask: 0,
            params: ParamMap::new(),
        };
        c.params.set_num(ID_FIRST_NODE_ID, first_node_id as u64);
        c.params.set_num(ID_SECOND_NODE_ID, second_node_id as u64);
        c
    }

    pub fn first_node_id(&self) -> u32 {
        self.params.num_by_id(ID_FIRST_NODE_ID) as u32
    }

    pub fn second_node_id(&self) -> u32 {
        self.params.num_by_id(ID_SECOND_NODE_ID) as u32
    }

    /// Normalized key: the unordered pair as (low, high).
    pub fn pair_key(&self) -> (u32, u32) {
        let a = self.first_node_id();
        let b = self.second_node_id();
        (a.min(b), a.max(b))
    }

    pub fn server_node_id(&self) -> u32 {
        self.params.num_by_id(ID_SERVER_NODE_ID) as u32
    }

    pub fn server_port(&self) -> u16 {
        self.params.num_by_id(ID_SERVER_PORT) as u16
    }

    pub fn client_port(&self) -> Option<u16> {
        self.params.get_num(ID_CLIENT_PORT).map(|v| v as u16)
    }

    pub fn first_hostname(&self) -> &str {
        self.params.str_by_id(ID_FIRST_HOSTNAME)
    }

    pub fn second_hostname(&self) -> &str {
        self.params.str_by_id(ID_SECOND_HOSTNAME)
    }

    pub fn use_message_id(&self) -> bool {
        self.params.num_by_id(ID_USE_MESSAGE_ID) != 0
    }

    pub fn use_checksum(&self) -> bool {
        self.params.num_by_id(ID_USE_CHECKSUM) != 0
    }

    pub fn max_wait_in_nanos(&self) -> u64 {
        self.params.num_by_id(ID_MAX_WAIT_IN_NANOS)
    }
}

/// Grid-level system section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemConfig {
    pub params: ParamMap,
}

pub const ID_SYSTEM_PRIMARY_CS_NODE: u16 = 1001;
pub const ID_SYSTEM_CONFIGURATION_NUMBER: u16 = 1002;
pub const ID_SYSTEM_NAME: u16 = 1003;

impl SystemConfig {
    pub fn primary_cs_node(&self) -> u32 {
        self.params.num_by_id(ID_SYSTEM_PRIMARY_CS_NODE) as u32
    }

    pub fn configuration_number(&self) -> u32 {
        self.params.num_by_id(ID_SYSTEM_CONFIGURATION_NUMBER) as u32
    }

    pub fn name(&self) -> &str {
        self.params.str_by_id(ID_SYSTEM_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_map_defaults() {
        let m = ParamMap::new();
        // heartbeat timer falls back to the catalog default
        assert_eq!(m.num_by_id(118), 700);
        let mut m = m;
        m.set_num(118, 900);
        assert_eq!(m.num_by_id(118), 900);
    }

    #[test]
    fn test_node_accessors() {
        let mut n = NodeConfig::new(NodeKind::DataServer);
        n.params.set_num(ID_NODE_ID, 4);
        n.params.set_str(ID_HOSTNAME, "host-a");
        n.params.set_str(ID_NODE_DATA_PATH, "/var/lib/gridion");
        assert_eq!(n.node_id(), 4);
        assert_eq!(n.hostname(), "host-a");
        assert_eq!(n.port_number(), 1187);
    }

    #[test]
    fn test_derived_paths() {
        let mut n = NodeConfig::new(NodeKind::DataServer);
        n.params.set_str(ID_NODE_DATA_PATH, "/data");
        n.apply_derived_paths();
        assert_eq!(n.params.str_by_id(ID_FILESYSTEM_PATH), "/data");
        assert_eq!(n.params.str_by_id(ID_CHECKPOINT_PATH), "/data");

        let mut n = NodeConfig::new(NodeKind::DataServer);
        n.params.set_str(ID_NODE_DATA_PATH, "/data");
        n.params.set_str(ID_FILESYSTEM_PATH, "/fs");
        n.apply_derived_paths();
        assert_eq!(n.params.str_by_id(ID_FILESYSTEM_PATH), "/fs");
        assert_eq!(n.params.str_by_id(ID_CHECKPOINT_PATH), "/fs");
    }

    #[test]
    fn test_missing_mandatory_reported_by_name() {
        let mut n = NodeConfig::new(NodeKind::Client);
        let reg = ParamRegistry::global();
        let node_id = reg.by_id(ID_NODE_ID).unwrap();
        n.params.set_num(ID_NODE_ID, 7);
        n.mandatory_mask |= 1 << node_id.mandatory_bit;
        let missing = n.missing_mandatory().unwrap();
        assert_eq!(missing, "hostname");
    }

    #[test]
    fn test_comm_pair_key_symmetric() {
        let c = CommConfig::new(9, 2);
        assert_eq!(c.pair_key(), (2, 9));
    }
}
