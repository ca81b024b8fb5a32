//! Configuration Model
//!
//! In-memory representation of a grid: clusters, their nodes and the
//! communication links between them.

mod cluster;
mod section;

pub use cluster::{ClusterConfig, NodeCounts};
pub use section::{CommConfig, NodeConfig, NodeKind, ParamMap, ParamValue, SystemConfig};

/// Wire ids of the commonly accessed section fields.
pub mod section_ids {
    pub use super::section::{
        ID_BIND_ADDRESS as BIND_ADDRESS, ID_CHECKPOINT_PATH as CHECKPOINT_PATH,
        ID_CLIENT_PORT as CLIENT_PORT, ID_FILESYSTEM_PATH as FILESYSTEM_PATH,
        ID_FIRST_HOSTNAME as FIRST_HOSTNAME, ID_FIRST_NODE_ID as FIRST_NODE_ID,
        ID_HOSTNAME as HOSTNAME, ID_MAX_WAIT_IN_NANOS as MAX_WAIT_IN_NANOS,
        ID_NODE_DATA_PATH as NODE_DATA_PATH, ID_NODE_ID as NODE_ID,
        ID_PORT_NUMBER as PORT_NUMBER, ID_READ_BUFFER_SIZE as READ_BUFFER_SIZE,
        ID_SECOND_HOSTNAME as SECOND_HOSTNAME, ID_SECOND_NODE_ID as SECOND_NODE_ID,
        ID_SERVER_NODE_ID as SERVER_NODE_ID, ID_SERVER_PORT as SERVER_PORT,
        ID_SYSTEM_CONFIGURATION_NUMBER as SYSTEM_CONFIGURATION_NUMBER,
        ID_SYSTEM_NAME as SYSTEM_NAME, ID_SYSTEM_PRIMARY_CS_NODE as SYSTEM_PRIMARY_CS_NODE,
        ID_USE_CHECKSUM as USE_CHECKSUM, ID_USE_MESSAGE_ID as USE_MESSAGE_ID,
        ID_WRITE_BUFFER_SIZE as WRITE_BUFFER_SIZE,
    };
}

use crate::error::{Error, Result};

/// All clusters of a grid, indexed by cluster id. Slots for absent ids
/// are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridConfig {
    clusters: Vec<Option<ClusterConfig>>,
}

impl GridConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cluster: ClusterConfig) -> Result<()> {
        let id = cluster.cluster_id as usize;
        if self.clusters.len() <= id {
            self.clusters.resize_with(id + 1, || None);
        }
        if self.clusters[id].is_some() {
            return Err(Error::Config(format!("cluster id {} defined twice", id)));
        }
        self.clusters[id] = Some(cluster);
        Ok(())
    }

    pub fn cluster(&self, cluster_id: u32) -> Option<&ClusterConfig> {
        self.clusters.get(cluster_id as usize)?.as_ref()
    }

    pub fn cluster_mut(&mut self, cluster_id: u32) -> Option<&mut ClusterConfig> {
        self.clusters.get_mut(cluster_id as usize)?.as_mut()
    }

    pub fn max_cluster_id(&self) -> u32 {
        self.clusters.len().saturating_sub(1) as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterConfig> {
        self.clusters.iter().filter_map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client-side result of fetching the grid configuration from a cluster
/// server: per-cluster decoded configuration plus the node id the
/// cluster server assigned to us in that cluster.
#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    entries: Vec<Option<ApiClusterEntry>>,
}

#[derive(Debug, Clone)]
pub struct ApiClusterEntry {
    pub config: ClusterConfig,
    pub our_node_id: u32,
}

impl ApiConfig {
    pub fn insert(&mut self, config: ClusterConfig, our_node_id: u32) {
        let id = config.cluster_id as usize;
        if self.entries.len() <= id {
            self.entries.resize_with(id + 1, || None);
        }
        self.entries[id] = Some(ApiClusterEntry { config, our_node_id });
    }

    pub fn cluster(&self, cluster_id: u32) -> Option<&ApiClusterEntry> {
        self.entries.get(cluster_id as usize)?.as_ref()
    }

    pub fn max_cluster_id(&self) -> u32 {
        self.entries.len().saturating_sub(1) as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApiClusterEntry> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }
}
