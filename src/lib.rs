//! Gridion - Distributed Database Cluster Control Plane
//!
//! Gridion administers grids of database clusters: cluster servers own
//! the authoritative configuration and serve it to every node over the
//! management protocol, the data-api core carries messages between
//! nodes, and a process controller on every host starts and supervises
//! the cluster binaries.
//!
//! # Architecture
//!
//! - The configuration lives in a parameter catalog ([`params`]), an
//!   in-memory grid model ([`model`]), versioned text files with an
//!   atomic rewrite protocol ([`conf_file`]), and a checksummed binary
//!   envelope for the wire ([`proto::codec`]).
//! - The management protocol ([`mgmt`]) assigns node ids, ships the
//!   configuration and converts connections into transporters.
//! - The data-api core ([`apid`]) runs per-peer send nodes with an
//!   adaptive batching algorithm and receive tasks that carve messages
//!   out of shared pages.
//! - The process controller ([`pcntrl`]) keeps a keyed registry of the
//!   processes it spawned and reconciles it against the living ones.

pub mod apid;
pub mod conf_file;
pub mod config;
pub mod error;
pub mod mgmt;
pub mod model;
pub mod osutil;
pub mod params;
pub mod pcntrl;
pub mod proto;

pub use config::GridionConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::GridionConfig;
    pub use crate::conf_file::ConfigDir;
    pub use crate::error::{Error, Result};
    pub use crate::mgmt::{ClusterServer, ConfigClient};
    pub use crate::model::{ApiConfig, ClusterConfig, GridConfig, NodeConfig, NodeKind};
    pub use crate::params::{ParamRegistry, SectionKind};
    pub use crate::pcntrl::ProcessController;
}
