//! Process Controller
//!
//! The host-local daemon that starts, stops, kills and lists cluster
//! binaries on behalf of cluster managers, installs cluster server
//! configuration files, and answers host inventory queries.

pub mod hostinfo;
pub mod registry;
pub mod server;

pub use registry::{ProcessEntry, ProcessFilter, ProcessKey, ProcessRegistry};
pub use server::{proto_str, ProcessController};

/// Default port of the process controller daemon.
pub const DEF_PCNTRL_PORT: u16 = 11860;
