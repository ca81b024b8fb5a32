//! Management Protocol
//!
//! The text protocol between nodes and cluster servers: node-id
//! assignment, configuration download, cluster listing, event reports
//! and the conversion of a management connection into a transporter.

pub mod client;
pub mod server;
pub mod transporter;

pub use client::ConfigClient;
pub use server::{ClusterServer, ClusterServerState, TransporterConn};

/// Protocol literals. One place, both sides.
pub mod proto_str {
    pub const GET_NODEID: &str = "get nodeid";
    pub const GET_NODEID_REPLY: &str = "get nodeid reply";
    pub const GET_CONFIG: &str = "get config";
    pub const GET_CONFIG_REPLY: &str = "get config reply";
    pub const NODEID_PREFIX: &str = "nodeid: ";
    pub const VERSION_PREFIX: &str = "version: ";
    pub const NODETYPE_PREFIX: &str = "nodetype: ";
    pub const USER_LINE: &str = "user: mysqld";
    pub const PASSWORD_LINE: &str = "password: mysqld";
    pub const PUBLIC_KEY_LINE: &str = "public key: a public key";
    pub const ENDIAN_PREFIX: &str = "endian: ";
    pub const ENDIAN_LITTLE: &str = "little";
    pub const ENDIAN_BIG: &str = "big";
    pub const LOG_EVENT_LINE: &str = "log_event: 0";
    pub const CLUSTER_ID_PREFIX: &str = "cluster_id: ";
    pub const RESULT_OK: &str = "result: Ok";
    pub const RESULT_ERROR_PREFIX: &str = "result: Error (";
    pub const CONTENT_LENGTH_PREFIX: &str = "Content-Length: ";
    pub const CONTENT_TYPE_LINE: &str = "Content-Type: ndbconfig/octet-stream";
    pub const CONTENT_ENCODING_LINE: &str = "Content-Transfer-Encoding: base64";

    pub const GET_CLUSTER_LIST: &str = "get cluster list";
    pub const GET_CLUSTER_LIST_REPLY: &str = "get cluster list reply";
    pub const CLUSTER_NAME_PREFIX: &str = "clustername: ";
    pub const CLUSTER_ID_LIST_PREFIX: &str = "clusterid: ";
    pub const END_GET_CLUSTER_LIST: &str = "end get cluster list";

    pub const GET_MGMD_NODEID: &str = "get mgmd nodeid";
    pub const GET_MGMD_NODEID_REPLY: &str = "get mgmd nodeid reply";
    pub const SET_CONNECTION_PARAMETER: &str = "set connection parameter";
    pub const SET_CONNECTION_PARAMETER_REPLY: &str = "set connection parameter reply";
    pub const CONVERT_TRANSPORTER: &str = "transporter connect";

    pub const REPORT_EVENT: &str = "report event";
    pub const REPORT_EVENT_REPLY: &str = "report event reply";
    pub const LENGTH_PREFIX: &str = "length: ";
    pub const DATA_PREFIX: &str = "data: ";

    pub const NDBD: &str = "ndbd";
    pub const NDBD_PASSWD: &str = "ndbd passwd";
    pub const OK: &str = "ok";
    pub const TRANSPORTER_TYPES: &str = "1 1";
}

/// Format an error reply line: `result: Error (<text>)`.
pub fn result_error_line(text: &str) -> String {
    format!("{}{})", proto_str::RESULT_ERROR_PREFIX, text)
}
