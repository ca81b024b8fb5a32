//! Gridion Error Types

use thiserror::Error;

/// Result type alias for gridion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes reported by the binaries.
///
/// Codes at or above `FIRST_APP_ERROR` are recoverable protocol declines
/// (for example a cluster server refusing a node id); everything below is
/// a hard failure.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const MEM_ALLOC: i32 = 2;
    pub const PROTOCOL: i32 = 3;
    pub const NODE_DOWN: i32 = 4;
    /// First exit code used for errors an operator can retry after.
    pub const FIRST_APP_ERROR: i32 = 64;
    pub const NOT_MASTER: i32 = 65;
    pub const NOT_READY: i32 = 66;
}

/// Gridion error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config file error at line {line}: {kind}")]
    ConfigFile { line: u32, kind: ConfigFileError },

    // Management protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config envelope checksum mismatch")]
    Checksum,

    #[error("Inconsistent data: {0}")]
    Inconsistent(String),

    #[error("Peer declined: {0}")]
    PeerDeclined(String),

    // Cluster errors
    #[error("No such cluster: {0}")]
    NoSuchCluster(u32),

    #[error("No such node: {0}")]
    NoSuchNode(u32),

    #[error("Node {0} is down")]
    NodeDown(u32),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Timed out waiting for data")]
    DataTimeout,

    // Process controller errors
    #[error("Process start already ongoing")]
    StartAlreadyOngoing,

    #[error("Process already running")]
    ProcessAlreadyRunning,

    #[error("Process stuck in start phase")]
    ProcessStuckInStart,

    #[error("Process already being killed")]
    ProcessAlreadyBeingKilled,

    #[error("Failed to stop process")]
    FailedToStopProcess,

    #[error("Process is not alive")]
    ProcessNotAlive,

    #[error("Process liveness check failed: {0}")]
    ChildCheckFailed(String),

    #[error("Failed to start process: {0}")]
    ChildSpawnFailed(String),

    // Resource errors
    #[error("Memory allocation failed: {0}")]
    MemAlloc(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

/// Error kinds surfaced by the configuration file loader together with
/// the offending line number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigFileError {
    #[error("no such section: {0}")]
    NoSuchSection(String),

    #[error("no section defined yet")]
    NoSectionDefinedYet,

    #[error("no such configuration key: {0}")]
    NoSuchKey(String),

    #[error("key {0} not allowed in this section type")]
    KeyInWrongSection(String),

    #[error("value for {0} is out of bounds")]
    OutOfBounds(String),

    #[error("value for {0} is not a boolean")]
    NotBoolean(String),

    #[error("value for {0} is not a number")]
    NotANumber(String),

    #[error("node {0} defined twice")]
    NodeAlreadyDefined(u32),

    #[error("missing mandatory parameter {0}")]
    MissingMandatory(String),

    #[error("malformed line")]
    Malformed,
}

impl Error {
    /// Check if this error is retryable from the caller's point of view
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::Network(_)
                | Error::PeerDeclined(_)
                | Error::StartAlreadyOngoing
        )
    }

    /// Whether a command handler can keep its connection open after
    /// replying with this error. Protocol and memory errors close the
    /// session; environmental declines do not.
    pub fn keeps_session(&self) -> bool {
        !matches!(
            self,
            Error::Protocol(_)
                | Error::Checksum
                | Error::MemAlloc(_)
                | Error::Io(_)
                | Error::DataTimeout
        )
    }

    /// Map to the exit code the binaries report for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MemAlloc(_) => exit_code::MEM_ALLOC,
            Error::Protocol(_) | Error::Checksum | Error::Inconsistent(_) => exit_code::PROTOCOL,
            Error::NodeDown(_) => exit_code::NODE_DOWN,
            Error::PeerDeclined(msg) if msg.contains("not master") => exit_code::NOT_MASTER,
            Error::PeerDeclined(_) => exit_code::NOT_READY,
            _ => exit_code::GENERIC,
        }
    }
}
