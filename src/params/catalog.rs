//! The parameter catalog.
//!
//! Every tunable of the grid configuration, registered in dense order.
//! Ids are wire ids; the dense order here is also the order sections are
//! serialized in.

use super::{mask_of, ChangeClass, ParamType, RegistryBuilder, SectionKind, MAX_NODE_ID};

use ChangeClass::*;
use ParamType::*;
use SectionKind::*;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Kinds that describe a node (everything except comm and system).
const NODE_KINDS: u32 = mask_of(&[
    DataServer,
    Client,
    ClusterServer,
    SqlServer,
    RepServer,
    FileServer,
    Restore,
    ClusterMgr,
]);

/// Client-side kinds: everything that talks to data servers as an API.
const CLIENT_KINDS: u32 = mask_of(&[Client, SqlServer, RepServer, FileServer, Restore, ClusterMgr]);

const DS: u32 = mask_of(&[DataServer]);
const CS: u32 = mask_of(&[ClusterServer]);
const COMM: u32 = mask_of(&[Comm]);
const SYSTEM: u32 = mask_of(&[System]);
const DS_CS_CLIENT: u32 = mask_of(&[DataServer, ClusterServer, Client]);
const CLIENT_CS: u32 = mask_of(&[Client, ClusterServer]);

pub(super) fn register_all(b: &mut RegistryBuilder) {
    node_common(b);
    data_server(b);
    log_levels(b);
    client_and_cluster_server(b);
    comm(b);
    system(b);
}

/// Parameters shared by every node record. The first three are the
/// leading mandatory fields of all node sections.
fn node_common(b: &mut RegistryBuilder) {
    b.entry(1, "inject_fault", U32, 2, DS, Online)
        .min_max(0, 2)
        .desc("Inject faults (only available in special test builds)");

    b.entry(3, "node_id", U32, 0, NODE_KINDS, NotChangeable)
        .min_max(1, MAX_NODE_ID as u64)
        .mandatory()
        .key()
        .desc("Node id");

    b.entry(5, "hostname", Str, 0, NODE_KINDS, ClusterRestart)
        .mandatory()
        .desc("Hostname of the node");

    b.entry(7, "node_data_path", Str, 0, NODE_KINDS, InitialNodeRestart)
        .mandatory()
        .desc("Data directory of the node");

    b.entry(9, "network_buffer_size", U32, 12 * MB, DS_CS_CLIENT, Online)
        .min(1 * MB)
        .desc("The total size of the network buffers used in the node");

    // Port number is borrowed by synthesized comm sections and is not
    // itself shipped in the envelope.
    b.entry(997, "port_number", U32, 1187, NODE_KINDS, RollingUpgrade)
        .min_max(0, 65535)
        .not_sent()
        .desc("Port number the node's transporter server listens on");
}

fn data_server(b: &mut RegistryBuilder) {
    b.entry(100, "max_number_of_trace_files", U32, 25, DS, Online)
        .min_max(1, 2048)
        .desc("The number of crashes that can be reported before we overwrite error log and trace files");

    b.entry(101, "number_of_replicas", U32, 0, DS, NotChangeable)
        .min_max(1, 4)
        .mandatory()
        .desc("Number of nodes per node group, within a node group all nodes contain the same data");

    b.entry(102, "number_of_table_objects", U32, 256, DS, RollingUpgrade)
        .min(32)
        .desc("Maximum number of tables that can be stored in cluster");

    b.entry(103, "number_of_column_objects", U32, 2048, DS, RollingUpgrade)
        .min(256)
        .desc("Maximum number of columns that can be stored in cluster");

    b.entry(104, "number_of_key_objects", U32, 256, DS, RollingUpgrade)
        .min(32)
        .desc("Maximum number of keys that can be stored in cluster");

    b.entry(105, "number_of_internal_trigger_objects", U32, 1536, DS, RollingUpgrade)
        .min(512)
        .desc("Each unique index will use 3 internal trigger objects, index/backup will use 1 per table");

    b.entry(106, "number_of_connection_objects", U32, 8192, DS, ClusterRestart)
        .min(128)
        .desc("Each active transaction and active scan uses a connection object");

    b.entry(107, "number_of_operation_objects", U32, 32768, DS, ClusterRestart)
        .min(1024)
        .desc("Each record read/updated in a transaction uses an operation object during the transaction");

    b.entry(108, "number_of_scan_objects", U32, 128, DS, RollingUpgrade)
        .min_max(32, 512)
        .desc("Each active scan uses a scan object for the lifetime of the scan operation");

    b.entry(109, "number_of_internal_trigger_operation_objects", U32, 4000, DS, RollingUpgrade)
        .min_max(4000, 4000)
        .not_configurable()
        .desc("Each internal trigger that is fired uses an operation object for a short time");

    b.entry(110, "number_of_key_operation_objects", U32, 4096, DS, ClusterRestart)
        .min(128)
        .desc("Each read and update of an unique hash index in a transaction uses one of those objects");

    b.entry(111, "size_of_connection_buffer", U32, 1 * MB, DS, RollingUpgrade)
        .min_max(1 * MB, 1 * MB)
        .not_configurable()
        .desc("Internal buffer used by connections by transactions and scans");

    b.entry(112, "size_of_ram_memory", U64, 256 * MB, DS, RollingUpgrade)
        .min(16 * MB)
        .desc("Size of memory used to store RAM-based records");

    b.entry(113, "size_of_hash_memory", U64, 64 * MB, DS, RollingUpgrade)
        .min(8 * MB)
        .desc("Size of memory used to store primary hash index on all tables and unique hash indexes");

    b.entry(114, "use_unswappable_memory", Bool, 0, DS, RollingUpgrade)
        .desc("Lock all node memory so it is never swapped out");

    b.entry(115, "timer_wait_partial_start", U32, 20000, DS, RollingUpgrade)
        .desc("Time in ms cluster will wait before starting with a partial set of nodes, 0 waits forever");

    b.entry(116, "timer_wait_partitioned_start", U32, 0, DS, RollingUpgrade)
        .desc("Time in ms cluster will wait before starting a potentially partitioned cluster, 0 waits forever");

    b.entry(117, "timer_wait_error_start", U32, 0, DS, RollingUpgrade)
        .desc("Time in ms cluster will wait before forcing a stop after an error, 0 waits forever");

    b.entry(118, "timer_heartbeat_data_server_nodes", U32, 700, DS, RollingUpgradeSpecial)
        .min(10)
        .desc("Time in ms between heartbeat messages to data servers, 4 missed leads to node crash");

    b.entry(119, "timer_heartbeat_client_nodes", U32, 1000, DS, RollingUpgradeSpecial)
        .min(10)
        .desc("Time in ms between heartbeat messages to client nodes, 4 missed leads to node crash");

    b.entry(120, "timer_local_checkpoint", U32, 24, DS, Online)
        .min_max(6, 31)
        .desc("How often local checkpoints are executed, logarithmic scale on log size");

    b.entry(121, "timer_global_checkpoint", U32, 1000, DS, Online)
        .min(10)
        .desc("Time in ms between starting global checkpoints");

    b.entry(122, "timer_resolve", U32, 2000, DS, Online)
        .min(10)
        .desc("Time in ms waiting for response from resolve");

    b.entry(123, "timer_data_server_watchdog", U32, 6000, DS, Online)
        .min(1000)
        .desc("Time in ms without activity before the data server watchdog is fired");

    b.entry(124, "data_server_automatic_restart", Bool, 1, DS, Online)
        .desc("If set, data server restarts automatically after a failure");

    b.entry(125, "filesystem_path", Str, 0, DS, InitialNodeRestart)
        .derived_default()
        .desc("Path to filesystem of data server");

    b.entry(126, "number_of_redo_log_files", U32, 32, DS, InitialNodeRestart)
        .min(4)
        .desc("Number of REDO log files, each file represents 64 MB log space");

    b.deprecated(127, "ds_reserved_127");
    b.deprecated(128, "ds_reserved_128");

    b.entry(129, "timer_check_interval", U32, 500, DS, NotChangeable)
        .min_max(500, 500)
        .not_configurable()
        .desc("Time in ms between checks after transaction timeouts");

    b.entry(130, "timer_client_activity", U32, 1024 * MB, DS, Online)
        .min(1000)
        .desc("Time in ms before transaction is aborted due to client inactivity");

    b.entry(131, "timer_deadlock", U32, 2000, DS, Online)
        .min(1000)
        .desc("Time in ms before transaction is aborted due to internal wait (indication of deadlock)");

    b.entry(132, "number_of_checkpoint_objects", U32, 1, DS, NotChangeable)
        .min_max(1, 1)
        .not_configurable()
        .desc("Number of possible parallel backups and local checkpoints");

    b.entry(133, "checkpoint_memory", U32, 4 * MB, DS, NotChangeable)
        .min_max(4 * MB, 4 * MB)
        .not_configurable()
        .desc("Size of memory buffers for local checkpoint and backup");

    b.entry(134, "checkpoint_data_memory", U32, 2 * MB, DS, NotChangeable)
        .min_max(2 * MB, 2 * MB)
        .not_configurable()
        .desc("Size of data memory buffers for local checkpoint and backup");

    b.entry(135, "checkpoint_log_memory", U32, 2 * MB, DS, NotChangeable)
        .min_max(2 * MB, 2 * MB)
        .not_configurable()
        .desc("Size of log memory buffers for local checkpoint and backup");

    b.entry(136, "checkpoint_write_size", U32, 64 * KB, DS, NotChangeable)
        .min_max(64 * KB, 64 * KB)
        .not_configurable()
        .desc("Size of default writes in local checkpoint and backups");

    b.deprecated(137, "ds_reserved_137");
    b.deprecated(138, "ds_reserved_138");

    b.entry(139, "checkpoint_max_write_size", U32, 256 * KB, DS, NotChangeable)
        .min_max(256 * KB, 256 * KB)
        .not_configurable()
        .desc("Size of maximum writes in local checkpoint and backups");

    b.entry(140, "size_of_redo_log_files", U32, 16 * MB, DS, InitialNodeRestart)
        .min_max(4 * MB, 2000 * MB)
        .min_ndb_version(0x50119)
        .desc("Size of REDO log files");

    b.entry(141, "data_server_initial_watchdog_timer", U32, 15000, DS, Online)
        .min(100)
        .min_ndb_version(0x50119)
        .desc("Initial value of watchdog timer before communication set-up");

    b.entry(148, "data_server_volatile_mode", Bool, 0, DS, RollingUpgrade)
        .desc("In this mode all file writes are ignored and all starts become initial starts");

    b.entry(149, "number_of_ordered_key_objects", U32, 128, DS, RollingUpgrade)
        .min(32)
        .desc("Maximum number of ordered keys that can be stored in cluster");

    b.entry(150, "number_of_unique_hash_key_objects", U32, 128, DS, RollingUpgrade)
        .min(32)
        .desc("Maximum number of unique hash keys that can be stored in cluster");

    b.deprecated(151, "ds_reserved_151");
    b.deprecated(152, "ds_reserved_152");

    b.entry(153, "size_of_scan_batch", U32, 64, DS, NotChangeable)
        .min_max(64, 64)
        .not_configurable()
        .desc("Number of records sent in a scan from the local data server node");

    b.deprecated(154, "ds_reserved_154");
    b.deprecated(155, "ds_reserved_155");

    b.entry(156, "redo_log_memory", U32, 16 * MB, DS, RollingUpgrade)
        .min(1 * MB)
        .desc("Size of REDO log memory buffer");

    b.entry(157, "long_message_memory", U32, 1 * MB, DS, NotChangeable)
        .min_max(1 * MB, 1 * MB)
        .not_configurable()
        .desc("Size of long message buffers");

    b.entry(158, "data_server_checkpoint_path", Str, 0, DS, InitialNodeRestart)
        .derived_default()
        .desc("Path to filesystem of checkpoints");

    b.entry(159, "data_server_max_open_files", U32, 40, DS, NotChangeable)
        .min_max(40, 40)
        .not_configurable()
        .desc("Maximum number of open files in data server node");

    b.entry(160, "page_cache_size", U64, 128 * MB, DS, RollingUpgrade)
        .min(64 * KB)
        .desc("Size of page cache for disk-based data");

    b.entry(161, "size_of_string_memory", U32, 0, DS, NotChangeable)
        .min_max(0, 0)
        .not_configurable()
        .desc("Size of string memory");

    b.entry(162, "data_server_open_files", U32, 27, DS, NotChangeable)
        .min_max(27, 27)
        .not_configurable()
        .desc("Number of open file handles in data server from start");

    b.entry(163, "data_server_file_synch_size", U32, 4 * MB, DS, Online)
        .min(1 * MB)
        .desc("Size of file writes before a synch is always used");

    b.entry(164, "data_server_disk_write_speed", U32, 8 * MB, DS, Online)
        .min(64 * KB)
        .desc("Limit on how fast checkpoints are allowed to write to disk");

    b.entry(165, "data_server_disk_write_speed_start", U32, 256 * MB, DS, Online)
        .min(1 * MB)
        .desc("Limit on how fast checkpoints are allowed to write to disk during node start");

    b.entry(166, "data_server_report_memory_frequency", U32, 0, DS, Online)
        .desc("Frequency of memory reports, 0 means only at certain thresholds");

    b.entry(167, "data_server_backup_status_frequency", U32, 0, DS, Online)
        .desc("Frequency of backup status, 0 means no status reporting except at end");

    b.entry(168, "use_o_direct", Bool, 1, DS, RollingUpgrade)
        .min_ndb_version(0x50119)
        .desc("Use O_DIRECT on file system of data servers");

    b.entry(169, "data_server_max_allocate_size", U32, 32 * MB, DS, InitialNodeRestart)
        .min_max(1 * MB, 1000 * MB)
        .min_ndb_version(0x50119)
        .desc("Size of maximum extent allocated at a time for table memory");

    b.entry(170, "group_commit_delay", U32, 0, DS, Online)
        .min_ndb_version(0x50119)
        .desc("Time in ms the group commit of the REDO log is delayed");

    b.entry(171, "group_commit_timeout", U32, 4000, DS, Online)
        .min_ndb_version(0x50119)
        .desc("Time in ms a group commit may be outstanding before node failure handling starts");

    b.entry(172, "use_backup_compression", Bool, 0, DS, RollingUpgrade)
        .min_ndb_version(0x6030F)
        .desc("Compress backup files");

    b.entry(173, "use_local_checkpoint_compression", Bool, 0, DS, RollingUpgrade)
        .min_ndb_version(0x6030F)
        .desc("Compress local checkpoint files");

    b.entry(174, "scheduler_no_send_time", U32, 0, DS, Online)
        .max(1000)
        .min_ndb_version(0x60316)
        .desc("Time in microseconds the scheduler executes without sending messages");

    b.entry(175, "scheduler_no_sleep_time", U32, 0, DS, Online)
        .max(1000)
        .min_ndb_version(0x60316)
        .desc("Time in microseconds the scheduler executes without going to sleep");

    b.entry(176, "use_rt_scheduler_threads", Bool, 0, DS, Online)
        .min_ndb_version(0x60316)
        .desc("Run the block threads with real-time priority");

    // The original registers this field name on two ids; both are kept.
    b.entry(177, "lock_main_thread", U32, 65535, DS, Online)
        .max(65535)
        .min_ndb_version(0x60316)
        .desc("Lock main thread to a CPU, 65535 means not locked");

    b.entry(178, "lock_main_thread", U32, 65535, DS, Online)
        .max(65535)
        .min_ndb_version(0x60316)
        .desc("Lock main thread to a CPU, 65535 means not locked");

    b.entry(179, "data_server_max_local_triggers", U32, 0, DS, RollingUpgrade)
        .min_ndb_version(0x60316)
        .desc("Max number of local triggers defined in a data server");

    b.entry(180, "data_server_max_local_trigger_users", U32, 0, DS, RollingUpgrade)
        .min_ndb_version(0x60316)
        .desc("Max number of local trigger user nodes");

    b.entry(181, "data_server_max_local_trigger_operations", U32, 0, DS, RollingUpgrade)
        .min_ndb_version(0x60316)
        .desc("Max number of local trigger operations");

    b.entry(182, "data_server_max_stored_group_commits", U32, 0, DS, RollingUpgrade)
        .min_ndb_version(0x60316)
        .desc("Max number of group commits we will store information about");

    b.entry(183, "data_server_local_trigger_handover_timeout", U32, 0, DS, RollingUpgrade)
        .min_ndb_version(0x60316)
        .desc("Maximum time to wait when performing a handover during local trigger definitions");

    b.entry(184, "data_server_report_startup_frequency", U32, 0, DS, Online)
        .min_ndb_version(0x60401)
        .desc("How often to issue status reports during node startup");

    b.entry(185, "data_server_node_group", U32, 0, DS, NotChangeable)
        .min_max(0, MAX_NODE_ID as u64)
        .min_ndb_version(0x60401)
        .desc("Node group of the data server node");

    b.entry(186, "data_server_threads", U32, 8, DS, ClusterRestart)
        .min_max(3, 8)
        .min_ndb_version(0x60401)
        .desc("Number of threads that can be used maximally by the data server");

    b.entry(187, "data_server_local_db_threads", U32, 4, DS, NodeRestart)
        .min_max(1, 4)
        .min_ndb_version(0x60401)
        .desc("Number of threads used by the local database part");

    b.entry(188, "data_server_local_db_workers", U32, 4, DS, ClusterRestart)
        .min_max(1, 4)
        .min_ndb_version(0x60401)
        .desc("Number of partitions used by the local database part");

    b.entry(189, "data_server_zero_redo_log", Str, 0, DS, ClusterRestart)
        .default_str("sparse")
        .min_ndb_version(0x60401)
        .desc("Initialise REDO log during initial start (sparse or full)");

    b.entry(190, "data_server_file_thread_pool", U32, 8, DS, ClusterRestart)
        .min_ndb_version(0x60401)
        .desc("Number of threads used for disk data file threads");

    b.entry(198, "data_server_memory_pool", U64, 0, DS, RollingUpgrade)
        .desc("Size of memory pool for internal memory usage");
}

fn log_levels(b: &mut RegistryBuilder) {
    let levels: [(u16, &'static str, &'static str); 12] = [
        (250, "log_level_start", "Log level at start of a node"),
        (251, "log_level_stop", "Log level at stop of a node"),
        (252, "log_level_statistics", "Log level of statistics on a node"),
        (253, "log_level_checkpoint", "Log level at checkpoint of a node"),
        (254, "log_level_restart", "Log level at restart of a node"),
        (255, "log_level_connection", "Log level of connections to a node"),
        (256, "log_level_reports", "Log level of reports from a node"),
        (257, "log_level_warning", "Log level of warnings from a node"),
        (258, "log_level_error", "Log level of errors from a node"),
        (259, "log_level_congestion", "Log level of congestions to a node"),
        (260, "log_level_debug", "Log level of debug messages from a node"),
        (261, "log_level_backup", "Log level of backups at a node"),
    ];
    for (id, name, desc) in levels {
        b.entry(id, name, U32, 8, DS, Online).min_max(0, 15).desc(desc);
    }
}

fn client_and_cluster_server(b: &mut RegistryBuilder) {
    b.entry(200, "client_resolve_rank", U32, 0, CLIENT_CS, ClusterRestart)
        .min_max(0, 2)
        .desc("Rank in resolving network partition of the client");

    b.entry(201, "client_resolve_timer", U32, 0, CLIENT_CS, ClusterRestart)
        .desc("Time in ms waiting for resolve before crashing");

    b.entry(202, "reserved_send_buffer", U32, 0, DS, NotChangeable)
        .min_max(0, 0)
        .not_configurable()
        .desc("Send buffer memory reserved for data server traffic, not used");

    b.entry(300, "cluster_server_port_number", U32, 1186, CS, ClusterRestart)
        .min_max(0, 65535)
        .desc("Port number of cluster server");

    b.entry(800, "client_max_batch_byte_size", U32, 256 * KB, CLIENT_KINDS, Online)
        .min_max(32 * KB, 4 * MB)
        .desc("Size in bytes of max of the sum of the batches in a scan operation");

    b.entry(801, "client_batch_byte_size", U32, 8192, CLIENT_KINDS, Online)
        .min_max(128, 65536)
        .desc("Size in bytes of batches in scan operations");

    b.entry(802, "client_batch_size", U32, 64, CLIENT_KINDS, Online)
        .min_max(1, 992)
        .desc("Size in number of records of batches in scan operations");
}

fn comm(b: &mut RegistryBuilder) {
    b.entry(400, "first_node_id", U16, 0, COMM, NotChangeable)
        .min_max(1, MAX_NODE_ID as u64)
        .mandatory()
        .key()
        .desc("First node id of the connection");

    b.entry(401, "second_node_id", U16, 0, COMM, NotChangeable)
        .min_max(1, MAX_NODE_ID as u64)
        .mandatory()
        .key()
        .desc("Second node id of the connection");

    b.entry(402, "use_message_id", Bool, 0, COMM, RollingUpgrade)
        .desc("Message ids on the wire help finding problems related to distributed execution");

    b.entry(403, "use_checksum", Bool, 0, COMM, RollingUpgrade)
        .desc("Checksums ensure that internal bugs do not corrupt data while in buffers");

    b.entry(406, "server_port_number", U16, 0, COMM, ClusterRestart)
        .min_max(0, 65535)
        .mandatory()
        .derived_default()
        .desc("Port number to use on server side");

    b.entry(407, "first_hostname", Str, 0, COMM, RollingUpgrade)
        .derived_default()
        .desc("Hostname of first node");

    b.entry(408, "second_hostname", Str, 0, COMM, RollingUpgrade)
        .derived_default()
        .desc("Hostname of second node");

    b.entry(409, "socket_group", U16, 55, COMM, RollingUpgrade)
        .min_max(55, 55)
        .not_configurable()
        .desc("Group id of the connection");

    b.entry(410, "server_node_id", U16, 0, COMM, NotChangeable)
        .min_max(1, MAX_NODE_ID as u64)
        .mandatory()
        .derived_default()
        .desc("Node id of node that is server part of connection");

    b.entry(411, "socket_overload", U32, 0, COMM, NotChangeable)
        .min_max(0, 0)
        .not_configurable()
        .desc("Number of bytes before overload declared, deprecated");

    b.entry(420, "client_port_number", U16, 0, COMM, ClusterRestart)
        .min_max(0, 65535)
        .derived_default()
        .iclaustron_only()
        .desc("Port number to use on client side");

    b.entry(454, "socket_write_buffer_size", U32, 256 * KB, COMM, RollingUpgrade)
        .min(128 * KB)
        .desc("Size of write buffer in front of socket");

    b.entry(455, "socket_read_buffer_size", U32, 256 * KB, COMM, RollingUpgrade)
        .min(64 * KB)
        .desc("Size of read buffer in front of socket");

    b.entry(457, "socket_kernel_read_buffer_size", U32, 128 * KB, COMM, RollingUpgrade)
        .min_max(64 * KB, 256 * KB)
        .desc("Size of receive buffer for socket in OS kernel");

    b.entry(458, "socket_kernel_write_buffer_size", U32, 128 * KB, COMM, RollingUpgrade)
        .min_max(64 * KB, 256 * MB)
        .desc("Size of send buffer of socket inside the OS kernel");

    b.entry(459, "socket_maxseg_size", U32, 0, COMM, RollingUpgrade)
        .max(128 * MB)
        .desc("TCP_MAXSEG on socket");

    b.entry(460, "socket_bind_address", Bool, 0, COMM, RollingUpgrade)
        .desc("Bind to IP address of server");

    // Only used for non-forced sends; setting it to zero disables the
    // adaptive send algorithm entirely.
    b.entry(489, "socket_max_wait_in_nanos", U32, 50 * 1000, COMM, Online)
        .max(10 * 1000 * 1000)
        .iclaustron_only()
        .desc("Maximum time a message can wait before being sent in nanoseconds");
}

fn system(b: &mut RegistryBuilder) {
    b.entry(1001, "system_primary_cs_node", U16, 0, SYSTEM, NotChangeable)
        .min_max(0, MAX_NODE_ID as u64)
        .desc("Primary cluster server node in the grid");

    b.entry(1002, "system_configuration_number", U32, 0, SYSTEM, NotChangeable)
        .desc("Configuration number of grid");

    b.entry(1003, "system_name", Str, 0, SYSTEM, NotChangeable)
        .desc("Name of the grid");
}

#[cfg(test)]
mod tests {
    use crate::params::{ParamRegistry, ParamType, SectionKind};

    #[test]
    fn test_catalog_families_present() {
        let reg = ParamRegistry::global();
        // One probe per family
        for (id, name) in [
            (3u16, "node_id"),
            (101, "number_of_replicas"),
            (125, "filesystem_path"),
            (158, "data_server_checkpoint_path"),
            (250, "log_level_start"),
            (300, "cluster_server_port_number"),
            (400, "first_node_id"),
            (489, "socket_max_wait_in_nanos"),
            (800, "client_max_batch_byte_size"),
            (1003, "system_name"),
        ] {
            assert_eq!(reg.by_id(id).unwrap().name, name);
        }
    }

    #[test]
    fn test_deprecated_ids_accepted() {
        let reg = ParamRegistry::global();
        for id in [127u16, 128, 137, 138, 151, 152, 154, 155] {
            assert!(reg.by_id(id).unwrap().is_deprecated);
        }
    }

    #[test]
    fn test_derived_defaults() {
        let reg = ParamRegistry::global();
        assert!(reg.by_id(125).unwrap().is_derived_default);
        assert!(reg.by_id(158).unwrap().is_derived_default);
        assert!(reg.by_id(406).unwrap().is_derived_default);
        assert!(reg.by_id(410).unwrap().is_derived_default);
    }

    #[test]
    fn test_port_number_not_sent() {
        let reg = ParamRegistry::global();
        let e = reg.by_id(997).unwrap();
        assert!(e.is_not_sent);
        assert!(e.applies_to(SectionKind::DataServer));
        assert!(e.applies_to(SectionKind::Client));
    }

    #[test]
    fn test_comm_key_fields() {
        let reg = ParamRegistry::global();
        assert!(reg.by_id(400).unwrap().is_key);
        assert!(reg.by_id(401).unwrap().is_key);
        assert_eq!(reg.by_id(400).unwrap().data_type, ParamType::U16);
    }
}
