//! Configuration file writer.
//!
//! Emits the per-cluster files and the grid index in the same text
//! format the parser reads. Values shared by every node of a type are
//! folded into the `[<type> default]` section; node sections then only
//! carry their own overrides.

use std::fmt::Write as _;

use crate::error::Result;
use crate::model::{section_ids, ClusterConfig, NodeKind, ParamMap};
use crate::params::{ParamEntry, ParamRegistry, ParamType, SectionKind};

use super::parser::ClusterListEntry;

fn section_header(kind: NodeKind, default: bool) -> String {
    if default {
        format!("[{} default]", kind.as_str())
    } else {
        format!("[{}]", kind.as_str())
    }
}

fn value_text(entry: &ParamEntry, params: &ParamMap) -> String {
    match entry.data_type {
        ParamType::Str => params.str(entry).to_string(),
        ParamType::Bool => {
            if params.num(entry) != 0 {
                "true".into()
            } else {
                "false".into()
            }
        }
        _ => params.num(entry).to_string(),
    }
}

/// Is the parameter even worth writing for this kind?
fn writable(entry: &ParamEntry) -> bool {
    !entry.is_deprecated && !entry.is_not_configurable
}

/// Entries all nodes of `kind` agree on, where the shared value differs
/// from the registry default.
fn folded_defaults(cluster: &ClusterConfig, kind: NodeKind) -> Vec<(&'static ParamEntry, String)> {
    let reg = ParamRegistry::global();
    let nodes: Vec<_> = cluster.nodes().filter(|n| n.kind == kind).collect();
    let mut out = Vec::new();
    if nodes.len() < 2 {
        return out;
    }
    for entry in reg.iter_kind(kind.section()) {
        if !writable(entry) || entry.is_key || entry.id == section_ids::NODE_ID {
            continue;
        }
        let first = value_text(entry, &nodes[0].params);
        if nodes.iter().all(|n| value_text(entry, &n.params) == first) {
            let default_text = match entry.data_type {
                ParamType::Str => entry.default_str.to_string(),
                ParamType::Bool => {
                    if entry.default_num != 0 {
                        "true".into()
                    } else {
                        "false".into()
                    }
                }
                _ => entry.default_num.to_string(),
            };
            if first != default_text {
                out.push((entry, first));
            }
        }
    }
    out
}

/// Render one cluster's configuration file.
pub fn render_cluster_file(cluster: &ClusterConfig) -> Result<String> {
    let reg = ParamRegistry::global();
    let mut out = String::new();
    let _ = writeln!(out, "# cluster {} configuration", cluster.cluster_name);

    let kinds_present: Vec<NodeKind> = {
        let mut kinds = Vec::new();
        for n in cluster.nodes() {
            if !kinds.contains(&n.kind) {
                kinds.push(n.kind);
            }
        }
        kinds
    };

    // Default sections first, then the nodes of each kind in node id
    // order, then explicit socket sections.
    for &kind in &kinds_present {
        let folded = folded_defaults(cluster, kind);
        if folded.is_empty() {
            continue;
        }
        out.push('\n');
        out.push_str(&section_header(kind, true));
        out.push('\n');
        for (entry, value) in &folded {
            let _ = writeln!(out, "{}: {}", entry.name, value);
        }
    }

    for &kind in &kinds_present {
        let folded = folded_defaults(cluster, kind);
        for node in cluster.nodes().filter(|n| n.kind == kind) {
            out.push('\n');
            out.push_str(&section_header(kind, false));
            out.push('\n');
            let _ = writeln!(out, "node_id: {}", node.node_id());
            for entry in reg.iter_kind(kind.section()) {
                if !writable(entry) || entry.id == section_ids::NODE_ID {
                    continue;
                }
                if !node.params.is_set(entry.id) {
                    continue;
                }
                let text = value_text(entry, &node.params);
                let in_default = folded
                    .iter()
                    .any(|(e, v)| e.id == entry.id && *v == text);
                if in_default {
                    continue;
                }
                let default_text = match entry.data_type {
                    ParamType::Str => entry.default_str.to_string(),
                    ParamType::Bool => {
                        if entry.default_num != 0 {
                            "true".into()
                        } else {
                            "false".into()
                        }
                    }
                    _ => entry.default_num.to_string(),
                };
                let overridden = folded.iter().any(|(e, _)| e.id == entry.id);
                if text == default_text && !overridden {
                    // derived values equal to their source still need to
                    // reload identically, so only registry defaults fold
                    if !entry.is_derived_default {
                        continue;
                    }
                }
                let _ = writeln!(out, "{}: {}", entry.name, text);
            }
        }
    }

    for comm in cluster.comms() {
        out.push('\n');
        out.push_str("[socket]\n");
        for entry in reg.iter_kind(SectionKind::Comm) {
            if !writable(entry) || !comm.params.is_set(entry.id) {
                continue;
            }
            let _ = writeln!(out, "{}: {}", entry.name, value_text(entry, &comm.params));
        }
    }
    Ok(out)
}

/// Render the grid index file.
pub fn render_grid_index(entries: &[ClusterListEntry]) -> String {
    let mut out = String::from("# grid cluster index\n");
    for e in entries {
        out.push('\n');
        out.push_str("[cluster]\n");
        let _ = writeln!(out, "cluster_name: {}", e.cluster_name);
        let _ = writeln!(out, "cluster_id: {}", e.cluster_id);
        if !e.password.is_empty() {
            let _ = writeln!(out, "password: {}", e.password);
        }
    }
    out
}

/// `<cluster_name>_v<version>.ini`
pub fn cluster_file_name(cluster_name: &str, version: u32) -> String {
    format!("{}_v{}.ini", cluster_name, version)
}

/// `config_v<version>.ini`
pub fn grid_index_file_name(version: u32) -> String {
    format!("config_v{}.ini", version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf_file::parser::{parse_cluster_file, parse_grid_index};
    use crate::model::NodeConfig;

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

    fn sample_cluster() -> ClusterConfig {
        let mut c = ClusterConfig::new(0, "kalmar", "pw");
        c.add_node(node(NodeKind::DataServer, 1, "ds1")).unwrap();
        c.add_node(node(NodeKind::DataServer, 2, "ds2")).unwrap();
        c.add_node(node(NodeKind::Client, 3, "api1")).unwrap();
        c
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let c = sample_cluster();
        let text = render_cluster_file(&c).unwrap();
        let reloaded = parse_cluster_file(&text, 0, "kalmar", "pw").unwrap();
        assert_eq!(reloaded.num_nodes(), 3);
        assert_eq!(reloaded.node(1).unwrap().hostname(), "ds1");
        assert_eq!(reloaded.node(2).unwrap().hostname(), "ds2");
        assert_eq!(reloaded.node(2).unwrap().params.num_by_id(101), 2);
        assert_eq!(
            reloaded.node(3).unwrap().node_data_path(),
            "/var/lib/gridion"
        );
    }

    #[test]
    fn test_common_values_fold_into_default_section() {
        let c = sample_cluster();
        let text = render_cluster_file(&c).unwrap();
        // replicas is shared by both data servers and differs from the
        // registry default, so it lands in the default section once
        assert!(text.contains("[data server default]"));
        let occurrences = text.matches("number_of_replicas: 2").count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn test_socket_sections_round_trip() {
        let mut c = sample_cluster();
        let mut comm = crate::model::CommConfig::new(1, 2);
        comm.params.set_num(section_ids::SERVER_PORT, 1500);
        comm.params.set_num(section_ids::SERVER_NODE_ID, 1);
        comm.params.set_num(section_ids::USE_CHECKSUM, 1);
        c.add_comm(comm).unwrap();
        let text = render_cluster_file(&c).unwrap();
        let reloaded = parse_cluster_file(&text, 0, "kalmar", "pw").unwrap();
        assert_eq!(reloaded.num_comms(), 1);
        assert!(reloaded.lookup_comm(1, 2).unwrap().use_checksum());
    }

    #[test]
    fn test_grid_index_round_trip() {
        let entries = vec![
            ClusterListEntry {
                cluster_name: "kalmar".into(),
                cluster_id: 0,
                password: "pw".into(),
            },
            ClusterListEntry {
                cluster_name: "uppsala".into(),
                cluster_id: 1,
                password: "".into(),
            },
        ];
        let text = render_grid_index(&entries);
        assert_eq!(parse_grid_index(&text).unwrap(), entries);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(cluster_file_name("kalmar", 4), "kalmar_v4.ini");
        assert_eq!(grid_index_file_name(4), "config_v4.ini");
    }
}
