//! Configuration file parser.
//!
//! Line-oriented text: section headers in brackets, `key: value` pairs,
//! `#` comments. A `[<type> default]` section sets the baseline for the
//! following sections of that type in the same file. Loading runs in
//! two passes over the same section/key visitor so sizes are known
//! before the model is filled.

use std::collections::HashMap;

use crate::error::{ConfigFileError, Error, Result};
use crate::model::{section_ids, ClusterConfig, CommConfig, NodeConfig, NodeKind, ParamMap};
use crate::params::{ParamRegistry, ParamType, SectionKind};

/// Entry in the grid index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterListEntry {
    pub cluster_name: String,
    pub cluster_id: u32,
    pub password: String,
}

fn err(line: u32, kind: ConfigFileError) -> Error {
    Error::ConfigFile { line, kind }
}

/// Map a section header to (kind, is_default).
fn section_kind(name: &str) -> Option<(SectionKind, bool)> {
    let (base, is_default) = match name.strip_suffix(" default") {
        Some(base) => (base, true),
        None => (name, false),
    };
    let kind = match base {
        "data server" => SectionKind::DataServer,
        "client" => SectionKind::Client,
        "cluster server" => SectionKind::ClusterServer,
        "sql server" => SectionKind::SqlServer,
        "replication server" => SectionKind::RepServer,
        "file server" => SectionKind::FileServer,
        "restore" => SectionKind::Restore,
        "cluster manager" => SectionKind::ClusterMgr,
        "socket" => SectionKind::Comm,
        _ => return None,
    };
    Some((kind, is_default))
}

fn node_kind_of(kind: SectionKind) -> Option<NodeKind> {
    Some(match kind {
        SectionKind::DataServer => NodeKind::DataServer,
        SectionKind::Client => NodeKind::Client,
        SectionKind::ClusterServer => NodeKind::ClusterServer,
        SectionKind::SqlServer => NodeKind::SqlServer,
        SectionKind::RepServer => NodeKind::RepServer,
        SectionKind::FileServer => NodeKind::FileServer,
        SectionKind::Restore => NodeKind::Restore,
        SectionKind::ClusterMgr => NodeKind::ClusterMgr,
        SectionKind::Comm | SectionKind::System => return None,
    })
}

/// Parse `1024`, `64K`, `12M`, `2G`.
fn parse_number(value: &str) -> Option<u64> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    let (digits, mult) = match v.as_bytes()[v.len() - 1] {
        b'k' | b'K' => (&v[..v.len() - 1], 1024u64),
        b'm' | b'M' => (&v[..v.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&v[..v.len() - 1], 1024 * 1024 * 1024),
        _ => (v, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(mult)
}

fn parse_bool(value: &str) -> Option<u64> {
    match value.trim() {
        "true" | "1" => Some(1),
        "false" | "0" => Some(0),
        _ => None,
    }
}

/// One parsed line.
enum Line<'a> {
    Section(&'a str),
    Key(&'a str, &'a str),
    Blank,
}

fn classify(raw: &str) -> Result<Line<'_>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Line::Blank);
    }
    if let Some(rest) = line.strip_prefix('[') {
        let name = rest
            .strip_suffix(']')
            .ok_or(Error::ConfigFile {
                line: 0,
                kind: ConfigFileError::Malformed,
            })?
            .trim();
        return Ok(Line::Section(name));
    }
    match line.split_once(':') {
        Some((key, value)) => Ok(Line::Key(key.trim(), value.trim())),
        None => Err(Error::ConfigFile {
            line: 0,
            kind: ConfigFileError::Malformed,
        }),
    }
}

/// State of the section currently being filled.
struct OpenSection {
    kind: SectionKind,
    is_default: bool,
    start_line: u32,
    params: ParamMap,
    mandatory_mask: u64,
}

struct Loader {
    cluster: ClusterConfig,
    defaults: HashMap<SectionKind, (ParamMap, u64)>,
    open: Option<OpenSection>,
}

impl Loader {
    fn new(cluster_id: u32, name: &str, password: &str) -> Self {
        Self {
            cluster: ClusterConfig::new(cluster_id, name, password),
            defaults: HashMap::new(),
            open: None,
        }
    }

    fn begin_section(&mut self, name: &str, line: u32) -> Result<()> {
        self.complete_section(line)?;
        let (kind, is_default) = section_kind(name)
            .ok_or_else(|| err(line, ConfigFileError::NoSuchSection(name.to_string())))?;
        let (params, mandatory_mask) = if is_default {
            (ParamMap::new(), 0)
        } else {
            self.defaults
                .get(&kind)
                .cloned()
                .unwrap_or((ParamMap::new(), 0))
        };
        self.open = Some(OpenSection {
            kind,
            is_default,
            start_line: line,
            params,
            mandatory_mask,
        });
        Ok(())
    }

    fn add_key(&mut self, key: &str, value: &str, line: u32) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| err(line, ConfigFileError::NoSectionDefinedYet))?;
        let reg = ParamRegistry::global();
        let entry = reg
            .by_name(key)
            .ok_or_else(|| err(line, ConfigFileError::NoSuchKey(key.to_string())))?;
        if entry.is_deprecated {
            return Ok(()); // accepted on input, silently ignored
        }
        if !entry.applies_to(open.kind) {
            return Err(err(line, ConfigFileError::KeyInWrongSection(key.to_string())));
        }
        if entry.data_type == ParamType::Str {
            open.params.set_str(entry.id, value);
        } else {
            let num = if entry.is_boolean() {
                parse_bool(value)
                    .ok_or_else(|| err(line, ConfigFileError::NotBoolean(key.to_string())))?
            } else {
                parse_number(value)
                    .ok_or_else(|| err(line, ConfigFileError::NotANumber(key.to_string())))?
            };
            if !entry.in_bounds(num) {
                return Err(err(line, ConfigFileError::OutOfBounds(key.to_string())));
            }
            open.params.set_num(entry.id, num);
        }
        if entry.is_mandatory {
            open.mandatory_mask |= 1 << entry.mandatory_bit;
        }
        Ok(())
    }

    fn complete_section(&mut self, line: u32) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        if open.is_default {
            self.defaults
                .insert(open.kind, (open.params, open.mandatory_mask));
            return Ok(());
        }
        let reg = ParamRegistry::global();
        // Derived-default fields are synthesized at serialization time
        // and cannot be demanded from the file.
        let required: u64 = reg
            .iter_kind(open.kind)
            .filter(|e| e.is_mandatory && !e.is_derived_default)
            .map(|e| 1u64 << e.mandatory_bit)
            .fold(0, |a, b| a | b);
        let missing = required & !open.mandatory_mask;
        if missing != 0 {
            let name = reg
                .iter_kind(open.kind)
                .find(|e| e.is_mandatory && missing & (1 << e.mandatory_bit) != 0)
                .map(|e| e.name)
                .unwrap_or("?");
            return Err(err(
                open.start_line,
                ConfigFileError::MissingMandatory(name.to_string()),
            ));
        }
        if open.kind == SectionKind::Comm {
            let mut comm = CommConfig {
                mandatory_mask: open.mandatory_mask,
                params: open.params,
            };
            // normalize the key order
            let (a, b) = (comm.first_node_id(), comm.second_node_id());
            if a > b {
                comm.params.set_num(section_ids::FIRST_NODE_ID, b as u64);
                comm.params.set_num(section_ids::SECOND_NODE_ID, a as u64);
            }
            self.cluster
                .add_comm(comm)
                .map_err(|_| err(open.start_line, ConfigFileError::Malformed))?;
        } else {
            let kind = node_kind_of(open.kind).expect("node section");
            let node = NodeConfig {
                kind,
                mandatory_mask: open.mandatory_mask,
                params: open.params,
            };
            let id = node.node_id();
            if self.cluster.node(id).is_some() {
                return Err(err(open.start_line, ConfigFileError::NodeAlreadyDefined(id)));
            }
            self.cluster
                .add_node(node)
                .map_err(|_| err(open.start_line, ConfigFileError::Malformed))?;
        }
        Ok(())
    }
}

/// Parse one cluster's configuration file.
pub fn parse_cluster_file(
    content: &str,
    cluster_id: u32,
    cluster_name: &str,
    password: &str,
) -> Result<ClusterConfig> {
    // Pass 0: syntax, key validity and bounds; also proves the fill
    // pass below cannot fail halfway through.
    run_passes(content, cluster_id, cluster_name, password)?;
    // Pass 1: fill.
    let mut cluster = run_passes(content, cluster_id, cluster_name, password)?;
    cluster.apply_derived_defaults();
    Ok(cluster)
}

fn run_passes(
    content: &str,
    cluster_id: u32,
    cluster_name: &str,
    password: &str,
) -> Result<ClusterConfig> {
    let mut loader = Loader::new(cluster_id, cluster_name, password);
    let mut line_no = 0u32;
    for raw in content.lines() {
        line_no += 1;
        match classify(raw) {
            Ok(Line::Blank) => {}
            Ok(Line::Section(name)) => loader.begin_section(name, line_no)?,
            Ok(Line::Key(key, value)) => loader.add_key(key, value, line_no)?,
            Err(Error::ConfigFile { kind, .. }) => return Err(err(line_no, kind)),
            Err(e) => return Err(e),
        }
    }
    loader.complete_section(line_no + 1)?;
    Ok(loader.cluster)
}

/// Parse the grid index file listing all clusters.
pub fn parse_grid_index(content: &str) -> Result<Vec<ClusterListEntry>> {
    let mut entries: Vec<ClusterListEntry> = Vec::new();
    let mut open: Option<(u32, Option<String>, Option<u32>, Option<String>)> = None;
    let mut line_no = 0u32;

    fn close(
        entries: &mut Vec<ClusterListEntry>,
        open: Option<(u32, Option<String>, Option<u32>, Option<String>)>,
    ) -> Result<()> {
        if let Some((start, name, id, password)) = open {
            let cluster_name = name.ok_or_else(|| {
                err(start, ConfigFileError::MissingMandatory("cluster_name".into()))
            })?;
            let cluster_id = id.ok_or_else(|| {
                err(start, ConfigFileError::MissingMandatory("cluster_id".into()))
            })?;
            entries.push(ClusterListEntry {
                cluster_name,
                cluster_id,
                password: password.unwrap_or_default(),
            });
        }
        Ok(())
    }

    for raw in content.lines() {
        line_no += 1;
        match classify(raw) {
            Ok(Line::Blank) => {}
            Ok(Line::Section("cluster")) => {
                close(&mut entries, open.take())?;
                open = Some((line_no, None, None, None));
            }
            Ok(Line::Section(other)) => {
                return Err(err(line_no, ConfigFileError::NoSuchSection(other.to_string())))
            }
            Ok(Line::Key(key, value)) => {
                let Some(entry) = open.as_mut() else {
                    return Err(err(line_no, ConfigFileError::NoSectionDefinedYet));
                };
                match key {
                    "cluster_name" => entry.1 = Some(value.to_string()),
                    "cluster_id" => {
                        entry.2 = Some(parse_number(value).ok_or_else(|| {
                            err(line_no, ConfigFileError::NotANumber(key.to_string()))
                        })? as u32)
                    }
                    "password" => entry.3 = Some(value.to_string()),
                    other => {
                        return Err(err(line_no, ConfigFileError::NoSuchKey(other.to_string())))
                    }
                }
            }
            Err(Error::ConfigFile { kind, .. }) => return Err(err(line_no, kind)),
            Err(e) => return Err(e),
        }
    }
    close(&mut entries, open)?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOUR_NODE: &str = "\
# two data servers, one client, one cluster server
[data server default]
hostname: localhost
node_data_path: /var/lib/gridion
number_of_replicas: 2

[data server]
node_id: 1
hostname: ds1

[data server]
node_id: 2
hostname: ds2

[client]
node_id: 3
hostname: api1
node_data_path: /var/lib/gridion

[cluster server]
node_id: 4
hostname: cs1
node_data_path: /var/lib/gridion
";

    #[test]
    fn test_parse_four_node_cluster() {
        let c = parse_cluster_file(FOUR_NODE, 0, "kalmar", "pw").unwrap();
        assert_eq!(c.num_nodes(), 4);
        assert_eq!(c.counts.data_servers, 2);
        assert_eq!(c.node(1).unwrap().hostname(), "ds1");
        // inherited from the default section
        assert_eq!(c.node(2).unwrap().params.num_by_id(101), 2);
        assert_eq!(c.node(2).unwrap().node_data_path(), "/var/lib/gridion");
    }

    #[test]
    fn test_default_inheritance_is_overridable() {
        let c = parse_cluster_file(FOUR_NODE, 0, "kalmar", "pw").unwrap();
        // the default hostname is overridden per node
        assert_eq!(c.node(1).unwrap().hostname(), "ds1");
        assert_eq!(c.node(2).unwrap().hostname(), "ds2");
    }

    #[test]
    fn test_duplicate_node_id() {
        let text = FOUR_NODE.replace("node_id: 4", "node_id: 3");
        let e = parse_cluster_file(&text, 0, "kalmar", "pw").unwrap_err();
        match e {
            Error::ConfigFile { kind, .. } => {
                assert_eq!(kind, ConfigFileError::NodeAlreadyDefined(3))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_mandatory() {
        let text = "\
[client]
node_id: 3
hostname: api1
";
        let e = parse_cluster_file(text, 0, "x", "").unwrap_err();
        match e {
            Error::ConfigFile { kind, .. } => {
                assert_eq!(kind, ConfigFileError::MissingMandatory("node_data_path".into()))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_out_of_bounds_with_line() {
        let text = "\
[data server]
node_id: 1
hostname: h
node_data_path: /d
number_of_replicas: 9
";
        let e = parse_cluster_file(text, 0, "x", "").unwrap_err();
        match e {
            Error::ConfigFile { line, kind } => {
                assert_eq!(line, 5);
                assert_eq!(kind, ConfigFileError::OutOfBounds("number_of_replicas".into()));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_and_section() {
        let bad_key = "[client]\nnot_a_key: 1\n";
        assert!(matches!(
            parse_cluster_file(bad_key, 0, "x", "").unwrap_err(),
            Error::ConfigFile {
                kind: ConfigFileError::NoSuchKey(_),
                ..
            }
        ));
        let bad_section = "[warp drive]\n";
        assert!(matches!(
            parse_cluster_file(bad_section, 0, "x", "").unwrap_err(),
            Error::ConfigFile {
                kind: ConfigFileError::NoSuchSection(_),
                ..
            }
        ));
    }

    #[test]
    fn test_key_in_wrong_section() {
        let text = "[client]\nnode_id: 3\nnumber_of_replicas: 2\n";
        assert!(matches!(
            parse_cluster_file(text, 0, "x", "").unwrap_err(),
            Error::ConfigFile {
                kind: ConfigFileError::KeyInWrongSection(_),
                ..
            }
        ));
    }

    #[test]
    fn test_socket_section() {
        let text = format!(
            "{}\n[socket]\nfirst_node_id: 1\nsecond_node_id: 2\nuse_checksum: true\n",
            FOUR_NODE
        );
        let c = parse_cluster_file(&text, 0, "kalmar", "pw").unwrap();
        assert_eq!(c.num_comms(), 1);
        let comm = c.lookup_comm(2, 1).unwrap();
        assert!(comm.use_checksum());
    }

    #[test]
    fn test_number_suffixes() {
        let text = format!("{}\n[socket]\nfirst_node_id: 1\nsecond_node_id: 2\nsocket_write_buffer_size: 512K\n", FOUR_NODE);
        let c = parse_cluster_file(&text, 0, "kalmar", "pw").unwrap();
        let comm = c.lookup_comm(1, 2).unwrap();
        assert_eq!(
            comm.params.num_by_id(crate::model::section_ids::WRITE_BUFFER_SIZE),
            512 * 1024
        );
    }

    #[test]
    fn test_derived_paths_after_parse() {
        let c = parse_cluster_file(FOUR_NODE, 0, "kalmar", "pw").unwrap();
        let ds = c.node(1).unwrap();
        assert_eq!(
            ds.params.str_by_id(crate::model::section_ids::FILESYSTEM_PATH),
            "/var/lib/gridion"
        );
    }

    #[test]
    fn test_grid_index() {
        let text = "\
[cluster]
cluster_name: kalmar
cluster_id: 0
password: pw

[cluster]
cluster_name: uppsala
cluster_id: 1
";
        let entries = parse_grid_index(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cluster_name, "kalmar");
        assert_eq!(entries[1].cluster_id, 1);
        assert_eq!(entries[1].password, "");
    }
}
