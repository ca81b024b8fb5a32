//! Binary Configuration Envelope
//!
//! The cluster configuration travels as a stream of 32-bit big-endian
//! words: an 8-byte magic, key/value sections, and a trailing checksum
//! word that makes the XOR of the whole stream zero. For transport the
//! word stream is base64-encoded in 76-character lines.
//!
//! Key word layout: `(type << 28) | (section_id << 14) | config_id`.
//! INT64 values span two words, string values are length-prefixed and
//! padded to a word boundary with a trailing NUL included in the
//! reported length (plus one extra pad byte kept for bug compatibility
//! with the legacy management protocol).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::model::{ClusterConfig, CommConfig, NodeConfig, NodeKind};
use crate::params::{
    version, ParamEntry, ParamRegistry, ParamType, SectionKind, ID_NODE_TYPE, ID_PARENT_ID,
    SYSTEM_ID_WIRE_OFFSET,
};

/// 8-byte magic at the head of every envelope: `NDBCONFV`.
pub const CONFIG_MAGIC: [u8; 8] = *b"NDBCONFV";

/// Width of the base64 transport lines.
pub const BASE64_LINE_LEN: usize = 76;

/// Largest envelope we accept: 16 MByte.
pub const MAX_CONTENT_LEN: usize = 16 * 1024 * 1024;

const KEY_SHIFT: u32 = 28;
const SECT_SHIFT: u32 = 14;
const KEY_MASK: u32 = 0x3FFF;
const SECT_MASK: u32 = 0x3FFF;

const TYPE_INT32: u32 = 1;
const TYPE_CHAR: u32 = 2;
const TYPE_SECT: u32 = 3;
const TYPE_INT64: u32 = 4;

/// Section 0 key pointing at the node index section.
const KEY_NODE_INDEX: u32 = 1000;
/// Section 0 key pointing at the comm index section.
const KEY_COMM_INDEX: u32 = 3000;

#[inline]
fn make_key(data_type: u32, section_id: u32, config_id: u32) -> u32 {
    (data_type << KEY_SHIFT) | (section_id << SECT_SHIFT) | config_id
}

/// Words a string occupies after its key/value pair: NUL included in the
/// reported length, one extra pad byte, rounded up to a word boundary.
#[inline]
fn str_word_len(reported_len: u32) -> u32 {
    (reported_len + 1 + 3) / 4
}

/// Reported length of a string value: byte length plus trailing NUL.
#[inline]
fn reported_len(s: &str) -> u32 {
    s.len() as u32 + 1
}

// ---------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------

/// One section's worth of key/value pairs, generated the same way in the
/// counting pass and the fill pass so a mismatch is caught as an
/// inconsistency instead of corrupting the stream.
struct SectionVisitor<'a> {
    kind: SectionKind,
    params: &'a crate::model::ParamMap,
    node_type: Option<u32>,
    version: u64,
}

impl<'a> SectionVisitor<'a> {
    fn entries(&self) -> impl Iterator<Item = &'static ParamEntry> + '_ {
        let reg = ParamRegistry::global();
        reg.iter_kind(self.kind).filter(move |e| {
            !e.is_deprecated
                && !e.is_not_sent
                && ParamRegistry::is_entry_used_in_version(e, self.version)
        })
    }

    /// Wire config id of an entry. System parameters are stored in the
    /// registry offset by 1000 so their ids stay unique; on the wire
    /// they appear as 1..=3 (the decode side adds the offset back).
    fn wire_id(&self, e: &ParamEntry) -> u32 {
        if self.kind == SectionKind::System {
            (e.id - SYSTEM_ID_WIRE_OFFSET) as u32
        } else {
            e.id as u32
        }
    }

    /// Length in words of this section, excluding the index entries.
    fn word_len(&self) -> u32 {
        let mut len = 0;
        for e in self.entries() {
            len += 2;
            match e.data_type {
                ParamType::U64 => len += 1,
                ParamType::Str => len += str_word_len(reported_len(self.params.str(e))),
                _ => {}
            }
        }
        if self.node_type.is_some() {
            len += 2; // node type
            len += 2; // parent pointer
        }
        len
    }

    fn fill(&self, section_id: u32, out: &mut Vec<u32>) {
        for e in self.entries() {
            match e.data_type {
                ParamType::Bool | ParamType::U16 | ParamType::U32 => {
                    out.push(make_key(TYPE_INT32, section_id, self.wire_id(e)));
                    out.push(self.params.num(e) as u32);
                }
                ParamType::U64 => {
                    let v = self.params.num(e);
                    out.push(make_key(TYPE_INT64, section_id, self.wire_id(e)));
                    out.push((v >> 32) as u32);
                    out.push(v as u32);
                }
                ParamType::Str => {
                    let s = self.params.str(e);
                    let rep = reported_len(s);
                    out.push(make_key(TYPE_CHAR, section_id, self.wire_id(e)));
                    out.push(rep);
                    let words = str_word_len(rep) as usize;
                    let mut bytes = vec![0u8; words * 4];
                    bytes[..s.len()].copy_from_slice(s.as_bytes());
                    for w in bytes.chunks_exact(4) {
                        out.push(BigEndian::read_u32(w));
                    }
                }
            }
        }
        if let Some(node_type) = self.node_type {
            out.push(make_key(TYPE_INT32, section_id, ID_NODE_TYPE as u32));
            out.push(node_type);
            out.push(make_key(TYPE_INT32, section_id, ID_PARENT_ID as u32));
            out.push(0);
        }
    }
}

/// Wire value of the node type key. Legacy peers only distinguish data
/// servers, cluster servers and clients; everything else is translated
/// to a client.
fn wire_node_type(kind: NodeKind, composite_version: u64) -> u32 {
    match kind {
        NodeKind::DataServer | NodeKind::ClusterServer => kind as u32,
        _ if version::is_iclaustron(composite_version) => kind as u32,
        _ => NodeKind::Client as u32,
    }
}

fn system_visitor<'a>(cluster: &'a ClusterConfig, composite_version: u64) -> SectionVisitor<'a> {
    SectionVisitor {
        kind: SectionKind::System,
        params: &cluster.system.params,
        node_type: None,
        version: composite_version,
    }
}

/// Encode a cluster configuration into the 32-bit word stream.
pub fn encode_config_words(cluster: &ClusterConfig, composite_version: u64) -> Result<Vec<u32>> {
    let node_ids: Vec<u32> = cluster.node_ids().collect();
    if node_ids.is_empty() {
        return Err(Error::Inconsistent("cluster has no nodes".into()));
    }
    let num_nodes = node_ids.len() as u32;
    let pairs = cluster.connected_pairs(composite_version);
    let num_comms = pairs.len() as u32;

    let comm_sections: Vec<CommConfig> = pairs
        .iter()
        .map(|&(a, b)| cluster.comm_for_pair(a, b))
        .collect::<Result<_>>()?;

    // Counting pass.
    let mut expected = 2; // magic
    expected += 4; // section 0
    expected += num_nodes * 2; // node index
    for &id in &node_ids {
        let node = cluster.node(id).ok_or(Error::NoSuchNode(id))?;
        let len = node_visitor(node, composite_version).word_len();
        if len == 0 {
            return Err(Error::Inconsistent(format!("empty section for node {}", id)));
        }
        expected += len;
    }
    expected += system_visitor(cluster, composite_version).word_len();
    expected += num_comms * 2; // comm index
    for comm in &comm_sections {
        expected += comm_visitor(comm, composite_version).word_len();
    }
    expected += 1; // checksum

    // Fill pass.
    let mut words: Vec<u32> = Vec::with_capacity(expected as usize);
    words.push(BigEndian::read_u32(&CONFIG_MAGIC[0..4]));
    words.push(BigEndian::read_u32(&CONFIG_MAGIC[4..8]));

    let system_section = 2 + num_nodes;
    let comm_index_section = system_section + 1;

    words.push(make_key(TYPE_SECT, 0, KEY_NODE_INDEX));
    words.push(1 << SECT_SHIFT);
    words.push(make_key(TYPE_SECT, 0, KEY_COMM_INDEX));
    words.push(comm_index_section << SECT_SHIFT);

    for i in 0..num_nodes {
        words.push(make_key(TYPE_INT32, 1, i));
        words.push((2 + i) << SECT_SHIFT);
    }

    let mut section_id = 2u32;
    for &id in &node_ids {
        let node = cluster.node(id).ok_or(Error::NoSuchNode(id))?;
        node_visitor(node, composite_version).fill(section_id, &mut words);
        section_id += 1;
    }

    system_visitor(cluster, composite_version).fill(system_section, &mut words);

    for i in 0..num_comms {
        words.push(make_key(TYPE_INT32, comm_index_section, i));
        words.push((comm_index_section + 1 + i) << SECT_SHIFT);
    }
    let mut section_id = comm_index_section + 1;
    for comm in &comm_sections {
        comm_visitor(comm, composite_version).fill(section_id, &mut words);
        section_id += 1;
    }

    let checksum = words.iter().fold(0u32, |acc, w| acc ^ w);
    words.push(checksum);

    if words.len() != expected as usize {
        return Err(Error::Inconsistent(format!(
            "section count pass computed {} words, fill pass produced {}",
            expected,
            words.len()
        )));
    }
    Ok(words)
}

fn node_visitor<'a>(node: &'a NodeConfig, composite_version: u64) -> SectionVisitor<'a> {
    SectionVisitor {
        kind: node.kind.section(),
        params: &node.params,
        node_type: Some(wire_node_type(node.kind, composite_version)),
        version: composite_version,
    }
}

fn comm_visitor<'a>(comm: &'a CommConfig, composite_version: u64) -> SectionVisitor<'a> {
    SectionVisitor {
        kind: SectionKind::Comm,
        params: &comm.params,
        node_type: Some(0),
        version: composite_version,
    }
}

/// Encode to the big-endian byte stream.
pub fn encode_config(cluster: &ClusterConfig, composite_version: u64) -> Result<Vec<u8>> {
    let words = encode_config_words(cluster, composite_version)?;
    let mut bytes = vec![0u8; words.len() * 4];
    for (i, w) in words.iter().enumerate() {
        BigEndian::write_u32(&mut bytes[i * 4..i * 4 + 4], *w);
    }
    Ok(bytes)
}

/// Encode to the base64 transport form: 76-character lines.
pub fn encode_config_base64(cluster: &ClusterConfig, composite_version: u64) -> Result<String> {
    let bytes = encode_config(cluster, composite_version)?;
    let encoded = BASE64.encode(&bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LEN + 1);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE_LEN) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
        out.push('\n');
    }
    Ok(out)
}

/// Decode the base64 transport form back to the byte stream.
pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() > MAX_CONTENT_LEN {
        return Err(Error::Protocol("configuration envelope too large".into()));
    }
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| Error::Protocol(format!("bad base64 in configuration envelope: {}", e)))
}

// ---------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------

struct KeyValue {
    key_type: u32,
    section_id: u32,
    config_id: u32,
    value: u32,
    /// Index of the word after the key word.
    value_ix: usize,
}

struct Reader<'a> {
    words: &'a [u32],
    ix: usize,
}

impl<'a> Reader<'a> {
    fn next_pair(&mut self) -> Option<Result<KeyValue>> {
        if self.ix >= self.words.len() {
            return None;
        }
        if self.ix + 1 >= self.words.len() {
            return Some(Err(Error::Protocol(
                "key word without value at end of stream".into(),
            )));
        }
        let key = self.words[self.ix];
        let value = self.words[self.ix + 1];
        let kv = KeyValue {
            key_type: key >> KEY_SHIFT,
            section_id: (key >> SECT_SHIFT) & SECT_MASK,
            config_id: key & KEY_MASK,
            value,
            value_ix: self.ix + 1,
        };
        self.ix += 2;
        // Step over the value's extra words.
        match kv.key_type {
            TYPE_INT32 | TYPE_SECT => {}
            TYPE_INT64 => {
                if self.ix >= self.words.len() {
                    return Some(Err(Error::Protocol("truncated 64-bit value".into())));
                }
                self.ix += 1;
            }
            TYPE_CHAR => {
                let words = str_word_len(kv.value) as usize;
                if self.ix + words > self.words.len() {
                    return Some(Err(Error::Protocol("truncated string value".into())));
                }
                self.ix += words;
            }
            t => {
                return Some(Err(Error::Protocol(format!("unknown key type {}", t))));
            }
        }
        Some(Ok(kv))
    }

    fn u64_value(&self, kv: &KeyValue) -> u64 {
        ((kv.value as u64) << 32) | self.words[kv.value_ix + 1] as u64
    }

    fn str_value(&self, kv: &KeyValue) -> Result<String> {
        if kv.value == 0 {
            return Err(Error::Protocol("string with zero reported length".into()));
        }
        let words = str_word_len(kv.value) as usize;
        let mut bytes = Vec::with_capacity(words * 4);
        for w in &self.words[kv.value_ix + 1..kv.value_ix + 1 + words] {
            let mut buf = [0u8; 4];
            BigEndian::write_u32(&mut buf, *w);
            bytes.extend_from_slice(&buf);
        }
        let text_len = kv.value as usize - 1;
        if bytes.len() < kv.value as usize || bytes[text_len] != 0 {
            return Err(Error::Protocol("string value not NUL terminated".into()));
        }
        let s = std::str::from_utf8(&bytes[..text_len])
            .map_err(|_| Error::Protocol("string value is not valid UTF-8".into()))?;
        if s.as_bytes().contains(&0) {
            return Err(Error::Protocol("embedded NUL in string value".into()));
        }
        Ok(s.to_string())
    }
}

#[derive(Default)]
struct Layout {
    num_nodes: u32,
    system_section: u32,
    comm_index_section: u32,
    num_comms: u32,
}

/// Decode a big-endian byte stream into a cluster configuration.
///
/// Two passes over the same reader: the first verifies the structure and
/// discovers the section layout, the second fills the model.
pub fn decode_config(bytes: &[u8]) -> Result<ClusterConfig> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Protocol(
            "envelope size is not a multiple of 4".into(),
        ));
    }
    if bytes.len() < 12 {
        return Err(Error::Protocol("envelope too small".into()));
    }
    if bytes[..8] != CONFIG_MAGIC {
        return Err(Error::Protocol("bad envelope magic".into()));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(BigEndian::read_u32)
        .collect();
    let xor = words.iter().fold(0u32, |acc, w| acc ^ w);
    if xor != 0 {
        return Err(Error::Checksum);
    }
    // Strip magic and trailing checksum; what remains is key/value pairs.
    let body = &words[2..words.len() - 1];

    let layout = decode_pass1(body)?;
    decode_pass2(body, &layout)
}

fn decode_pass1(body: &[u32]) -> Result<Layout> {
    let mut layout = Layout::default();
    let mut node_index_section = 0u32;
    let mut reader = Reader { words: body, ix: 0 };
    while let Some(kv) = reader.next_pair() {
        let kv = kv?;
        match kv.section_id {
            0 => {
                if kv.key_type != TYPE_SECT {
                    return Err(Error::Protocol("section 0 key is not a section pointer".into()));
                }
                match kv.config_id {
                    KEY_NODE_INDEX => node_index_section = kv.value >> SECT_SHIFT,
                    KEY_COMM_INDEX => layout.comm_index_section = kv.value >> SECT_SHIFT,
                    other => {
                        return Err(Error::Protocol(format!(
                            "unknown section 0 key {}",
                            other
                        )))
                    }
                }
            }
            1 => {
                if kv.key_type != TYPE_INT32 {
                    return Err(Error::Protocol("node index entry is not INT32".into()));
                }
                if kv.config_id != layout.num_nodes {
                    return Err(Error::Protocol("node index entries out of order".into()));
                }
                let target = kv.value >> SECT_SHIFT;
                if target != 2 + kv.config_id {
                    return Err(Error::Protocol("node index points at wrong section".into()));
                }
                layout.num_nodes += 1;
            }
            s if layout.comm_index_section != 0 && s == layout.comm_index_section => {
                if kv.key_type != TYPE_INT32 || kv.config_id != layout.num_comms {
                    return Err(Error::Protocol("comm index entries out of order".into()));
                }
                let target = kv.value >> SECT_SHIFT;
                if target != layout.comm_index_section + 1 + kv.config_id {
                    return Err(Error::Protocol("comm index points at wrong section".into()));
                }
                layout.num_comms += 1;
            }
            _ => {}
        }
    }
    if node_index_section != 1 {
        return Err(Error::Protocol("missing node index section".into()));
    }
    if layout.num_nodes == 0 {
        return Err(Error::Protocol("configuration carries no nodes".into()));
    }
    layout.system_section = 2 + layout.num_nodes;
    if layout.comm_index_section != layout.system_section + 1 {
        return Err(Error::Protocol("comm index section out of place".into()));
    }
    Ok(layout)
}

enum Target<'a> {
    Node(&'a mut NodeConfig),
    Comm(&'a mut CommConfig),
    System(&'a mut crate::model::SystemConfig),
}

fn assign_value(reader: &Reader<'_>, kv: &KeyValue, target: &mut Target<'_>) -> Result<()> {
    let registry_id = match target {
        Target::System(_) => kv.config_id + SYSTEM_ID_WIRE_OFFSET as u32,
        _ => kv.config_id,
    };
    if registry_id > crate::params::MAX_CONFIG_ID as u32 {
        return Err(Error::Protocol(format!("config id {} out of range", registry_id)));
    }
    let reg = ParamRegistry::global();
    let entry = reg
        .by_id(registry_id as u16)
        .ok_or_else(|| Error::Protocol(format!("unknown config id {}", registry_id)))?;
    if entry.is_deprecated {
        return Ok(());
    }
    let kind = match target {
        Target::Node(n) => n.kind.section(),
        Target::Comm(_) => SectionKind::Comm,
        Target::System(_) => SectionKind::System,
    };
    if !entry.applies_to(kind) {
        return Err(Error::Protocol(format!(
            "config id {} not valid in a {:?} section",
            registry_id, kind
        )));
    }
    let (params, mask) = match target {
        Target::Node(n) => (&mut n.params, Some(&mut n.mandatory_mask)),
        Target::Comm(c) => (&mut c.params, Some(&mut c.mandatory_mask)),
        Target::System(s) => (&mut s.params, None),
    };
    match kv.key_type {
        TYPE_CHAR => {
            let s = reader.str_value(kv)?;
            if entry.is_not_configurable && s != entry.default_str {
                return Err(Error::Protocol(format!(
                    "parameter {} is not configurable",
                    entry.name
                )));
            }
            params.set_str(entry.id, s);
        }
        TYPE_INT32 | TYPE_INT64 => {
            let v = if kv.key_type == TYPE_INT64 {
                reader.u64_value(kv)
            } else {
                kv.value as u64
            };
            if entry.is_not_configurable && v != entry.default_num {
                return Err(Error::Protocol(format!(
                    "parameter {} is not configurable",
                    entry.name
                )));
            }
            if !entry.in_bounds(v) {
                return Err(Error::Protocol(format!(
                    "value {} for {} out of bounds",
                    v, entry.name
                )));
            }
            params.set_num(entry.id, v);
        }
        _ => {
            return Err(Error::Protocol(format!(
                "bad key type {} for config id {}",
                kv.key_type, registry_id
            )))
        }
    }
    if entry.is_mandatory {
        if let Some(mask) = mask {
            *mask |= 1 << entry.mandatory_bit;
        }
    }
    Ok(())
}

fn decode_pass2(body: &[u32], layout: &Layout) -> Result<ClusterConfig> {
    let mut nodes: Vec<NodeConfig> = Vec::with_capacity(layout.num_nodes as usize);
    let mut node_kinds: Vec<Option<NodeKind>> = vec![None; layout.num_nodes as usize];
    let mut comms: Vec<CommConfig> = (0..layout.num_comms)
        .map(|_| CommConfig::new(0, 0))
        .collect();
    for c in comms.iter_mut() {
        c.params.unset(crate::model::section_ids::FIRST_NODE_ID);
        c.params.unset(crate::model::section_ids::SECOND_NODE_ID);
    }
    let mut system = crate::model::SystemConfig::default();

    // Discover node kinds first so node sections can be typed while
    // values stream in.
    let mut reader = Reader { words: body, ix: 0 };
    while let Some(kv) = reader.next_pair() {
        let kv = kv?;
        let sect = kv.section_id;
        if sect >= 2 && sect < layout.system_section && kv.config_id == ID_NODE_TYPE as u32 {
            let kind = NodeKind::from_wire(kv.value)
                .ok_or_else(|| Error::Protocol(format!("unknown node type {}", kv.value)))?;
            node_kinds[(sect - 2) as usize] = Some(kind);
        }
    }
    for (i, kind) in node_kinds.iter().enumerate() {
        let kind = kind.ok_or_else(|| {
            Error::Protocol(format!("node section {} carries no node type", i + 2))
        })?;
        nodes.push(NodeConfig::new(kind));
    }

    let mut reader = Reader { words: body, ix: 0 };
    while let Some(kv) = reader.next_pair() {
        let kv = kv?;
        let sect = kv.section_id;
        if sect <= 1 || sect == layout.comm_index_section {
            continue; // structural sections, verified in pass 1
        }
        if kv.config_id == ID_NODE_TYPE as u32 || kv.config_id == ID_PARENT_ID as u32 {
            continue;
        }
        let mut target = if sect < layout.system_section {
            Target::Node(&mut nodes[(sect - 2) as usize])
        } else if sect == layout.system_section {
            Target::System(&mut system)
        } else {
            let comm_ix = (sect - layout.comm_index_section - 1) as usize;
            if comm_ix >= comms.len() {
                return Err(Error::Protocol("comm section out of range".into()));
            }
            Target::Comm(&mut comms[comm_ix])
        };
        assign_value(&reader, &kv, &mut target)?;
    }

    let mut cluster = ClusterConfig::default();
    cluster.system = system;
    for node in nodes {
        if let Some(name) = node.missing_mandatory() {
            return Err(Error::Protocol(format!(
                "node section missing mandatory parameter {}",
                name
            )));
        }
        cluster.add_node(node)?;
    }
    for comm in comms {
        if comm.first_node_id() == 0 || comm.second_node_id() == 0 {
            return Err(Error::Protocol("comm section missing node ids".into()));
        }
        cluster.add_comm(comm)?;
    }
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::section_ids;
    use crate::params::version;

    fn node(kind: NodeKind, id: u32, host: &str, port: u64) -> NodeConfig {
        let reg = ParamRegistry::global();
        let mut n = NodeConfig::new(kind);
        n.params.set_num(section_ids::NODE_ID, id as u64);
        n.params.set_str(section_ids::HOSTNAME, host);
        n.params.set_str(section_ids::NODE_DATA_PATH, "/var/lib/gridion");
        n.params.set_num(section_ids::PORT_NUMBER, port);
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

    fn four_node_cluster() -> ClusterConfig {
        let mut c = ClusterConfig::new(0, "kalmar", "secret");
        c.add_node(node(NodeKind::DataServer, 1, "ds1", 1500)).unwrap();
        c.add_node(node(NodeKind::DataServer, 2, "ds2", 1501)).unwrap();
        c.add_node(node(NodeKind::Client, 3, "api1", 1502)).unwrap();
        c.add_node(node(NodeKind::ClusterServer, 4, "cs1", 1186)).unwrap();
        c.system.params.set_str(section_ids::SYSTEM_NAME, "grid-a");
        c
    }

    const V: u64 = 0x5011E;

    #[test]
    fn test_magic_and_checksum() {
        let c = four_node_cluster();
        let bytes = encode_config(&c, V).unwrap();
        assert_eq!(
            &bytes[..8],
            &[0x4E, 0x44, 0x42, 0x43, 0x4F, 0x4E, 0x46, 0x56]
        );
        let xor = bytes
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .fold(0u32, |a, w| a ^ w);
        assert_eq!(xor, 0);
    }

    #[test]
    fn test_round_trip_legacy_version() {
        let mut c = four_node_cluster();
        c.apply_derived_defaults();
        let bytes = encode_config(&c, V).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.num_nodes(), 4);
        assert_eq!(decoded.max_node_id(), 4);
        // 5 comm sections: each data server to every other node
        assert_eq!(decoded.num_comms(), 5);
        let comm = decoded.lookup_comm(1, 2).unwrap();
        assert_eq!(comm.server_node_id(), 1);
        // values survive
        let n1 = decoded.node(1).unwrap();
        assert_eq!(n1.hostname(), "ds1");
        assert_eq!(n1.kind, NodeKind::DataServer);
        assert_eq!(n1.params.num_by_id(101), 2);
        assert_eq!(decoded.system.name(), "grid-a");
    }

    #[test]
    fn test_round_trip_equals_materialized_model() {
        let mut c = four_node_cluster();
        c.apply_derived_defaults();
        let v = version::make(0x5011E, 0x10002);
        let bytes = encode_config(&c, v).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        for id in c.node_ids() {
            let mut expect = c.node(id).unwrap().clone();
            expect.params.materialize(expect.kind.section(), v);
            // not-sent parameters never reach the wire
            expect.params.unset(section_ids::PORT_NUMBER);
            let got = decoded.node(id).unwrap();
            assert_eq!(got.kind, expect.kind);
            assert_eq!(got.params, expect.params, "node {} params differ", id);
        }
    }

    #[test]
    fn test_system_section_wire_ids_translated() {
        let mut c = four_node_cluster();
        c.system
            .params
            .set_num(section_ids::SYSTEM_PRIMARY_CS_NODE, 4);
        c.system
            .params
            .set_num(section_ids::SYSTEM_CONFIGURATION_NUMBER, 9);
        let words = encode_config_words(&c, V).unwrap();
        // the system section sits right after the node sections
        let system_section = 2 + c.num_nodes();
        let body = &words[2..words.len() - 1];
        let mut reader = Reader { words: body, ix: 0 };
        let mut wire_ids = Vec::new();
        while let Some(kv) = reader.next_pair() {
            let kv = kv.unwrap();
            if kv.section_id == system_section {
                wire_ids.push(kv.config_id);
            }
        }
        wire_ids.sort_unstable();
        // registry ids 1001..=1003 travel as 1..=3
        assert_eq!(wire_ids, vec![1, 2, 3]);

        let bytes = encode_config(&c, V).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.system.primary_cs_node(), 4);
        assert_eq!(decoded.system.configuration_number(), 9);
        assert_eq!(decoded.system.name(), "grid-a");
    }

    #[test]
    fn test_version_window_filters_parameter() {
        let mut c = four_node_cluster();
        c.node_mut(1).unwrap().params.set_num(170, 7); // group_commit_delay
        let absent = encode_config_words(&c, version::make(0x50118, 0)).unwrap();
        let present = encode_config_words(&c, version::make(0x50119, 0)).unwrap();
        let has_170 = |words: &[u32]| {
            words
                .iter()
                .any(|w| w >> KEY_SHIFT == TYPE_INT32 && w & KEY_MASK == 170)
        };
        assert!(!has_170(&absent));
        assert!(has_170(&present));
    }

    #[test]
    fn test_corrupted_word_fails_checksum() {
        let c = four_node_cluster();
        let mut bytes = encode_config(&c, V).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0x40;
        assert!(matches!(decode_config(&bytes).unwrap_err(), Error::Checksum));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let c = four_node_cluster();
        let mut bytes = encode_config(&c, V).unwrap();
        bytes[0] = b'X';
        assert!(decode_config(&bytes).is_err());
    }

    #[test]
    fn test_odd_size_rejected() {
        let c = four_node_cluster();
        let mut bytes = encode_config(&c, V).unwrap();
        bytes.pop();
        assert!(decode_config(&bytes).is_err());
    }

    #[test]
    fn test_base64_lines_are_76_chars() {
        let c = four_node_cluster();
        let text = encode_config_base64(&c, V).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        for line in &lines[..lines.len() - 1] {
            assert_eq!(line.len(), BASE64_LINE_LEN);
        }
        assert!(lines.last().unwrap().len() <= BASE64_LINE_LEN);
        let bytes = decode_base64(&text).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.num_nodes(), 4);
    }

    #[test]
    fn test_iclaustron_version_fully_connected() {
        let c = four_node_cluster();
        let v = version::make(0x5011E, 0x10002);
        let bytes = encode_config(&c, v).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.num_comms(), 6);
        // client-side port only travels to iClaustron peers
        let comm = decoded.lookup_comm(3, 4).unwrap();
        assert_eq!(comm.client_port(), Some(1186));
    }

    #[test]
    fn test_legacy_translates_worker_kinds_to_client() {
        let mut c = four_node_cluster();
        c.add_node(node(NodeKind::SqlServer, 5, "sql1", 1510)).unwrap();
        let bytes = encode_config(&c, V).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.node(5).unwrap().kind, NodeKind::Client);
        // an iClaustron peer sees the real kind
        let bytes = encode_config(&c, version::make(0x5011E, 0x10002)).unwrap();
        let decoded = decode_config(&bytes).unwrap();
        assert_eq!(decoded.node(5).unwrap().kind, NodeKind::SqlServer);
    }

    #[test]
    fn test_string_padding_lengths() {
        // Walk strings of every residue class through a round trip.
        for len in 1..=9usize {
            let host: String = "h".repeat(len);
            let mut c = ClusterConfig::new(0, "x", "");
            c.add_node(node(NodeKind::DataServer, 1, &host, 1500)).unwrap();
            c.add_node(node(NodeKind::Client, 2, "c", 1501)).unwrap();
            let bytes = encode_config(&c, V).unwrap();
            let decoded = decode_config(&bytes).unwrap();
            assert_eq!(decoded.node(1).unwrap().hostname(), host);
        }
    }
}
