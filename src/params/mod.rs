//! Configuration Parameter Registry
//!
//! Declarative catalog of every tunable a grid configuration can carry:
//! wire id, data type, bounds, default, section mask, version window,
//! mandatory bit and change class. Built once at startup and shared as an
//! immutable reference for the lifetime of the process.

mod catalog;

use std::collections::HashMap;
use std::sync::OnceLock;

/// Highest wire config id (14 bits on the wire).
pub const MAX_CONFIG_ID: u16 = 16383;

/// Upper bound on the number of registered parameters.
pub const MAX_DENSE_ENTRIES: usize = 256;

/// Highest node id allowed in any cluster.
pub const MAX_NODE_ID: u32 = 255;

/// Wire id carrying the node type in every section.
pub const ID_NODE_TYPE: u16 = 999;

/// Wire id carrying the parent section pointer in every section.
pub const ID_PARENT_ID: u16 = 16382;

/// Wire ids of the system section parameters. On the wire the system
/// section uses ids 1..=3; the registry stores them offset by 1000 so
/// they stay unique among all config ids.
pub const SYSTEM_ID_WIRE_OFFSET: u16 = 1000;

/// Section types a parameter can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionKind {
    DataServer = 1,
    Client = 2,
    ClusterServer = 3,
    SqlServer = 4,
    RepServer = 5,
    FileServer = 6,
    Restore = 7,
    ClusterMgr = 8,
    Comm = 9,
    System = 10,
}

impl SectionKind {
    pub const ALL: [SectionKind; 10] = [
        SectionKind::DataServer,
        SectionKind::Client,
        SectionKind::ClusterServer,
        SectionKind::SqlServer,
        SectionKind::RepServer,
        SectionKind::FileServer,
        SectionKind::Restore,
        SectionKind::ClusterMgr,
        SectionKind::Comm,
        SectionKind::System,
    ];

    #[inline]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Bitset over `SectionKind`
pub type SectionMask = u32;

pub const fn mask_of(kinds: &[SectionKind]) -> SectionMask {
    let mut m = 0;
    let mut i = 0;
    while i < kinds.len() {
        m |= 1 << (kinds[i] as u32);
        i += 1;
    }
    m
}

/// Data type of a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    U16,
    U32,
    U64,
    Str,
}

/// When a changed value of the parameter can take effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    Online,
    NodeRestart,
    RollingUpgrade,
    RollingUpgradeSpecial,
    InitialNodeRestart,
    ClusterRestart,
    NotChangeable,
}

/// One catalog record. Constructed once by [`catalog`], never mutated.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub id: u16,
    pub name: &'static str,
    pub description: &'static str,
    pub data_type: ParamType,
    pub default_num: u64,
    pub default_str: &'static str,
    pub min_value: Option<u64>,
    pub max_value: Option<u64>,
    pub is_mandatory: bool,
    pub mandatory_bit: u8,
    pub kinds: SectionMask,
    pub min_ndb_version: u32,
    pub max_ndb_version: u32,
    pub min_ic_version: u32,
    pub max_ic_version: u32,
    pub iclaustron_only: bool,
    pub change: ChangeClass,
    pub is_deprecated: bool,
    pub is_not_configurable: bool,
    pub is_not_sent: bool,
    pub is_derived_default: bool,
    pub is_key: bool,
}

impl ParamEntry {
    pub fn applies_to(&self, kind: SectionKind) -> bool {
        self.kinds & kind.bit() != 0
    }

    pub fn is_string(&self) -> bool {
        self.data_type == ParamType::Str
    }

    pub fn is_boolean(&self) -> bool {
        self.data_type == ParamType::Bool
    }

    /// Bounds check for a numeric value, including the type's own range.
    pub fn in_bounds(&self, value: u64) -> bool {
        if let Some(min) = self.min_value {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max_value {
            if value > max {
                return false;
            }
        }
        match self.data_type {
            ParamType::Bool => value <= 1,
            ParamType::U16 => value <= u16::MAX as u64,
            ParamType::U32 => value <= u32::MAX as u64,
            ParamType::U64 | ParamType::Str => true,
        }
    }
}

/// Composite 64-bit version numbers: low 32 bits are the legacy NDB
/// version, high 32 bits the iClaustron version, bit 20 of the low word
/// flags an iClaustron peer.
pub mod version {
    /// Bit in the low word that marks an iClaustron peer.
    pub const PROTOCOL_BIT: u32 = 20;

    pub fn make(ndb: u32, ic: u32) -> u64 {
        let mut low = ndb;
        if ic != 0 {
            low |= 1 << PROTOCOL_BIT;
        }
        ((ic as u64) << 32) | low as u64
    }

    pub fn ndb_half(v: u64) -> u32 {
        (v as u32) & !(1 << PROTOCOL_BIT)
    }

    pub fn ic_half(v: u64) -> u32 {
        (v >> 32) as u32
    }

    pub fn is_iclaustron(v: u64) -> bool {
        (v as u32) & (1 << PROTOCOL_BIT) != 0
    }
}

/// The process-wide parameter registry.
pub struct ParamRegistry {
    entries: Vec<ParamEntry>,
    by_id: HashMap<u16, u16>,
    by_name: HashMap<&'static str, u16>,
    mandatory_masks: [u64; 11],
}

static GLOBAL: OnceLock<ParamRegistry> = OnceLock::new();

impl ParamRegistry {
    /// The global catalog, built on first use.
    pub fn global() -> &'static ParamRegistry {
        GLOBAL.get_or_init(|| {
            let mut builder = RegistryBuilder::new();
            catalog::register_all(&mut builder);
            builder.finish()
        })
    }

    pub fn by_id(&self, id: u16) -> Option<&ParamEntry> {
        self.by_id.get(&id).map(|&ix| &self.entries[ix as usize])
    }

    pub fn by_name(&self, name: &str) -> Option<&ParamEntry> {
        self.by_name.get(name).map(|&ix| &self.entries[ix as usize])
    }

    /// All entries in dense (registration) order.
    pub fn iter(&self) -> impl Iterator<Item = &ParamEntry> {
        self.entries.iter()
    }

    /// Entries applicable to one section kind, dense order.
    pub fn iter_kind(&self, kind: SectionKind) -> impl Iterator<Item = &ParamEntry> {
        self.entries.iter().filter(move |e| e.applies_to(kind))
    }

    /// OR of `1 << mandatory_bit` over every mandatory entry of the kind.
    pub fn mandatory_mask(&self, kind: SectionKind) -> u64 {
        self.mandatory_masks[kind as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the entry is carried on the wire for `composite_version`.
    pub fn is_entry_used_in_version(entry: &ParamEntry, composite_version: u64) -> bool {
        let ndb = version::ndb_half(composite_version);
        let ic = version::ic_half(composite_version);
        if entry.iclaustron_only && ic == 0 {
            return false;
        }
        if entry.min_ndb_version != 0 && ndb < entry.min_ndb_version {
            return false;
        }
        if entry.max_ndb_version != 0 && ndb > entry.max_ndb_version {
            return false;
        }
        if entry.min_ic_version != 0 && ic < entry.min_ic_version {
            return false;
        }
        if entry.max_ic_version != 0 && ic > entry.max_ic_version {
            return false;
        }
        true
    }
}

/// Builder used only during registry construction. Duplicate ids, id
/// overflow and mandatory-bit collisions are programmer errors and panic.
pub(crate) struct RegistryBuilder {
    entries: Vec<ParamEntry>,
    by_id: HashMap<u16, u16>,
    by_name: HashMap<&'static str, u16>,
    next_mandatory_bit: u8,
}

impl RegistryBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_DENSE_ENTRIES),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            next_mandatory_bit: 0,
        }
    }

    pub fn entry(
        &mut self,
        id: u16,
        name: &'static str,
        data_type: ParamType,
        default_num: u64,
        kinds: SectionMask,
        change: ChangeClass,
    ) -> EntryRef<'_> {
        assert!(id <= MAX_CONFIG_ID, "config id {} out of range", id);
        assert!(
            !self.by_id.contains_key(&id),
            "config id {} registered twice",
            id
        );
        assert!(
            self.entries.len() < MAX_DENSE_ENTRIES,
            "parameter catalog overflow"
        );
        let ix = self.entries.len() as u16;
        self.entries.push(ParamEntry {
            id,
            name,
            description: "",
            data_type,
            default_num,
            default_str: "",
            min_value: None,
            max_value: None,
            is_mandatory: false,
            mandatory_bit: 0,
            kinds,
            min_ndb_version: 0,
            max_ndb_version: 0,
            min_ic_version: 0,
            max_ic_version: 0,
            iclaustron_only: false,
            change,
            is_deprecated: false,
            is_not_configurable: false,
            is_not_sent: false,
            is_derived_default: false,
            is_key: false,
        });
        self.by_id.insert(id, ix);
        // First registration wins for the name lookup; the catalog reuses
        // one name on two ids for the thread lock parameters.
        self.by_name.entry(name).or_insert(ix);
        EntryRef { builder: self, ix }
    }

    /// Register a deprecated id: accepted on input, never interpreted.
    pub fn deprecated(&mut self, id: u16, name: &'static str) {
        self.entry(id, name, ParamType::U32, 0, 0, ChangeClass::NotChangeable)
            .flag_deprecated();
    }

    fn finish(self) -> ParamRegistry {
        let mut mandatory_masks = [0u64; 11];
        for kind in SectionKind::ALL {
            let mut mask = 0u64;
            for e in &self.entries {
                if e.is_mandatory && e.applies_to(kind) {
                    assert!(
                        mask & (1 << e.mandatory_bit) == 0,
                        "mandatory bit {} duplicated for {:?}",
                        e.mandatory_bit,
                        kind
                    );
                    mask |= 1 << e.mandatory_bit;
                }
            }
            mandatory_masks[kind as usize] = mask;
        }
        ParamRegistry {
            entries: self.entries,
            by_id: self.by_id,
            by_name: self.by_name,
            mandatory_masks,
        }
    }
}

/// Fluent handle for the entry just registered.
pub(crate) struct EntryRef<'a> {
    builder: &'a mut RegistryBuilder,
    ix: u16,
}

impl<'a> EntryRef<'a> {
    fn e(&mut self) -> &mut ParamEntry {
        &mut self.builder.entries[self.ix as usize]
    }

    pub fn desc(mut self, d: &'static str) -> Self {
        self.e().description = d;
        self
    }

    pub fn min(mut self, v: u64) -> Self {
        self.e().min_value = Some(v);
        self
    }

    pub fn max(mut self, v: u64) -> Self {
        self.e().max_value = Some(v);
        self
    }

    pub fn min_max(self, lo: u64, hi: u64) -> Self {
        self.min(lo).max(hi)
    }

    pub fn default_str(mut self, s: &'static str) -> Self {
        self.e().default_str = s;
        self
    }

    pub fn mandatory(mut self) -> Self {
        let bit = self.builder.next_mandatory_bit;
        assert!(bit < 64, "mandatory bit overflow");
        self.builder.next_mandatory_bit += 1;
        let e = self.e();
        e.is_mandatory = true;
        e.mandatory_bit = bit;
        self
    }

    pub fn key(mut self) -> Self {
        self.e().is_key = true;
        self
    }

    pub fn derived_default(mut self) -> Self {
        self.e().is_derived_default = true;
        self
    }

    pub fn not_sent(mut self) -> Self {
        self.e().is_not_sent = true;
        self
    }

    pub fn not_configurable(mut self) -> Self {
        self.e().is_not_configurable = true;
        self
    }

    pub fn iclaustron_only(mut self) -> Self {
        self.e().iclaustron_only = true;
        self
    }

    pub fn min_ndb_version(mut self, v: u32) -> Self {
        self.e().min_ndb_version = v;
        self
    }

    pub fn max_ndb_version(mut self, v: u32) -> Self {
        self.e().max_ndb_version = v;
        self
    }

    fn flag_deprecated(mut self) {
        self.e().is_deprecated = true;
    }
}
