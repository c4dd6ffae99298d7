//! The FLE object model. An FLE file is a JSON document whose non-reserved
//! keys each hold one section as a sequence of tagged text lines; this module
//! defines the in-memory form shared by the codec, the linker and the loader.

use bitflags::bitflags;
use indexmap::IndexMap;

/// Keys of the serialized form that never name a section.
pub const RESERVED_KEYS: [&str; 8] = [
    "type",
    "entry",
    "phdrs",
    "shdrs",
    "members",
    "needed",
    "dyn_relocs",
    "name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    Abs32,
    Pc32,
    Abs64,
    Abs32S,
    GotPcRel,
}

impl RelocKind {
    /// Number of bytes the relocation patches.
    pub fn width(self) -> usize {
        match self {
            RelocKind::Abs64 => 8,
            _ => 4,
        }
    }

    pub fn mnemonic(self, dynamic: bool) -> &'static str {
        match (self, dynamic) {
            (RelocKind::Abs32, false) => "abs",
            (RelocKind::Pc32, false) => "rel",
            (RelocKind::Abs64, false) => "abs64",
            (RelocKind::Abs32S, false) => "abs32s",
            (RelocKind::GotPcRel, false) => "gotpcrel",
            (RelocKind::Abs32, true) => "dynabs32",
            (RelocKind::Pc32, true) => "dynrel",
            (RelocKind::Abs64, true) => "dynabs64",
            (RelocKind::Abs32S, true) => "dynabs32s",
            (RelocKind::GotPcRel, true) => "dyngotpcrel",
        }
    }

    /// Returns the kind and whether the mnemonic was a dynamic variant.
    pub fn from_mnemonic(mnemonic: &str) -> Option<(RelocKind, bool)> {
        Some(match mnemonic {
            "abs" => (RelocKind::Abs32, false),
            "rel" => (RelocKind::Pc32, false),
            "abs64" => (RelocKind::Abs64, false),
            "abs32s" => (RelocKind::Abs32S, false),
            "gotpcrel" => (RelocKind::GotPcRel, false),
            "dynabs32" => (RelocKind::Abs32, true),
            "dynrel" => (RelocKind::Pc32, true),
            "dynabs64" => (RelocKind::Abs64, true),
            "dynabs32s" => (RelocKind::Abs32S, true),
            "dyngotpcrel" => (RelocKind::GotPcRel, true),
            _ => return None,
        })
    }

    /// Stable integer used when a dynamic relocation is serialized into the
    /// structured `dyn_relocs` key.
    pub fn ordinal(self) -> u32 {
        match self {
            RelocKind::Abs32 => 0,
            RelocKind::Pc32 => 1,
            RelocKind::Abs64 => 2,
            RelocKind::Abs32S => 3,
            RelocKind::GotPcRel => 4,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Option<RelocKind> {
        Some(match ordinal {
            0 => RelocKind::Abs32,
            1 => RelocKind::Pc32,
            2 => RelocKind::Abs64,
            3 => RelocKind::Abs32S,
            4 => RelocKind::GotPcRel,
            _ => return None,
        })
    }
}

/// A relocation. `offset` is relative to the containing section for static
/// relocations and is a virtual address for dynamic ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    pub kind: RelocKind,
    pub offset: u64,
    pub symbol: String,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Local,
    Weak,
    Global,
    Undefined,
}

/// A symbol definition. The tuple (kind, section, offset) is its defining
/// identity; `section` is empty for undefined symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub section: String,
    pub offset: u64,
    pub size: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub has_symbols: bool,
}

bitflags! {
    /// Section header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Shf: u32 {
        const ALLOC = 1;
        const WRITE = 2;
        const EXEC = 4;
        const NOBITS = 8;
    }
}

bitflags! {
    /// Program header (segment) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Phf: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_NOBITS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: String,
    pub sh_type: u32,
    pub flags: Shf,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHeader {
    pub name: String,
    pub vaddr: u64,
    pub size: u64,
    pub flags: Phf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Obj,
    Exe,
    Shared,
    Archive,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Obj => ".obj",
            ObjectKind::Exe => ".exe",
            ObjectKind::Shared => ".so",
            ObjectKind::Archive => ".ar",
        }
    }

    pub fn from_str(kind: &str) -> Option<ObjectKind> {
        Some(match kind {
            ".obj" => ObjectKind::Obj,
            ".exe" => ObjectKind::Exe,
            ".so" => ObjectKind::Shared,
            ".ar" => ObjectKind::Archive,
            _ => return None,
        })
    }
}

/// A parsed FLE object of any kind. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub name: String,
    pub kind: ObjectKind,
    pub sections: IndexMap<String, Section>,
    pub symbols: Vec<Symbol>,
    pub phdrs: Vec<ProgramHeader>,
    pub shdrs: Vec<SectionHeader>,
    /// Only populated for `.ar` objects.
    pub members: Vec<Object>,
    /// Entry virtual address; only meaningful for `.exe`.
    pub entry: u64,
    /// Shared libraries this object depends on.
    pub needed: Vec<String>,
    /// Load-time relocations; offsets are virtual addresses.
    pub dyn_relocs: Vec<Reloc>,
}

impl Object {
    pub fn new(name: String, kind: ObjectKind) -> Object {
        Object {
            name,
            kind,
            sections: IndexMap::new(),
            symbols: Vec::new(),
            phdrs: Vec::new(),
            shdrs: Vec::new(),
            members: Vec::new(),
            entry: 0,
            needed: Vec::new(),
            dyn_relocs: Vec::new(),
        }
    }

    /// Looks up a symbol definition by name, ignoring undefined entries.
    pub fn defined_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|sym| sym.name == name && !sym.section.is_empty())
    }
}
