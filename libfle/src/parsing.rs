//! Parses the serialized FLE form into [`Object`]s.
//!
//! Parsing runs two passes over each document: pass one collects symbol
//! definitions from every section, pass two materializes section bytes,
//! appending a zero placeholder of the relocation's width wherever a `❓`
//! line occurs. Relocation targets with no definition anywhere in the object
//! are recorded as undefined symbols.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle::Object;
use crate::fle::ObjectKind;
use crate::fle::Phf;
use crate::fle::ProgramHeader;
use crate::fle::Reloc;
use crate::fle::RelocKind;
use crate::fle::Section;
use crate::fle::SectionHeader;
use crate::fle::Shf;
use crate::fle::Symbol;
use crate::fle::SymbolKind;
use crate::fle::RESERVED_KEYS;
use crate::fs;
use anyhow::bail;
use anyhow::Context;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

pub(crate) const TAG_BYTES: &str = "🔢";
pub(crate) const TAG_LOCAL: &str = "🏷️";
pub(crate) const TAG_WEAK: &str = "📎";
pub(crate) const TAG_GLOBAL: &str = "📤";
pub(crate) const TAG_RELOC: &str = "❓";

/// The wire form of one `dyn_relocs` entry; `type` is the relocation kind's
/// integer ordinal.
#[derive(Deserialize)]
pub(crate) struct DynRelocWire {
    #[serde(rename = "type")]
    pub(crate) kind: u32,
    pub(crate) offset: u64,
    pub(crate) symbol: String,
    pub(crate) addend: i64,
}

pub fn load_fle(path: &Path) -> Result<Object> {
    let content = fs::read_file_string(path)?;
    parse_fle(&content, &fs::basename(path))
        .with_context(|| format!("Failed to parse FLE file `{}`", path.display()))
}

pub fn parse_fle(content: &str, name: &str) -> Result<Object> {
    let content = strip_shebang(content);
    let value: Value = serde_json::from_str(content).context("invalid JSON")?;
    let Value::Object(map) = value else {
        bail!(LinkError::BadFormat(
            "top level of an FLE document must be a JSON object".to_owned()
        ));
    };
    parse_document(&map, name)
}

fn strip_shebang(content: &str) -> &str {
    if let Some(rest) = content.strip_prefix("#!") {
        match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        }
    } else {
        content
    }
}

fn parse_document(map: &Map<String, Value>, name: &str) -> Result<Object> {
    let kind_str = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| LinkError::BadFormat("missing `type` key".to_owned()))?;
    let kind = ObjectKind::from_str(kind_str)
        .ok_or_else(|| LinkError::BadFormat(format!("unknown object type `{kind_str}`")))?;
    let mut obj = Object::new(name.to_owned(), kind);

    if kind == ObjectKind::Archive {
        if let Some(members) = map.get("members") {
            let members = members
                .as_array()
                .ok_or_else(|| LinkError::BadFormat("`members` must be an array".to_owned()))?;
            for member in members {
                let Value::Object(member_map) = member else {
                    bail!(LinkError::BadFormat(
                        "archive member must be a JSON object".to_owned()
                    ));
                };
                let member_name = member_map
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                obj.members.push(parse_document(member_map, member_name)?);
            }
        }
        return Ok(obj);
    }

    if kind == ObjectKind::Exe {
        if let Some(entry) = map.get("entry") {
            obj.entry = entry
                .as_u64()
                .ok_or_else(|| LinkError::BadFormat("`entry` must be an integer".to_owned()))?;
        }
    }
    if let Some(phdrs) = map.get("phdrs") {
        obj.phdrs = parse_program_headers(phdrs)?;
    }
    if let Some(shdrs) = map.get("shdrs") {
        obj.shdrs = parse_section_headers(shdrs)?;
    }
    if let Some(needed) = map.get("needed") {
        let needed = needed
            .as_array()
            .ok_or_else(|| LinkError::BadFormat("`needed` must be an array".to_owned()))?;
        for entry in needed {
            let entry = entry
                .as_str()
                .ok_or_else(|| LinkError::BadFormat("`needed` entries must be strings".to_owned()))?;
            obj.needed.push(entry.to_owned());
        }
    }
    let has_dyn_key = map.contains_key("dyn_relocs");
    if let Some(dyn_relocs) = map.get("dyn_relocs") {
        for entry in dyn_relocs
            .as_array()
            .ok_or_else(|| LinkError::BadFormat("`dyn_relocs` must be an array".to_owned()))?
        {
            let wire: DynRelocWire =
                serde_json::from_value(entry.clone()).context("bad `dyn_relocs` entry")?;
            let kind = RelocKind::from_ordinal(wire.kind).ok_or_else(|| {
                LinkError::BadFormat(format!("unknown relocation ordinal {}", wire.kind))
            })?;
            obj.dyn_relocs.push(Reloc {
                kind,
                offset: wire.offset,
                symbol: wire.symbol,
                addend: wire.addend,
            });
        }
    }

    // Pass one: collect symbol definitions across all sections.
    let mut defined_names: HashSet<String> = HashSet::new();
    for (key, value) in map {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        for line in section_lines(key, value)? {
            let (tag, payload) = split_tag(line)?;
            if let Some(kind) = symbol_kind_for_tag(tag) {
                let sym = parse_symbol_line(kind, key, payload)?;
                defined_names.insert(sym.name.clone());
                obj.symbols.push(sym);
            }
        }
    }

    // Pass two: materialize section bytes and relocations.
    for (key, value) in map {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let mut section = Section {
            name: key.clone(),
            ..Section::default()
        };
        for line in section_lines(key, value)? {
            let (tag, payload) = split_tag(line)?;
            match tag {
                TAG_BYTES => parse_hex_bytes(payload, &mut section.data)?,
                TAG_RELOC => {
                    let (kind, dynamic, symbol, addend) = parse_reloc_line(payload)?;
                    let position = section.data.len() as u64;
                    if dynamic {
                        // Inline dynamic relocations are a rendering of the
                        // structured list; only re-collect them when the
                        // document lacks that list.
                        if !has_dyn_key {
                            let base = section_address(&obj, key);
                            obj.dyn_relocs.push(Reloc {
                                kind,
                                offset: base + position,
                                symbol: symbol.clone(),
                                addend,
                            });
                        }
                    } else {
                        if !defined_names.contains(&symbol) {
                            defined_names.insert(symbol.clone());
                            obj.symbols.push(Symbol {
                                kind: SymbolKind::Undefined,
                                section: String::new(),
                                offset: 0,
                                size: 0,
                                name: symbol.clone(),
                            });
                        }
                        section.relocs.push(Reloc {
                            kind,
                            offset: position,
                            symbol,
                            addend,
                        });
                    }
                    section.data.extend(std::iter::repeat(0).take(kind.width()));
                }
                _ if symbol_kind_for_tag(tag).is_some() => section.has_symbols = true,
                _ => bail!(LinkError::BadFormat(format!("unknown line tag `{tag}`"))),
            }
        }
        obj.sections.insert(key.clone(), section);
    }

    Ok(obj)
}

/// The virtual address a section is loaded at, per its program header or
/// section header. Used to rebase inline dynamic relocations.
fn section_address(obj: &Object, name: &str) -> u64 {
    if let Some(phdr) = obj.phdrs.iter().find(|phdr| phdr.name == name) {
        return phdr.vaddr;
    }
    if let Some(shdr) = obj.shdrs.iter().find(|shdr| shdr.name == name) {
        return shdr.addr;
    }
    0
}

fn section_lines<'a>(key: &str, value: &'a Value) -> Result<Vec<&'a str>> {
    let lines = value
        .as_array()
        .ok_or_else(|| LinkError::BadFormat(format!("section `{key}` must be an array")))?;
    lines
        .iter()
        .map(|line| {
            line.as_str().ok_or_else(|| {
                LinkError::BadFormat(format!("section `{key}` contains a non-string line")).into()
            })
        })
        .collect()
}

fn split_tag(line: &str) -> Result<(&str, &str)> {
    let Some(colon) = line.find(':') else {
        bail!(LinkError::BadFormat(format!("untagged line `{line}`")));
    };
    Ok((&line[..colon], &line[colon + 1..]))
}

fn symbol_kind_for_tag(tag: &str) -> Option<SymbolKind> {
    match tag {
        TAG_LOCAL => Some(SymbolKind::Local),
        TAG_WEAK => Some(SymbolKind::Weak),
        TAG_GLOBAL => Some(SymbolKind::Global),
        _ => None,
    }
}

/// Payload grammar: `name size offset`, decimal.
fn parse_symbol_line(kind: SymbolKind, section: &str, payload: &str) -> Result<Symbol> {
    let mut fields = payload.split_whitespace();
    let (Some(name), Some(size), Some(offset)) = (fields.next(), fields.next(), fields.next())
    else {
        bail!(LinkError::BadFormat(format!(
            "bad symbol definition `{payload}`"
        )));
    };
    let size = size
        .parse()
        .with_context(|| format!("bad symbol size in `{payload}`"))?;
    let offset = offset
        .parse()
        .with_context(|| format!("bad symbol offset in `{payload}`"))?;
    Ok(Symbol {
        kind,
        section: section.to_owned(),
        offset,
        size,
        name: name.to_owned(),
    })
}

fn parse_hex_bytes(payload: &str, out: &mut Vec<u8>) -> Result {
    for pair in payload.split_whitespace() {
        let byte = u8::from_str_radix(pair, 16)
            .map_err(|_| LinkError::BadFormat(format!("bad hex byte `{pair}`")))?;
        out.push(byte);
    }
    Ok(())
}

/// Payload grammar: `.<mnemonic>(<symbol> <sign> <hex addend>)`.
fn parse_reloc_line(payload: &str) -> Result<(RelocKind, bool, String, i64)> {
    let text = payload.trim();
    let bad = || LinkError::BadFormat(format!("bad relocation `{text}`"));
    let body = text.strip_prefix('.').ok_or_else(bad)?;
    let open = body.find('(').ok_or_else(bad)?;
    let mnemonic = &body[..open];
    let (kind, dynamic) = RelocKind::from_mnemonic(mnemonic)
        .ok_or_else(|| LinkError::BadFormat(format!("unknown relocation mnemonic `{mnemonic}`")))?;
    let inner = body[open + 1..].strip_suffix(')').ok_or_else(bad)?;
    let sign_pos = inner
        .find(|c| c == '+' || c == '-')
        .ok_or_else(bad)?;
    let symbol = inner[..sign_pos].trim();
    if symbol.is_empty() {
        bail!(bad());
    }
    let negative = inner.as_bytes()[sign_pos] == b'-';
    let digits = inner[sign_pos + 1..].trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    let magnitude = i64::from_str_radix(digits, 16).map_err(|_| bad())?;
    let addend = if negative { -magnitude } else { magnitude };
    Ok((kind, dynamic, symbol.to_owned(), addend))
}

fn parse_program_headers(value: &Value) -> Result<Vec<ProgramHeader>> {
    let entries = value
        .as_array()
        .ok_or_else(|| LinkError::BadFormat("`phdrs` must be an array".to_owned()))?;
    entries
        .iter()
        .map(|entry| {
            Ok(ProgramHeader {
                name: required_str(entry, "name")?.to_owned(),
                vaddr: required_u64(entry, "vaddr")?,
                size: required_u64(entry, "size")?,
                flags: Phf::from_bits_truncate(required_u64(entry, "flags")? as u32),
            })
        })
        .collect()
}

fn parse_section_headers(value: &Value) -> Result<Vec<SectionHeader>> {
    let entries = value
        .as_array()
        .ok_or_else(|| LinkError::BadFormat("`shdrs` must be an array".to_owned()))?;
    entries
        .iter()
        .map(|entry| {
            Ok(SectionHeader {
                name: required_str(entry, "name")?.to_owned(),
                sh_type: required_u64(entry, "type")? as u32,
                flags: Shf::from_bits_truncate(required_u64(entry, "flags")? as u32),
                addr: required_u64(entry, "addr")?,
                offset: required_u64(entry, "offset")?,
                size: required_u64(entry, "size")?,
            })
        })
        .collect()
}

fn required_str<'a>(entry: &'a Value, key: &str) -> Result<&'a str> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| LinkError::BadFormat(format!("header missing string `{key}`")).into())
}

fn required_u64(entry: &Value, key: &str) -> Result<u64> {
    entry
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| LinkError::BadFormat(format!("header missing integer `{key}`")).into())
}
