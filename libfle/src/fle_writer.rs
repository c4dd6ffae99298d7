//! Emits [`Object`]s back into the serialized FLE form.
//!
//! Sections are written in ascending section-header file-offset order. Within
//! a section, bytes are chunked into 16-byte hex lines, flushed wherever a
//! symbol definition or relocation must be interleaved at its exact offset;
//! relocation lines stand in for their placeholder bytes. Dynamic relocations
//! are rendered inline in the section whose address range contains them and
//! are also serialized into the structured `dyn_relocs` key.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle::Object;
use crate::fle::ObjectKind;
use crate::fle::ProgramHeader;
use crate::fle::Reloc;
use crate::fle::Section;
use crate::fle::SectionHeader;
use crate::fle::Symbol;
use crate::fle::SymbolKind;
use crate::parsing::TAG_BYTES;
use crate::parsing::TAG_GLOBAL;
use crate::parsing::TAG_LOCAL;
use crate::parsing::TAG_RELOC;
use crate::parsing::TAG_WEAK;
use anyhow::bail;
use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

/// Builder for the serialized form; one instance per output document.
pub struct FleWriter {
    result: Map<String, Value>,
    current_section: Option<String>,
    current_lines: Vec<Value>,
}

impl Default for FleWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FleWriter {
    pub fn new() -> FleWriter {
        FleWriter {
            result: Map::new(),
            current_section: None,
            current_lines: Vec::new(),
        }
    }

    pub fn set_type(&mut self, kind: ObjectKind) {
        self.result
            .insert("type".to_owned(), Value::from(kind.as_str()));
    }

    pub fn set_name(&mut self, name: &str) {
        self.result.insert("name".to_owned(), Value::from(name));
    }

    pub fn begin_section(&mut self, name: &str) {
        self.current_section = Some(name.to_owned());
        self.current_lines.clear();
    }

    pub fn write_line(&mut self, line: String) {
        debug_assert!(self.current_section.is_some());
        self.current_lines.push(Value::from(line));
    }

    pub fn end_section(&mut self) {
        let name = self
            .current_section
            .take()
            .expect("end_section without begin_section");
        let lines = std::mem::take(&mut self.current_lines);
        self.result.insert(name, Value::Array(lines));
    }

    pub fn write_entry(&mut self, entry: u64) {
        self.result.insert("entry".to_owned(), Value::from(entry));
    }

    pub fn write_program_headers(&mut self, phdrs: &[ProgramHeader]) {
        let phdrs: Vec<Value> = phdrs
            .iter()
            .map(|phdr| {
                json!({
                    "name": phdr.name,
                    "vaddr": phdr.vaddr,
                    "size": phdr.size,
                    "flags": phdr.flags.bits(),
                })
            })
            .collect();
        self.result.insert("phdrs".to_owned(), Value::Array(phdrs));
    }

    pub fn write_section_headers(&mut self, shdrs: &[SectionHeader]) {
        let shdrs: Vec<Value> = shdrs
            .iter()
            .map(|shdr| {
                json!({
                    "name": shdr.name,
                    "type": shdr.sh_type,
                    "flags": shdr.flags.bits(),
                    "addr": shdr.addr,
                    "offset": shdr.offset,
                    "size": shdr.size,
                })
            })
            .collect();
        self.result.insert("shdrs".to_owned(), Value::Array(shdrs));
    }

    pub fn write_needed(&mut self, needed: &[String]) {
        self.result.insert(
            "needed".to_owned(),
            Value::Array(needed.iter().map(|n| Value::from(n.as_str())).collect()),
        );
    }

    pub fn write_dynamic_relocs(&mut self, relocs: &[Reloc]) {
        let relocs: Vec<Value> = relocs
            .iter()
            .map(|reloc| {
                json!({
                    "type": reloc.kind.ordinal(),
                    "offset": reloc.offset,
                    "symbol": reloc.symbol,
                    "addend": reloc.addend,
                })
            })
            .collect();
        self.result
            .insert("dyn_relocs".to_owned(), Value::Array(relocs));
    }

    pub fn set_members(&mut self, members: Vec<Value>) {
        self.result
            .insert("members".to_owned(), Value::Array(members));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.result)
    }
}

/// Serializes a document with 4-space indentation and a trailing newline.
pub fn to_pretty_string(value: &Value) -> String {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .expect("JSON serialization cannot fail");
    let mut text = String::from_utf8(out).expect("serde_json emits UTF-8");
    text.push('\n');
    text
}

/// Writes an object to disk. The document is fully assembled before any byte
/// reaches the file, so a failed emit leaves no partial output.
pub fn write_object(obj: &Object, path: &Path) -> Result {
    let value = emit_object(obj)?;
    std::fs::write(path, to_pretty_string(&value))
        .with_context(|| format!("Failed to write `{}`", path.display()))
}

pub fn emit_object(obj: &Object) -> Result<Value> {
    let mut writer = FleWriter::new();
    writer.set_type(obj.kind);

    if obj.kind == ObjectKind::Archive {
        writer.set_name(&obj.name);
        let members = obj
            .members
            .iter()
            .map(|member| {
                let mut value = emit_object(member)?;
                if let Value::Object(map) = &mut value {
                    map.insert("name".to_owned(), Value::from(member.name.as_str()));
                }
                Ok(value)
            })
            .collect::<Result<Vec<Value>>>()?;
        writer.set_members(members);
        return Ok(writer.into_value());
    }

    if !obj.phdrs.is_empty() {
        writer.write_program_headers(&obj.phdrs);
    }
    if obj.kind == ObjectKind::Exe {
        writer.write_entry(obj.entry);
    }
    if !obj.shdrs.is_empty() {
        writer.write_section_headers(&obj.shdrs);
    }
    if !obj.needed.is_empty() {
        writer.write_needed(&obj.needed);
    }
    if !obj.dyn_relocs.is_empty() {
        writer.write_dynamic_relocs(&obj.dyn_relocs);
    }

    // Index defined symbols by section and offset.
    let mut symbol_index: HashMap<&str, BTreeMap<u64, Vec<&Symbol>>> = HashMap::new();
    for sym in &obj.symbols {
        if sym.kind == SymbolKind::Undefined {
            continue;
        }
        symbol_index
            .entry(sym.section.as_str())
            .or_default()
            .entry(sym.offset)
            .or_default()
            .push(sym);
    }

    let dyn_by_section = assign_dynamic_relocs(obj)?;

    // Sections in ascending section-header file-offset order; sections
    // without a header keep their insertion position at offset zero.
    let mut ordered: Vec<(&String, &Section)> = obj.sections.iter().collect();
    ordered.sort_by_key(|(name, _)| {
        obj.shdrs
            .iter()
            .find(|shdr| shdr.name == **name)
            .map(|shdr| shdr.offset)
            .unwrap_or(0)
    });

    for (name, section) in ordered {
        writer.begin_section(name);
        emit_section_lines(
            &mut writer,
            section,
            symbol_index.get(name.as_str()),
            dyn_by_section.get(name.as_str()),
        );
        writer.end_section();
    }

    Ok(writer.into_value())
}

/// Maps each dynamic relocation to the section whose address range contains
/// it, rebased to a section-relative offset.
fn assign_dynamic_relocs(obj: &Object) -> Result<HashMap<&str, Vec<Reloc>>> {
    let mut ranges: HashMap<&str, (u64, u64)> = HashMap::new();
    for shdr in &obj.shdrs {
        ranges.insert(shdr.name.as_str(), (shdr.addr, shdr.addr + shdr.size));
    }
    for phdr in &obj.phdrs {
        ranges
            .entry(phdr.name.as_str())
            .or_insert((phdr.vaddr, phdr.vaddr + phdr.size));
    }
    let mut by_section: HashMap<&str, Vec<Reloc>> = HashMap::new();
    for reloc in &obj.dyn_relocs {
        let placed = ranges
            .iter()
            .find(|(_, (start, end))| *start <= reloc.offset && reloc.offset < *end);
        let Some((&name, &(start, _))) = placed else {
            bail!(LinkError::BadFormat(format!(
                "dynamic relocation at {:#x} lies outside any declared section",
                reloc.offset
            )));
        };
        let mut local = reloc.clone();
        local.offset -= start;
        by_section.entry(name).or_default().push(local);
    }
    Ok(by_section)
}

fn emit_section_lines(
    writer: &mut FleWriter,
    section: &Section,
    symbols: Option<&BTreeMap<u64, Vec<&Symbol>>>,
    dyn_relocs: Option<&Vec<Reloc>>,
) {
    // (reloc, dynamic) entries indexed by offset.
    let mut reloc_index: BTreeMap<u64, Vec<(&Reloc, bool)>> = BTreeMap::new();
    for reloc in &section.relocs {
        reloc_index.entry(reloc.offset).or_default().push((reloc, false));
    }
    if let Some(dyn_relocs) = dyn_relocs {
        for reloc in dyn_relocs {
            reloc_index.entry(reloc.offset).or_default().push((reloc, true));
        }
    }

    let mut breaks: Vec<u64> = reloc_index.keys().copied().collect();
    if let Some(symbols) = symbols {
        breaks.extend(symbols.keys().copied());
    }
    breaks.sort_unstable();
    breaks.dedup();

    let len = section.data.len() as u64;
    let mut pos = 0u64;
    while pos < len {
        if let Some(defs) = symbols.and_then(|s| s.get(&pos)) {
            for sym in defs {
                writer.write_line(symbol_line(sym));
            }
        }
        if let Some(entries) = reloc_index.get(&pos) {
            for (reloc, dynamic) in entries {
                writer.write_line(reloc_line(reloc, *dynamic));
                pos += reloc.kind.width() as u64;
            }
            continue;
        }
        let next_break = breaks
            .iter()
            .find(|&&b| b > pos)
            .copied()
            .unwrap_or(len)
            .min(len);
        while pos < next_break {
            let chunk = (next_break - pos).min(16) as usize;
            let bytes = &section.data[pos as usize..pos as usize + chunk];
            writer.write_line(bytes_line(bytes));
            pos += chunk as u64;
        }
    }

    // Symbols past the end of the stored bytes (BSS-category sections store
    // no data) still need their definitions emitted.
    if let Some(symbols) = symbols {
        for defs in symbols.range(len..).map(|(_, defs)| defs) {
            for sym in defs {
                writer.write_line(symbol_line(sym));
            }
        }
    }
}

fn symbol_line(sym: &Symbol) -> String {
    let tag = match sym.kind {
        SymbolKind::Local => TAG_LOCAL,
        SymbolKind::Weak => TAG_WEAK,
        SymbolKind::Global => TAG_GLOBAL,
        SymbolKind::Undefined => unreachable!("undefined symbols are never emitted"),
    };
    format!("{tag}: {} {} {}", sym.name, sym.size, sym.offset)
}

fn reloc_line(reloc: &Reloc, dynamic: bool) -> String {
    let sign = if reloc.addend < 0 { '-' } else { '+' };
    format!(
        "{TAG_RELOC}: .{}({} {} {:x})",
        reloc.kind.mnemonic(dynamic),
        reloc.symbol,
        sign,
        reloc.addend.unsigned_abs()
    )
}

fn bytes_line(bytes: &[u8]) -> String {
    let mut line = String::with_capacity(4 + bytes.len() * 3);
    line.push_str(TAG_BYTES);
    line.push(':');
    for byte in bytes {
        let _ = write!(line, " {byte:02x}");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse_fle;

    fn round_trip(content: &str) {
        let parsed = parse_fle(content, "t.fle").unwrap();
        let emitted = emit_object(&parsed).unwrap();
        let reparsed = parse_fle(&to_pretty_string(&emitted), "t.fle").unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_round_trip_object() {
        round_trip(
            r#"{
                "type": ".obj",
                "shdrs": [
                    {"name": ".text", "type": 1, "flags": 5, "addr": 0, "offset": 0, "size": 9},
                    {"name": ".data", "type": 1, "flags": 3, "addr": 0, "offset": 9, "size": 8}
                ],
                ".text": [
                    "📤: _start 9 0",
                    "🔢: 55 48 89 e5",
                    "❓: .rel(helper - 4)",
                    "🔢: c3"
                ],
                ".data": [
                    "🏷️: blob 8 0",
                    "❓: .abs64(helper + 0)"
                ]
            }"#,
        );
    }

    #[test]
    fn test_round_trip_bss_symbols() {
        round_trip(
            r#"{
                "type": ".obj",
                "shdrs": [
                    {"name": ".bss", "type": 8, "flags": 11, "addr": 0, "offset": 0, "size": 4096}
                ],
                ".bss": [
                    "📤: buffer 4096 0",
                    "📎: cursor 8 64"
                ]
            }"#,
        );
    }

    #[test]
    fn test_chunking_at_16_bytes() {
        let mut section = Section::default();
        section.data = (0..40u8).collect();
        let mut writer = FleWriter::new();
        writer.begin_section(".text");
        emit_section_lines(&mut writer, &section, None, None);
        writer.end_section();
        let value = writer.into_value();
        let lines = value[".text"].as_array().unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].as_str().unwrap().starts_with("🔢: 00 01"));
        assert_eq!(lines[2].as_str().unwrap().matches(' ').count(), 8);
    }

    #[test]
    fn test_interleaving_flushes_at_symbol() {
        let parsed = parse_fle(
            r#"{
                "type": ".obj",
                ".text": [
                    "🔢: 90 90",
                    "🏷️: here 1 2",
                    "🔢: c3"
                ]
            }"#,
            "t",
        )
        .unwrap();
        let emitted = emit_object(&parsed).unwrap();
        let lines: Vec<&str> = emitted[".text"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l.as_str().unwrap())
            .collect();
        assert_eq!(lines, vec!["🔢: 90 90", "🏷️: here 1 2", "🔢: c3"]);
    }

    #[test]
    fn test_unplaceable_dynamic_reloc_is_error() {
        let mut obj = Object::new("t".to_owned(), ObjectKind::Exe);
        obj.dyn_relocs.push(Reloc {
            kind: crate::fle::RelocKind::Abs64,
            offset: 0x999999,
            symbol: "puts".to_owned(),
            addend: 0,
        });
        assert!(emit_object(&obj).is_err());
    }

    #[test]
    fn test_negative_addend_rendered_hex() {
        let reloc = Reloc {
            kind: crate::fle::RelocKind::Pc32,
            offset: 0,
            symbol: "f".to_owned(),
            addend: -16,
        };
        assert_eq!(reloc_line(&reloc, false), "❓: .rel(f - 10)");
        assert_eq!(reloc_line(&reloc, true), "❓: .dynrel(f - 10)");
    }
}
