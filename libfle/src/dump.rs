//! The symbol-table and content dumpers: `nm`, `readfle` and `disasm`.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle::Object;
use crate::fle::ObjectKind;
use crate::fle::SymbolKind;
use crate::layout::matches_prefix;
use anyhow::bail;
use iced_x86::Decoder;
use iced_x86::DecoderOptions;
use iced_x86::Formatter;
use iced_x86::Instruction;
use iced_x86::IntelFormatter;
use itertools::Itertools;
use std::io::Write;

/// Prints one line per defined symbol: a 16-digit offset, a type character
/// and the name, in symbol-table order.
pub fn nm(obj: &Object, out: &mut impl Write) -> Result {
    for sym in &obj.symbols {
        if sym.section.is_empty() {
            continue;
        }
        let Some(type_char) = nm_type_char(sym.kind, &sym.section) else {
            continue;
        };
        writeln!(out, "{:016x} {} {}", sym.offset, type_char, sym.name)?;
    }
    Ok(())
}

fn nm_type_char(kind: SymbolKind, section: &str) -> Option<char> {
    let is_text = matches_prefix(section, ".text");
    let is_data = matches_prefix(section, ".data");
    let is_bss = matches_prefix(section, ".bss");
    let is_rodata = matches_prefix(section, ".rodata");
    match kind {
        SymbolKind::Weak if is_text => Some('W'),
        SymbolKind::Weak if is_data || is_bss || is_rodata => Some('V'),
        SymbolKind::Weak | SymbolKind::Undefined => None,
        kind => {
            let upper = kind == SymbolKind::Global;
            let c = if is_text {
                'T'
            } else if is_data {
                'D'
            } else if is_bss {
                'B'
            } else if is_rodata {
                'R'
            } else {
                return None;
            };
            Some(if upper { c } else { c.to_ascii_lowercase() })
        }
    }
}

/// Human-readable summary of an FLE file.
pub fn readfle(obj: &Object, out: &mut impl Write) -> Result {
    writeln!(out, "FLE object: {}", obj.name)?;
    writeln!(out, "Type: {}", obj.kind.as_str())?;
    if obj.kind == ObjectKind::Exe {
        writeln!(out, "Entry: {:#x}", obj.entry)?;
    }
    if obj.kind == ObjectKind::Archive {
        writeln!(out, "Members:")?;
        for member in &obj.members {
            writeln!(out, "  {}", member.name)?;
        }
        return Ok(());
    }
    if !obj.needed.is_empty() {
        writeln!(out, "Needed: {}", obj.needed.iter().join(", "))?;
    }
    if !obj.phdrs.is_empty() {
        writeln!(out, "Program headers:")?;
        for phdr in &obj.phdrs {
            writeln!(
                out,
                "  {:<10} vaddr {:#010x} size {:#8x} flags {}{}{}",
                phdr.name,
                phdr.vaddr,
                phdr.size,
                if phdr.flags.contains(crate::fle::Phf::R) { 'R' } else { '-' },
                if phdr.flags.contains(crate::fle::Phf::W) { 'W' } else { '-' },
                if phdr.flags.contains(crate::fle::Phf::X) { 'X' } else { '-' },
            )?;
        }
    }
    if !obj.shdrs.is_empty() {
        writeln!(out, "Section headers:")?;
        for shdr in &obj.shdrs {
            writeln!(
                out,
                "  {:<10} type {} flags {:#x} addr {:#010x} offset {:#8x} size {:#8x}",
                shdr.name, shdr.sh_type, shdr.flags.bits(), shdr.addr, shdr.offset, shdr.size
            )?;
        }
    }
    writeln!(out, "Sections:")?;
    for (name, section) in &obj.sections {
        writeln!(
            out,
            "  {:<10} {:6} bytes, {} relocations",
            name,
            section.data.len(),
            section.relocs.len()
        )?;
    }
    if !obj.dyn_relocs.is_empty() {
        writeln!(out, "Dynamic relocations:")?;
        for reloc in &obj.dyn_relocs {
            writeln!(
                out,
                "  {:#010x} .{} {} {:+}",
                reloc.offset,
                reloc.kind.mnemonic(true),
                reloc.symbol,
                reloc.addend
            )?;
        }
    }
    writeln!(out, "Symbols: {}", obj.symbols.len())?;
    Ok(())
}

/// Disassembles one section as 64-bit x86.
pub fn disasm(obj: &Object, section_name: &str, out: &mut impl Write) -> Result {
    let Some(section) = obj.sections.get(section_name) else {
        bail!(LinkError::SectionMissing(section_name.to_owned()));
    };
    let mut decoder = Decoder::with_ip(64, &section.data, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instruction = Instruction::default();
    let mut text = String::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        text.clear();
        formatter.format(&instruction, &mut text);
        let start = instruction.ip() as usize;
        let bytes = &section.data[start..start + instruction.len()];
        let hex = bytes.iter().map(|byte| format!("{byte:02x}")).join(" ");
        writeln!(out, "{start:04x}: {hex:<21} {text}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fle::Symbol;

    fn symbol(name: &str, kind: SymbolKind, section: &str, offset: u64) -> Symbol {
        Symbol {
            kind,
            section: section.to_owned(),
            offset,
            size: 0,
            name: name.to_owned(),
        }
    }

    #[test]
    fn test_nm_type_chars() {
        assert_eq!(nm_type_char(SymbolKind::Global, ".text"), Some('T'));
        assert_eq!(nm_type_char(SymbolKind::Local, ".text.hot"), Some('t'));
        assert_eq!(nm_type_char(SymbolKind::Global, ".data"), Some('D'));
        assert_eq!(nm_type_char(SymbolKind::Local, ".bss"), Some('b'));
        assert_eq!(nm_type_char(SymbolKind::Global, ".rodata.str1.1"), Some('R'));
        assert_eq!(nm_type_char(SymbolKind::Weak, ".text"), Some('W'));
        assert_eq!(nm_type_char(SymbolKind::Weak, ".bss"), Some('V'));
        assert_eq!(nm_type_char(SymbolKind::Global, ".note"), None);
    }

    #[test]
    fn test_nm_output_format() {
        let mut obj = Object::new("t.fle".to_owned(), ObjectKind::Obj);
        obj.symbols.push(symbol("_start", SymbolKind::Global, ".text", 0));
        obj.symbols.push(symbol("helper", SymbolKind::Local, ".text", 0x20));
        obj.symbols.push(symbol("data_var", SymbolKind::Global, ".data", 0x1000));
        obj.symbols.push(symbol("missing", SymbolKind::Undefined, "", 0));
        let mut out = Vec::new();
        nm(&obj, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "0000000000000000 T _start\n\
             0000000000000020 t helper\n\
             0000000000001000 D data_var\n"
        );
    }

    #[test]
    fn test_disasm_simple_prologue() {
        let mut obj = Object::new("t.fle".to_owned(), ObjectKind::Obj);
        obj.sections.insert(
            ".text".to_owned(),
            crate::fle::Section {
                name: ".text".to_owned(),
                data: vec![0x55, 0x48, 0x89, 0xe5, 0xc3], // push rbp; mov rbp, rsp; ret
                ..crate::fle::Section::default()
            },
        );
        let mut out = Vec::new();
        disasm(&obj, ".text", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0000: 55"));
        assert!(lines[0].contains("push"));
        assert!(lines[1].contains("mov"));
        assert!(lines[2].contains("ret"));
    }

    #[test]
    fn test_disasm_missing_section() {
        let obj = Object::new("t.fle".to_owned(), ObjectKind::Obj);
        assert!(disasm(&obj, ".text", &mut Vec::new()).is_err());
    }
}
