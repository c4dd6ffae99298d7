//! Drives the host C compiler and rewrites its ELF relocatable output into
//! an FLE object.
//!
//! The host compiler is invoked with flags that keep the object freestanding
//! (`-fno-common -nostdlib -ffreestanding -fno-asynchronous-unwind-tables`,
//! plus `-static` unless the caller asked for `-fPIC`). The resulting ELF is
//! then read back and every allocatable section is translated into the
//! tagged line format.

use crate::error::Result;
use crate::fle;
use crate::fle::ObjectKind;
use crate::fle::RelocKind;
use crate::fle::Shf;
use crate::fle_writer;
use anyhow::bail;
use anyhow::Context;
use object::Object as _;
use object::ObjectSection;
use object::ObjectSymbol;
use object::RelocationTarget;
use object::SectionKind;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

const COMPILER_FLAGS: [&str; 4] = [
    "-fno-common",
    "-nostdlib",
    "-ffreestanding",
    "-fno-asynchronous-unwind-tables",
];

pub fn run_cc(args: &[String]) -> Result {
    let binary = output_name(args);
    let pic = args.iter().any(|arg| arg == "-fPIC" || arg == "-fpic");

    let mut cmd = Command::new("gcc");
    cmd.arg("-c");
    if !pic {
        cmd.arg("-static");
    }
    cmd.args(COMPILER_FLAGS);
    cmd.args(args);
    let status = cmd.status().context("failed to run gcc")?;
    if !status.success() {
        bail!("gcc compilation failed");
    }

    let data = std::fs::read(&binary)
        .with_context(|| format!("failed to read compiler output `{}`", binary.display()))?;
    let stem = binary
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "a".to_owned());
    let output_path = binary
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{stem}.fle"));

    let obj = elf_to_fle(&data, &format!("{stem}.fle"))?;
    fle_writer::write_object(&obj, &output_path)?;
    std::fs::remove_file(&binary).ok();
    Ok(())
}

fn output_name(args: &[String]) -> PathBuf {
    args.iter()
        .position(|arg| arg == "-o")
        .and_then(|pos| args.get(pos + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("a.out"))
}

/// Translates an ELF relocatable object into an FLE `.obj`.
pub fn elf_to_fle(data: &[u8], name: &str) -> Result<fle::Object> {
    let elf = object::File::parse(data).context("failed to parse compiler output as ELF")?;
    let mut out = fle::Object::new(name.to_owned(), ObjectKind::Obj);
    let mut file_offset = 0u64;

    for section in elf.sections() {
        let object::SectionFlags::Elf { sh_flags } = section.flags() else {
            continue;
        };
        if sh_flags & u64::from(object::elf::SHF_ALLOC) == 0 {
            continue;
        }
        let section_name = section.name()?.to_owned();
        if section_name.contains("note.gnu.property") {
            continue;
        }
        let size = section.size();
        if size == 0 {
            continue;
        }
        let nobits = section.kind() == SectionKind::UninitializedData;

        let mut flags = Shf::ALLOC;
        if sh_flags & u64::from(object::elf::SHF_WRITE) != 0 {
            flags |= Shf::WRITE;
        }
        if sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
            flags |= Shf::EXEC;
        }
        if nobits {
            flags |= Shf::NOBITS;
        }
        out.shdrs.push(fle::SectionHeader {
            name: section_name.clone(),
            sh_type: if nobits {
                fle::SHT_NOBITS
            } else {
                fle::SHT_PROGBITS
            },
            flags,
            addr: 0,
            offset: file_offset,
            size,
        });
        file_offset += size;

        let mut symbols = section_symbols(&elf, &section, &section_name)?;
        symbols.sort_by_key(|sym| sym.offset);
        let has_symbols = !symbols.is_empty();
        out.symbols.extend(symbols);

        let relocs = section_relocations(&elf, &section, &section_name)?;
        let section_data = if nobits {
            Vec::new()
        } else {
            section.data()?.to_vec()
        };
        out.sections.insert(
            section_name.clone(),
            fle::Section {
                name: section_name,
                data: section_data,
                relocs,
                has_symbols,
            },
        );
    }

    Ok(out)
}

/// Symbols whose defining section is `section`, with `@`-version suffixes
/// stripped. ELF section symbols become local symbols named after the
/// section so that relocations against them stay resolvable.
fn section_symbols(
    elf: &object::File,
    section: &object::Section,
    section_name: &str,
) -> Result<Vec<fle::Symbol>> {
    let mut symbols = Vec::new();
    for symbol in elf.symbols() {
        if symbol.section_index() != Some(section.index()) {
            continue;
        }
        if symbol.kind() == object::SymbolKind::File {
            continue;
        }
        let (name, kind) = if symbol.kind() == object::SymbolKind::Section {
            (section_name.to_owned(), fle::SymbolKind::Local)
        } else {
            let name = strip_version_suffix(symbol.name()?);
            if name.is_empty() {
                continue;
            }
            let kind = if symbol.is_weak() {
                fle::SymbolKind::Weak
            } else if symbol.is_global() {
                fle::SymbolKind::Global
            } else {
                fle::SymbolKind::Local
            };
            (name.to_owned(), kind)
        };
        symbols.push(fle::Symbol {
            kind,
            section: section_name.to_owned(),
            offset: symbol.address(),
            size: symbol.size(),
            name,
        });
    }
    Ok(symbols)
}

fn section_relocations(
    elf: &object::File,
    section: &object::Section,
    section_name: &str,
) -> Result<Vec<fle::Reloc>> {
    let mut relocs = Vec::new();
    for (offset, relocation) in section.relocations() {
        let object::RelocationFlags::Elf { r_type } = relocation.flags() else {
            bail!("unsupported relocation encoding in section {section_name}");
        };
        let Some(kind) = reloc_kind_for(r_type) else {
            bail!("unsupported relocation type {r_type} in section {section_name}");
        };
        let RelocationTarget::Symbol(symbol_index) = relocation.target() else {
            bail!("unsupported relocation target in section {section_name}");
        };
        let symbol = elf.symbol_by_index(symbol_index)?;
        let target_name = if symbol.kind() == object::SymbolKind::Section {
            let section_index = symbol
                .section_index()
                .context("section symbol without a section")?;
            elf.section_by_index(section_index)?.name()?.to_owned()
        } else {
            strip_version_suffix(symbol.name()?).to_owned()
        };
        relocs.push(fle::Reloc {
            kind,
            offset,
            symbol: target_name,
            addend: relocation.addend(),
        });
    }
    Ok(relocs)
}

fn reloc_kind_for(r_type: u32) -> Option<RelocKind> {
    Some(match r_type {
        object::elf::R_X86_64_PC32 | object::elf::R_X86_64_PLT32 => RelocKind::Pc32,
        object::elf::R_X86_64_64 => RelocKind::Abs64,
        object::elf::R_X86_64_32 => RelocKind::Abs32,
        object::elf::R_X86_64_32S => RelocKind::Abs32S,
        object::elf::R_X86_64_GOTPCREL
        | object::elf::R_X86_64_GOTPCRELX
        | object::elf::R_X86_64_REX_GOTPCRELX => RelocKind::GotPcRel,
        _ => return None,
    })
}

fn strip_version_suffix(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}
