//! The static linker: archive member selection, layout, symbol resolution,
//! relocation patching, PLT/GOT synthesis and output assembly.

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
use crate::layout::Category;
use crate::layout::Layout;
use crate::resolution;
use crate::resolution::ClassifiedInputs;
use crate::resolution::DefinedNames;
use crate::resolution::ResolvedSymbols;
use crate::x86_64;
use crate::x86_64::PatchValue;
use crate::x86_64::GOT_SLOT_SIZE;
use crate::x86_64::PLT_STUB_SIZE;
use anyhow::bail;
use anyhow::Context;
use indexmap::IndexMap;
use indexmap::IndexSet;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct LinkerOptions {
    pub output_name: String,
    pub shared: bool,
    pub entry: String,
    pub static_only: bool,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        LinkerOptions {
            output_name: "a.out".to_owned(),
            shared: false,
            entry: "_start".to_owned(),
            static_only: false,
        }
    }
}

/// GOT slot assignment for symbols resolved through shared libraries.
/// Functions come first in insertion order, then data.
struct GotPlan {
    slots: IndexMap<String, u64>,
    num_funcs: usize,
}

impl GotPlan {
    fn empty() -> GotPlan {
        GotPlan {
            slots: IndexMap::new(),
            num_funcs: 0,
        }
    }

    fn plt_size(&self) -> u64 {
        self.num_funcs as u64 * PLT_STUB_SIZE
    }

    fn got_size(&self) -> u64 {
        self.slots.len() as u64 * GOT_SLOT_SIZE
    }
}

#[tracing::instrument(skip_all, name = "Link")]
pub fn link(objects: &[Object], options: &LinkerOptions) -> Result<Object> {
    let inputs = resolution::classify(objects);
    let active = resolution::select_active(&inputs);
    if active.is_empty() {
        bail!(LinkError::BadInput("no input objects".to_owned()));
    }
    tracing::debug!(active = active.len(), shared_deps = inputs.shared.len());

    let mut layout = Layout::concatenate(&active);
    let shared_provided = shared_provided_names(&inputs);
    let got_plan = if options.shared {
        GotPlan::empty()
    } else {
        scan_externals(&active, &layout, &shared_provided)
    };
    layout.assign_addresses(got_plan.plt_size(), got_plan.got_size());

    let resolved = resolution::resolve_symbols(&active, &layout)?;

    let mut buffers = SegmentBuffers {
        text: std::mem::take(&mut layout.text),
        rodata: std::mem::take(&mut layout.rodata),
        data: std::mem::take(&mut layout.data),
    };
    let dyn_relocs = apply_relocations(
        &active,
        &layout,
        &resolved,
        &shared_provided,
        &got_plan,
        options,
        &mut buffers,
    )?;

    build_output(
        &active, &inputs, &layout, &resolved, &got_plan, options, buffers, dyn_relocs,
    )
}

/// Non-local symbol names defined by any shared-library input.
fn shared_provided_names<'a>(inputs: &ClassifiedInputs<'a>) -> HashSet<&'a str> {
    let mut names = HashSet::new();
    for so in &inputs.shared {
        for sym in &so.symbols {
            if !sym.section.is_empty()
                && matches!(sym.kind, SymbolKind::Global | SymbolKind::Weak)
            {
                names.insert(sym.name.as_str());
            }
        }
    }
    names
}

/// Walks every relocation of the active set looking for targets that only a
/// shared library provides, and assigns them GOT slots.
fn scan_externals(
    active: &[&Object],
    layout: &Layout,
    shared_provided: &HashSet<&str>,
) -> GotPlan {
    let defined = DefinedNames::compute(active);
    let mut funcs: IndexSet<&str> = IndexSet::new();
    let mut datas: IndexSet<&str> = IndexSet::new();
    for placement in &layout.placements {
        let obj = active[placement.object_index];
        let Some(section) = obj.sections.get(&placement.name) else {
            continue;
        };
        for reloc in &section.relocs {
            if defined.is_defined(placement.object_index, &reloc.symbol) {
                continue;
            }
            if !shared_provided.contains(reloc.symbol.as_str()) {
                continue;
            }
            match reloc.kind {
                RelocKind::Pc32 => {
                    funcs.insert(reloc.symbol.as_str());
                }
                RelocKind::GotPcRel => {
                    datas.insert(reloc.symbol.as_str());
                }
                _ => {}
            }
        }
    }
    let mut plan = GotPlan::empty();
    for name in &funcs {
        let index = plan.slots.len() as u64;
        plan.slots.insert((*name).to_owned(), index);
    }
    plan.num_funcs = plan.slots.len();
    for name in &datas {
        if !plan.slots.contains_key(*name) {
            let index = plan.slots.len() as u64;
            plan.slots.insert((*name).to_owned(), index);
        }
    }
    plan
}

struct SegmentBuffers {
    text: Vec<u8>,
    rodata: Vec<u8>,
    data: Vec<u8>,
}

impl SegmentBuffers {
    fn for_category(&mut self, category: Category) -> Option<&mut Vec<u8>> {
        match category {
            Category::Text => Some(&mut self.text),
            Category::Rodata => Some(&mut self.rodata),
            Category::Data => Some(&mut self.data),
            Category::Bss => None,
        }
    }
}

#[tracing::instrument(skip_all, name = "Apply relocations")]
fn apply_relocations(
    active: &[&Object],
    layout: &Layout,
    resolved: &ResolvedSymbols,
    shared_provided: &HashSet<&str>,
    got_plan: &GotPlan,
    options: &LinkerOptions,
    buffers: &mut SegmentBuffers,
) -> Result<Vec<Reloc>> {
    let mut dyn_relocs = Vec::new();
    for placement in &layout.placements {
        let obj = active[placement.object_index];
        let Some(section) = obj.sections.get(&placement.name) else {
            continue;
        };
        let section_vaddr = layout
            .section_address(placement.object_index, &placement.name)
            .expect("placement always has an address");
        for reloc in &section.relocs {
            if placement.category != Category::Bss
                && reloc.offset as usize + reloc.kind.width() > section.data.len()
            {
                bail!(LinkError::BadRelocation(format!(
                    "offset {:#x} lies outside section {} of {}",
                    reloc.offset, placement.name, obj.name
                )));
            }
            let p = section_vaddr + reloc.offset;
            let internal = resolved.is_internal(placement.object_index, &reloc.symbol);
            let value = if internal {
                let s = resolved
                    .lookup(placement.object_index, &reloc.symbol)
                    .expect("internal symbols always resolve");
                x86_64::relocation_value(reloc.kind, s, reloc.addend, p, &reloc.symbol)?
            } else if options.shared {
                // Leave externals of a shared library to the loader.
                dyn_relocs.push(Reloc {
                    kind: reloc.kind,
                    offset: p,
                    symbol: reloc.symbol.clone(),
                    addend: reloc.addend,
                });
                continue;
            } else if shared_provided.contains(reloc.symbol.as_str()) {
                let slot = *got_plan.slots.get(&reloc.symbol).ok_or_else(|| {
                    LinkError::UndefinedSymbol(reloc.symbol.clone())
                })?;
                let target = match reloc.kind {
                    RelocKind::Pc32 => layout.plt_base + slot * PLT_STUB_SIZE,
                    RelocKind::GotPcRel => layout.got_base + slot * GOT_SLOT_SIZE,
                    // Absolute references cannot be satisfied at load time
                    // in a fixed-address executable.
                    _ => bail!(LinkError::UndefinedSymbol(reloc.symbol.clone())),
                };
                x86_64::relocation_value(RelocKind::Pc32, target, reloc.addend, p, &reloc.symbol)?
            } else {
                bail!(LinkError::UndefinedSymbol(reloc.symbol.clone()));
            };
            if let Some(buffer) = buffers.for_category(placement.category) {
                let patch_offset = (placement.seg_offset + reloc.offset) as usize;
                write_patch(buffer, patch_offset, value);
            }
        }
    }
    Ok(dyn_relocs)
}

fn write_patch(buffer: &mut [u8], offset: usize, value: PatchValue) {
    let (bytes, len) = value.to_bytes();
    buffer[offset..offset + len].copy_from_slice(&bytes[..len]);
}

/// Fills in the PLT: one 6-byte indirect jump through the matching GOT slot
/// per function external.
fn build_plt(layout: &Layout, got_plan: &GotPlan) -> Vec<u8> {
    let mut plt = vec![0u8; got_plan.plt_size() as usize];
    for index in 0..got_plan.num_funcs as u64 {
        let stub_addr = layout.plt_base + index * PLT_STUB_SIZE;
        let slot_addr = layout.got_base + index * GOT_SLOT_SIZE;
        let disp = (slot_addr as i64 - (stub_addr + PLT_STUB_SIZE) as i64) as i32;
        let stub = x86_64::generate_plt_stub(disp);
        let offset = (index * PLT_STUB_SIZE) as usize;
        plt[offset..offset + stub.len()].copy_from_slice(&stub);
    }
    plt
}

#[allow(clippy::too_many_arguments)]
fn build_output(
    active: &[&Object],
    inputs: &ClassifiedInputs,
    layout: &Layout,
    resolved: &ResolvedSymbols,
    got_plan: &GotPlan,
    options: &LinkerOptions,
    buffers: SegmentBuffers,
    mut dyn_relocs: Vec<Reloc>,
) -> Result<Object> {
    let kind = if options.shared {
        ObjectKind::Shared
    } else {
        ObjectKind::Exe
    };
    let mut output = Object::new(options.output_name.clone(), kind);

    let mut text = buffers.text;
    text.extend_from_slice(&build_plt(layout, got_plan));
    let got = vec![0u8; layout.got_size as usize];

    let mut file_offset = 0u64;
    let mut push_section = |output: &mut Object,
                            name: &str,
                            data: Vec<u8>,
                            base: u64,
                            flags: Shf,
                            phf: Phf,
                            nobits_size: Option<u64>| {
        let size = nobits_size.unwrap_or(data.len() as u64);
        output.shdrs.push(SectionHeader {
            name: name.to_owned(),
            sh_type: if nobits_size.is_some() {
                crate::fle::SHT_NOBITS
            } else {
                crate::fle::SHT_PROGBITS
            },
            flags,
            addr: base,
            offset: file_offset,
            size,
        });
        if nobits_size.is_none() {
            file_offset += size;
        }
        output.phdrs.push(ProgramHeader {
            name: name.to_owned(),
            vaddr: base,
            size,
            flags: phf,
        });
        output.sections.insert(
            name.to_owned(),
            Section {
                name: name.to_owned(),
                data,
                ..Section::default()
            },
        );
    };

    push_section(
        &mut output,
        ".text",
        text,
        layout.text_base,
        Shf::ALLOC | Shf::EXEC,
        Phf::R | Phf::X,
        None,
    );
    push_section(
        &mut output,
        ".rodata",
        buffers.rodata,
        layout.rodata_base,
        Shf::ALLOC,
        Phf::R,
        None,
    );
    push_section(
        &mut output,
        ".data",
        buffers.data,
        layout.data_base,
        Shf::ALLOC | Shf::WRITE,
        Phf::R | Phf::W,
        None,
    );
    if !got.is_empty() {
        push_section(
            &mut output,
            ".got",
            got,
            layout.got_base,
            Shf::ALLOC | Shf::WRITE,
            Phf::R | Phf::W,
            None,
        );
    }
    push_section(
        &mut output,
        ".bss",
        Vec::new(),
        layout.bss_base,
        Shf::ALLOC | Shf::WRITE | Shf::NOBITS,
        Phf::R | Phf::W,
        Some(layout.bss_size),
    );

    // Export global and weak definitions with section-relative offsets.
    for (index, obj) in active.iter().enumerate() {
        for sym in &obj.symbols {
            if sym.section.is_empty()
                || !matches!(sym.kind, SymbolKind::Global | SymbolKind::Weak)
            {
                continue;
            }
            let Some(base) = layout.section_address(index, &sym.section) else {
                continue;
            };
            let category = Category::of(&sym.section);
            output.symbols.push(Symbol {
                kind: sym.kind,
                section: category.output_section_name().to_owned(),
                offset: base + sym.offset - layout.category_base(category),
                size: sym.size,
                name: sym.name.clone(),
            });
        }
    }

    // Keep exports grouped the way the emitter interleaves them: by output
    // section order, then by offset.
    {
        let shdrs = &output.shdrs;
        output.symbols.sort_by_key(|sym| {
            (
                shdrs
                    .iter()
                    .position(|shdr| shdr.name == sym.section)
                    .unwrap_or(usize::MAX),
                sym.offset,
            )
        });
    }
    let exported_sections: Vec<String> =
        output.symbols.iter().map(|sym| sym.section.clone()).collect();
    for name in exported_sections {
        if let Some(section) = output.sections.get_mut(&name) {
            section.has_symbols = true;
        }
    }

    // One load-time ABS64 per GOT slot so the loader can fill in the
    // external's address.
    if !options.shared {
        for (name, index) in &got_plan.slots {
            dyn_relocs.push(Reloc {
                kind: RelocKind::Abs64,
                offset: layout.got_base + index * GOT_SLOT_SIZE,
                symbol: name.clone(),
                addend: 0,
            });
        }
        output.entry = resolved
            .globals
            .get(&options.entry)
            .map(|def| def.addr)
            .unwrap_or(0);
    }
    output.dyn_relocs = dyn_relocs;
    output.needed = inputs
        .shared
        .iter()
        .filter(|so| !so.name.is_empty())
        .map(|so| so.name.clone())
        .collect();

    validate_phdrs(&output.phdrs).context("linker produced an invalid layout")?;
    Ok(output)
}

/// Every program header must start on a page boundary and no two may
/// overlap.
fn validate_phdrs(phdrs: &[ProgramHeader]) -> Result {
    for phdr in phdrs {
        if phdr.vaddr % crate::layout::PAGE_SIZE != 0 {
            bail!(LinkError::BadInput(format!(
                "segment {} is not page aligned",
                phdr.name
            )));
        }
    }
    for (i, a) in phdrs.iter().enumerate() {
        for b in &phdrs[i + 1..] {
            let disjoint = a.vaddr + a.size <= b.vaddr || b.vaddr + b.size <= a.vaddr;
            if !disjoint {
                bail!(LinkError::BadInput(format!(
                    "segments {} and {} overlap",
                    a.name, b.name
                )));
            }
        }
    }
    Ok(())
}
