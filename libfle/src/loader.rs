//! Loads a linked executable and its shared-library dependencies into the
//! current process, applies load-time relocations, and jumps to the entry
//! point.
//!
//! All session state lives in a [`LoaderSession`] created per invocation; the
//! mappings it creates are intentionally leaked, since they must outlive the
//! executed program. Raw memory writes are funnelled through a single patch
//! primitive that verifies the target lies inside a segment this session
//! mapped.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle::Object;
use crate::fle::ObjectKind;
use crate::fle::Phf;
use crate::layout::matches_prefix;
use crate::parsing;
use crate::x86_64;
use crate::x86_64::PatchValue;
use anyhow::bail;
use anyhow::Context;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;

struct LoadedModule {
    obj: Object,
    load_base: u64,
    /// Section name -> absolute runtime address.
    section_addrs: HashMap<String, u64>,
}

struct LoaderSession {
    modules: Vec<LoadedModule>,
    loaded_names: HashSet<String>,
    mapped: Vec<Range<u64>>,
}

/// Runs an executable object. Returns the entry function's return value.
#[tracing::instrument(skip_all, name = "Exec")]
pub fn exec(obj: &Object) -> Result<i32> {
    if obj.kind != ObjectKind::Exe {
        bail!(LinkError::NotExecutable(obj.name.clone()));
    }
    if obj.entry == 0 {
        bail!(LinkError::BadInput(format!(
            "{} has no entry point",
            obj.name
        )));
    }

    let mut session = LoaderSession {
        modules: Vec::new(),
        loaded_names: HashSet::new(),
        mapped: Vec::new(),
    };

    let main_name = if obj.name.is_empty() {
        "main".to_owned()
    } else {
        obj.name.clone()
    };
    session.loaded_names.insert(main_name);
    session.materialize(obj.clone(), 0)?;
    for dep in &obj.needed {
        session.load_dependency(dep)?;
    }

    session.relocate_all()?;
    session.protect_all()?;

    let entry = obj.entry;
    tracing::debug!(entry, modules = session.modules.len());
    // SAFETY: `entry` is the resolved address of the entry symbol inside a
    // segment this session mapped and marked executable.
    let entry_fn: extern "C" fn() -> i32 = unsafe { std::mem::transmute(entry as usize) };
    Ok(entry_fn())
}

impl LoaderSession {
    /// Recursively loads one `needed` entry: the file of that name, or that
    /// name with `.fle` appended. Already-loaded dependencies are skipped.
    fn load_dependency(&mut self, name: &str) -> Result {
        if self.loaded_names.contains(name) {
            return Ok(());
        }
        let obj = parsing::load_fle(Path::new(name))
            .or_else(|_| parsing::load_fle(Path::new(&format!("{name}.fle"))))
            .map_err(|_| LinkError::DependencyNotFound(name.to_owned()))?;
        self.loaded_names.insert(name.to_owned());

        let load_base = if obj.kind == ObjectKind::Exe {
            0
        } else {
            self.reserve_for(&obj)?
        };
        let needed = obj.needed.clone();
        self.materialize(obj, load_base)?;
        for dep in &needed {
            self.load_dependency(dep)?;
        }
        Ok(())
    }

    /// Reserves one contiguous no-access region covering every segment of a
    /// shared object; its start becomes the module's load base.
    fn reserve_for(&mut self, obj: &Object) -> Result<u64> {
        let max_end = obj
            .phdrs
            .iter()
            .filter(|phdr| phdr.size > 0)
            .map(|phdr| phdr.vaddr + phdr.size)
            .max();
        let Some(total_size) = max_end else {
            return Ok(0);
        };
        // SAFETY: anonymous reservation at a kernel-chosen address; nothing
        // existing is replaced.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            bail!(LinkError::MapFailed(format!(
                "reserving {total_size:#x} bytes for {}: {}",
                obj.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(addr as u64)
    }

    /// Maps every non-empty segment of a module read-write and copies its
    /// section bytes in. BSS-prefixed segments stay zero-filled.
    fn materialize(&mut self, obj: Object, load_base: u64) -> Result {
        let mut section_addrs = HashMap::new();
        for phdr in &obj.phdrs {
            if phdr.size == 0 {
                continue;
            }
            let target = load_base + phdr.vaddr;
            // SAFETY: the target range is either inside this module's
            // reservation or a fixed absolute range assigned by the linker;
            // writable during relocation, protections are applied later.
            let mapped = unsafe {
                libc::mmap(
                    target as *mut libc::c_void,
                    phdr.size as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                bail!(LinkError::MapFailed(format!(
                    "segment {} at {target:#x}: {}",
                    phdr.name,
                    std::io::Error::last_os_error()
                )));
            }
            let Some(section) = obj.sections.get(&phdr.name) else {
                bail!(LinkError::SectionMissing(phdr.name.clone()));
            };
            if !matches_prefix(&phdr.name, ".bss") && !section.data.is_empty() {
                let len = (section.data.len() as u64).min(phdr.size) as usize;
                // SAFETY: we just mapped [target, target + size) read-write.
                unsafe {
                    std::ptr::copy_nonoverlapping(section.data.as_ptr(), target as *mut u8, len);
                }
            }
            section_addrs.insert(phdr.name.clone(), target);
            self.mapped.push(target..target + phdr.size);
        }
        self.modules.push(LoadedModule {
            obj,
            load_base,
            section_addrs,
        });
        Ok(())
    }

    /// First Global or Weak definition in module load order wins.
    fn resolve_symbol(&self, name: &str) -> Result<u64> {
        for module in &self.modules {
            for sym in &module.obj.symbols {
                if sym.name != name
                    || !matches!(
                        sym.kind,
                        crate::fle::SymbolKind::Global | crate::fle::SymbolKind::Weak
                    )
                {
                    continue;
                }
                if let Some(&base) = module.section_addrs.get(&sym.section) {
                    return Ok(base + sym.offset);
                }
            }
        }
        bail!(LinkError::SymbolNotFound(name.to_owned()));
    }

    /// Applies every module's relocations once all modules are mapped.
    /// Dynamic relocation offsets are virtual addresses; section-scoped
    /// offsets are relative to their section's runtime base.
    #[tracing::instrument(skip_all, name = "Relocate")]
    fn relocate_all(&self) -> Result {
        for module in &self.modules {
            for reloc in &module.obj.dyn_relocs {
                let site = module.load_base + reloc.offset;
                let target = self.resolve_symbol(&reloc.symbol)?;
                let value = x86_64::relocation_value(
                    reloc.kind,
                    target,
                    reloc.addend,
                    site,
                    &reloc.symbol,
                )?;
                self.patch(site, value)
                    .with_context(|| format!("applying dynamic relocation for {}", reloc.symbol))?;
            }
            for section in module.obj.sections.values() {
                let Some(&base) = module.section_addrs.get(&section.name) else {
                    continue;
                };
                for reloc in &section.relocs {
                    let site = base + reloc.offset;
                    let target = self.resolve_symbol(&reloc.symbol)?;
                    let value = x86_64::relocation_value(
                        reloc.kind,
                        target,
                        reloc.addend,
                        site,
                        &reloc.symbol,
                    )?;
                    self.patch(site, value)
                        .with_context(|| format!("relocating {}", reloc.symbol))?;
                }
            }
        }
        Ok(())
    }

    /// The single raw-memory write primitive. The target range must lie
    /// within a segment this session mapped.
    fn patch(&self, addr: u64, value: PatchValue) -> Result {
        let (bytes, len) = value.to_bytes();
        let end = addr + len as u64;
        if !self
            .mapped
            .iter()
            .any(|range| range.start <= addr && end <= range.end)
        {
            bail!(LinkError::BadRelocation(format!(
                "patch site {addr:#x} is outside every mapped segment"
            )));
        }
        // SAFETY: the range check above confirms [addr, addr + len) lies in
        // a segment we mapped read-write; protections are applied only after
        // the relocation pass.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, len);
        }
        Ok(())
    }

    /// Applies each segment's final protection flags.
    fn protect_all(&self) -> Result {
        for module in &self.modules {
            for phdr in &module.obj.phdrs {
                if phdr.size == 0 {
                    continue;
                }
                let mut prot = 0;
                if phdr.flags.contains(Phf::R) {
                    prot |= libc::PROT_READ;
                }
                if phdr.flags.contains(Phf::W) {
                    prot |= libc::PROT_WRITE;
                }
                if phdr.flags.contains(Phf::X) {
                    prot |= libc::PROT_EXEC;
                }
                let addr = module.load_base + phdr.vaddr;
                // SAFETY: [addr, addr + size) was mapped by `materialize`.
                let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, phdr.size as usize, prot) };
                if rc != 0 {
                    bail!(LinkError::MapFailed(format!(
                        "mprotect segment {} at {addr:#x}: {}",
                        phdr.name,
                        std::io::Error::last_os_error()
                    )));
                }
            }
        }
        Ok(())
    }
}
