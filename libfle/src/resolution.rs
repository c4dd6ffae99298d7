//! Symbol resolution between input objects. This is also where archive
//! members get selected: a member joins the link iff it defines a non-local
//! symbol that is still unresolved across the active set, iterated to a
//! fixed point.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle::Object;
use crate::fle::ObjectKind;
use crate::fle::SymbolKind;
use crate::layout::Layout;
use anyhow::bail;
use std::collections::hash_map;
use std::collections::HashMap;
use std::collections::HashSet;

pub(crate) struct ClassifiedInputs<'a> {
    pub(crate) base: Vec<&'a Object>,
    pub(crate) archives: Vec<&'a Object>,
    pub(crate) shared: Vec<&'a Object>,
}

pub(crate) fn classify(objects: &[Object]) -> ClassifiedInputs<'_> {
    let mut inputs = ClassifiedInputs {
        base: Vec::new(),
        archives: Vec::new(),
        shared: Vec::new(),
    };
    for obj in objects {
        match obj.kind {
            ObjectKind::Archive => inputs.archives.push(obj),
            ObjectKind::Shared => inputs.shared.push(obj),
            _ => inputs.base.push(obj),
        }
    }
    inputs
}

/// Names defined by the active set: per-object locals plus one shared set of
/// non-local definitions. Indexed by position in the active vector.
pub(crate) struct DefinedNames<'a> {
    locals: Vec<HashSet<&'a str>>,
    nonlocal: HashSet<&'a str>,
}

impl<'a> DefinedNames<'a> {
    pub(crate) fn compute(active: &[&'a Object]) -> DefinedNames<'a> {
        let mut names = DefinedNames {
            locals: vec![HashSet::new(); active.len()],
            nonlocal: HashSet::new(),
        };
        for (index, obj) in active.iter().enumerate() {
            for sym in &obj.symbols {
                if sym.section.is_empty() {
                    continue;
                }
                if sym.kind == SymbolKind::Local {
                    names.locals[index].insert(sym.name.as_str());
                } else {
                    names.nonlocal.insert(sym.name.as_str());
                }
            }
        }
        names
    }

    /// Whether `name`, referenced from the object at `object_index`, resolves
    /// inside the active set. Locals shadow only within their own object.
    pub(crate) fn is_defined(&self, object_index: usize, name: &str) -> bool {
        self.locals[object_index].contains(name) || self.nonlocal.contains(name)
    }
}

/// Computes the active set: the base objects plus every archive member pulled
/// in by the unresolved-symbol closure. Members are selected once, in the
/// order of first inclusion.
pub(crate) fn select_active<'a>(inputs: &ClassifiedInputs<'a>) -> Vec<&'a Object> {
    let mut active: Vec<&Object> = inputs.base.clone();
    let mut included: HashSet<(usize, usize)> = HashSet::new();
    loop {
        let unresolved = unresolved_names(&active);
        if unresolved.is_empty() {
            break;
        }
        let mut changed = false;
        for (archive_index, archive) in inputs.archives.iter().enumerate() {
            for (member_index, member) in archive.members.iter().enumerate() {
                if included.contains(&(archive_index, member_index)) {
                    continue;
                }
                let useful = member.symbols.iter().any(|sym| {
                    !sym.section.is_empty()
                        && sym.kind != SymbolKind::Local
                        && unresolved.contains(sym.name.as_str())
                });
                if useful {
                    active.push(member);
                    included.insert((archive_index, member_index));
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    active
}

fn unresolved_names<'a>(active: &[&'a Object]) -> HashSet<&'a str> {
    let defined = DefinedNames::compute(active);
    let mut unresolved = HashSet::new();
    for (index, obj) in active.iter().enumerate() {
        for section in obj.sections.values() {
            for reloc in &section.relocs {
                if !defined.is_defined(index, &reloc.symbol) {
                    unresolved.insert(reloc.symbol.as_str());
                }
            }
        }
    }
    unresolved
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalDefinition {
    pub(crate) kind: SymbolKind,
    pub(crate) addr: u64,
}

/// The fully resolved symbol tables of a link: one local table per active
/// object and one shared table for globals and weaks.
#[derive(Debug)]
pub(crate) struct ResolvedSymbols {
    pub(crate) globals: HashMap<String, GlobalDefinition>,
    locals: Vec<HashMap<String, u64>>,
}

impl ResolvedSymbols {
    /// Locals take precedence within their defining object.
    pub(crate) fn lookup(&self, object_index: usize, name: &str) -> Option<u64> {
        if let Some(&addr) = self.locals[object_index].get(name) {
            return Some(addr);
        }
        self.globals.get(name).map(|def| def.addr)
    }

    pub(crate) fn is_internal(&self, object_index: usize, name: &str) -> bool {
        self.lookup(object_index, name).is_some()
    }
}

/// Builds the symbol tables once the layout has assigned section addresses.
/// Precedence on collision: Global beats Weak, two Globals are an error, and
/// a later Weak never displaces an earlier one.
pub(crate) fn resolve_symbols(active: &[&Object], layout: &Layout) -> Result<ResolvedSymbols> {
    let mut resolved = ResolvedSymbols {
        globals: HashMap::new(),
        locals: vec![HashMap::new(); active.len()],
    };
    for (index, obj) in active.iter().enumerate() {
        for sym in &obj.symbols {
            if sym.section.is_empty() {
                continue;
            }
            let Some(base) = layout.section_address(index, &sym.section) else {
                continue;
            };
            let addr = base + sym.offset;
            if sym.kind == SymbolKind::Local {
                resolved.locals[index].insert(sym.name.clone(), addr);
                continue;
            }
            match resolved.globals.entry(sym.name.clone()) {
                hash_map::Entry::Vacant(slot) => {
                    slot.insert(GlobalDefinition {
                        kind: sym.kind,
                        addr,
                    });
                }
                hash_map::Entry::Occupied(mut slot) => match (slot.get().kind, sym.kind) {
                    (SymbolKind::Global, SymbolKind::Global) => {
                        bail!(LinkError::MultipleDefinition(sym.name.clone()));
                    }
                    (SymbolKind::Weak, SymbolKind::Global) => {
                        slot.insert(GlobalDefinition {
                            kind: SymbolKind::Global,
                            addr,
                        });
                    }
                    _ => {}
                },
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fle::Reloc;
    use crate::fle::RelocKind;
    use crate::fle::Section;
    use crate::fle::SectionHeader;
    use crate::fle::Shf;
    use crate::fle::Symbol;
    use crate::fle::SHT_PROGBITS;

    fn text_object(name: &str, bytes: usize, symbols: &[(&str, SymbolKind, u64)]) -> Object {
        let mut obj = Object::new(name.to_owned(), ObjectKind::Obj);
        obj.shdrs.push(SectionHeader {
            name: ".text".to_owned(),
            sh_type: SHT_PROGBITS,
            flags: Shf::ALLOC | Shf::EXEC,
            addr: 0,
            offset: 0,
            size: bytes as u64,
        });
        obj.sections.insert(
            ".text".to_owned(),
            Section {
                name: ".text".to_owned(),
                data: vec![0x90; bytes],
                ..Section::default()
            },
        );
        for (sym_name, kind, offset) in symbols {
            obj.symbols.push(Symbol {
                kind: *kind,
                section: ".text".to_owned(),
                offset: *offset,
                size: 0,
                name: (*sym_name).to_owned(),
            });
        }
        obj
    }

    fn add_reloc(obj: &mut Object, target: &str) {
        obj.sections[".text"].relocs.push(Reloc {
            kind: RelocKind::Pc32,
            offset: 0,
            symbol: target.to_owned(),
            addend: -4,
        });
        obj.symbols.push(Symbol {
            kind: SymbolKind::Undefined,
            section: String::new(),
            offset: 0,
            size: 0,
            name: target.to_owned(),
        });
    }

    fn archive_of(members: Vec<Object>) -> Object {
        let mut ar = Object::new("lib.fa".to_owned(), ObjectKind::Archive);
        ar.members = members;
        ar
    }

    #[test]
    fn test_member_selected_only_when_needed() {
        let mut main = text_object("main", 8, &[("_start", SymbolKind::Global, 0)]);
        add_reloc(&mut main, "foo");
        let fm = text_object("fm", 4, &[("foo", SymbolKind::Global, 0)]);
        let bar = text_object("bar", 4, &[("bar", SymbolKind::Global, 0)]);
        let ar = archive_of(vec![fm, bar]);
        let objects = vec![main, ar];
        let inputs = classify(&objects);
        let active = select_active(&inputs);
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].name, "fm");
    }

    #[test]
    fn test_member_selection_is_transitive() {
        let mut main = text_object("main", 8, &[("_start", SymbolKind::Global, 0)]);
        add_reloc(&mut main, "foo");
        let mut fm = text_object("fm", 4, &[("foo", SymbolKind::Global, 0)]);
        add_reloc(&mut fm, "bar");
        let bar = text_object("bar", 4, &[("bar", SymbolKind::Global, 0)]);
        let ar = archive_of(vec![fm, bar]);
        let objects = vec![main, ar];
        let inputs = classify(&objects);
        let active = select_active(&inputs);
        assert_eq!(active.len(), 3);
    }

    #[test]
    fn test_local_definition_does_not_satisfy_selection() {
        let mut main = text_object("main", 8, &[]);
        add_reloc(&mut main, "foo");
        let hidden = text_object("hidden", 4, &[("foo", SymbolKind::Local, 0)]);
        let ar = archive_of(vec![hidden]);
        let objects = vec![main, ar];
        let inputs = classify(&objects);
        let active = select_active(&inputs);
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_global_overrides_weak() {
        let weak = text_object("w", 4, &[("dup", SymbolKind::Weak, 0)]);
        let strong = text_object("s", 4, &[("dup", SymbolKind::Global, 2)]);
        let active = [&weak, &strong];
        let mut layout = Layout::concatenate(&active);
        layout.assign_addresses(0, 0);
        let resolved = resolve_symbols(&active, &layout).unwrap();
        let def = resolved.globals["dup"];
        assert_eq!(def.kind, SymbolKind::Global);
        assert_eq!(def.addr, 0x400000 + 4 + 2);
    }

    #[test]
    fn test_weak_does_not_override_weak() {
        let first = text_object("a", 4, &[("dup", SymbolKind::Weak, 0)]);
        let second = text_object("b", 4, &[("dup", SymbolKind::Weak, 0)]);
        let active = [&first, &second];
        let mut layout = Layout::concatenate(&active);
        layout.assign_addresses(0, 0);
        let resolved = resolve_symbols(&active, &layout).unwrap();
        assert_eq!(resolved.globals["dup"].addr, 0x400000);
    }

    #[test]
    fn test_two_globals_fail() {
        let first = text_object("a", 4, &[("dup", SymbolKind::Global, 0)]);
        let second = text_object("b", 4, &[("dup", SymbolKind::Global, 0)]);
        let active = [&first, &second];
        let mut layout = Layout::concatenate(&active);
        layout.assign_addresses(0, 0);
        let err = resolve_symbols(&active, &layout).unwrap_err();
        assert!(err.to_string().contains("dup"), "{err}");
    }

    #[test]
    fn test_local_shadows_global_within_object() {
        let mut with_local = text_object("a", 4, &[("f", SymbolKind::Local, 2)]);
        add_reloc(&mut with_local, "g");
        let other = text_object("b", 4, &[("f", SymbolKind::Global, 0), ("g", SymbolKind::Global, 1)]);
        let active = [&with_local, &other];
        let mut layout = Layout::concatenate(&active);
        layout.assign_addresses(0, 0);
        let resolved = resolve_symbols(&active, &layout).unwrap();
        assert_eq!(resolved.lookup(0, "f"), Some(0x400002));
        assert_eq!(resolved.lookup(1, "f"), Some(0x400004));
        assert_eq!(resolved.lookup(0, "g"), Some(0x400005));
    }
}
