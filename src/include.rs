//! Inclusion engine: transitive closure from changed functions through
//! relocations, plus the standard, debug and hook element rules and the
//! final patchability verification.

use log::{debug, error, info};

use crate::elf::section_header::SHT_GROUP;
use crate::elf::sym::{STT_FILE, STT_FUNC};
use crate::error::{Error, Result};
use crate::model::{Object, Status, SymId};

/// Table sections every patch object carries, plus the mergeable string
/// pools whose literals relocations point into.
pub fn include_standard_elements(obj: &mut Object) {
    for six in 0..obj.sections.len() {
        let name = &obj.sections[six].name;
        if name == ".shstrtab"
            || name == ".strtab"
            || name == ".symtab"
            || name.starts_with(".rodata.str1.")
        {
            obj.sections[six].included = true;
            if let Some(secsym) = obj.sections[six].secsym {
                obj.symbols[secsym].included = true;
            }
        }
    }
    if let Some(null) = obj.symbols.first_mut() {
        null.included = true;
    }
    for sym in &mut obj.symbols {
        if sym.typ() == STT_FILE {
            sym.included = true;
        }
    }
}

/// Include `start` and everything reachable from it: a symbol drags in
/// its section (unless the symbol is an unchanged non-section symbol),
/// the section drags in its section symbol and relocations, and the
/// relocations drag in their targets.
pub fn include_symbol(obj: &mut Object, start: SymId) {
    let mut worklist = vec![start];
    while let Some(id) = worklist.pop() {
        if obj.symbols[id].included {
            continue;
        }
        obj.symbols[id].included = true;
        let Some(sec) = obj.symbols[id].section else {
            continue;
        };
        if obj.sections[sec].included {
            continue;
        }
        if !obj.symbols[id].is_section_sym() && obj.symbols[id].status == Status::Same {
            continue;
        }
        obj.sections[sec].included = true;
        if let Some(secsym) = obj.sections[sec].secsym {
            obj.symbols[secsym].included = true;
        }
        if let Some(rela) = obj.sections[sec].rela {
            obj.sections[rela].included = true;
            for ri in 0..obj.sections[rela].relas.len() {
                worklist.push(obj.sections[rela].relas[ri].sym);
            }
        }
    }
}

/// Seed the closure with every changed function. The returned count is
/// the patch's reason to exist; zero means there is nothing to build.
pub fn include_changed_functions(obj: &mut Object) -> usize {
    let changed: Vec<SymId> = obj
        .symbols
        .iter()
        .enumerate()
        .filter(|(_, sym)| sym.typ() == STT_FUNC && sym.status == Status::Changed)
        .map(|(id, _)| id)
        .collect();
    for &id in &changed {
        debug!("including changed function {}", obj.symbols[id].name);
        include_symbol(obj, id);
    }
    changed.len()
}

/// Globals that exist only in the patched object come along wholesale.
pub fn include_new_globals(obj: &mut Object) {
    for id in 0..obj.symbols.len() {
        let sym = &obj.symbols[id];
        if sym.is_global() && sym.twin.is_none() && sym.section.is_some() {
            debug!("including new global {}", sym.name);
            include_symbol(obj, id);
        }
    }
}

/// All `.debug_*` sections ride along; their relocation lists are
/// filtered down to targets whose sections made it into the patch.
pub fn include_debug_sections(obj: &mut Object) {
    for six in 0..obj.sections.len() {
        if !obj.sections[six].is_debug() {
            continue;
        }
        obj.sections[six].included = true;
        if !obj.sections[six].is_rela() {
            if let Some(secsym) = obj.sections[six].secsym {
                obj.symbols[secsym].included = true;
            }
        }
    }
    for six in 0..obj.sections.len() {
        if !obj.sections[six].is_debug() || !obj.sections[six].is_rela() {
            continue;
        }
        let relas = std::mem::take(&mut obj.sections[six].relas);
        let mut kept = Vec::with_capacity(relas.len());
        for rela in relas {
            let target_included = obj.symbols[rela.sym]
                .section
                .is_some_and(|sec| obj.sections[sec].included);
            if target_included {
                // the symbol itself must survive migration for the
                // relocation to keep a target
                obj.symbols[rela.sym].included = true;
                kept.push(rela);
            }
        }
        obj.sections[six].relas = kept;
    }
}

const HOOK_SECTIONS: &[&str] = &[".xsplice.hooks.load", ".xsplice.hooks.unload"];
const HOOK_INDIRECTION_OBJECTS: &[&str] = &["xsplice_load_data", "xsplice_unload_data"];

/// Carry the load/unload hook sections. Each hook relocation's routine is
/// included by closure, then the routine's symbol is detached and the
/// relocation is pointed at the routine section's section symbol, so the
/// hook fires without exporting the routine.
pub fn include_hook_elements(obj: &mut Object) -> Result<()> {
    for &hook in HOOK_SECTIONS {
        let Some(six) = obj.section_by_name(hook) else {
            continue;
        };
        obj.sections[six].included = true;
        if let Some(secsym) = obj.sections[six].secsym {
            obj.symbols[secsym].included = true;
        }
        let Some(rsix) = obj.sections[six].rela else {
            continue;
        };
        obj.sections[rsix].included = true;
        for ri in 0..obj.sections[rsix].relas.len() {
            let target = obj.sections[rsix].relas[ri].sym;
            info!("found hook: {}", obj.symbols[target].name);
            include_symbol(obj, target);
            obj.symbols[target].included = false;
            let Some(routine_sec) = obj.symbols[target].section else {
                return Err(Error::Malformed(format!(
                    "hook {} has no section",
                    obj.symbols[target].name
                )));
            };
            obj.sections[routine_sec].bundled = None;
            let secsym = obj.sections[routine_sec].secsym.ok_or_else(|| {
                Error::Malformed(format!(
                    "hook section {} has no section symbol",
                    obj.sections[routine_sec].name
                ))
            })?;
            obj.sections[rsix].relas[ri].sym = secsym;
        }
    }
    for sym in &mut obj.symbols {
        if HOOK_INDIRECTION_OBJECTS.contains(&sym.name.as_str()) {
            sym.included = false;
        }
    }
    Ok(())
}

/// The four fatal conditions of an unpatchable diff, reported together.
pub fn verify_patchability(obj: &Object) -> Result<()> {
    let mut errors = 0;
    for sec in &obj.sections {
        if sec.status == Status::Changed && !sec.included {
            error!("changed section {} not selected for inclusion", sec.name);
            errors += 1;
        }
        if sec.status != Status::Same && sec.grouped {
            error!("changed/new section {} is part of a section group", sec.name);
            errors += 1;
        }
        if sec.shdr.sh_type == SHT_GROUP && sec.status == Status::New {
            error!("new group section {} is not supported", sec.name);
            errors += 1;
        }
        if sec.included
            && sec.status != Status::New
            && (sec.name.starts_with(".data") || sec.name.starts_with(".bss"))
            && sec.name != ".data.unlikely"
        {
            error!("data section {} selected for inclusion", sec.name);
            errors += 1;
        }
    }
    if errors > 0 {
        return Err(Error::Unsupported(format!(
            "{errors} unsupported section change(s)"
        )));
    }
    Ok(())
}
