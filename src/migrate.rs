//! Migrator: extracts the included elements into a fresh output object,
//! reorders symbols into link-compliant buckets and assigns final
//! indices.

use log::debug;

use crate::elf::section_header::{SHN_ABS, SHN_UNDEF};
use crate::elf::sym::STT_FILE;
use crate::error::{Error, Result};
use crate::model::{Object, Symbol};

/// Move every included section and symbol into a new object, preserving
/// order. References to elements left behind are severed.
pub fn migrate_included_elements(patched: &mut Object) -> Result<Object> {
    let sections = std::mem::take(&mut patched.sections);
    let symbols = std::mem::take(&mut patched.symbols);
    let strings = std::mem::take(&mut patched.strings);

    let mut sec_map = vec![None; sections.len()];
    let mut next = 0;
    for (i, sec) in sections.iter().enumerate() {
        if sec.included {
            sec_map[i] = Some(next);
            next += 1;
        }
    }
    let mut sym_map = vec![None; symbols.len()];
    let mut next = 0;
    for (i, sym) in symbols.iter().enumerate() {
        if sym.included {
            sym_map[i] = Some(next);
            next += 1;
        }
    }

    let mut out = Object {
        header: patched.header,
        sections: Vec::new(),
        symbols: Vec::new(),
        strings,
    };
    for (i, mut sec) in sections.into_iter().enumerate() {
        if sec_map[i].is_none() {
            continue;
        }
        sec.twin = None;
        sec.base = sec.base.and_then(|b| sec_map[b]);
        sec.rela = sec.rela.and_then(|r| sec_map[r]);
        sec.secsym = sec.secsym.and_then(|s| sym_map[s]);
        sec.bundled = sec.bundled.and_then(|s| sym_map[s]);
        for rela in &mut sec.relas {
            rela.sym = sym_map[rela.sym].ok_or_else(|| {
                Error::Malformed(format!(
                    "relocation in {} targets a symbol outside the patch",
                    sec.name
                ))
            })?;
        }
        out.sections.push(sec);
    }
    for (i, mut sym) in symbols.into_iter().enumerate() {
        if sym_map[i].is_none() {
            continue;
        }
        sym.twin = None;
        sym.section = sym.section.and_then(|s| sec_map[s]);
        out.symbols.push(sym);
    }
    debug!(
        "migrated {} sections, {} symbols",
        out.sections.len(),
        out.symbols.len()
    );
    Ok(out)
}

fn bucket(sym: &Symbol) -> usize {
    let is_null =
        sym.name.is_empty() && sym.sym.st_info == 0 && sym.section.is_none() && sym.sym.st_shndx == 0;
    if is_null {
        0
    } else if sym.typ() == STT_FILE {
        1
    } else if sym.is_local() && sym.is_func() {
        2
    } else if sym.is_local() {
        3
    } else {
        4
    }
}

/// Reorder symbols into link conventions: the null symbol, `STT_FILE`
/// symbols, local functions, remaining locals, then globals. Relative
/// order within a bucket is preserved.
pub fn reorder_symbols(obj: &mut Object) {
    let old = std::mem::take(&mut obj.symbols);
    let total = old.len();
    let mut buckets: [Vec<(usize, Symbol)>; 5] = std::array::from_fn(|_| Vec::new());
    for (i, sym) in old.into_iter().enumerate() {
        buckets[bucket(&sym)].push((i, sym));
    }
    let mut map = vec![0usize; total];
    let mut ordered = Vec::with_capacity(total);
    for bucket in buckets {
        for (i, sym) in bucket {
            map[i] = ordered.len();
            ordered.push(sym);
        }
    }
    obj.symbols = ordered;
    for sec in &mut obj.sections {
        sec.secsym = sec.secsym.map(|s| map[s]);
        sec.bundled = sec.bundled.map(|s| map[s]);
        for rela in &mut sec.relas {
            rela.sym = map[rela.sym];
        }
    }
}

/// Assign final section and symbol indices and rewire the index-bearing
/// header fields (`st_shndx`, relocation `sh_link`/`sh_info`).
pub fn reindex(obj: &mut Object) -> Result<()> {
    for (i, sec) in obj.sections.iter_mut().enumerate() {
        sec.index = i + 1;
    }
    for (i, sym) in obj.symbols.iter_mut().enumerate() {
        sym.index = i;
    }
    for id in 0..obj.symbols.len() {
        obj.symbols[id].sym.st_shndx = match obj.symbols[id].section {
            Some(sec) => obj.sections[sec].index as u16,
            None if obj.symbols[id].sym.st_shndx == SHN_ABS => SHN_ABS,
            None => SHN_UNDEF,
        };
    }
    let symtab = obj
        .section_by_name(".symtab")
        .ok_or_else(|| Error::Malformed("output object lacks .symtab".into()))?;
    let symtab_index = obj.sections[symtab].index as u32;
    for id in 0..obj.sections.len() {
        if !obj.sections[id].is_rela() {
            continue;
        }
        let base = obj.sections[id].base.ok_or_else(|| {
            Error::Malformed(format!(
                "relocation section {} lacks a base",
                obj.sections[id].name
            ))
        })?;
        obj.sections[id].shdr.sh_link = symtab_index;
        obj.sections[id].shdr.sh_info = obj.sections[base].index as u32;
    }
    Ok(())
}
