//! Comparator: classifies correlated sections and symbols as SAME or
//! CHANGED, and applies the authored `.xsplice.ignore.*` overrides.

use log::{debug, info, warn};

use crate::correlate::{is_special_static, mangled_eq};
use crate::elf::section_header::{SHN_ABS, SHN_UNDEF};
use crate::elf::sym::STT_FUNC;
use crate::error::{Error, Result};
use crate::model::{Object, Reloc, SecId, Status, is_constant_label};
use crate::read::read_cstr;

/// Process `.xsplice.ignore.sections` before comparison: flag the named
/// sections so the comparator can tolerate symbols crossing into them,
/// and carry the authoring string section into the output since the
/// name literal perturbs it anyway.
pub fn mark_ignored_sections(patched: &mut Object) -> Result<()> {
    let Some(six) = patched.section_by_name(".xsplice.ignore.sections") else {
        return Ok(());
    };
    let Some(rsix) = patched.sections[six].rela else {
        return Ok(());
    };
    for ri in 0..patched.sections[rsix].relas.len() {
        let (target, addend) = {
            let rela = &patched.sections[rsix].relas[ri];
            (rela.sym, rela.addend)
        };
        let strsec = patched.symbols[target].section.ok_or_else(|| {
            Error::Malformed(".xsplice.ignore.sections names a sectionless symbol".into())
        })?;
        patched.sections[strsec].status = Status::Changed;
        patched.sections[strsec].included = true;
        if let Some(secsym) = patched.sections[strsec].secsym {
            patched.symbols[secsym].included = true;
        }
        if addend < 0 {
            return Err(Error::Malformed(
                "negative offset in .xsplice.ignore.sections".into(),
            ));
        }
        let name = read_cstr(patched.sections[strsec].data_bytes(), addend as usize)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "bad section name at {:#x} in {}",
                    addend, patched.sections[strsec].name
                ))
            })?
            .to_string();
        info!("ignoring section: {name}");
        let mut ignored = patched
            .section_by_name(&name)
            .ok_or_else(|| Error::Malformed(format!("ignored section {name} not found")))?;
        if patched.sections[ignored].is_rela() {
            ignored = patched.sections[ignored].base.ok_or_else(|| {
                Error::Malformed(format!("relocation section {name} lacks a base"))
            })?;
        }
        patched.sections[ignored].ignored = true;
    }
    Ok(())
}

fn relas_equal(pobj: &Object, p: &Reloc, bobj: &Object, b: &Reloc) -> bool {
    if p.rtype != b.rtype || p.offset != b.offset {
        return false;
    }
    if let Some(text) = &p.string {
        return b.string.as_deref() == Some(text.as_str());
    }
    if p.addend != b.addend {
        return false;
    }
    let pname = &pobj.symbols[p.sym].name;
    let bname = &bobj.symbols[b.sym].name;
    if is_constant_label(pname) && is_constant_label(bname) {
        return true;
    }
    if is_special_static(pobj, Some(p.sym)) || is_special_static(bobj, Some(b.sym)) {
        return mangled_eq(pname, bname);
    }
    pname == bname
}

fn rela_lists_equal(base: &Object, bix: SecId, patched: &Object, pix: SecId) -> bool {
    let brelas = &base.sections[bix].relas;
    let prelas = &patched.sections[pix].relas;
    if brelas.len() != prelas.len() {
        return false;
    }
    prelas
        .iter()
        .zip(brelas)
        .all(|(p, b)| relas_equal(patched, p, base, b))
}

fn compare_correlated_sections(base: &mut Object, patched: &mut Object) -> Result<()> {
    for pix in 0..patched.sections.len() {
        let Some(bix) = patched.sections[pix].twin else {
            continue;
        };
        {
            let p = &patched.sections[pix].shdr;
            let b = &base.sections[bix].shdr;
            if p.sh_type != b.sh_type
                || p.sh_flags != b.sh_flags
                || p.sh_addr != b.sh_addr
                || p.sh_addralign != b.sh_addralign
                || p.sh_entsize != b.sh_entsize
            {
                return Err(Error::Unsupported(format!(
                    "section header attributes changed: {}",
                    patched.sections[pix].name
                )));
            }
        }
        let status = if patched.sections[pix].is_rela() {
            if rela_lists_equal(base, bix, patched, pix) {
                Status::Same
            } else {
                Status::Changed
            }
        } else {
            let p = &patched.sections[pix];
            let b = &base.sections[bix];
            if p.shdr.sh_size != b.shdr.sh_size || (!p.is_nobits() && p.data != b.data) {
                Status::Changed
            } else {
                Status::Same
            }
        };
        if status == Status::Changed {
            debug!("section {} has changed", patched.sections[pix].name);
        }
        patched.sections[pix].status = status;
        base.sections[bix].status = status;

        // push the verdict onto the bundled function/object symbol
        let bundled = if patched.sections[pix].is_rela() {
            patched.sections[pix]
                .base
                .and_then(|b| patched.sections[b].bundled)
        } else {
            patched.sections[pix].bundled
        };
        if let Some(sym) = bundled {
            if patched.symbols[sym].status != Status::Changed {
                patched.symbols[sym].status = status;
            }
        }
    }
    Ok(())
}

fn compare_correlated_symbols(base: &Object, patched: &mut Object) -> Result<()> {
    for pix in 0..patched.symbols.len() {
        let Some(bix) = patched.symbols[pix].twin else {
            patched.symbols[pix].status = Status::New;
            continue;
        };
        let name = patched.symbols[pix].name.clone();
        {
            let p = &patched.symbols[pix].sym;
            let b = &base.symbols[bix].sym;
            if p.st_info != b.st_info || p.st_other != b.st_other {
                return Err(Error::Unsupported(format!("symbol info mismatch: {name}")));
            }
        }
        match (patched.symbols[pix].section, base.symbols[bix].section) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Unsupported(format!(
                    "symbol changed sections: {name}"
                )));
            }
            (Some(psec), Some(bsec)) if patched.sections[psec].twin != Some(bsec) => {
                // crossing into an ignored section is a change the
                // directive vouches for; anywhere else it is fatal
                if patched.sections[psec].ignored {
                    patched.symbols[pix].status = Status::Changed;
                } else {
                    return Err(Error::Unsupported(format!(
                        "symbol changed sections: {name}"
                    )));
                }
            }
            _ => {}
        }
        if patched.symbols[pix].is_object()
            && patched.symbols[pix].sym.st_size != base.symbols[bix].sym.st_size
        {
            return Err(Error::Unsupported(format!("object size mismatch: {name}")));
        }
        let shndx = patched.symbols[pix].sym.st_shndx;
        if shndx == SHN_UNDEF || shndx == SHN_ABS {
            patched.symbols[pix].status = Status::Same;
            continue;
        }
        // status follows the owning section
        if patched.symbols[pix].status != Status::Changed {
            patched.symbols[pix].status = patched.symbols[pix]
                .section
                .map(|sec| patched.sections[sec].status)
                .unwrap_or(Status::Same);
        }
    }
    Ok(())
}

/// Classify every correlated element; uncorrelated ones stay NEW.
pub fn compare_correlated_elements(base: &mut Object, patched: &mut Object) -> Result<()> {
    compare_correlated_sections(base, patched)?;
    compare_correlated_symbols(base, patched)?;
    Ok(())
}

/// Force sections named by `.xsplice.ignore.sections` (and everything
/// they own) back to SAME after comparison.
pub fn mark_ignored_sections_same(patched: &mut Object) {
    for six in 0..patched.sections.len() {
        if !patched.sections[six].ignored {
            continue;
        }
        patched.sections[six].status = Status::Same;
        if !patched.sections[six].is_rela() {
            if let Some(secsym) = patched.sections[six].secsym {
                patched.symbols[secsym].status = Status::Same;
            }
            if let Some(rela) = patched.sections[six].rela {
                patched.sections[rela].status = Status::Same;
            }
        }
        for sym in &mut patched.symbols {
            if sym.section == Some(six) {
                sym.status = Status::Same;
            }
        }
    }
}

/// Force functions named by `.xsplice.ignore.functions` back to SAME,
/// warning when the directive was unnecessary.
pub fn mark_ignored_functions_same(patched: &mut Object) -> Result<()> {
    let Some(six) = patched.section_by_name(".xsplice.ignore.functions") else {
        return Ok(());
    };
    let Some(rsix) = patched.sections[six].rela else {
        return Ok(());
    };
    for ri in 0..patched.sections[rsix].relas.len() {
        let target = patched.sections[rsix].relas[ri].sym;
        let name = patched.symbols[target].name.clone();
        let sec = patched.symbols[target].section.ok_or_else(|| {
            Error::Malformed(format!("ignored function {name} has no section"))
        })?;
        if patched.symbols[target].typ() != STT_FUNC {
            return Err(Error::Malformed(format!(
                "ignored symbol {name} is not a function"
            )));
        }
        info!("ignoring function: {name}");
        if patched.sections[sec].status != Status::Changed {
            warn!("no change detected in ignored function {name}");
        }
        patched.symbols[target].status = Status::Same;
        patched.sections[sec].status = Status::Same;
        if let Some(secsym) = patched.sections[sec].secsym {
            patched.symbols[secsym].status = Status::Same;
        }
        if let Some(rela) = patched.sections[sec].rela {
            patched.sections[rela].status = Status::Same;
        }
    }
    Ok(())
}

/// Constant labels float with the string pool layout; their diffs are
/// never meaningful.
pub fn mark_constant_labels_same(patched: &mut Object) {
    for sym in &mut patched.symbols {
        if is_constant_label(&sym.name) {
            sym.status = Status::Same;
        }
    }
}
