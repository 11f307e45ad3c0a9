//! Correlator: pairs sections and symbols across the base and patched
//! objects, canonicalizes section-symbol relocations, and untangles the
//! compiler's renaming games (`.isra.`/`.constprop.`/`.part.` suffixes,
//! re-numbered static locals).

use log::{debug, warn};

use crate::elf::reloc::{R_X86_64_32S, R_X86_64_64, R_X86_64_PC32};
use crate::elf::section_header::SHT_GROUP;
use crate::error::{Error, Result};
use crate::insn;
use crate::model::{Object, SecId, Status, SymId, is_constant_label};

/// Name prefixes of compiler-generated local state that must never be
/// correlated across the two inputs.
const SPECIAL_STATIC_PREFIXES: &[&str] = &["__key.", "__warned.", "descriptor.", "__func__.", "_rs."];

/// Sections whose bundled objects are special statics wholesale.
const SPECIAL_STATIC_SECTIONS: &[&str] = &["__verbose"];

/// Function-name markers introduced by interprocedural optimizations.
const MANGLE_MARKERS: &[&str] = &[".isra.", ".constprop.", ".part."];

/// A compiler-generated local whose identity is per-build: tracing keys,
/// warn-once flags, `__func__` literals, ratelimit state.
pub fn is_special_static(obj: &Object, sym: Option<SymId>) -> bool {
    let Some(mut id) = sym else {
        return false;
    };
    if let Some(sec) = obj.symbols[id].section {
        if SPECIAL_STATIC_SECTIONS.contains(&obj.sections[sec].name.as_str()) {
            return true;
        }
    }
    if obj.symbols[id].is_section_sym() {
        let Some(bundled) = obj.symbols[id]
            .section
            .and_then(|sec| obj.sections[sec].bundled)
        else {
            return false;
        };
        id = bundled;
    }
    let sym = &obj.symbols[id];
    sym.is_object()
        && sym.is_local()
        && SPECIAL_STATIC_PREFIXES
            .iter()
            .any(|prefix| sym.name.starts_with(prefix))
}

/// Name equality modulo `.<digits>` runs: the runs must be present on
/// both sides but may hold different numbers.
pub fn mangled_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut i = 0;
    let mut j = 0;
    loop {
        match (a.get(i), b.get(j)) {
            (None, None) => return true,
            (Some(&x), Some(&y)) if x == y => {
                let a_run = x == b'.' && a.get(i + 1).is_some_and(u8::is_ascii_digit);
                let b_run = y == b'.' && b.get(j + 1).is_some_and(u8::is_ascii_digit);
                if a_run || b_run {
                    if !(a_run && b_run) {
                        return false;
                    }
                    i += 1;
                    j += 1;
                    while a.get(i).is_some_and(u8::is_ascii_digit) {
                        i += 1;
                    }
                    while b.get(j).is_some_and(u8::is_ascii_digit) {
                        j += 1;
                    }
                } else {
                    i += 1;
                    j += 1;
                }
            }
            _ => return false,
        }
    }
}

/// Preflight: the two inputs must have been produced by the same build
/// environment, and neither may carry program headers.
pub fn check_compat(base: &Object, patched: &Object) -> Result<()> {
    let h1 = &base.header;
    let h2 = &patched.header;
    if h1.e_ident != h2.e_ident
        || h1.e_type != h2.e_type
        || h1.e_machine != h2.e_machine
        || h1.e_version != h2.e_version
        || h1.e_entry != h2.e_entry
        || h1.e_phoff != h2.e_phoff
        || h1.e_flags != h2.e_flags
        || h1.e_ehsize != h2.e_ehsize
        || h1.e_phentsize != h2.e_phentsize
        || h1.e_shentsize != h2.e_shentsize
    {
        return Err(Error::Unsupported(
            "object file headers are incompatible".into(),
        ));
    }
    if base.has_program_headers() || patched.has_program_headers() {
        return Err(Error::Unsupported(
            "program headers are not supported".into(),
        ));
    }
    Ok(())
}

/// Rewrite non-debug relocations that target plain section symbols so
/// they target the symbol the effective offset falls into. Name-based
/// comparison is meaningless against anonymous section+offset targets.
pub fn canonicalize_section_symbols(obj: &mut Object) -> Result<()> {
    for rsec in 0..obj.sections.len() {
        if !obj.sections[rsec].is_rela() || obj.sections[rsec].is_debug() {
            continue;
        }
        let Some(applies_to) = obj.sections[rsec].base else {
            continue;
        };
        for ri in 0..obj.sections[rsec].relas.len() {
            let (target, rtype, offset, addend, has_string) = {
                let rela = &obj.sections[rsec].relas[ri];
                (rela.sym, rela.rtype, rela.offset, rela.addend, rela.string.is_some())
            };
            if has_string || !obj.symbols[target].is_section_sym() {
                continue;
            }
            let Some(target_sec) = obj.symbols[target].section else {
                continue;
            };
            if let Some(bundled) = obj.sections[target_sec].bundled {
                obj.sections[rsec].relas[ri].sym = bundled;
                continue;
            }
            let adjust = match rtype {
                R_X86_64_PC32 => {
                    let end =
                        insn::next_insn_end(obj.sections[applies_to].data_bytes(), offset)?;
                    end as i64 - offset as i64
                }
                R_X86_64_64 | R_X86_64_32S => 0,
                _ => continue,
            };
            let target_off = addend + adjust;
            let found = obj.symbols.iter().position(|sym| {
                !sym.is_section_sym()
                    && sym.section == Some(target_sec)
                    && target_off >= sym.sym.st_value as i64
                    && target_off < (sym.sym.st_value + sym.sym.st_size) as i64
            });
            if let Some(found) = found {
                debug!(
                    "retargeting relocation in {} at {:#x} to {}",
                    obj.sections[rsec].name, offset, obj.symbols[found].name
                );
                let st_value = obj.symbols[found].sym.st_value as i64;
                let rela = &mut obj.sections[rsec].relas[ri];
                rela.sym = found;
                rela.addend = addend - st_value;
            }
        }
    }
    Ok(())
}

/// Strip interprocedural-optimization suffix drift: a patched
/// `foo.isra.2` whose unique base counterpart is `foo.isra.1` takes the
/// base name, so later passes compare like against like.
pub fn rename_mangled_functions(base: &Object, patched: &mut Object) {
    for pid in 0..patched.symbols.len() {
        if !patched.symbols[pid].is_func() {
            continue;
        }
        let pname = patched.symbols[pid].name.clone();
        if !MANGLE_MARKERS.iter().any(|marker| pname.contains(marker)) {
            continue;
        }
        let mut candidates = base
            .symbols
            .iter()
            .filter(|sym| sym.is_func() && mangled_eq(&sym.name, &pname));
        let Some(first) = candidates.next() else {
            continue;
        };
        if candidates.next().is_some() {
            debug!("multiple base candidates for {pname}, not renaming");
            continue;
        }
        let new_name = first.name.clone();
        if new_name == pname {
            continue;
        }
        debug!("renaming {pname} to {new_name}");
        let bundled = patched.symbols[pid]
            .section
            .is_some_and(|sec| patched.sections[sec].bundled == Some(pid));
        if bundled {
            rename_section_family(patched, &pname, &new_name);
        }
        patched.symbols[pid].name = new_name;
    }
}

fn rename_section_family(obj: &mut Object, old: &str, new: &str) {
    for kind in ["text", "rodata"] {
        for (old_sec, new_sec) in [
            (format!(".{kind}.{old}"), format!(".{kind}.{new}")),
            (format!(".rela.{kind}.{old}"), format!(".rela.{kind}.{new}")),
        ] {
            if let Some(id) = obj.section_by_name(&old_sec) {
                obj.sections[id].name = new_sec.clone();
                // the section symbol is named after the section
                if let Some(secsym) = obj.sections[id].secsym {
                    obj.symbols[secsym].name = new_sec;
                }
            }
        }
    }
}

/// Pair same-named sections. Sections anchored on special statics stay
/// unpaired, and group sections only pair when byte-identical.
pub fn correlate_sections(base: &mut Object, patched: &mut Object) {
    for bix in 0..base.sections.len() {
        if base.sections[bix].twin.is_some() {
            continue;
        }
        let anchor = if base.sections[bix].is_rela() {
            base.sections[bix]
                .base
                .and_then(|b| base.sections[b].secsym)
        } else {
            base.sections[bix].secsym
        };
        if is_special_static(base, anchor) {
            continue;
        }
        for pix in 0..patched.sections.len() {
            if patched.sections[pix].twin.is_some()
                || base.sections[bix].name != patched.sections[pix].name
            {
                continue;
            }
            if base.sections[bix].shdr.sh_type == SHT_GROUP
                && base.sections[bix].data != patched.sections[pix].data
            {
                continue;
            }
            base.sections[bix].twin = Some(pix);
            patched.sections[pix].twin = Some(bix);
            break;
        }
    }
}

/// Pair same-named, same-typed symbols, excluding special statics,
/// constant labels, and pairs whose owning sections disagree on group
/// membership.
pub fn correlate_symbols(base: &mut Object, patched: &mut Object) {
    for bix in 0..base.symbols.len() {
        if base.symbols[bix].twin.is_some() {
            continue;
        }
        let bname = base.symbols[bix].name.clone();
        if is_constant_label(&bname) || is_special_static(base, Some(bix)) {
            continue;
        }
        for pix in 0..patched.symbols.len() {
            if patched.symbols[pix].twin.is_some()
                || patched.symbols[pix].name != bname
                || patched.symbols[pix].typ() != base.symbols[bix].typ()
            {
                continue;
            }
            let base_grouped = base.symbols[bix]
                .section
                .is_some_and(|sec| base.sections[sec].grouped);
            let patched_grouped = patched.symbols[pix]
                .section
                .is_some_and(|sec| patched.sections[sec].grouped);
            if base_grouped != patched_grouped {
                continue;
            }
            base.symbols[bix].twin = Some(pix);
            patched.symbols[pix].twin = Some(bix);
            break;
        }
    }
}

/// The unique untwinned relocation target in `rela_sec` whose name is
/// mangled-equal to `name`; ambiguity is fatal.
fn unique_mangled_target(obj: &Object, rela_sec: SecId, name: &str) -> Result<Option<SymId>> {
    let mut found: Option<SymId> = None;
    for rela in &obj.sections[rela_sec].relas {
        let target = rela.sym;
        if obj.symbols[target].twin.is_some() || !mangled_eq(&obj.symbols[target].name, name) {
            continue;
        }
        if let Some(prev) = found {
            if prev != target {
                return Err(Error::Malformed(format!(
                    "ambiguous candidates {} and {} for static local {} in {}",
                    obj.symbols[prev].name,
                    obj.symbols[target].name,
                    name,
                    obj.sections[rela_sec].name
                )));
            }
        }
        found = Some(target);
    }
    Ok(found)
}

/// Correlate compiler-renamed static locals (`counter.9` vs `counter.7`)
/// through the relocation section of the function that uses them.
pub fn correlate_static_locals(base: &mut Object, patched: &mut Object) -> Result<()> {
    for pid in 0..patched.symbols.len() {
        {
            let sym = &patched.symbols[pid];
            if !sym.is_object() || !sym.is_local() || sym.twin.is_some() {
                continue;
            }
            if !sym.name.contains('.') {
                continue;
            }
        }
        if is_special_static(patched, Some(pid)) {
            continue;
        }
        let pname = patched.symbols[pid].name.clone();

        // The search stops at the first relocation section referencing
        // the symbol; the ambiguity check below only covers that one
        // section.
        let mut referencing = None;
        'sections: for six in 0..patched.sections.len() {
            let sec = &patched.sections[six];
            if !sec.is_rela() || sec.is_debug() {
                continue;
            }
            for rela in &sec.relas {
                if rela.sym == pid {
                    referencing = Some(six);
                    break 'sections;
                }
            }
        }
        let Some(rsix) = referencing else {
            warn!("static local {pname} is unreferenced, treating as new");
            continue;
        };

        let Some(pcand) = unique_mangled_target(patched, rsix, &pname)? else {
            continue;
        };
        let Some(brsix) = patched.sections[rsix].twin else {
            warn!("no base counterpart for static local {pname}, treating as new");
            continue;
        };
        let Some(bcand) = unique_mangled_target(base, brsix, &pname)? else {
            warn!("no base counterpart for static local {pname}, treating as new");
            continue;
        };

        let patched_bundled = patched.symbols[pcand]
            .section
            .is_some_and(|sec| patched.sections[sec].bundled == Some(pcand));
        let base_bundled = base.symbols[bcand]
            .section
            .is_some_and(|sec| base.sections[sec].bundled == Some(bcand));
        if patched_bundled != base_bundled {
            return Err(Error::Malformed(format!(
                "bundle mismatch for static local {pname}"
            )));
        }

        let base_name = base.symbols[bcand].name.clone();
        if patched.symbols[pcand].name != base_name {
            debug!(
                "renaming static local {} to {base_name}",
                patched.symbols[pcand].name
            );
            patched.symbols[pcand].name = base_name;
        }
        patched.symbols[pcand].twin = Some(bcand);
        base.symbols[bcand].twin = Some(pcand);
        patched.symbols[pcand].status = Status::Same;
        base.symbols[bcand].status = Status::Same;
        if patched_bundled {
            // both are bundled, so both sections exist
            if let (Some(psec), Some(bsec)) =
                (patched.symbols[pcand].section, base.symbols[bcand].section)
            {
                patched.sections[psec].twin = Some(bsec);
                base.sections[bsec].twin = Some(psec);
            }
        }
    }
    Ok(())
}
