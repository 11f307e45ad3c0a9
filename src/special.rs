//! Special-section rewriter: regenerates the architecture metadata
//! tables (`.bug_frames.*`, `.fixup`, `.ex_table`, `.altinstructions`)
//! at group granularity, keeping only the groups that reference code
//! carried by the patch.

use log::debug;

use crate::elf::sym::STT_FUNC;
use crate::error::{Error, Result};
use crate::include::include_symbol;
use crate::model::{Object, SecId, Status, SymId};

#[derive(Clone, Copy)]
enum Group {
    Fixed(u64),
    /// `.fixup` records are delimited by the `.fixup` references in
    /// `.rela.ex_table`.
    Fixup,
}

struct SpecialSection {
    name: &'static str,
    group: Group,
}

/// `.fixup` must be regenerated before `.ex_table`: its group boundaries
/// are read out of `.rela.ex_table`, which the `.ex_table` pass rewrites.
const SPECIAL_SECTIONS: &[SpecialSection] = &[
    SpecialSection {
        name: ".bug_frames.0",
        group: Group::Fixed(8),
    },
    SpecialSection {
        name: ".bug_frames.1",
        group: Group::Fixed(8),
    },
    SpecialSection {
        name: ".bug_frames.2",
        group: Group::Fixed(8),
    },
    SpecialSection {
        name: ".bug_frames.3",
        group: Group::Fixed(16),
    },
    SpecialSection {
        name: ".fixup",
        group: Group::Fixup,
    },
    SpecialSection {
        name: ".ex_table",
        group: Group::Fixed(8),
    },
    SpecialSection {
        name: ".altinstructions",
        group: Group::Fixed(12),
    },
];

fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// The size of the `.fixup` group starting at `offset`: up to the next
/// `.fixup` reference in `.rela.ex_table`, or to the padded section end.
fn fixup_group_size(obj: &Object, offset: u64) -> Result<u64> {
    let rela_ex = obj
        .section_by_name(".rela.ex_table")
        .ok_or_else(|| Error::Malformed("missing .rela.ex_table section".into()))?;
    let mut next: Option<u64> = None;
    for rela in &obj.sections[rela_ex].relas {
        if obj.symbols[rela.sym].name != ".fixup" || rela.addend < 0 {
            continue;
        }
        let boundary = rela.addend as u64;
        if boundary > offset && next.is_none_or(|n| boundary < n) {
            next = Some(boundary);
        }
    }
    let end = match next {
        Some(boundary) => boundary,
        None => {
            let fixup = obj
                .section_by_name(".fixup")
                .ok_or_else(|| Error::Malformed("missing .fixup section".into()))?;
            let shdr = &obj.sections[fixup].shdr;
            align_up(shdr.sh_size, shdr.sh_addralign)
        }
    };
    if end <= offset {
        return Err(Error::Malformed(format!(
            "bad .fixup group boundary {end:#x} at offset {offset:#x}"
        )));
    }
    Ok(end - offset)
}

fn regenerate_group_section(
    obj: &mut Object,
    group: Group,
    base_ix: SecId,
    rela_ix: SecId,
) -> Result<()> {
    let size = obj.sections[base_ix].shdr.sh_size;
    let align = obj.sections[base_ix].shdr.sh_addralign;
    let src = obj.sections[base_ix].data.clone().unwrap_or_default();
    let mut dest: Vec<u8> = Vec::with_capacity(src.len());
    let mut new_relas = Vec::new();
    let mut remaining = std::mem::take(&mut obj.sections[rela_ix].relas);

    let mut src_off: u64 = 0;
    let mut dest_off: u64 = 0;
    while src_off < size {
        let group_size = match group {
            Group::Fixed(n) => n,
            Group::Fixup => fixup_group_size(obj, src_off)?,
        };
        let keep = remaining.iter().any(|rela| {
            rela.offset >= src_off
                && rela.offset < src_off + group_size
                && obj.symbols[rela.sym].typ() == STT_FUNC
                && obj.symbols[rela.sym]
                    .section
                    .is_some_and(|sec| obj.sections[sec].included)
        });
        if keep {
            let mut rest = Vec::with_capacity(remaining.len());
            for mut rela in remaining {
                if rela.offset >= src_off && rela.offset < src_off + group_size {
                    rela.offset = rela.offset - src_off + dest_off;
                    obj.symbols[rela.sym].included = true;
                    new_relas.push(rela);
                } else {
                    rest.push(rela);
                }
            }
            remaining = rest;
            let start = src_off as usize;
            let avail = src.len().saturating_sub(start).min(group_size as usize);
            dest.extend_from_slice(&src[start..start + avail]);
            // a group may run into the section's alignment padding
            dest.resize(dest.len() + group_size as usize - avail, 0);
            dest_off += group_size;
        }
        src_off += group_size;
    }
    if src_off != align_up(size, align) {
        return Err(Error::Malformed(format!(
            "group size mismatch in section {}: walked {:#x} of {:#x}",
            obj.sections[base_ix].name,
            src_off,
            align_up(size, align)
        )));
    }

    if dest_off == 0 {
        debug!(
            "no groups of {} survive, dropping it",
            obj.sections[base_ix].name
        );
        obj.sections[rela_ix].relas = remaining;
        obj.sections[rela_ix].status = Status::Same;
        obj.sections[rela_ix].included = false;
        obj.sections[base_ix].status = Status::Same;
        obj.sections[base_ix].included = false;
        return Ok(());
    }

    debug!(
        "regenerated {}: {:#x} of {:#x} bytes kept",
        obj.sections[base_ix].name, dest_off, size
    );
    obj.sections[rela_ix].relas = new_relas;
    obj.sections[rela_ix].included = true;
    obj.sections[base_ix].included = true;
    if let Some(secsym) = obj.sections[base_ix].secsym {
        obj.symbols[secsym].included = true;
    }
    obj.sections[base_ix].shdr.sh_size = dest_off;
    obj.sections[base_ix].data = Some(dest);
    Ok(())
}

/// `.altinstr_replacement` carries the alternative instruction bytes the
/// kept `.altinstructions` groups select; it travels whole.
fn include_replacement_section(obj: &mut Object) {
    let Some(six) = obj.section_by_name(".altinstr_replacement") else {
        return;
    };
    debug!("including .altinstr_replacement in its entirety");
    obj.sections[six].included = true;
    if let Some(secsym) = obj.sections[six].secsym {
        obj.symbols[secsym].included = true;
    }
    for id in 0..obj.symbols.len() {
        if obj.symbols[id].section == Some(six) {
            obj.symbols[id].included = true;
        }
    }
    if let Some(rsix) = obj.sections[six].rela {
        obj.sections[rsix].included = true;
        let targets: Vec<SymId> = obj.sections[rsix].relas.iter().map(|r| r.sym).collect();
        for target in targets {
            include_symbol(obj, target);
        }
    }
}

/// Regenerate every recognized special section present in the object.
pub fn process_special_sections(obj: &mut Object) -> Result<()> {
    for special in SPECIAL_SECTIONS {
        let Some(base_ix) = obj.section_by_name(special.name) else {
            continue;
        };
        let Some(rela_ix) = obj.sections[base_ix].rela else {
            continue;
        };
        regenerate_group_section(obj, special.group, base_ix, rela_ix)?;
    }
    include_replacement_section(obj);
    Ok(())
}
