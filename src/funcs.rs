//! Patch-table emitter: builds `.xsplice.funcs`, its relocations and the
//! `.xsplice.strings` pool, resolving old addresses against the running
//! image's symbol table.

use log::{debug, info};
use scroll::{LE, Pwrite};

use crate::elf::reloc::{R_X86_64_64, SIZEOF_RELA};
use crate::elf::section_header::{SHF_ALLOC, SHF_INFO_LINK, SHT_PROGBITS, SHT_RELA, SectionHeader};
use crate::elf::sym::{STT_FILE, STT_FUNC, STT_OBJECT};
use crate::error::{Error, Result};
use crate::lookup::Table;
use crate::model::{Object, Reloc, SecId, Section, Status, SymId};

/// Minimum length of a patchable function on x86-64: one `call rel32`.
pub const PATCH_INSN_SIZE: u64 = 5;

/// Serialized size of one patch-function record.
pub const SIZEOF_PATCH_FUNC: usize = 64;

// field offsets within a record: old_addr, new_addr, old_size, new_size,
// name pointer slot, 32 bytes of padding
const PF_OLD_ADDR: usize = 0;
const PF_NEW_ADDR: usize = 8;
const PF_OLD_SIZE: usize = 16;
const PF_NEW_SIZE: usize = 20;
const PF_NAME: usize = 24;

fn add_progbits(
    obj: &mut Object,
    name: &str,
    flags: u64,
    align: u64,
    entsize: u64,
    data: Vec<u8>,
) -> SecId {
    let shdr = SectionHeader {
        sh_type: SHT_PROGBITS,
        sh_flags: flags,
        sh_size: data.len() as u64,
        sh_addralign: align,
        sh_entsize: entsize,
        ..SectionHeader::default()
    };
    let id = obj.add_section(Section::new(name.to_string(), shdr, Some(data), 0));
    obj.sections[id].status = Status::New;
    obj.sections[id].included = true;
    let secsym = obj.add_section_symbol(id);
    obj.symbols[secsym].included = true;
    id
}

fn add_rela_section(obj: &mut Object, name: &str, base: SecId) -> SecId {
    let shdr = SectionHeader {
        sh_type: SHT_RELA,
        sh_flags: SHF_INFO_LINK,
        sh_addralign: 8,
        sh_entsize: SIZEOF_RELA as u64,
        ..SectionHeader::default()
    };
    let id = obj.add_section(Section::new(name.to_string(), shdr, Some(Vec::new()), 0));
    obj.sections[id].status = Status::New;
    obj.sections[id].included = true;
    obj.sections[id].base = Some(base);
    obj.sections[base].rela = Some(id);
    id
}

/// The source-file hint: the name of the first `STT_FILE` symbol.
fn file_hint(obj: &Object) -> Option<String> {
    obj.symbols
        .iter()
        .find(|sym| sym.typ() == STT_FILE && !sym.name.is_empty())
        .map(|sym| sym.name.clone())
}

/// Emit one `.xsplice.funcs` record per changed function and lay out the
/// string pool, then mangle all included local functions and objects
/// with the file hint so the runtime can resolve them unambiguously.
pub fn create_patch_table(obj: &mut Object, table: &Table, resolve: bool) -> Result<()> {
    let changed: Vec<SymId> = obj
        .symbols
        .iter()
        .enumerate()
        .filter(|(_, sym)| sym.typ() == STT_FUNC && sym.status == Status::Changed)
        .map(|(id, _)| id)
        .collect();
    let hint = file_hint(obj);

    let funcs_sec = add_progbits(
        obj,
        ".xsplice.funcs",
        SHF_ALLOC,
        8,
        SIZEOF_PATCH_FUNC as u64,
        vec![0u8; changed.len() * SIZEOF_PATCH_FUNC],
    );
    let rela_sec = add_rela_section(obj, ".rela.xsplice.funcs", funcs_sec);
    let strings_sec = add_progbits(obj, ".xsplice.strings", 0, 1, 0, Vec::new());
    let strings_secsym = obj.sections[strings_sec]
        .secsym
        .ok_or_else(|| Error::Malformed(".xsplice.strings has no section symbol".into()))?;

    let mut data = vec![0u8; changed.len() * SIZEOF_PATCH_FUNC];
    let mut relas = Vec::with_capacity(changed.len() * 2);
    for (i, &fid) in changed.iter().enumerate() {
        let name = obj.symbols[fid].name.clone();
        let local = obj.symbols[fid].is_local();
        let (old_addr, old_size) = if local {
            let hint = hint.as_deref().ok_or_else(|| {
                Error::Malformed(format!("no file symbol to scope local function {name}"))
            })?;
            table.lookup_local(&name, hint)
        } else {
            table.lookup_global(&name)
        }
        .ok_or_else(|| Error::Malformed(format!("lookup failed for function {name}")))?;
        if old_size < PATCH_INSN_SIZE {
            return Err(Error::Malformed(format!(
                "function {name} is too small to patch ({old_size} bytes)"
            )));
        }

        let pool_name = match (local, &hint) {
            (true, Some(hint)) => format!("{hint}#{name}"),
            _ => name.clone(),
        };
        let name_offset = obj.add_string(&pool_name);

        info!("patched function: {name}");
        let at = i * SIZEOF_PATCH_FUNC;
        data.pwrite_with::<u64>(if resolve { old_addr } else { 0 }, at + PF_OLD_ADDR, LE)?;
        data.pwrite_with::<u32>(old_size as u32, at + PF_OLD_SIZE, LE)?;
        data.pwrite_with::<u32>(obj.symbols[fid].sym.st_size as u32, at + PF_NEW_SIZE, LE)?;
        // new_addr and the name slot are filled by the relocations below
        relas.push(Reloc {
            offset: (at + PF_NEW_ADDR) as u64,
            rtype: R_X86_64_64,
            addend: 0,
            sym: fid,
            string: None,
        });
        relas.push(Reloc {
            offset: (at + PF_NAME) as u64,
            rtype: R_X86_64_64,
            addend: name_offset as i64,
            sym: strings_secsym,
            string: None,
        });
    }
    obj.sections[funcs_sec].data = Some(data);
    obj.sections[rela_sec].relas = relas;

    // NUL-terminated concatenation in insertion order
    let mut pool = Vec::new();
    for entry in &obj.strings {
        pool.extend_from_slice(entry.text.as_bytes());
        pool.push(0);
    }
    obj.sections[strings_sec].shdr.sh_size = pool.len() as u64;
    obj.sections[strings_sec].data = Some(pool);

    // scope every surviving local function/object the same way the table
    // entries are scoped
    if let Some(hint) = &hint {
        for sym in &mut obj.symbols {
            if sym.included
                && sym.is_local()
                && matches!(sym.typ(), STT_FUNC | STT_OBJECT)
            {
                debug!("renaming local symbol {} to {hint}#{}", sym.name, sym.name);
                sym.name = format!("{hint}#{}", sym.name);
            }
        }
    }
    Ok(())
}
