//! Writer: serialize an output [`Object`] back to ELF64 bytes.
//!
//! The three bookkeeping tables are rebuilt from the model (`.shstrtab`
//! from section names, `.strtab` from symbol names, `.symtab` from the raw
//! symbols), relocation buffers are re-encoded from the final symbol
//! indices, and the sections are laid out after the header with their
//! native alignment.

use log::debug;
use scroll::{LE, Pwrite};

use crate::elf::header::SIZEOF_EHDR;
use crate::elf::reloc::{self, Rela, SIZEOF_RELA};
use crate::elf::section_header::{SIZEOF_SHDR, SectionHeader};
use crate::elf::sym::{SIZEOF_SYM, STT_SECTION};
use crate::error::{Error, Result};
use crate::model::Object;

/// A string table under construction; the first byte is always NUL.
struct StrtabBuilder {
    bytes: Vec<u8>,
}

impl StrtabBuilder {
    fn new() -> StrtabBuilder {
        StrtabBuilder { bytes: vec![0] }
    }

    /// Add a string and return its offset.
    fn add(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        offset
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Serialize the object. Expects a migrated, reordered and reindexed
/// model: symbol positions are final symbol-table indices.
pub fn write_object(obj: &mut Object) -> Result<Vec<u8>> {
    let symtab = obj
        .section_by_name(".symtab")
        .ok_or_else(|| Error::Malformed("output object lacks .symtab".into()))?;
    let strtab = obj
        .section_by_name(".strtab")
        .ok_or_else(|| Error::Malformed("output object lacks .strtab".into()))?;
    let shstrtab = obj
        .section_by_name(".shstrtab")
        .ok_or_else(|| Error::Malformed("output object lacks .shstrtab".into()))?;

    // .strtab and st_name assignment; section symbols keep st_name 0
    let mut names = StrtabBuilder::new();
    for sym in &mut obj.symbols {
        sym.sym.st_name = if sym.typ() == STT_SECTION {
            0
        } else {
            names.add(&sym.name)
        };
    }
    obj.sections[strtab].data = Some(names.into_bytes());

    // .symtab: serialized raw symbols; sh_info is the first non-local index
    let mut symdata = vec![0u8; obj.symbols.len() * SIZEOF_SYM];
    for (i, sym) in obj.symbols.iter().enumerate() {
        symdata.pwrite_with(sym.sym, i * SIZEOF_SYM, LE)?;
    }
    let first_global = obj
        .symbols
        .iter()
        .position(|sym| !sym.is_local())
        .unwrap_or(obj.symbols.len());
    obj.sections[symtab].data = Some(symdata);
    obj.sections[symtab].shdr.sh_link = obj.sections[strtab].index as u32;
    obj.sections[symtab].shdr.sh_info = first_global as u32;
    obj.sections[symtab].shdr.sh_entsize = SIZEOF_SYM as u64;

    // relocation buffers from the final symbol indices
    for id in 0..obj.sections.len() {
        if !obj.sections[id].is_rela() {
            continue;
        }
        let mut data = vec![0u8; obj.sections[id].relas.len() * SIZEOF_RELA];
        for (i, rela) in obj.sections[id].relas.iter().enumerate() {
            let raw = Rela {
                r_offset: rela.offset,
                r_info: reloc::r_info(obj.symbols[rela.sym].index as u32, rela.rtype),
                r_addend: rela.addend,
            };
            data.pwrite_with(raw, i * SIZEOF_RELA, LE)?;
        }
        obj.sections[id].shdr.sh_entsize = SIZEOF_RELA as u64;
        obj.sections[id].data = Some(data);
    }

    // .shstrtab and sh_name assignment (after all renames are final)
    let mut secnames = StrtabBuilder::new();
    for sec in &mut obj.sections {
        sec.shdr.sh_name = secnames.add(&sec.name);
    }
    obj.sections[shstrtab].data = Some(secnames.into_bytes());

    // data sizes and layout
    let mut offset = SIZEOF_EHDR;
    for sec in &mut obj.sections {
        if let Some(data) = &sec.data {
            sec.shdr.sh_size = data.len() as u64;
        }
        offset = align_up(offset, sec.shdr.sh_addralign as usize);
        sec.shdr.sh_offset = offset as u64;
        if !sec.is_nobits() {
            offset += sec.shdr.sh_size as usize;
        }
    }
    let shoff = align_up(offset, 8);
    let total = shoff + (obj.sections.len() + 1) * SIZEOF_SHDR;

    let mut header = obj.header;
    header.e_phoff = 0;
    header.e_phnum = 0;
    header.e_phentsize = 0;
    header.e_shoff = shoff as u64;
    header.e_shentsize = SIZEOF_SHDR as u16;
    header.e_shnum = obj.sections.len() as u16 + 1;
    header.e_shstrndx = obj.sections[shstrtab].index as u16;

    let mut out = vec![0u8; total];
    out.pwrite_with(header, 0, LE)?;
    for sec in &obj.sections {
        if sec.is_nobits() {
            continue;
        }
        if let Some(data) = &sec.data {
            let at = sec.shdr.sh_offset as usize;
            out[at..at + data.len()].copy_from_slice(data);
        }
    }
    // the null section header occupies slot 0
    out.pwrite_with(SectionHeader::default(), shoff, LE)?;
    for sec in &obj.sections {
        out.pwrite_with(sec.shdr, shoff + sec.index * SIZEOF_SHDR, LE)?;
    }

    debug!(
        "serialized {} sections, {} symbols, {} bytes",
        obj.sections.len(),
        obj.symbols.len(),
        total
    );
    Ok(out)
}
