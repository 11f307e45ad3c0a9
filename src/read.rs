//! Loader: an ELF64 relocatable byte buffer into an [`Object`].

use log::debug;
use scroll::{LE, Pread};

use crate::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, ET_REL, Header, SELFMAG,
};
use crate::elf::reloc::{self, R_X86_64_PC32, SIZEOF_RELA};
use crate::elf::section_header::{
    SHN_LORESERVE, SHN_UNDEF, SHT_GROUP, SHT_NOBITS, SHT_RELA, SHT_SYMTAB, SectionHeader,
    SIZEOF_SHDR,
};
use crate::elf::strtab::Strtab;
use crate::elf::sym::{SIZEOF_SYM, STT_FUNC, STT_OBJECT, STT_SECTION, Sym};
use crate::error::{Error, Result};
use crate::model::{Object, Reloc, SecId, Section, Status, Symbol};

/// Section name prefixes produced by per-function/per-data compilation.
const BUNDLE_PREFIXES: &[&str] = &[".text.", ".data.", ".rodata.", ".bss."];

fn slice<'a>(bytes: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| Error::Malformed(format!("{what} out of bounds: {offset:#x}+{len:#x}")))
}

/// Parse a relocatable object into the in-memory model.
pub fn parse(bytes: &[u8]) -> Result<Object> {
    let header: Header = bytes.pread_with(0, LE)?;
    if &header.e_ident[..SELFMAG] != ELFMAG {
        return Err(Error::Malformed(format!(
            "invalid ELF magic number: {:?}",
            &header.e_ident[..SELFMAG]
        )));
    }
    if header.e_ident[EI_CLASS] != ELFCLASS64 || header.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(Error::Unsupported(
            "only little-endian ELF64 objects are supported".into(),
        ));
    }
    if header.e_type != ET_REL {
        return Err(Error::Unsupported(format!(
            "not a relocatable object (e_type {})",
            header.e_type
        )));
    }
    if header.e_machine != EM_X86_64 {
        return Err(Error::Unsupported(format!(
            "unsupported machine {:#x}",
            header.e_machine
        )));
    }

    let shnum = header.e_shnum as usize;
    let shoff = header.e_shoff as usize;
    let mut shdrs = Vec::with_capacity(shnum);
    for i in 0..shnum {
        let shdr: SectionHeader = bytes.pread_with(shoff + i * SIZEOF_SHDR, LE)?;
        shdrs.push(shdr);
    }
    if shdrs.is_empty() {
        return Err(Error::Malformed("object has no sections".into()));
    }

    let shstr_hdr = shdrs
        .get(header.e_shstrndx as usize)
        .ok_or_else(|| Error::Malformed("bad e_shstrndx".into()))?;
    let shstrtab = Strtab::new(slice(
        bytes,
        shstr_hdr.sh_offset as usize,
        shstr_hdr.sh_size as usize,
        "section header string table",
    )?);

    let mut obj = Object {
        header,
        ..Object::default()
    };

    // sections, skipping the null entry; `shndx_map[elf index] -> SecId`
    let mut shndx_map: Vec<Option<SecId>> = vec![None; shnum];
    for (elf_index, shdr) in shdrs.iter().enumerate().skip(1) {
        let name = shstrtab.get(shdr.sh_name as usize)?.to_string();
        let data = if shdr.sh_type == SHT_NOBITS {
            None
        } else {
            Some(slice(bytes, shdr.sh_offset as usize, shdr.sh_size as usize, &name)?.to_vec())
        };
        let id = obj.add_section(Section::new(name, *shdr, data, elf_index));
        shndx_map[elf_index] = Some(id);
    }

    load_symbols(&mut obj, &shdrs, bytes, &shndx_map)?;
    wire_sections(&mut obj, &shndx_map)?;
    load_relocations(&mut obj)?;
    mark_grouped_members(&mut obj, &shndx_map)?;
    extract_reloc_strings(&mut obj)?;

    debug!(
        "loaded object: {} sections, {} symbols",
        obj.sections.len(),
        obj.symbols.len()
    );
    Ok(obj)
}

fn load_symbols(
    obj: &mut Object,
    shdrs: &[SectionHeader],
    bytes: &[u8],
    shndx_map: &[Option<SecId>],
) -> Result<()> {
    let symtab_hdr = shdrs
        .iter()
        .find(|shdr| shdr.sh_type == SHT_SYMTAB)
        .ok_or_else(|| Error::Malformed("missing symbol table".into()))?;
    let strtab_hdr = shdrs
        .get(symtab_hdr.sh_link as usize)
        .ok_or_else(|| Error::Malformed("bad symbol table sh_link".into()))?;
    let strtab = Strtab::new(slice(
        bytes,
        strtab_hdr.sh_offset as usize,
        strtab_hdr.sh_size as usize,
        "string table",
    )?);

    let count = symtab_hdr.sh_size as usize / SIZEOF_SYM;
    let symtab_bytes = slice(
        bytes,
        symtab_hdr.sh_offset as usize,
        symtab_hdr.sh_size as usize,
        "symbol table",
    )?;
    for i in 0..count {
        let sym: Sym = symtab_bytes.pread_with(i * SIZEOF_SYM, LE)?;
        let section = if sym.st_shndx != SHN_UNDEF && sym.st_shndx < SHN_LORESERVE {
            let id = shndx_map
                .get(sym.st_shndx as usize)
                .copied()
                .flatten()
                .ok_or_else(|| Error::Malformed(format!("symbol {i} has bad st_shndx")))?;
            Some(id)
        } else {
            None
        };
        // section symbols carry no name of their own; borrow the section's
        let name = if crate::elf::sym::st_type(sym.st_info) == STT_SECTION {
            match section {
                Some(id) => obj.sections[id].name.clone(),
                None => String::new(),
            }
        } else {
            strtab.get(sym.st_name as usize)?.to_string()
        };
        obj.add_symbol(Symbol {
            name,
            sym,
            section,
            included: false,
            status: Status::default(),
            twin: None,
            index: i,
        });
    }
    Ok(())
}

/// Wire base/rela links, section symbols and bundled symbols.
fn wire_sections(obj: &mut Object, shndx_map: &[Option<SecId>]) -> Result<()> {
    for id in 0..obj.sections.len() {
        if obj.sections[id].shdr.sh_type != SHT_RELA {
            continue;
        }
        let base = shndx_map
            .get(obj.sections[id].shdr.sh_info as usize)
            .copied()
            .flatten()
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "relocation section {} has bad sh_info",
                    obj.sections[id].name
                ))
            })?;
        obj.sections[id].base = Some(base);
        obj.sections[base].rela = Some(id);
    }

    for id in 0..obj.symbols.len() {
        let Some(sec) = obj.symbols[id].section else {
            continue;
        };
        match obj.symbols[id].typ() {
            STT_SECTION => {
                if obj.sections[sec].secsym.is_none() {
                    obj.sections[sec].secsym = Some(id);
                }
            }
            STT_FUNC | STT_OBJECT => {
                let bundled = BUNDLE_PREFIXES.iter().any(|prefix| {
                    obj.sections[sec]
                        .name
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest == obj.symbols[id].name)
                });
                if bundled {
                    obj.sections[sec].bundled = Some(id);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn load_relocations(obj: &mut Object) -> Result<()> {
    let nsyms = obj.symbols.len();
    for id in 0..obj.sections.len() {
        if obj.sections[id].shdr.sh_type != SHT_RELA {
            continue;
        }
        let data = std::mem::take(&mut obj.sections[id].data).unwrap_or_default();
        let count = data.len() / SIZEOF_RELA;
        let mut relas = Vec::with_capacity(count);
        for i in 0..count {
            let rela: crate::elf::reloc::Rela = data.pread_with(i * SIZEOF_RELA, LE)?;
            let sym = reloc::r_sym(rela.r_info) as usize;
            if sym >= nsyms {
                return Err(Error::Malformed(format!(
                    "relocation in {} references symbol {} of {}",
                    obj.sections[id].name, sym, nsyms
                )));
            }
            relas.push(Reloc {
                offset: rela.r_offset,
                rtype: reloc::r_type(rela.r_info),
                addend: rela.r_addend,
                sym,
                string: None,
            });
        }
        obj.sections[id].data = Some(data);
        obj.sections[id].relas = relas;
    }
    Ok(())
}

fn mark_grouped_members(obj: &mut Object, shndx_map: &[Option<SecId>]) -> Result<()> {
    for id in 0..obj.sections.len() {
        if obj.sections[id].shdr.sh_type != SHT_GROUP {
            continue;
        }
        let data = obj.sections[id].data.clone().unwrap_or_default();
        let words = data.len() / 4;
        // the first word holds the group flags, the rest are member indices
        for i in 1..words {
            let member: u32 = data.pread_with(i * 4, LE)?;
            let member = shndx_map
                .get(member as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "group section {} has bad member index {}",
                        obj.sections[id].name, member
                    ))
                })?;
            obj.sections[member].grouped = true;
        }
    }
    Ok(())
}

/// Inline the literal a relocation points at when its target is a section
/// symbol of a read-only string pool.
fn extract_reloc_strings(obj: &mut Object) -> Result<()> {
    for id in 0..obj.sections.len() {
        for ri in 0..obj.sections[id].relas.len() {
            let (sym, rtype, addend) = {
                let rela = &obj.sections[id].relas[ri];
                (rela.sym, rela.rtype, rela.addend)
            };
            if obj.symbols[sym].typ() != STT_SECTION {
                continue;
            }
            let Some(target) = obj.symbols[sym].section else {
                continue;
            };
            if !obj.sections[target].is_string_pool() {
                continue;
            }
            // PC-relative references point at the byte after the next
            // instruction's displacement slot
            let offset = if rtype == R_X86_64_PC32 {
                addend + 4
            } else {
                addend
            };
            if offset < 0 {
                return Err(Error::Malformed(format!(
                    "negative string offset {offset} in {}",
                    obj.sections[id].name
                )));
            }
            let text = read_cstr(obj.sections[target].data_bytes(), offset as usize)
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "unterminated string literal at {offset:#x} in {}",
                        obj.sections[target].name
                    ))
                })?
                .to_string();
            obj.sections[id].relas[ri].string = Some(text);
        }
    }
    Ok(())
}

pub(crate) fn read_cstr(data: &[u8], offset: usize) -> Option<&str> {
    let rest = data.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}
