//! Symbol-address lookup table built from the running image.
//!
//! The image (a `xen-syms`-style unstripped binary) supplies the old
//! address and size for every function the patch redirects. Locals are
//! disambiguated by their translation unit: the symbol table groups a
//! file's locals behind its `STT_FILE` entry.

use std::fs;
use std::path::Path;

use log::debug;
use scroll::{LE, Pread};

use crate::elf::header::{EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, Header, SELFMAG};
use crate::elf::section_header::{SHT_SYMTAB, SectionHeader, SIZEOF_SHDR};
use crate::elf::strtab::Strtab;
use crate::elf::sym::{self, SIZEOF_SYM, STB_LOCAL, STT_FILE, Sym};
use crate::error::{Error, Result};

/// One symbol of the running image.
#[derive(Clone, Debug)]
pub struct ImageSymbol {
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub typ: u8,
    pub bind: u8,
}

/// The running image's symbol table, in symbol-table order.
pub struct Table {
    symbols: Vec<ImageSymbol>,
}

impl Table {
    /// Load the symbol table of the binary at `path`.
    pub fn open(path: &Path) -> Result<Table> {
        let bytes = fs::read(path)?;
        let header: Header = bytes.pread_with(0, LE)?;
        if &header.e_ident[..SELFMAG] != ELFMAG
            || header.e_ident[EI_CLASS] != ELFCLASS64
            || header.e_ident[EI_DATA] != ELFDATA2LSB
        {
            return Err(Error::Malformed(format!(
                "{} is not a little-endian ELF64 image",
                path.display()
            )));
        }

        let shoff = header.e_shoff as usize;
        let mut symtab_hdr: Option<SectionHeader> = None;
        for i in 0..header.e_shnum as usize {
            let shdr: SectionHeader = bytes.pread_with(shoff + i * SIZEOF_SHDR, LE)?;
            if shdr.sh_type == SHT_SYMTAB {
                symtab_hdr = Some(shdr);
                break;
            }
        }
        let symtab_hdr = symtab_hdr.ok_or_else(|| {
            Error::Malformed(format!("{} has no symbol table", path.display()))
        })?;
        let strtab_hdr: SectionHeader =
            bytes.pread_with(shoff + symtab_hdr.sh_link as usize * SIZEOF_SHDR, LE)?;
        let strtab_bytes = bytes
            .get(strtab_hdr.sh_offset as usize..(strtab_hdr.sh_offset + strtab_hdr.sh_size) as usize)
            .ok_or_else(|| Error::Malformed("image string table out of bounds".into()))?;
        let strtab = Strtab::new(strtab_bytes);

        let count = symtab_hdr.sh_size as usize / SIZEOF_SYM;
        let mut symbols = Vec::with_capacity(count.saturating_sub(1));
        for i in 1..count {
            let raw: Sym =
                bytes.pread_with(symtab_hdr.sh_offset as usize + i * SIZEOF_SYM, LE)?;
            symbols.push(ImageSymbol {
                name: strtab.get(raw.st_name as usize)?.to_string(),
                addr: raw.st_value,
                size: raw.st_size,
                typ: sym::st_type(raw.st_info),
                bind: sym::st_bind(raw.st_info),
            });
        }
        debug!("loaded {} image symbols from {}", symbols.len(), path.display());
        Ok(Table { symbols })
    }

    /// Build a table directly from symbols, preserving their order.
    pub fn from_symbols(symbols: Vec<ImageSymbol>) -> Table {
        Table { symbols }
    }

    /// Address and size of the global `name`.
    pub fn lookup_global(&self, name: &str) -> Option<(u64, u64)> {
        self.symbols
            .iter()
            .find(|sym| sym.bind != STB_LOCAL && sym.typ != STT_FILE && sym.name == name)
            .map(|sym| (sym.addr, sym.size))
    }

    /// Address and size of the local `name` defined by the translation
    /// unit `file_hint`.
    pub fn lookup_local(&self, name: &str, file_hint: &str) -> Option<(u64, u64)> {
        let mut in_file = false;
        for sym in &self.symbols {
            if sym.typ == STT_FILE {
                in_file = sym.name == file_hint;
            } else if in_file && sym.bind == STB_LOCAL && sym.name == name {
                return Some((sym.addr, sym.size));
            }
        }
        None
    }
}
