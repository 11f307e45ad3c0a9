//! In-memory model of a relocatable object: sections, symbols and their
//! relocations, plus the string pool emitted into the patch module.
//!
//! Cross-references between elements are slab indices into the owning
//! [`Object`]'s vectors; twin references index into the *other* input's
//! object and are severed before migration.

use crate::elf::header::Header;
use crate::elf::section_header::{SHT_NOBITS, SHT_RELA, SectionHeader};
use crate::elf::sym::{self, STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_OBJECT, STT_SECTION, Sym};

/// Index of a [`Section`] within its owning [`Object`].
pub type SecId = usize;
/// Index of a [`Symbol`] within its owning [`Object`].
pub type SymId = usize;

/// Diff classification of a correlated element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    Same,
    Changed,
    /// Untwinned: the element exists only in one input.
    #[default]
    New,
}

/// A relocation owned by a `SHT_RELA` section.
#[derive(Clone, Debug)]
pub struct Reloc {
    /// Offset within the section the relocation applies to.
    pub offset: u64,
    /// x86-64 relocation type.
    pub rtype: u32,
    pub addend: i64,
    /// Target symbol.
    pub sym: SymId,
    /// Literal text, when the target is a section symbol of a read-only
    /// string pool. Comparison then runs on the text, not the addend.
    pub string: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub shdr: SectionHeader,
    /// Raw contents; `None` for `SHT_NOBITS`.
    pub data: Option<Vec<u8>>,
    /// Owned relocations; non-empty only for `SHT_RELA` sections.
    pub relas: Vec<Reloc>,
    /// For a relocation section, the section its relocations apply to.
    pub base: Option<SecId>,
    /// For a base section, its relocation section.
    pub rela: Option<SecId>,
    /// The `STT_SECTION` symbol naming this section.
    pub secsym: Option<SymId>,
    /// The unique function/object symbol when the section holds exactly one.
    pub bundled: Option<SymId>,
    /// Member of an `SHT_GROUP`.
    pub grouped: bool,
    /// Named by a `.xsplice.ignore.sections` directive.
    pub ignored: bool,
    pub included: bool,
    pub status: Status,
    /// Corresponding section in the other input.
    pub twin: Option<SecId>,
    /// Section header table index; input index on load, output index after
    /// reindexing.
    pub index: usize,
}

impl Section {
    pub fn new(name: String, shdr: SectionHeader, data: Option<Vec<u8>>, index: usize) -> Section {
        Section {
            name,
            shdr,
            data,
            relas: Vec::new(),
            base: None,
            rela: None,
            secsym: None,
            bundled: None,
            grouped: false,
            ignored: false,
            included: false,
            status: Status::default(),
            twin: None,
            index,
        }
    }

    #[inline]
    pub fn is_rela(&self) -> bool {
        self.shdr.sh_type == SHT_RELA
    }

    #[inline]
    pub fn is_nobits(&self) -> bool {
        self.shdr.sh_type == SHT_NOBITS
    }

    pub fn is_debug(&self) -> bool {
        is_debug_name(&self.name)
    }

    /// A read-only string pool section (`.rodata.str1.*`).
    pub fn is_string_pool(&self) -> bool {
        self.name.starts_with(".rodata.str1.")
    }

    pub fn data_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub sym: Sym,
    /// Owning section, when `st_shndx` names one.
    pub section: Option<SecId>,
    pub included: bool,
    pub status: Status,
    /// Corresponding symbol in the other input.
    pub twin: Option<SymId>,
    /// Symbol table index; input index on load, output index after
    /// reindexing.
    pub index: usize,
}

impl Symbol {
    #[inline]
    pub fn bind(&self) -> u8 {
        sym::st_bind(self.sym.st_info)
    }

    #[inline]
    pub fn typ(&self) -> u8 {
        sym::st_type(self.sym.st_info)
    }

    #[inline]
    pub fn is_func(&self) -> bool {
        self.typ() == STT_FUNC
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        self.typ() == STT_OBJECT
    }

    #[inline]
    pub fn is_section_sym(&self) -> bool {
        self.typ() == STT_SECTION
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.bind() == STB_LOCAL
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.bind() == STB_GLOBAL
    }
}

/// An entry of the patch module's own string pool (`.xsplice.strings`).
#[derive(Clone, Debug)]
pub struct PoolString {
    pub text: String,
    /// Byte offset within the laid-out pool.
    pub offset: u64,
}

/// One relocatable object: ordered sections, symbols and pool strings.
#[derive(Clone, Debug, Default)]
pub struct Object {
    pub header: Header,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub strings: Vec<PoolString>,
}

impl Object {
    pub fn section_by_name(&self, name: &str) -> Option<SecId> {
        self.sections.iter().position(|sec| sec.name == name)
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<SymId> {
        self.symbols.iter().position(|sym| sym.name == name)
    }

    pub fn has_program_headers(&self) -> bool {
        self.header.e_phnum != 0
    }

    /// Append a section and return its id.
    pub fn add_section(&mut self, sec: Section) -> SecId {
        self.sections.push(sec);
        self.sections.len() - 1
    }

    /// Append a symbol and return its id.
    pub fn add_symbol(&mut self, sym: Symbol) -> SymId {
        self.symbols.push(sym);
        self.symbols.len() - 1
    }

    /// Create the `STT_SECTION` symbol naming `sec` and wire the
    /// back-reference.
    pub fn add_section_symbol(&mut self, sec: SecId) -> SymId {
        let name = self.sections[sec].name.clone();
        let id = self.add_symbol(Symbol {
            name,
            sym: Sym {
                st_info: sym::st_info(STB_LOCAL, STT_SECTION),
                ..Sym::default()
            },
            section: Some(sec),
            included: false,
            status: Status::default(),
            twin: None,
            index: 0,
        });
        self.sections[sec].secsym = Some(id);
        id
    }

    /// Append `text` to the patch string pool, returning its byte offset
    /// under NUL-terminated concatenation in insertion order.
    pub fn add_string(&mut self, text: &str) -> u64 {
        let offset = self
            .strings
            .last()
            .map(|s| s.offset + s.text.len() as u64 + 1)
            .unwrap_or(0);
        self.strings.push(PoolString {
            text: text.to_string(),
            offset,
        });
        offset
    }
}

/// Debug sections and their relocation partners.
pub fn is_debug_name(name: &str) -> bool {
    name.starts_with(".debug_") || name.starts_with(".rela.debug_")
}

/// A read-only-data constant label of the form `.LC<digits>`.
pub fn is_constant_label(name: &str) -> bool {
    match name.strip_prefix(".LC") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
