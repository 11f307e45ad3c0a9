//! Builders for synthetic relocatable objects, shared by the
//! integration suites.

#![allow(dead_code)]

use xsplice_build::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, ET_REL, EV_CURRENT, Header,
    SIZEOF_EHDR, SIZEOF_IDENT,
};
use xsplice_build::elf::reloc::SIZEOF_RELA;
use xsplice_build::elf::section_header::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHN_ABS, SHT_NOBITS, SHT_PROGBITS, SHT_RELA, SHT_STRTAB,
    SHT_SYMTAB, SIZEOF_SHDR, SectionHeader,
};
use xsplice_build::elf::sym::{
    STB_GLOBAL, STB_LOCAL, STT_FILE, STT_FUNC, STT_OBJECT, Sym, st_info,
};
use xsplice_build::lookup::{ImageSymbol, Table};
use xsplice_build::model::{Object, Reloc, SecId, Section, Status, SymId, Symbol};

pub fn rel_header() -> Header {
    let mut e_ident = [0u8; SIZEOF_IDENT];
    e_ident[..4].copy_from_slice(ELFMAG);
    e_ident[EI_CLASS] = ELFCLASS64;
    e_ident[EI_DATA] = ELFDATA2LSB;
    e_ident[6] = 1;
    Header {
        e_ident,
        e_type: ET_REL,
        e_machine: EM_X86_64,
        e_version: EV_CURRENT,
        e_ehsize: SIZEOF_EHDR as u16,
        e_shentsize: SIZEOF_SHDR as u16,
        ..Header::default()
    }
}

/// Builds one synthetic input object, null symbol included.
pub struct Builder {
    pub obj: Object,
}

impl Builder {
    pub fn new() -> Builder {
        let mut obj = Object {
            header: rel_header(),
            ..Object::default()
        };
        obj.add_symbol(Symbol {
            name: String::new(),
            sym: Sym::default(),
            section: None,
            included: false,
            status: Status::New,
            twin: None,
            index: 0,
        });
        Builder { obj }
    }

    pub fn file_symbol(&mut self, name: &str) -> SymId {
        self.obj.add_symbol(Symbol {
            name: name.to_string(),
            sym: Sym {
                st_info: st_info(STB_LOCAL, STT_FILE),
                st_shndx: SHN_ABS,
                ..Sym::default()
            },
            section: None,
            included: false,
            status: Status::New,
            twin: None,
            index: 0,
        })
    }

    pub fn section(
        &mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
        sh_addralign: u64,
        data: Vec<u8>,
    ) -> SecId {
        let shdr = SectionHeader {
            sh_type,
            sh_flags,
            sh_size: data.len() as u64,
            sh_addralign,
            ..SectionHeader::default()
        };
        let data = if sh_type == SHT_NOBITS { None } else { Some(data) };
        self.obj
            .add_section(Section::new(name.to_string(), shdr, data, 0))
    }

    /// A symbol owned by `sec`; `st_shndx` gets a plausible input value.
    pub fn symbol(&mut self, name: &str, bind: u8, typ: u8, sec: SecId, size: u64) -> SymId {
        self.obj.add_symbol(Symbol {
            name: name.to_string(),
            sym: Sym {
                st_info: st_info(bind, typ),
                st_shndx: (sec + 1) as u16,
                st_size: size,
                ..Sym::default()
            },
            section: Some(sec),
            included: false,
            status: Status::New,
            twin: None,
            index: 0,
        })
    }

    /// A function in its own `.text.<name>` section, bundled.
    pub fn func(&mut self, name: &str, bind: u8, code: &[u8]) -> (SecId, SymId) {
        let sec = self.section(
            &format!(".text.{name}"),
            SHT_PROGBITS,
            SHF_ALLOC | SHF_EXECINSTR,
            16,
            code.to_vec(),
        );
        self.obj.add_section_symbol(sec);
        let sym = self.symbol(name, bind, STT_FUNC, sec, code.len() as u64);
        self.obj.sections[sec].bundled = Some(sym);
        (sec, sym)
    }

    /// A data object in its own `.data.<name>` section, bundled.
    pub fn data_object(&mut self, name: &str, bind: u8, data: &[u8]) -> (SecId, SymId) {
        let sec = self.section(
            &format!(".data.{name}"),
            SHT_PROGBITS,
            SHF_ALLOC | SHF_WRITE,
            8,
            data.to_vec(),
        );
        self.obj.add_section_symbol(sec);
        let sym = self.symbol(name, bind, STT_OBJECT, sec, data.len() as u64);
        self.obj.sections[sec].bundled = Some(sym);
        (sec, sym)
    }

    /// The relocation section applying to `base`.
    pub fn rela_section(&mut self, base: SecId) -> SecId {
        let name = format!(".rela{}", self.obj.sections[base].name);
        let shdr = SectionHeader {
            sh_type: SHT_RELA,
            sh_addralign: 8,
            sh_entsize: SIZEOF_RELA as u64,
            ..SectionHeader::default()
        };
        let sec = self
            .obj
            .add_section(Section::new(name, shdr, Some(Vec::new()), 0));
        self.obj.sections[sec].base = Some(base);
        self.obj.sections[base].rela = Some(sec);
        sec
    }

    pub fn reloc(&mut self, rela_sec: SecId, offset: u64, rtype: u32, sym: SymId, addend: i64) {
        self.obj.sections[rela_sec].relas.push(Reloc {
            offset,
            rtype,
            addend,
            sym,
            string: None,
        });
    }

    /// The bookkeeping tables every relocatable input carries.
    pub fn standard_tables(&mut self) {
        self.section(".symtab", SHT_SYMTAB, 0, 8, Vec::new());
        self.section(".strtab", SHT_STRTAB, 0, 1, Vec::new());
        self.section(".shstrtab", SHT_STRTAB, 0, 1, Vec::new());
    }

    pub fn finish(self) -> Object {
        self.obj
    }
}

pub fn global_func_entry(name: &str, addr: u64, size: u64) -> ImageSymbol {
    ImageSymbol {
        name: name.to_string(),
        addr,
        size,
        typ: STT_FUNC,
        bind: STB_GLOBAL,
    }
}

pub fn local_func_entry(name: &str, addr: u64, size: u64) -> ImageSymbol {
    ImageSymbol {
        name: name.to_string(),
        addr,
        size,
        typ: STT_FUNC,
        bind: STB_LOCAL,
    }
}

pub fn file_entry(name: &str) -> ImageSymbol {
    ImageSymbol {
        name: name.to_string(),
        addr: 0,
        size: 0,
        typ: STT_FILE,
        bind: STB_LOCAL,
    }
}

pub fn table(entries: Vec<ImageSymbol>) -> Table {
    Table::from_symbols(entries)
}

pub fn u32_at(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

pub fn u64_at(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}
