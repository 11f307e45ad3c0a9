use core::fmt;
use scroll::{Pread, Pwrite, SizeWith};

/// Size of a serialized 64-bit section header.
pub const SIZEOF_SHDR: usize = 64;

/// Undefined section.
pub const SHN_UNDEF: u16 = 0;
/// Start of reserved indices.
pub const SHN_LORESERVE: u16 = 0xff00;
/// Associated symbol is absolute.
pub const SHN_ABS: u16 = 0xfff1;

/// Section header table entry unused.
pub const SHT_NULL: u32 = 0;
/// Program data.
pub const SHT_PROGBITS: u32 = 1;
/// Symbol table.
pub const SHT_SYMTAB: u32 = 2;
/// String table.
pub const SHT_STRTAB: u32 = 3;
/// Relocation entries with addends.
pub const SHT_RELA: u32 = 4;
/// Program space with no data (bss).
pub const SHT_NOBITS: u32 = 8;
/// Section group.
pub const SHT_GROUP: u32 = 17;

/// Writable.
pub const SHF_WRITE: u64 = 1 << 0;
/// Occupies memory during execution.
pub const SHF_ALLOC: u64 = 1 << 1;
/// Executable.
pub const SHF_EXECINSTR: u64 = 1 << 2;
/// Might be merged.
pub const SHF_MERGE: u64 = 1 << 4;
/// Contains nul-terminated strings.
pub const SHF_STRINGS: u64 = 1 << 5;
/// `sh_info` contains SHT index.
pub const SHF_INFO_LINK: u64 = 1 << 6;
/// Section is member of a group.
pub const SHF_GROUP: u64 = 1 << 9;

/// The section group is a COMDAT group.
pub const GRP_COMDAT: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct SectionHeader {
    /// Section name (string tbl index)
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub sh_flags: u64,
    /// Section virtual addr at execution
    pub sh_addr: u64,
    /// Section file offset
    pub sh_offset: u64,
    /// Section size in bytes
    pub sh_size: u64,
    /// Link to another section
    pub sh_link: u32,
    /// Additional section information
    pub sh_info: u32,
    /// Section alignment
    pub sh_addralign: u64,
    /// Entry size if section holds table
    pub sh_entsize: u64,
}

pub fn sht_to_str(sht: u32) -> &'static str {
    match sht {
        SHT_NULL => "SHT_NULL",
        SHT_PROGBITS => "SHT_PROGBITS",
        SHT_SYMTAB => "SHT_SYMTAB",
        SHT_STRTAB => "SHT_STRTAB",
        SHT_RELA => "SHT_RELA",
        SHT_NOBITS => "SHT_NOBITS",
        SHT_GROUP => "SHT_GROUP",
        _ => "UNKNOWN_SHT",
    }
}

impl fmt::Debug for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sh_name: {} sh_type: {} sh_flags: 0x{:x} sh_addr: 0x{:x} sh_offset: 0x{:x} \
             sh_size: 0x{:x} sh_link: 0x{:x} sh_info: 0x{:x} sh_addralign: 0x{:x} sh_entsize: 0x{:x}",
            self.sh_name,
            sht_to_str(self.sh_type),
            self.sh_flags,
            self.sh_addr,
            self.sh_offset,
            self.sh_size,
            self.sh_link,
            self.sh_info,
            self.sh_addralign,
            self.sh_entsize
        )
    }
}
