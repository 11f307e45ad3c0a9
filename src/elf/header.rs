use core::fmt;
use scroll::{Pread, Pwrite, SizeWith};

/// The ELF magic number.
pub const ELFMAG: &[u8; 4] = b"\x7fELF";
/// Size of the magic number.
pub const SELFMAG: usize = 4;

/// File class byte index.
pub const EI_CLASS: usize = 4;
/// 64-bit objects.
pub const ELFCLASS64: u8 = 2;

/// Data encoding byte index.
pub const EI_DATA: usize = 5;
/// 2's complement, little endian.
pub const ELFDATA2LSB: u8 = 1;

/// Number of bytes in an identifier.
pub const SIZEOF_IDENT: usize = 16;
/// Size of a serialized 64-bit header.
pub const SIZEOF_EHDR: usize = 64;

/// No file type.
pub const ET_NONE: u16 = 0;
/// Relocatable file.
pub const ET_REL: u16 = 1;
/// Executable file.
pub const ET_EXEC: u16 = 2;

/// AMD x86-64 architecture.
pub const EM_X86_64: u16 = 62;

/// Current object file version.
pub const EV_CURRENT: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct Header {
    /// Magic number and other info
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Architecture
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size in bytes
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section header string table index
    pub e_shstrndx: u16,
}

/// Convert an ET value to its associated string.
#[inline]
pub fn et_to_str(et: u16) -> &'static str {
    match et {
        ET_NONE => "NONE",
        ET_REL => "REL",
        ET_EXEC => "EXEC",
        _ => "UNKNOWN_ET",
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "e_ident: {:?} e_type: {} e_machine: 0x{:x} e_version: 0x{:x} e_entry: 0x{:x} \
             e_phoff: 0x{:x} e_shoff: 0x{:x} e_flags: {:x} e_ehsize: {} e_phentsize: {} \
             e_phnum: {} e_shentsize: {} e_shnum: {} e_shstrndx: {}",
            self.e_ident,
            et_to_str(self.e_type),
            self.e_machine,
            self.e_version,
            self.e_entry,
            self.e_phoff,
            self.e_shoff,
            self.e_flags,
            self.e_ehsize,
            self.e_phentsize,
            self.e_phnum,
            self.e_shentsize,
            self.e_shnum,
            self.e_shstrndx
        )
    }
}
