//! The 64-bit little-endian ELF subset the differencing engine works with:
//! fixed-layout headers, symbols and RELA relocations, plus a byte-offset
//! string table reader.

pub mod header;
pub mod reloc;
pub mod section_header;
pub mod strtab;
pub mod sym;
