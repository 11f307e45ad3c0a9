//! A byte-offset based string table, as used by `.strtab` and `.shstrtab`.

use scroll::{Pread, ctx};

use crate::error::{Error, Result};

/// A string table indexed by byte offset rather than member index.
pub struct Strtab<'a> {
    bytes: &'a [u8],
}

impl<'a> Strtab<'a> {
    pub fn new(bytes: &'a [u8]) -> Strtab<'a> {
        Strtab { bytes }
    }

    /// The NUL-terminated string starting at `offset`.
    pub fn get(&self, offset: usize) -> Result<&'a str> {
        if offset >= self.bytes.len() {
            return Err(Error::Malformed(format!(
                "string table offset {} out of bounds ({} bytes)",
                offset,
                self.bytes.len()
            )));
        }
        Ok(self
            .bytes
            .pread_with::<&str>(offset, ctx::StrCtx::Delimiter(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_by_offset() {
        let bytes = b"\0.text.foo\0foo\0";
        let strtab = Strtab::new(bytes);
        assert_eq!(strtab.get(0).unwrap(), "");
        assert_eq!(strtab.get(1).unwrap(), ".text.foo");
        assert_eq!(strtab.get(7).unwrap(), "foo");
        assert_eq!(strtab.get(11).unwrap(), "foo");
    }

    #[test]
    fn get_out_of_bounds() {
        let strtab = Strtab::new(b"\0a\0");
        assert!(strtab.get(3).is_err());
    }
}
