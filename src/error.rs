//! Crate-wide error type.
//!
//! The three failure kinds of the tool map onto process exit codes:
//! [`Error::Malformed`] (and I/O or parse trouble) is an internal error,
//! [`Error::Unsupported`] is a diff the author must rework, and
//! [`Error::NoChanges`] means the inputs produced an empty patch.

use core::fmt;
use core::result;
use std::error;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Underlying I/O error while reading or writing an object.
    Io(io::Error),
    /// Underlying (de)serialization error.
    Scroll(scroll::Error),
    /// Invariant violation or malformed input; aborts with exit code 1.
    Malformed(String),
    /// Diff the tool cannot express as a live patch; aborts with exit code 2.
    Unsupported(String),
    /// The inputs are equivalent; nothing to patch. Exit code 3.
    NoChanges,
}

impl Error {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Unsupported(_) => 2,
            Error::NoChanges => 3,
            _ => 1,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Scroll(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "{err}"),
            Error::Scroll(err) => write!(f, "{err}"),
            Error::Malformed(msg) => write!(f, "malformed entity: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported change: {msg}"),
            Error::NoChanges => write!(f, "no changes detected"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
