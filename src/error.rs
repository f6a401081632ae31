//! User-facing error kinds.
//!
//! All fallible operations in this crate return `eyre::Result`. The kinds a
//! caller can meaningfully match on (bad input sizes, duplicate keys, missing
//! keys) are typed here and carried inside the `eyre::Report`, so call sites
//! can recover them with `report.downcast_ref::<TreeError>()`.
//!
//! Structural corruption (a raw pointer of zero) is a programmer error, not a
//! recoverable condition: it panics at the dereference site instead of
//! surfacing as a variant here.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("key/value size mismatch: required {required} bytes, got {got}")]
    InvalidKeySize { required: usize, got: usize },

    #[error("key already exists")]
    KeyAlreadyExists,

    #[error("key not found")]
    NotFound,
}

impl TreeError {
    /// Extracts the typed kind from an `eyre::Report`, if one is attached.
    pub fn from_report(report: &eyre::Report) -> Option<TreeError> {
        report.downcast_ref::<TreeError>().copied()
    }
}
