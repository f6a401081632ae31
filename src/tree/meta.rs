//! # Metadata Record (Page 0)
//!
//! Page 0 of every index file carries the tree-wide state in a fixed 22-byte
//! big-endian layout; the remainder of the page is zero:
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       2     page_size  bytes per page, fixed at create
//! 2       2     key_size   encoded key size the file was built with
//! 4       2     val_size   encoded value size
//! 6       4     root_ptr   raw pointer of the root node
//! 10      4     null_ptr   raw pointer of the BLACK leaf sentinel
//! 14      4     top        raw pointer of the next free slot (bump)
//! 18      4     count      number of live keys
//! ```
//!
//! `key_size`/`val_size` pin the node layout: opening a file with key or
//! value types of a different encoded size is a fatal error, caught here
//! before any node is touched.

use eyre::{ensure, Result};
use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::entry::Item;

/// Byte size of the serialized metadata record.
pub const META_SIZE: usize = 22;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaHeader {
    page_size: U16,
    key_size: U16,
    val_size: U16,
    root_ptr: U32,
    null_ptr: U32,
    top: U32,
    count: U32,
}

/// In-memory tree metadata, mirrored to page 0 on flush.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub page_size: u16,
    pub key_size: u16,
    pub val_size: u16,
    pub root_ptr: u32,
    pub null_ptr: u32,
    pub top: u32,
    pub count: u32,
    pub dirty: bool,
}

impl Metadata {
    /// Fresh metadata for a newly initialized file. `top` starts at page 1,
    /// slot 0 (page 0 is this record); root and null are wired by the caller
    /// once the sentinel node is allocated.
    pub fn init(page_size: u16, key_size: u16, val_size: u16) -> Self {
        Self {
            page_size,
            key_size,
            val_size,
            root_ptr: 0,
            null_ptr: 0,
            top: page_size as u32,
            count: 0,
            dirty: true,
        }
    }

    /// Serializes into a page-0 buffer (`buf.len()` >= [`META_SIZE`]).
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() >= META_SIZE,
            "buffer too small for metadata: {} < {}",
            buf.len(),
            META_SIZE
        );

        let header = MetaHeader {
            page_size: U16::new(self.page_size),
            key_size: U16::new(self.key_size),
            val_size: U16::new(self.val_size),
            root_ptr: U32::new(self.root_ptr),
            null_ptr: U32::new(self.null_ptr),
            top: U32::new(self.top),
            count: U32::new(self.count),
        };
        buf[..META_SIZE].copy_from_slice(header.as_bytes());
        Ok(())
    }

    /// Decodes from a page-0 buffer. Clean on return.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() >= META_SIZE,
            "buffer too small for metadata: {} < {}",
            buf.len(),
            META_SIZE
        );

        let header = MetaHeader::ref_from_bytes(&buf[..META_SIZE])
            .map_err(|e| eyre::eyre!("failed to read metadata: {:?}", e))?;

        Ok(Self {
            page_size: header.page_size.get(),
            key_size: header.key_size.get(),
            val_size: header.val_size.get(),
            root_ptr: header.root_ptr.get(),
            null_ptr: header.null_ptr.get(),
            top: header.top.get(),
            count: header.count.get(),
            dirty: false,
        })
    }

    /// Open-time validation: the file must have been built with the same
    /// page size and the same key/value encoding sizes as the caller's types.
    pub fn validate<K: Item, V: Item>(&self, page_size: u16) -> Result<()> {
        ensure!(
            self.page_size == page_size,
            "index file was created with page size {}, opened with {}",
            self.page_size,
            page_size
        );

        let key_size = K::default().size();
        let val_size = V::default().size();
        ensure!(
            self.key_size as usize == key_size,
            "index file stores {}-byte keys, key type encodes {} bytes",
            self.key_size,
            key_size
        );
        ensure!(
            self.val_size as usize == val_size,
            "index file stores {}-byte values, value type encodes {} bytes",
            self.val_size,
            val_size
        );
        Ok(())
    }
}
