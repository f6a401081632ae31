//! # Node Record Layout
//!
//! Every tree node is a fixed-size record packed into a page slot:
//!
//! ```text
//! Offset  Size       Field    Description
//! ------  ---------  -------  --------------------------------
//! 0       1          flags    bit 0: color (RED=1, BLACK=0)
//! 1       4          parent   raw pointer, big-endian
//! 5       4          left     raw pointer, big-endian
//! 9       4          right    raw pointer, big-endian
//! 13      size(K)    key      canonical key encoding
//! 13+     size(V)    val      value encoding
//! ```
//!
//! The 13-byte fixed prefix is a `zerocopy` struct so marshal/unmarshal is a
//! transmute plus two codec calls, never field-by-field byte shuffling.
//!
//! The in-memory node additionally carries a `dirty` flag, flipped by every
//! mutation; the write-back pass consolidates node dirt into page dirt.

use eyre::{ensure, Result};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::entry::{Entry, Item};

/// Byte size of the fixed (entry-less) node prefix.
pub const NODE_HEADER_SIZE: usize = 13;

const FLAG_RED: u8 = 0b0000_0001;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    flags: u8,
    parent: U32,
    left: U32,
    right: U32,
}

/// One tree node, decoded. `Default` yields a clean BLACK node with zeroed
/// links and a zero entry — the state freshly allocated page slots decode to.
#[derive(Debug, Clone)]
pub struct Node<K, V> {
    pub flags: u8,
    pub parent: u32,
    pub left: u32,
    pub right: u32,
    pub entry: Entry<K, V>,
    pub dirty: bool,
}

impl<K: Item, V: Item> Default for Node<K, V> {
    fn default() -> Self {
        Self {
            flags: 0,
            parent: 0,
            left: 0,
            right: 0,
            entry: Entry::default(),
            dirty: false,
        }
    }
}

impl<K: Item, V: Item> Node<K, V> {
    pub fn red(&self) -> bool {
        self.flags & FLAG_RED != 0
    }

    pub fn paint(&mut self, red: bool) {
        if red {
            self.flags |= FLAG_RED;
        } else {
            self.flags &= !FLAG_RED;
        }
    }

    /// Serializes the node into `buf` (`buf.len()` = node size).
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == NODE_HEADER_SIZE + self.entry.size(),
            "node buffer size {} does not match node size {}",
            buf.len(),
            NODE_HEADER_SIZE + self.entry.size()
        );

        let header = NodeHeader {
            flags: self.flags,
            parent: U32::new(self.parent),
            left: U32::new(self.left),
            right: U32::new(self.right),
        };
        buf[..NODE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.entry.encode(&mut buf[NODE_HEADER_SIZE..]);
        Ok(())
    }

    /// Decodes a node from `buf` (`buf.len()` = node size). Clean on return.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() >= NODE_HEADER_SIZE,
            "buffer too small for node header: {} < {}",
            buf.len(),
            NODE_HEADER_SIZE
        );

        let header = NodeHeader::ref_from_bytes(&buf[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read node header: {:?}", e))?;

        let key_size = K::default().size();
        Ok(Self {
            flags: header.flags,
            parent: header.parent.get(),
            left: header.left.get(),
            right: header.right.get(),
            entry: Entry::decode(&buf[NODE_HEADER_SIZE..], key_size),
            dirty: false,
        })
    }
}
