//! Raw pointer codec.
//!
//! Node slots are addressed by a 32-bit *raw pointer* that packs the byte
//! offset of the slot inside the file: `page_id * page_size + index *
//! node_size`. Zero can never name a valid slot (page 0 holds the metadata
//! record), so it is reserved as the invalid sentinel: splitting a zero raw
//! pointer is tree corruption and panics.

/// A raw pointer split into its page and slot coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePtr {
    pub page_id: u32,
    pub index: u16,
}

/// Slot geometry of one tree file: page size, node size, and the derived
/// number of node slots per page.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub page_size: u32,
    pub node_size: u32,
    pub degree: u16,
}

impl Geometry {
    pub fn new(page_size: u16, node_size: u16) -> Self {
        assert!(node_size > 0 && page_size >= node_size);
        Self {
            page_size: page_size as u32,
            node_size: node_size as u32,
            degree: page_size / node_size,
        }
    }

    /// Splits a raw pointer into (page, slot) coordinates.
    ///
    /// Panics on the invalid raw pointer 0: that value only ever appears
    /// through corrupted links, never through legitimate allocation.
    pub fn split(&self, raw: u32) -> NodePtr {
        assert!(raw != 0, "invalid raw pointer: dereferenced 0");
        NodePtr {
            page_id: raw / self.page_size,
            index: ((raw % self.page_size) / self.node_size) as u16,
        }
    }

    pub fn raw(&self, ptr: NodePtr) -> u32 {
        ptr.page_id * self.page_size + ptr.index as u32 * self.node_size
    }

    /// The slot after `ptr`, wrapping into slot 0 of the next page.
    pub fn bump(&self, ptr: NodePtr) -> NodePtr {
        if ptr.index == self.degree - 1 {
            NodePtr {
                page_id: ptr.page_id + 1,
                index: 0,
            }
        } else {
            NodePtr {
                page_id: ptr.page_id,
                index: ptr.index + 1,
            }
        }
    }

    /// The slot before `ptr`, wrapping onto the last slot of the previous page.
    pub fn retreat(&self, ptr: NodePtr) -> NodePtr {
        if ptr.index == 0 {
            NodePtr {
                page_id: ptr.page_id - 1,
                index: self.degree - 1,
            }
        } else {
            NodePtr {
                page_id: ptr.page_id,
                index: ptr.index - 1,
            }
        }
    }

    /// Whether `raw` lies on a slot boundary inside `[page_size, top)`.
    /// `null_ptr` is the first such slot; 0 is never valid.
    pub fn in_bounds(&self, raw: u32, top: u32) -> bool {
        raw >= self.page_size
            && raw < top
            && (raw % self.page_size) % self.node_size == 0
            && (raw % self.page_size) / self.node_size < self.degree as u32
    }
}
