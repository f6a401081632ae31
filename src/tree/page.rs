//! # Node Pages
//!
//! Every page except page 0 is an array of `degree` node slots laid out back
//! to back from offset 0; the tail bytes past `degree * node_size` are
//! unused padding:
//!
//! ```text
//! +--------------------------------------------+
//! | slot 0 | slot 1 | ... | slot degree-1 | pad|
//! +--------------------------------------------+
//! ```
//!
//! A page is the unit of I/O; nodes are the unit of mutation. Both carry a
//! dirty flag: mutations flip the node flag, and the flush pass folds node
//! dirt into the page flag before marshaling the whole page.

use eyre::Result;

use crate::entry::Item;
use crate::tree::node::Node;

#[derive(Debug)]
pub struct Page<K, V> {
    pub id: u32,
    pub dirty: bool,
    pub nodes: Vec<Node<K, V>>,
}

impl<K: Item, V: Item> Page<K, V> {
    /// A clean page of `degree` zeroed slots.
    pub fn new(id: u32, degree: u16) -> Self {
        Self {
            id,
            dirty: false,
            nodes: vec![Node::default(); degree as usize],
        }
    }

    fn node_size(&self) -> usize {
        crate::tree::node::NODE_HEADER_SIZE + K::default().size() + V::default().size()
    }

    /// Marshals all slots into a page-size buffer.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        let node_size = self.node_size();
        for (i, node) in self.nodes.iter().enumerate() {
            let offset = i * node_size;
            node.write_to(&mut buf[offset..offset + node_size])?;
        }
        Ok(())
    }

    /// Unmarshals all slots from a page-size buffer; the page comes back clean.
    pub fn read_from(&mut self, buf: &[u8]) -> Result<()> {
        let node_size = self.node_size();
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            let offset = i * node_size;
            *slot = Node::read_from(&buf[offset..offset + node_size])?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Folds node-level dirt into the page flag and clears the node flags.
    /// Returns whether the page needs to be written out.
    pub fn consolidate_dirty(&mut self) -> bool {
        for node in &mut self.nodes {
            if node.dirty {
                self.dirty = true;
                node.dirty = false;
            }
        }
        self.dirty
    }
}
