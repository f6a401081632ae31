//! # Paged Red-Black Tree
//!
//! The tree engine operates on raw pointers, never on memory addresses: every
//! node access decodes the pointer into (page, slot) coordinates and goes
//! through the page cache. The accessor layer at the bottom of `TreeInner`
//! (`left`/`right`/`parent`/`red`/`entry` and their setters) keeps each node
//! touch to a single short page-lock hold, and every setter marks the node
//! dirty so the flush pass knows what to write back.
//!
//! ## Algorithm
//!
//! Standard CLRS red-black insert and delete: BST descent by encoded-key
//! comparison, insert fix-up over the uncle's color, delete via transplant
//! and in-order successor with the four-case fix-up loop. The BLACK leaf
//! sentinel (`null_ptr`) is a live node slot; delete fix-up transiently
//! writes its parent link, which is legal because the sentinel's slot is
//! owned by this tree and never read outside the fix-up window.
//!
//! ## Slot Recycling
//!
//! Allocation bumps `top`; freeing slot `p` relocates the node at `top - 1`
//! into `p` (rewiring its parent, both children, and the root pointer when
//! the moved node is the root), then retreats `top`. Slots therefore stay
//! densely packed, and when the file holds more than one page past `top`'s
//! page the trailing page is truncated and evicted from the cache.
//!
//! ## Concurrency
//!
//! One readers-writer lock around the whole tree: `insert*`, `delete*`,
//! `write_all`, and `close` take it exclusively; `get`, `scan`, `count`,
//! `dump`, and `verify` share it. Readers that miss the page cache block on
//! pager I/O while holding the shared lock.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{ensure, eyre, Result, WrapErr};
use parking_lot::RwLock;
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::entry::{Entry, Item};
use crate::error::TreeError;
use crate::storage::{Pager, INDEX_FILE_EXTENSION};
use crate::tree::cache::PageCache;
use crate::tree::meta::{Metadata, META_SIZE};
use crate::tree::node::{Node, NODE_HEADER_SIZE};
use crate::tree::pointer::Geometry;
use crate::tree::TreeOptions;

type KeyBuf = SmallVec<[u8; 32]>;

/// An ordered key/value index persisted to a single `.idx` file.
///
/// Cloneable handles are not provided; share a `Tree` across threads behind
/// an `Arc`. Constructing two trees over the same file is undefined.
#[derive(Debug)]
pub struct Tree<K: Item, V: Item> {
    inner: RwLock<TreeInner<K, V>>,
}

#[derive(Debug)]
struct TreeInner<K: Item, V: Item> {
    pager: Option<Pager>,
    path: PathBuf,
    cache: PageCache<K, V>,
    meta: Metadata,
    geo: Geometry,
}

enum Seek {
    Found(u32),
    /// Not present; carries the lower bound (the deepest node whose key
    /// exceeds the target), or `null_ptr` when no key is greater.
    Missing(u32),
}

impl<K: Item, V: Item> Tree<K, V> {
    /// Opens (or creates) the index file `<stem>.idx`.
    ///
    /// A fresh file is initialized with the metadata page and the BLACK leaf
    /// sentinel. An existing file must have been created with the same page
    /// size and the same key/value encoding sizes.
    pub fn open<P: AsRef<Path>>(stem: P, opts: TreeOptions) -> Result<Self> {
        let path = stem.as_ref().with_extension(INDEX_FILE_EXTENSION);

        let key_size = K::default().size();
        let val_size = V::default().size();
        let node_size = NODE_HEADER_SIZE + key_size + val_size;
        ensure!(
            key_size > 0 && key_size <= u16::MAX as usize,
            "key encoding size {} is out of range",
            key_size
        );
        ensure!(
            val_size <= u16::MAX as usize,
            "value encoding size {} is out of range",
            val_size
        );
        ensure!(
            node_size <= opts.page_size as usize && META_SIZE <= opts.page_size as usize,
            "page size {} is too small for {}-byte nodes",
            opts.page_size,
            node_size
        );

        let geo = Geometry::new(opts.page_size, node_size as u16);
        let pager = Pager::open(&path, opts.page_size, opts.read_only)
            .wrap_err("failed to open tree")?;

        let mut inner = TreeInner {
            pager: Some(pager),
            path,
            cache: PageCache::new(geo.degree),
            meta: Metadata::init(opts.page_size, key_size as u16, val_size as u16),
            geo,
        };

        if inner.pager()?.page_count() == 0 {
            inner.init().wrap_err("failed to initialize tree")?;
        } else {
            inner.load_meta(opts.page_size).wrap_err("failed to open tree")?;
        }

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Inserts an entry and flushes dirty pages. Fails with
    /// [`TreeError::KeyAlreadyExists`] on a duplicate key.
    pub fn insert(&self, entry: Entry<K, V>) -> Result<()> {
        let mut inner = self.inner.write();
        inner.insert_mem(entry)?;
        inner.write_all().wrap_err("failed to flush after insert")
    }

    /// Inserts an entry in memory only; [`Tree::write_all`] persists it.
    pub fn insert_mem(&self, entry: Entry<K, V>) -> Result<()> {
        self.inner.write().insert_mem(entry)
    }

    /// Point lookup. Fails with [`TreeError::NotFound`] for absent keys.
    pub fn get(&self, key: &K) -> Result<Entry<K, V>> {
        self.inner.read().get(key)
    }

    /// Deletes a key and flushes dirty pages. Fails with
    /// [`TreeError::NotFound`] for absent keys.
    pub fn delete(&self, key: &K) -> Result<()> {
        let mut inner = self.inner.write();
        inner.delete_mem(key)?;
        inner.write_all().wrap_err("failed to flush after delete")
    }

    /// Deletes a key in memory only; [`Tree::write_all`] persists it.
    pub fn delete_mem(&self, key: &K) -> Result<()> {
        self.inner.write().delete_mem(key)
    }

    /// In-order traversal starting at the first key `>= from`, or at the
    /// minimum when `from.is_nil()`.
    ///
    /// The callback returns `Ok(true)` to stop early; an `Err` aborts the
    /// scan and propagates. The shared lock is held for the whole traversal,
    /// so the callback must not reenter the tree.
    pub fn scan<F>(&self, from: K, mut f: F) -> Result<()>
    where
        F: FnMut(&K, &V) -> Result<bool>,
    {
        self.inner.read().scan(from, &mut f)
    }

    /// Number of live keys.
    pub fn count(&self) -> u32 {
        self.inner.read().meta.count
    }

    /// Flushes every dirty page and the metadata record. No-op when the
    /// pager is read-only.
    pub fn write_all(&self) -> Result<()> {
        self.inner.write().write_all()
    }

    /// Flushes and releases the pager. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.inner.write().close()
    }

    /// Deletes the backing index file.
    pub fn remove(self) -> Result<()> {
        self.inner.into_inner().remove()
    }

    /// Renders the tree sideways (right subtree on top), one node per line
    /// with its color. Debug aid.
    pub fn dump(&self) -> Result<String> {
        self.inner.read().dump()
    }

    /// Walks the whole tree and checks its structural invariants: red-black
    /// coloring, black-height balance, parent/child link coherence, key
    /// ordering, and pointer bounds against the allocation frontier.
    pub fn verify(&self) -> Result<()> {
        self.inner.read().verify()
    }
}

impl<K: Item, V: Item> TreeInner<K, V> {
    fn pager(&self) -> Result<&Pager> {
        self.pager.as_ref().ok_or_else(|| eyre!("tree is closed"))
    }

    fn pager_mut(&mut self) -> Result<&mut Pager> {
        self.pager.as_mut().ok_or_else(|| eyre!("tree is closed"))
    }

    // ---- node accessors -------------------------------------------------

    fn with_node<R>(&self, raw: u32, f: impl FnOnce(&Node<K, V>) -> R) -> Result<R> {
        let ptr = self.geo.split(raw);
        let page = self.cache.fetch(ptr.page_id, self.pager()?)?;
        let page = page.read();
        Ok(f(&page.nodes[ptr.index as usize]))
    }

    fn update_node<R>(&mut self, raw: u32, f: impl FnOnce(&mut Node<K, V>) -> R) -> Result<R> {
        let ptr = self.geo.split(raw);
        let page = self.cache.fetch(ptr.page_id, self.pager()?)?;
        let mut page = page.write();
        let node = &mut page.nodes[ptr.index as usize];
        let out = f(node);
        node.dirty = true;
        Ok(out)
    }

    fn left(&self, p: u32) -> Result<u32> {
        self.with_node(p, |n| n.left)
    }

    fn right(&self, p: u32) -> Result<u32> {
        self.with_node(p, |n| n.right)
    }

    fn parent(&self, p: u32) -> Result<u32> {
        self.with_node(p, |n| n.parent)
    }

    fn red(&self, p: u32) -> Result<bool> {
        self.with_node(p, |n| n.red())
    }

    fn set_left(&mut self, p: u32, v: u32) -> Result<()> {
        self.update_node(p, |n| n.left = v)
    }

    fn set_right(&mut self, p: u32, v: u32) -> Result<()> {
        self.update_node(p, |n| n.right = v)
    }

    fn set_parent(&mut self, p: u32, v: u32) -> Result<()> {
        self.update_node(p, |n| n.parent = v)
    }

    fn paint(&mut self, p: u32, red: bool) -> Result<()> {
        self.update_node(p, |n| n.paint(red))
    }

    fn key_bytes(&self, p: u32) -> Result<KeyBuf> {
        self.with_node(p, |n| {
            let mut buf: KeyBuf = smallvec![0u8; n.entry.key.size()];
            n.entry.key.encode(&mut buf);
            buf
        })
    }

    /// Compares node `p`'s key against an already-encoded target key.
    fn cmp_node_key(&self, p: u32, target: &[u8]) -> Result<Ordering> {
        self.with_node(p, |n| {
            let mut buf: KeyBuf = smallvec![0u8; n.entry.key.size()];
            n.entry.key.encode(&mut buf);
            buf.as_slice().cmp(target)
        })
    }

    fn check_key_size(&self, key: &K) -> Result<()> {
        let required = self.meta.key_size as usize;
        let got = key.size();
        if got != required {
            return Err(TreeError::InvalidKeySize { required, got }.into());
        }
        Ok(())
    }

    fn check_val_size(&self, val: &V) -> Result<()> {
        let required = self.meta.val_size as usize;
        let got = val.size();
        if got != required {
            return Err(TreeError::InvalidKeySize { required, got }.into());
        }
        Ok(())
    }

    // ---- open/init ------------------------------------------------------

    fn init(&mut self) -> Result<()> {
        self.pager_mut()?.alloc(1)?; // page 0: metadata

        let sentinel = self.alloc()?;
        self.update_node(sentinel, |n| n.paint(false))?;
        self.meta.null_ptr = sentinel;
        self.meta.root_ptr = sentinel;
        self.meta.dirty = true;

        self.write_all()?;
        debug!(path = %self.path.display(), "initialized index file");
        Ok(())
    }

    fn load_meta(&mut self, page_size: u16) -> Result<()> {
        let mut buf = vec![0u8; page_size as usize];
        self.pager()?.read_page(0, &mut buf)?;

        let meta = Metadata::read_from(&buf)?;
        meta.validate::<K, V>(page_size)?;
        self.meta = meta;
        Ok(())
    }

    // ---- slab allocator -------------------------------------------------

    /// Hands out the slot at `top` and bumps the frontier, growing the file
    /// by one page when `top` sits at slot 0 of a page the pager does not
    /// hold yet (it may already hold it: `free` keeps one empty trailing
    /// page around).
    fn alloc(&mut self) -> Result<u32> {
        let top = self.meta.top;
        let ptr = self.geo.split(top);

        if ptr.index == 0 && self.pager()?.page_count() <= ptr.page_id {
            let first = self.pager_mut()?.alloc(1)?;
            debug_assert_eq!(first, ptr.page_id);
        }

        self.meta.top = self.geo.raw(self.geo.bump(ptr));
        self.meta.dirty = true;
        Ok(top)
    }

    /// Recycles slot `p` by relocating the topmost slot into it, then
    /// retreats `top` and truncates the file once it holds more than one
    /// page past the new frontier.
    fn free(&mut self, p: u32) -> Result<()> {
        let null = self.meta.null_ptr;
        let last = self.geo.raw(self.geo.retreat(self.geo.split(self.meta.top)));

        if p != last {
            let moved = self.with_node(last, |n| n.clone())?;

            if last == self.meta.root_ptr {
                self.meta.root_ptr = p;
                self.meta.dirty = true;
            } else if self.left(moved.parent)? == last {
                self.set_left(moved.parent, p)?;
            } else {
                self.set_right(moved.parent, p)?;
            }

            self.update_node(p, |n| {
                n.flags = moved.flags;
                n.parent = moved.parent;
                n.left = moved.left;
                n.right = moved.right;
                n.entry = moved.entry;
            })?;

            if moved.left != null {
                self.set_parent(moved.left, p)?;
            }
            if moved.right != null {
                self.set_parent(moved.right, p)?;
            }
        }

        // The stale slot is now outside the live range; poison it in debug
        // builds so a dangling pointer shows up as a zeroed node.
        #[cfg(debug_assertions)]
        self.update_node(last, |n| *n = Node::default())?;

        self.meta.top = last;
        self.meta.dirty = true;

        let top_page = self.geo.split(last).page_id;
        if self.pager()?.page_count() > top_page + 1 {
            self.pager_mut()?.free(1)?;
            self.cache.evict(top_page + 1);
            debug!(page = top_page + 1, "truncated trailing page");
        }
        Ok(())
    }

    // ---- lookup ---------------------------------------------------------

    fn seek(&self, key: &K) -> Result<Seek> {
        let null = self.meta.null_ptr;
        let mut target: KeyBuf = smallvec![0u8; key.size()];
        key.encode(&mut target);

        let mut last_greater = null;
        let mut cur = self.meta.root_ptr;
        while cur != null {
            match self.cmp_node_key(cur, &target)? {
                Ordering::Less => cur = self.right(cur)?,
                Ordering::Greater => {
                    last_greater = cur;
                    cur = self.left(cur)?;
                }
                Ordering::Equal => return Ok(Seek::Found(cur)),
            }
        }
        Ok(Seek::Missing(last_greater))
    }

    fn get(&self, key: &K) -> Result<Entry<K, V>> {
        self.check_key_size(key)?;
        match self.seek(key)? {
            Seek::Found(p) => self.with_node(p, |n| n.entry.clone()),
            Seek::Missing(_) => Err(TreeError::NotFound.into()),
        }
    }

    fn scan<F>(&self, from: K, f: &mut F) -> Result<()>
    where
        F: FnMut(&K, &V) -> Result<bool>,
    {
        let null = self.meta.null_ptr;
        if self.meta.root_ptr == null {
            return Ok(());
        }

        // Seed the stack with the in-order visit path. For a keyed scan
        // that is every node on the descent whose key exceeds the target:
        // popping them in reverse order continues the traversal through
        // the greater ancestors once a subtree is exhausted.
        let mut stack: SmallVec<[u32; 32]> = SmallVec::with_capacity(self.height());
        if from.is_nil() {
            let mut cur = self.meta.root_ptr;
            while cur != null {
                stack.push(cur);
                cur = self.left(cur)?;
            }
        } else {
            self.check_key_size(&from)?;
            let mut target: KeyBuf = smallvec![0u8; from.size()];
            from.encode(&mut target);

            let mut cur = self.meta.root_ptr;
            while cur != null {
                match self.cmp_node_key(cur, &target)? {
                    Ordering::Less => cur = self.right(cur)?,
                    Ordering::Greater => {
                        stack.push(cur);
                        cur = self.left(cur)?;
                    }
                    Ordering::Equal => {
                        stack.push(cur);
                        break;
                    }
                }
            }
        }

        while let Some(cur) = stack.pop() {
            let entry = self.with_node(cur, |n| n.entry.clone())?;
            if f(&entry.key, &entry.val)? {
                return Ok(());
            }

            let mut next = self.right(cur)?;
            while next != null {
                stack.push(next);
                next = self.left(next)?;
            }
        }
        Ok(())
    }

    /// Worst-case red-black tree height, `2 * ceil(log2(count)) + 1`.
    fn height(&self) -> usize {
        let count = self.meta.count;
        let ceil_log2 = if count <= 1 {
            0
        } else {
            ((count - 1).ilog2() + 1) as usize
        };
        2 * ceil_log2 + 1
    }

    // ---- mutation -------------------------------------------------------

    fn insert_mem(&mut self, entry: Entry<K, V>) -> Result<()> {
        self.check_key_size(&entry.key)?;
        self.check_val_size(&entry.val)?;

        if let Seek::Found(_) = self.seek(&entry.key)? {
            return Err(TreeError::KeyAlreadyExists.into());
        }

        let null = self.meta.null_ptr;
        let z = self.alloc()?;
        self.update_node(z, |n| {
            n.parent = null;
            n.left = null;
            n.right = null;
            n.paint(true);
            n.entry = entry;
        })?;
        self.bst_insert(z)
    }

    fn delete_mem(&mut self, key: &K) -> Result<()> {
        self.check_key_size(key)?;
        match self.seek(key)? {
            Seek::Found(p) => self.rb_delete(p),
            Seek::Missing(_) => Err(TreeError::NotFound.into()),
        }
    }

    fn bst_insert(&mut self, z: u32) -> Result<()> {
        let null = self.meta.null_ptr;
        let zk = self.key_bytes(z)?;

        let mut y = null;
        let mut cur = self.meta.root_ptr;
        while cur != null {
            y = cur;
            cur = match self.cmp_node_key(cur, &zk)? {
                Ordering::Greater => self.left(cur)?,
                _ => self.right(cur)?,
            };
        }

        self.set_parent(z, y)?;
        if y == null {
            self.meta.root_ptr = z;
            self.meta.dirty = true;
        } else if self.cmp_node_key(y, &zk)? == Ordering::Greater {
            self.set_left(y, z)?;
        } else {
            self.set_right(y, z)?;
        }

        self.fix_insert(z)?;

        self.meta.count += 1;
        self.meta.dirty = true;
        Ok(())
    }

    fn fix_insert(&mut self, mut z: u32) -> Result<()> {
        while self.red(self.parent(z)?)? {
            let p = self.parent(z)?;
            let g = self.parent(p)?;

            if p == self.left(g)? {
                let uncle = self.right(g)?;
                if self.red(uncle)? {
                    self.paint(p, false)?;
                    self.paint(uncle, false)?;
                    self.paint(g, true)?;
                    z = g;
                } else {
                    if z == self.right(p)? {
                        z = p;
                        self.left_rotate(z)?;
                    }
                    let p = self.parent(z)?;
                    let g = self.parent(p)?;
                    self.paint(p, false)?;
                    self.paint(g, true)?;
                    self.right_rotate(g)?;
                }
            } else {
                let uncle = self.left(g)?;
                if self.red(uncle)? {
                    self.paint(p, false)?;
                    self.paint(uncle, false)?;
                    self.paint(g, true)?;
                    z = g;
                } else {
                    if z == self.left(p)? {
                        z = p;
                        self.right_rotate(z)?;
                    }
                    let p = self.parent(z)?;
                    let g = self.parent(p)?;
                    self.paint(p, false)?;
                    self.paint(g, true)?;
                    self.left_rotate(g)?;
                }
            }
        }

        let root = self.meta.root_ptr;
        self.paint(root, false)
    }

    fn rb_delete(&mut self, z: u32) -> Result<()> {
        let null = self.meta.null_ptr;
        let mut removed_black = !self.red(z)?;
        let x;

        if self.left(z)? == null {
            x = self.right(z)?;
            self.transplant(z, x)?;
        } else if self.right(z)? == null {
            x = self.left(z)?;
            self.transplant(z, x)?;
        } else {
            let y = self.minimum(self.right(z)?)?;
            removed_black = !self.red(y)?;
            x = self.right(y)?;

            if self.parent(y)? == z {
                // x may be the null sentinel; its parent link is written
                // anyway so the fix-up can climb from it.
                self.set_parent(x, y)?;
            } else {
                self.transplant(y, x)?;
                let zr = self.right(z)?;
                self.set_right(y, zr)?;
                self.set_parent(zr, y)?;
            }

            self.transplant(z, y)?;
            let zl = self.left(z)?;
            self.set_left(y, zl)?;
            self.set_parent(zl, y)?;
            let z_red = self.red(z)?;
            self.paint(y, z_red)?;
        }

        if removed_black {
            self.fix_delete(x)?;
        }

        self.free(z)?;
        self.meta.count -= 1;
        self.meta.dirty = true;
        Ok(())
    }

    fn fix_delete(&mut self, mut x: u32) -> Result<()> {
        while x != self.meta.root_ptr && !self.red(x)? {
            let xp = self.parent(x)?;

            if x == self.left(xp)? {
                let mut w = self.right(xp)?;

                if self.red(w)? {
                    self.paint(w, false)?;
                    self.paint(xp, true)?;
                    self.left_rotate(xp)?;
                    w = self.right(self.parent(x)?)?;
                }

                if !self.red(self.left(w)?)? && !self.red(self.right(w)?)? {
                    self.paint(w, true)?;
                    x = self.parent(x)?;
                } else {
                    if !self.red(self.right(w)?)? {
                        let wl = self.left(w)?;
                        self.paint(wl, false)?;
                        self.paint(w, true)?;
                        self.right_rotate(w)?;
                        w = self.right(self.parent(x)?)?;
                    }

                    let xp = self.parent(x)?;
                    let xp_red = self.red(xp)?;
                    self.paint(w, xp_red)?;
                    self.paint(xp, false)?;
                    let wr = self.right(w)?;
                    self.paint(wr, false)?;
                    self.left_rotate(xp)?;
                    x = self.meta.root_ptr;
                }
            } else {
                let mut w = self.left(xp)?;

                if self.red(w)? {
                    self.paint(w, false)?;
                    self.paint(xp, true)?;
                    self.right_rotate(xp)?;
                    w = self.left(self.parent(x)?)?;
                }

                if !self.red(self.right(w)?)? && !self.red(self.left(w)?)? {
                    self.paint(w, true)?;
                    x = self.parent(x)?;
                } else {
                    if !self.red(self.left(w)?)? {
                        let wr = self.right(w)?;
                        self.paint(wr, false)?;
                        self.paint(w, true)?;
                        self.left_rotate(w)?;
                        w = self.left(self.parent(x)?)?;
                    }

                    let xp = self.parent(x)?;
                    let xp_red = self.red(xp)?;
                    self.paint(w, xp_red)?;
                    self.paint(xp, false)?;
                    let wl = self.left(w)?;
                    self.paint(wl, false)?;
                    self.right_rotate(xp)?;
                    x = self.meta.root_ptr;
                }
            }
        }

        self.paint(x, false)
    }

    fn minimum(&self, mut x: u32) -> Result<u32> {
        let null = self.meta.null_ptr;
        loop {
            let left = self.left(x)?;
            if left == null {
                return Ok(x);
            }
            x = left;
        }
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v` by
    /// rewiring `u`'s parent. `v` may be the null sentinel.
    fn transplant(&mut self, u: u32, v: u32) -> Result<()> {
        let null = self.meta.null_ptr;
        let up = self.parent(u)?;

        if up == null {
            self.meta.root_ptr = v;
            self.meta.dirty = true;
        } else if self.left(up)? == u {
            self.set_left(up, v)?;
        } else {
            self.set_right(up, v)?;
        }

        self.set_parent(v, up)
    }

    fn left_rotate(&mut self, x: u32) -> Result<()> {
        let null = self.meta.null_ptr;
        let y = self.right(x)?;
        let yl = self.left(y)?;

        self.set_right(x, yl)?;
        if yl != null {
            self.set_parent(yl, x)?;
        }

        let xp = self.parent(x)?;
        self.set_parent(y, xp)?;
        if xp == null {
            self.meta.root_ptr = y;
            self.meta.dirty = true;
        } else if self.left(xp)? == x {
            self.set_left(xp, y)?;
        } else {
            self.set_right(xp, y)?;
        }

        self.set_left(y, x)?;
        self.set_parent(x, y)
    }

    fn right_rotate(&mut self, x: u32) -> Result<()> {
        let null = self.meta.null_ptr;
        let y = self.left(x)?;
        let yr = self.right(y)?;

        self.set_left(x, yr)?;
        if yr != null {
            self.set_parent(yr, x)?;
        }

        let xp = self.parent(x)?;
        self.set_parent(y, xp)?;
        if xp == null {
            self.meta.root_ptr = y;
            self.meta.dirty = true;
        } else if self.right(xp)? == x {
            self.set_right(xp, y)?;
        } else {
            self.set_left(xp, y)?;
        }

        self.set_right(y, x)?;
        self.set_parent(x, y)
    }

    // ---- persistence ----------------------------------------------------

    fn write_all(&mut self) -> Result<()> {
        let pager = self.pager.as_mut().ok_or_else(|| eyre!("tree is closed"))?;
        if pager.read_only() {
            return Ok(());
        }

        let mut buf = vec![0u8; pager.page_size() as usize];
        let mut flushed = 0u32;

        for handle in self.cache.snapshot() {
            let mut page = handle.write();
            if page.consolidate_dirty() {
                page.write_to(&mut buf)?;
                pager
                    .write_page(page.id, &buf)
                    .wrap_err("failed to marshal dirty page")?;
                page.dirty = false;
                flushed += 1;
            }
        }

        if self.meta.dirty {
            buf.fill(0);
            self.meta.write_to(&mut buf)?;
            pager
                .write_page(0, &buf)
                .wrap_err("failed to marshal metadata")?;
            self.meta.dirty = false;
            flushed += 1;
        }

        if flushed > 0 {
            debug!(pages = flushed, "flushed dirty pages");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.pager.is_none() {
            return Ok(());
        }
        self.write_all()?;
        if let Some(pager) = self.pager.take() {
            pager.sync()?;
        }
        Ok(())
    }

    fn remove(mut self) -> Result<()> {
        match self.pager.take() {
            Some(pager) => pager.remove(),
            None => fs::remove_file(&self.path)
                .wrap_err_with(|| format!("failed to remove '{}'", self.path.display())),
        }
    }

    // ---- introspection --------------------------------------------------

    fn dump(&self) -> Result<String> {
        let mut out = String::new();
        self.dump_node(self.meta.root_ptr, 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(&self, p: u32, depth: usize, out: &mut String) -> Result<()> {
        if p == self.meta.null_ptr {
            return Ok(());
        }

        self.dump_node(self.right(p)?, depth + 1, out)?;

        let (entry, red) = self.with_node(p, |n| (n.entry.clone(), n.red()))?;
        out.push_str(&format!(
            "{:indent$}{:?}={:?} ({})\n",
            "",
            entry.key,
            entry.val,
            if red { "R" } else { "B" },
            indent = depth * 4
        ));

        self.dump_node(self.left(p)?, depth + 1, out)
    }

    fn verify(&self) -> Result<()> {
        let null = self.meta.null_ptr;
        ensure!(!self.red(null)?, "null sentinel is red");

        if self.meta.root_ptr == null {
            ensure!(
                self.meta.count == 0,
                "empty tree reports count {}",
                self.meta.count
            );
            return Ok(());
        }

        ensure!(self.meta.count > 0, "non-empty tree reports count 0");
        ensure!(!self.red(self.meta.root_ptr)?, "root is red");
        ensure!(
            self.parent(self.meta.root_ptr)? == null,
            "root has a parent"
        );

        let mut visited = 0u32;
        let mut prev: Option<KeyBuf> = None;
        self.verify_node(self.meta.root_ptr, &mut prev, &mut visited)?;
        ensure!(
            visited == self.meta.count,
            "reachable nodes {} != count {}",
            visited,
            self.meta.count
        );
        Ok(())
    }

    /// Returns the black-height of the subtree at `p`, checking coloring,
    /// link coherence, pointer bounds, and in-order key order on the way.
    fn verify_node(
        &self,
        p: u32,
        prev: &mut Option<KeyBuf>,
        visited: &mut u32,
    ) -> Result<u32> {
        let null = self.meta.null_ptr;
        if p == null {
            return Ok(1);
        }

        ensure!(
            self.geo.in_bounds(p, self.meta.top),
            "pointer {} is outside the allocated slots",
            p
        );
        *visited += 1;
        ensure!(
            *visited <= self.meta.count,
            "more reachable nodes than count {}",
            self.meta.count
        );

        let node = self.with_node(p, |n| n.clone())?;

        if node.red() {
            ensure!(
                !self.red(node.left)? && !self.red(node.right)?,
                "red node {} has a red child",
                p
            );
        }
        for child in [node.left, node.right] {
            if child != null {
                ensure!(
                    self.parent(child)? == p,
                    "child {} does not link back to {}",
                    child,
                    p
                );
            }
        }

        let left_height = self.verify_node(node.left, prev, visited)?;

        let key = self.key_bytes(p)?;
        if let Some(prev_key) = prev {
            ensure!(
                prev_key.as_slice() < key.as_slice(),
                "keys out of order at node {}",
                p
            );
        }
        *prev = Some(key);

        let right_height = self.verify_node(node.right, prev, visited)?;

        ensure!(
            left_height == right_height,
            "black-height mismatch at node {}: {} vs {}",
            p,
            left_height,
            right_height
        );
        Ok(left_height + if node.red() { 0 } else { 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_tree(dir: &tempfile::TempDir) -> Tree<u32, u32> {
        Tree::open(
            dir.path().join("t"),
            TreeOptions {
                page_size: 256,
                read_only: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn init_wires_the_sentinel() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        let inner = tree.inner.read();

        assert_eq!(inner.meta.null_ptr, 256);
        assert_eq!(inner.meta.root_ptr, inner.meta.null_ptr);
        assert_eq!(inner.meta.top, 256 + 21);
        assert_eq!(inner.meta.count, 0);
        assert!(!inner.red(inner.meta.null_ptr).unwrap());
    }

    #[test]
    fn first_insert_becomes_black_root() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        tree.insert_mem(Entry::new(7, 70)).unwrap();

        let inner = tree.inner.read();
        let root = inner.meta.root_ptr;
        assert_ne!(root, inner.meta.null_ptr);
        assert!(!inner.red(root).unwrap());
        assert_eq!(
            inner.with_node(root, |n| n.entry.clone()).unwrap(),
            Entry::new(7, 70)
        );
    }

    #[test]
    fn freeing_a_non_last_slot_relocates_the_top_node() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for k in 1..=5u32 {
            tree.insert_mem(Entry::new(k, k * 10)).unwrap();
        }

        // key 1 sits in an interior slot; its slot must be recycled by the
        // node from the top of the slab without breaking the tree
        let top_before = tree.inner.read().meta.top;
        tree.delete_mem(&1).unwrap();

        let inner = tree.inner.read();
        assert_eq!(inner.meta.top, top_before - 21);
        drop(inner);

        tree.verify().unwrap();
        for k in 2..=5u32 {
            assert_eq!(tree.get(&k).unwrap().val, k * 10);
        }
    }

    #[test]
    fn seek_misses_carry_the_lower_bound() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for k in [10u32, 20, 30, 40, 50] {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        let inner = tree.inner.read();
        match inner.seek(&25).unwrap() {
            Seek::Missing(lower) => {
                let key = inner.with_node(lower, |n| n.entry.key).unwrap();
                assert_eq!(key, 30);
            }
            Seek::Found(_) => panic!("25 must not be found"),
        }

        match inner.seek(&99).unwrap() {
            Seek::Missing(lower) => assert_eq!(lower, inner.meta.null_ptr),
            Seek::Found(_) => panic!("99 must not be found"),
        }
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_writes() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        tree.insert_mem(Entry::new(1, 1)).unwrap();

        tree.close().unwrap();
        tree.close().unwrap();

        let err = tree.insert_mem(Entry::new(2, 2)).unwrap_err();
        assert!(err.to_string().contains("closed"), "{err}");
    }

    #[test]
    fn dump_renders_one_line_per_key() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for k in [2u32, 1, 3] {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        let rendered = tree.dump().unwrap();
        assert_eq!(rendered.lines().count(), 3);
        assert!(rendered.contains("2=2 (B)"));
    }
}
