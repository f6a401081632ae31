//! # Crimson - Paged Red-Black Tree Index
//!
//! Crimson is an embedded ordered key/value index persisted to a single
//! file. Nodes of a red-black tree are packed into fixed-size pages and
//! addressed by 32-bit raw pointers, so the whole structure round-trips
//! through a plain page-addressed file without any translation layer.
//!
//! - **Ordered**: keys sort by the lexicographic order of their canonical
//!   binary encoding; range scans walk in order from any lower bound
//! - **Dense**: freed node slots are recycled by swap-with-last relocation,
//!   so the file never accumulates holes and trailing pages are truncated
//! - **Typed**: keys and values are user types implementing the fixed-size
//!   [`Item`] codec
//!
//! ## Quick Start
//!
//! ```ignore
//! use crimson::{Entry, Tree, TreeOptions};
//!
//! let tree: Tree<u32, u64> = Tree::open("./users", TreeOptions::default())?;
//!
//! tree.insert(Entry::new(42, 1001))?;
//! let entry = tree.get(&42)?;
//!
//! tree.scan(0, |key, val| {
//!     println!("{key} -> {val}");
//!     Ok(false)
//! })?;
//!
//! tree.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Tree)            │  readers-writer lock
//! ├─────────────────────────────────────┤
//! │     Red-Black Engine (raw ptrs)     │  insert/delete/rotate/scan
//! ├─────────────────────────────────────┤
//! │  Slab Allocator │  Page Cache       │  bump top / swap-with-last
//! ├─────────────────────────────────────┤
//! │     Node & Page Codec (zerocopy)    │  big-endian records
//! ├─────────────────────────────────────┤
//! │     Pager (single .idx file)        │  alloc/free/read/write pages
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Durability
//!
//! Mutations are applied in memory and tracked by dirty flags; `insert` and
//! `delete` flush on return while `insert_mem`/`delete_mem` defer to an
//! explicit [`Tree::write_all`]. There is no journal: a crash between page
//! writes can leave the file inconsistent, so callers that need a stable
//! image must quiesce writers and flush first.
//!
//! ## Concurrency
//!
//! A `Tree` is `Send + Sync`; share it across threads as-is or behind an
//! `Arc`. One readers-writer lock serializes writers against everything;
//! readers run concurrently and see each write either fully applied or not
//! at all.

pub mod entry;
pub mod error;
pub mod storage;
pub mod tree;

pub use entry::{Entry, Item};
pub use error::TreeError;
pub use tree::{Tree, TreeOptions, DEFAULT_PAGE_SIZE};
