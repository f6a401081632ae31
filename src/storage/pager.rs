//! # File-Backed Pager
//!
//! `Pager` maps a single file to a zero-based array of fixed-size pages. The
//! page size is chosen when the file is created and must be used for every
//! subsequent open; the pager validates that the file length is an exact
//! multiple of it.
//!
//! ## File Format
//!
//! Pages are simply concatenated:
//!
//! ```text
//! Offset 0:              Page 0
//! Offset page_size:      Page 1
//! Offset 2 * page_size:  Page 2
//! ...
//! ```
//!
//! ## Allocation Model
//!
//! The file only ever grows or shrinks at the tail: [`Pager::alloc`] extends
//! it by `n` zero-filled pages, [`Pager::free`] truncates the trailing `n`
//! pages. There is no free list; keeping the live pages contiguous is the
//! caller's job (the tree layer does it with swap-with-last slot recycling).
//!
//! ## Read-Only Mode
//!
//! A pager opened read-only rejects `alloc`, `free`, and `write_page`. The
//! tree layer checks [`Pager::read_only`] and turns its flush into a no-op
//! instead of tripping these errors.
//!
//! ## Thread Safety
//!
//! `read_page` takes `&self` (positioned reads do not disturb shared state),
//! so concurrent readers are fine. Everything that changes the file takes
//! `&mut self`; the tree layer's readers-writer lock provides the exclusion.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

#[derive(Debug)]
pub struct Pager {
    file: File,
    path: PathBuf,
    page_size: u32,
    page_count: u32,
    read_only: bool,
}

impl Pager {
    /// Opens `path`, creating an empty file when it does not exist (unless
    /// `read_only`). An existing file must have a length that is a multiple
    /// of `page_size`.
    pub fn open<P: AsRef<Path>>(path: P, page_size: u16, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        ensure!(page_size > 0, "page size must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size % page_size as u64 == 0,
            "index file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        let page_count = (file_size / page_size as u64) as u32;

        debug!(
            path = %path.display(),
            page_size,
            page_count,
            read_only,
            "opened pager"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: page_size as u32,
            page_count,
            read_only,
        })
    }

    /// Extends the file by `n` zero-filled pages; returns the first new page id.
    pub fn alloc(&mut self, n: u32) -> Result<u32> {
        ensure!(!self.read_only, "cannot alloc pages on a read-only pager");

        let first = self.page_count;
        let new_count = self.page_count + n;

        self.file
            .set_len(new_count as u64 * self.page_size as u64)
            .wrap_err_with(|| format!("failed to grow '{}' to {} pages", self.path.display(), new_count))?;

        self.page_count = new_count;
        Ok(first)
    }

    /// Truncates the trailing `n` pages.
    pub fn free(&mut self, n: u32) -> Result<()> {
        ensure!(!self.read_only, "cannot free pages on a read-only pager");
        ensure!(
            n <= self.page_count,
            "cannot free {} pages, file has {}",
            n,
            self.page_count
        );

        let new_count = self.page_count - n;

        self.file
            .set_len(new_count as u64 * self.page_size as u64)
            .wrap_err_with(|| {
                format!("failed to truncate '{}' to {} pages", self.path.display(), new_count)
            })?;

        self.page_count = new_count;
        Ok(())
    }

    /// Reads page `id` into `buf` (`buf.len()` must equal the page size).
    pub fn read_page(&self, id: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            id < self.page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.page_count
        );
        ensure!(
            buf.len() == self.page_size as usize,
            "page buffer size {} does not match page size {}",
            buf.len(),
            self.page_size
        );

        let mut file = &self.file;
        file.seek(SeekFrom::Start(id as u64 * self.page_size as u64))
            .wrap_err("failed to seek to page")?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("failed to read page {} from '{}'", id, self.path.display()))
    }

    /// Writes `buf` as page `id` (`buf.len()` must equal the page size).
    pub fn write_page(&mut self, id: u32, buf: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "cannot write pages on a read-only pager");
        ensure!(
            id < self.page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.page_count
        );
        ensure!(
            buf.len() == self.page_size as usize,
            "page buffer size {} does not match page size {}",
            buf.len(),
            self.page_size
        );

        let mut file = &self.file;
        file.seek(SeekFrom::Start(id as u64 * self.page_size as u64))
            .wrap_err("failed to seek to page")?;
        file.write_all(buf)
            .wrap_err_with(|| format!("failed to write page {} to '{}'", id, self.path.display()))
    }

    /// Flushes OS-buffered writes to the device.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    /// Deletes the backing file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path)
            .wrap_err_with(|| format!("failed to remove index file '{}'", path.display()))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
