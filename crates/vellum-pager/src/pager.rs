use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use vellum_checksum::page_crc32;
use vellum_io::{FileIo, StdFileIo};
use vellum_types::{
    page::{self, PageHeader, PAGE_HDR_LEN},
    PageId, Result, VellumError,
};

use crate::freelist::{
    free_page_capacity, pages_to_extents, read_free_page, write_free_page, FreeCache,
};
use crate::meta::{create_meta, load_meta, probe_page_size, write_meta_page, Meta};

/// Configuration options for a page store.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes; a power of two within supported bounds.
    pub page_size: u32,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
        }
    }
}

/// Computes the byte offset of a page within the backing file.
pub fn page_offset(id: PageId, page_size: usize) -> u64 {
    id.0 * page_size as u64
}

struct PagerInner {
    meta: Meta,
    free_cache: FreeCache,
    freelist_pages: Vec<PageId>,
    pending_free: Vec<PageId>,
    meta_dirty: bool,
}

/// Fixed-size page store over a single backing file.
///
/// Page 0 holds the store metadata; every other page is owned by exactly one
/// structure or sits on the freelist. All reads verify the salted page
/// checksum; all writes stamp it.
pub struct Pager {
    io: Arc<dyn FileIo>,
    page_size: usize,
    inner: Mutex<PagerInner>,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Pager {
    /// Creates a new, empty store at the specified path.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path.as_ref())?);
        Self::create_with_io(io, options)
    }

    /// Creates a new, empty store on an already-opened I/O handle.
    ///
    /// Any existing file content is discarded.
    pub fn create_with_io(io: Arc<dyn FileIo>, options: PagerOptions) -> Result<Self> {
        let meta = create_meta(io.as_ref(), options.page_size)?;
        let page_size = meta.page_size as usize;
        let inner = PagerInner {
            meta,
            free_cache: FreeCache::default(),
            freelist_pages: Vec::new(),
            pending_free: Vec::new(),
            meta_dirty: false,
        };
        Ok(Self {
            io,
            page_size,
            inner: Mutex::new(inner),
        })
    }

    /// Opens an existing store, discovering its page size from page 0.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path.as_ref())?);
        Self::open_with_io(io)
    }

    /// Opens an existing store on an already-opened I/O handle.
    pub fn open_with_io(io: Arc<dyn FileIo>) -> Result<Self> {
        let page_size = probe_page_size(io.as_ref())?;
        let meta = load_meta(io.as_ref(), page_size)?;
        let page_size = meta.page_size as usize;
        let pager = Self {
            io,
            page_size,
            inner: Mutex::new(PagerInner {
                meta,
                free_cache: FreeCache::default(),
                freelist_pages: Vec::new(),
                pending_free: Vec::new(),
                meta_dirty: false,
            }),
        };
        pager.load_freelist()?;
        Ok(pager)
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    /// Returns the total number of pages in the store, including page 0.
    pub fn page_count(&self) -> u64 {
        self.inner.lock().meta.next_page.0
    }

    /// Returns the number of pages currently on the freelist.
    pub fn free_page_count(&self) -> u64 {
        self.inner.lock().free_page_count_locked()
    }

    /// Returns a snapshot of the store metadata.
    pub fn meta(&self) -> Meta {
        self.inner.lock().meta.clone()
    }

    /// Applies a mutation to the store metadata; persisted on the next flush.
    pub fn update_meta<F>(&self, f: F)
    where
        F: FnOnce(&mut Meta),
    {
        let mut inner = self.inner.lock();
        f(&mut inner.meta);
        inner.meta_dirty = true;
    }

    /// Hands out an unused page, reusing freed pages before growing the file.
    pub fn allocate(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.free_cache.pop() {
            inner.meta.free_page_count = inner.meta.free_page_count.saturating_sub(1);
            inner.meta_dirty = true;
            return Ok(page);
        }
        let next = inner.meta.next_page;
        let grown = next
            .0
            .checked_add(1)
            .ok_or(VellumError::OutOfSpace)?;
        inner.meta.next_page = PageId(grown);
        inner.meta_dirty = true;
        Ok(next)
    }

    /// Returns a page to the free set.
    ///
    /// The page's old content stays on disk until the page is reused.
    pub fn release(&self, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if id.0 == 0 {
            return Err(VellumError::Invalid("cannot release the meta page"));
        }
        if id.0 >= inner.meta.next_page.0 {
            return Err(VellumError::Invalid("cannot release unallocated page"));
        }
        inner.pending_free.push(id);
        inner.meta.free_page_count += 1;
        inner.meta_dirty = true;
        Ok(())
    }

    /// Reads a page and verifies its header and checksum.
    pub fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(VellumError::Invalid("page buffer size mismatch"));
        }
        let (next_page, salt, page_size_u32) = {
            let inner = self.inner.lock();
            (inner.meta.next_page, inner.meta.salt, inner.meta.page_size)
        };
        if id.0 == 0 || id.0 >= next_page.0 {
            return Err(VellumError::Invalid("page not allocated"));
        }
        match self.io.read_at(page_offset(id, self.page_size), buf) {
            Ok(()) => {}
            Err(VellumError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(VellumError::Corruption("page read past end of store"));
            }
            Err(err) => return Err(err),
        }
        let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
        if header.page_no != id {
            return Err(VellumError::Corruption("page number mismatch"));
        }
        if header.page_size != page_size_u32 {
            return Err(VellumError::Corruption("page size mismatch"));
        }
        let mut scratch = buf.to_vec();
        page::clear_crc32(&mut scratch[..PAGE_HDR_LEN])?;
        let crc = page_crc32(id.0, salt, &scratch);
        if crc != header.crc32 {
            return Err(VellumError::Corruption("page crc mismatch"));
        }
        Ok(())
    }

    /// Stamps the checksum into a fully-assembled page image and writes it.
    pub fn write_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(VellumError::Invalid("page buffer size mismatch"));
        }
        let (next_page, salt) = {
            let inner = self.inner.lock();
            (inner.meta.next_page, inner.meta.salt)
        };
        if id.0 == 0 || id.0 >= next_page.0 {
            return Err(VellumError::Invalid("page not allocated"));
        }
        page::clear_crc32(&mut buf[..PAGE_HDR_LEN])?;
        let crc = page_crc32(id.0, salt, buf);
        buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
        self.io.write_at(page_offset(id, self.page_size), buf)
    }

    /// Rebuilds the on-disk freelist, rewrites the meta page, and syncs.
    ///
    /// When the tail of the file is entirely free the store shrinks: those
    /// pages leave the free set and the file is truncated.
    pub fn persist(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.meta_dirty && inner.pending_free.is_empty() {
            // nothing structural changed; still make page writes durable
            return self.io.sync_all();
        }
        self.persist_locked(&mut inner)
    }

    /// Returns the store checksum salt.
    pub fn salt(&self) -> u64 {
        self.inner.lock().meta.salt
    }

    /// Snapshot of every free page, including frees not yet flushed.
    pub fn free_pages(&self) -> Vec<PageId> {
        let inner = self.inner.lock();
        let mut pages: Vec<PageId> = inner
            .free_cache
            .extents()
            .iter()
            .flat_map(|e| e.iter_pages())
            .collect();
        pages.extend_from_slice(&inner.pending_free);
        pages.sort_by_key(|p| p.0);
        pages.dedup();
        pages
    }

    /// Pages holding the persisted freelist chain itself.
    pub fn freelist_chain(&self) -> Vec<PageId> {
        self.inner.lock().freelist_pages.clone()
    }

    fn load_freelist(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.free_cache = FreeCache::default();
        inner.freelist_pages.clear();
        let mut next = inner.meta.free_head;
        let max_page = inner.meta.next_page.0;
        let mut filtered = false;
        while next.0 != 0 {
            let mut buf = vec![0u8; self.page_size];
            self.io
                .read_at(page_offset(next, self.page_size), &mut buf)?;
            let free_page = read_free_page(&buf, self.page_size, &inner.meta)?;
            for extent in free_page.extents {
                if extent.start.0 >= max_page {
                    filtered = true;
                    continue;
                }
                let end = extent.start.0 + extent.len as u64;
                let clamped_len = if end > max_page {
                    filtered = true;
                    (max_page - extent.start.0) as u32
                } else {
                    extent.len
                };
                if clamped_len == 0 {
                    continue;
                }
                inner
                    .free_cache
                    .extend(vec![crate::freelist::Extent::new(extent.start, clamped_len)]);
            }
            inner.freelist_pages.push(next);
            next = free_page.next;
        }
        let counted = inner.free_cache.total_pages();
        if filtered || counted != inner.meta.free_page_count {
            inner.meta.free_page_count = counted;
            inner.meta_dirty = true;
        }
        Ok(())
    }

    fn persist_locked(&self, inner: &mut PagerInner) -> Result<()> {
        // absorb pending frees; released chain pages become regular pages
        // before reassignment
        let mut all_pages: Vec<PageId> = inner
            .free_cache
            .extents()
            .iter()
            .flat_map(|e| e.iter_pages())
            .collect();
        all_pages.append(&mut inner.pending_free);
        all_pages.append(&mut inner.freelist_pages);
        all_pages.sort_by_key(|p| p.0);
        all_pages.dedup();

        let mut shrink_target = inner.meta.next_page;
        while shrink_target.0 > 1 {
            match all_pages.last() {
                Some(last) if last.0 == shrink_target.0 - 1 => {
                    all_pages.pop();
                    shrink_target = PageId(shrink_target.0 - 1);
                }
                _ => break,
            }
        }
        let truncated = shrink_target != inner.meta.next_page;
        if truncated {
            debug!(
                from = inner.meta.next_page.0,
                to = shrink_target.0,
                "pager.freelist.shrink"
            );
            inner.meta.next_page = shrink_target;
        }
        all_pages.retain(|p| p.0 < inner.meta.next_page.0);

        let capacity = free_page_capacity(self.page_size);
        if capacity == 0 {
            return Err(VellumError::Invalid("page size too small for freelist"));
        }

        // chain pages come off the tail of the free set; taking a page can
        // only shrink the extent list, so this converges
        let mut chain: Vec<PageId> = Vec::new();
        while chain.len() < pages_to_extents(&all_pages).len().div_ceil(capacity) {
            match all_pages.pop() {
                Some(page) => chain.push(page),
                None => break,
            }
        }
        chain.sort_by_key(|p| p.0);

        let extents = pages_to_extents(&all_pages);
        debug!(
            free_pages = all_pages.len(),
            extents = extents.len(),
            chain_pages = chain.len(),
            "pager.freelist.rebuild"
        );

        inner.free_cache = FreeCache::from_extents(extents.clone());
        inner.meta.free_head = chain.first().copied().unwrap_or(PageId(0));
        inner.meta.free_page_count = all_pages.len() as u64;
        inner.freelist_pages = chain.clone();

        if truncated {
            let new_len = inner.meta.next_page.0 * self.page_size as u64;
            self.io.truncate(new_len)?;
        }

        for (idx, page) in chain.iter().enumerate() {
            let next = chain.get(idx + 1).copied().unwrap_or(PageId(0));
            let lo = idx * capacity;
            let hi = ((idx + 1) * capacity).min(extents.len());
            let slice = if lo < extents.len() {
                &extents[lo..hi]
            } else {
                &[]
            };
            let mut buf = vec![0u8; self.page_size];
            write_free_page(&mut buf, *page, &inner.meta, next, slice)?;
            self.io.write_at(page_offset(*page, self.page_size), &buf)?;
        }

        let mut buf = vec![0u8; self.page_size];
        write_meta_page(&mut buf, &inner.meta)?;
        self.io.write_at(0, &buf)?;
        self.io.sync_all()?;
        inner.meta_dirty = false;
        Ok(())
    }
}

impl PagerInner {
    fn free_page_count_locked(&self) -> u64 {
        self.free_cache.total_pages() + self.pending_free.len() as u64
    }
}
