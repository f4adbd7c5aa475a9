use vellum_checksum::page_crc32;
use vellum_types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use vellum_types::{PageId, Result, VellumError};

use crate::meta::Meta;

/// A run of `len` consecutive free pages starting at `start`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    pub start: PageId,
    pub len: u32,
}

impl Extent {
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    /// First page number past the run.
    fn end(&self) -> u64 {
        self.start.0 + self.len as u64
    }

    pub fn iter_pages(self) -> impl Iterator<Item = PageId> {
        (self.start.0..self.end()).map(PageId)
    }
}

/// Builds coalesced extents out of a sorted, deduplicated page list.
pub fn pages_to_extents(pages: &[PageId]) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::new();
    for &page in pages {
        match out.last_mut() {
            Some(run) if run.end() == page.0 => run.len += 1,
            _ => out.push(Extent::new(page, 1)),
        }
    }
    out
}

/// In-memory view of the free page set, kept as sorted, coalesced extents.
///
/// Allocation takes pages from the largest extent so long contiguous runs
/// survive as long as possible. The extent list stays small in practice, so
/// a linear scan for the largest run beats keeping a second index in sync.
#[derive(Clone, Debug, Default)]
pub struct FreeCache {
    extents: Vec<Extent>,
}

impl FreeCache {
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        let mut cache = Self { extents };
        cache.normalize();
        cache
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total number of free pages tracked.
    pub fn total_pages(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Answers whether `page` is currently on the free set.
    pub fn contains(&self, page: PageId) -> bool {
        match self.extents.binary_search_by_key(&page.0, |e| e.start.0) {
            Ok(_) => true,
            Err(0) => false,
            Err(pos) => page.0 < self.extents[pos - 1].end(),
        }
    }

    /// Takes one page, preferring the largest extent (smallest start on
    /// ties, so allocation order is deterministic).
    pub fn pop(&mut self) -> Option<PageId> {
        if self.extents.is_empty() {
            return None;
        }
        let mut best = 0;
        for idx in 1..self.extents.len() {
            if self.extents[idx].len > self.extents[best].len {
                best = idx;
            }
        }
        let page = self.extents[best].start;
        if self.extents[best].len > 1 {
            self.extents[best].start.0 += 1;
            self.extents[best].len -= 1;
        } else {
            self.extents.remove(best);
        }
        Some(page)
    }

    pub fn extend(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.extents.append(&mut extents);
        self.normalize();
    }

    fn normalize(&mut self) {
        self.extents.retain(|e| e.len > 0);
        self.extents.sort_by_key(|e| e.start.0);
        let mut i = 0;
        while i + 1 < self.extents.len() {
            if self.extents[i].end() >= self.extents[i + 1].start.0 {
                let merged_end = self.extents[i].end().max(self.extents[i + 1].end());
                self.extents[i].len = (merged_end - self.extents[i].start.0) as u32;
                self.extents.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

// Freelist page payload layout, after the common page header: next chain
// page, record count, reserved, then fixed-width extent records.
const FREE_NEXT: std::ops::Range<usize> = 0..8;
const FREE_COUNT: std::ops::Range<usize> = 8..12;
const FREE_RESERVED: std::ops::Range<usize> = 12..16;
const FREE_RECORDS: usize = 16;
const RECORD_LEN: usize = 16;

/// Number of extent records one freelist page holds.
pub fn free_page_capacity(page_size: usize) -> usize {
    page_size.saturating_sub(PAGE_HDR_LEN + FREE_RECORDS) / RECORD_LEN
}

#[derive(Debug)]
pub struct FreePage {
    pub next: PageId,
    pub extents: Vec<Extent>,
}

pub fn read_free_page(buf: &[u8], page_size: usize, meta: &Meta) -> Result<FreePage> {
    if buf.len() < page_size {
        return Err(VellumError::Corruption("freelist page truncated"));
    }
    let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
    if header.kind != PageKind::FreeList {
        return Err(VellumError::Corruption("freelist page has wrong kind"));
    }
    if header.page_size != meta.page_size {
        return Err(VellumError::Corruption("freelist page size mismatch"));
    }
    if header.page_no.0 == 0 {
        return Err(VellumError::Corruption("freelist page claims page 0"));
    }
    let mut scratch = buf[..page_size].to_vec();
    page::clear_crc32(&mut scratch[..PAGE_HDR_LEN])?;
    if page_crc32(header.page_no.0, meta.salt, &scratch) != header.crc32 {
        return Err(VellumError::Corruption("freelist page crc mismatch"));
    }

    let payload = &buf[PAGE_HDR_LEN..page_size];
    let next = PageId(u64::from_be_bytes(payload[FREE_NEXT].try_into().unwrap()));
    let count = u32::from_be_bytes(payload[FREE_COUNT].try_into().unwrap()) as usize;
    if payload[FREE_RESERVED].iter().any(|&b| b != 0) {
        return Err(VellumError::Corruption("freelist page reserved bytes set"));
    }
    if count > free_page_capacity(page_size) {
        return Err(VellumError::Corruption(
            "freelist page record count exceeds capacity",
        ));
    }
    let records = &payload[FREE_RECORDS..FREE_RECORDS + count * RECORD_LEN];
    let mut extents = Vec::with_capacity(count);
    for record in records.chunks_exact(RECORD_LEN) {
        let start = PageId(u64::from_be_bytes(record[..8].try_into().unwrap()));
        let len = u32::from_be_bytes(record[8..12].try_into().unwrap());
        extents.push(Extent::new(start, len));
    }
    Ok(FreePage { next, extents })
}

pub fn write_free_page(
    buf: &mut [u8],
    page_id: PageId,
    meta: &Meta,
    next: PageId,
    extents: &[Extent],
) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size {
        return Err(VellumError::Invalid("freelist page buffer too small"));
    }
    if extents.len() > free_page_capacity(page_size) {
        return Err(VellumError::Invalid("extent records exceed page capacity"));
    }
    buf[..page_size].fill(0);
    let header =
        PageHeader::new(page_id, PageKind::FreeList, meta.page_size, meta.salt)?.with_crc32(0);
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    let payload = &mut buf[PAGE_HDR_LEN..page_size];
    payload[FREE_NEXT].copy_from_slice(&next.0.to_be_bytes());
    payload[FREE_COUNT].copy_from_slice(&(extents.len() as u32).to_be_bytes());
    // reserved bytes stay zero
    for (idx, extent) in extents.iter().enumerate() {
        let off = FREE_RECORDS + idx * RECORD_LEN;
        payload[off..off + 8].copy_from_slice(&extent.start.0.to_be_bytes());
        payload[off + 8..off + 12].copy_from_slice(&extent.len.to_be_bytes());
    }
    page::clear_crc32(&mut buf[..PAGE_HDR_LEN])?;
    let crc = page_crc32(page_id.0, meta.salt, &buf[..page_size]);
    buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_types::page::PAGE_FORMAT_VERSION;

    fn meta_for(page_size: u32) -> Meta {
        Meta {
            page_size,
            salt: 99,
            format_version: PAGE_FORMAT_VERSION,
            free_head: PageId(0),
            next_page: PageId(1),
            free_page_count: 0,
            catalog_root: PageId(0),
            next_structure_id: 1,
        }
    }

    #[test]
    fn pages_to_extents_coalesces_runs() {
        let pages = vec![PageId(2), PageId(3), PageId(4), PageId(7), PageId(9)];
        let extents = pages_to_extents(&pages);
        assert_eq!(
            extents,
            vec![
                Extent::new(PageId(2), 3),
                Extent::new(PageId(7), 1),
                Extent::new(PageId(9), 1),
            ]
        );
    }

    #[test]
    fn free_cache_pop_prefers_largest_extent() {
        let mut cache = FreeCache::from_extents(vec![
            Extent::new(PageId(10), 1),
            Extent::new(PageId(20), 5),
        ]);
        assert_eq!(cache.total_pages(), 6);
        assert_eq!(cache.pop(), Some(PageId(20)));
        assert_eq!(cache.pop(), Some(PageId(21)));
        assert_eq!(cache.total_pages(), 4);
    }

    #[test]
    fn free_cache_pop_breaks_ties_toward_low_pages() {
        let mut cache = FreeCache::from_extents(vec![
            Extent::new(PageId(30), 2),
            Extent::new(PageId(8), 2),
        ]);
        assert_eq!(cache.pop(), Some(PageId(8)));
    }

    #[test]
    fn free_cache_extend_merges_adjacent() {
        let mut cache = FreeCache::from_extents(vec![Extent::new(PageId(5), 2)]);
        cache.extend(vec![Extent::new(PageId(7), 3)]);
        assert_eq!(cache.extents(), &[Extent::new(PageId(5), 5)]);
        assert!(cache.contains(PageId(9)));
        assert!(!cache.contains(PageId(10)));
    }

    #[test]
    fn free_page_roundtrip() {
        let meta = meta_for(512);
        let extents = vec![Extent::new(PageId(3), 2), Extent::new(PageId(9), 1)];
        let mut buf = vec![0u8; 512];
        write_free_page(&mut buf, PageId(6), &meta, PageId(11), &extents).unwrap();
        let decoded = read_free_page(&buf, 512, &meta).unwrap();
        assert_eq!(decoded.next, PageId(11));
        assert_eq!(decoded.extents, extents);
    }

    #[test]
    fn read_free_page_rejects_corruption() {
        let meta = meta_for(512);
        let mut buf = vec![0u8; 512];
        write_free_page(&mut buf, PageId(6), &meta, PageId(0), &[]).unwrap();
        buf[PAGE_HDR_LEN + 3] ^= 0x01;
        let err = read_free_page(&buf, 512, &meta).unwrap_err();
        assert!(matches!(err, VellumError::Corruption(_)));
    }
}
