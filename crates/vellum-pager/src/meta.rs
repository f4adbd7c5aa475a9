use std::convert::TryInto;
use std::fmt;
use std::io::ErrorKind;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};
use vellum_checksum::page_crc32;
use vellum_io::FileIo;
use vellum_types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, Result, VellumError,
};

const META_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 14;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 14..PAGE_HDR_LEN + 16;
const META_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_FREE_PAGE_COUNT: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_CATALOG_ROOT: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const META_NEXT_STRUCTURE_ID: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 52;
const META_RESERVED_2: Range<usize> = PAGE_HDR_LEN + 52..PAGE_HDR_LEN + 56;

/// Store metadata kept in page 0.
///
/// Holds the page geometry, checksum salt, freelist head, allocation
/// watermark, and the catalog root pointer. The page size is decodable from
/// the fixed page header alone, so a store can be opened without knowing its
/// geometry in advance.
#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Random salt value used for page checksums.
    pub salt: u64,
    /// Store format version number.
    pub format_version: u16,
    /// Page ID of the head of the freelist chain.
    pub free_head: PageId,
    /// Next page ID to be allocated; equivalently the total page count.
    pub next_page: PageId,
    /// Number of pages currently on the freelist.
    pub free_page_count: u64,
    /// Root page ID of the structure catalog B-tree.
    pub catalog_root: PageId,
    /// Next structure ID to be assigned.
    pub next_structure_id: u32,
}

/// Creates fresh store metadata and writes it to page 0.
///
/// Generates a random checksum salt, initializes the catalog root to null,
/// and syncs the meta page to disk.
pub fn create_meta(io: &dyn FileIo, page_size: u32) -> Result<Meta> {
    page::validate_page_size(page_size)?;
    let mut rng = OsRng;
    let salt = rng.next_u64();
    let meta = Meta {
        page_size,
        salt,
        format_version: page::PAGE_FORMAT_VERSION,
        free_head: PageId(0),
        next_page: PageId(1),
        free_page_count: 0,
        catalog_root: PageId(0),
        next_structure_id: 1,
    };
    let mut buf = vec![0u8; page_size as usize];
    write_meta_page(&mut buf, &meta)?;
    io.truncate(0)?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    Ok(meta)
}

/// Reads the page size of a store from the fixed header of page 0.
pub fn probe_page_size(io: &dyn FileIo) -> Result<u32> {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    match io.read_at(0, &mut hdr) {
        Ok(()) => {}
        Err(VellumError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(VellumError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    let header = PageHeader::decode(&hdr)?;
    page::validate_page_size(header.page_size)
        .map_err(|_| VellumError::Corruption("meta page declares unsupported page size"))?;
    Ok(header.page_size)
}

/// Loads and verifies the store metadata from page 0.
pub fn load_meta(io: &dyn FileIo, page_size: u32) -> Result<Meta> {
    if (page_size as usize) < PAGE_HDR_LEN {
        return Err(VellumError::Invalid("page size smaller than header"));
    }
    let mut buf = vec![0u8; page_size as usize];
    match io.read_at(0, &mut buf) {
        Ok(()) => {}
        Err(VellumError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(VellumError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    read_meta_page(&buf)
}

/// Encodes metadata into a page buffer with header and CRC checksum.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size {
        return Err(VellumError::Invalid("meta buffer too small"));
    }
    buf[..page_size].fill(0);
    let header =
        PageHeader::new(PageId(0), PageKind::Meta, meta.page_size, meta.salt)?.with_crc32(0);
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_RESERVED].fill(0);
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_FREE_PAGE_COUNT].copy_from_slice(&meta.free_page_count.to_be_bytes());
    buf[META_CATALOG_ROOT].copy_from_slice(&meta.catalog_root.0.to_be_bytes());
    buf[META_NEXT_STRUCTURE_ID].copy_from_slice(&meta.next_structure_id.to_be_bytes());
    buf[META_RESERVED_2].fill(0);
    page::clear_crc32(&mut buf[..PAGE_HDR_LEN])?;
    let crc = page_crc32(PageId(0).0, meta.salt, &buf[..page_size]);
    buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Decodes metadata from a page buffer and verifies its integrity.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < PAGE_HDR_LEN {
        return Err(VellumError::Corruption("meta page truncated"));
    }
    let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
    if header.kind != PageKind::Meta {
        return Err(VellumError::Corruption("meta page has wrong kind"));
    }
    let len = header.page_size as usize;
    if buf.len() < len {
        return Err(VellumError::Corruption("meta page truncated"));
    }
    let mut scratch = buf[..len].to_vec();
    page::clear_crc32(&mut scratch[..PAGE_HDR_LEN])?;
    let crc = page_crc32(header.page_no.0, header.salt, &scratch);
    if crc != header.crc32 {
        return Err(VellumError::Corruption("meta page crc mismatch"));
    }
    let salt = u64::from_be_bytes(buf[META_SALT].try_into().unwrap());
    let page_size = u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    if page_size != header.page_size {
        return Err(VellumError::Corruption("meta page size disagrees with header"));
    }
    let format_version = u16::from_be_bytes(buf[META_FORMAT_VERSION].try_into().unwrap());
    let reserved = u16::from_be_bytes(buf[META_RESERVED].try_into().unwrap());
    if reserved != 0 {
        return Err(VellumError::Corruption("meta reserved field non-zero"));
    }
    let free_head = PageId(u64::from_be_bytes(buf[META_FREE_HEAD].try_into().unwrap()));
    let next_page = PageId(u64::from_be_bytes(buf[META_NEXT_PAGE].try_into().unwrap()));
    let free_page_count = u64::from_be_bytes(buf[META_FREE_PAGE_COUNT].try_into().unwrap());
    let catalog_root = PageId(u64::from_be_bytes(
        buf[META_CATALOG_ROOT].try_into().unwrap(),
    ));
    let next_structure_id =
        u32::from_be_bytes(buf[META_NEXT_STRUCTURE_ID].try_into().unwrap());
    if buf[META_RESERVED_2].iter().any(|b| *b != 0) {
        return Err(VellumError::Corruption("meta reserved2 field non-zero"));
    }
    Ok(Meta {
        page_size,
        salt,
        format_version,
        free_head,
        next_page,
        free_page_count,
        catalog_root,
        next_structure_id: next_structure_id.max(1),
    })
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta(page_size={}, salt={}, format_version={}, free_head={}, next_page={}, free_page_count={}, catalog_root={}, next_structure_id={})",
            self.page_size,
            self.salt,
            self.format_version,
            self.free_head.0,
            self.next_page.0,
            self.free_page_count,
            self.catalog_root.0,
            self.next_structure_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> Meta {
        Meta {
            page_size: 4096,
            salt: 0xABCD_EF01_2345_6789,
            format_version: page::PAGE_FORMAT_VERSION,
            free_head: PageId(7),
            next_page: PageId(19),
            free_page_count: 4,
            catalog_root: PageId(2),
            next_structure_id: 5,
        }
    }

    #[test]
    fn meta_page_roundtrip() {
        let meta = sample_meta();
        let mut buf = vec![0u8; meta.page_size as usize];
        write_meta_page(&mut buf, &meta).unwrap();
        let decoded = read_meta_page(&buf).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn read_meta_page_rejects_corrupt_crc() {
        let meta = sample_meta();
        let mut buf = vec![0u8; meta.page_size as usize];
        write_meta_page(&mut buf, &meta).unwrap();
        buf[PAGE_HDR_LEN] ^= 0xFF;
        let err = read_meta_page(&buf).unwrap_err();
        assert!(matches!(err, VellumError::Corruption(_)));
    }

    #[test]
    fn read_meta_page_rejects_wrong_kind() {
        let meta = sample_meta();
        let mut buf = vec![0u8; meta.page_size as usize];
        write_meta_page(&mut buf, &meta).unwrap();
        buf[page::header::PAGE_KIND] = PageKind::BTreeLeaf.as_u8();
        let err = read_meta_page(&buf).unwrap_err();
        assert!(matches!(err, VellumError::Corruption(_)));
    }
}
