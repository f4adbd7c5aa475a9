#![forbid(unsafe_code)]

//! Engine facade: named table and index structures over a single-file page
//! store, with a compactor and an integrity verifier.

pub mod catalog;
pub mod compact;
pub mod verify;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use vellum_btree::{page::Node, BTree};
use vellum_pager::{Pager, PagerOptions};
use vellum_types::{
    page::{self, DEFAULT_PAGE_SIZE},
    PageId, Result, StructureId, StructureKind, VellumError,
};

pub use catalog::{Catalog, CatalogEntry};
pub use compact::VacuumReport;
pub use verify::{Finding, IntegrityReport, Severity};

/// Options for creating a store.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub page_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// A single-file store of named B-tree structures.
///
/// All mutation goes through `&mut self`; scans hand out guards counted
/// against compaction, which requires exclusive access.
pub struct Store {
    path: PathBuf,
    pager: Arc<Pager>,
    catalog: Catalog,
    pending_page_size: Option<u32>,
    readers: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("pending_page_size", &self.pending_page_size)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates a new, empty store file.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pager = Pager::create(&path, PagerOptions {
            page_size: options.page_size,
        })?;
        let catalog = Catalog::create(&pager)?;
        let root = catalog.root();
        pager.update_meta(|m| m.catalog_root = root);
        pager.persist()?;
        Ok(Self {
            path,
            pager: Arc::new(pager),
            catalog,
            pending_page_size: None,
            readers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Opens an existing store, discovering its geometry from the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pager = Pager::open(&path)?;
        let catalog = Catalog::open(pager.meta().catalog_root)?;
        Ok(Self {
            path,
            pager: Arc::new(pager),
            catalog,
            pending_page_size: None,
            readers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u32 {
        self.pager.page_size()
    }

    pub fn page_count(&self) -> u64 {
        self.pager.page_count()
    }

    pub fn free_page_count(&self) -> u64 {
        self.pager.free_page_count()
    }

    /// Creates a named table structure.
    pub fn create_table(&mut self, name: &str) -> Result<StructureId> {
        self.create_structure(StructureKind::Table, name)
    }

    /// Creates a named index structure.
    pub fn create_index(&mut self, name: &str) -> Result<StructureId> {
        self.create_structure(StructureKind::Index, name)
    }

    fn create_structure(&mut self, kind: StructureKind, name: &str) -> Result<StructureId> {
        if self.catalog.find_by_name(&self.pager, name)?.is_some() {
            return Err(VellumError::Invalid("structure name already in use"));
        }
        let id = StructureId(self.pager.meta().next_structure_id);
        let tree = BTree::create(&self.pager)?;
        self.catalog.put(
            &self.pager,
            &CatalogEntry {
                id,
                kind,
                root: tree.root(),
                entry_count: 0,
                name: name.to_owned(),
            },
        )?;
        let root = self.catalog.root();
        self.pager.update_meta(|m| {
            m.catalog_root = root;
            m.next_structure_id = id.0 + 1;
        });
        self.pager.persist()?;
        debug!(structure = id.0, name, "store.structure.create");
        Ok(id)
    }

    /// Drops a structure and returns its pages to the free set.
    ///
    /// The space is reusable by later allocations immediately; the file only
    /// shrinks on the next compaction (or when the freed pages happen to sit
    /// at the tail).
    pub fn drop_structure(&mut self, id: StructureId) -> Result<()> {
        let entry = self.require(id)?;
        let pages = BTree::open(entry.root).pages(&self.pager)?;
        self.catalog.remove(&self.pager, id)?;
        let root = self.catalog.root();
        self.pager.update_meta(|m| m.catalog_root = root);
        for page in &pages {
            self.pager.release(*page)?;
        }
        self.pager.persist()?;
        debug!(structure = id.0, pages = pages.len(), "store.structure.drop");
        Ok(())
    }

    /// All structures in creation order.
    pub fn structures(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog.entries(&self.pager)
    }

    /// Looks a structure up by name.
    pub fn structure_by_name(&self, name: &str) -> Result<Option<CatalogEntry>> {
        self.catalog.find_by_name(&self.pager, name)
    }

    /// Number of live entries in a structure.
    pub fn entry_count(&self, id: StructureId) -> Result<u64> {
        Ok(self.require(id)?.entry_count)
    }

    /// Inserts or replaces an entry in a structure.
    pub fn insert(&mut self, id: StructureId, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entry = self.require(id)?;
        let mut tree = BTree::open(entry.root);
        let fresh = tree.insert(&self.pager, key, value)?;
        if fresh {
            entry.entry_count += 1;
        }
        entry.root = tree.root();
        self.catalog.put(&self.pager, &entry)?;
        let root = self.catalog.root();
        self.pager.update_meta(|m| m.catalog_root = root);
        Ok(())
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, id: StructureId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entry = self.require(id)?;
        BTree::open(entry.root).get(&self.pager, key)
    }

    /// Removes an entry. Returns true when the key was present.
    pub fn delete(&mut self, id: StructureId, key: &[u8]) -> Result<bool> {
        let mut entry = self.require(id)?;
        let mut tree = BTree::open(entry.root);
        let removed = tree.delete(&self.pager, key)?;
        if removed {
            entry.entry_count -= 1;
            entry.root = tree.root();
            self.catalog.put(&self.pager, &entry)?;
            let root = self.catalog.root();
            self.pager.update_meta(|m| m.catalog_root = root);
        }
        Ok(removed)
    }

    /// In-order cursor over a structure's entries.
    ///
    /// The guard counts as an outstanding reader; compaction refuses to run
    /// while any guard is alive.
    pub fn scan(&self, id: StructureId) -> Result<ScanGuard> {
        let entry = self.require(id)?;
        let mut page = entry.root;
        let (cells, next) = loop {
            let mut buf = vec![0u8; self.pager.page_size() as usize];
            self.pager.read_page(page, &mut buf)?;
            match Node::decode(&buf)? {
                Node::Internal(node) => {
                    page = match node.cells.first() {
                        Some(cell) => cell.child,
                        None => node.right,
                    };
                }
                Node::Leaf(node) => {
                    let cells: Vec<(Vec<u8>, Vec<u8>)> = node
                        .cells
                        .into_iter()
                        .map(|c| (c.key, c.value))
                        .collect();
                    break (cells, node.right);
                }
            }
        };
        self.readers.fetch_add(1, Ordering::AcqRel);
        Ok(ScanGuard {
            pager: Arc::clone(&self.pager),
            cells: cells.into_iter(),
            next,
            readers: Arc::clone(&self.readers),
        })
    }

    /// Stages a page size for the next compaction.
    ///
    /// Nothing about the store changes until `vacuum` runs; reopening the
    /// store discards the staged value.
    pub fn set_page_size(&mut self, page_size: u32) -> Result<()> {
        page::validate_page_size(page_size)?;
        self.pending_page_size = Some(page_size);
        Ok(())
    }

    pub fn pending_page_size(&self) -> Option<u32> {
        self.pending_page_size
    }

    /// Flushes the freelist and meta page and syncs the file.
    pub fn flush(&mut self) -> Result<()> {
        self.pager.persist()
    }

    fn require(&self, id: StructureId) -> Result<CatalogEntry> {
        self.catalog
            .get(&self.pager, id)?
            .ok_or(VellumError::NotFound)
    }

    pub(crate) fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub(crate) fn swap_pager(&mut self, pager: Pager) -> Result<()> {
        let pager = Arc::new(pager);
        let catalog = Catalog::open(pager.meta().catalog_root)?;
        self.pager = pager;
        self.catalog = catalog;
        self.pending_page_size = None;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // best-effort durability for handles dropped without a flush
        let _ = self.pager.persist();
    }
}

/// Single-pass cursor over one structure, counted as an outstanding reader
/// until dropped.
pub struct ScanGuard {
    pager: Arc<Pager>,
    cells: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    next: PageId,
    readers: Arc<AtomicUsize>,
}

impl Iterator for ScanGuard {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.cells.next() {
                return Some(Ok(cell));
            }
            if self.next.0 == 0 {
                return None;
            }
            let mut buf = vec![0u8; self.pager.page_size() as usize];
            if let Err(err) = self.pager.read_page(self.next, &mut buf) {
                self.next = PageId(0);
                return Some(Err(err));
            }
            match Node::decode(&buf) {
                Ok(Node::Leaf(node)) => {
                    self.cells = node
                        .cells
                        .into_iter()
                        .map(|c| (c.key, c.value))
                        .collect::<Vec<_>>()
                        .into_iter();
                    self.next = node.right;
                }
                Ok(Node::Internal(_)) => {
                    self.next = PageId(0);
                    return Some(Err(VellumError::Corruption(
                        "leaf sibling points at internal node",
                    )));
                }
                Err(err) => {
                    self.next = PageId(0);
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_structure_rejects_duplicate_name() {
        let dir = tempdir().unwrap();
        let mut store =
            Store::create(dir.path().join("s.vlm"), StoreOptions::default()).unwrap();
        store.create_table("users").unwrap();
        let err = store.create_table("users").unwrap_err();
        assert!(matches!(err, VellumError::Invalid(_)));
        store.create_index("users_by_email").unwrap();
    }

    #[test]
    fn insert_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store =
            Store::create(dir.path().join("s.vlm"), StoreOptions::default()).unwrap();
        let t = store.create_table("t").unwrap();
        store.insert(t, b"k1", b"v1").unwrap();
        store.insert(t, b"k2", b"v2").unwrap();
        store.insert(t, b"k1", b"v1b").unwrap();
        assert_eq!(store.entry_count(t).unwrap(), 2);
        assert_eq!(store.get(t, b"k1").unwrap(), Some(b"v1b".to_vec()));
        assert!(store.delete(t, b"k1").unwrap());
        assert!(!store.delete(t, b"k1").unwrap());
        assert_eq!(store.entry_count(t).unwrap(), 1);
        assert_eq!(store.get(t, b"k1").unwrap(), None);
    }

    #[test]
    fn unknown_structure_is_not_found() {
        let dir = tempdir().unwrap();
        let mut store =
            Store::create(dir.path().join("s.vlm"), StoreOptions::default()).unwrap();
        let err = store.insert(StructureId(42), b"k", b"v").unwrap_err();
        assert!(matches!(err, VellumError::NotFound));
    }

    #[test]
    fn reopen_preserves_structures_and_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.vlm");
        let t;
        {
            let mut store = Store::create(&path, StoreOptions::default()).unwrap();
            t = store.create_table("t").unwrap();
            for i in 0..100u32 {
                store
                    .insert(t, &i.to_be_bytes(), format!("row{i}").as_bytes())
                    .unwrap();
            }
            store.flush().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.entry_count(t).unwrap(), 100);
        assert_eq!(
            store.get(t, &42u32.to_be_bytes()).unwrap(),
            Some(b"row42".to_vec())
        );
        let scanned = store.scan(t).unwrap().count();
        assert_eq!(scanned, 100);
    }

    #[test]
    fn drop_structure_frees_its_pages() {
        let dir = tempdir().unwrap();
        let mut store =
            Store::create(dir.path().join("s.vlm"), StoreOptions::default()).unwrap();
        let keep = store.create_table("keep").unwrap();
        let gone = store.create_table("gone").unwrap();
        for i in 0..400u32 {
            store.insert(keep, &i.to_be_bytes(), &vec![b'k'; 60]).unwrap();
            store.insert(gone, &i.to_be_bytes(), &vec![b'g'; 60]).unwrap();
        }
        store.flush().unwrap();
        assert_eq!(store.free_page_count(), 0);

        store.drop_structure(gone).unwrap();
        assert!(store.free_page_count() > 0);
        assert!(matches!(
            store.get(gone, &1u32.to_be_bytes()),
            Err(VellumError::NotFound)
        ));
        assert_eq!(store.structures().unwrap().len(), 1);
        assert!(store.verify_integrity().unwrap().is_clean());

        // freed pages satisfy new allocations before the file grows
        let pages = store.page_count();
        let fresh = store.create_table("fresh").unwrap();
        store.insert(fresh, b"a", b"1").unwrap();
        assert_eq!(store.page_count(), pages);
    }

    #[test]
    fn scan_guard_tracks_reader_count() {
        let dir = tempdir().unwrap();
        let mut store =
            Store::create(dir.path().join("s.vlm"), StoreOptions::default()).unwrap();
        let t = store.create_table("t").unwrap();
        store.insert(t, b"a", b"1").unwrap();
        assert_eq!(store.reader_count(), 0);
        let guard = store.scan(t).unwrap();
        assert_eq!(store.reader_count(), 1);
        drop(guard);
        assert_eq!(store.reader_count(), 0);
    }

    #[test]
    fn set_page_size_validates_geometry() {
        let dir = tempdir().unwrap();
        let mut store =
            Store::create(dir.path().join("s.vlm"), StoreOptions::default()).unwrap();
        assert!(matches!(
            store.set_page_size(1000),
            Err(VellumError::Geometry(_))
        ));
        store.set_page_size(8192).unwrap();
        assert_eq!(store.pending_page_size(), Some(8192));
        // staging alone changes nothing
        assert_eq!(store.page_size(), 4096);
    }
}
