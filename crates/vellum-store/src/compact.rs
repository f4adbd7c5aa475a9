//! Compaction.
//!
//! `vacuum` rebuilds the whole store into a shadow file next to the source,
//! then atomically promotes it with a rename. Every structure is recreated
//! through the normal insertion path, so the rebuilt trees are as tight as a
//! fresh bulk load and the free set ends up empty. A page-size change staged
//! with `set_page_size` (or passed explicitly) takes effect here.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use vellum_btree::BTree;
use vellum_pager::{Pager, PagerOptions};
use vellum_types::{page, Result, VellumError};

use crate::catalog::{Catalog, CatalogEntry};
use crate::Store;

/// Statistics from one compaction run.
#[derive(Clone, Debug)]
pub struct VacuumReport {
    pub duration: Duration,
    pub pages_before: u64,
    pub pages_after: u64,
    pub page_size: u32,
    pub structures: u64,
    pub entries_copied: u64,
}

/// Appends a suffix to the final path component.
fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

struct ShadowStats {
    structures: u64,
    entries_copied: u64,
    pages: u64,
}

impl Store {
    /// Compacts the store in place, optionally migrating to a new page size.
    ///
    /// Resolution order for the target geometry: the explicit argument, then
    /// a staged `set_page_size`, then the current size. Fails `Concurrency`
    /// while scan guards are outstanding. The source file is never written
    /// during a vacuum, so any failure before the final rename leaves it
    /// byte-for-byte unchanged.
    pub fn vacuum(&mut self, target_page_size: Option<u32>) -> Result<VacuumReport> {
        let start = Instant::now();
        let target = target_page_size
            .or(self.pending_page_size())
            .unwrap_or_else(|| self.page_size());
        page::validate_page_size(target)?;
        if self.reader_count() != 0 {
            return Err(VellumError::Concurrency(
                "scan cursors outstanding during vacuum",
            ));
        }
        let pages_before = self.page_count();

        let shadow = append_suffix(self.path(), "-vacuum");
        if shadow.exists() {
            warn!(shadow = %shadow.display(), "vacuum.shadow.stale");
            fs::remove_file(&shadow)?;
        }
        let stats = match build_shadow(self, &shadow, target) {
            Ok(stats) => stats,
            Err(err) => {
                let _ = fs::remove_file(&shadow);
                return Err(err);
            }
        };
        if let Err(err) = fs::rename(&shadow, self.path()) {
            let _ = fs::remove_file(&shadow);
            return Err(err.into());
        }

        let pager = Pager::open(self.path())?;
        self.swap_pager(pager)?;
        let report = VacuumReport {
            duration: start.elapsed(),
            pages_before,
            pages_after: self.page_count(),
            page_size: target,
            structures: stats.structures,
            entries_copied: stats.entries_copied,
        };
        info!(
            pages_before = report.pages_before,
            pages_after = report.pages_after,
            page_size = report.page_size,
            entries = report.entries_copied,
            "vacuum.done"
        );
        Ok(report)
    }

    /// Writes a compacted copy of the store to `dst`, leaving the source
    /// untouched. The destination must not already exist.
    pub fn vacuum_into(
        &self,
        dst: impl AsRef<Path>,
        target_page_size: Option<u32>,
    ) -> Result<VacuumReport> {
        let start = Instant::now();
        let dst = dst.as_ref();
        let target = target_page_size.unwrap_or_else(|| self.page_size());
        page::validate_page_size(target)?;
        if dst == self.path() {
            return Err(VellumError::Invalid(
                "vacuum destination is the source store",
            ));
        }
        if dst.exists() {
            return Err(VellumError::Invalid("vacuum destination already exists"));
        }
        let stats = match build_shadow(self, dst, target) {
            Ok(stats) => stats,
            Err(err) => {
                let _ = fs::remove_file(dst);
                return Err(err);
            }
        };
        Ok(VacuumReport {
            duration: start.elapsed(),
            pages_before: self.page_count(),
            pages_after: stats.pages,
            page_size: target,
            structures: stats.structures,
            entries_copied: stats.entries_copied,
        })
    }
}

fn build_shadow(store: &Store, path: &Path, page_size: u32) -> Result<ShadowStats> {
    let pager = Pager::create(path, PagerOptions { page_size })?;
    build_into(store, &pager)
}

/// Rebuilds every structure of `store` into `dst`, walking the catalog in
/// id order so identical content always produces identical layout.
fn build_into(store: &Store, dst: &Pager) -> Result<ShadowStats> {
    let mut catalog = Catalog::create(dst)?;
    let sources = store.catalog().entries(store.pager())?;
    let mut entries_copied = 0u64;
    for source in &sources {
        let mut tree = BTree::create(dst)?;
        let mut count = 0u64;
        for item in BTree::open(source.root).scan(store.pager())? {
            let (key, value) = item?;
            tree.insert(dst, &key, &value)?;
            count += 1;
        }
        catalog.put(
            dst,
            &CatalogEntry {
                id: source.id,
                kind: source.kind,
                root: tree.root(),
                entry_count: count,
                name: source.name.clone(),
            },
        )?;
        debug!(structure = source.id.0, entries = count, "vacuum.copy");
        entries_copied += count;
    }
    let next_structure_id = store.pager().meta().next_structure_id;
    let root = catalog.root();
    dst.update_meta(|m| {
        m.catalog_root = root;
        m.next_structure_id = next_structure_id;
    });
    dst.persist()?;
    Ok(ShadowStats {
        structures: sources.len() as u64,
        entries_copied,
        pages: dst.page_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use vellum_io::{FileIo, StdFileIo};
    use vellum_types::PageId;

    use crate::StoreOptions;

    /// Io wrapper that starts failing writes after a budget is spent.
    struct FaultIo {
        inner: StdFileIo,
        writes_left: AtomicUsize,
    }

    impl FaultIo {
        fn new(inner: StdFileIo, budget: usize) -> Self {
            Self {
                inner,
                writes_left: AtomicUsize::new(budget),
            }
        }

        fn charge(&self) -> Result<()> {
            let left = self.writes_left.load(Ordering::Acquire);
            if left == 0 {
                return Err(VellumError::Io(std::io::Error::other(
                    "injected write failure",
                )));
            }
            self.writes_left.store(left - 1, Ordering::Release);
            Ok(())
        }
    }

    impl FileIo for FaultIo {
        fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
            self.inner.read_at(off, dst)
        }

        fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
            self.charge()?;
            self.inner.write_at(off, src)
        }

        fn sync_all(&self) -> Result<()> {
            self.inner.sync_all()
        }

        fn len(&self) -> Result<u64> {
            self.inner.len()
        }

        fn truncate(&self, len: u64) -> Result<()> {
            self.inner.truncate(len)
        }
    }

    fn seeded_store(dir: &Path) -> (Store, vellum_types::StructureId) {
        let mut store = Store::create(dir.join("src.vlm"), StoreOptions::default()).unwrap();
        let t = store.create_table("rows").unwrap();
        for i in 0..500u32 {
            store
                .insert(t, &i.to_be_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        store.flush().unwrap();
        (store, t)
    }

    #[test]
    fn append_suffix_extends_file_name() {
        let p = append_suffix(Path::new("/tmp/store.vlm"), "-vacuum");
        assert_eq!(p, PathBuf::from("/tmp/store.vlm-vacuum"));
    }

    #[test]
    fn failed_shadow_build_leaves_source_untouched() {
        let dir = tempdir().unwrap();
        let (store, _) = seeded_store(dir.path());
        let before = fs::read(store.path()).unwrap();

        let shadow_path = dir.path().join("shadow.vlm");
        let io = Arc::new(FaultIo::new(
            StdFileIo::open(&shadow_path).unwrap(),
            20,
        ));
        let result = Pager::create_with_io(io, PagerOptions { page_size: 4096 })
            .and_then(|pager| build_into(&store, &pager));
        assert!(matches!(result, Err(VellumError::Io(_))));

        let after = fs::read(store.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn vacuum_into_rejects_bad_destinations() {
        let dir = tempdir().unwrap();
        let (store, _) = seeded_store(dir.path());

        let err = store.vacuum_into(store.path(), None).unwrap_err();
        assert!(matches!(err, VellumError::Invalid(_)));

        let existing = dir.path().join("existing.vlm");
        fs::write(&existing, b"occupied").unwrap();
        let err = store.vacuum_into(&existing, None).unwrap_err();
        assert!(matches!(err, VellumError::Invalid(_)));
        assert_eq!(fs::read(&existing).unwrap(), b"occupied");

        let err = store
            .vacuum_into(dir.path().join("out.vlm"), Some(1234))
            .unwrap_err();
        assert!(matches!(err, VellumError::Geometry(_)));
        assert!(!dir.path().join("out.vlm").exists());
    }

    #[test]
    fn vacuum_reuses_low_page_numbers() {
        let dir = tempdir().unwrap();
        let (mut store, t) = seeded_store(dir.path());
        for i in 0..480u32 {
            store.delete(t, &i.to_be_bytes()).unwrap();
        }
        let report = store.vacuum(None).unwrap();
        assert!(report.pages_after < report.pages_before);
        assert_eq!(report.entries_copied, 20);
        // the rebuilt store packs pages from the front of the file
        let roots: Vec<PageId> = store.structures().unwrap().iter().map(|e| e.root).collect();
        assert!(roots.iter().all(|r| r.0 < report.pages_after));
        assert_eq!(store.free_page_count(), 0);
    }
}
