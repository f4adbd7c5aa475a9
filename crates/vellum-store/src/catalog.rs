//! Structure catalog.
//!
//! Tables and indexes are registered in a dedicated B-tree keyed by
//! big-endian structure id, with its root pinned in the meta page.
//! Enumeration order is ascending id, which is creation order; the compactor
//! relies on that order being stable.

use std::convert::TryInto;

use vellum_btree::BTree;
use vellum_pager::Pager;
use vellum_types::{PageId, Result, StructureId, StructureKind, VellumError};

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub id: StructureId,
    pub kind: StructureKind,
    pub root: PageId,
    pub entry_count: u64,
    pub name: String,
}

impl CatalogEntry {
    fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut out = Vec::with_capacity(1 + 8 + 8 + 2 + name.len());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.root.0.to_be_bytes());
        out.extend_from_slice(&self.entry_count.to_be_bytes());
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out
    }

    fn decode(id: StructureId, buf: &[u8]) -> Result<Self> {
        if buf.len() < 19 {
            return Err(VellumError::Corruption("catalog entry truncated"));
        }
        let kind = StructureKind::try_from(buf[0])?;
        let root = PageId(u64::from_be_bytes(buf[1..9].try_into().unwrap()));
        let entry_count = u64::from_be_bytes(buf[9..17].try_into().unwrap());
        let name_len = u16::from_be_bytes(buf[17..19].try_into().unwrap()) as usize;
        if buf.len() != 19 + name_len {
            return Err(VellumError::Corruption("catalog entry length mismatch"));
        }
        let name = std::str::from_utf8(&buf[19..])
            .map_err(|_| VellumError::Corruption("catalog name is not utf-8"))?
            .to_owned();
        Ok(Self {
            id,
            kind,
            root,
            entry_count,
            name,
        })
    }
}

fn catalog_key(id: StructureId) -> [u8; 4] {
    id.0.to_be_bytes()
}

/// Handle to the catalog tree. The root moves on splits; callers re-pin it
/// in the meta page after mutations.
pub struct Catalog {
    tree: BTree,
}

impl Catalog {
    pub fn create(pager: &Pager) -> Result<Self> {
        Ok(Self {
            tree: BTree::create(pager)?,
        })
    }

    pub fn open(root: PageId) -> Result<Self> {
        if root.0 == 0 {
            return Err(VellumError::Corruption("catalog root missing"));
        }
        Ok(Self {
            tree: BTree::open(root),
        })
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    /// Inserts or replaces a structure record.
    pub fn put(&mut self, pager: &Pager, entry: &CatalogEntry) -> Result<()> {
        self.tree
            .insert(pager, &catalog_key(entry.id), &entry.encode())?;
        Ok(())
    }

    /// Removes a structure record. Returns true when it existed.
    pub fn remove(&mut self, pager: &Pager, id: StructureId) -> Result<bool> {
        self.tree.delete(pager, &catalog_key(id))
    }

    pub fn get(&self, pager: &Pager, id: StructureId) -> Result<Option<CatalogEntry>> {
        match self.tree.get(pager, &catalog_key(id))? {
            Some(value) => Ok(Some(CatalogEntry::decode(id, &value)?)),
            None => Ok(None),
        }
    }

    pub fn find_by_name(&self, pager: &Pager, name: &str) -> Result<Option<CatalogEntry>> {
        for entry in self.entries(pager)? {
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// All structures in ascending id order.
    pub fn entries(&self, pager: &Pager) -> Result<Vec<CatalogEntry>> {
        let mut out = Vec::new();
        for item in self.tree.scan(pager)? {
            let (key, value) = item?;
            let id = StructureId(u32::from_be_bytes(
                key.as_slice()
                    .try_into()
                    .map_err(|_| VellumError::Corruption("catalog key is not a structure id"))?,
            ));
            out.push(CatalogEntry::decode(id, &value)?);
        }
        Ok(out)
    }
}
