use tracing::debug;

use vellum_pager::Pager;
use vellum_types::page::{PageHeader, PAGE_HDR_LEN};
use vellum_types::{PageId, Result, VellumError};

use crate::page::{
    internal_cell_size, leaf_cell_size, max_cell_size, usable_space, InternalCell, InternalNode,
    LeafCell, LeafNode, Node,
};

/// B+ tree of byte-string entries over a page store.
///
/// Splits may relocate the root; callers persist `root()` after mutations.
/// Deletes never merge or free pages, so a heavily-deleted tree keeps its
/// page footprint until the store is compacted.
#[derive(Clone, Copy, Debug)]
pub struct BTree {
    root: PageId,
}

/// Outcome of a recursive insert: the page split and its upper half now
/// lives at `right`, reachable for keys `>= sep`.
struct Split {
    sep: Vec<u8>,
    right: PageId,
}

impl BTree {
    /// Allocates an empty tree: a single leaf root.
    pub fn create(pager: &Pager) -> Result<Self> {
        let root = pager.allocate()?;
        write_node(pager, root, &Node::Leaf(LeafNode::empty()))?;
        Ok(Self { root })
    }

    /// Attaches to an existing tree by its root page.
    pub fn open(root: PageId) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Inserts or replaces an entry. Returns true when the key was new.
    pub fn insert(&mut self, pager: &Pager, key: &[u8], value: &[u8]) -> Result<bool> {
        let page_size = pager.page_size() as usize;
        let limit = max_cell_size(page_size);
        if leaf_cell_size(key, value) > limit || internal_cell_size(key) > limit {
            return Err(VellumError::Invalid("entry too large for page size"));
        }
        let (inserted, split) = self.insert_rec(pager, self.root, key, value)?;
        if let Some(split) = split {
            let new_root = pager.allocate()?;
            let node = Node::Internal(InternalNode {
                right: split.right,
                cells: vec![InternalCell {
                    child: self.root,
                    sep: split.sep,
                }],
            });
            write_node(pager, new_root, &node)?;
            debug!(old = self.root.0, new = new_root.0, "btree.root.split");
            self.root = new_root;
        }
        Ok(inserted)
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, pager: &Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut page = self.root;
        loop {
            match read_node(pager, page)? {
                Node::Internal(node) => {
                    page = route(&node, key);
                }
                Node::Leaf(node) => {
                    return Ok(node
                        .cells
                        .iter()
                        .find(|c| c.key.as_slice() == key)
                        .map(|c| c.value.clone()));
                }
            }
        }
    }

    /// Removes an entry. Returns true when the key was present.
    ///
    /// The leaf is rewritten in place; no rebalancing happens.
    pub fn delete(&mut self, pager: &Pager, key: &[u8]) -> Result<bool> {
        let mut page = self.root;
        loop {
            match read_node(pager, page)? {
                Node::Internal(node) => {
                    page = route(&node, key);
                }
                Node::Leaf(mut node) => {
                    let Some(idx) = node.cells.iter().position(|c| c.key.as_slice() == key)
                    else {
                        return Ok(false);
                    };
                    node.cells.remove(idx);
                    write_node(pager, page, &Node::Leaf(node))?;
                    return Ok(true);
                }
            }
        }
    }

    /// Every page of the tree, in descent order. Used when a whole
    /// structure is dropped and its pages go back to the free set.
    pub fn pages(&self, pager: &Pager) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        self.collect_pages(pager, self.root, &mut out)?;
        Ok(out)
    }

    fn collect_pages(&self, pager: &Pager, page: PageId, out: &mut Vec<PageId>) -> Result<()> {
        out.push(page);
        if let Node::Internal(node) = read_node(pager, page)? {
            for cell in &node.cells {
                self.collect_pages(pager, cell.child, out)?;
            }
            self.collect_pages(pager, node.right, out)?;
        }
        Ok(())
    }

    /// In-order cursor over all entries, walking the leaf sibling chain.
    pub fn scan<'p>(&self, pager: &'p Pager) -> Result<Scan<'p>> {
        let mut page = self.root;
        loop {
            match read_node(pager, page)? {
                Node::Internal(node) => {
                    page = match node.cells.first() {
                        Some(cell) => cell.child,
                        None => node.right,
                    };
                }
                Node::Leaf(node) => {
                    return Ok(Scan {
                        pager,
                        cells: node.cells.into_iter(),
                        next: node.right,
                    });
                }
            }
        }
    }

    fn insert_rec(
        &self,
        pager: &Pager,
        page: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<(bool, Option<Split>)> {
        match read_node(pager, page)? {
            Node::Leaf(mut node) => {
                let inserted;
                match node.cells.binary_search_by(|c| c.key.as_slice().cmp(key)) {
                    Ok(idx) => {
                        node.cells[idx].value = value.to_vec();
                        inserted = false;
                    }
                    Err(idx) => {
                        node.cells.insert(
                            idx,
                            LeafCell {
                                key: key.to_vec(),
                                value: value.to_vec(),
                            },
                        );
                        inserted = true;
                    }
                }
                let page_size = pager.page_size() as usize;
                if node.content_size() <= usable_space(page_size) {
                    write_node(pager, page, &Node::Leaf(node))?;
                    return Ok((inserted, None));
                }
                let split = self.split_leaf(pager, page, node)?;
                Ok((inserted, Some(split)))
            }
            Node::Internal(mut node) => {
                let idx = node
                    .cells
                    .partition_point(|c| c.sep.as_slice() <= key);
                let child = if idx < node.cells.len() {
                    node.cells[idx].child
                } else {
                    node.right
                };
                let (inserted, child_split) = self.insert_rec(pager, child, key, value)?;
                let Some(child_split) = child_split else {
                    return Ok((inserted, None));
                };
                // the child kept its lower half; keys >= sep now live in
                // the split's right page
                if idx < node.cells.len() {
                    node.cells[idx].child = child_split.right;
                } else {
                    node.right = child_split.right;
                }
                node.cells.insert(
                    idx,
                    InternalCell {
                        child,
                        sep: child_split.sep,
                    },
                );
                let page_size = pager.page_size() as usize;
                if node.content_size() <= usable_space(page_size) {
                    write_node(pager, page, &Node::Internal(node))?;
                    return Ok((inserted, None));
                }
                let split = self.split_internal(pager, page, node)?;
                Ok((inserted, Some(split)))
            }
        }
    }

    fn split_leaf(&self, pager: &Pager, page: PageId, node: LeafNode) -> Result<Split> {
        let page_size = pager.page_size() as usize;
        let sizes: Vec<usize> = node
            .cells
            .iter()
            .map(|c| leaf_cell_size(&c.key, &c.value) + 2)
            .collect();
        let h = split_point(&sizes, usable_space(page_size));
        let mut cells = node.cells;
        let upper = cells.split_off(h);
        let sep = upper[0].key.clone();
        let right = pager.allocate()?;
        let left_node = LeafNode {
            right,
            cells,
        };
        let right_node = LeafNode {
            right: node.right,
            cells: upper,
        };
        write_node(pager, right, &Node::Leaf(right_node))?;
        write_node(pager, page, &Node::Leaf(left_node))?;
        debug!(page = page.0, right = right.0, "btree.leaf.split");
        Ok(Split { sep, right })
    }

    fn split_internal(&self, pager: &Pager, page: PageId, node: InternalNode) -> Result<Split> {
        let page_size = pager.page_size() as usize;
        let sizes: Vec<usize> = node
            .cells
            .iter()
            .map(|c| internal_cell_size(&c.sep) + 2)
            .collect();
        // promote the cell at the split point; both sides stay non-empty
        // because an overflowing internal node has at least three cells
        let h = split_point(&sizes, usable_space(page_size)).min(node.cells.len() - 2);
        let mut cells = node.cells;
        let mut upper = cells.split_off(h);
        let promoted = upper.remove(0);
        let right = pager.allocate()?;
        let left_node = InternalNode {
            right: promoted.child,
            cells,
        };
        let right_node = InternalNode {
            right: node.right,
            cells: upper,
        };
        write_node(pager, right, &Node::Internal(right_node))?;
        write_node(pager, page, &Node::Internal(left_node))?;
        debug!(page = page.0, right = right.0, "btree.internal.split");
        Ok(Split {
            sep: promoted.sep,
            right,
        })
    }
}

/// Picks the first slot index that sends the lower half left, stepping back
/// when a large cell would push the left side past page capacity.
fn split_point(sizes: &[usize], capacity: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let half = total / 2;
    let mut acc = 0;
    let mut h = sizes.len() - 1;
    for (i, s) in sizes.iter().enumerate().take(sizes.len() - 1) {
        acc += s;
        if acc >= half {
            h = i + 1;
            break;
        }
    }
    if h > 1 && sizes[..h].iter().sum::<usize>() > capacity {
        h -= 1;
    }
    h.max(1)
}

fn route(node: &InternalNode, key: &[u8]) -> PageId {
    let idx = node.cells.partition_point(|c| c.sep.as_slice() <= key);
    if idx < node.cells.len() {
        node.cells[idx].child
    } else {
        node.right
    }
}

fn read_node(pager: &Pager, id: PageId) -> Result<Node> {
    let mut buf = vec![0u8; pager.page_size() as usize];
    pager.read_page(id, &mut buf)?;
    Node::decode(&buf)
}

fn write_node(pager: &Pager, id: PageId, node: &Node) -> Result<()> {
    let mut buf = vec![0u8; pager.page_size() as usize];
    let header = PageHeader::new(id, node.kind(), pager.page_size(), pager.salt())?.with_crc32(0);
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    node.encode(&mut buf)?;
    pager.write_page(id, &mut buf)
}

/// Forward cursor over a tree's entries in key order.
pub struct Scan<'p> {
    pager: &'p Pager,
    cells: std::vec::IntoIter<LeafCell>,
    next: PageId,
}

impl Iterator for Scan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.cells.next() {
                return Some(Ok((cell.key, cell.value)));
            }
            if self.next.0 == 0 {
                return None;
            }
            match read_node(self.pager, self.next) {
                Ok(Node::Leaf(node)) => {
                    self.cells = node.cells.into_iter();
                    self.next = node.right;
                }
                Ok(Node::Internal(_)) => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use vellum_pager::PagerOptions;

    fn test_pager(page_size: u32) -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(
            dir.path().join("tree.vlm"),
            PagerOptions { page_size },
        )
        .unwrap();
        (dir, pager)
    }

    #[test]
    fn insert_get_single_leaf() {
        let (_dir, pager) = test_pager(4096);
        let mut tree = BTree::create(&pager).unwrap();
        assert!(tree.insert(&pager, b"b", b"2").unwrap());
        assert!(tree.insert(&pager, b"a", b"1").unwrap());
        assert!(!tree.insert(&pager, b"a", b"one").unwrap());
        assert_eq!(tree.get(&pager, b"a").unwrap(), Some(b"one".to_vec()));
        assert_eq!(tree.get(&pager, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(&pager, b"c").unwrap(), None);
    }

    #[test]
    fn splits_keep_order_and_content() {
        let (_dir, pager) = test_pager(512);
        let mut tree = BTree::create(&pager).unwrap();
        let old_root = tree.root();
        let mut expect = BTreeMap::new();
        for i in 0..500u32 {
            // shuffled-ish insertion order
            let n = (i * 37) % 500;
            let key = format!("key{n:05}").into_bytes();
            let value = vec![b'v'; (n % 40) as usize + 1];
            tree.insert(&pager, &key, &value).unwrap();
            expect.insert(key, value);
        }
        assert_ne!(tree.root(), old_root);

        let got: Vec<_> = tree
            .scan(&pager)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let want: Vec<_> = expect.into_iter().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn delete_leaves_pages_in_place() {
        let (_dir, pager) = test_pager(512);
        let mut tree = BTree::create(&pager).unwrap();
        for i in 0..300u32 {
            let key = format!("k{i:05}").into_bytes();
            tree.insert(&pager, &key, b"payload-payload").unwrap();
        }
        let pages_full = pager.page_count();
        for i in 0..300u32 {
            if i % 10 != 0 {
                let key = format!("k{i:05}").into_bytes();
                assert!(tree.delete(&pager, &key).unwrap());
            }
        }
        assert_eq!(pager.page_count(), pages_full);
        assert_eq!(pager.free_page_count(), 0);
        let remaining = tree.scan(&pager).unwrap().count();
        assert_eq!(remaining, 30);
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let (_dir, pager) = test_pager(4096);
        let mut tree = BTree::create(&pager).unwrap();
        tree.insert(&pager, b"x", b"1").unwrap();
        assert!(!tree.delete(&pager, b"y").unwrap());
        assert!(tree.delete(&pager, b"x").unwrap());
        assert!(!tree.delete(&pager, b"x").unwrap());
    }

    #[test]
    fn rejects_oversized_entry() {
        let (_dir, pager) = test_pager(512);
        let mut tree = BTree::create(&pager).unwrap();
        let err = tree
            .insert(&pager, b"k", &vec![0u8; 4096])
            .unwrap_err();
        assert!(matches!(err, VellumError::Invalid(_)));
    }

    #[test]
    fn scan_of_empty_tree_is_empty() {
        let (_dir, pager) = test_pager(4096);
        let tree = BTree::create(&pager).unwrap();
        assert_eq!(tree.scan(&pager).unwrap().count(), 0);
    }

    #[test]
    fn split_point_respects_capacity() {
        // a small cell followed by two near-half-page cells must not land
        // both large cells on one side
        let sizes = vec![26, 25, 50, 49];
        let h = split_point(&sizes, 100);
        assert!(sizes[..h].iter().sum::<usize>() <= 100);
        assert!(sizes[h..].iter().sum::<usize>() <= 100);
        assert!(h >= 1 && h < sizes.len());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn matches_btreemap_model(
            ops in prop::collection::vec(
                (prop::collection::vec(any::<u8>(), 1..24),
                 prop::collection::vec(any::<u8>(), 0..48),
                 any::<bool>()),
                1..200,
            )
        ) {
            let (_dir, pager) = test_pager(512);
            let mut tree = BTree::create(&pager).unwrap();
            let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for (key, value, is_insert) in ops {
                if is_insert {
                    let fresh = tree.insert(&pager, &key, &value).unwrap();
                    prop_assert_eq!(fresh, !model.contains_key(&key));
                    model.insert(key, value);
                } else {
                    let removed = tree.delete(&pager, &key).unwrap();
                    prop_assert_eq!(removed, model.remove(&key).is_some());
                }
            }
            let got: Vec<_> = tree
                .scan(&pager)
                .unwrap()
                .collect::<Result<Vec<_>>>()
                .unwrap();
            let want: Vec<_> = model.into_iter().collect();
            prop_assert_eq!(got, want);
        }
    }
}
