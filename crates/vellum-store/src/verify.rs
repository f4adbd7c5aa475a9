//! Integrity verification.
//!
//! Read-only sweep over the whole store: header and checksum of every
//! allocated page, tree shape and key order of every structure, catalog
//! consistency, and the page-ownership partition (every page is the meta
//! page, owned by exactly one tree, part of the freelist, or free).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;

use tracing::{debug, warn};

use vellum_btree::page::Node;
use vellum_pager::Pager;
use vellum_types::{PageId, Result};

use crate::Store;

/// Findings beyond this are dropped and the report marked truncated.
const MAX_FINDINGS: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug)]
pub struct Finding {
    pub severity: Severity,
    pub page: Option<PageId>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub findings: Vec<Finding>,
    pub pages_checked: u64,
    pub structures_checked: u64,
    pub entries_seen: u64,
    pub truncated: bool,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Diagnostic verdict: `"ok"` when clean, else the first finding.
    pub fn verdict(&self) -> String {
        match self.findings.first() {
            None => "ok".to_owned(),
            Some(finding) => finding.message.clone(),
        }
    }
}

impl Store {
    /// Checks the whole store without modifying it.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let mut v = Verifier::new(self.pager());
        v.check_file_length(self.path())?;
        v.check_free_set();

        v.claim(PageId(0), "meta".to_owned());
        for page in self.pager().freelist_chain() {
            v.claim(page, "freelist chain".to_owned());
            v.check_page_readable(page);
        }

        let catalog_root = self.pager().meta().catalog_root;
        v.walk_tree(catalog_root, "catalog".to_owned());

        match self.catalog().entries(self.pager()) {
            Ok(entries) => {
                for entry in entries {
                    let label = format!("structure {}", entry.id.0);
                    let walk = v.walk_tree(entry.root, label.clone());
                    v.report.structures_checked += 1;
                    v.report.entries_seen += walk.entries;
                    if walk.complete && walk.entries != entry.entry_count {
                        let mut message = String::new();
                        let _ = write!(
                            message,
                            "{label} holds {} entries but the catalog records {}",
                            walk.entries, entry.entry_count
                        );
                        v.finding(Severity::Error, None, message);
                    }
                }
            }
            Err(err) => {
                v.finding(
                    Severity::Error,
                    Some(catalog_root),
                    format!("catalog unreadable: {err}"),
                );
            }
        }

        v.check_partition();
        v.report.pages_checked = v.next_page.0;
        if !v.report.is_clean() {
            warn!(findings = v.report.findings.len(), "verify.findings");
        } else {
            debug!(pages = v.report.pages_checked, "verify.clean");
        }
        Ok(v.report)
    }
}

struct TreeWalk {
    entries: u64,
    /// False when a finding stopped the walk early; counts are unreliable.
    complete: bool,
}

struct Verifier<'p> {
    pager: &'p Pager,
    next_page: PageId,
    owners: HashMap<u64, String>,
    report: IntegrityReport,
}

impl<'p> Verifier<'p> {
    fn new(pager: &'p Pager) -> Self {
        Self {
            pager,
            next_page: pager.meta().next_page,
            owners: HashMap::new(),
            report: IntegrityReport::default(),
        }
    }

    fn finding(&mut self, severity: Severity, page: Option<PageId>, message: String) {
        if self.report.findings.len() >= MAX_FINDINGS {
            self.report.truncated = true;
            return;
        }
        self.report.findings.push(Finding {
            severity,
            page,
            message,
        });
    }

    fn check_file_length(&mut self, path: &std::path::Path) -> Result<()> {
        let len = fs::metadata(path)?.len();
        let expect = self.next_page.0 * self.pager.page_size() as u64;
        if len != expect {
            self.finding(
                Severity::Error,
                None,
                format!("file is {len} bytes, expected {expect}"),
            );
        }
        Ok(())
    }

    fn check_free_set(&mut self) {
        let free = self.pager.free_pages();
        let meta = self.pager.meta();
        if free.len() as u64 != meta.free_page_count {
            self.finding(
                Severity::Error,
                None,
                format!(
                    "free-space tracker holds {} pages, meta records {}",
                    free.len(),
                    meta.free_page_count
                ),
            );
        }
        for page in free {
            if page.0 == 0 || page.0 >= self.next_page.0 {
                self.finding(
                    Severity::Error,
                    Some(page),
                    "free page outside the allocated range".to_owned(),
                );
                continue;
            }
            self.claim(page, "free set".to_owned());
        }
    }

    /// Records page ownership; a second claim is a partition violation.
    fn claim(&mut self, page: PageId, owner: String) -> bool {
        if let Some(previous) = self.owners.get(&page.0) {
            let message = format!("page owned by both {previous} and {owner}");
            self.finding(Severity::Error, Some(page), message);
            return false;
        }
        self.owners.insert(page.0, owner);
        true
    }

    fn check_page_readable(&mut self, page: PageId) {
        let mut buf = vec![0u8; self.pager.page_size() as usize];
        if let Err(err) = self.pager.read_page(page, &mut buf) {
            self.finding(Severity::Error, Some(page), format!("unreadable: {err}"));
        }
    }

    /// Walks one tree: claims its pages, checks node shape, key order, and
    /// the leaf sibling chain, and counts entries.
    fn walk_tree(&mut self, root: PageId, label: String) -> TreeWalk {
        let mut walk = TreeWalk {
            entries: 0,
            complete: true,
        };
        if root.0 == 0 || root.0 >= self.next_page.0 {
            self.finding(
                Severity::Error,
                Some(root),
                format!("{label}: root outside the allocated range"),
            );
            walk.complete = false;
            return walk;
        }
        let mut last_key: Option<Vec<u8>> = None;
        let mut leaves: Vec<(PageId, PageId)> = Vec::new();
        self.walk_node(root, &label, &mut walk, &mut last_key, &mut leaves);
        for pair in leaves.windows(2) {
            if pair[0].1 != pair[1].0 {
                self.finding(
                    Severity::Error,
                    Some(pair[0].0),
                    format!("{label}: leaf sibling pointer skips a leaf"),
                );
                walk.complete = false;
            }
        }
        if let Some(last) = leaves.last() {
            if last.1 .0 != 0 {
                self.finding(
                    Severity::Error,
                    Some(last.0),
                    format!("{label}: last leaf has a dangling sibling pointer"),
                );
                walk.complete = false;
            }
        }
        walk
    }

    fn walk_node(
        &mut self,
        page: PageId,
        label: &str,
        walk: &mut TreeWalk,
        last_key: &mut Option<Vec<u8>>,
        leaves: &mut Vec<(PageId, PageId)>,
    ) {
        if page.0 == 0 || page.0 >= self.next_page.0 {
            self.finding(
                Severity::Error,
                Some(page),
                format!("{label}: child pointer outside the allocated range"),
            );
            walk.complete = false;
            return;
        }
        if !self.claim(page, label.to_owned()) {
            // double claim also covers cycles; stop descending
            walk.complete = false;
            return;
        }
        let mut buf = vec![0u8; self.pager.page_size() as usize];
        if let Err(err) = self.pager.read_page(page, &mut buf) {
            self.finding(Severity::Error, Some(page), format!("{label}: {err}"));
            walk.complete = false;
            return;
        }
        match Node::decode(&buf) {
            Ok(Node::Internal(node)) => {
                for cell in &node.cells {
                    self.walk_node(cell.child, label, walk, last_key, leaves);
                }
                self.walk_node(node.right, label, walk, last_key, leaves);
            }
            Ok(Node::Leaf(node)) => {
                for cell in &node.cells {
                    if let Some(last) = last_key.as_ref() {
                        if cell.key <= *last {
                            self.finding(
                                Severity::Error,
                                Some(page),
                                format!("{label}: keys out of order"),
                            );
                            walk.complete = false;
                        }
                    }
                    *last_key = Some(cell.key.clone());
                    walk.entries += 1;
                }
                leaves.push((page, node.right));
            }
            Err(err) => {
                self.finding(Severity::Error, Some(page), format!("{label}: {err}"));
                walk.complete = false;
            }
        }
    }

    /// Every page below the watermark must have exactly one owner.
    fn check_partition(&mut self) {
        for id in 1..self.next_page.0 {
            if !self.owners.contains_key(&id) {
                self.finding(
                    Severity::Error,
                    Some(PageId(id)),
                    "page neither reachable from a root nor free".to_owned(),
                );
            }
        }
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.page {
            Some(page) => write!(f, "page {page}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
