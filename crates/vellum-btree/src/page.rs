//! On-page node format.
//!
//! A node page carries a 16-byte payload header after the fixed page header,
//! cell content growing upward from the header, and a slot directory of
//! big-endian u16 cell offsets growing downward from the page tail. Slots are
//! kept in key order; cell content order is arbitrary.
//!
//! Leaf cells: `varint key_len | varint val_len | key | value`.
//! Internal cells: `child u64 | sep_len u16 | sep`.

use std::convert::TryInto;
use std::ops::Range;

use vellum_types::page::{PageHeader, PageKind, PAGE_HDR_LEN};
use vellum_types::{PageId, Result, VellumError};

/// Leaf: right sibling page (0 = none). Internal: rightmost child.
pub const NODE_RIGHT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
pub const NODE_SLOT_COUNT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 10;
/// Offset of the first unused content byte, from the page start.
pub const NODE_FREE_START: Range<usize> = PAGE_HDR_LEN + 10..PAGE_HDR_LEN + 12;
/// Offset of the first slot, from the page start. Zero encodes `page_size`.
pub const NODE_FREE_END: Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 14;
pub const NODE_RESERVED: Range<usize> = PAGE_HDR_LEN + 14..PAGE_HDR_LEN + 16;

pub const NODE_HDR_LEN: usize = 16;

/// Bytes available for cells and slots on one node page.
pub fn usable_space(page_size: usize) -> usize {
    page_size - PAGE_HDR_LEN - NODE_HDR_LEN
}

/// Largest cell a page accepts. Two maximal cells always fit on one page, so
/// splits always make progress.
pub fn max_cell_size(page_size: usize) -> usize {
    usable_space(page_size) / 2 - 2
}

pub fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    for (i, byte) in buf.iter().enumerate().take(10) {
        v |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((v, i + 1));
        }
    }
    Err(VellumError::Corruption("varint overruns cell"))
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeafCell {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalCell {
    pub child: PageId,
    pub sep: Vec<u8>,
}

pub fn leaf_cell_size(key: &[u8], value: &[u8]) -> usize {
    varint_len(key.len() as u64) + varint_len(value.len() as u64) + key.len() + value.len()
}

pub fn internal_cell_size(sep: &[u8]) -> usize {
    8 + 2 + sep.len()
}

fn encode_leaf_cell(out: &mut Vec<u8>, cell: &LeafCell) {
    write_varint(out, cell.key.len() as u64);
    write_varint(out, cell.value.len() as u64);
    out.extend_from_slice(&cell.key);
    out.extend_from_slice(&cell.value);
}

fn decode_leaf_cell(buf: &[u8]) -> Result<LeafCell> {
    let (key_len, n1) = read_varint(buf)?;
    let (val_len, n2) = read_varint(&buf[n1..])?;
    let key_start = n1 + n2;
    let val_start = key_start + key_len as usize;
    let end = val_start + val_len as usize;
    if end > buf.len() {
        return Err(VellumError::Corruption("leaf cell overruns page"));
    }
    Ok(LeafCell {
        key: buf[key_start..val_start].to_vec(),
        value: buf[val_start..end].to_vec(),
    })
}

fn encode_internal_cell(out: &mut Vec<u8>, cell: &InternalCell) {
    out.extend_from_slice(&cell.child.0.to_be_bytes());
    out.extend_from_slice(&(cell.sep.len() as u16).to_be_bytes());
    out.extend_from_slice(&cell.sep);
}

fn decode_internal_cell(buf: &[u8]) -> Result<InternalCell> {
    if buf.len() < 10 {
        return Err(VellumError::Corruption("internal cell overruns page"));
    }
    let child = PageId(u64::from_be_bytes(buf[0..8].try_into().unwrap()));
    let sep_len = u16::from_be_bytes(buf[8..10].try_into().unwrap()) as usize;
    if 10 + sep_len > buf.len() {
        return Err(VellumError::Corruption("internal cell overruns page"));
    }
    Ok(InternalCell {
        child,
        sep: buf[10..10 + sep_len].to_vec(),
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
    pub right: PageId,
    pub cells: Vec<LeafCell>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalNode {
    pub right: PageId,
    pub cells: Vec<InternalCell>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl LeafNode {
    pub fn empty() -> Self {
        Self {
            right: PageId(0),
            cells: Vec::new(),
        }
    }

    pub fn content_size(&self) -> usize {
        self.cells
            .iter()
            .map(|c| leaf_cell_size(&c.key, &c.value) + 2)
            .sum()
    }
}

impl InternalNode {
    pub fn content_size(&self) -> usize {
        self.cells
            .iter()
            .map(|c| internal_cell_size(&c.sep) + 2)
            .sum()
    }
}

impl Node {
    pub fn kind(&self) -> PageKind {
        match self {
            Node::Leaf(_) => PageKind::BTreeLeaf,
            Node::Internal(_) => PageKind::BTreeInternal,
        }
    }

    pub fn content_size(&self) -> usize {
        match self {
            Node::Leaf(n) => n.content_size(),
            Node::Internal(n) => n.content_size(),
        }
    }

    pub fn cell_count(&self) -> usize {
        match self {
            Node::Leaf(n) => n.cells.len(),
            Node::Internal(n) => n.cells.len(),
        }
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.content_size() <= usable_space(page_size)
    }

    /// Serializes the node into a page image, leaving the fixed page header
    /// bytes untouched.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let page_size = buf.len();
        if !self.fits(page_size) {
            return Err(VellumError::Invalid("node does not fit on page"));
        }
        buf[PAGE_HDR_LEN..].fill(0);
        let right = match self {
            Node::Leaf(n) => n.right,
            Node::Internal(n) => n.right,
        };
        buf[NODE_RIGHT].copy_from_slice(&right.0.to_be_bytes());
        let count = self.cell_count();
        buf[NODE_SLOT_COUNT].copy_from_slice(&(count as u16).to_be_bytes());

        let mut content: Vec<u8> = Vec::with_capacity(self.content_size());
        let mut offsets: Vec<u16> = Vec::with_capacity(count);
        let base = PAGE_HDR_LEN + NODE_HDR_LEN;
        match self {
            Node::Leaf(n) => {
                for cell in &n.cells {
                    offsets.push((base + content.len()) as u16);
                    encode_leaf_cell(&mut content, cell);
                }
            }
            Node::Internal(n) => {
                for cell in &n.cells {
                    offsets.push((base + content.len()) as u16);
                    encode_internal_cell(&mut content, cell);
                }
            }
        }
        let free_start = base + content.len();
        let free_end = page_size - 2 * count;
        buf[base..free_start].copy_from_slice(&content);
        buf[NODE_FREE_START].copy_from_slice(&(free_start as u16).to_be_bytes());
        buf[NODE_FREE_END].copy_from_slice(&((free_end % (1 << 16)) as u16).to_be_bytes());
        for (i, off) in offsets.iter().enumerate() {
            let at = page_size - 2 * (i + 1);
            buf[at..at + 2].copy_from_slice(&off.to_be_bytes());
        }
        Ok(())
    }

    /// Deserializes a node from a page image whose checksum has already been
    /// verified by the pager.
    pub fn decode(buf: &[u8]) -> Result<Node> {
        let page_size = buf.len();
        let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
        let right = PageId(u64::from_be_bytes(buf[NODE_RIGHT].try_into().unwrap()));
        let count = u16::from_be_bytes(buf[NODE_SLOT_COUNT].try_into().unwrap()) as usize;
        if page_size < PAGE_HDR_LEN + NODE_HDR_LEN + 2 * count {
            return Err(VellumError::Corruption("slot directory overruns page"));
        }
        let free_end_raw = u16::from_be_bytes(buf[NODE_FREE_END].try_into().unwrap()) as usize;
        let free_end = if free_end_raw == 0 {
            page_size
        } else {
            free_end_raw
        };
        if free_end != page_size - 2 * count {
            return Err(VellumError::Corruption("slot directory miscounted"));
        }
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let at = page_size - 2 * (i + 1);
            let off = u16::from_be_bytes(buf[at..at + 2].try_into().unwrap()) as usize;
            if off < PAGE_HDR_LEN + NODE_HDR_LEN || off >= free_end {
                return Err(VellumError::Corruption("cell offset out of bounds"));
            }
            slots.push(off);
        }
        match header.kind {
            PageKind::BTreeLeaf => {
                let mut cells = Vec::with_capacity(count);
                for off in slots {
                    cells.push(decode_leaf_cell(&buf[off..free_end])?);
                }
                Ok(Node::Leaf(LeafNode { right, cells }))
            }
            PageKind::BTreeInternal => {
                let mut cells = Vec::with_capacity(count);
                for off in slots {
                    cells.push(decode_internal_cell(&buf[off..free_end])?);
                }
                Ok(Node::Internal(InternalNode { right, cells }))
            }
            _ => Err(VellumError::Corruption("page is not a tree node")),
        }
    }
}
