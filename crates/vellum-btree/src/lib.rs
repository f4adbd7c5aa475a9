#![forbid(unsafe_code)]

//! Slotted-page B+ trees over the page store.

pub mod page;
pub mod tree;

pub use tree::{BTree, Scan};
