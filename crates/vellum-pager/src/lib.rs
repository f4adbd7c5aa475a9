#![forbid(unsafe_code)]

//! Disk-backed page store.
//!
//! A store is a single file of fixed-size pages. Page 0 carries the store
//! metadata; freed pages are tracked as coalesced extents in a freelist chain
//! that is rebuilt on every flush, shrinking the file when the tail is free.

pub mod freelist;
pub mod meta;
pub mod pager;

pub use freelist::{Extent, FreeCache};
pub use meta::{probe_page_size, Meta};
pub use pager::{page_offset, Pager, PagerOptions};
