//! Umbra is the blob storage engine of an embedded key-value database:
//! records of arbitrary size persisted on a paged, file-backed device with
//! an optional memory-mapped fast path, optional symmetric encryption,
//! optional record compression, and end-to-end checksums for multi-page
//! blobs.
//!
//! The pieces compose bottom-up: a [`device::Device`] owns the file and its
//! mapping, the [`pager::PageManager`] caches pages and allocates runs of
//! consecutive pages, and the [`blob::BlobManager`] lays records out in
//! pages with an in-page freelist for reuse.

pub mod blob;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod device;
pub mod error;
pub mod page;
pub mod pager;

pub use crate::blob::{
    BlobId, BlobManager, PartialRange, Payload, ReadOptions, Record, RecordSource, WriteFlags,
};
pub use crate::compress::{Compressor, Lz4Compressor};
pub use crate::config::{Config, PosixAdvice};
pub use crate::device::{Device, DiskDevice, MemDevice};
pub use crate::error::{Result, UmbraError};
pub use crate::page::Page;
pub use crate::pager::{Context, FetchOptions, PageManager};
