//! Blob persistence: allocate, read, overwrite, and erase records of
//! arbitrary size on the paged device, with optional compression and
//! optional end-to-end checksums for multi-page blobs.

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::checksum::payload_crc32;
use crate::compress::{resize_buffer, Compressor};
use crate::config::Config;
use crate::device::Device;
use crate::error::{Result, UmbraError};
use crate::pager::{Context, FetchOptions};

pub mod chunks;
pub mod freelist;
pub mod layout;

use chunks::{copy_chunk, read_blob_header, write_chunks};
use layout::{BlobHeader, BlobPageHeader, FreeSlot, BLOB_HEADER_SIZE, PAGE_OVERHEAD};

/// Records are capped at 2 GiB so every on-disk size fits comfortably in
/// the header's u32 accounting.
pub const MAX_RECORD_SIZE: u32 = i32::MAX as u32;

/// Opaque 64-bit file offset of a blob header. Assigned at allocation and
/// stable for the blob's lifetime except across grow-overwrites.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bytes handed to `allocate` or `overwrite`. A partial payload updates the
/// window `[offset, offset + window.len())` of a record that is logically
/// `total_size` bytes; the bytes outside the window are zero-filled on
/// allocate and left untouched on overwrite.
#[derive(Clone, Copy, Debug)]
pub enum Payload<'a> {
    Full(&'a [u8]),
    Partial {
        window: &'a [u8],
        offset: u32,
        total_size: u32,
    },
}

impl<'a> Payload<'a> {
    fn window(&self) -> &'a [u8] {
        match *self {
            Self::Full(data) => data,
            Self::Partial { window, .. } => window,
        }
    }

    fn total_size(&self) -> Result<u32> {
        let total = match self {
            Self::Full(data) => data.len() as u64,
            Self::Partial { total_size, .. } => *total_size as u64,
        };
        if total > MAX_RECORD_SIZE as u64 {
            return Err(UmbraError::InvalidParameter("record exceeds maximum size"));
        }
        Ok(total as u32)
    }

    fn partial(&self) -> Option<(u32, u32)> {
        match self {
            Self::Full(_) => None,
            Self::Partial { window, offset, .. } => Some((*offset, window.len() as u32)),
        }
    }

    fn validate(&self) -> Result<()> {
        let total = self.total_size()?;
        if let Some((offset, len)) = self.partial() {
            if offset as u64 + len as u64 > total as u64 {
                return Err(UmbraError::InvalidParameter(
                    "partial window exceeds record size",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteFlags {
    /// Store this record uncompressed even when a compressor is configured.
    pub disable_compression: bool,
}

/// Window of a logical record requested by a partial read.
#[derive(Clone, Copy, Debug)]
pub struct PartialRange {
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    pub partial: Option<PartialRange>,
    /// Disable the zero-copy mapped fast path.
    pub force_deep_copy: bool,
}

/// Where a returned record's bytes live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordSource {
    /// Empty record; no bytes exist.
    Empty,
    /// Zero-copy view into the device's mapped region.
    Mapped,
    /// Copied into the manager's arena.
    Copied,
}

/// A record view returned by `read`. Valid until the next call on the
/// manager that mutates its arena.
#[derive(Debug)]
pub struct Record<'a> {
    data: &'a [u8],
    source: RecordSource,
}

impl<'a> Record<'a> {
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn source(&self) -> RecordSource {
        self.source
    }

    fn empty() -> Self {
        Self {
            data: &[],
            source: RecordSource::Empty,
        }
    }
}

/// End-to-end blob storage over a device and a page manager. Pages are
/// borrowed from the page manager through the caller's [`Context`] for the
/// duration of a single call, never across calls.
pub struct BlobManager {
    device: Arc<Device>,
    config: Config,
    compressor: Option<Box<dyn Compressor>>,
    arena: Vec<u8>,
    scratch: Vec<u8>,
}

impl BlobManager {
    pub fn new(device: Arc<Device>, config: &Config) -> Self {
        Self {
            device,
            config: config.clone(),
            compressor: None,
            arena: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Configures the record compressor.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Stores a record and returns its id. A partial payload reserves the
    /// full logical size and zero-fills the bytes outside the window.
    pub fn allocate(
        &mut self,
        ctx: &mut Context<'_>,
        payload: Payload<'_>,
        flags: WriteFlags,
    ) -> Result<BlobId> {
        payload.validate()?;

        let page_size = self.config.page_size_bytes;
        let window = payload.window();
        let original_size = payload.total_size()?;
        let partial = payload.partial();

        // Partial writes never compress; for a full payload the compressed
        // form is kept only when it is strictly smaller.
        let mut compressed = false;
        if partial.is_none() && !flags.disable_compression && !window.is_empty() {
            if let Some(compressor) = self.compressor.as_mut() {
                let len = compressor.compress(window)?;
                compressed = len < window.len();
            }
        }
        let stored: &[u8] = match (&self.compressor, compressed) {
            (Some(compressor), true) => compressor.output(),
            _ => window,
        };

        // Bytes reserved on disk: the stored form for full writes, the full
        // logical size for partial ones.
        let disk_size = match partial {
            None => stored.len() as u32,
            Some(_) => original_size,
        };
        let alloc_size = BLOB_HEADER_SIZE as u32 + disk_size;

        // Try the page that last had room, then fall back to a fresh run of
        // consecutive pages.
        let mut reuse = None;
        if let Some(last) = ctx.pager.last_blob_page() {
            let mut header = load_page_header(ctx, last)?;
            if let Some(offset) = header.alloc_from_freelist(alloc_size) {
                header.check_integrity(page_size)?;
                reuse = Some((last, header, offset));
            }
        }

        let (page_address, mut page_header, blob_address) = match reuse {
            Some((last, header, offset)) => (last, header, last + offset as u64),
            None => {
                let required = alloc_size as u64 + PAGE_OVERHEAD as u64;
                let num_pages = required.div_ceil(page_size as u64) as u32;
                let page_address = ctx.pager.alloc_multiple_blob_pages(num_pages)?;

                let capacity = (num_pages as u64 * page_size as u64 - PAGE_OVERHEAD as u64) as u32;
                let mut header = BlobPageHeader::new(num_pages, capacity);

                // Single page: the remainder seeds the freelist. A run of
                // pages disallows cross-page fragmentation, so its remainder
                // is discarded.
                if num_pages == 1 && capacity > alloc_size {
                    header.freelist[0] = FreeSlot {
                        offset: PAGE_OVERHEAD as u32 + alloc_size,
                        size: capacity - alloc_size,
                    };
                }

                // Multi-page blobs keep their payload checksum in the unused
                // first freelist slot; a partial write stores zero instead.
                if num_pages > 1 && self.config.enable_crc32 {
                    let crc = match partial {
                        None => payload_crc32(window),
                        Some(_) => 0,
                    };
                    header.set_stored_crc32(crc);
                }

                (page_address, header, page_address + PAGE_OVERHEAD as u64)
            }
        };

        if page_header.free_bytes < alloc_size {
            return Err(UmbraError::IntegrityViolated(
                "blob page free bytes underflow",
            ));
        }
        page_header.free_bytes -= alloc_size;

        // Publish the page as the allocation hint only while it has room.
        ctx.pager.set_last_blob_page(if page_header.free_bytes > 0 {
            Some(page_address)
        } else {
            None
        });
        store_page_header(ctx, page_address, &page_header)?;

        let blob_header = BlobHeader::new(blob_address, alloc_size, original_size as u64, compressed);
        let mut header_bytes = [0u8; BLOB_HEADER_SIZE];
        blob_header.encode(&mut header_bytes)?;

        match partial {
            Some((offset, window_len)) => {
                let mut address = blob_address;
                if offset > 0 {
                    write_chunks(ctx, page_address, address, &[&header_bytes])?;
                    address += BLOB_HEADER_SIZE as u64;
                    zero_fill(ctx, page_address, &mut address, offset as u64)?;
                    write_chunks(ctx, page_address, address, &[window])?;
                    address += window.len() as u64;
                } else {
                    write_chunks(ctx, page_address, address, &[&header_bytes, window])?;
                    address += BLOB_HEADER_SIZE as u64 + window.len() as u64;
                }
                let written_end = offset as u64 + window_len as u64;
                zero_fill(ctx, page_address, &mut address, original_size as u64 - written_end)?;
            }
            None => {
                write_chunks(ctx, page_address, blob_address, &[&header_bytes, stored])?;
            }
        }

        trace!(
            blob_id = blob_address,
            size = original_size,
            alloc_size,
            compressed,
            "blob.allocate"
        );
        Ok(BlobId(blob_address))
    }

    /// Reads a record. Returns a zero-copy view into mapped memory when the
    /// caller permits it and the payload qualifies; otherwise the bytes are
    /// copied (and decompressed) into the manager's arena.
    pub fn read(
        &mut self,
        ctx: &mut Context<'_>,
        blob_id: BlobId,
        options: &ReadOptions,
    ) -> Result<Record<'_>> {
        let (header, page_address) = self.checked_header(ctx, blob_id, true)?;

        let blob_size = header.size as u32;
        let (window_offset, window_len) = clip_window(blob_size, options.partial)?;
        if window_len == 0 {
            return Ok(Record::empty());
        }

        let page_header = load_page_header(ctx, page_address)?;
        let partial = options.partial.is_some();
        let payload_address = blob_id.0 + BLOB_HEADER_SIZE as u64 + window_offset as u64;

        if !options.force_deep_copy
            && !header.is_compressed()
            && self.device.is_mapped(payload_address, window_len as u64)
        {
            if let Some(data) = self.device.mapped_slice(payload_address, window_len as usize) {
                self.verify_crc(&page_header, data, partial)?;
                trace!(blob_id = blob_id.0, len = window_len, "blob.read_mapped");
                return Ok(Record {
                    data,
                    source: RecordSource::Mapped,
                });
            }
        }

        if header.is_compressed() {
            let disk_len = header.disk_payload_size() as usize;
            resize_buffer(&mut self.scratch, disk_len)?;
            copy_chunk(
                ctx,
                page_address,
                blob_id.0 + BLOB_HEADER_SIZE as u64,
                &mut self.scratch[..disk_len],
                true,
            )?;

            resize_buffer(&mut self.arena, blob_size as usize)?;
            let compressor = self.compressor.as_mut().ok_or(UmbraError::InvalidParameter(
                "compressed blob without a configured compressor",
            ))?;
            compressor.decompress(&self.scratch[..disk_len], &mut self.arena[..blob_size as usize])?;

            self.verify_crc(&page_header, &self.arena[..blob_size as usize], partial)?;
            trace!(blob_id = blob_id.0, len = window_len, "blob.read_compressed");
            return Ok(Record {
                data: &self.arena[window_offset as usize..(window_offset + window_len) as usize],
                source: RecordSource::Copied,
            });
        }

        resize_buffer(&mut self.arena, window_len as usize)?;
        copy_chunk(
            ctx,
            page_address,
            payload_address,
            &mut self.arena[..window_len as usize],
            true,
        )?;
        self.verify_crc(&page_header, &self.arena[..window_len as usize], partial)?;
        trace!(blob_id = blob_id.0, len = window_len, "blob.read");
        Ok(Record {
            data: &self.arena[..window_len as usize],
            source: RecordSource::Copied,
        })
    }

    /// Reads a record into a caller-supplied buffer, returning the number
    /// of bytes written.
    pub fn read_into(
        &mut self,
        ctx: &mut Context<'_>,
        blob_id: BlobId,
        options: &ReadOptions,
        dst: &mut [u8],
    ) -> Result<u32> {
        let (header, page_address) = self.checked_header(ctx, blob_id, true)?;

        let blob_size = header.size as u32;
        let (window_offset, window_len) = clip_window(blob_size, options.partial)?;
        if window_len == 0 {
            return Ok(0);
        }
        if dst.len() < window_len as usize {
            return Err(UmbraError::InvalidParameter(
                "destination buffer is too small",
            ));
        }

        let page_header = load_page_header(ctx, page_address)?;
        let partial = options.partial.is_some();
        let payload_address = blob_id.0 + BLOB_HEADER_SIZE as u64 + window_offset as u64;

        if header.is_compressed() {
            let disk_len = header.disk_payload_size() as usize;
            resize_buffer(&mut self.scratch, disk_len)?;
            copy_chunk(
                ctx,
                page_address,
                blob_id.0 + BLOB_HEADER_SIZE as u64,
                &mut self.scratch[..disk_len],
                true,
            )?;

            if partial {
                resize_buffer(&mut self.arena, blob_size as usize)?;
                let compressor = self.compressor.as_mut().ok_or(UmbraError::InvalidParameter(
                    "compressed blob without a configured compressor",
                ))?;
                compressor
                    .decompress(&self.scratch[..disk_len], &mut self.arena[..blob_size as usize])?;
                dst[..window_len as usize].copy_from_slice(
                    &self.arena[window_offset as usize..(window_offset + window_len) as usize],
                );
            } else {
                let compressor = self.compressor.as_mut().ok_or(UmbraError::InvalidParameter(
                    "compressed blob without a configured compressor",
                ))?;
                compressor.decompress(&self.scratch[..disk_len], &mut dst[..blob_size as usize])?;
                self.verify_crc(&page_header, &dst[..blob_size as usize], partial)?;
            }
            return Ok(window_len);
        }

        copy_chunk(
            ctx,
            page_address,
            payload_address,
            &mut dst[..window_len as usize],
            true,
        )?;
        self.verify_crc(&page_header, &dst[..window_len as usize], partial)?;
        Ok(window_len)
    }

    /// Logical size of a stored record.
    pub fn blob_size(&mut self, ctx: &mut Context<'_>, blob_id: BlobId) -> Result<u64> {
        let (header, _) = self.checked_header(ctx, blob_id, true)?;
        Ok(header.size)
    }

    /// Replaces a record. When the new record fits the old allocation
    /// uncompressed it is rewritten in place and keeps its id; otherwise
    /// the record moves and the old id is erased.
    ///
    /// Compression is deliberately not re-evaluated against the old
    /// footprint; the in-place test uses the uncompressed size, avoiding
    /// re-compression churn on every overwrite.
    pub fn overwrite(
        &mut self,
        ctx: &mut Context<'_>,
        old_id: BlobId,
        payload: Payload<'_>,
        flags: WriteFlags,
    ) -> Result<BlobId> {
        payload.validate()?;

        let (old_header, page_address) = self.checked_header(ctx, old_id, false)?;

        let window = payload.window();
        let total_size = payload.total_size()?;
        let partial = payload.partial();
        let alloc_size = BLOB_HEADER_SIZE as u32 + total_size;

        if alloc_size <= old_header.alloc_size {
            // In-place rewrite never stores compressed data.
            let new_header = BlobHeader::new(old_id.0, alloc_size, total_size as u64, false);
            let mut header_bytes = [0u8; BLOB_HEADER_SIZE];
            new_header.encode(&mut header_bytes)?;

            match partial {
                Some((offset, _)) if offset > 0 => {
                    write_chunks(ctx, page_address, old_id.0, &[&header_bytes])?;
                    write_chunks(
                        ctx,
                        page_address,
                        old_id.0 + BLOB_HEADER_SIZE as u64 + offset as u64,
                        &[window],
                    )?;
                }
                _ => {
                    write_chunks(ctx, page_address, old_id.0, &[&header_bytes, window])?;
                }
            }

            let mut page_header = load_page_header(ctx, page_address)?;

            // The shrunk remainder goes back to the freelist.
            if alloc_size < old_header.alloc_size {
                let residual = old_header.alloc_size - alloc_size;
                page_header.free_bytes += residual;
                page_header
                    .add_to_freelist((old_id.0 + alloc_size as u64 - page_address) as u32, residual);
            }

            if page_header.is_multi_page() && self.config.enable_crc32 {
                let crc = match partial {
                    None => payload_crc32(window),
                    Some(_) => 0,
                };
                page_header.set_stored_crc32(crc);
            }

            store_page_header(ctx, page_address, &page_header)?;
            trace!(blob_id = old_id.0, size = total_size, "blob.overwrite_in_place");
            return Ok(old_id);
        }

        // Grown past the old allocation: overwrite becomes insert + delete.
        let new_id = self.allocate(ctx, payload, flags)?;
        self.erase(ctx, old_id)?;
        trace!(
            old_id = old_id.0,
            new_id = new_id.0,
            size = total_size,
            "blob.overwrite_moved"
        );
        Ok(new_id)
    }

    /// Destroys a record. The freed range returns to its page's freelist;
    /// a page run left entirely empty goes back to the page manager.
    pub fn erase(&mut self, ctx: &mut Context<'_>, blob_id: BlobId) -> Result<()> {
        let (header, page_address) = self.checked_header(ctx, blob_id, false)?;

        let mut page_header = load_page_header(ctx, page_address)?;
        page_header.free_bytes += header.alloc_size;

        // Clobber the stored header so the id is dead immediately, not just
        // after its page is reused.
        let zeros = [0u8; BLOB_HEADER_SIZE];
        write_chunks(ctx, page_address, blob_id.0, &[&zeros])?;

        let page_size = self.config.page_size_bytes;
        let capacity = page_header.num_pages as u64 * page_size as u64 - PAGE_OVERHEAD as u64;
        if page_header.free_bytes as u64 == capacity {
            ctx.pager.set_last_blob_page(None);
            let num_pages = page_header.num_pages;
            store_page_header(ctx, page_address, &BlobPageHeader::new(0, 0))?;
            ctx.pager.del(page_address, num_pages)?;
            trace!(blob_id = blob_id.0, num_pages, "blob.erase_page_run");
            return Ok(());
        }

        page_header.add_to_freelist((blob_id.0 - page_address) as u32, header.alloc_size);
        store_page_header(ctx, page_address, &page_header)?;
        trace!(blob_id = blob_id.0, "blob.erase");
        Ok(())
    }

    fn checked_header(
        &self,
        ctx: &mut Context<'_>,
        blob_id: BlobId,
        read_only: bool,
    ) -> Result<(BlobHeader, u64)> {
        let (header, page_address) = read_blob_header(ctx, blob_id.0, read_only)?;
        if header.self_address != blob_id.0 {
            warn!(blob_id = blob_id.0, "blob.not_found");
            return Err(UmbraError::BlobNotFound);
        }
        Ok((header, page_address))
    }

    fn verify_crc(&self, page_header: &BlobPageHeader, data: &[u8], partial: bool) -> Result<()> {
        if !page_header.is_multi_page() || !self.config.enable_crc32 || partial {
            return Ok(());
        }
        let actual = payload_crc32(data);
        let stored = page_header.stored_crc32();
        if actual != stored {
            warn!(stored, actual, "blob.crc32_mismatch");
            return Err(UmbraError::IntegrityViolated("blob checksum mismatch"));
        }
        Ok(())
    }
}

fn clip_window(blob_size: u32, partial: Option<PartialRange>) -> Result<(u32, u32)> {
    match partial {
        Some(range) => {
            if range.offset > blob_size {
                return Err(UmbraError::InvalidParameter(
                    "partial offset is greater than the record size",
                ));
            }
            Ok((range.offset, range.size.min(blob_size - range.offset)))
        }
        None => Ok((0, blob_size)),
    }
}

fn load_page_header(ctx: &mut Context<'_>, page_address: u64) -> Result<BlobPageHeader> {
    let page_size = ctx.pager.page_size() as u32;
    let page = ctx.pager.fetch(page_address, FetchOptions::default())?;
    let header = BlobPageHeader::decode(page.data())?;
    header.check_integrity(page_size)?;
    Ok(header)
}

fn store_page_header(
    ctx: &mut Context<'_>,
    page_address: u64,
    header: &BlobPageHeader,
) -> Result<()> {
    let page = ctx.pager.fetch(page_address, FetchOptions::default())?;
    header.encode(page.data_mut())?;
    page.set_dirty(true);
    Ok(())
}

/// Fills `gap` bytes at `*address` with zeros, split into page-sized
/// chunks so a large gap never allocates more than one page of zeros.
fn zero_fill(ctx: &mut Context<'_>, header_page: u64, address: &mut u64, mut gap: u64) -> Result<()> {
    if gap == 0 {
        return Ok(());
    }
    let page_size = ctx.pager.page_size() as u64;
    let zeros = vec![0u8; gap.min(page_size) as usize];
    while gap > 0 {
        let take = gap.min(page_size);
        write_chunks(ctx, header_page, *address, &[&zeros[..take as usize]])?;
        *address += take;
        gap -= take;
    }
    Ok(())
}
