//! Chunked page traversal. Byte ranges spanning page boundaries are split
//! into per-page copies against pages fetched from the page manager; the
//! mapped fast path is never used here. `header_page` is the first page of
//! the blob's run, the only one carrying a blob page header.

use super::layout::{BlobHeader, BLOB_HEADER_SIZE};
use crate::error::{Result, UmbraError};
use crate::pager::{Context, FetchOptions};

/// Writes `chunks` back to back starting at `address`, marking every
/// touched page dirty.
pub(crate) fn write_chunks(
    ctx: &mut Context<'_>,
    header_page: u64,
    mut address: u64,
    chunks: &[&[u8]],
) -> Result<()> {
    let page_size = ctx.pager.page_size() as u64;

    for chunk in chunks {
        let mut data: &[u8] = chunk;
        while !data.is_empty() {
            let page_address = address - address % page_size;
            let options = FetchOptions {
                without_header: page_address != header_page,
                ..FetchOptions::default()
            };
            let page = ctx.pager.fetch(page_address, options)?;

            let start = (address - page_address) as usize;
            let take = (page_size as usize - start).min(data.len());
            page.data_mut()[start..start + take].copy_from_slice(&data[..take]);
            page.set_dirty(true);

            address += take as u64;
            data = &data[take..];
        }
    }
    Ok(())
}

/// Copies `dst.len()` bytes starting at `address` out of the page cache.
pub(crate) fn copy_chunk(
    ctx: &mut Context<'_>,
    header_page: u64,
    mut address: u64,
    dst: &mut [u8],
    read_only: bool,
) -> Result<()> {
    let page_size = ctx.pager.page_size() as u64;
    let mut filled = 0usize;

    while filled < dst.len() {
        let page_address = address - address % page_size;
        let options = FetchOptions {
            read_only,
            without_header: page_address != header_page,
        };
        let page = ctx.pager.fetch(page_address, options)?;

        let start = (address - page_address) as usize;
        let take = (page_size as usize - start).min(dst.len() - filled);
        dst[filled..filled + take].copy_from_slice(&page.data()[start..start + take]);

        address += take as u64;
        filled += take;
    }
    Ok(())
}

/// Reads the blob header stored at `blob_id` and returns it together with
/// the address of the page holding it. An id pointing outside any header's
/// possible position is reported as a missing blob.
pub(crate) fn read_blob_header(
    ctx: &mut Context<'_>,
    blob_id: u64,
    read_only: bool,
) -> Result<(BlobHeader, u64)> {
    let page_size = ctx.pager.page_size() as u64;
    let page_address = blob_id - blob_id % page_size;
    let start = (blob_id - page_address) as usize;
    if start + BLOB_HEADER_SIZE > page_size as usize {
        return Err(UmbraError::BlobNotFound);
    }

    let options = FetchOptions {
        read_only,
        ..FetchOptions::default()
    };
    let page = ctx.pager.fetch(page_address, options)?;
    let header = BlobHeader::decode(&page.data()[start..start + BLOB_HEADER_SIZE])?;
    Ok((header, page_address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::Device;
    use crate::pager::PageManager;
    use std::sync::Arc;

    const PAGE_SIZE: u32 = 4096;

    fn test_pager() -> PageManager {
        let config = Config::new().page_size_bytes(PAGE_SIZE).cache_pages(8);
        let device = Arc::new(Device::in_memory(&config).unwrap());
        PageManager::new(device, &config).unwrap()
    }

    #[test]
    fn chunks_cross_page_boundaries() {
        let mut pager = test_pager();
        let base = pager.alloc_multiple_blob_pages(3).unwrap();
        let mut ctx = Context::new(&mut pager);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let address = base + 300;
        write_chunks(&mut ctx, base, address, &[&payload]).unwrap();

        let mut restored = vec![0u8; payload.len()];
        copy_chunk(&mut ctx, base, address, &mut restored, true).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn multiple_chunks_are_contiguous() {
        let mut pager = test_pager();
        let base = pager.alloc_multiple_blob_pages(1).unwrap();
        let mut ctx = Context::new(&mut pager);

        write_chunks(&mut ctx, base, base + 500, &[b"head", b"tail"]).unwrap();

        let mut restored = [0u8; 8];
        copy_chunk(&mut ctx, base, base + 500, &mut restored, true).unwrap();
        assert_eq!(&restored, b"headtail");
    }

    #[test]
    fn interior_pages_reject_header_fetches() {
        let mut pager = test_pager();
        let base = pager.alloc_multiple_blob_pages(2).unwrap();
        let mut ctx = Context::new(&mut pager);

        let payload = vec![9u8; PAGE_SIZE as usize + 100];
        write_chunks(&mut ctx, base, base + 300, &[&payload]).unwrap();

        let interior = base + PAGE_SIZE as u64;
        let options = FetchOptions {
            without_header: true,
            ..FetchOptions::default()
        };
        let page = ctx.pager.fetch(interior, options).unwrap();
        assert!(page.is_without_header());

        // Treating the interior page as one with a blob page header is a
        // broken address, not a different view of the same page.
        let err = ctx
            .pager
            .fetch(interior, FetchOptions::default())
            .unwrap_err();
        assert!(matches!(err, UmbraError::IntegrityViolated(_)));
    }

    #[test]
    fn header_roundtrip_through_page() {
        let mut pager = test_pager();
        let base = pager.alloc_multiple_blob_pages(1).unwrap();
        let mut ctx = Context::new(&mut pager);

        let header = BlobHeader::new(base + 264, 128, 100, false);
        let mut bytes = [0u8; BLOB_HEADER_SIZE];
        header.encode(&mut bytes).unwrap();
        write_chunks(&mut ctx, base, base + 264, &[&bytes]).unwrap();

        let (decoded, page_address) = read_blob_header(&mut ctx, base + 264, true).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(page_address, base);
    }

    #[test]
    fn header_straddling_page_end_is_not_found() {
        let mut pager = test_pager();
        let base = pager.alloc_multiple_blob_pages(1).unwrap();
        let mut ctx = Context::new(&mut pager);

        let blob_id = base + PAGE_SIZE as u64 - 4;
        assert!(matches!(
            read_blob_header(&mut ctx, blob_id, true),
            Err(UmbraError::BlobNotFound)
        ));
    }
}
