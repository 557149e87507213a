//! Page cache and page allocation. The blob manager consumes this through
//! the transactional [`Context`], never holding a page across calls.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::{trace, warn};

use crate::config::Config;
use crate::device::Device;
use crate::error::{Result, UmbraError};
use crate::page::Page;

/// Fetch behavior hints.
#[derive(Clone, Copy, Debug, Default)]
pub struct FetchOptions {
    /// Cache hint: the caller will not modify the page.
    pub read_only: bool,
    /// The page is an interior page of a multi-page blob and carries no
    /// blob page header. Once a cached page carries this claim, fetching
    /// it as a header page is rejected.
    pub without_header: bool,
}

/// Transactional context threaded through every blob call. The mutable
/// borrow of the page manager is what the original design's opaque context
/// pointer provided; the borrow checker enforces that pages never outlive
/// the call that fetched them.
pub struct Context<'p> {
    pub pager: &'p mut PageManager,
}

impl<'p> Context<'p> {
    pub fn new(pager: &'p mut PageManager) -> Self {
        Self { pager }
    }
}

#[derive(Clone, Copy, Debug)]
struct FreeRun {
    address: u64,
    num_pages: u32,
}

/// Owns every page buffer. Pages enter through `fetch` or
/// `alloc_multiple_blob_pages` and leave by LRU eviction (with dirty
/// write-back), explicit `del`, or `flush`.
pub struct PageManager {
    device: Arc<Device>,
    page_size: usize,
    cache: LruCache<u64, Page>,
    free_runs: Vec<FreeRun>,
    last_blob_page: Option<u64>,
}

impl PageManager {
    pub fn new(device: Arc<Device>, config: &Config) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.cache_pages)
            .ok_or(UmbraError::InvalidParameter("page cache capacity is zero"))?;
        Ok(Self {
            device,
            page_size: config.page_size_bytes as usize,
            cache: LruCache::new(capacity),
            free_runs: Vec::new(),
            last_blob_page: None,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Address of a blob page known to have free bytes, if any.
    pub fn last_blob_page(&self) -> Option<u64> {
        self.last_blob_page
    }

    pub fn set_last_blob_page(&mut self, address: Option<u64>) {
        self.last_blob_page = address;
    }

    /// Fetches the page at `address`, reading it through the device on a
    /// cache miss.
    ///
    /// A `without_header` claim comes from blob layout arithmetic and is
    /// authoritative; the default is merely "no claim made". A caller
    /// expecting a blob page header on a page already established as
    /// interior holds a broken address, so the fetch is rejected rather
    /// than letting freelist bytes be parsed as a header. The claim cannot
    /// go stale: a page changes role only when its run is freed, and `del`
    /// drops the cache entry.
    pub fn fetch(&mut self, address: u64, options: FetchOptions) -> Result<&mut Page> {
        debug_assert_eq!(address % self.page_size as u64, 0);

        if !self.cache.contains(&address) {
            let mut page = Page::new(address);
            self.device.read_page(&mut page, address)?;
            page.set_without_header(options.without_header);
            self.insert(address, page)?;
            return Ok(self.cache.get_mut(&address).expect("page must exist"));
        }

        let page = self.cache.get_mut(&address).expect("page must exist");
        if page.is_without_header() && !options.without_header {
            warn!(address, "pager.header_expectation_conflict");
            return Err(UmbraError::IntegrityViolated(
                "headerless blob page fetched as a header page",
            ));
        }
        if options.without_header {
            page.set_without_header(true);
        }
        Ok(page)
    }

    /// Allocates `num_pages` consecutive pages and returns the address of
    /// the first, which is the only one carrying a blob page header. Freed
    /// runs are reused before the device grows the file.
    pub fn alloc_multiple_blob_pages(&mut self, num_pages: u32) -> Result<u64> {
        let address = match self.take_free_run(num_pages) {
            Some(address) => address,
            None => self
                .device
                .alloc(num_pages as u64 * self.page_size as u64)?,
        };

        let mut page = Page::new(address);
        page.assign_allocated_buffer(vec![0u8; self.page_size].into_boxed_slice(), address);
        self.insert(address, page)?;
        trace!(address, num_pages, "pager.alloc_blob_pages");
        Ok(address)
    }

    /// Returns a run of pages to the free list and drops any cached copies,
    /// persisting dirty ones first so cleared headers reach disk.
    pub fn del(&mut self, address: u64, num_pages: u32) -> Result<()> {
        for i in 0..num_pages as u64 {
            let page_address = address + i * self.page_size as u64;
            if let Some(mut page) = self.cache.pop(&page_address) {
                if page.is_dirty() {
                    self.device.write(page_address, page.data())?;
                }
                self.device.free_page(&mut page);
            }
        }

        let len = num_pages as u64 * self.page_size as u64;
        for run in self.free_runs.iter_mut() {
            if run.address + run.num_pages as u64 * self.page_size as u64 == address {
                run.num_pages += num_pages;
                return Ok(());
            }
            if address + len == run.address {
                run.address = address;
                run.num_pages += num_pages;
                return Ok(());
            }
        }
        self.free_runs.push(FreeRun { address, num_pages });
        trace!(address, num_pages, "pager.del");
        Ok(())
    }

    /// Writes every dirty page back through the device and syncs it.
    pub fn flush(&mut self) -> Result<()> {
        for (&address, page) in self.cache.iter_mut() {
            if page.is_dirty() {
                self.device.write(address, page.data())?;
                page.set_dirty(false);
            }
        }
        self.device.flush()
    }

    fn take_free_run(&mut self, num_pages: u32) -> Option<u64> {
        let index = self
            .free_runs
            .iter()
            .position(|run| run.num_pages >= num_pages)?;
        let run = &mut self.free_runs[index];
        let address = run.address;
        run.address += num_pages as u64 * self.page_size as u64;
        run.num_pages -= num_pages;
        if run.num_pages == 0 {
            self.free_runs.swap_remove(index);
        }
        Some(address)
    }

    fn insert(&mut self, address: u64, page: Page) -> Result<()> {
        if let Some((evicted_address, evicted)) = self.cache.push(address, page) {
            if evicted_address != address && evicted.is_dirty() {
                self.device.write(evicted_address, evicted.data())?;
            }
        }
        Ok(())
    }
}
