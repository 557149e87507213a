//! File-backed device. One mutex serializes every operation; the guard is
//! scoped so the lock is released on every exit path, including errors.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{excess_grant, io};
use crate::config::{Config, PosixAdvice};
use crate::device::aes::OffsetCipher;
use crate::error::{Result, UmbraError};
use crate::page::Page;

#[derive(Default)]
struct DiskState {
    file: Option<File>,
    map: Option<MmapRaw>,
    mapped_size: u64,
    file_size: u64,
    excess_at_end: u64,
    scratch: Vec<u8>,
}

impl DiskState {
    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or(UmbraError::InvalidParameter("device is not open"))
    }

    fn truncate(&mut self, new_size: u64, limit: u64) -> Result<()> {
        if new_size > limit {
            return Err(UmbraError::LimitsReached);
        }
        self.file()?.set_len(new_size)?;
        self.file_size = new_size;
        Ok(())
    }
}

pub struct DiskDevice {
    config: Config,
    cipher: Option<OffsetCipher>,
    state: Mutex<DiskState>,
}

impl DiskDevice {
    /// Creates a new database file and applies the configured I/O advice.
    pub fn create(path: &Path, config: &Config) -> Result<Self> {
        config.validate()?;

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(config.file_mode);
        }
        let file = options.open(path)?;
        apply_advice(&file, config.posix_advice);

        trace!(path = %path.display(), "device.create");
        Ok(Self::with_file(file, 0, config))
    }

    /// Opens an existing file. When eligible, the whole current file is
    /// mapped; a map failure is logged and recovered by falling back to
    /// positioned reads and writes.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        config.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(path)?;
        apply_advice(&file, config.posix_advice);

        let file_size = file.metadata()?.len();
        let device = Self::with_file(file, file_size, config);

        // A mapped view would bypass the cipher, so encryption keeps the
        // device on the positioned-I/O path.
        if config.disable_mmap || config.is_encryption_enabled {
            return Ok(device);
        }

        let granularity = map_granularity();
        if file_size == 0 || file_size % granularity != 0 {
            return Ok(device);
        }

        {
            let mut state = device.state.lock();
            let mapped = if config.read_only {
                MmapOptions::new().map_raw_read_only(state.file()?)
            } else {
                MmapRaw::map_raw(state.file()?)
            };
            match mapped {
                Ok(map) => {
                    state.mapped_size = file_size;
                    state.map = Some(map);
                }
                Err(error) => {
                    warn!(%error, "device.mmap_failed_falling_back_to_rw");
                }
            }
        }

        trace!(path = %path.display(), file_size, "device.open");
        Ok(device)
    }

    fn with_file(file: File, file_size: u64, config: &Config) -> Self {
        let cipher = config
            .is_encryption_enabled
            .then(|| OffsetCipher::new(config.encryption_key));
        Self {
            config: config.clone(),
            cipher,
            state: Mutex::new(DiskState {
                file: Some(file),
                file_size,
                ..DiskState::default()
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Unmaps if mapped, then closes the file.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.map = None;
        state.mapped_size = 0;
        state.excess_at_end = 0;
        state.file = None;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        state.file()?.sync_all()?;
        Ok(())
    }

    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.truncate(new_size, self.config.file_size_limit_bytes)
    }

    pub fn file_size(&self) -> Result<u64> {
        let state = self.state.lock();
        #[cfg(debug_assertions)]
        {
            let os_size = state.file()?.metadata()?.len();
            debug_assert_eq!(state.file_size, os_size);
        }
        state.file()?;
        Ok(state.file_size)
    }

    /// Positioned read; never uses the mapping. Decrypts in place.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        io::read_exact_at(state.file()?, offset, buf)?;
        if let Some(cipher) = &self.cipher {
            cipher.apply(offset, buf);
        }
        Ok(())
    }

    /// Positioned write; never uses the mapping. With encryption enabled
    /// only whole-page writes are allowed, staged through a scratch buffer
    /// so the caller's bytes stay plaintext.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(cipher) = &self.cipher {
            let page_size = self.config.page_size_bytes as u64;
            if offset % page_size != 0 || buf.len() as u64 % page_size != 0 {
                return Err(UmbraError::InvalidParameter(
                    "encrypted writes must be page-aligned",
                ));
            }
            crate::compress::resize_buffer(&mut state.scratch, buf.len())?;
            state.scratch.copy_from_slice(buf);
            cipher.apply(offset, &mut state.scratch);
            io::write_all_at(state.file()?, offset, &state.scratch)?;
            return Ok(());
        }
        io::write_all_at(state.file()?, offset, buf)?;
        Ok(())
    }

    /// Returns an offset for `len` fresh bytes, consuming trailing excess
    /// when possible and otherwise growing the file with an excess grant
    /// that amortizes truncate calls.
    pub fn alloc(&self, len: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if state.excess_at_end >= len {
            let address = state.file_size - state.excess_at_end;
            state.excess_at_end -= len;
            return Ok(address);
        }

        // Truncating a mapped file is forbidden on some platforms; growing
        // past the map is fine, but the grant is suppressed there so the
        // file never outgrows what a remap-free reclaim can shrink.
        let suppress = cfg!(windows) && state.mapped_size != 0;
        let excess = excess_grant(state.file_size, len, suppress);

        let address = state.file_size;
        state.truncate(
            address + len + excess,
            self.config.file_size_limit_bytes,
        )?;
        state.excess_at_end = excess;
        Ok(address)
    }

    /// Reads one page. Inside the mapped region the page borrows the map
    /// directly; outside it a heap buffer is filled with a positioned read.
    pub fn read_page(&self, page: &mut Page, address: u64) -> Result<()> {
        let state = self.state.lock();
        let page_size = self.config.page_size_bytes as usize;

        if address < state.mapped_size {
            if let Some(map) = &state.map {
                page.free_buffer();
                // SAFETY: address is inside the mapping, which stays alive
                // and at a stable address until close. Pages are dropped by
                // the page manager before the device goes away.
                let ptr = unsafe { map.as_mut_ptr().add(address as usize) };
                page.assign_mapped_buffer(ptr, page_size, address);
                return Ok(());
            }
        }

        if !page.is_allocated() || page.is_mapped_buffer() {
            page.assign_allocated_buffer(vec![0u8; page_size].into_boxed_slice(), address);
        }
        page.set_address(address);
        io::read_exact_at(state.file()?, address, page.data_mut())?;
        if let Some(cipher) = &self.cipher {
            cipher.apply(address, page.data_mut());
        }
        Ok(())
    }

    /// Allocates storage plus a heap buffer for one page; never mapped.
    pub fn alloc_page(&self, page: &mut Page) -> Result<()> {
        let page_size = self.config.page_size_bytes as usize;
        let address = self.alloc(page_size as u64)?;
        page.assign_allocated_buffer(vec![0u8; page_size].into_boxed_slice(), address);
        Ok(())
    }

    /// Releases the page's heap buffer; mapped bytes are left untouched.
    pub fn free_page(&self, page: &mut Page) {
        page.free_buffer();
    }

    pub fn is_mapped(&self, offset: u64, size: u64) -> bool {
        let state = self.state.lock();
        offset + size <= state.mapped_size
    }

    /// Zero-copy view into the mapped region, if the range is mapped.
    pub fn mapped_slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let state = self.state.lock();
        if offset + len as u64 > state.mapped_size {
            return None;
        }
        let map = state.map.as_ref()?;
        // SAFETY: the mapping is established once at open and stays alive
        // and at a stable address until close. The returned lifetime is
        // bound to &self; callers must not hold the slice across close.
        Some(unsafe { std::slice::from_raw_parts(map.as_mut_ptr().add(offset as usize), len) })
    }

    /// Truncates trailing excess away. Idempotent.
    pub fn reclaim_space(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.excess_at_end > 0 {
            let target = state.file_size - state.excess_at_end;
            state.truncate(target, self.config.file_size_limit_bytes)?;
            state.excess_at_end = 0;
        }
        Ok(())
    }

    /// Trailing bytes reserved by a previous truncate; exposed for
    /// diagnostics and tests.
    pub fn excess_at_end(&self) -> u64 {
        self.state.lock().excess_at_end
    }
}

#[cfg(target_os = "linux")]
fn apply_advice(file: &File, advice: PosixAdvice) {
    use std::os::unix::io::AsRawFd;

    let advice = match advice {
        PosixAdvice::Normal => return,
        PosixAdvice::Random => libc::POSIX_FADV_RANDOM,
        PosixAdvice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
    };
    // Advisory only; a failure changes nothing about correctness.
    // SAFETY: fd is valid for the lifetime of `file`.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_advice(_file: &File, _advice: PosixAdvice) {}

#[cfg(unix)]
fn map_granularity() -> u64 {
    // SAFETY: sysconf is always safe to call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as u64
    } else {
        4096
    }
}

#[cfg(windows)]
fn map_granularity() -> u64 {
    // Windows maps on 64KiB allocation-granularity boundaries.
    64 * 1024
}

#[cfg(not(any(unix, windows)))]
fn map_granularity() -> u64 {
    4096
}
