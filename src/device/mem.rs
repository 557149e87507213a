//! In-memory device for ephemeral databases and tests. Emulates the same
//! byte-addressed surface over a growable image; never mapped, never
//! encrypted.

use std::io::{self, ErrorKind};

use parking_lot::Mutex;

use super::excess_grant;
use crate::config::Config;
use crate::error::{Result, UmbraError};
use crate::page::Page;

#[derive(Default)]
struct MemState {
    image: Option<Vec<u8>>,
    excess_at_end: u64,
}

impl MemState {
    fn image(&self) -> Result<&Vec<u8>> {
        self.image
            .as_ref()
            .ok_or(UmbraError::InvalidParameter("device is not open"))
    }

    fn image_mut(&mut self) -> Result<&mut Vec<u8>> {
        self.image
            .as_mut()
            .ok_or(UmbraError::InvalidParameter("device is not open"))
    }
}

pub struct MemDevice {
    config: Config,
    state: Mutex<MemState>,
}

impl MemDevice {
    pub fn create(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            state: Mutex::new(MemState {
                image: Some(Vec::new()),
                excess_at_end: 0,
            }),
        })
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().image.is_some()
    }

    pub fn close(&self) -> Result<()> {
        self.state.lock().image = None;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.state.lock().image()?;
        Ok(())
    }

    pub fn truncate(&self, new_size: u64) -> Result<()> {
        if new_size > self.config.file_size_limit_bytes {
            return Err(UmbraError::LimitsReached);
        }
        let mut state = self.state.lock();
        crate::compress::resize_buffer(state.image_mut()?, new_size as usize)?;
        Ok(())
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.state.lock().image()?.len() as u64)
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let image = state.image()?;
        let end = offset as usize + buf.len();
        if end > image.len() {
            return Err(UmbraError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of in-memory image",
            )));
        }
        buf.copy_from_slice(&image[offset as usize..end]);
        Ok(())
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let image = state.image_mut()?;
        let end = offset as usize + buf.len();
        if end > image.len() {
            return Err(UmbraError::Io(io::Error::new(
                ErrorKind::WriteZero,
                "write past end of in-memory image",
            )));
        }
        image[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    pub fn alloc(&self, len: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let file_size = state.image()?.len() as u64;
        if state.excess_at_end >= len {
            let address = file_size - state.excess_at_end;
            state.excess_at_end -= len;
            return Ok(address);
        }

        let excess = excess_grant(file_size, len, false);
        let new_size = file_size + len + excess;
        if new_size > self.config.file_size_limit_bytes {
            return Err(UmbraError::LimitsReached);
        }
        crate::compress::resize_buffer(state.image_mut()?, new_size as usize)?;
        state.excess_at_end = excess;
        Ok(file_size)
    }

    pub fn read_page(&self, page: &mut Page, address: u64) -> Result<()> {
        let page_size = self.config.page_size_bytes as usize;
        if !page.is_allocated() || page.is_mapped_buffer() {
            page.assign_allocated_buffer(vec![0u8; page_size].into_boxed_slice(), address);
        }
        page.set_address(address);
        self.read(address, page.data_mut())
    }

    pub fn alloc_page(&self, page: &mut Page) -> Result<()> {
        let page_size = self.config.page_size_bytes as usize;
        let address = self.alloc(page_size as u64)?;
        page.assign_allocated_buffer(vec![0u8; page_size].into_boxed_slice(), address);
        Ok(())
    }

    pub fn free_page(&self, page: &mut Page) {
        page.free_buffer();
    }

    pub fn is_mapped(&self, _offset: u64, _size: u64) -> bool {
        false
    }

    pub fn reclaim_space(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.excess_at_end > 0 {
            let target = state.image()?.len() - state.excess_at_end as usize;
            state.image_mut()?.truncate(target);
            state.excess_at_end = 0;
        }
        Ok(())
    }

    pub fn excess_at_end(&self) -> u64 {
        self.state.lock().excess_at_end
    }
}
