use std::slice;

/// Backing storage for a page. The two kinds are disjoint: an owned buffer
/// is heap memory released by `free_buffer`, a mapped buffer points into the
/// device's mmap region and is never freed here.
#[derive(Debug, Default)]
pub enum PageBuf {
    #[default]
    Unallocated,
    Owned(Box<[u8]>),
    Mapped {
        ptr: *mut u8,
        len: usize,
    },
}

/// An in-memory page: a file address, a payload buffer, and a dirty flag.
/// Pages are owned by the page manager and borrowed by callers for the
/// duration of a single call.
#[derive(Debug, Default)]
pub struct Page {
    address: u64,
    buf: PageBuf,
    dirty: bool,
    without_header: bool,
}

impl Page {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// True for interior pages of a multi-page blob, which carry no blob
    /// page header.
    pub fn is_without_header(&self) -> bool {
        self.without_header
    }

    pub fn set_without_header(&mut self, without_header: bool) {
        self.without_header = without_header;
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self.buf, PageBuf::Unallocated)
    }

    pub fn is_mapped_buffer(&self) -> bool {
        matches!(self.buf, PageBuf::Mapped { .. })
    }

    pub fn data(&self) -> &[u8] {
        match &self.buf {
            PageBuf::Unallocated => &[],
            PageBuf::Owned(buf) => buf,
            // SAFETY: the pointer was handed out by the device for its mmap
            // region, which stays mapped until the device is closed. The
            // device outlives every page the page manager hands out.
            PageBuf::Mapped { ptr, len } => unsafe { slice::from_raw_parts(*ptr, *len) },
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            PageBuf::Unallocated => &mut [],
            PageBuf::Owned(buf) => buf,
            // SAFETY: as in `data`; the device serializes all access to the
            // mapping and the page manager never aliases a page buffer.
            PageBuf::Mapped { ptr, len } => unsafe { slice::from_raw_parts_mut(*ptr, *len) },
        }
    }

    pub fn assign_allocated_buffer(&mut self, buf: Box<[u8]>, address: u64) {
        self.buf = PageBuf::Owned(buf);
        self.address = address;
    }

    pub fn assign_mapped_buffer(&mut self, ptr: *mut u8, len: usize, address: u64) {
        self.buf = PageBuf::Mapped { ptr, len };
        self.address = address;
    }

    /// Releases an owned buffer; mapped bytes belong to the device and are
    /// only detached.
    pub fn free_buffer(&mut self) {
        self.buf = PageBuf::Unallocated;
    }
}
