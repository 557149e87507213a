use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};

use crate::error::{Result, UmbraError};

/// Grows `buf` to `len` bytes, surfacing allocation failure instead of
/// aborting the process.
pub(crate) fn resize_buffer(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let additional = len.saturating_sub(buf.len());
    if additional > 0 {
        buf.try_reserve(additional)
            .map_err(|_| UmbraError::OutOfMemory)?;
    }
    buf.resize(len, 0);
    Ok(())
}

/// Record compression codec with an owned scratch arena for compressed
/// output. The blob manager stores the compressed form only when it is
/// strictly smaller than the original record.
pub trait Compressor {
    /// Compresses `src` into the internal arena and returns the compressed
    /// length.
    fn compress(&mut self, src: &[u8]) -> Result<usize>;

    /// Returns the output of the last `compress` call.
    fn output(&self) -> &[u8];

    /// Decompresses `src` into `dst`; `dst` must hold exactly the original
    /// record length.
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// LZ4 block-format compressor.
#[derive(Default)]
pub struct Lz4Compressor {
    arena: Vec<u8>,
    output_len: usize,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&mut self, src: &[u8]) -> Result<usize> {
        resize_buffer(&mut self.arena, get_maximum_output_size(src.len()))?;
        let len = compress_into(src, &mut self.arena)
            .map_err(|_| UmbraError::IntegrityViolated("lz4 compression overflowed arena"))?;
        self.output_len = len;
        Ok(len)
    }

    fn output(&self) -> &[u8] {
        &self.arena[..self.output_len]
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let written = decompress_into(src, dst)
            .map_err(|_| UmbraError::IntegrityViolated("lz4 payload is corrupt"))?;
        if written != dst.len() {
            return Err(UmbraError::IntegrityViolated(
                "lz4 payload shorter than recorded size",
            ));
        }
        Ok(())
    }
}
