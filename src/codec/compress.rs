//! Built-in compressors: identity and gzip (`flate2`).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{Compressor, COMPRESSOR_GZIP, COMPRESSOR_NONE};
use crate::error::{RpcError, Result};

/// Default cap on the size of a gunzipped body (64 MiB).
pub const DEFAULT_MAX_UNCOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Pass-through compressor, registered by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn code(&self) -> u8 {
        COMPRESSOR_NONE
    }

    fn name(&self) -> &'static str {
        "none"
    }

    #[inline]
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    #[inline]
    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip compressor.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
    max_uncompressed: usize,
}

impl GzipCompressor {
    /// Create a gzip compressor with the given level (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            max_uncompressed: DEFAULT_MAX_UNCOMPRESSED_SIZE,
        }
    }

    /// Limit the size of uncompressed output.
    pub fn max_uncompressed(mut self, limit: usize) -> Self {
        self.max_uncompressed = limit;
        self
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
            max_uncompressed: DEFAULT_MAX_UNCOMPRESSED_SIZE,
        }
    }
}

impl Compressor for GzipCompressor {
    fn code(&self) -> u8 {
        COMPRESSOR_GZIP
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), self.level);
        encoder
            .write_all(data)
            .map_err(|e| RpcError::Codec(format!("gzip compress: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| RpcError::Codec(format!("gzip compress: {}", e)))
    }

    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .take(self.max_uncompressed as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| RpcError::Codec(format!("gzip uncompress: {}", e)))?;

        if out.len() > self.max_uncompressed {
            return Err(RpcError::Codec(format!(
                "gzip output exceeds {} bytes",
                self.max_uncompressed
            )));
        }
        Ok(out)
    }
}
