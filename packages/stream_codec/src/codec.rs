//! Dictionary-primed zstd compression.
//!
//! Every call produces one complete, independently decodable frame. The
//! encoder context and the dictionary are loaded once and reused for the
//! life of the [`Codec`].

use std::path::Path;

use tracing::debug;
use zstd::bulk::Compressor;

use crate::error::{CodecError, Result};

/// Compression level used when none is configured.
pub const DEFAULT_LEVEL: i32 = 3;

/// Worst-case compressed size of `len` input bytes.
pub fn compress_bound(len: usize) -> usize {
    zstd::zstd_safe::compress_bound(len)
}

pub struct Codec {
    compressor: Compressor<'static>,
    level: i32,
    has_dictionary: bool,
}

impl Codec {
    /// Create a codec. Without a dictionary the frames are still valid zstd,
    /// but peers expecting dictionary-primed frames will not be able to use them.
    pub fn new(level: i32, dictionary: Option<&[u8]>) -> Result<Self> {
        let compressor = match dictionary {
            Some(dict) => Compressor::with_dictionary(level, dict),
            None => Compressor::new(level),
        }
        .map_err(CodecError::Context)?;

        Ok(Self {
            compressor,
            level,
            has_dictionary: dictionary.is_some(),
        })
    }

    pub fn from_dictionary_file(path: &Path, level: i32) -> Result<Self> {
        let dict = std::fs::read(path).map_err(|source| CodecError::Dictionary {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), size = dict.len(), level, "loaded compression dictionary");
        Self::new(level, Some(&dict))
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn has_dictionary(&self) -> bool {
        self.has_dictionary
    }

    /// Compress a self-contained message into a freshly sized buffer.
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.compressor
            .compress(data)
            .map_err(CodecError::Compression)
    }

    /// Compress into a caller-supplied destination.
    ///
    /// Refuses up front when `dst` is smaller than the compression bound for
    /// `data`, so the destination is never partially written.
    pub fn compress_into(&mut self, dst: &mut [u8], data: &[u8]) -> Result<usize> {
        let bound = compress_bound(data.len());
        if bound > dst.len() {
            return Err(CodecError::DestinationTooSmall {
                len: data.len(),
                bound,
                available: dst.len(),
            });
        }

        self.compressor
            .compress_to_buffer(data, dst)
            .map_err(CodecError::Compression)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("level", &self.level)
            .field("has_dictionary", &self.has_dictionary)
            .finish()
    }
}
