//! Chunk compression codecs
//!
//! Every chunk is compressed independently, so a codec never carries state
//! between calls and one instance is shared by all workers.

use crate::error::{FleetError, Result};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;

/// Compress and decompress one chunk of the workspace stream
pub trait CompressionCodec: Send + Sync {
    /// Name recorded in the manifest
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress a chunk whose original length is known from the manifest
    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>>;
}

pub struct GzipCodec {
    level: u32,
}

impl GzipCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CompressionCodec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| FleetError::Codec(format!("gzip compression failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| FleetError::Codec(format!("gzip finalization failed: {e}")))
    }

    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(original_size);
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| FleetError::Codec(format!("gzip decompression failed: {e}")))?;
        Ok(out)
    }
}

pub struct ZlibCodec {
    level: u32,
}

impl ZlibCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CompressionCodec for ZlibCodec {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| FleetError::Codec(format!("zlib compression failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| FleetError::Codec(format!("zlib finalization failed: {e}")))
    }

    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(original_size);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| FleetError::Codec(format!("zlib decompression failed: {e}")))?;
        Ok(out)
    }
}

pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, self.level)
            .map_err(|e| FleetError::Codec(format!("zstd compression failed: {e}")))
    }

    fn decompress(&self, data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, original_size)
            .map_err(|e| FleetError::Codec(format!("zstd decompression failed: {e}")))
    }
}

/// Look up a codec by the name stored in a manifest
pub fn codec_by_name(name: &str) -> Result<Arc<dyn CompressionCodec>> {
    match name.to_ascii_lowercase().as_str() {
        "gzip" => Ok(Arc::new(GzipCodec::new(6))),
        "zlib" => Ok(Arc::new(ZlibCodec::new(6))),
        "zstd" => Ok(Arc::new(ZstdCodec::new(3))),
        other => Err(FleetError::Codec(format!("unsupported codec: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        b"checkpoint payload with plenty of repetition "
            .iter()
            .cycle()
            .take(64 * 1024)
            .copied()
            .collect()
    }

    #[test]
    fn test_every_codec_restores_input() {
        let data = payload();
        for name in ["gzip", "zlib", "zstd"] {
            let codec = codec_by_name(name).unwrap();
            assert_eq!(codec.name(), name);

            let compressed = codec.compress(&data).unwrap();
            assert!(compressed.len() < data.len(), "{name} did not compress");
            assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_corrupt_input_is_a_codec_error() {
        let codec = codec_by_name("zstd").unwrap();
        let err = codec.decompress(b"not zstd at all", 1024).unwrap_err();
        assert!(matches!(err, FleetError::Codec(_)));
    }

    #[test]
    fn test_unknown_codec() {
        assert!(codec_by_name("lz4").is_err());
        assert!(codec_by_name("ZSTD").is_ok());
    }
}
