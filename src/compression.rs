//! Transparent compression for persisted blobs.
//!
//! With the `compression` feature, tree and entity blobs written by the
//! SQLite provider are zstd-compressed. Reads detect the zstd magic bytes,
//! so a store written without compression stays readable after turning
//! the feature on.
//!
//! ```toml
//! [dependencies]
//! query-cache = { version = "0.1", features = ["compression"] }
//! ```

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Prepare serialized bytes for storage.
#[cfg(feature = "compression")]
pub fn pack(raw: Vec<u8>) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(raw.as_slice(), DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Prepare serialized bytes for storage (pass-through without `compression`).
#[cfg(not(feature = "compression"))]
pub fn pack(raw: Vec<u8>) -> Result<Vec<u8>, CompressionError> {
    Ok(raw)
}

/// Recover serialized bytes from storage.
pub fn unpack(stored: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_compressed(stored) {
        return Ok(stored.to_vec());
    }
    #[cfg(feature = "compression")]
    {
        zstd::decode_all(stored).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    }
    #[cfg(not(feature = "compression"))]
    {
        Err(CompressionError::DecompressFailed(
            "blob is zstd-compressed but the `compression` feature is disabled".to_string(),
        ))
    }
}
