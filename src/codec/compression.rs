//! Payload compression plugins using `miniz_oxide`.
//!
//! - [`Deflate`] - raw DEFLATE stream
//! - [`Zlib`] - DEFLATE with the zlib wrapper
//!
//! Whether a payload is actually compressed is decided by [`compress_adaptive`]:
//! payloads at or below the threshold, or payloads that do not shrink, travel
//! raw and the caller must downgrade the header flag accordingly.
//!
//! Inflation is capped: a payload that would grow past the caller's limit is
//! rejected instead of being expanded in memory.

use miniz_oxide::deflate::{compress_to_vec, compress_to_vec_zlib};
use miniz_oxide::inflate::{
    decompress_to_vec_with_limit, decompress_to_vec_zlib_with_limit, DecompressError,
    TINFLStatus,
};

use crate::error::{CodecError, CodecErrorKind, RpcError, Result};

/// Compression id meaning "payload is not compressed".
pub const NONE_ID: u8 = 0;

/// Compression id of raw DEFLATE.
pub const DEFLATE_ID: u8 = 1;

/// Compression id of zlib-wrapped DEFLATE.
pub const ZLIB_ID: u8 = 2;

/// Payloads must exceed this many bytes before compression is attempted.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 2048;

/// DEFLATE level (0-10).
const COMPRESSION_LEVEL: u8 = 6;

/// A compressor selectable by byte id.
pub trait Compression: Send + Sync + 'static {
    fn type_id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Vec<u8>;

    /// Inflate `data`, failing once the output would exceed `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>>;
}

/// Raw DEFLATE.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deflate;

impl Compression for Deflate {
    fn type_id(&self) -> u8 {
        DEFLATE_ID
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        compress_to_vec(data, COMPRESSION_LEVEL)
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        decompress_to_vec_with_limit(data, limit).map_err(|e| inflate_error("deflate", limit, e))
    }
}

/// Zlib-wrapped DEFLATE.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zlib;

impl Compression for Zlib {
    fn type_id(&self) -> u8 {
        ZLIB_ID
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        compress_to_vec_zlib(data, COMPRESSION_LEVEL)
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        decompress_to_vec_zlib_with_limit(data, limit).map_err(|e| inflate_error("zlib", limit, e))
    }
}

fn inflate_error(name: &str, limit: usize, e: DecompressError) -> RpcError {
    if e.status == TINFLStatus::HasMoreOutput {
        return CodecError::new(
            CodecErrorKind::Default,
            format!("{} payload inflates past the {} byte limit", name, limit),
        )
        .into();
    }
    RpcError::from(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{} inflate failed: {:?}", name, e.status),
    ))
}

/// Compress `data` only when it is larger than `threshold` and the result is
/// smaller than the input.
///
/// Returns `None` when the payload should be written raw.
pub fn compress_adaptive(
    compression: &dyn Compression,
    data: &[u8],
    threshold: usize,
) -> Option<Vec<u8>> {
    if data.len() <= threshold {
        return None;
    }
    let compressed = compression.compress(data);
    if compressed.len() >= data.len() {
        return None;
    }
    Some(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_deflate_and_zlib() {
        let input = repetitive(10_000);
        for c in [&Deflate as &dyn Compression, &Zlib] {
            let compressed = c.compress(&input);
            assert!(compressed.len() < input.len());
            assert_eq!(c.decompress(&compressed, 2 * input.len()).unwrap(), input);
        }
    }

    #[test]
    fn test_adaptive_threshold_is_exclusive() {
        let at = repetitive(DEFAULT_COMPRESS_THRESHOLD);
        assert!(compress_adaptive(&Deflate, &at, DEFAULT_COMPRESS_THRESHOLD).is_none());

        let above = repetitive(DEFAULT_COMPRESS_THRESHOLD + 1);
        assert!(compress_adaptive(&Deflate, &above, DEFAULT_COMPRESS_THRESHOLD).is_some());
    }

    #[test]
    fn test_adaptive_skips_incompressible() {
        // xorshift noise does not deflate
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let noise: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        assert!(compress_adaptive(&Deflate, &noise, DEFAULT_COMPRESS_THRESHOLD).is_none());
    }

    #[test]
    fn test_corrupt_input_is_io_error() {
        let err = Zlib.decompress(b"definitely not zlib", 1024).unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[test]
    fn test_inflate_stops_at_limit() {
        // One megabyte of zeros deflates to about a kilobyte.
        let zeros = vec![0u8; 1 << 20];
        for c in [&Deflate as &dyn Compression, &Zlib] {
            let compressed = c.compress(&zeros);
            assert!(compressed.len() < 8 * 1024);
            let err = c.decompress(&compressed, 64 * 1024).unwrap_err();
            match err {
                RpcError::Codec(e) => {
                    assert_eq!(e.kind, CodecErrorKind::Default);
                    assert!(e.message.contains("limit"));
                }
                other => panic!("expected codec error, got {:?}", other),
            }
            assert_eq!(c.decompress(&compressed, 2 * zeros.len()).unwrap().len(), zeros.len());
        }
    }
}
