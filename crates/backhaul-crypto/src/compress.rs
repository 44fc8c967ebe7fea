//! Opportunistic gzip compression of TRANSFER payloads

use crate::CryptoError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{Read, Write};

/// Payloads at or below this size are sent as-is
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Compress `data` when it is large enough and compression actually helps
///
/// Returns `(true, compressed)` only when the output is strictly smaller than
/// the input; otherwise the input is handed back untouched.
pub fn try_compress(data: &[u8]) -> (bool, Cow<'_, [u8]>) {
    if data.len() <= COMPRESSION_THRESHOLD {
        return (false, Cow::Borrowed(data));
    }

    match gzip(data) {
        Ok(out) if out.len() < data.len() => (true, Cow::Owned(out)),
        Ok(_) => (false, Cow::Borrowed(data)),
        Err(e) => {
            tracing::debug!("Compression failed, sending raw payload: {}", e);
            (false, Cow::Borrowed(data))
        }
    }
}

/// Gzip `data` unconditionally
pub fn gzip(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))
}

/// Inflate a gzip payload, refusing to produce more than `limit` bytes
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::new();
    let read = GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;

    if read > limit {
        return Err(CryptoError::Compression(format!(
            "decompressed payload exceeds {} bytes",
            limit
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_not_compressed() {
        let data = vec![b'a'; COMPRESSION_THRESHOLD];
        let (compressed, out) = try_compress(&data);
        assert!(!compressed);
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_compressible_payload_round_trips() {
        let data = b"GET /index.html HTTP/1.1\r\n".repeat(200);
        let (compressed, out) = try_compress(&data);
        assert!(compressed);
        assert!(out.len() < data.len());
        assert_eq!(decompress(&out, 1 << 20).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_kept_raw() {
        use rand::RngCore;
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);

        let (compressed, out) = try_compress(&data);
        assert!(!compressed);
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn test_gzip_small_input() {
        let out = gzip(b"key").unwrap();
        assert_eq!(decompress(&out, 16).unwrap(), b"key");
    }

    #[test]
    fn test_decompress_enforces_limit() {
        let data = vec![0u8; 64 * 1024];
        let (_, out) = try_compress(&data);
        assert!(decompress(&out, 1024).is_err());
        assert!(decompress(b"not gzip", 1024).is_err());
    }
}
