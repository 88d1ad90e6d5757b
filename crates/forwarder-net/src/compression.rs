//! Conditional LZ4 block compression for backend frames.
//!
//! Payloads below the threshold go out as-is, and so does any payload LZ4
//! fails to shrink. The original length travels in the frame header, so the
//! compressed block carries no size prefix of its own.

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum payload size (bytes) before compression is attempted. Default: 16.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 16,
            enabled: true,
        }
    }
}

/// Compress `data` if it is large enough and the result is strictly smaller.
///
/// Returns `None` when the payload should be sent uncompressed.
pub fn compress(data: &[u8], config: &CompressionConfig) -> Option<Vec<u8>> {
    if !config.enabled || data.len() < config.threshold {
        return None;
    }
    let compressed = lz4_flex::block::compress(data);
    (compressed.len() < data.len()).then_some(compressed)
}

/// Decompress an LZ4 block whose original length is `original_len`.
pub fn decompress(data: &[u8], original_len: usize) -> Result<Vec<u8>, CompressionError> {
    let out = lz4_flex::block::decompress(data, original_len)
        .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
    if out.len() != original_len {
        return Err(CompressionError::LengthMismatch {
            expected: original_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The block inflated to a different size than the header declared.
    #[error("decompressed {actual} bytes, header declared {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_is_not_compressed() {
        let config = CompressionConfig::default();
        assert_eq!(compress(&[7u8; 15], &config), None);
    }

    #[test]
    fn test_repetitive_payload_is_compressed() {
        let config = CompressionConfig::default();
        let data = vec![42u8; 1024];
        let compressed = compress(&data, &config).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_is_left_alone() {
        let config = CompressionConfig::default();
        // Sixteen distinct bytes give LZ4 nothing to match.
        let data: Vec<u8> = (0..16).collect();
        assert_eq!(compress(&data, &config), None);
    }

    #[test]
    fn test_compression_disabled() {
        let config = CompressionConfig {
            threshold: 16,
            enabled: false,
        };
        assert_eq!(compress(&[0u8; 1024], &config), None);
    }

    #[test]
    fn test_wrong_length_is_error() {
        let config = CompressionConfig::default();
        let data = vec![1u8; 512];
        let compressed = compress(&data, &config).unwrap();
        assert!(decompress(&compressed, 100).is_err());
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(decompress(&[0xFF, 0xFF, 0xFF], 64).is_err());
    }
}
