// Compression backends for PHX record payloads

use crate::core::constants::CompressionType;
use crate::core::error::{Result, StoreError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

pub fn decompress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),

        CompressionType::Zlib => {
            let mut decoder = ZlibDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| StoreError::DecompressionFailed(format!("Zlib: {}", e)))?;
            Ok(decompressed)
        }

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => lz4::block::decompress(data, None)
            .map_err(|e| StoreError::DecompressionFailed(format!("LZ4: {}", e))),

        #[cfg(not(feature = "lz4"))]
        CompressionType::Lz4 => Err(StoreError::UnsupportedCompression(2)),

        #[cfg(feature = "zstd")]
        CompressionType::Zstd => zstd::decode_all(data)
            .map_err(|e| StoreError::DecompressionFailed(format!("Zstd: {}", e))),

        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(StoreError::UnsupportedCompression(3)),
    }
}

pub fn compress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),

        CompressionType::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }

        // Size is prepended so `decompress` can call the block API without a hint
        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => Ok(lz4::block::compress(data, None, true)?),

        #[cfg(not(feature = "lz4"))]
        CompressionType::Lz4 => Err(StoreError::UnsupportedCompression(2)),

        #[cfg(feature = "zstd")]
        CompressionType::Zstd => Ok(zstd::encode_all(data, 0)?),

        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(StoreError::UnsupportedCompression(3)),
    }
}

/// Encode samples as little-endian f64 bytes.
pub fn samples_to_bytes(samples: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 8);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

pub fn bytes_to_samples(raw: &[u8]) -> Result<Vec<f64>> {
    if raw.len() % 8 != 0 {
        return Err(StoreError::CorruptedData(format!(
            "sample payload of {} bytes is not a multiple of 8",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|b| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            f64::from_le_bytes(buf)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_none() {
        let data = b"hello world";
        let result = decompress(data, CompressionType::None).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn test_decompress_zlib() {
        let original = b"hello world";
        let compressed = compress(original, CompressionType::Zlib).unwrap();
        let decompressed = decompress(&compressed, CompressionType::Zlib).unwrap();
        assert_eq!(decompressed, original);
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn test_lz4_prepends_size() {
        let original = samples_to_bytes(&[1.5; 64]);
        let compressed = compress(&original, CompressionType::Lz4).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(decompress(&compressed, CompressionType::Lz4).unwrap(), original);
    }

    #[test]
    fn test_sample_bytes() {
        let samples = vec![0.0, -1.25, 3.5e6];
        let raw = samples_to_bytes(&samples);
        assert_eq!(raw.len(), 24);
        assert_eq!(bytes_to_samples(&raw).unwrap(), samples);
        assert!(matches!(
            bytes_to_samples(&raw[..7]),
            Err(StoreError::CorruptedData(_))
        ));
    }
}
