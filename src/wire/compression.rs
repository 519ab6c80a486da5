use std::io::{Read, Write};

use crate::error::{Error, Result};

/// A negotiated wire-protocol compressor. Ids match the `compression` array the server
/// advertises during `hello` and the `compressorId` byte of an `OP_COMPRESSED` header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressorId {
    Noop,
    Snappy,
    Zlib,
    Zstd,
}

impl CompressorId {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(CompressorId::Noop),
            1 => Ok(CompressorId::Snappy),
            2 => Ok(CompressorId::Zlib),
            3 => Ok(CompressorId::Zstd),
            other => Err(Error::protocol(format!("unknown compressor id {other}"))),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            CompressorId::Noop => 0,
            CompressorId::Snappy => 1,
            CompressorId::Zlib => 2,
            CompressorId::Zstd => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressorId::Noop => "noop",
            CompressorId::Snappy => "snappy",
            CompressorId::Zlib => "zlib",
            CompressorId::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "snappy" => Some(CompressorId::Snappy),
            "zlib" => Some(CompressorId::Zlib),
            "zstd" => Some(CompressorId::Zstd),
            _ => None,
        }
    }
}

/// Outbound messages are only compressed once their uncompressed body exceeds this many
/// bytes; smaller messages aren't worth the round trip of compressing/decompressing.
pub const COMPRESS_IF_LARGER_THAN: usize = 512;

/// Compress `payload` (the bytes of an `OP_MSG`, flags onward) with `compressor`.
pub fn compress(compressor: CompressorId, payload: &[u8]) -> Result<Vec<u8>> {
    match compressor {
        CompressorId::Noop => Ok(payload.to_vec()),
        #[cfg(feature = "zlib-compression")]
        CompressorId::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload)?;
            Ok(encoder.finish()?)
        }
        #[cfg(not(feature = "zlib-compression"))]
        CompressorId::Zlib => Err(Error::protocol("zlib compression not enabled")),
        #[cfg(feature = "snappy-compression")]
        CompressorId::Snappy => Ok(snap::raw::Encoder::new()
            .compress_vec(payload)
            .map_err(|e| Error::protocol(format!("snappy compression failed: {e}")))?),
        #[cfg(not(feature = "snappy-compression"))]
        CompressorId::Snappy => Err(Error::protocol("snappy compression not enabled")),
        #[cfg(feature = "zstd-compression")]
        CompressorId::Zstd => {
            zstd::encode_all(payload, 0).map_err(|e| Error::protocol(format!("zstd compression failed: {e}")))
        }
        #[cfg(not(feature = "zstd-compression"))]
        CompressorId::Zstd => Err(Error::protocol("zstd compression not enabled")),
    }
}

/// Decompress `payload` into exactly `uncompressed_size` bytes using `compressor`.
pub fn decompress(
    compressor: CompressorId,
    payload: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    let out = match compressor {
        CompressorId::Noop => payload.to_vec(),
        #[cfg(feature = "zlib-compression")]
        CompressorId::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(payload);
            let mut buf = Vec::with_capacity(uncompressed_size);
            decoder.read_to_end(&mut buf)?;
            buf
        }
        #[cfg(not(feature = "zlib-compression"))]
        CompressorId::Zlib => return Err(Error::protocol("zlib compression not enabled")),
        #[cfg(feature = "snappy-compression")]
        CompressorId::Snappy => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| Error::protocol(format!("snappy decompression failed: {e}")))?,
        #[cfg(not(feature = "snappy-compression"))]
        CompressorId::Snappy => return Err(Error::protocol("snappy compression not enabled")),
        #[cfg(feature = "zstd-compression")]
        CompressorId::Zstd => {
            zstd::decode_all(payload).map_err(|e| Error::protocol(format!("zstd decompression failed: {e}")))?
        }
        #[cfg(not(feature = "zstd-compression"))]
        CompressorId::Zstd => return Err(Error::protocol("zstd compression not enabled")),
    };

    if out.len() != uncompressed_size {
        return Err(Error::protocol(format!(
            "decompressed {} bytes but header declared {}",
            out.len(),
            uncompressed_size
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zlib_round_trips() {
        let payload = b"a fairly ordinary bson document body".repeat(20);
        let compressed = compress(CompressorId::Zlib, &payload).unwrap();
        let decompressed = decompress(CompressorId::Zlib, &compressed, payload.len()).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn zstd_round_trips() {
        let payload = b"another payload, repeated for good measure ".repeat(30);
        let compressed = compress(CompressorId::Zstd, &payload).unwrap();
        let decompressed = decompress(CompressorId::Zstd, &compressed, payload.len()).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn snappy_round_trips() {
        let payload = b"snappy payload snappy payload snappy payload".repeat(10);
        let compressed = compress(CompressorId::Snappy, &payload).unwrap();
        let decompressed = decompress(CompressorId::Snappy, &compressed, payload.len()).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn decompression_rejects_size_mismatch() {
        let payload = b"hello world".repeat(5);
        let compressed = compress(CompressorId::Zlib, &payload).unwrap();
        assert!(decompress(CompressorId::Zlib, &compressed, payload.len() + 1).is_err());
    }

    #[test]
    fn from_name_recognizes_csv_entries() {
        assert_eq!(CompressorId::from_name("zstd"), Some(CompressorId::Zstd));
        assert_eq!(CompressorId::from_name("bogus"), None);
    }
}
