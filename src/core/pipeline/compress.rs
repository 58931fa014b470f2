//! Optional per-chunk compression stage (gzip).
//!
//! The stage is lossless and per-chunk: each chunk payload is compressed
//! independently so the receiver can decompress as records arrive. Whether a
//! file travels compressed is decided once, from its total size, and carried
//! in the file's metadata; the receiver must honor that flag and never
//! sniff payloads.

use crate::core::config::{COMPRESS_MAX_SIZE, COMPRESS_MIN_SIZE};
use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Size-window policy: compressing tiny files wastes more bytes on container
/// overhead than it saves, and very large files dominate CPU time.
pub fn should_compress(file_size: u64) -> bool {
    (COMPRESS_MIN_SIZE..=COMPRESS_MAX_SIZE).contains(&file_size)
}

/// Compress one chunk payload into a gzip member.
pub fn compress_chunk(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress one gzip-compressed chunk payload.
pub fn decompress_chunk(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
