//! Chunk framing and reassembly.
//!
//! Wire form of a chunk record: `[index: u32 LE][size: u32 LE][payload]`.
//! `size` always carries the pre-compression logical length of the chunk;
//! when the payload travels compressed, the two differ on the wire and the
//! equality is restored by decompression before the chunk reaches the
//! accumulator.

use crate::core::config::CHUNK_HEADER_LEN;
use crate::core::protocol::control::TransferMetadata;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures in the framing / reassembly layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// Record shorter than the 8-byte header.
    #[error("chunk record too short: {len} bytes")]
    Malformed { len: usize },
    /// Chunk index outside `[0, total_chunks)`.
    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    /// Payload length disagrees with the logical size after any
    /// decompression has run.
    #[error("chunk {index}: payload is {actual} bytes, header says {expected}")]
    SizeMismatch {
        index: u32,
        expected: u32,
        actual: usize,
    },
    /// `merge` called while chunks are still missing.
    #[error("file incomplete: {missing} chunks missing")]
    Incomplete { missing: u32 },
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// One framed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position within the file.
    pub index: u32,
    /// Logical (pre-compression) payload length.
    pub size: u32,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Build a chunk from raw file bytes; `size` is derived.
    pub fn new(index: u32, payload: Vec<u8>) -> Self {
        Self {
            index,
            size: payload.len() as u32,
            payload,
        }
    }

    /// Replace the payload (after compression), keeping the logical size.
    pub fn with_payload(self, payload: Vec<u8>) -> Self {
        Self { payload, ..self }
    }

    /// Encode as `[index LE][size LE][payload]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a chunk record. Fails [`FramingError::Malformed`] when the
    /// record cannot even hold the header; payload length is validated
    /// against `size` later, once any compression has been undone.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(FramingError::Malformed { len: bytes.len() });
        }
        let index = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            index,
            size,
            payload: bytes[CHUNK_HEADER_LEN..].to_vec(),
        })
    }
}

// ── Splitter ──────────────────────────────────────────────────────────────────

/// Lazy, finite, non-restartable chunk producer over a file's bytes.
///
/// Chunk `i` covers `[i * chunk_size, min((i + 1) * chunk_size, len))`; the
/// last chunk may be short, and an empty file produces no chunks.
pub struct ChunkSplitter<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
    next_index: u32,
}

/// Split `data` into chunks of `chunk_size` bytes. `chunk_size` must be
/// positive.
pub fn split(data: &[u8], chunk_size: usize) -> ChunkSplitter<'_> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    ChunkSplitter {
        data,
        chunk_size,
        offset: 0,
        next_index: 0,
    }
}

impl Iterator for ChunkSplitter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = Chunk::new(self.next_index, self.data[self.offset..end].to_vec());
        self.offset = end;
        self.next_index += 1;
        Some(chunk)
    }
}

// ── Accumulator ───────────────────────────────────────────────────────────────

/// Reassembles a file from chunks that may arrive in any order.
pub struct ChunkAccumulator {
    metadata: TransferMetadata,
    slots: Vec<Option<Vec<u8>>>,
    received: u32,
    /// Logical bytes observed so far.
    bytes: u64,
}

impl ChunkAccumulator {
    pub fn new(metadata: TransferMetadata) -> Self {
        let slots = vec![None; metadata.total_chunks as usize];
        Self {
            metadata,
            slots,
            received: 0,
            bytes: 0,
        }
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    /// Store a chunk by index. Returns `false` for a duplicate (first write
    /// wins). The payload here is always post-decompression, so its length
    /// must match the logical `size`.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<bool, FramingError> {
        if chunk.index >= self.metadata.total_chunks {
            return Err(FramingError::IndexOutOfRange {
                index: chunk.index,
                total: self.metadata.total_chunks,
            });
        }
        if chunk.payload.len() != chunk.size as usize {
            return Err(FramingError::SizeMismatch {
                index: chunk.index,
                expected: chunk.size,
                actual: chunk.payload.len(),
            });
        }
        let slot = &mut self.slots[chunk.index as usize];
        if slot.is_some() {
            return Ok(false);
        }
        self.bytes += chunk.size as u64;
        self.received += 1;
        *slot = Some(chunk.payload);
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.metadata.total_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.received
    }

    /// Logical bytes accumulated so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    /// Indices in `[0, total_chunks)` not yet received, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Completion ratio in `[0, 1]` by logical bytes.
    pub fn progress(&self) -> f64 {
        if self.metadata.total_size == 0 {
            return 1.0;
        }
        self.bytes as f64 / self.metadata.total_size as f64
    }

    /// Concatenate payloads in index order. Fails while incomplete.
    pub fn merge(&self) -> Result<Vec<u8>, FramingError> {
        if !self.is_complete() {
            return Err(FramingError::Incomplete {
                missing: self.metadata.total_chunks - self.received,
            });
        }
        let mut out = Vec::with_capacity(self.metadata.total_size as usize);
        for slot in &self.slots {
            out.extend_from_slice(slot.as_ref().expect("complete accumulator"));
        }
        Ok(out)
    }

    /// Consume the accumulator into the final file.
    pub fn into_file(self) -> Result<(TransferMetadata, Vec<u8>), FramingError> {
        let bytes = self.merge()?;
        Ok((self.metadata, bytes))
    }
}
