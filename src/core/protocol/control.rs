//! Control messages carried on the data channel, and inbound frame
//! classification.
//!
//! The data channel interleaves two kinds of traffic:
//! - JSON control strings (`file_metadata`, `transfer_complete`)
//! - binary chunk records (see [`crate::core::pipeline::chunk`])
//!
//! A receiver first tries to read a frame as UTF-8 JSON with a known `type`;
//! only on failure is it treated as a chunk record.

use serde::{Deserialize, Serialize};

// ── File metadata ─────────────────────────────────────────────────────────────

/// Announcement of the file whose chunks follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub file_name: String,
    pub file_type: String,
    /// Total logical (pre-compression) size in bytes.
    pub total_size: u64,
    /// Chunk size the sender split with (pre-compression).
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// Whether the chunk payloads that follow are gzip-compressed.
    pub compressed: bool,
}

impl TransferMetadata {
    /// Build metadata for a file, deriving `total_chunks`.
    pub fn new(
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        total_size: u64,
        chunk_size: u32,
        compressed: bool,
    ) -> Self {
        let total_chunks = total_size.div_ceil(chunk_size as u64) as u32;
        Self {
            file_name: file_name.into(),
            file_type: file_type.into(),
            total_size,
            chunk_size,
            total_chunks,
            compressed,
        }
    }
}

// ── Control frames ────────────────────────────────────────────────────────────

/// JSON control messages sent as text-shaped datagrams between chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent before a file's chunks. `compressed` duplicates the metadata
    /// flag at the top level; `encrypted` is carried for forward
    /// compatibility and not interpreted by the pipeline.
    FileMetadata {
        metadata: TransferMetadata,
        compressed: bool,
        encrypted: bool,
    },
    /// Sent after the last chunk of the last file.
    TransferComplete,
}

// ── Inbound classification ────────────────────────────────────────────────────

/// What an inbound datagram turned out to be.
#[derive(Debug)]
pub enum InboundFrame {
    /// A recognized control message.
    Control(ControlFrame),
    /// JSON with a `type` we don't know; ignored per protocol.
    Unknown(String),
    /// Anything else: a binary chunk record.
    Chunk,
}

/// Classify an inbound datagram.
///
/// JSON is only attempted when the bytes decode as UTF-8 and look like an
/// object; a chunk record whose first byte happens to be `{` cannot also be
/// valid JSON, so misclassification would require a crafted payload, and a
/// crafted payload with an unknown `type` is ignored rather than corrupting
/// the accumulator.
pub fn classify(data: &[u8]) -> InboundFrame {
    let Ok(text) = std::str::from_utf8(data) else {
        return InboundFrame::Chunk;
    };
    if !text.trim_start().starts_with('{') {
        return InboundFrame::Chunk;
    }
    if let Ok(frame) = serde_json::from_str::<ControlFrame>(text) {
        return InboundFrame::Control(frame);
    }
    // Valid JSON with an unrecognized discriminator is ignored; everything
    // else falls through to the chunk decoder.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
            return InboundFrame::Unknown(kind.to_string());
        }
    }
    InboundFrame::Chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_chunk_count() {
        let meta = TransferMetadata::new("a.bin", "application/octet-stream", 100, 30, false);
        assert_eq!(meta.total_chunks, 4);
        let exact = TransferMetadata::new("b.bin", "application/octet-stream", 90, 30, false);
        assert_eq!(exact.total_chunks, 3);
        let empty = TransferMetadata::new("c.bin", "application/octet-stream", 0, 30, false);
        assert_eq!(empty.total_chunks, 0);
    }

    #[test]
    fn test_classify_control() {
        let json = serde_json::to_vec(&ControlFrame::TransferComplete).unwrap();
        assert!(matches!(
            classify(&json),
            InboundFrame::Control(ControlFrame::TransferComplete)
        ));

        let meta = ControlFrame::FileMetadata {
            metadata: TransferMetadata::new("hello.txt", "text/plain", 13, 16, false),
            compressed: false,
            encrypted: false,
        };
        let json = serde_json::to_vec(&meta).unwrap();
        match classify(&json) {
            InboundFrame::Control(ControlFrame::FileMetadata { metadata, .. }) => {
                assert_eq!(metadata.file_name, "hello.txt");
                assert_eq!(metadata.total_chunks, 1);
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown_json_is_ignored() {
        match classify(br#"{"type":"future_extension","x":1}"#) {
            InboundFrame::Unknown(kind) => assert_eq!(kind, "future_extension"),
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_binary_is_chunk() {
        // A chunk record: index 0, size 4, payload "abcd".
        let mut record = Vec::new();
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&4u32.to_le_bytes());
        record.extend_from_slice(b"abcd");
        assert!(matches!(classify(&record), InboundFrame::Chunk));

        // Non-UTF8 payloads can never be mistaken for control traffic.
        assert!(matches!(classify(&[0xff, 0xfe, 0x00]), InboundFrame::Chunk));
    }

    #[test]
    fn test_control_wire_shape() {
        let frame = ControlFrame::FileMetadata {
            metadata: TransferMetadata::new("x", "text/plain", 1, 1, true),
            compressed: true,
            encrypted: false,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "file_metadata");
        assert_eq!(value["metadata"]["compressed"], true);
        assert_eq!(value["compressed"], true);
        assert_eq!(value["encrypted"], false);
    }
}
