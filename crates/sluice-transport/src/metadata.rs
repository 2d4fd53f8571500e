use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one logical transfer attempt.
///
/// Passed to every endpoint call and sent as the first frame of stream
/// transports so the receiving side can match the payload to its transfer.
/// The checksum is computed by the caller over the already-encrypted bytes;
/// the transport layer only carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Unique transfer identifier (UUID v4 unless supplied by the caller).
    #[serde(rename = "transferId")]
    pub transfer_id: String,

    /// Name of the file being moved.
    #[serde(rename = "fileName")]
    pub file_name: String,

    /// Payload size in bytes.
    pub size: u64,

    /// Caller-computed checksum of the payload.
    pub checksum: String,

    /// Chunk position, when the caller splits a file.
    #[serde(skip_serializing_if = "Option::is_none", rename = "chunkIndex")]
    pub chunk_index: Option<u32>,

    /// Total number of chunks, when the caller splits a file.
    #[serde(skip_serializing_if = "Option::is_none", rename = "totalChunks")]
    pub total_chunks: Option<u32>,

    /// Unix timestamp in milliseconds when the metadata was created.
    pub timestamp: u64,
}

impl TransferMetadata {
    /// Create metadata with a fresh transfer id.
    pub fn new(file_name: &str, size: u64, checksum: &str) -> Self {
        Self::with_id(&uuid::Uuid::new_v4().to_string(), file_name, size, checksum)
    }

    /// Create metadata for an existing transfer id.
    pub fn with_id(transfer_id: &str, file_name: &str, size: u64, checksum: &str) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            size,
            checksum: checksum.to_string(),
            chunk_index: None,
            total_chunks: None,
            timestamp: now_ms(),
        }
    }

    /// Mark this metadata as describing chunk `index` of `total`.
    pub fn chunk(mut self, index: u32, total: u32) -> Self {
        self.chunk_index = Some(index);
        self.total_chunks = Some(total);
        self
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
