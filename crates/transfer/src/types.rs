use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UploadError;

/// Marker stored in `totalChunks` when the chunk count is not known upfront.
const UNBOUNDED_MARKER: &str = "unbounded";

/// Expected number of chunks, fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TotalChunksRepr", into = "TotalChunksRepr")]
pub enum TotalChunks {
    /// Exactly `n` chunks, indices `0..n`. `n` is always at least 1.
    Bounded(u32),
    /// Total unknown; finalize assembles whatever chunk files exist.
    Unbounded,
}

impl TotalChunks {
    /// Creates a bounded total, rejecting zero.
    pub fn bounded(n: u32) -> Result<Self, UploadError> {
        if n == 0 {
            return Err(UploadError::InvalidTotalChunks(
                "bounded session needs at least one chunk".into(),
            ));
        }
        Ok(Self::Bounded(n))
    }

    /// Returns `true` if `index` is acceptable for this total.
    pub fn admits(&self, index: u32) -> bool {
        match self {
            Self::Bounded(n) => index < *n,
            Self::Unbounded => true,
        }
    }

    /// Returns the bounded count, if any.
    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Bounded(n) => Some(*n),
            Self::Unbounded => None,
        }
    }
}

impl fmt::Display for TotalChunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{n}"),
            Self::Unbounded => f.write_str(UNBOUNDED_MARKER),
        }
    }
}

/// Wire form of [`TotalChunks`]: a JSON integer or the `"unbounded"` string.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TotalChunksRepr {
    Count(u32),
    Marker(String),
}

impl TryFrom<TotalChunksRepr> for TotalChunks {
    type Error = String;

    fn try_from(repr: TotalChunksRepr) -> Result<Self, Self::Error> {
        match repr {
            TotalChunksRepr::Count(0) => Err("totalChunks must be positive".into()),
            TotalChunksRepr::Count(n) => Ok(Self::Bounded(n)),
            TotalChunksRepr::Marker(m) if m == UNBOUNDED_MARKER => Ok(Self::Unbounded),
            TotalChunksRepr::Marker(m) => Err(format!("unknown totalChunks marker: {m}")),
        }
    }
}

impl From<TotalChunks> for TotalChunksRepr {
    fn from(total: TotalChunks) -> Self {
        match total {
            TotalChunks::Bounded(n) => Self::Count(n),
            TotalChunks::Unbounded => Self::Marker(UNBOUNDED_MARKER.into()),
        }
    }
}

/// In-memory state of one upload session.
///
/// This is a cache of the session's `metadata.json`; every accepted chunk is
/// reflected on disk before the call that delivered it returns.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSession {
    pub id: String,
    pub original_name: String,
    pub total_chunks: TotalChunks,
    pub received_chunks: HashSet<u32>,
    pub target_path: PathBuf,
    pub visibility: String,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Creates a session with an empty received-set.
    pub fn new(
        id: String,
        total_chunks: TotalChunks,
        original_name: String,
        target_path: PathBuf,
        visibility: String,
    ) -> Self {
        Self {
            id,
            original_name,
            total_chunks,
            received_chunks: HashSet::new(),
            target_path,
            visibility,
            updated_at: Utc::now(),
        }
    }

    /// Number of distinct chunk indices received so far.
    pub fn received_count(&self) -> u32 {
        self.received_chunks.len() as u32
    }

    /// Returns `true` once every expected chunk of a bounded session arrived.
    ///
    /// Always `false` for unbounded sessions.
    pub fn is_complete(&self) -> bool {
        match self.total_chunks {
            TotalChunks::Bounded(n) => self.received_count() == n,
            TotalChunks::Unbounded => false,
        }
    }

    /// Received indices in ascending order.
    pub fn sorted_chunks(&self) -> Vec<u32> {
        let mut chunks: Vec<u32> = self.received_chunks.iter().copied().collect();
        chunks.sort_unstable();
        chunks
    }

    /// Converts to the persisted form.
    pub fn to_metadata(&self) -> UploadSessionMetadata {
        UploadSessionMetadata {
            id: self.id.clone(),
            original_name: self.original_name.clone(),
            total_chunks: self.total_chunks,
            received_chunks: self.sorted_chunks(),
            target_path: self.target_path.clone(),
            visibility: self.visibility.clone(),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Persisted session record (`metadata.json`).
///
/// Field names are a compatibility surface: renaming one breaks recovery of
/// sessions written by an earlier build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionMetadata {
    pub id: String,
    pub original_name: String,
    pub total_chunks: TotalChunks,
    /// Ascending, duplicate-free.
    pub received_chunks: Vec<u32>,
    pub target_path: PathBuf,
    pub visibility: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UploadSessionMetadata {
    /// Progress in percent; `None` for unbounded sessions.
    pub fn percentage(&self) -> Option<f64> {
        crate::progress::ratio(self.received_chunks.len(), self.total_chunks)
    }
}

impl From<UploadSessionMetadata> for UploadSession {
    fn from(meta: UploadSessionMetadata) -> Self {
        Self {
            id: meta.id,
            original_name: meta.original_name,
            total_chunks: meta.total_chunks,
            received_chunks: meta.received_chunks.into_iter().collect(),
            target_path: meta.target_path,
            visibility: meta.visibility,
            // Records from before `updatedAt` existed count as fresh on load.
            updated_at: meta.updated_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Outcome of a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedUpload {
    pub id: String,
    pub target_path: PathBuf,
    pub visibility: String,
    pub chunk_count: u32,
    pub bytes_written: u64,
    /// SHA-256 hex digest of the assembled file.
    pub checksum: String,
}
