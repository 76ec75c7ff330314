//! Chunked upload sessions with crash-safe scratch storage.
//!
//! A file arrives as independently-delivered, index-addressed chunks. Each
//! upload attempt is a session whose chunk files and metadata live under
//! `<scratch_root>/<session_id>/` until [`UploadManager::finalize`] streams
//! the chunks, in ascending index order, into the target file.

mod chunked;
mod config;
mod manager;
mod progress;
mod recovery;
mod service;
mod store;
mod types;
mod validation;

pub use chunked::{checksum_bytes, chunk_file_name, parse_chunk_file_name};
pub use config::{TransferConfig, config_file_path};
pub use manager::UploadManager;
pub use progress::percentage;
pub use recovery::RecoveryReport;
pub use service::UploadService;
pub use types::{FinalizedUpload, TotalChunks, UploadSession, UploadSessionMetadata};
pub use validation::{validate_session_id, validate_upload_path};

/// File name of the persisted session record inside a session directory.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Prefix of index-addressed chunk files (`chunk-<index>`).
pub const CHUNK_FILE_PREFIX: &str = "chunk-";

/// Copy buffer used when streaming chunks into the target: 1 MiB.
pub const ASSEMBLY_BUFFER_SIZE: usize = 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("incomplete upload: expected {expected} chunks, received {received}")]
    IncompleteUpload { expected: u32, received: u32 },

    #[error("no chunks to assemble for session {0}")]
    EmptyUpload(String),

    #[error("chunk index {index} out of range (total {total})")]
    InvalidChunkIndex { index: i64, total: TotalChunks },

    #[error("invalid total chunk count: {0}")]
    InvalidTotalChunks(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Generates a fresh random session id for callers that do not have one.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
