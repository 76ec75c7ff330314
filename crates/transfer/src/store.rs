//! Session directories and the persisted `metadata.json` record.
//!
//! Every file written here goes through [`write_atomic`]: the bytes land in
//! a uniquely named temp file in the destination directory and are renamed
//! over the final name only once complete, so a crash leaves either the old
//! record or the new one.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::types::{UploadSession, UploadSessionMetadata};
use crate::{METADATA_FILE_NAME, UploadError};

/// Prefix `tempfile` gives its temp files; anything carrying it in a session
/// directory is debris from an interrupted write.
pub(crate) const TEMP_FILE_PREFIX: &str = ".tmp";

/// Directory holding one session's chunks and metadata.
pub(crate) fn session_dir(root: &Path, id: &str) -> PathBuf {
    root.join(id)
}

pub(crate) fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE_NAME)
}

/// Creates the directory for a new session.
///
/// Fails with [`UploadError::DuplicateSession`] if the directory already
/// exists, which also covers sessions left on disk but not yet recovered.
pub(crate) fn create_session_dir(root: &Path, id: &str) -> Result<PathBuf, UploadError> {
    std::fs::create_dir_all(root)?;
    let dir = session_dir(root, id);
    match std::fs::create_dir(&dir) {
        Ok(()) => Ok(dir),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(UploadError::DuplicateSession(id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes `data` to `target` via temp file + rename in `dir`.
///
/// With `sync` set, file contents are flushed to stable storage before the
/// rename and the directory entry is flushed after it.
pub(crate) fn write_atomic(
    dir: &Path,
    target: &Path,
    data: &[u8],
    sync: bool,
) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    if sync {
        tmp.as_file().sync_all()?;
    }
    tmp.persist(target).map_err(|e| e.error)?;
    if sync {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Flushes a directory entry so a completed rename survives power loss.
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Persists the session record atomically.
pub(crate) fn persist_metadata(
    dir: &Path,
    session: &UploadSession,
    sync: bool,
) -> Result<(), UploadError> {
    let json = serde_json::to_vec_pretty(&session.to_metadata())?;
    write_atomic(dir, &metadata_path(dir), &json, sync)?;
    Ok(())
}

/// Reads the session record from a session directory.
pub(crate) fn read_metadata(dir: &Path) -> Result<UploadSessionMetadata, UploadError> {
    let content = std::fs::read(metadata_path(dir))?;
    let mut meta: UploadSessionMetadata = serde_json::from_slice(&content)?;
    // Hand-edited or older records may not be normalized.
    meta.received_chunks.sort_unstable();
    meta.received_chunks.dedup();
    Ok(meta)
}

/// Deletes a session directory. Missing directories are not an error.
pub(crate) fn remove_session_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes temp-file debris left in a session directory by a crash.
///
/// Returns the number of files removed.
pub(crate) fn remove_temp_files(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(TEMP_FILE_PREFIX) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = %entry.path().display(), error = %e, "failed to remove temp file");
            } else {
                removed += 1;
            }
        }
    }
    Ok(removed)
}
