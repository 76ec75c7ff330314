//! Scratch root scanning for session recovery.
//!
//! These helpers only read and tidy directories; registering the results in
//! memory, under the right locks, is up to
//! [`UploadManager::load_sessions_from_disk`](crate::UploadManager::load_sessions_from_disk).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::chunked::chunk_file_name;
use crate::store::{metadata_path, read_metadata, remove_temp_files};
use crate::types::UploadSessionMetadata;
use crate::validation::validate_session_id;
use crate::UploadError;

/// What a call to
/// [`load_sessions_from_disk`](crate::UploadManager::load_sessions_from_disk)
/// found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Ids registered in memory, sorted.
    pub loaded: Vec<String>,
    /// Directories that were not loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Temp files from interrupted writes that were deleted.
    pub temp_files_removed: usize,
    /// Ids that were in memory but whose record no longer exists on disk.
    pub dropped: Vec<String>,
}

/// Lists session directories under `root` as `(id, dir)` pairs.
///
/// Directories whose name is not a valid session id are recorded in
/// `report.skipped`. A missing root yields nothing.
pub(crate) fn session_dirs(
    root: &Path,
    report: &mut RecoveryReport,
) -> Result<Vec<(String, PathBuf)>, UploadError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let dir = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        match validate_session_id(&name) {
            Ok(()) => dirs.push((name, dir)),
            Err(e) => {
                debug!(dir = %dir.display(), "ignoring non-session directory");
                report.skipped.push((dir, e.to_string()));
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Reads and checks the record in one session directory.
///
/// Received indices whose chunk file is missing, or that fall outside a
/// bounded total, are dropped so the client resends them. The error string
/// explains why a directory cannot be loaded at all.
pub(crate) fn load_record(id: &str, dir: &Path) -> Result<UploadSessionMetadata, String> {
    if !metadata_path(dir).exists() {
        // A crash between creating the directory and its first record.
        debug!(dir = %dir.display(), "session directory without metadata");
        return Err("no metadata record".into());
    }

    let mut meta = read_metadata(dir).map_err(|e| {
        warn!(dir = %dir.display(), error = %e, "unreadable session metadata, skipping");
        e.to_string()
    })?;

    if meta.id != id {
        warn!(
            dir = %dir.display(),
            recorded = %meta.id,
            "session metadata id does not match its directory, skipping"
        );
        return Err(format!("metadata id {:?} differs from directory", meta.id));
    }

    let before = meta.received_chunks.len();
    let total = meta.total_chunks;
    meta.received_chunks
        .retain(|&index| total.admits(index) && dir.join(chunk_file_name(index)).is_file());
    if meta.received_chunks.len() != before {
        warn!(
            session_id = %id,
            dropped = before - meta.received_chunks.len(),
            "dropped recorded chunks that are missing or out of range"
        );
    }

    Ok(meta)
}

/// Deletes temp debris in a session directory nobody is writing to.
pub(crate) fn clean_session_dir(dir: &Path, report: &mut RecoveryReport) {
    match remove_temp_files(dir) {
        Ok(n) => report.temp_files_removed += n,
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to clean temp files"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::write_chunk_file;
    use crate::store::{create_session_dir, persist_metadata};
    use crate::types::{TotalChunks, UploadSession};
    use tempfile::TempDir;

    fn persisted(root: &Path, id: &str, total: TotalChunks, chunks: &[u32]) -> PathBuf {
        let dir = create_session_dir(root, id).unwrap();
        let mut session = UploadSession::new(
            id.into(),
            total,
            "f".into(),
            root.join("out"),
            "public".into(),
        );
        for &i in chunks {
            write_chunk_file(&dir, i, b"x", false).unwrap();
            session.received_chunks.insert(i);
        }
        persist_metadata(&dir, &session, false).unwrap();
        dir
    }

    #[test]
    fn missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let mut report = RecoveryReport::default();
        let dirs = session_dirs(&tmp.path().join("absent"), &mut report).unwrap();
        assert!(dirs.is_empty());
        assert_eq!(report, RecoveryReport::default());
    }

    #[test]
    fn lists_only_session_directories() {
        let tmp = TempDir::new().unwrap();
        persisted(tmp.path(), "b", TotalChunks::Bounded(1), &[]);
        persisted(tmp.path(), "a", TotalChunks::Bounded(1), &[]);
        std::fs::create_dir(tmp.path().join("has space")).unwrap();
        std::fs::write(tmp.path().join("stray-file"), b"x").unwrap();

        let mut report = RecoveryReport::default();
        let dirs = session_dirs(tmp.path(), &mut report).unwrap();
        let ids: Vec<&str> = dirs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn loads_valid_records() {
        let tmp = TempDir::new().unwrap();
        let a = persisted(tmp.path(), "a", TotalChunks::Bounded(3), &[0, 2]);
        let b = persisted(tmp.path(), "b", TotalChunks::Unbounded, &[5]);

        assert_eq!(load_record("a", &a).unwrap().received_chunks, vec![0, 2]);
        assert_eq!(
            load_record("b", &b).unwrap().total_chunks,
            TotalChunks::Unbounded
        );
    }

    #[test]
    fn rejects_bad_records() {
        let tmp = TempDir::new().unwrap();

        let corrupt = create_session_dir(tmp.path(), "corrupt").unwrap();
        std::fs::write(metadata_path(&corrupt), b"\0\0garbage").unwrap();
        assert!(load_record("corrupt", &corrupt).is_err());

        let empty = create_session_dir(tmp.path(), "empty").unwrap();
        assert_eq!(load_record("empty", &empty).unwrap_err(), "no metadata record");

        let orig = persisted(tmp.path(), "orig", TotalChunks::Bounded(1), &[]);
        let renamed = tmp.path().join("renamed");
        std::fs::rename(&orig, &renamed).unwrap();
        assert!(load_record("renamed", &renamed).is_err());
    }

    #[test]
    fn drops_claimed_chunks_without_files() {
        let tmp = TempDir::new().unwrap();
        let dir = persisted(tmp.path(), "s", TotalChunks::Bounded(3), &[0, 1]);
        std::fs::remove_file(dir.join("chunk-1")).unwrap();

        assert_eq!(load_record("s", &dir).unwrap().received_chunks, vec![0]);
    }

    #[test]
    fn removes_temp_debris() {
        let tmp = TempDir::new().unwrap();
        let dir = persisted(tmp.path(), "s", TotalChunks::Bounded(2), &[0]);
        std::fs::write(dir.join(".tmpQ1w2E3"), b"half a chunk").unwrap();

        let mut report = RecoveryReport::default();
        clean_session_dir(&dir, &mut report);
        assert_eq!(report.temp_files_removed, 1);
        assert!(!dir.join(".tmpQ1w2E3").exists());
        assert!(dir.join("chunk-0").exists());
    }
}
