use std::path::{Component, Path};

use crate::UploadError;

/// Longest accepted session id, in bytes.
const MAX_SESSION_ID_LEN: usize = 128;

/// Validates a caller-supplied session id.
///
/// The id names a directory under the scratch root, so it must be a single
/// plain path component: ASCII letters, digits, `.`, `_` and `-` only, not
/// `.` or `..`, and at most 128 bytes.
pub fn validate_session_id(id: &str) -> Result<(), UploadError> {
    if id.is_empty() {
        return Err(UploadError::InvalidSessionId("empty id".into()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(UploadError::InvalidSessionId(format!(
            "id longer than {MAX_SESSION_ID_LEN} bytes"
        )));
    }
    if id == "." || id == ".." {
        return Err(UploadError::InvalidSessionId(format!("reserved id: {id}")));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(UploadError::InvalidSessionId(format!(
            "character {c:?} not allowed in {id:?}"
        )));
    }
    Ok(())
}

/// Validates that a relative file path does not escape its base directory.
///
/// Used for original file names before they are joined onto the default
/// target directory. Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), UploadError> {
    if file_path.is_empty() {
        return Err(UploadError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(UploadError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(UploadError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(UploadError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(UploadError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
        }
    }

    // "." or "./" would resolve to the target directory itself.
    if normal == 0 {
        return Err(UploadError::InvalidPath(format!(
            "path names no file: {file_path}"
        )));
    }

    Ok(())
}
