use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::store::{sync_dir, write_atomic};
use crate::{ASSEMBLY_BUFFER_SIZE, CHUNK_FILE_PREFIX};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Chunk files
// ---------------------------------------------------------------------------

/// File name for the chunk at `index` (`chunk-<index>`).
pub fn chunk_file_name(index: u32) -> String {
    format!("{CHUNK_FILE_PREFIX}{index}")
}

/// Parses a chunk file name back into its index.
///
/// Only canonical names are accepted: `chunk-007` or `chunk-+7` are not
/// chunk files, so two names can never map to the same index.
pub fn parse_chunk_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(CHUNK_FILE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    (chunk_file_name(index) == name).then_some(index)
}

/// Writes one chunk's bytes into the session directory.
///
/// The write is atomic: a re-submitted index replaces the previous bytes in
/// one rename, and readers never observe a truncated chunk.
pub(crate) fn write_chunk_file(
    dir: &Path,
    index: u32,
    data: &[u8],
    sync: bool,
) -> std::io::Result<()> {
    write_atomic(dir, &dir.join(chunk_file_name(index)), data, sync)
}

/// Lists chunk indices present in a session directory, ascending.
pub(crate) fn list_chunk_indices(dir: &Path) -> std::io::Result<Vec<u32>> {
    let mut indices: Vec<u32> = std::fs::read_dir(dir)?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| parse_chunk_file_name(&entry.file_name().to_string_lossy()))
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Result of streaming chunks into a target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Assembly {
    pub bytes_written: u64,
    pub checksum: String,
}

/// Writer adapter that hashes and counts everything passing through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Streams the chunk files for `indices`, in the given order, into `target`.
///
/// Bytes go to a temp file next to `target` which is renamed over it only
/// after every chunk was copied. On error the temp file is deleted and
/// `target` is left untouched. Memory use is bounded by the copy buffer
/// regardless of upload size.
pub(crate) fn assemble(
    dir: &Path,
    indices: &[u32],
    target: &Path,
    sync: bool,
) -> std::io::Result<Assembly> {
    let parent = target_parent(target);
    std::fs::create_dir_all(&parent)?;

    let tmp = tempfile::NamedTempFile::new_in(&parent)?;
    let mut out = HashingWriter {
        inner: BufWriter::with_capacity(ASSEMBLY_BUFFER_SIZE, tmp),
        hasher: Sha256::new(),
        written: 0,
    };

    for &index in indices {
        let path = dir.join(chunk_file_name(index));
        let file = std::fs::File::open(&path).map_err(|e| {
            std::io::Error::new(e.kind(), format!("chunk {index} at {}: {e}", path.display()))
        })?;
        let mut reader = BufReader::with_capacity(ASSEMBLY_BUFFER_SIZE, file);
        std::io::copy(&mut reader, &mut out)?;
    }
    out.flush()?;

    let HashingWriter {
        inner,
        hasher,
        written,
    } = out;
    let tmp = inner.into_inner().map_err(|e| e.into_error())?;
    if sync {
        tmp.as_file().sync_all()?;
    }
    tmp.persist(target).map_err(|e| e.error)?;
    if sync {
        sync_dir(&parent)?;
    }

    Ok(Assembly {
        bytes_written: written,
        checksum: hex::encode(hasher.finalize()),
    })
}

fn target_parent(target: &Path) -> PathBuf {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
