//! Session table and the public upload operations.
//!
//! Locking: the session map is only held to look up, insert or remove a
//! slot, never across I/O and never while waiting on a slot's locks. Each
//! slot has a gate (`RwLock<bool>`, `true` once retired) and a state mutex.
//! Chunk writes hold the gate shared, so distinct indices hit the disk in
//! parallel, and take the state mutex only for the received-set update and
//! metadata persist. Finalize and abort hold the gate exclusively.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::chunked::{assemble, checksum_bytes, list_chunk_indices, write_chunk_file};
use crate::config::TransferConfig;
use crate::recovery::{RecoveryReport, clean_session_dir, load_record, session_dirs};
use crate::store::{
    create_session_dir, metadata_path, persist_metadata, remove_session_dir, session_dir,
};
use crate::types::{FinalizedUpload, TotalChunks, UploadSession, UploadSessionMetadata};
use crate::validation::{validate_session_id, validate_upload_path};
use crate::UploadError;

struct SessionSlot {
    dir: PathBuf,
    gate: RwLock<bool>,
    state: Mutex<UploadSession>,
}

impl SessionSlot {
    fn new(dir: PathBuf, session: UploadSession) -> Self {
        Self {
            dir,
            gate: RwLock::new(false),
            state: Mutex::new(session),
        }
    }
}

/// Owns the sessions under one scratch root.
///
/// A single process must own a scratch root; nothing here coordinates with
/// other processes touching the same directories.
pub struct UploadManager {
    config: TransferConfig,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl UploadManager {
    /// Creates a manager with an empty session table.
    ///
    /// Sessions already on disk are not visible until
    /// [`load_sessions_from_disk`](Self::load_sessions_from_disk) runs.
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the scratch root if needed and recovers persisted sessions.
    pub fn open(config: TransferConfig) -> Result<(Self, RecoveryReport), UploadError> {
        std::fs::create_dir_all(&config.scratch_root)?;
        let manager = Self::new(config);
        let report = manager.load_sessions_from_disk()?;
        Ok((manager, report))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn scratch_root(&self) -> &Path {
        &self.config.scratch_root
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Registers a new session and persists its (empty) record.
    ///
    /// Fails with [`UploadError::DuplicateSession`] when the id is already
    /// in use, in memory or on disk.
    pub fn start_session(
        &self,
        id: &str,
        total_chunks: TotalChunks,
        original_name: &str,
        target_path: impl Into<PathBuf>,
        visibility: &str,
    ) -> Result<(), UploadError> {
        validate_session_id(id)?;
        if let TotalChunks::Bounded(n) = total_chunks {
            TotalChunks::bounded(n)?;
        }
        if read(&self.sessions).contains_key(id) {
            return Err(UploadError::DuplicateSession(id.to_string()));
        }

        let dir = create_session_dir(self.scratch_root(), id)?;
        let session = UploadSession::new(
            id.to_string(),
            total_chunks,
            original_name.to_string(),
            target_path.into(),
            visibility.to_string(),
        );
        if let Err(e) = persist_metadata(&dir, &session, self.config.sync_writes) {
            let _ = remove_session_dir(&dir);
            return Err(e);
        }

        let target = session.target_path.clone();
        write(&self.sessions)
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SessionSlot::new(dir, session)));

        info!(
            session_id = %id,
            total = %total_chunks,
            target = %target.display(),
            "upload session created"
        );
        Ok(())
    }

    /// Stores one chunk and records it as received.
    ///
    /// The chunk bytes are durable before the received-set is updated, so a
    /// crash can lose an acknowledgement but never claim missing bytes.
    /// Re-sending an index replaces its bytes. On failure the received-set
    /// is unchanged.
    pub fn receive_chunk(&self, id: &str, index: i64, data: &[u8]) -> Result<(), UploadError> {
        let slot = self.slot(id)?;
        let gate = read(&slot.gate);
        if *gate {
            return Err(UploadError::SessionNotFound(id.to_string()));
        }

        let total = lock(&slot.state).total_chunks;
        let index = checked_index(index, total)?;

        write_chunk_file(&slot.dir, index, data, self.config.sync_writes)?;

        let mut session = lock(&slot.state);
        let inserted = session.received_chunks.insert(index);
        let previous_update = session.updated_at;
        session.updated_at = Utc::now();
        if let Err(e) = persist_metadata(&slot.dir, &session, self.config.sync_writes) {
            if inserted {
                session.received_chunks.remove(&index);
            }
            session.updated_at = previous_update;
            return Err(e);
        }

        debug!(
            session_id = %id,
            index,
            bytes = data.len(),
            received = session.received_count(),
            total = %total,
            "chunk stored"
        );
        Ok(())
    }

    /// Like [`receive_chunk`](Self::receive_chunk), but first checks `data`
    /// against a SHA-256 hex digest. A mismatch writes nothing.
    pub fn receive_chunk_verified(
        &self,
        id: &str,
        index: i64,
        data: &[u8],
        checksum: &str,
    ) -> Result<(), UploadError> {
        let actual = checksum_bytes(data);
        if !actual.eq_ignore_ascii_case(checksum) {
            let total = self.session(id)?.total_chunks;
            let index = checked_index(index, total)?;
            warn!(session_id = %id, index, "chunk checksum mismatch");
            return Err(UploadError::ChecksumMismatch { index });
        }
        self.receive_chunk(id, index, data)
    }

    /// Assembles the chunks into the target file and retires the session.
    ///
    /// Bounded sessions must have every index `0..n`. Unbounded sessions
    /// assemble whatever chunk files the session directory holds, in
    /// ascending order; gaps are not detected beyond a warning. If any step
    /// fails the session and its chunks stay in place and finalize can be
    /// retried.
    pub fn finalize(&self, id: &str) -> Result<FinalizedUpload, UploadError> {
        let slot = self.slot(id)?;
        let mut retired = write(&slot.gate);
        if *retired {
            return Err(UploadError::SessionNotFound(id.to_string()));
        }

        let session = lock(&slot.state).clone();
        let indices = match session.total_chunks {
            TotalChunks::Bounded(n) => {
                if !session.is_complete() {
                    return Err(UploadError::IncompleteUpload {
                        expected: n,
                        received: session.received_count(),
                    });
                }
                session.sorted_chunks()
            }
            TotalChunks::Unbounded => {
                let indices = list_chunk_indices(&slot.dir)?;
                if indices.is_empty() {
                    return Err(UploadError::EmptyUpload(id.to_string()));
                }
                if indices.iter().enumerate().any(|(pos, &i)| pos as u32 != i) {
                    warn!(
                        session_id = %id,
                        chunks = indices.len(),
                        last = indices[indices.len() - 1],
                        "unbounded upload has gaps in chunk indices"
                    );
                }
                indices
            }
        };

        let assembly = assemble(
            &slot.dir,
            &indices,
            &session.target_path,
            self.config.sync_writes,
        )?;

        *retired = true;
        if let Err(e) = remove_session_dir(&slot.dir) {
            warn!(
                session_id = %id,
                dir = %slot.dir.display(),
                error = %e,
                "failed to remove scratch directory of finalized session"
            );
        }
        self.remove_slot(id, &slot);

        info!(
            session_id = %id,
            chunks = indices.len(),
            bytes = assembly.bytes_written,
            target = %session.target_path.display(),
            "upload finalized"
        );

        Ok(FinalizedUpload {
            id: session.id,
            target_path: session.target_path,
            visibility: session.visibility,
            chunk_count: indices.len() as u32,
            bytes_written: assembly.bytes_written,
            checksum: assembly.checksum,
        })
    }

    /// Discards a session and its scratch directory.
    ///
    /// Idempotent: returns `false` when nothing was there to remove. A
    /// directory left on disk for an id not loaded in memory is removed too.
    pub fn abort_session(&self, id: &str) -> Result<bool, UploadError> {
        validate_session_id(id)?;
        let dir = session_dir(self.scratch_root(), id);

        let slot = read(&self.sessions).get(id).cloned();
        let Some(slot) = slot else {
            let existed = dir.exists();
            remove_session_dir(&dir)?;
            if existed {
                info!(session_id = %id, "removed unloaded session directory");
            }
            return Ok(existed);
        };

        let mut retired = write(&slot.gate);
        if *retired {
            return Ok(false);
        }
        remove_session_dir(&slot.dir)?;
        *retired = true;
        self.remove_slot(id, &slot);

        info!(session_id = %id, "upload session aborted");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Read-only queries
    // -----------------------------------------------------------------------

    /// Completion percentage for polling.
    ///
    /// Unknown ids report `Some(0.0)`. Unbounded sessions report `None`
    /// since they have no expected total.
    pub fn progress(&self, id: &str) -> Option<f64> {
        let Some(slot) = read(&self.sessions).get(id).cloned() else {
            return Some(0.0);
        };
        let session = lock(&slot.state);
        crate::progress::percentage(&session)
    }

    /// Snapshot of a session's current record.
    pub fn session(&self, id: &str) -> Result<UploadSessionMetadata, UploadError> {
        let slot = self.slot(id)?;
        let session = lock(&slot.state);
        Ok(session.to_metadata())
    }

    /// Snapshots of every live session, ordered by id.
    pub fn list_sessions(&self) -> Vec<UploadSessionMetadata> {
        let slots: Vec<Arc<SessionSlot>> = read(&self.sessions).values().cloned().collect();
        let mut sessions: Vec<UploadSessionMetadata> = slots
            .iter()
            .map(|slot| lock(&slot.state).to_metadata())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Ids of sessions with no accepted mutation for longer than `max_idle`.
    ///
    /// Intended for an external reaper, which decides whether to call
    /// [`abort_session`](Self::abort_session). An idle time reaching past
    /// the representable date range selects nothing.
    pub fn stale_sessions(&self, max_idle: chrono::Duration) -> Vec<String> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_idle) else {
            return Vec::new();
        };
        self.list_sessions()
            .into_iter()
            .filter(|meta| meta.updated_at.is_some_and(|at| at < cutoff))
            .map(|meta| meta.id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Rebuilds the session table from the scratch root.
    ///
    /// Safe to call at any time. A session already in memory is replaced by
    /// its persisted record; disk is authoritative, so a loaded session
    /// whose record has vanished from disk is retired and reported in
    /// [`RecoveryReport::dropped`].
    pub fn load_sessions_from_disk(&self) -> Result<RecoveryReport, UploadError> {
        let mut report = RecoveryReport::default();
        let mut seen = HashSet::new();

        for (id, dir) in session_dirs(self.scratch_root(), &mut report)? {
            seen.insert(id.clone());
            let existing = read(&self.sessions).get(&id).cloned();
            if let Some(slot) = existing {
                // Exclusive gate: no chunk write is in flight while the
                // record is re-read and temp files are swept.
                let mut retired = write(&slot.gate);
                if *retired {
                    continue;
                }
                clean_session_dir(&slot.dir, &mut report);
                match load_record(&id, &slot.dir) {
                    Ok(meta) => {
                        *lock(&slot.state) = UploadSession::from(meta);
                        report.loaded.push(id);
                    }
                    Err(_) if !metadata_path(&slot.dir).exists() => {
                        *retired = true;
                        self.drop_vanished(&id, &slot, &mut report);
                    }
                    Err(reason) => report.skipped.push((dir, reason)),
                }
                continue;
            }

            // Not in memory, so nothing writes to this directory.
            let meta = match load_record(&id, &dir) {
                Ok(meta) => meta,
                Err(reason) => {
                    report.skipped.push((dir, reason));
                    continue;
                }
            };
            clean_session_dir(&dir, &mut report);

            let mut sessions = write(&self.sessions);
            // The directory is gone if a finalize or abort won the race.
            if !metadata_path(&dir).exists() {
                continue;
            }
            let session = UploadSession::from(meta);
            sessions
                .entry(id.clone())
                .or_insert_with(|| Arc::new(SessionSlot::new(dir, session)));
            report.loaded.push(id);
        }

        let unseen: Vec<(String, Arc<SessionSlot>)> = read(&self.sessions)
            .iter()
            .filter(|(id, _)| !seen.contains(id.as_str()))
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        for (id, slot) in unseen {
            let mut retired = write(&slot.gate);
            // A session started after the scan has its record already.
            if *retired || metadata_path(&slot.dir).exists() {
                continue;
            }
            *retired = true;
            self.drop_vanished(&id, &slot, &mut report);
        }

        report.loaded.sort();
        report.dropped.sort();
        info!(
            root = %self.scratch_root().display(),
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            dropped = report.dropped.len(),
            "recovered upload sessions"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Three-call convenience form
    // -----------------------------------------------------------------------

    /// Starts a session whose target is `<default_target_dir>/<original_name>`.
    ///
    /// Returns the derived target path.
    pub fn start_upload(
        &self,
        id: &str,
        total_chunks: TotalChunks,
        original_name: &str,
        visibility: &str,
    ) -> Result<PathBuf, UploadError> {
        validate_upload_path(original_name)?;
        let target = self.config.default_target_dir.join(original_name);
        self.start_session(id, total_chunks, original_name, target.clone(), visibility)?;
        Ok(target)
    }

    /// Same as [`receive_chunk`](Self::receive_chunk).
    pub fn append_chunk(&self, id: &str, index: i64, data: &[u8]) -> Result<(), UploadError> {
        self.receive_chunk(id, index, data)
    }

    /// Same as [`finalize`](Self::finalize).
    pub fn complete_upload(&self, id: &str) -> Result<FinalizedUpload, UploadError> {
        self.finalize(id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, id: &str) -> Result<Arc<SessionSlot>, UploadError> {
        read(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Forgets a retired slot whose record is gone from disk.
    fn drop_vanished(&self, id: &str, slot: &Arc<SessionSlot>, report: &mut RecoveryReport) {
        warn!(
            session_id = %id,
            dir = %slot.dir.display(),
            "session record vanished from disk, dropping session"
        );
        self.remove_slot(id, slot);
        report.dropped.push(id.to_string());
    }

    fn remove_slot(&self, id: &str, slot: &Arc<SessionSlot>) {
        let mut sessions = write(&self.sessions);
        if sessions.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            sessions.remove(id);
        }
    }
}

#[cfg(test)]
impl UploadManager {
    /// Runs `f` while holding the session's state lock.
    pub(crate) fn with_state_locked<R>(&self, id: &str, f: impl FnOnce() -> R) -> R {
        let slot = self.slot(id).unwrap();
        let _state = lock(&slot.state);
        f()
    }
}

/// Converts a caller index into a chunk index valid for `total`.
fn checked_index(index: i64, total: TotalChunks) -> Result<u32, UploadError> {
    u32::try_from(index)
        .ok()
        .filter(|&i| total.admits(i))
        .ok_or(UploadError::InvalidChunkIndex { index, total })
}

// A panic while holding a lock leaves plain data behind; the on-disk record
// stays the source of truth, so poisoning is ignored.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
