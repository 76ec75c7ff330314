//! Async front for [`UploadManager`].
//!
//! Every operation touches the disk, so each call runs on tokio's blocking
//! pool and the runtime's worker threads never wait on file I/O.

use std::path::PathBuf;
use std::sync::Arc;

use crate::manager::UploadManager;
use crate::recovery::RecoveryReport;
use crate::types::{FinalizedUpload, TotalChunks, UploadSessionMetadata};
use crate::UploadError;

/// Cloneable async handle over a shared [`UploadManager`].
#[derive(Clone)]
pub struct UploadService {
    manager: Arc<UploadManager>,
}

impl UploadService {
    pub fn new(manager: Arc<UploadManager>) -> Self {
        Self { manager }
    }

    /// The underlying synchronous manager.
    pub fn manager(&self) -> &Arc<UploadManager> {
        &self.manager
    }

    async fn run<T, F>(&self, op: F) -> Result<T, UploadError>
    where
        T: Send + 'static,
        F: FnOnce(&UploadManager) -> Result<T, UploadError> + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || op(&manager))
            .await
            .map_err(|e| UploadError::Task(e.to_string()))?
    }

    pub async fn start_session(
        &self,
        id: String,
        total_chunks: TotalChunks,
        original_name: String,
        target_path: PathBuf,
        visibility: String,
    ) -> Result<(), UploadError> {
        self.run(move |m| {
            m.start_session(&id, total_chunks, &original_name, target_path, &visibility)
        })
        .await
    }

    pub async fn receive_chunk(
        &self,
        id: String,
        index: i64,
        data: Vec<u8>,
    ) -> Result<(), UploadError> {
        self.run(move |m| m.receive_chunk(&id, index, &data)).await
    }

    pub async fn receive_chunk_verified(
        &self,
        id: String,
        index: i64,
        data: Vec<u8>,
        checksum: String,
    ) -> Result<(), UploadError> {
        self.run(move |m| m.receive_chunk_verified(&id, index, &data, &checksum))
            .await
    }

    pub async fn finalize(&self, id: String) -> Result<FinalizedUpload, UploadError> {
        self.run(move |m| m.finalize(&id)).await
    }

    pub async fn abort_session(&self, id: String) -> Result<bool, UploadError> {
        self.run(move |m| m.abort_session(&id)).await
    }

    /// Waits on the session's state lock, which a chunk write holds across
    /// its record fsync, so this also runs on the blocking pool.
    pub async fn progress(&self, id: String) -> Result<Option<f64>, UploadError> {
        self.run(move |m| Ok(m.progress(&id))).await
    }

    pub async fn session(&self, id: String) -> Result<UploadSessionMetadata, UploadError> {
        self.run(move |m| m.session(&id)).await
    }

    pub async fn load_sessions_from_disk(&self) -> Result<RecoveryReport, UploadError> {
        self.run(|m| m.load_sessions_from_disk()).await
    }

    pub async fn start_upload(
        &self,
        id: String,
        total_chunks: TotalChunks,
        original_name: String,
        visibility: String,
    ) -> Result<PathBuf, UploadError> {
        self.run(move |m| m.start_upload(&id, total_chunks, &original_name, &visibility))
            .await
    }

    pub async fn append_chunk(
        &self,
        id: String,
        index: i64,
        data: Vec<u8>,
    ) -> Result<(), UploadError> {
        self.receive_chunk(id, index, data).await
    }

    pub async fn complete_upload(&self, id: String) -> Result<FinalizedUpload, UploadError> {
        self.finalize(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> UploadService {
        UploadService::new(Arc::new(UploadManager::new(TransferConfig::in_dir(
            dir.path(),
        ))))
    }

    #[tokio::test]
    async fn three_call_form() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);

        let target = svc
            .start_upload("u1".into(), TotalChunks::Bounded(3), "f.txt".into(), "public".into())
            .await
            .unwrap();
        svc.append_chunk("u1".into(), 1, b"World".to_vec()).await.unwrap();
        svc.append_chunk("u1".into(), 0, b"Hello ".to_vec()).await.unwrap();
        assert_eq!(
            svc.progress("u1".into()).await.unwrap().map(f64::round),
            Some(67.0)
        );
        svc.append_chunk("u1".into(), 2, b"!".to_vec()).await.unwrap();

        svc.complete_upload("u1".into()).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"Hello World!");
        assert!(matches!(
            svc.session("u1".into()).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn parallel_tasks_same_session() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let target = dir.path().join("out.bin");
        svc.start_session(
            "p".into(),
            TotalChunks::Bounded(16),
            "out.bin".into(),
            target.clone(),
            "private".into(),
        )
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for i in (0..16i64).rev() {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                svc.receive_chunk("p".into(), i, vec![b'a' + i as u8]).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let done = svc.finalize("p".into()).await.unwrap();
        assert_eq!(done.bytes_written, 16);
        assert_eq!(
            tokio::fs::read(&target).await.unwrap(),
            b"abcdefghijklmnop".to_vec()
        );
    }

    #[tokio::test]
    async fn abort_then_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        svc.start_session(
            "a".into(),
            TotalChunks::Unbounded,
            "a".into(),
            dir.path().join("a"),
            "public".into(),
        )
        .await
        .unwrap();
        svc.receive_chunk("a".into(), 0, b"x".to_vec()).await.unwrap();

        assert!(svc.abort_session("a".into()).await.unwrap());
        assert_eq!(svc.progress("a".into()).await.unwrap(), Some(0.0));
        assert!(matches!(
            svc.finalize("a".into()).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn recovery_through_service() {
        let dir = TempDir::new().unwrap();
        {
            let svc = service(&dir);
            svc.start_session(
                "r".into(),
                TotalChunks::Bounded(2),
                "r".into(),
                dir.path().join("r.out"),
                "public".into(),
            )
            .await
            .unwrap();
            svc.receive_chunk("r".into(), 1, b"2".to_vec()).await.unwrap();
        }

        let svc = service(&dir);
        let report = svc.load_sessions_from_disk().await.unwrap();
        assert_eq!(report.loaded, vec!["r".to_string()]);
        assert_eq!(svc.progress("r".into()).await.unwrap(), Some(50.0));
    }

    #[tokio::test]
    async fn polling_a_busy_session_does_not_stall_the_runtime() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        svc.start_session(
            "busy".into(),
            TotalChunks::Bounded(4),
            "busy".into(),
            dir.path().join("busy.out"),
            "public".into(),
        )
        .await
        .unwrap();

        // Stands in for a chunk write holding the state lock through an fsync.
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let manager = Arc::clone(svc.manager());
        let holder = std::thread::spawn(move || {
            manager.with_state_locked("busy", || {
                let _ = locked_tx.send(());
                std::thread::sleep(Duration::from_millis(300));
            })
        });
        locked_rx.await.unwrap();

        let poll = tokio::spawn({
            let svc = svc.clone();
            async move { svc.progress("busy".into()).await }
        });
        // Single-threaded runtime: this timer only fires if the poll yielded.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!poll.is_finished());

        assert_eq!(poll.await.unwrap().unwrap(), Some(0.0));
        assert_eq!(
            svc.session("busy".into()).await.unwrap().received_chunks,
            Vec::<u32>::new()
        );
        holder.join().unwrap();
    }
}
