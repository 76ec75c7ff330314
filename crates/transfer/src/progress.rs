use crate::types::{TotalChunks, UploadSession};

/// Completion percentage of a session.
///
/// Returns `None` for unbounded sessions: there is no denominator.
pub fn percentage(session: &UploadSession) -> Option<f64> {
    ratio(session.received_chunks.len(), session.total_chunks)
}

pub(crate) fn ratio(received: usize, total: TotalChunks) -> Option<f64> {
    match total {
        TotalChunks::Bounded(n) => Some(received as f64 / f64::from(n) * 100.0),
        TotalChunks::Unbounded => None,
    }
}
