//! Progress view of a request, as served to polling clients.

use serde::Serialize;

use super::request::{RequestId, RequestStatus};

/// "How many of N providers have completed for this request".
///
/// `total` is the snapshot size captured at fan-out time (0 before fan-out
/// and when no providers were enabled); `completed` counts persisted results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    /// Whether the client can stop polling.
    pub fn is_done(&self) -> bool {
        self.status.is_terminal() && self.completed == self.total
    }
}
