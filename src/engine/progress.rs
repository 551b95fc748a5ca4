//! Read path for polling clients.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::progress::Progress;
use crate::domain::request::RequestId;
use crate::domain::result::ProviderResult;
use crate::error::Result;
use crate::manager::Storage;

/// Answers "how many of N providers have completed for this request" from
/// persisted state. Never mutates anything, so it is safe to poll at any rate.
pub struct ProgressReporter<S> {
    storage: Arc<S>,
}

impl<S> Clone for ProgressReporter<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S: Storage> ProgressReporter<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn get_progress(&self, request_id: RequestId) -> Result<Progress> {
        let progress = self.storage.get_progress(request_id).await?;
        tracing::trace!(
            status = %progress.status,
            completed = progress.completed,
            total = progress.total,
            "Progress read"
        );
        Ok(progress)
    }

    /// Provider results persisted so far; partial while the request is in progress.
    pub async fn get_results(&self, request_id: RequestId) -> Result<Vec<ProviderResult>> {
        self.storage.get_results(request_id).await
    }

    /// Poll until the request is done, the way a client would.
    pub async fn wait_until_done(
        &self,
        request_id: RequestId,
        poll_interval: Duration,
    ) -> Result<Progress> {
        loop {
            let progress = self.get_progress(request_id).await?;
            if progress.is_done() {
                return Ok(progress);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
