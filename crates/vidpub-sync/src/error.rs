use thiserror::Error;
use vidpub_api::ApiError;

/// Failure to map or upsert a single upstream record. Counted, never fatal to a run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Video ID is required")]
    MissingId,
    #[error("{0:#}")]
    Repository(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// A page could not be fetched; pages already processed keep their upserts.
    #[error("{source}")]
    Page { page: u64, source: ApiError },
    #[error("{0}")]
    RemoteTrigger(#[source] ApiError),
    #[error("{0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("Sync timed out after {0} seconds")]
    TimedOut(u64),
}

impl SyncError {
    /// True when the upstream API, not local storage, caused the failure.
    pub fn is_upstream(&self) -> bool {
        matches!(self, SyncError::Page { .. } | SyncError::RemoteTrigger(_))
    }
}
