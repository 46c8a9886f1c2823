use dealsync_core::{Cursor, MappingError, ProjectionError};
use dealsync_storage::SelectError;
use thiserror::Error;

fn describe_cursor(cursor: &Option<Cursor>) -> String {
    cursor
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(
        "stream `{stream}` aborted after {attempts} failed fetch attempts; \
         last committed cursor {last_cursor}: {last_error}"
    )]
    Aborted {
        stream: String,
        attempts: u32,
        last_cursor: Cursor,
        last_error: SelectError,
    },
    #[error("stream `{stream}` cancelled; last committed cursor {}", describe_cursor(.last_cursor))]
    Cancelled {
        stream: String,
        last_cursor: Option<Cursor>,
    },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("checkpoint store failed for stream `{stream}`: {error:#}")]
    Checkpoint { stream: String, error: anyhow::Error },
    #[error("store write failed ({context}): {error:#}")]
    Store { context: String, error: anyhow::Error },
    #[error(transparent)]
    Fetch(#[from] SelectError),
}

impl SyncError {
    /// True when the run stopped because its cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled { .. } | SyncError::Fetch(SelectError::Cancelled)
        )
    }
}
