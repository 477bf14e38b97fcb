use thiserror::Error;

/// Error type for sync operations.
///
/// Every error raised while syncing one crawl target is caught at that
/// target's task boundary and surfaced as a rejected [`crate::sync::TargetOutcome`];
/// it never cancels sibling targets.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no adapter registered for source kind {kind} (target {target})")]
    UnknownAdapter { kind: String, target: String },

    /// `next()` was called on a drained cursor. This is a bug in the drain
    /// loop, not a recoverable source condition.
    #[error("cursor over {endpoint} is exhausted")]
    ExhaustedCursor { endpoint: String },

    #[error("source fetch failed for {url}")]
    Source {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("target {target} is not syncable: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("reconciliation failed")]
    Reconciliation(#[source] anyhow::Error),

    #[error("crawl target {crawl_target_id} not found (user {user_id:?})")]
    TargetNotFound {
        crawl_target_id: i32,
        user_id: Option<i32>,
    },

    #[error("storage error")]
    Storage(#[from] anyhow::Error),
}
