use thiserror::Error;

/// Category of a `BlacklistSkip` — why a cache-hit copy attempt was skipped
/// by policy rather than attempted and failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlacklistSkipReason {
    HitBlacklisted,
    BucketBlacklisted,
}

impl std::fmt::Display for BlacklistSkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlacklistSkipReason::HitBlacklisted => write!(f, "cache hit is blacklisted"),
            BlacklistSkipReason::BucketBlacklisted => write!(f, "source bucket is blacklisted"),
        }
    }
}

/// Crate-wide error taxonomy. Variants map directly onto the error kinds a
/// Call Runner or Cache-Hit Copy FSM converts into a typed failure message
/// before it ever crosses an entity boundary — nothing here unwinds across
/// a `tokio::spawn`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("expression error: unresolved identifier `{identifier}` in scope `{scope}`")]
    UnresolvedIdentifier { scope: String, identifier: String },

    #[error("expression error: expected {expected} but found {found} evaluating `{context}`")]
    TypeMismatch {
        expected: String,
        found: String,
        context: String,
    },

    #[error("expression error: {0}")]
    Expression(String),

    /// Per-attempt cache-hit copy failure. Loggable; the workflow may retry
    /// with a different cache hit.
    #[error("cache-hit copy attempt failed: {0}")]
    CopyAttempt(String),

    /// Cache-hit copy skipped by policy. Not loggable as an error — expected
    /// steady-state behavior once a source has been blacklisted.
    #[error("cache-hit copy skipped: {0}")]
    BlacklistSkip(BlacklistSkipReason),

    #[error("cache-hit copy timed out waiting on {src} -> {dst}")]
    Timeout { src: String, dst: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("missing required detritus key `{0}`")]
    MissingDetritusKey(String),

    #[error("collector `{scope}` missing output `{output}` from shard {index}")]
    CollectorMissingShardOutput {
        scope: String,
        output: String,
        index: i64,
    },

    #[error("scatter `{0}` did not evaluate to an Array")]
    ScatterCollectionNotArray(String),

    #[error("restart requires operator intervention: scatter `{0}` observed in Starting state")]
    ScatterRestartAmbiguous(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for WorkflowError {
    fn from(e: sqlx::Error) -> Self {
        WorkflowError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
