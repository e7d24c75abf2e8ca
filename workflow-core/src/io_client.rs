use crate::types::IoCommand;
use async_trait::async_trait;

/// Response to a dispatched `IoCommand`.
#[derive(Clone, Debug)]
pub enum IoResponse {
    Success { command: IoCommand },
    /// Specialization of failure carrying the forbidden path, so the
    /// Cache-Hit Copy FSM can blacklist both the hit and its bucket.
    ReadForbidden { command: IoCommand, path: String },
    Failure { command: IoCommand, error: String },
}

/// The external I/O broker — out of scope for this crate's implementation.
/// `send` is asynchronous; the caller awaits the matching `IoResponse`. A
/// real broker fans this out to an actor/service that performs the actual
/// filesystem or object-storage operation.
#[async_trait]
pub trait IoClient: Send + Sync {
    async fn send(&self, command: IoCommand) -> IoResponse;
}
