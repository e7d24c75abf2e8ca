use crate::types::*;
use serde::{Deserialize, Serialize};

/// Durable, append-only audit trail for a workflow. Every status transition,
/// scatter expansion, and blacklist write is recorded here; the scheduler
/// never reads it back to make decisions — it exists for `inspect()` and for
/// tests that want to assert the shape of a run without re-deriving it from
/// the execution store snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    WorkflowStateChanged {
        from: WorkflowState,
        to: WorkflowState,
    },
    CallStarted {
        key: ExecutionKey,
    },
    CallCompleted {
        key: ExecutionKey,
        return_code: i32,
    },
    CallFailed {
        key: ExecutionKey,
        return_code: Option<i32>,
        message: String,
    },
    CallAborted {
        key: ExecutionKey,
    },
    ScatterExpanded {
        key: ExecutionKey,
        shard_count: usize,
    },
    CollectorCompleted {
        key: ExecutionKey,
        shard_count: usize,
    },
    CacheCopyStarted {
        key: ExecutionKey,
        cache_hit: CacheHitId,
    },
    CacheCopySkipped {
        key: ExecutionKey,
        reason: String,
    },
    CacheCopySucceeded {
        key: ExecutionKey,
    },
    CacheCopyFailed {
        key: ExecutionKey,
        message: String,
    },
    BlacklistUpdated {
        target: String,
        status: BlacklistStatus,
    },
}

/// Emitted by the Cache-Hit Copy FSM to its parent on success. Carries the
/// synthesized outputs/detritus so the parent can persist them exactly as it
/// would for a freshly executed call.
#[derive(Clone, Debug)]
pub struct JobSucceededResponse {
    pub key: ExecutionKey,
    pub outputs: CallOutputs,
    pub detritus: std::collections::BTreeMap<String, String>,
    pub return_code: i32,
    pub result_generation_mode: ResultGenerationMode,
}

/// Emitted by the Cache-Hit Copy FSM to its parent on failure (either a
/// blacklist skip or a genuine I/O failure). `attempt` lets the parent decide
/// whether to retry with a different cache hit.
#[derive(Clone, Debug)]
pub struct CopyingOutputsFailedResponse {
    pub key: ExecutionKey,
    pub attempt: u32,
    pub failure: String,
}

/// Emitted immediately by the Cache-Hit Copy FSM in response to an abort
/// request — it does not support mid-flight cancellation.
#[derive(Clone, Debug)]
pub struct JobAbortedResponse {
    pub key: ExecutionKey,
}

/// One row of the durable event log as seen by readers.
#[derive(Clone, Debug)]
pub struct LoggedEvent {
    pub seq: u64,
    pub event: RuntimeEvent,
}
