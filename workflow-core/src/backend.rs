use crate::error::Result;
use crate::types::{CallOutputs, ExecutionKey, WorkflowDescriptor};
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque handle a backend uses to resume a previously started job across a
/// crash. The engine never inspects its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobKey(pub String);

/// Resolved, locally-qualified input values for one call.
pub type CallInputs = BTreeMap<String, crate::types::Value>;

/// Outcome of a backend execution or resume attempt.
#[derive(Clone, Debug)]
pub enum CallOutcome {
    Success { outputs: CallOutputs, return_code: i32 },
    Failure { return_code: Option<i32>, message: String },
}

/// Backend capability set — out of scope for this crate's implementation
/// (consumed as a trait object). A production backend would drive a local
/// process, a container scheduler, or a cloud batch API.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn initialize_for_workflow(&self, workflow: &WorkflowDescriptor) -> Result<()>;

    async fn prepare_for_restart(&self, workflow: &WorkflowDescriptor) -> Result<()>;

    /// Map of resumable database keys to their backend job handle, for every
    /// call this backend believes is still in flight for `workflow_id`.
    async fn find_resumable_executions(
        &self,
        workflow_id: Uuid,
    ) -> Result<BTreeMap<ExecutionKey, JobKey>>;

    async fn execute(
        &self,
        key: &ExecutionKey,
        inputs: &CallInputs,
        workflow: &WorkflowDescriptor,
    ) -> Result<CallOutcome>;

    async fn resume(
        &self,
        key: &ExecutionKey,
        inputs: &CallInputs,
        job_key: &JobKey,
        workflow: &WorkflowDescriptor,
    ) -> Result<CallOutcome>;

    async fn clean_up_for_workflow(&self, workflow: &WorkflowDescriptor) -> Result<()>;
}
