use crate::error::Result;
use crate::events::RuntimeEvent;
use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Persistence trait for all Workflow Execution Core state.
///
/// The Workflow FSM, Call Runner, and Cache-Hit Copy FSM operate exclusively
/// through this trait, enabling pluggable backends (`InMemoryDataAccess` for
/// tests, `PostgresDataAccess` for production). Implementations must provide
/// at-least transactional semantics for `set_status`, `set_outputs`,
/// `insert_calls`, and `update_workflow_state` — partial persistence of a
/// call completion is a correctness bug the FSM relies on not happening.
#[async_trait]
pub trait DataAccess: Send + Sync {
    // ── Workflow lifecycle ──

    async fn create_workflow(
        &self,
        descriptor: &WorkflowDescriptor,
        symbols: &[Symbol],
        calls: &[ExecutionKey],
    ) -> Result<()>;

    async fn get_execution_statuses(
        &self,
        workflow_id: Uuid,
    ) -> Result<BTreeMap<ExecutionKey, CallStatus>>;

    async fn set_status(
        &self,
        workflow_id: Uuid,
        keys: &[ExecutionKey],
        status: CallStatus,
    ) -> Result<()>;

    async fn set_outputs(
        &self,
        workflow_id: Uuid,
        key: &ExecutionKey,
        outputs: &CallOutputs,
    ) -> Result<()>;

    async fn insert_calls(&self, workflow_id: Uuid, keys: &[ExecutionKey]) -> Result<()>;

    async fn update_workflow_state(&self, workflow_id: Uuid, state: WorkflowState) -> Result<()>;

    async fn get_workflow_state(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>>;

    // ── Symbols ──

    async fn get_inputs(&self, workflow_id: Uuid, call: &Scope) -> Result<Vec<Symbol>>;

    async fn get_outputs(&self, workflow_id: Uuid, key: &ExecutionKey) -> Result<Vec<Symbol>>;

    async fn get_fully_qualified_name(
        &self,
        workflow_id: Uuid,
        fqn: &str,
    ) -> Result<Vec<Symbol>>;

    async fn put_symbol(&self, workflow_id: Uuid, symbol: Symbol) -> Result<()>;

    async fn update_workflow_options(
        &self,
        workflow_id: Uuid,
        options: WorkflowOptions,
    ) -> Result<()>;

    // ── Job paths (detritus) ──

    async fn get_job_paths(&self, workflow_id: Uuid, key: &ExecutionKey) -> Result<JobPaths>;

    async fn save_job_paths(
        &self,
        workflow_id: Uuid,
        key: &ExecutionKey,
        paths: &JobPaths,
    ) -> Result<()>;

    // ── Failure message ──

    async fn set_failure_message(&self, workflow_id: Uuid, message: &str) -> Result<()>;

    async fn get_failure_message(&self, workflow_id: Uuid) -> Result<Option<String>>;

    // ── Event log (append-only) ──

    async fn append_event(&self, workflow_id: Uuid, event: RuntimeEvent) -> Result<u64>;

    async fn read_events(
        &self,
        workflow_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;
}
