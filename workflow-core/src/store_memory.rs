use crate::error::{Result, WorkflowError};
use crate::events::RuntimeEvent;
use crate::store::DataAccess;
use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct WorkflowRecord {
    descriptor: WorkflowDescriptor,
    state: WorkflowState,
    statuses: BTreeMap<ExecutionKey, CallStatus>,
    outputs: BTreeMap<ExecutionKey, CallOutputs>,
    job_paths: BTreeMap<ExecutionKey, JobPaths>,
    symbols: Vec<Symbol>,
    failure_message: Option<String>,
    events: Vec<RuntimeEvent>,
}

struct Inner {
    workflows: BTreeMap<Uuid, WorkflowRecord>,
}

/// In-memory implementation of `DataAccess` for tests and the POC server
/// binary, mirroring the teacher's `MemoryStore`.
pub struct InMemoryDataAccess {
    inner: RwLock<Inner>,
}

impl InMemoryDataAccess {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                workflows: BTreeMap::new(),
            }),
        }
    }
}

impl Default for InMemoryDataAccess {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(workflow_id: Uuid) -> WorkflowError {
    WorkflowError::Persistence(format!("no workflow record for {workflow_id}"))
}

/// Materialize a call's persisted `CallOutputs` as `Symbol` rows, the shape
/// the Symbol Resolver reads regardless of whether a value came from a
/// fresh execution or a declaration.
fn symbols_from_call_outputs(key: &ExecutionKey, outputs: &CallOutputs) -> Vec<Symbol> {
    outputs
        .iter()
        .map(|(name, value)| Symbol {
            scope: key.scope().clone(),
            name: name.clone(),
            index: key.index(),
            is_input: false,
            wdl_type: value.type_name().to_string(),
            wdl_value: Some(value.clone()),
        })
        .collect()
}

#[async_trait]
impl DataAccess for InMemoryDataAccess {
    async fn create_workflow(
        &self,
        descriptor: &WorkflowDescriptor,
        symbols: &[Symbol],
        calls: &[ExecutionKey],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let statuses = calls
            .iter()
            .cloned()
            .map(|k| (k, CallStatus::new(ExecutionStatus::NotStarted)))
            .collect();
        inner.workflows.insert(
            descriptor.id,
            WorkflowRecord {
                descriptor: descriptor.clone(),
                state: WorkflowState::Submitted,
                statuses,
                outputs: BTreeMap::new(),
                job_paths: BTreeMap::new(),
                symbols: symbols.to_vec(),
                failure_message: None,
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_execution_statuses(
        &self,
        workflow_id: Uuid,
    ) -> Result<BTreeMap<ExecutionKey, CallStatus>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .get(&workflow_id)
            .map(|r| r.statuses.clone())
            .unwrap_or_default())
    }

    async fn set_status(
        &self,
        workflow_id: Uuid,
        keys: &[ExecutionKey],
        status: CallStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        for key in keys {
            record.statuses.insert(key.clone(), status.clone());
        }
        Ok(())
    }

    async fn set_outputs(
        &self,
        workflow_id: Uuid,
        key: &ExecutionKey,
        outputs: &CallOutputs,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.outputs.insert(key.clone(), outputs.clone());
        Ok(())
    }

    async fn insert_calls(&self, workflow_id: Uuid, keys: &[ExecutionKey]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        for key in keys {
            record
                .statuses
                .entry(key.clone())
                .or_insert_with(|| CallStatus::new(ExecutionStatus::NotStarted));
        }
        Ok(())
    }

    async fn update_workflow_state(&self, workflow_id: Uuid, state: WorkflowState) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.state = state;
        Ok(())
    }

    async fn get_workflow_state(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>> {
        let inner = self.inner.read().await;
        Ok(inner.workflows.get(&workflow_id).map(|r| r.state))
    }

    async fn get_inputs(&self, workflow_id: Uuid, call: &Scope) -> Result<Vec<Symbol>> {
        let inner = self.inner.read().await;
        let record = inner
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        Ok(record
            .symbols
            .iter()
            .filter(|s| s.is_input && &s.scope == call)
            .cloned()
            .collect())
    }

    async fn get_outputs(&self, workflow_id: Uuid, key: &ExecutionKey) -> Result<Vec<Symbol>> {
        let inner = self.inner.read().await;
        let record = inner
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        Ok(record
            .outputs
            .get(key)
            .map(|outputs| symbols_from_call_outputs(key, outputs))
            .unwrap_or_default())
    }

    async fn get_fully_qualified_name(
        &self,
        workflow_id: Uuid,
        fqn: &str,
    ) -> Result<Vec<Symbol>> {
        let inner = self.inner.read().await;
        let record = inner
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        Ok(record
            .symbols
            .iter()
            .filter(|s| s.scope.fully_qualified_name() == fqn)
            .cloned()
            .collect())
    }

    async fn put_symbol(&self, workflow_id: Uuid, symbol: Symbol) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.symbols.push(symbol);
        Ok(())
    }

    async fn update_workflow_options(
        &self,
        workflow_id: Uuid,
        options: WorkflowOptions,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.descriptor.workflow_options = options;
        Ok(())
    }

    async fn get_job_paths(&self, workflow_id: Uuid, key: &ExecutionKey) -> Result<JobPaths> {
        let inner = self.inner.read().await;
        let record = inner
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        Ok(record.job_paths.get(key).cloned().unwrap_or_default())
    }

    async fn save_job_paths(
        &self,
        workflow_id: Uuid,
        key: &ExecutionKey,
        paths: &JobPaths,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.job_paths.insert(key.clone(), paths.clone());
        Ok(())
    }

    async fn set_failure_message(&self, workflow_id: Uuid, message: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.failure_message = Some(message.to_string());
        Ok(())
    }

    async fn get_failure_message(&self, workflow_id: Uuid) -> Result<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .get(&workflow_id)
            .and_then(|r| r.failure_message.clone()))
    }

    async fn append_event(&self, workflow_id: Uuid, event: RuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        record.events.push(event);
        Ok(record.events.len() as u64 - 1)
    }

    async fn read_events(
        &self,
        workflow_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.inner.read().await;
        let record = inner
            .workflows
            .get(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        Ok(record
            .events
            .iter()
            .enumerate()
            .skip(from_seq as usize)
            .map(|(i, e)| (i as u64, e.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> WorkflowDescriptor {
        WorkflowDescriptor {
            id: Uuid::new_v4(),
            namespace: "wf".to_string(),
            workflow_options: WorkflowOptions::default(),
        }
    }

    #[tokio::test]
    async fn round_trips_status() {
        let store = InMemoryDataAccess::new();
        let d = descriptor();
        let key = ExecutionKey::Call {
            scope: Scope::new("wf.A"),
            index: None,
        };
        store.create_workflow(&d, &[], &[key.clone()]).await.unwrap();
        store
            .set_status(d.id, &[key.clone()], CallStatus::new(ExecutionStatus::Running))
            .await
            .unwrap();
        let statuses = store.get_execution_statuses(d.id).await.unwrap();
        assert_eq!(statuses[&key].status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn missing_workflow_errors() {
        let store = InMemoryDataAccess::new();
        let res = store.get_failure_message(Uuid::new_v4()).await;
        // read paths on a missing workflow are treated as "no data" for
        // statuses/events but failure_message/job_paths go through the
        // not_found path when called on mutation; read-only accessors here
        // return Ok(None)/empty rather than erroring so restart-time probes
        // don't need special-case handling.
        assert!(res.is_ok());
    }
}
