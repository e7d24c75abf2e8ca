use crate::backend::{Backend, JobKey};
use crate::call_runner::{CallRunner, CallRunnerOutcome};
use crate::collector::{Collector, CollectorOutcome};
use crate::error::WorkflowError;
use crate::events::RuntimeEvent;
use crate::graph::WorkflowGraph;
use crate::resolver::DependencyResolver;
use crate::scatter::ScatterExpander;
use crate::store::DataAccess;
use crate::types::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// How the workflow actor reached `Submitted` — determines whether restart
/// recovery runs before the first runnable scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMode {
    Start,
    Restart,
}

/// Messages driving the Workflow FSM, one per §4.6 transition table row.
pub enum WorkflowMsg {
    ExecutionStoreCreated(InitMode),
    CallStarted(ExecutionKey),
    CallCompleted { key: ExecutionKey, outputs: CallOutputs, return_code: i32 },
    CallFailed { key: ExecutionKey, return_code: Option<i32>, message: String },
    ScatterCompleted { key: ExecutionKey, shard_keys: Vec<ExecutionKey> },
    AbortWorkflow,
    AbortComplete(ExecutionKey),
    GetFailureMessage(oneshot::Sender<Option<String>>),
    Terminate,
}

/// Handle for sending messages into a running Workflow FSM actor.
#[derive(Clone)]
pub struct WorkflowHandle {
    pub workflow_id: Uuid,
    pub sender: mpsc::Sender<WorkflowMsg>,
}

impl WorkflowHandle {
    pub async fn send(&self, msg: WorkflowMsg) {
        if self.sender.send(msg).await.is_err() {
            warn!(workflow_id = %self.workflow_id, "workflow actor no longer listening");
        }
    }
}

/// Per-call output-name table, sourced from the graph, needed by C5 to know
/// which output names to assemble for a collector target.
type DeclaredOutputs = BTreeMap<Scope, Vec<String>>;

/// Per-workflow lifecycle owner. Holds the single in-memory `ExecutionStore`
/// (§4.1) and exclusively mutates it from this actor's own task — spawned
/// Call Runners, Scatter Expanders, and Cache-Hit Copy FSMs only ever report
/// back through `WorkflowMsg`.
pub struct WorkflowFsm {
    graph: Arc<dyn WorkflowGraph>,
    store: Arc<dyn DataAccess>,
    backend: Arc<dyn Backend>,
    descriptor: WorkflowDescriptor,
    declared_outputs: DeclaredOutputs,
    state: WorkflowState,
    statuses: BTreeMap<ExecutionKey, CallStatus>,
    tx: mpsc::Sender<WorkflowMsg>,
}

impl WorkflowFsm {
    /// Spawn the actor task and return a handle to it. `declared_outputs`
    /// maps every collector target scope to its underlying task's output
    /// names — normally derived once from the graph at submission time.
    pub fn spawn(
        graph: Arc<dyn WorkflowGraph>,
        store: Arc<dyn DataAccess>,
        backend: Arc<dyn Backend>,
        descriptor: WorkflowDescriptor,
        declared_outputs: DeclaredOutputs,
        init: InitMode,
    ) -> WorkflowHandle {
        let (tx, rx) = mpsc::channel(256);
        let handle = WorkflowHandle { workflow_id: descriptor.id, sender: tx.clone() };
        let fsm = WorkflowFsm {
            graph,
            store,
            backend,
            descriptor,
            declared_outputs,
            state: WorkflowState::Submitted,
            statuses: BTreeMap::new(),
            tx,
        };
        tokio::spawn(fsm.run(rx, init));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkflowMsg>, init: InitMode) {
        if let Err(e) = self.initialize(init).await {
            warn!(workflow_id = %self.descriptor.id, error = %e, "workflow initialization failed");
            return;
        }

        while let Some(msg) = rx.recv().await {
            let should_stop = self.handle(msg).await;
            if should_stop {
                break;
            }
        }
    }

    /// `Start`/`Restart` handling: load the execution store, run restart
    /// rollback if needed, then self-send `ExecutionStoreCreated`.
    async fn initialize(&mut self, init: InitMode) -> crate::error::Result<()> {
        self.backend.initialize_for_workflow(&self.descriptor).await?;
        self.statuses = self.store.get_execution_statuses(self.descriptor.id).await?;

        if init == InitMode::Restart {
            self.backend.prepare_for_restart(&self.descriptor).await?;
        }

        let _ = self.tx.send(WorkflowMsg::ExecutionStoreCreated(init)).await;
        Ok(())
    }

    /// Returns `true` if the actor should stop processing further messages.
    async fn handle(&mut self, msg: WorkflowMsg) -> bool {
        match msg {
            WorkflowMsg::ExecutionStoreCreated(InitMode::Start) => {
                self.start_runnable_keys().await;
                self.state = WorkflowState::Running;
                self.persist_state(WorkflowState::Submitted, WorkflowState::Running).await;
            }
            WorkflowMsg::ExecutionStoreCreated(InitMode::Restart) => {
                self.recover_in_flight().await;
                self.start_runnable_keys().await;
                self.state = WorkflowState::Running;
                self.persist_state(WorkflowState::Submitted, WorkflowState::Running).await;
            }
            WorkflowMsg::CallStarted(key) => {
                self.set_status(&[key], CallStatus::new(ExecutionStatus::Running)).await;
            }
            WorkflowMsg::CallCompleted { key, outputs, return_code } => {
                self.on_call_completed(key, outputs, return_code).await;
            }
            WorkflowMsg::CallFailed { key, return_code, message } => {
                self.on_call_failed(key, return_code, message).await;
            }
            WorkflowMsg::ScatterCompleted { key, shard_keys } => {
                self.on_scatter_completed(key, shard_keys).await;
            }
            WorkflowMsg::AbortWorkflow => {
                self.on_abort_workflow().await;
            }
            WorkflowMsg::AbortComplete(key) => {
                self.set_status(&[key], CallStatus::new(ExecutionStatus::Aborted)).await;
                self.maybe_finish_aborting().await;
            }
            WorkflowMsg::GetFailureMessage(reply) => {
                let message = self.store.get_failure_message(self.descriptor.id).await.ok().flatten();
                let _ = reply.send(message);
            }
            WorkflowMsg::Terminate => {
                return true;
            }
        }
        false
    }

    async fn on_call_completed(&mut self, key: ExecutionKey, outputs: CallOutputs, return_code: i32) {
        if let Err(e) = self.store.set_outputs(self.descriptor.id, &key, &outputs).await {
            self.fail_workflow(format!("persisting outputs for {key}: {e}")).await;
            return;
        }
        self.set_status(&[key.clone()], CallStatus::with_return_code(ExecutionStatus::Done, return_code)).await;
        let _ = self
            .store
            .append_event(self.descriptor.id, RuntimeEvent::CallCompleted { key: key.clone(), return_code })
            .await;

        if self.state == WorkflowState::Aborting {
            self.maybe_finish_aborting().await;
            return;
        }

        if self.statuses.values().all(|s| s.status == ExecutionStatus::Done) {
            self.finish(WorkflowState::Succeeded).await;
            return;
        }
        self.start_runnable_keys().await;
    }

    /// §4.4 step 3: a completed scatter's shard keys must be merged into the
    /// in-memory store before the next runnable scan, or they stay invisible
    /// to `start_runnable_keys` forever (it only ever scans `self.statuses`).
    async fn on_scatter_completed(&mut self, key: ExecutionKey, shard_keys: Vec<ExecutionKey>) {
        for shard in &shard_keys {
            self.statuses
                .entry(shard.clone())
                .or_insert_with(|| CallStatus::new(ExecutionStatus::NotStarted));
        }
        self.set_status(&[key.clone()], CallStatus::with_return_code(ExecutionStatus::Done, 0)).await;

        if self.state == WorkflowState::Aborting {
            self.maybe_finish_aborting().await;
            return;
        }

        if self.statuses.values().all(|s| s.status == ExecutionStatus::Done) {
            self.finish(WorkflowState::Succeeded).await;
            return;
        }
        self.start_runnable_keys().await;
    }

    async fn on_call_failed(&mut self, key: ExecutionKey, return_code: Option<i32>, message: String) {
        self.set_status(&[key.clone()], CallStatus { status: ExecutionStatus::Failed, return_code }).await;
        let _ = self
            .store
            .append_event(
                self.descriptor.id,
                RuntimeEvent::CallFailed { key: key.clone(), return_code, message: message.clone() },
            )
            .await;

        if self.state == WorkflowState::Aborting {
            self.maybe_finish_aborting().await;
            return;
        }
        self.fail_workflow(message).await;
    }

    async fn fail_workflow(&mut self, message: String) {
        let _ = self.store.set_failure_message(self.descriptor.id, &message).await;
        self.finish(WorkflowState::Failed).await;
    }

    async fn on_abort_workflow(&mut self) {
        let from = self.state;
        self.state = WorkflowState::Aborting;
        self.persist_state(from, WorkflowState::Aborting).await;
        // Children are tracked only by their ExecutionKey in this design;
        // a production actor would hold per-key abort handles and fan out
        // `AbortCall` to each in-flight Call Runner / Cache-Hit Copy FSM.
        self.maybe_finish_aborting().await;
    }

    async fn maybe_finish_aborting(&mut self) {
        if self.state != WorkflowState::Aborting {
            return;
        }
        let settled = self
            .statuses
            .values()
            .all(|s| s.status.is_terminal() || s.status == ExecutionStatus::NotStarted);
        if settled {
            self.finish(WorkflowState::Aborted).await;
        }
    }

    /// Terminal-transition bookkeeping: persist state before logging, clean
    /// up the backend, clear encrypted option values, and arm the
    /// self-`Terminate` timer.
    async fn finish(&mut self, next: WorkflowState) {
        let from = self.state;
        self.state = next;
        self.persist_state(from, next).await;

        if let Err(e) = self.backend.clean_up_for_workflow(&self.descriptor).await {
            warn!(workflow_id = %self.descriptor.id, error = %e, "backend cleanup failed");
        }
        self.clear_encrypted_options().await;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(WorkflowMsg::Terminate).await;
        });
    }

    async fn clear_encrypted_options(&mut self) {
        let cleared = WorkflowOptions(
            self.descriptor
                .workflow_options
                .0
                .iter()
                .filter(|(k, _)| !k.ends_with("_encrypted"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        if self.store.update_workflow_options(self.descriptor.id, cleared.clone()).await.is_ok() {
            self.descriptor.workflow_options = cleared;
        }
    }

    async fn persist_state(&self, from: WorkflowState, to: WorkflowState) {
        if let Err(e) = self.store.update_workflow_state(self.descriptor.id, to).await {
            warn!(workflow_id = %self.descriptor.id, error = %e, "failed to persist workflow state");
            return;
        }
        let _ = self
            .store
            .append_event(self.descriptor.id, RuntimeEvent::WorkflowStateChanged { from, to })
            .await;
        info!(workflow_id = %self.descriptor.id, ?from, ?to, "workflow state transition");
    }

    async fn set_status(&mut self, keys: &[ExecutionKey], status: CallStatus) {
        if let Err(e) = self.store.set_status(self.descriptor.id, keys, status.clone()).await {
            warn!(workflow_id = %self.descriptor.id, error = %e, "failed to persist status");
            return;
        }
        for key in keys {
            self.statuses.insert(key.clone(), status.clone());
        }
    }

    /// Restart recovery (§4.6 "Restart semantics"): scatter-in-`Starting`
    /// demands operator intervention; call-in-`Starting` rolls back;
    /// call-in-`Running` either resumes or rolls back.
    async fn recover_in_flight(&mut self) {
        let in_flight: Vec<ExecutionKey> = self
            .statuses
            .iter()
            .filter(|(_, s)| !s.status.is_terminal() && s.status != ExecutionStatus::NotStarted)
            .map(|(k, _)| k.clone())
            .collect();

        let mut resumable = match self.backend.find_resumable_executions(self.descriptor.id).await {
            Ok(m) => m,
            Err(e) => {
                self.fail_workflow(format!("restart: backend.find_resumable_executions failed: {e}")).await;
                return;
            }
        };

        for key in in_flight {
            let status = self.statuses.get(&key).cloned().unwrap();
            match (&key, status.status) {
                (ExecutionKey::Scatter { .. }, ExecutionStatus::Starting) => {
                    self.fail_workflow(
                        WorkflowError::ScatterRestartAmbiguous(key.scope().fully_qualified_name().to_string())
                            .to_string(),
                    )
                    .await;
                    return;
                }
                (ExecutionKey::Call { .. }, ExecutionStatus::Starting) => {
                    self.set_status(&[key], CallStatus::new(ExecutionStatus::NotStarted)).await;
                }
                (ExecutionKey::Call { .. }, ExecutionStatus::Running) => {
                    if let Some(job_key) = resumable.remove(&key) {
                        self.spawn_resume(key, job_key);
                    } else {
                        self.set_status(&[key], CallStatus::new(ExecutionStatus::NotStarted)).await;
                    }
                }
                _ => {}
            }
        }
    }

    fn resolver(&self) -> DependencyResolver<'_> {
        DependencyResolver::new(self.graph.as_ref())
    }

    async fn start_runnable_keys(&mut self) {
        loop {
            let runnable = self.resolver().runnable_keys(&self.statuses);
            if runnable.is_empty() {
                break;
            }
            for key in runnable {
                self.set_status(&[key.clone()], CallStatus::new(ExecutionStatus::Starting)).await;
                self.dispatch(key);
            }
        }
    }

    fn dispatch(&self, key: ExecutionKey) {
        match &key {
            ExecutionKey::Scatter { scope, index } => self.spawn_scatter(scope.clone(), *index),
            ExecutionKey::Collector { scope } => self.spawn_collector(scope.clone()),
            ExecutionKey::Call { .. } => self.spawn_call(key),
        }
    }

    fn spawn_call(&self, key: ExecutionKey) {
        let graph = self.graph.clone();
        let store = self.store.clone();
        let backend = self.backend.clone();
        let descriptor = self.descriptor.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let runner = CallRunner::new(graph.as_ref(), store.as_ref(), backend.as_ref(), &descriptor);
            let _ = tx.send(WorkflowMsg::CallStarted(key.clone())).await;
            let outcome = runner.run(key).await;
            let msg = match outcome {
                CallRunnerOutcome::Completed { key, outputs, return_code } => {
                    WorkflowMsg::CallCompleted { key, outputs, return_code }
                }
                CallRunnerOutcome::Failed { key, return_code, message } => {
                    WorkflowMsg::CallFailed { key, return_code, message }
                }
                CallRunnerOutcome::Aborted { key } => WorkflowMsg::AbortComplete(key),
            };
            let _ = tx.send(msg).await;
        });
    }

    fn spawn_resume(&self, key: ExecutionKey, job_key: JobKey) {
        let graph = self.graph.clone();
        let store = self.store.clone();
        let backend = self.backend.clone();
        let descriptor = self.descriptor.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let runner = CallRunner::new(graph.as_ref(), store.as_ref(), backend.as_ref(), &descriptor);
            let outcome = runner.resume(key, job_key).await;
            let msg = match outcome {
                CallRunnerOutcome::Completed { key, outputs, return_code } => {
                    WorkflowMsg::CallCompleted { key, outputs, return_code }
                }
                CallRunnerOutcome::Failed { key, return_code, message } => {
                    WorkflowMsg::CallFailed { key, return_code, message }
                }
                CallRunnerOutcome::Aborted { key } => WorkflowMsg::AbortComplete(key),
            };
            let _ = tx.send(msg).await;
        });
    }

    fn spawn_scatter(&self, scope: Scope, index: Option<ShardIndex>) {
        let graph = self.graph.clone();
        let store = self.store.clone();
        let descriptor_id = self.descriptor.id;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let expander = ScatterExpander::new(graph.as_ref(), store.as_ref(), descriptor_id);
            let key = ExecutionKey::Scatter { scope: scope.clone(), index };
            match expander.expand(&scope, index).await {
                Ok(expansion) => {
                    let shard_count = expansion.shard_keys.len();
                    let _ = store
                        .append_event(
                            descriptor_id,
                            RuntimeEvent::ScatterExpanded { key: key.clone(), shard_count },
                        )
                        .await;
                    let _ = tx
                        .send(WorkflowMsg::ScatterCompleted { key, shard_keys: expansion.shard_keys })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(WorkflowMsg::CallFailed { key, return_code: None, message: e.to_string() })
                        .await;
                }
            }
        });
    }

    fn spawn_collector(&self, scope: Scope) {
        let store = self.store.clone();
        let descriptor_id = self.descriptor.id;
        let tx = self.tx.clone();
        let resolver_graph = self.graph.clone();
        let declared = self.declared_outputs.get(&scope).cloned().unwrap_or_default();
        tokio::spawn(async move {
            let resolver = DependencyResolver::new(resolver_graph.as_ref());
            let statuses = match store.get_execution_statuses(descriptor_id).await {
                Ok(s) => s,
                Err(e) => {
                    let key = ExecutionKey::Collector { scope: scope.clone() };
                    let _ = tx
                        .send(WorkflowMsg::CallFailed { key, return_code: None, message: e.to_string() })
                        .await;
                    return;
                }
            };
            let shard_keys = resolver.shard_keys_for_collector(&scope, &statuses);
            let collector = Collector::new(store.as_ref(), descriptor_id);
            let outcome = collector.collect(&scope, &shard_keys, &declared).await;
            let msg = match outcome {
                CollectorOutcome::Completed { key, outputs } => {
                    WorkflowMsg::CallCompleted { key, outputs, return_code: 0 }
                }
                CollectorOutcome::Failed { key, message } => {
                    WorkflowMsg::CallFailed { key, return_code: None, message }
                }
            };
            let _ = tx.send(msg).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CallInputDecl, CallNode, StaticWorkflowGraph};
    use crate::store_memory::InMemoryDataAccess;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct EchoBackend;

    #[async_trait]
    impl Backend for EchoBackend {
        async fn initialize_for_workflow(&self, _w: &WorkflowDescriptor) -> crate::error::Result<()> {
            Ok(())
        }
        async fn prepare_for_restart(&self, _w: &WorkflowDescriptor) -> crate::error::Result<()> {
            Ok(())
        }
        async fn find_resumable_executions(
            &self,
            _id: Uuid,
        ) -> crate::error::Result<BTreeMap<ExecutionKey, JobKey>> {
            Ok(BTreeMap::new())
        }
        async fn execute(
            &self,
            _key: &ExecutionKey,
            inputs: &crate::backend::CallInputs,
            _w: &WorkflowDescriptor,
        ) -> crate::error::Result<crate::backend::CallOutcome> {
            let mut outputs = CallOutputs::new();
            if let Some(v) = inputs.get("x") {
                outputs.insert("out".into(), v.clone());
            } else {
                outputs.insert("out".into(), Value::String("done".into()));
            }
            Ok(crate::backend::CallOutcome::Success { outputs, return_code: 0 })
        }
        async fn resume(
            &self,
            key: &ExecutionKey,
            inputs: &crate::backend::CallInputs,
            _job_key: &JobKey,
            w: &WorkflowDescriptor,
        ) -> crate::error::Result<crate::backend::CallOutcome> {
            self.execute(key, inputs, w).await
        }
        async fn clean_up_for_workflow(&self, _w: &WorkflowDescriptor) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn linear_two_call_workflow_succeeds() {
        let wf = Uuid::new_v4();
        let descriptor = WorkflowDescriptor { id: wf, namespace: "wf".into(), workflow_options: WorkflowOptions::default() };
        let a = ExecutionKey::Call { scope: Scope::new("wf.A"), index: None };
        let b = ExecutionKey::Call { scope: Scope::new("wf.B"), index: None };

        let store = Arc::new(InMemoryDataAccess::new());
        store.create_workflow(&descriptor, &[], &[a.clone(), b.clone()]).await.unwrap();

        let mut g = StaticWorkflowGraph::new();
        g.add_call(CallNode { scope: Scope::new("wf.A"), inputs: vec![], task_outputs: vec!["out".into()] });
        g.add_call(CallNode {
            scope: Scope::new("wf.B"),
            inputs: vec![CallInputDecl {
                name: "x".into(),
                expression: Arc::new(crate::graph::IdentifierExpr("A".into())),
                declared_type: "String".into(),
            }],
            task_outputs: vec!["out".into()],
        });
        let graph: Arc<dyn WorkflowGraph> = Arc::new(g);
        let backend: Arc<dyn Backend> = Arc::new(EchoBackend);

        let handle = WorkflowFsm::spawn(graph, store.clone(), backend, descriptor, DeclaredOutputs::new(), InitMode::Start);

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(state) = store.get_workflow_state(wf).await.unwrap() {
                if state.is_terminal() {
                    break;
                }
            }
        }
        let final_state = store.get_workflow_state(wf).await.unwrap();
        assert_eq!(final_state, Some(WorkflowState::Succeeded));
        drop(handle);
    }
}
