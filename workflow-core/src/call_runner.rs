use crate::backend::{Backend, CallInputs, CallOutcome, JobKey};
use crate::error::{Result, WorkflowError};
use crate::graph::WorkflowGraph;
use crate::store::DataAccess;
use crate::symbol::SymbolResolver;
use crate::types::{CallStatus, CallOutputs, ExecutionKey, ExecutionStatus, WorkflowDescriptor};

/// Outcome reported back to the Workflow FSM once a Call Runner finishes.
pub enum CallRunnerOutcome {
    Completed { key: ExecutionKey, outputs: CallOutputs, return_code: i32 },
    Failed { key: ExecutionKey, return_code: Option<i32>, message: String },
    Aborted { key: ExecutionKey },
}

/// Per-call child worker: persists `Starting`/`Running`, resolves and
/// coerces inputs via the Symbol Resolver, invokes the backend, and reports
/// the outcome. Spawned fresh by the Workflow FSM for every runnable call
/// key; never shares state with sibling runners.
pub struct CallRunner<'a> {
    graph: &'a dyn WorkflowGraph,
    store: &'a dyn DataAccess,
    backend: &'a dyn Backend,
    workflow: &'a WorkflowDescriptor,
}

impl<'a> CallRunner<'a> {
    pub fn new(
        graph: &'a dyn WorkflowGraph,
        store: &'a dyn DataAccess,
        backend: &'a dyn Backend,
        workflow: &'a WorkflowDescriptor,
    ) -> Self {
        Self { graph, store, backend, workflow }
    }

    /// Fresh execution of `key`.
    pub async fn run(&self, key: ExecutionKey) -> CallRunnerOutcome {
        if let Err(e) = self
            .store
            .set_status(self.workflow.id, &[key.clone()], CallStatus::new(ExecutionStatus::Starting))
            .await
        {
            return CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() };
        }

        let inputs = match self.resolve_inputs(&key).await {
            Ok(i) => i,
            Err(e) => return CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() },
        };

        if let Err(e) = self
            .store
            .set_status(self.workflow.id, &[key.clone()], CallStatus::new(ExecutionStatus::Running))
            .await
        {
            return CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() };
        }

        match self.backend.execute(&key, &inputs, self.workflow).await {
            Ok(CallOutcome::Success { outputs, return_code }) => {
                CallRunnerOutcome::Completed { key, outputs, return_code }
            }
            Ok(CallOutcome::Failure { return_code, message }) => {
                CallRunnerOutcome::Failed { key, return_code, message }
            }
            Err(e) => CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() },
        }
    }

    /// Resume a call this backend reported as still-in-flight across a
    /// restart. Skips the `Starting` persist (the restart-time rollback
    /// already settled that) and goes straight to `Running`.
    pub async fn resume(&self, key: ExecutionKey, job_key: JobKey) -> CallRunnerOutcome {
        let inputs = match self.resolve_inputs(&key).await {
            Ok(i) => i,
            Err(e) => return CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() },
        };

        if let Err(e) = self
            .store
            .set_status(self.workflow.id, &[key.clone()], CallStatus::new(ExecutionStatus::Running))
            .await
        {
            return CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() };
        }

        match self.backend.resume(&key, &inputs, &job_key, self.workflow).await {
            Ok(CallOutcome::Success { outputs, return_code }) => {
                CallRunnerOutcome::Completed { key, outputs, return_code }
            }
            Ok(CallOutcome::Failure { return_code, message }) => {
                CallRunnerOutcome::Failed { key, return_code, message }
            }
            Err(e) => CallRunnerOutcome::Failed { key, return_code: None, message: e.to_string() },
        }
    }

    async fn resolve_inputs(&self, key: &ExecutionKey) -> Result<CallInputs> {
        let call = self.graph.call_node(key.scope()).ok_or_else(|| {
            WorkflowError::Expression(format!("no call node at `{}`", key.scope()))
        })?;
        let resolver = SymbolResolver::new(self.graph, self.store, self.workflow.id);
        let mut inputs = CallInputs::new();
        for decl in &call.inputs {
            let value = resolver
                .resolve_input(key, &decl.name, &decl.declared_type)
                .await?;
            inputs.insert(decl.name.clone(), value);
        }
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CallInputDecl, CallNode, LiteralExpr, StaticWorkflowGraph};
    use crate::store_memory::InMemoryDataAccess;
    use crate::types::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    struct EchoBackend;

    #[async_trait]
    impl Backend for EchoBackend {
        async fn initialize_for_workflow(&self, _workflow: &WorkflowDescriptor) -> Result<()> {
            Ok(())
        }
        async fn prepare_for_restart(&self, _workflow: &WorkflowDescriptor) -> Result<()> {
            Ok(())
        }
        async fn find_resumable_executions(
            &self,
            _workflow_id: Uuid,
        ) -> Result<BTreeMap<ExecutionKey, JobKey>> {
            Ok(BTreeMap::new())
        }
        async fn execute(
            &self,
            _key: &ExecutionKey,
            inputs: &CallInputs,
            _workflow: &WorkflowDescriptor,
        ) -> Result<CallOutcome> {
            let mut outputs = CallOutputs::new();
            if let Some(v) = inputs.get("greeting") {
                outputs.insert("out".into(), v.clone());
            }
            Ok(CallOutcome::Success { outputs, return_code: 0 })
        }
        async fn resume(
            &self,
            key: &ExecutionKey,
            inputs: &CallInputs,
            _job_key: &JobKey,
            workflow: &WorkflowDescriptor,
        ) -> Result<CallOutcome> {
            self.execute(key, inputs, workflow).await
        }
        async fn clean_up_for_workflow(&self, _workflow: &WorkflowDescriptor) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_call_and_reports_outputs() {
        let wf = Uuid::new_v4();
        let descriptor = WorkflowDescriptor {
            id: wf,
            namespace: "wf".into(),
            workflow_options: WorkflowOptions::default(),
        };
        let key = ExecutionKey::Call { scope: Scope::new("wf.A"), index: None };
        let store = InMemoryDataAccess::new();
        store.create_workflow(&descriptor, &[], &[key.clone()]).await.unwrap();

        let mut g = StaticWorkflowGraph::new();
        g.add_call(CallNode {
            scope: Scope::new("wf.A"),
            inputs: vec![CallInputDecl {
                name: "greeting".into(),
                expression: Arc::new(LiteralExpr(Value::String("hi".into()))),
                declared_type: "String".into(),
            }],
            task_outputs: vec!["out".into()],
        });
        g.add_declaration(crate::graph::DeclarationNode {
            scope: Scope::new("wf.greeting"),
            name: "greeting".into(),
            expression: Arc::new(LiteralExpr(Value::String("hi".into()))),
        });
        store
            .put_symbol(
                wf,
                Symbol {
                    scope: Scope::new("wf.greeting"),
                    name: "greeting".into(),
                    index: None,
                    is_input: false,
                    wdl_type: "String".into(),
                    wdl_value: Some(Value::String("hi".into())),
                },
            )
            .await
            .unwrap();

        let backend = EchoBackend;
        let runner = CallRunner::new(&g, &store, &backend, &descriptor);
        let outcome = runner.run(key.clone()).await;
        match outcome {
            CallRunnerOutcome::Completed { outputs, return_code, .. } => {
                assert_eq!(return_code, 0);
                assert_eq!(outputs["out"], Value::String("hi".into()));
            }
            _ => panic!("expected success"),
        }

        let statuses = store.get_execution_statuses(wf).await.unwrap();
        assert_eq!(statuses[&key].status, ExecutionStatus::Running);
    }
}
