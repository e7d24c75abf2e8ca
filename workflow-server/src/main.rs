use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use workflow_core::{
    Backend, CallInputDecl, CallInputs, CallNode, CallOutcome, DataAccess, ExecutionKey,
    IdentifierExpr, InMemoryDataAccess, InitMode, JobKey, Scope, StaticWorkflowGraph,
    WorkflowDescriptor, WorkflowFsm, WorkflowGraph, WorkflowOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let database_url = parse_database_url();

    let store: Arc<dyn DataAccess> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = workflow_core::PostgresDataAccess::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresDataAccess (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using InMemoryDataAccess"
            );
            Arc::new(InMemoryDataAccess::new())
        }
        None => {
            tracing::info!("Using InMemoryDataAccess (no database URL configured)");
            Arc::new(InMemoryDataAccess::new())
        }
    };

    let (descriptor, graph) = demo_workflow();
    let calls: Vec<ExecutionKey> = vec![
        ExecutionKey::Call { scope: Scope::new("wf.hello"), index: None },
        ExecutionKey::Call { scope: Scope::new("wf.greet"), index: None },
    ];
    store.create_workflow(&descriptor, &[], &calls).await?;

    let graph: Arc<dyn WorkflowGraph> = Arc::new(graph);
    let backend: Arc<dyn Backend> = Arc::new(ShellEchoBackend);

    tracing::info!(workflow_id = %descriptor.id, "submitting demo workflow");
    let handle = WorkflowFsm::spawn(
        graph,
        store.clone(),
        backend,
        descriptor.clone(),
        BTreeMap::new(),
        InitMode::Start,
    );

    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(state) = store.get_workflow_state(descriptor.id).await? {
            if state.is_terminal() {
                tracing::info!(workflow_id = %descriptor.id, ?state, "workflow finished");
                break;
            }
        }
    }
    drop(handle);

    Ok(())
}

/// A minimal graph for the demo binary: `hello` runs with no inputs, `greet`
/// consumes `hello`'s output.
fn demo_workflow() -> (WorkflowDescriptor, StaticWorkflowGraph) {
    let descriptor = WorkflowDescriptor {
        id: Uuid::new_v4(),
        namespace: "wf".to_string(),
        workflow_options: WorkflowOptions::default(),
    };

    let mut graph = StaticWorkflowGraph::new();
    graph.add_call(CallNode {
        scope: Scope::new("wf.hello"),
        inputs: vec![],
        task_outputs: vec!["out".into()],
    });
    graph.add_call(CallNode {
        scope: Scope::new("wf.greet"),
        inputs: vec![CallInputDecl {
            name: "greeting".into(),
            expression: Arc::new(IdentifierExpr("hello".into())),
            declared_type: "String".into(),
        }],
        task_outputs: vec!["out".into()],
    });

    (descriptor, graph)
}

/// Demo backend: "runs" a call by echoing its inputs back as outputs. A real
/// deployment swaps this for a process/container/batch backend behind the
/// same trait.
struct ShellEchoBackend;

#[async_trait]
impl Backend for ShellEchoBackend {
    async fn initialize_for_workflow(&self, workflow: &WorkflowDescriptor) -> workflow_core::Result<()> {
        tracing::info!(workflow_id = %workflow.id, "backend initialized");
        Ok(())
    }

    async fn prepare_for_restart(&self, workflow: &WorkflowDescriptor) -> workflow_core::Result<()> {
        tracing::info!(workflow_id = %workflow.id, "backend preparing for restart");
        Ok(())
    }

    async fn find_resumable_executions(
        &self,
        _workflow_id: Uuid,
    ) -> workflow_core::Result<BTreeMap<ExecutionKey, JobKey>> {
        Ok(BTreeMap::new())
    }

    async fn execute(
        &self,
        key: &ExecutionKey,
        inputs: &CallInputs,
        _workflow: &WorkflowDescriptor,
    ) -> workflow_core::Result<CallOutcome> {
        tracing::info!(%key, "executing call");
        let mut outputs = workflow_core::CallOutputs::new();
        let greeting = inputs
            .get("greeting")
            .cloned()
            .unwrap_or(workflow_core::Value::String("hello from the workflow core".into()));
        outputs.insert("out".into(), greeting);
        Ok(CallOutcome::Success { outputs, return_code: 0 })
    }

    async fn resume(
        &self,
        key: &ExecutionKey,
        inputs: &CallInputs,
        _job_key: &JobKey,
        workflow: &WorkflowDescriptor,
    ) -> workflow_core::Result<CallOutcome> {
        self.execute(key, inputs, workflow).await
    }

    async fn clean_up_for_workflow(&self, workflow: &WorkflowDescriptor) -> workflow_core::Result<()> {
        tracing::info!(workflow_id = %workflow.id, "backend cleaned up");
        Ok(())
    }
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL` env var.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
