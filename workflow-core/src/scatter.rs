use crate::error::Result;
use crate::graph::WorkflowGraph;
use crate::store::DataAccess;
use crate::symbol::SymbolResolver;
use crate::types::{CallStatus, ExecutionKey, ExecutionStatus, Scope, ShardIndex};
use uuid::Uuid;

/// Outcome of expanding a scatter: the shard keys it allocated, in order.
pub struct ScatterExpansion {
    pub scatter_key: ExecutionKey,
    pub shard_keys: Vec<ExecutionKey>,
}

/// Evaluates a runnable scatter's collection expression and materializes its
/// shard keys, persisting the sequence `Starting -> shards inserted -> Done`.
pub struct ScatterExpander<'a> {
    graph: &'a dyn WorkflowGraph,
    store: &'a dyn DataAccess,
    workflow_id: Uuid,
}

impl<'a> ScatterExpander<'a> {
    pub fn new(graph: &'a dyn WorkflowGraph, store: &'a dyn DataAccess, workflow_id: Uuid) -> Self {
        Self { graph, store, workflow_id }
    }

    /// Expand `scope`, which must name a scatter node runnable per the
    /// Dependency Resolver. Returns the new shard keys on success; any
    /// failure here is fatal to the whole workflow per the spec.
    pub async fn expand(&self, scope: &Scope, index: Option<ShardIndex>) -> Result<ScatterExpansion> {
        let scatter_key = ExecutionKey::Scatter { scope: scope.clone(), index };
        let scatter = self
            .graph
            .scatter_node(scope)
            .ok_or_else(|| crate::error::WorkflowError::Expression(format!("no scatter node at `{scope}`")))?;

        self.store
            .set_status(self.workflow_id, &[scatter_key.clone()], CallStatus::new(ExecutionStatus::Starting))
            .await?;

        let resolver = SymbolResolver::new(self.graph, self.store, self.workflow_id);
        let collection = resolver.evaluate(scope, scatter.collection.as_ref()).await?;
        let array = collection.as_array().map(|a| a.to_vec()).ok_or_else(|| {
            crate::error::WorkflowError::ScatterCollectionNotArray(scope.fully_qualified_name().to_string())
        })?;

        let n = array.len() as ShardIndex;
        let mut shard_keys = Vec::new();
        for member in &scatter.members {
            for i in 0..n {
                shard_keys.push(ExecutionKey::Call { scope: member.clone(), index: Some(i) });
            }
        }

        self.store.insert_calls(self.workflow_id, &shard_keys).await?;

        self.store
            .set_status(
                self.workflow_id,
                &[scatter_key.clone()],
                CallStatus::with_return_code(ExecutionStatus::Done, 0),
            )
            .await?;

        Ok(ScatterExpansion { scatter_key, shard_keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CallNode, IdentifierExpr, ScatterNodeDecl, StaticWorkflowGraph};
    use crate::store_memory::InMemoryDataAccess;
    use crate::types::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn expands_into_ordered_shards() {
        let wf = Uuid::new_v4();
        let store = InMemoryDataAccess::new();
        let descriptor = WorkflowDescriptor {
            id: wf,
            namespace: "wf".into(),
            workflow_options: WorkflowOptions::default(),
        };
        let scatter_key = ExecutionKey::Scatter { scope: Scope::new("wf.scatter0"), index: None };
        store
            .create_workflow(&descriptor, &[], &[scatter_key.clone()])
            .await
            .unwrap();
        store
            .put_symbol(
                wf,
                Symbol {
                    scope: Scope::new("wf.xs"),
                    name: "xs".into(),
                    index: None,
                    is_input: false,
                    wdl_type: "Array[Int]".into(),
                    wdl_value: Some(Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
                },
            )
            .await
            .unwrap();

        let mut g = StaticWorkflowGraph::new();
        g.add_declaration(crate::graph::DeclarationNode {
            scope: Scope::new("wf.xs"),
            name: "xs".into(),
            expression: Arc::new(IdentifierExpr("xs".into())),
        });
        g.add_scatter(ScatterNodeDecl {
            scope: Scope::new("wf.scatter0"),
            item_name: "x".into(),
            collection: Arc::new(IdentifierExpr("xs".into())),
            members: vec![Scope::new("wf.scatter0.A")],
        });
        g.add_call(CallNode {
            scope: Scope::new("wf.scatter0.A"),
            inputs: vec![],
            task_outputs: vec!["out".into()],
        });

        let expander = ScatterExpander::new(&g, &store, wf);
        let expansion = expander.expand(&Scope::new("wf.scatter0"), None).await.unwrap();
        assert_eq!(expansion.shard_keys.len(), 3);

        let statuses = store.get_execution_statuses(wf).await.unwrap();
        assert_eq!(statuses[&scatter_key].status, ExecutionStatus::Done);
        for i in 0..3 {
            let key = ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(i) };
            assert_eq!(statuses[&key].status, ExecutionStatus::NotStarted);
        }
    }
}
