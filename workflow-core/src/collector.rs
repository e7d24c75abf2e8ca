use crate::error::{Result, WorkflowError};
use crate::resolver::DependencyResolver;
use crate::store::DataAccess;
use crate::types::{CallOutputs, CallStatus, ExecutionKey, ExecutionStatus, Scope};
use uuid::Uuid;

/// Outcome posted back to the Workflow FSM after a collector runs.
pub enum CollectorOutcome {
    Completed { key: ExecutionKey, outputs: CallOutputs },
    Failed { key: ExecutionKey, message: String },
}

/// Gathers completed shard outputs of a scattered call into
/// `Array[type(O)]`-valued outputs for the collector key, ordered by shard
/// index ascending.
pub struct Collector<'a> {
    store: &'a dyn DataAccess,
    workflow_id: Uuid,
}

impl<'a> Collector<'a> {
    pub fn new(store: &'a dyn DataAccess, workflow_id: Uuid) -> Self {
        Self { store, workflow_id }
    }

    /// Run the collector for `target_scope`, given the shard keys to gather
    /// (ascending index order, as produced by
    /// `DependencyResolver::shard_keys_for_collector`) and the declared task
    /// output names of the underlying call.
    pub async fn collect(
        &self,
        target_scope: &Scope,
        shard_keys: &[ExecutionKey],
        declared_outputs: &[String],
    ) -> CollectorOutcome {
        let collector_key = ExecutionKey::Collector { scope: target_scope.clone() };

        if let Err(e) = self
            .store
            .set_status(self.workflow_id, &[collector_key.clone()], CallStatus::new(ExecutionStatus::Starting))
            .await
        {
            return CollectorOutcome::Failed { key: collector_key, message: e.to_string() };
        }

        match self.assemble(target_scope, shard_keys, declared_outputs).await {
            Ok(outputs) => CollectorOutcome::Completed { key: collector_key, outputs },
            Err(e) => CollectorOutcome::Failed { key: collector_key, message: e.to_string() },
        }
    }

    async fn assemble(
        &self,
        target_scope: &Scope,
        shard_keys: &[ExecutionKey],
        declared_outputs: &[String],
    ) -> Result<CallOutputs> {
        let mut per_output: Vec<(String, Vec<crate::types::Value>)> =
            declared_outputs.iter().cloned().map(|o| (o, Vec::new())).collect();

        for key in shard_keys {
            let index = key.index().unwrap_or(0);
            let symbols = self.store.get_outputs(self.workflow_id, key).await?;
            for (output_name, values) in per_output.iter_mut() {
                let value = symbols
                    .iter()
                    .find(|s| &s.name == output_name)
                    .and_then(|s| s.wdl_value.clone())
                    .ok_or_else(|| WorkflowError::CollectorMissingShardOutput {
                        scope: target_scope.fully_qualified_name().to_string(),
                        output: output_name.clone(),
                        index,
                    })?;
                values.push(value);
            }
        }

        Ok(per_output
            .into_iter()
            .map(|(name, values)| (name, crate::types::Value::Array(values)))
            .collect())
    }
}

/// Convenience wrapper combining shard discovery (via the Dependency
/// Resolver) with collection, for callers that only have the raw execution
/// store snapshot.
pub async fn collect_from_store(
    store: &dyn DataAccess,
    workflow_id: Uuid,
    resolver: &DependencyResolver<'_>,
    target_scope: &Scope,
    declared_outputs: &[String],
) -> CollectorOutcome {
    let statuses = match store.get_execution_statuses(workflow_id).await {
        Ok(s) => s,
        Err(e) => {
            return CollectorOutcome::Failed {
                key: ExecutionKey::Collector { scope: target_scope.clone() },
                message: e.to_string(),
            }
        }
    };
    let shard_keys = resolver.shard_keys_for_collector(target_scope, &statuses);
    let collector = Collector::new(store, workflow_id);
    collector.collect(target_scope, &shard_keys, declared_outputs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::InMemoryDataAccess;
    use crate::types::*;

    async fn seeded(wf: Uuid) -> InMemoryDataAccess {
        let store = InMemoryDataAccess::new();
        let descriptor = WorkflowDescriptor {
            id: wf,
            namespace: "wf".into(),
            workflow_options: WorkflowOptions::default(),
        };
        let collector_key = ExecutionKey::Collector { scope: Scope::new("wf.scatter0.A") };
        store
            .create_workflow(&descriptor, &[], &[collector_key])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn assembles_array_in_shard_order() {
        let wf = Uuid::new_v4();
        let store = seeded(wf).await;
        for i in 0..3i64 {
            let key = ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(i) };
            let mut outputs = CallOutputs::new();
            outputs.insert("out".to_string(), Value::Int(i * 10));
            store.set_outputs(wf, &key, &outputs).await.unwrap();
        }

        let shard_keys: Vec<_> = (0..3)
            .map(|i| ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(i) })
            .collect();

        let collector = Collector::new(&store, wf);
        let outcome = collector
            .collect(&Scope::new("wf.scatter0.A"), &shard_keys, &["out".to_string()])
            .await;

        match outcome {
            CollectorOutcome::Completed { outputs, .. } => {
                assert_eq!(
                    outputs["out"],
                    Value::Array(vec![Value::Int(0), Value::Int(10), Value::Int(20)])
                );
            }
            CollectorOutcome::Failed { message, .. } => panic!("unexpected failure: {message}"),
        }
    }

    #[tokio::test]
    async fn missing_shard_output_fails() {
        let wf = Uuid::new_v4();
        let store = seeded(wf).await;
        let key = ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(0) };
        let mut outputs = CallOutputs::new();
        outputs.insert("out".to_string(), Value::Int(1));
        store.set_outputs(wf, &key, &outputs).await.unwrap();

        let shard_keys = vec![
            ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(0) },
            ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(1) },
        ];

        let collector = Collector::new(&store, wf);
        let outcome = collector
            .collect(&Scope::new("wf.scatter0.A"), &shard_keys, &["out".to_string()])
            .await;

        assert!(matches!(outcome, CollectorOutcome::Failed { .. }));
    }
}
