use crate::graph::WorkflowGraph;
use crate::types::{CallStatus, ExecutionKey, ExecutionStatus, Scope};
use std::collections::BTreeMap;

/// Given a key and the execution store, decides whether its prerequisites
/// are satisfied — including scatter-shard alignment (same-shard dependency
/// inside a common scatter, collected/aggregated form otherwise).
pub struct DependencyResolver<'g> {
    graph: &'g dyn WorkflowGraph,
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g dyn WorkflowGraph) -> Self {
        Self { graph }
    }

    /// `true` iff `key` is `NotStarted` and every prerequisite scope set is
    /// non-empty and entirely `Done`.
    pub fn is_runnable(
        &self,
        key: &ExecutionKey,
        store: &BTreeMap<ExecutionKey, CallStatus>,
    ) -> bool {
        match store.get(key) {
            Some(s) if s.status == ExecutionStatus::NotStarted => {}
            _ => return false,
        }
        self.prerequisite_entries(key, store)
            .map(|sets| sets.iter().all(|set| !set.is_empty() && set.iter().all(|s| *s == ExecutionStatus::Done)))
            .unwrap_or(false)
    }

    /// Every prerequisite scope's set of matching store entries, as a list
    /// of per-scope status sets. `None` if the graph declares no
    /// prerequisites (immediately runnable — the caller still requires a
    /// non-empty outer list check, so this returns `Some(vec![])`, which is
    /// vacuously "every set satisfied").
    fn prerequisite_entries(
        &self,
        key: &ExecutionKey,
        store: &BTreeMap<ExecutionKey, CallStatus>,
    ) -> Option<Vec<Vec<ExecutionStatus>>> {
        let mut sets = Vec::new();

        for prereq_scope in self.graph.prerequisite_scopes(key.scope()) {
            let ancestor = self.graph.closest_common_ancestor(&prereq_scope, key.scope());
            let same_shard = self.graph.is_scatter(&ancestor);

            let set: Vec<ExecutionStatus> = store
                .iter()
                .filter(|(k, _)| {
                    k.scope() == &prereq_scope
                        && if same_shard {
                            k.index() == key.index()
                        } else {
                            k.index().is_none()
                        }
                })
                .map(|(_, s)| s.status)
                .collect();

            sets.push(set);
        }

        if let ExecutionKey::Collector { scope } = key {
            let shard_set: Vec<ExecutionStatus> = store
                .iter()
                .filter(|(k, _)| matches!(k, ExecutionKey::Call { scope: s, index: Some(_) } if s == scope))
                .map(|(_, s)| s.status)
                .collect();
            sets.push(shard_set);
        }

        Some(sets)
    }

    /// Scan the store to a fixed point, returning every key that can start
    /// right now. The caller is expected to mark returned keys `Starting`
    /// (or dispatch them) before calling again, since iteration order over
    /// the store is not semantically significant but re-entrancy is not
    /// implied by this method alone.
    pub fn runnable_keys(&self, store: &BTreeMap<ExecutionKey, CallStatus>) -> Vec<ExecutionKey> {
        store
            .keys()
            .filter(|k| self.is_runnable(k, store))
            .cloned()
            .collect()
    }

    /// Ordered (ascending index) shard keys belonging to a collector's
    /// target scope.
    pub fn shard_keys_for_collector(
        &self,
        collector_scope: &Scope,
        store: &BTreeMap<ExecutionKey, CallStatus>,
    ) -> Vec<ExecutionKey> {
        let mut shards: Vec<(i64, ExecutionKey)> = store
            .keys()
            .filter_map(|k| match k {
                ExecutionKey::Call { scope, index: Some(i) } if scope == collector_scope => {
                    Some((*i, k.clone()))
                }
                _ => None,
            })
            .collect();
        shards.sort_by_key(|(i, _)| *i);
        shards.into_iter().map(|(_, k)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{IdentifierExpr, StaticWorkflowGraph};
    use crate::graph::{CallNode, CallInputDecl};
    use std::sync::Arc;

    fn linear_graph() -> StaticWorkflowGraph {
        let mut g = StaticWorkflowGraph::new();
        g.add_call(CallNode {
            scope: Scope::new("wf.A"),
            inputs: vec![],
            task_outputs: vec!["out".into()],
        });
        g.add_call(CallNode {
            scope: Scope::new("wf.B"),
            inputs: vec![CallInputDecl {
                name: "x".into(),
                expression: Arc::new(IdentifierExpr("A".into())),
                declared_type: "String".into(),
            }],
            task_outputs: vec!["out".into()],
        });
        g
    }

    #[test]
    fn zero_prereq_key_is_runnable() {
        let g = linear_graph();
        let resolver = DependencyResolver::new(&g);
        let a = ExecutionKey::Call { scope: Scope::new("wf.A"), index: None };
        let mut store = BTreeMap::new();
        store.insert(a.clone(), CallStatus::new(ExecutionStatus::NotStarted));
        assert!(resolver.is_runnable(&a, &store));
    }

    #[test]
    fn downstream_waits_for_upstream() {
        let g = linear_graph();
        let resolver = DependencyResolver::new(&g);
        let a = ExecutionKey::Call { scope: Scope::new("wf.A"), index: None };
        let b = ExecutionKey::Call { scope: Scope::new("wf.B"), index: None };
        let mut store = BTreeMap::new();
        store.insert(a.clone(), CallStatus::new(ExecutionStatus::Running));
        store.insert(b.clone(), CallStatus::new(ExecutionStatus::NotStarted));
        assert!(!resolver.is_runnable(&b, &store));

        store.insert(a.clone(), CallStatus::new(ExecutionStatus::Done));
        assert!(resolver.is_runnable(&b, &store));
    }

    #[test]
    fn collector_needs_all_shards_done() {
        let mut g = StaticWorkflowGraph::new();
        g.add_scatter(crate::graph::ScatterNodeDecl {
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
        g.mark_collector_target(Scope::new("wf.scatter0.A"));
        let resolver = DependencyResolver::new(&g);

        let collector = ExecutionKey::Collector { scope: Scope::new("wf.scatter0.A") };
        let mut store = BTreeMap::new();
        store.insert(collector.clone(), CallStatus::new(ExecutionStatus::NotStarted));
        for i in 0..3 {
            store.insert(
                ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(i) },
                CallStatus::new(ExecutionStatus::Running),
            );
        }
        assert!(!resolver.is_runnable(&collector, &store));

        for i in 0..3 {
            store.insert(
                ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(i) },
                CallStatus::new(ExecutionStatus::Done),
            );
        }
        assert!(resolver.is_runnable(&collector, &store));

        let shards = resolver.shard_keys_for_collector(&Scope::new("wf.scatter0.A"), &store);
        assert_eq!(shards.len(), 3);
    }
}
