use crate::error::{Result, WorkflowError};
use crate::graph::WorkflowGraph;
use crate::store::DataAccess;
use crate::types::{ExecutionKey, Scope, Value};
use uuid::Uuid;

/// Resolves identifier references against a workflow's graph and durable
/// symbol table, in strict precedence order: scatter variable, imported
/// namespace, call output, declaration.
pub struct SymbolResolver<'a> {
    graph: &'a dyn WorkflowGraph,
    store: &'a dyn DataAccess,
    workflow_id: Uuid,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(graph: &'a dyn WorkflowGraph, store: &'a dyn DataAccess, workflow_id: Uuid) -> Self {
        Self { graph, store, workflow_id }
    }

    /// Resolve `identifier` as seen from `resolving_key`, trying each
    /// precedence tier in order and returning the first success.
    pub async fn resolve(&self, resolving_key: &ExecutionKey, identifier: &str) -> Result<Value> {
        if let Some(v) = self.try_scatter_variable(resolving_key, identifier).await? {
            return Ok(v);
        }
        if let Some(v) = self.try_imported_namespace(resolving_key, identifier).await? {
            return Ok(v);
        }
        if let Some(v) = self.try_call_output(resolving_key, identifier).await? {
            return Ok(v);
        }
        if let Some(v) = self.try_declaration(resolving_key, identifier).await? {
            return Ok(v);
        }
        Err(WorkflowError::UnresolvedIdentifier {
            scope: resolving_key.scope().fully_qualified_name().to_string(),
            identifier: identifier.to_string(),
        })
    }

    /// Resolve a single call input and coerce it to `declared_type`.
    pub async fn resolve_input(
        &self,
        resolving_key: &ExecutionKey,
        identifier: &str,
        declared_type: &str,
    ) -> Result<Value> {
        let value = self.resolve(resolving_key, identifier).await?;
        coerce(value, declared_type)
    }

    async fn try_scatter_variable(
        &self,
        resolving_key: &ExecutionKey,
        identifier: &str,
    ) -> Result<Option<Value>> {
        for scatter in self.graph.scatter_ancestors(resolving_key.scope()) {
            if scatter.item_name != identifier {
                continue;
            }
            let index = resolving_key.index().ok_or_else(|| {
                WorkflowError::Expression(format!(
                    "`{identifier}` references scatter variable of `{}` but `{}` carries no shard index",
                    scatter.scope, resolving_key.scope()
                ))
            })?;
            let collection = self.evaluate(&scatter.scope, scatter.collection.as_ref()).await?;
            let array = collection.as_array().ok_or_else(|| {
                WorkflowError::ScatterCollectionNotArray(scatter.scope.fully_qualified_name().to_string())
            })?;
            let item = array.get(index as usize).ok_or_else(|| {
                WorkflowError::Expression(format!(
                    "shard index {index} out of range for scatter `{}` (len {})",
                    scatter.scope,
                    array.len()
                ))
            })?;
            return Ok(Some(item.clone()));
        }
        Ok(None)
    }

    async fn try_imported_namespace(
        &self,
        resolving_key: &ExecutionKey,
        identifier: &str,
    ) -> Result<Option<Value>> {
        let Some(target) = self
            .graph
            .imported_namespace_scope(resolving_key.scope(), identifier)
        else {
            return Ok(None);
        };
        self.resolve_named_scope(resolving_key, &target).await
    }

    async fn try_call_output(
        &self,
        resolving_key: &ExecutionKey,
        identifier: &str,
    ) -> Result<Option<Value>> {
        let Some(call_scope) = self.graph.find_call_by_name(resolving_key.scope(), identifier) else {
            return Ok(None);
        };
        self.resolve_named_scope(resolving_key, &call_scope).await
    }

    async fn try_declaration(
        &self,
        resolving_key: &ExecutionKey,
        identifier: &str,
    ) -> Result<Option<Value>> {
        let Some(decl_scope) = self
            .graph
            .find_declaration_by_name(resolving_key.scope(), identifier)
        else {
            return Ok(None);
        };
        let fqn = decl_scope.fully_qualified_name();
        let symbols = self.store.get_fully_qualified_name(self.workflow_id, fqn).await?;
        Ok(symbols.into_iter().find_map(|s| s.wdl_value))
    }

    /// Shared logic for "a call output named `target`": same-shard lookup if
    /// `target` shares a scatter ancestor with `resolving_key`, collected
    /// array of every shard otherwise.
    async fn resolve_named_scope(
        &self,
        resolving_key: &ExecutionKey,
        target: &Scope,
    ) -> Result<Option<Value>> {
        let ancestor = self.graph.closest_common_ancestor(target, resolving_key.scope());
        let same_shard = self.graph.is_scatter(&ancestor);

        if same_shard {
            let key = ExecutionKey::Call { scope: target.clone(), index: resolving_key.index() };
            let symbols = self.store.get_outputs(self.workflow_id, &key).await?;
            return Ok(first_output_value(&symbols));
        }

        if self.graph.is_collector_target(target) {
            let collector_key = ExecutionKey::Collector { scope: target.clone() };
            let symbols = self.store.get_outputs(self.workflow_id, &collector_key).await?;
            return Ok(first_output_value(&symbols));
        }

        let key = ExecutionKey::Call { scope: target.clone(), index: None };
        let symbols = self.store.get_outputs(self.workflow_id, &key).await?;
        Ok(first_output_value(&symbols))
    }

    /// Evaluate an `Expression` tree, wiring its identifier lookups back
    /// through this resolver. `Expression::evaluate` is synchronous while
    /// identifier resolution is not, so the fast path below handles the
    /// identifier and literal shapes the Scatter Expander actually produces;
    /// anything else reports an expression error rather than deadlocking an
    /// async bridge.
    pub async fn evaluate(
        &self,
        resolving_scope: &Scope,
        expr: &dyn crate::graph::Expression,
    ) -> Result<Value> {
        if let Some(ident) = expr.as_any().downcast_ref::<crate::graph::IdentifierExpr>() {
            let resolving_key = ExecutionKey::Scatter { scope: resolving_scope.clone(), index: None };
            return Box::pin(self.resolve(&resolving_key, &ident.0)).await;
        }
        let lookup = |name: &str| -> Result<Value> {
            Err(WorkflowError::Expression(format!(
                "compound scatter-collection expressions cannot reference `{name}` without a pre-resolution pass"
            )))
        };
        expr.evaluate(&lookup)
    }
}

fn first_output_value(symbols: &[crate::types::Symbol]) -> Option<Value> {
    symbols.iter().find_map(|s| s.wdl_value.clone())
}

/// Coerce `value` to `declared_type`, per the WDL-ish scalar/array type
/// names used throughout this crate. Only the conversions a workflow
/// runtime actually needs are implemented; anything else is a type
/// mismatch.
pub fn coerce(value: Value, declared_type: &str) -> Result<Value> {
    let base = declared_type.trim_end_matches('?');
    if base == value.type_name() {
        return Ok(value);
    }
    match (base, &value) {
        ("Float", Value::Int(i)) => Ok(Value::Float(*i as f64)),
        ("String", Value::Int(i)) => Ok(Value::String(i.to_string())),
        ("String", Value::Float(f)) => Ok(Value::String(f.to_string())),
        ("String", Value::Boolean(b)) => Ok(Value::String(b.to_string())),
        ("File", Value::String(s)) => Ok(Value::File(s.clone())),
        _ if base.starts_with("Array") => match &value {
            Value::Array(_) => Ok(value),
            _ => Err(type_mismatch("Array", &value, declared_type)),
        },
        _ => Err(type_mismatch(base, &value, declared_type)),
    }
}

fn type_mismatch(expected: &str, found: &Value, context: &str) -> WorkflowError {
    WorkflowError::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_name().to_string(),
        context: context.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CallInputDecl, CallNode, IdentifierExpr, LiteralExpr, ScatterNodeDecl, StaticWorkflowGraph};
    use crate::store_memory::InMemoryDataAccess;
    use crate::types::*;
    use std::sync::Arc;

    async fn seeded_store(workflow_id: Uuid) -> InMemoryDataAccess {
        let store = InMemoryDataAccess::new();
        let descriptor = WorkflowDescriptor {
            id: workflow_id,
            namespace: "wf".into(),
            workflow_options: WorkflowOptions::default(),
        };
        store.create_workflow(&descriptor, &[], &[]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn resolves_declaration() {
        let wf = Uuid::new_v4();
        let store = seeded_store(wf).await;
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

        let mut g = StaticWorkflowGraph::new();
        g.add_declaration(crate::graph::DeclarationNode {
            scope: Scope::new("wf.greeting"),
            name: "greeting".into(),
            expression: Arc::new(LiteralExpr(Value::String("hi".into()))),
        });
        g.add_call(CallNode {
            scope: Scope::new("wf.A"),
            inputs: vec![CallInputDecl {
                name: "x".into(),
                expression: Arc::new(IdentifierExpr("greeting".into())),
                declared_type: "String".into(),
            }],
            task_outputs: vec![],
        });

        let resolver = SymbolResolver::new(&g, &store, wf);
        let key = ExecutionKey::Call { scope: Scope::new("wf.A"), index: None };
        let v = resolver.resolve(&key, "greeting").await.unwrap();
        assert_eq!(v, Value::String("hi".into()));
    }

    #[tokio::test]
    async fn resolves_same_shard_call_output() {
        let wf = Uuid::new_v4();
        let store = seeded_store(wf).await;
        let shard_a = ExecutionKey::Call { scope: Scope::new("wf.scatter0.A"), index: Some(1) };
        let mut outputs = CallOutputs::new();
        outputs.insert("out".to_string(), Value::Int(42));
        store.set_outputs(wf, &shard_a, &outputs).await.unwrap();

        let mut g = StaticWorkflowGraph::new();
        g.add_scatter(ScatterNodeDecl {
            scope: Scope::new("wf.scatter0"),
            item_name: "x".into(),
            collection: Arc::new(IdentifierExpr("xs".into())),
            members: vec![Scope::new("wf.scatter0.A"), Scope::new("wf.scatter0.B")],
        });
        g.add_call(CallNode {
            scope: Scope::new("wf.scatter0.A"),
            inputs: vec![],
            task_outputs: vec!["out".into()],
        });
        g.add_call(CallNode {
            scope: Scope::new("wf.scatter0.B"),
            inputs: vec![CallInputDecl {
                name: "y".into(),
                expression: Arc::new(IdentifierExpr("A".into())),
                declared_type: "Int".into(),
            }],
            task_outputs: vec![],
        });

        let resolver = SymbolResolver::new(&g, &store, wf);
        let key = ExecutionKey::Call { scope: Scope::new("wf.scatter0.B"), index: Some(1) };
        let v = resolver.resolve(&key, "A").await.unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[tokio::test]
    async fn unresolved_identifier_errors() {
        let wf = Uuid::new_v4();
        let store = seeded_store(wf).await;
        let g = StaticWorkflowGraph::new();
        let resolver = SymbolResolver::new(&g, &store, wf);
        let key = ExecutionKey::Call { scope: Scope::new("wf.A"), index: None };
        let err = resolver.resolve(&key, "nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::UnresolvedIdentifier { .. }));
    }

    #[test]
    fn coerces_int_to_float_and_string() {
        assert_eq!(coerce(Value::Int(3), "Float").unwrap(), Value::Float(3.0));
        assert_eq!(coerce(Value::Int(3), "String").unwrap(), Value::String("3".into()));
        assert!(coerce(Value::Boolean(true), "Int").is_err());
    }
}
