use crate::error::{Result, WorkflowError};
use crate::types::{Scope, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// An expression from the external workflow language. Evaluation resolves
/// its free identifiers through the supplied `lookup` closure — the Symbol
/// Resolver (`symbol::resolve`) is what typically builds that closure.
pub trait Expression: Send + Sync + std::fmt::Debug + std::any::Any {
    fn evaluate(&self, lookup: &dyn Fn(&str) -> Result<Value>) -> Result<Value>;

    /// Supports the best-effort identifier extraction `StaticWorkflowGraph`
    /// uses to derive dependency edges without a real parser.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// `x` — resolves a bare identifier through `lookup`.
#[derive(Debug, Clone)]
pub struct IdentifierExpr(pub String);

impl Expression for IdentifierExpr {
    fn evaluate(&self, lookup: &dyn Fn(&str) -> Result<Value>) -> Result<Value> {
        lookup(&self.0)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A constant value, independent of any lookup.
#[derive(Debug, Clone)]
pub struct LiteralExpr(pub Value);

impl Expression for LiteralExpr {
    fn evaluate(&self, _lookup: &dyn Fn(&str) -> Result<Value>) -> Result<Value> {
        Ok(self.0.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// `[e0, e1, ...]` — evaluates each element against the same lookup.
#[derive(Debug)]
pub struct ArrayLiteralExpr(pub Vec<Arc<dyn Expression>>);

impl Expression for ArrayLiteralExpr {
    fn evaluate(&self, lookup: &dyn Fn(&str) -> Result<Value>) -> Result<Value> {
        let values = self
            .0
            .iter()
            .map(|e| e.evaluate(lookup))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(values))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A declared call input: its name, the expression bound to it, and its
/// declared type (used for the coercion step after resolution).
#[derive(Clone)]
pub struct CallInputDecl {
    pub name: String,
    pub expression: Arc<dyn Expression>,
    pub declared_type: String,
}

/// Everything the Workflow Execution Core needs to know about one call node
/// (task invocation) in the workflow graph, without understanding the
/// language that produced it.
#[derive(Clone)]
pub struct CallNode {
    pub scope: Scope,
    pub inputs: Vec<CallInputDecl>,
    pub task_outputs: Vec<String>,
}

/// Everything needed about a scatter node.
#[derive(Clone)]
pub struct ScatterNodeDecl {
    pub scope: Scope,
    pub item_name: String,
    pub collection: Arc<dyn Expression>,
    /// Calls (and nested scatters) lexically inside this scatter's body.
    pub members: Vec<Scope>,
}

/// A plain value declaration (`Int x = 5`, or a workflow input).
#[derive(Clone)]
pub struct DeclarationNode {
    pub scope: Scope,
    pub name: String,
    pub expression: Arc<dyn Expression>,
}

/// The external workflow graph (AST) as consumed by the core — a `Namespace`
/// in the language the distilled spec was drawn from. Out of scope to
/// *build* (that's the parser's job); this crate only ever reads it through
/// the query methods below.
pub trait WorkflowGraph: Send + Sync {
    /// Scopes whose completion `scope` depends on (direct call/declaration
    /// dependencies, before scatter/collector shard-alignment is applied).
    fn prerequisite_scopes(&self, scope: &Scope) -> Vec<Scope>;

    fn is_scatter(&self, scope: &Scope) -> bool;

    fn is_collector_target(&self, scope: &Scope) -> bool;

    /// Ancestor scatter nodes of `scope`, nearest first. Used both by the
    /// Dependency Resolver (shard alignment) and the Symbol Resolver
    /// (precedence rule 1).
    fn scatter_ancestors(&self, scope: &Scope) -> Vec<ScatterNodeDecl>;

    fn scatter_node(&self, scope: &Scope) -> Option<ScatterNodeDecl>;

    fn call_node(&self, scope: &Scope) -> Option<CallNode>;

    fn declaration_node(&self, scope: &Scope) -> Option<DeclarationNode>;

    /// Resolve a bare name to a call scope, searching outward from
    /// `resolving_scope` the way an identifier would be looked up lexically.
    fn find_call_by_name(&self, resolving_scope: &Scope, name: &str) -> Option<Scope>;

    fn find_declaration_by_name(&self, resolving_scope: &Scope, name: &str) -> Option<Scope>;

    /// Resolve `name` as an imported namespace alias (`import "x.wdl" as name`)
    /// visible from `resolving_scope`, returning the scope of the aliased
    /// call or declaration. A real parser layer owns alias bookkeeping;
    /// `StaticWorkflowGraph` has none to offer, so the default is `None`.
    fn imported_namespace_scope(&self, _resolving_scope: &Scope, _name: &str) -> Option<Scope> {
        None
    }

    /// The closest scope that is an ancestor of (or equal to) both `a` and `b`.
    fn closest_common_ancestor(&self, a: &Scope, b: &Scope) -> Scope;
}

/// A hand-built `WorkflowGraph`, used by the in-process test scenarios and
/// the demo binary. A production system would implement `WorkflowGraph`
/// directly over its parsed AST instead of materializing this struct.
#[derive(Default)]
pub struct StaticWorkflowGraph {
    calls: BTreeMap<Scope, CallNode>,
    scatters: BTreeMap<Scope, ScatterNodeDecl>,
    declarations: BTreeMap<Scope, DeclarationNode>,
    collector_targets: std::collections::BTreeSet<Scope>,
}

impl StaticWorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_call(&mut self, node: CallNode) -> &mut Self {
        self.calls.insert(node.scope.clone(), node);
        self
    }

    pub fn add_scatter(&mut self, node: ScatterNodeDecl) -> &mut Self {
        self.scatters.insert(node.scope.clone(), node);
        self
    }

    pub fn add_declaration(&mut self, node: DeclarationNode) -> &mut Self {
        self.declarations.insert(node.scope.clone(), node);
        self
    }

    pub fn mark_collector_target(&mut self, scope: Scope) -> &mut Self {
        self.collector_targets.insert(scope);
        self
    }

    fn ancestors(&self, scope: &Scope) -> Vec<Scope> {
        let mut out = Vec::new();
        let mut current = scope.parent();
        while let Some(p) = current {
            out.push(p.clone());
            current = p.parent();
        }
        out
    }
}

impl WorkflowGraph for StaticWorkflowGraph {
    fn prerequisite_scopes(&self, scope: &Scope) -> Vec<Scope> {
        if let Some(call) = self.calls.get(scope) {
            let mut deps = std::collections::BTreeSet::new();
            for input in &call.inputs {
                collect_identifier_scopes(self, scope, input.expression.as_ref(), &mut deps);
            }
            deps.into_iter().collect()
        } else if let Some(scatter) = self.scatters.get(scope) {
            let mut deps = std::collections::BTreeSet::new();
            collect_identifier_scopes(self, scope, scatter.collection.as_ref(), &mut deps);
            deps.into_iter().collect()
        } else {
            Vec::new()
        }
    }

    fn is_scatter(&self, scope: &Scope) -> bool {
        self.scatters.contains_key(scope)
    }

    fn is_collector_target(&self, scope: &Scope) -> bool {
        self.collector_targets.contains(scope)
    }

    fn scatter_ancestors(&self, scope: &Scope) -> Vec<ScatterNodeDecl> {
        self.ancestors(scope)
            .into_iter()
            .filter_map(|a| self.scatters.get(&a).cloned())
            .collect()
    }

    fn scatter_node(&self, scope: &Scope) -> Option<ScatterNodeDecl> {
        self.scatters.get(scope).cloned()
    }

    fn call_node(&self, scope: &Scope) -> Option<CallNode> {
        self.calls.get(scope).cloned()
    }

    fn declaration_node(&self, scope: &Scope) -> Option<DeclarationNode> {
        self.declarations.get(scope).cloned()
    }

    fn find_call_by_name(&self, resolving_scope: &Scope, name: &str) -> Option<Scope> {
        let mut search = resolving_scope.clone();
        loop {
            let parent = match search.parent() {
                Some(p) => p,
                None => return None,
            };
            let candidate = Scope::new(format!("{}.{}", parent.fully_qualified_name(), name));
            if self.calls.contains_key(&candidate) {
                return Some(candidate);
            }
            search = parent;
        }
    }

    fn find_declaration_by_name(&self, resolving_scope: &Scope, name: &str) -> Option<Scope> {
        let mut search = resolving_scope.clone();
        loop {
            let parent = match search.parent() {
                Some(p) => p,
                None => return None,
            };
            let candidate = Scope::new(format!("{}.{}", parent.fully_qualified_name(), name));
            if self.declarations.contains_key(&candidate) {
                return Some(candidate);
            }
            search = parent;
        }
    }

    fn closest_common_ancestor(&self, a: &Scope, b: &Scope) -> Scope {
        let mut a_chain: Vec<Scope> = std::iter::once(a.clone()).chain(self.ancestors(a)).collect();
        a_chain.reverse();
        let mut b_chain: Vec<Scope> = std::iter::once(b.clone()).chain(self.ancestors(b)).collect();
        b_chain.reverse();
        let mut common = a_chain[0].clone();
        for (x, y) in a_chain.iter().zip(b_chain.iter()) {
            if x == y {
                common = x.clone();
            } else {
                break;
            }
        }
        common
    }
}

/// Best-effort identifier extraction used by `StaticWorkflowGraph` to derive
/// `prerequisite_scopes` from an input expression without a real parser:
/// walks the expression looking for `IdentifierExpr`s it recognizes via
/// downcasting, then maps each name to the scope that defines it.
fn collect_identifier_scopes(
    graph: &StaticWorkflowGraph,
    resolving_scope: &Scope,
    expr: &dyn Expression,
    out: &mut std::collections::BTreeSet<Scope>,
) {
    if let Some(ident) = expr.as_any().downcast_ref::<IdentifierExpr>() {
        if let Some(call_scope) = graph.find_call_by_name(resolving_scope, &ident.0) {
            out.insert(call_scope);
        } else if let Some(decl_scope) = graph.find_declaration_by_name(resolving_scope, &ident.0)
        {
            out.insert(decl_scope);
        }
    }
}

pub fn expression_error(message: impl Into<String>) -> WorkflowError {
    WorkflowError::Expression(message.into())
}
