use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Shard index inside a scatter body.
pub type ShardIndex = i64;

pub fn now_ms() -> Timestamp {
    chrono_now_ms()
}

#[cfg(feature = "postgres")]
fn chrono_now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(not(feature = "postgres"))]
fn chrono_now_ms() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Scope ────────────────────────────────────────────────────

/// Fully-qualified name of a node in the workflow graph, e.g. `"wf.scatter0.A"`.
/// Opaque to this crate beyond equality/ordering — produced and interpreted by
/// the external namespace/AST layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self(fqn.into())
    }

    pub fn fully_qualified_name(&self) -> &str {
        &self.0
    }

    /// The scope one level up the lexical nesting, if any (`"wf.scatter0.A"` -> `"wf.scatter0"`).
    pub fn parent(&self) -> Option<Scope> {
        self.0.rfind('.').map(|i| Scope(self.0[..i].to_string()))
    }

    /// True iff `self` is `other` or a descendant of `other` in the lexical tree.
    pub fn is_descendant_of_or_eq(&self, other: &Scope) -> bool {
        self.0 == other.0 || self.0.starts_with(&format!("{}.", other.0))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in the lexical scope tree that is specifically a scatter construct.
/// The namespace layer marks which scopes are scatters; everything the
/// Dependency Resolver and Symbol Resolver need to know about scatters is
/// summarized here rather than re-derived from the external AST.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatterNode {
    pub scope: Scope,
    /// Name of the per-shard loop variable, e.g. `x` in `scatter (x in xs)`.
    pub item_name: String,
}

// ─── ExecutionKey ─────────────────────────────────────────────

/// Uniquely identifies one unit of scheduled work within a workflow.
///
/// Invariant: within one workflow, `(scope.fully_qualified_name(), index())`
/// uniquely identifies a key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExecutionKey {
    /// A concrete task invocation. `index = Some(i)` when inside a scatter.
    Call { scope: Scope, index: Option<ShardIndex> },
    /// The scatter node itself.
    Scatter { scope: Scope, index: Option<ShardIndex> },
    /// Collects shards of a scattered call. Index is always absent.
    Collector { scope: Scope },
}

impl ExecutionKey {
    pub fn scope(&self) -> &Scope {
        match self {
            ExecutionKey::Call { scope, .. }
            | ExecutionKey::Scatter { scope, .. }
            | ExecutionKey::Collector { scope } => scope,
        }
    }

    pub fn index(&self) -> Option<ShardIndex> {
        match self {
            ExecutionKey::Call { index, .. } | ExecutionKey::Scatter { index, .. } => *index,
            ExecutionKey::Collector { .. } => None,
        }
    }

    pub fn is_collector(&self) -> bool {
        matches!(self, ExecutionKey::Collector { .. })
    }

    pub fn is_scatter(&self) -> bool {
        matches!(self, ExecutionKey::Scatter { .. })
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKey::Call { scope, index } => match index {
                Some(i) => write!(f, "Call({scope}[{i}])"),
                None => write!(f, "Call({scope})"),
            },
            ExecutionKey::Scatter { scope, index } => match index {
                Some(i) => write!(f, "Scatter({scope}[{i}])"),
                None => write!(f, "Scatter({scope})"),
            },
            ExecutionKey::Collector { scope } => write!(f, "Collector({scope})"),
        }
    }
}

// ─── ExecutionStatus ──────────────────────────────────────────

/// Ordered lifecycle of one `ExecutionKey`. A key only moves forward except
/// at explicit restart-driven rollbacks (see `workflow_fsm`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    NotStarted,
    Starting,
    Running,
    Done,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Done | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The durable form of an `ExecutionStatus`, with its backend return code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    pub status: ExecutionStatus,
    pub return_code: Option<i32>,
}

impl CallStatus {
    pub fn new(status: ExecutionStatus) -> Self {
        Self { status, return_code: None }
    }

    pub fn with_return_code(status: ExecutionStatus, return_code: i32) -> Self {
        Self { status, return_code: Some(return_code) }
    }
}

// ─── Value / Symbol ───────────────────────────────────────────

/// A resolved WDL-ish value. Arrays are how scatter collections and
/// collector outputs are represented; `File` carries a path so the
/// cache-hit copy machinery can re-root it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    File(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_file_path(&self) -> Option<&str> {
        match self {
            Value::File(p) => Some(p),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "Boolean",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::File(_) => "File",
            Value::Array(_) => "Array",
        }
    }
}

/// Written once at creation (inputs) or when a call produces outputs; never
/// mutated afterward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub scope: Scope,
    pub name: String,
    pub index: Option<ShardIndex>,
    pub is_input: bool,
    pub wdl_type: String,
    pub wdl_value: Option<Value>,
}

// ─── WorkflowDescriptor ───────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowOptions(pub BTreeMap<String, serde_json::Value>);

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

/// Immutable descriptor of a submitted workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub id: Uuid,
    /// Root namespace name, as assigned by the external parser/AST layer.
    pub namespace: String,
    pub workflow_options: WorkflowOptions,
}

/// Mapping from local output name to its resolved value.
pub type CallOutputs = BTreeMap<String, Value>;

// ─── JobPaths / Detritus ──────────────────────────────────────

/// Well-known detritus keys. `CallRootPathKey` is required on both sides of
/// a cache-hit copy; the rest are optional per-call bookkeeping files.
pub mod detritus_key {
    pub const CALL_ROOT_PATH: &str = "CallRootPathKey";
    pub const STDOUT: &str = "StdoutKey";
    pub const STDERR: &str = "StderrKey";
    pub const SCRIPT: &str = "ScriptKey";
    pub const RETURN_CODE: &str = "ReturnCodeKey";
}

/// File paths for a call's execution filesystem footprint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobPaths {
    pub call_root: String,
    /// Detritus key -> path.
    pub detritus: BTreeMap<String, String>,
}

// ─── Workflow lifecycle state ─────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Submitted,
    Running,
    Failed,
    Succeeded,
    Aborting,
    Aborted,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Failed | WorkflowState::Succeeded | WorkflowState::Aborted)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ─── Cache hit / blacklist ─────────────────────────────────────

/// Identifies a prior workflow's call invocation whose outputs are a
/// candidate for reuse.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheHitId(pub String);

impl fmt::Display for CacheHitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A storage bucket/prefix, derived from a file path, that a cache source
/// lives under. Granularity coarser than a single cache hit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketPrefix(pub String);

impl fmt::Display for BucketPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlacklistStatus {
    Untested,
    Good,
    Bad,
}

/// Flattened key-value form of a structured call output, as seen by the
/// cache-hit copy machinery (only file-valued outputs matter for copying).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Simpleton {
    pub output_name: String,
    pub source_path: String,
}

/// A previously computed call whose outputs are candidates for reuse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheHit {
    pub id: CacheHitId,
    pub source_call_root: Option<String>,
    pub source_detritus: BTreeMap<String, String>,
}

// ─── IoCommand ─────────────────────────────────────────────────

/// A command sent to the external I/O broker. Each command carries an
/// implicit single-response contract (`IoSuccess`/`IoFailAck`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCommand {
    Copy { src: String, dst: String },
    Touch { path: String },
}

impl IoCommand {
    pub fn destination(&self) -> Option<&str> {
        match self {
            IoCommand::Copy { dst, .. } => Some(dst),
            IoCommand::Touch { .. } => None,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            IoCommand::Copy { src, .. } => Some(src),
            IoCommand::Touch { path } => Some(path),
        }
    }
}

/// Resolution mode reported alongside a successful job, mirroring the
/// distinction between freshly executed and reused-from-cache results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultGenerationMode {
    Executed,
    CallCached,
}
