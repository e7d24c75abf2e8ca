//! Workflow execution core: dependency resolution, symbol resolution,
//! scatter/collector expansion, and the Workflow FSM that drives a
//! scientific-workflow task graph from submission to terminal state.

pub mod backend;
pub mod blacklist;
pub mod cache_copy;
pub mod call_runner;
pub mod collector;
pub mod error;
pub mod events;
pub mod graph;
pub mod io_client;
pub mod resolver;
pub mod scatter;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod symbol;
pub mod types;
pub mod workflow_fsm;

pub use backend::{Backend, CallInputs, CallOutcome, JobKey};
pub use blacklist::{extract_blacklist_prefix, BlacklistCache};
pub use cache_copy::{CacheCopyFsm, CacheCopyHooks, CacheCopyOutcome, CopyOutputsCommand, NoopHooks};
pub use call_runner::{CallRunner, CallRunnerOutcome};
pub use collector::{collect_from_store, Collector, CollectorOutcome};
pub use error::{BlacklistSkipReason, Result, WorkflowError};
pub use events::{CopyingOutputsFailedResponse, JobAbortedResponse, JobSucceededResponse, LoggedEvent, RuntimeEvent};
pub use graph::{
    ArrayLiteralExpr, CallInputDecl, CallNode, DeclarationNode, Expression, IdentifierExpr,
    LiteralExpr, ScatterNodeDecl, StaticWorkflowGraph, WorkflowGraph,
};
pub use io_client::{IoClient, IoResponse};
pub use resolver::DependencyResolver;
pub use scatter::{ScatterExpander, ScatterExpansion};
pub use store::DataAccess;
pub use store_memory::InMemoryDataAccess;
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresDataAccess;
pub use symbol::{coerce, SymbolResolver};
pub use types::{
    BlacklistStatus, BucketPrefix, CacheHit, CacheHitId, CallOutputs, CallStatus, ExecutionKey,
    ExecutionStatus, IoCommand, JobPaths, ResultGenerationMode, Scope, Simpleton, Symbol, Value,
    WorkflowDescriptor, WorkflowOptions, WorkflowState,
};
pub use workflow_fsm::{InitMode, WorkflowFsm, WorkflowHandle, WorkflowMsg};
