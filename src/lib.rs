//! # acm-core
//!
//! The Agentic Contract Model (ACM) runtime: a deterministic execution
//! engine for task graphs produced by an LLM planner. Plans run under a
//! per-task reasoning nucleus and an external policy engine, with every
//! decision recorded in an append-only ledger so runs can be audited,
//! resumed, and replayed.
//!
//! ## Core Components
//!
//! - **Context**: content-addressed goal/context/artifact packets
//! - **Ledger**: append-only execution events with JSONL export
//! - **Plan**: task graphs with guarded edges and retry policies
//! - **Expr**: safe guard/verification expression interpreter
//! - **Nucleus**: `preflight -> invoke -> postcheck` reasoning lifecycle
//! - **Retrieval**: directive-to-provider context fulfillment
//! - **Executor**: deterministic topological scheduling
//! - **Checkpoint/Resume**: restartable runs from task boundaries
//!
//! ## Example
//!
//! ```rust,ignore
//! use acm_core::{
//!     Context, ExecuteRequest, Goal, Plan, PlanExecutor, TaskSpec, EdgeSpec,
//! };
//!
//! let plan = Plan::new("p1", context.context_ref())
//!     .with_task(TaskSpec::new("t1", "search"))
//!     .with_task(TaskSpec::new("t2", "summarize"))
//!     .with_edge(EdgeSpec::new("t1", "t2"));
//!
//! let executor = PlanExecutor::builder().capabilities(registry).build();
//! let report = executor.execute(ExecuteRequest::new(goal, context, plan)).await?;
//! println!("{}", report.ledger.len());
//! ```

pub mod checkpoint;
pub mod context;
pub mod error;
pub mod executor;
pub mod expr;
pub mod ledger;
pub mod llm;
pub mod nucleus;
pub mod plan;
pub mod policy;
pub mod registry;
pub mod resume;
pub mod retrieval;
pub mod scope;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
#[cfg(feature = "sqlite")]
pub use checkpoint::SqliteCheckpointStore;
pub use context::{Artifact, Context, Goal};
pub use error::{Error, Result};
pub use executor::{
    CancellationToken, ExecuteRequest, ExecutionFailure, ExecutionReport, PlanExecutor,
    PlanExecutorBuilder, RunConfig, RunContext, RunMetrics, TaskOutput, TaskRecord, TaskStatus,
};
pub use expr::{eval_bool, Expr, ExprRoots, ExprValue};
pub use ledger::{
    Ledger, LedgerEntry, LedgerEventType, LedgerExportFormat, LedgerSink, SharedLedger,
};
pub use llm::{LlmCall, LlmConfig, LlmRequest, LlmResponse, LlmToolCall, LlmToolSpec};
pub use nucleus::{
    estimate_tokens, DefaultNucleusHooks, Nucleus, NucleusBinding, NucleusConfig, NucleusHooks,
    NucleusMetrics, NucleusRun, PostcheckOutcome, PreflightOutcome,
};
pub use plan::{Backoff, EdgeSpec, Plan, RetryPolicy, TaskSpec};
pub use policy::{AllowAllPolicy, PolicyAction, PolicyDecision, PolicyEngine, PolicyLimits};
pub use registry::{
    Capability, CapabilityInfo, CapabilityRegistry, FnTool, Tool, ToolRegistry,
};
pub use resume::ResumableRunner;
pub use retrieval::{
    ContextProvider, ContextRetrievalPipeline, DirectiveResult, DirectiveStatus, FulfillmentReport,
};
pub use scope::{InsertOutcome, InternalContextScope, ScopeSnapshot};
