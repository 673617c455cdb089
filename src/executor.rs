//! Plan executor: deterministic scheduling of a task graph.
//!
//! Tasks run sequentially in a topological order with ascending-id
//! tie-breaks, so the ledger of a run is a deterministic linear extension
//! of the plan's happens-before relation. Each task passes through guard
//! eligibility, nucleus preflight, policy pre-check, retrying execution,
//! verification, policy post-check, and nucleus postcheck; every decision
//! lands in the ledger before the run moves on.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::{Context, Goal};
use crate::error::{Error, Result};
use crate::expr::{self, ExprRoots};
use crate::ledger::{append_shared, Ledger, LedgerEntry, LedgerEventType, SharedLedger};
use crate::llm::{LlmCall, LlmConfig, LlmRequest, LlmResponse};
use crate::nucleus::{
    DefaultNucleusHooks, Nucleus, NucleusBinding, NucleusConfig, NucleusHooks, PostcheckOutcome,
    PreflightOutcome, SharedContext,
};
use crate::plan::{Plan, RetryPolicy, TaskSpec};
use crate::policy::{PolicyAction, PolicyEngine};
use crate::registry::{CapabilityRegistry, Tool, ToolRegistry};
use crate::retrieval::ContextRetrievalPipeline;
use crate::scope::{InternalContextScope, ScopeSnapshot};

/// Cooperative cancellation token. Cheap to clone; cancelling between
/// tasks stops the run immediately, and running tasks observe the token
/// through their [`RunContext`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

/// Per-task execution state, terminal on success, failure, or skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
}

impl TaskRecord {
    fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempt: 0,
            output: None,
            error: None,
            narrative: None,
        }
    }
}

/// Output recorded for a task that ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks_skipped: usize,
    pub retries: usize,
}

/// Everything a completed (or aborted) run hands back.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub run_id: String,
    /// Output per task that was not skipped and did not fail
    pub outputs_by_task: BTreeMap<String, TaskOutput>,
    pub task_records: BTreeMap<String, TaskRecord>,
    /// Complete ledger prefix at the time the report was built
    pub ledger: Vec<LedgerEntry>,
    /// The active context after all promotions
    pub context: Context,
    pub metrics: RunMetrics,
}

impl ExecutionReport {
    /// Entries of a given event type, in ledger order.
    pub fn entries_of(&self, event_type: LedgerEventType) -> Vec<&LedgerEntry> {
        self.ledger
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

/// Aggregate failure: the error plus the partial report accumulated before
/// the run aborted. Callers resume by re-invoking from the last checkpoint.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: Error,
    pub report: ExecutionReport,
}

impl ExecutionFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for ExecutionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Read-only view of the run a capability executes inside.
pub struct RunContext {
    run_id: String,
    task_id: String,
    goal: Goal,
    context: Context,
    outputs: BTreeMap<String, TaskOutput>,
    cancellation: CancellationToken,
    tools: Arc<ToolRegistry>,
    allowed_tools: Vec<String>,
    nucleus: Arc<tokio::sync::Mutex<Nucleus>>,
    narrative: Mutex<Option<String>>,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    /// Context snapshot taken when the task became eligible.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Output of an upstream task, if it produced one.
    pub fn output(&self, task_id: &str) -> Option<&TaskOutput> {
        self.outputs.get(task_id)
    }

    /// All upstream outputs recorded so far.
    pub fn outputs(&self) -> &BTreeMap<String, TaskOutput> {
        &self.outputs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Resolve a tool, honoring the task's allowed set. An empty allowed
    /// set means every registered tool is available.
    pub fn tool(&self, name: &str) -> Result<Arc<dyn Tool>> {
        if !self.allowed_tools.is_empty() && !self.allowed_tools.iter().any(|t| t == name) {
            return Err(Error::tool(name, "not in the task's allowed tool set"));
        }
        self.tools
            .get(name)
            .ok_or_else(|| Error::tool(name, "not registered"))
    }

    /// The task's nucleus. Not re-entrant: hold the lock for the duration
    /// of each `invoke`.
    pub fn nucleus(&self) -> &Arc<tokio::sync::Mutex<Nucleus>> {
        &self.nucleus
    }

    /// Record a human-readable narrative stored alongside the output.
    pub fn set_narrative(&self, narrative: impl Into<String>) {
        *self.narrative.lock().expect("narrative lock poisoned") = Some(narrative.into());
    }

    fn take_narrative(&self) -> Option<String> {
        self.narrative.lock().expect("narrative lock poisoned").take()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// Run-level configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Stable id for resumable runs; generated when absent
    pub run_id: Option<String>,
    /// Completed tasks between checkpoints
    pub checkpoint_interval: u64,
    /// Nucleus prompt budget
    pub max_context_tokens: usize,
    /// Nucleus tool-call rounds per invoke
    pub max_query_rounds: u32,
    /// Preflight retrieval rounds before a task fails with
    /// `ContextUnavailable`
    pub preflight_rounds: u32,
    /// Per-task timeout
    pub task_timeout_ms: u64,
    /// Retry policy for tasks that do not declare one
    pub default_retry: RetryPolicy,
    /// Model selection passed to the nucleus
    pub llm: LlmConfig,
    /// Run-level tool allowlist, unioned with each task's `tools`
    pub allowed_tools: Vec<String>,
    /// Scope budgets
    pub scope_max_artifacts: usize,
    pub scope_max_bytes: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            checkpoint_interval: 1,
            max_context_tokens: 32_768,
            max_query_rounds: 25,
            preflight_rounds: 3,
            task_timeout_ms: 30_000,
            default_retry: RetryPolicy::default(),
            llm: LlmConfig::default(),
            allowed_tools: Vec::new(),
            scope_max_artifacts: InternalContextScope::DEFAULT_MAX_ARTIFACTS,
            scope_max_bytes: InternalContextScope::DEFAULT_MAX_BYTES,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn with_task_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = timeout_ms;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn with_max_query_rounds(mut self, rounds: u32) -> Self {
        self.max_query_rounds = rounds;
        self
    }

    pub fn with_llm_config(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_allowed_tool(mut self, tool: impl Into<String>) -> Self {
        self.allowed_tools.push(tool.into());
        self
    }
}

/// One execution request.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub goal: Goal,
    pub context: Context,
    pub plan: Plan,
    pub cancellation: CancellationToken,
}

impl ExecuteRequest {
    pub fn new(goal: Goal, context: Context, plan: Plan) -> Self {
        Self {
            goal,
            context,
            plan,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// State restored from a checkpoint, consumed by the resume path.
#[derive(Debug, Clone)]
pub(crate) struct ResumeSeed {
    pub checkpoint_id: String,
    pub completed_outputs: BTreeMap<String, TaskOutput>,
    pub ledger_prefix: Vec<LedgerEntry>,
    pub scope_snapshot: ScopeSnapshot,
}

/// Placeholder LLM for runs whose capabilities never reason.
struct UnconfiguredLlm;

#[async_trait::async_trait]
impl LlmCall for UnconfiguredLlm {
    async fn call(&self, _request: LlmRequest) -> Result<LlmResponse> {
        Err(Error::Llm("no LLM call configured for this executor".into()))
    }
}

/// Builder for [`PlanExecutor`].
pub struct PlanExecutorBuilder {
    capabilities: Arc<CapabilityRegistry>,
    tools: Arc<ToolRegistry>,
    pipeline: Arc<ContextRetrievalPipeline>,
    policy: Option<Arc<dyn PolicyEngine>>,
    llm: Arc<dyn LlmCall>,
    hooks: Arc<dyn NucleusHooks>,
    config: RunConfig,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl Default for PlanExecutorBuilder {
    fn default() -> Self {
        Self {
            capabilities: Arc::new(CapabilityRegistry::new()),
            tools: Arc::new(ToolRegistry::new()),
            pipeline: Arc::new(ContextRetrievalPipeline::new()),
            policy: None,
            llm: Arc::new(UnconfiguredLlm),
            hooks: Arc::new(DefaultNucleusHooks),
            config: RunConfig::default(),
            checkpoint_store: None,
        }
    }
}

impl PlanExecutorBuilder {
    pub fn capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.capabilities = registry;
        self
    }

    pub fn tools(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tools = registry;
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<ContextRetrievalPipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmCall>) -> Self {
        self.llm = llm;
        self
    }

    pub fn nucleus_hooks(mut self, hooks: Arc<dyn NucleusHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn build(self) -> PlanExecutor {
        PlanExecutor {
            capabilities: self.capabilities,
            tools: self.tools,
            pipeline: self.pipeline,
            policy: self.policy,
            llm: self.llm,
            hooks: self.hooks,
            config: self.config,
            checkpoint_store: self.checkpoint_store,
        }
    }
}

/// Executes plans. A value, not a singleton: every run is parameterized
/// entirely by its request, and the executor can be reused across runs.
pub struct PlanExecutor {
    capabilities: Arc<CapabilityRegistry>,
    tools: Arc<ToolRegistry>,
    pipeline: Arc<ContextRetrievalPipeline>,
    policy: Option<Arc<dyn PolicyEngine>>,
    llm: Arc<dyn LlmCall>,
    hooks: Arc<dyn NucleusHooks>,
    config: RunConfig,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl PlanExecutor {
    pub fn builder() -> PlanExecutorBuilder {
        PlanExecutorBuilder::default()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute a plan to completion.
    pub async fn execute(
        &self,
        request: ExecuteRequest,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        self.run(request, None).await
    }

    pub(crate) async fn run(
        &self,
        request: ExecuteRequest,
        seed: Option<ResumeSeed>,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        let run_id = self
            .config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4()));
        let ExecuteRequest {
            goal,
            context,
            plan,
            cancellation,
        } = request;

        let ledger: SharedLedger = match &seed {
            Some(seed) => crate::ledger::shared(Ledger::from_entries(seed.ledger_prefix.clone())),
            None => crate::ledger::shared(Ledger::new()),
        };
        let context: SharedContext = Arc::new(Mutex::new(context));

        let mut state = RunState {
            run_id: run_id.clone(),
            records: plan
                .tasks
                .iter()
                .map(|t| (t.id.clone(), TaskRecord::pending()))
                .collect(),
            outputs: BTreeMap::new(),
            policy_decisions: BTreeMap::new(),
            metrics: RunMetrics::default(),
            completed: 0,
            carry_scope: None,
        };

        if let Err(e) = plan.validate(&self.capabilities) {
            append_shared(
                &ledger,
                LedgerEventType::Error,
                json!({"kind": e.kind(), "details": e.to_string()}),
            );
            return Err(self.fail(e, &state, &ledger, &context));
        }

        if let Some(policy) = &self.policy {
            match policy
                .evaluate(
                    PolicyAction::PlanAdmit,
                    json!({"plan_id": plan.id, "goal_id": goal.id, "tasks": plan.tasks.len()}),
                )
                .await
            {
                Ok(decision) => {
                    if !decision.allow {
                        append_shared(
                            &ledger,
                            LedgerEventType::PolicyPre,
                            json!({
                                "action": PolicyAction::PlanAdmit.to_string(),
                                "plan_id": plan.id,
                                "allowed": false,
                                "reason": decision.reason,
                            }),
                        );
                        let e = Error::policy_denied(
                            "",
                            PolicyAction::PlanAdmit.to_string(),
                            decision.reason.unwrap_or_else(|| "plan rejected".into()),
                        );
                        append_shared(
                            &ledger,
                            LedgerEventType::Error,
                            json!({"kind": e.kind(), "details": e.to_string()}),
                        );
                        return Err(self.fail(e, &state, &ledger, &context));
                    }
                }
                Err(e) => {
                    append_shared(
                        &ledger,
                        LedgerEventType::Error,
                        json!({"kind": e.kind(), "details": e.to_string()}),
                    );
                    return Err(self.fail(e, &state, &ledger, &context));
                }
            }
        }

        match &seed {
            None => {
                append_shared(
                    &ledger,
                    LedgerEventType::PlanSelected,
                    json!({
                        "plan_id": plan.id,
                        "context_ref": plan.context_ref,
                        "capability_map_version": plan.capability_map_version,
                        "rationale": plan.rationale,
                        "run_id": run_id,
                    }),
                );
            }
            Some(seed) => {
                for (task_id, output) in &seed.completed_outputs {
                    if let Some(record) = state.records.get_mut(task_id) {
                        record.status = TaskStatus::Succeeded;
                        record.output = Some(output.output.clone());
                        record.narrative = output.narrative.clone();
                    }
                }
                state.outputs = seed.completed_outputs.clone();
                state.completed = seed.completed_outputs.len() as u64;
                state.carry_scope = Some(seed.scope_snapshot.clone());
                append_shared(
                    &ledger,
                    LedgerEventType::TaskResumed,
                    json!({
                        "checkpoint_id": seed.checkpoint_id,
                        "completed": seed.completed_outputs.keys().collect::<Vec<_>>(),
                    }),
                );
            }
        }

        let order = match plan.topological_order() {
            Ok(order) => order,
            Err(e) => return Err(self.fail(e, &state, &ledger, &context)),
        };

        for task_id in order {
            if cancellation.is_cancelled() {
                let e = Error::Cancelled;
                append_shared(
                    &ledger,
                    LedgerEventType::Error,
                    json!({"kind": e.kind(), "details": e.to_string()}),
                );
                return Err(self.fail(e, &state, &ledger, &context));
            }
            if state.records[&task_id].status == TaskStatus::Succeeded {
                continue; // restored from checkpoint
            }
            let task = plan
                .task(&task_id)
                .expect("topological order only yields plan tasks");

            // 1. Eligibility: any admissible incoming edge keeps the task
            // alive; a task with none is skipped.
            let incoming = plan.incoming_edges(&task_id);
            if !incoming.is_empty() {
                let mut admitted = false;
                for edge in &incoming {
                    match &edge.guard {
                        None => {
                            // implicit guard: the source task succeeded
                            let source_ok = state
                                .records
                                .get(&edge.from)
                                .map(|r| r.status == TaskStatus::Succeeded)
                                .unwrap_or(false);
                            append_shared(
                                &ledger,
                                LedgerEventType::GuardEval,
                                json!({
                                    "from": edge.from,
                                    "to": edge.to,
                                    "guard": Value::Null,
                                    "result": source_ok,
                                }),
                            );
                            admitted |= source_ok;
                        }
                        Some(guard) => {
                            let roots = state.guard_roots(&context);
                            match expr::eval_bool(guard, &roots) {
                                Ok(value) => {
                                    append_shared(
                                        &ledger,
                                        LedgerEventType::GuardEval,
                                        json!({
                                            "from": edge.from,
                                            "to": edge.to,
                                            "guard": guard,
                                            "result": value,
                                        }),
                                    );
                                    admitted |= value;
                                }
                                Err(e) => {
                                    append_shared(
                                        &ledger,
                                        LedgerEventType::Error,
                                        json!({
                                            "kind": e.kind(),
                                            "task_id": task_id,
                                            "details": e.to_string(),
                                        }),
                                    );
                                    return Err(self.fail(e, &state, &ledger, &context));
                                }
                            }
                        }
                    }
                }
                if !admitted {
                    let record = state.records.get_mut(&task_id).expect("record exists");
                    record.status = TaskStatus::Skipped;
                    state.metrics.tasks_skipped += 1;
                    state.completed += 1;
                    if let Err(failure) = self
                        .maybe_checkpoint(&mut state, &goal, &plan, &ledger, &context)
                        .await
                    {
                        return Err(failure);
                    }
                    continue;
                }
            }

            // 2-9. Run the task.
            match self
                .run_task(task, &goal, &plan, &mut state, &ledger, &context, &cancellation)
                .await
            {
                Ok(()) => {}
                Err(TaskFatal { error, run_fatal }) => {
                    state.completed += 1;
                    if let Err(failure) = self
                        .maybe_checkpoint(&mut state, &goal, &plan, &ledger, &context)
                        .await
                    {
                        return Err(failure);
                    }
                    if run_fatal {
                        return Err(self.fail(error, &state, &ledger, &context));
                    }
                    // a guarded downstream path exists; keep scheduling
                    let admits = self.failure_admits_downstream(&plan, &task_id, &state, &context);
                    if !admits {
                        return Err(self.fail(error, &state, &ledger, &context));
                    }
                    continue;
                }
            }

            state.completed += 1;
            if let Err(failure) = self
                .maybe_checkpoint(&mut state, &goal, &plan, &ledger, &context)
                .await
            {
                return Err(failure);
            }
        }

        Ok(self.report(&state, &ledger, &context))
    }

    /// Whether any outgoing guarded edge of a failed task currently admits
    /// a downstream path (a compensation route).
    fn failure_admits_downstream(
        &self,
        plan: &Plan,
        task_id: &str,
        state: &RunState,
        context: &SharedContext,
    ) -> bool {
        let roots = state.guard_roots(context);
        plan.outgoing_edges(task_id).iter().any(|edge| {
            edge.guard
                .as_deref()
                .map(|guard| expr::eval_bool(guard, &roots).unwrap_or(false))
                .unwrap_or(false)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        task: &TaskSpec,
        goal: &Goal,
        plan: &Plan,
        state: &mut RunState,
        ledger: &SharedLedger,
        context: &SharedContext,
        cancellation: &CancellationToken,
    ) -> std::result::Result<(), TaskFatal> {
        let task_id = task.id.clone();
        let capability = match self.capabilities.resolve(&task.capability) {
            Ok(capability) => capability,
            Err(e) => return Err(state.task_fatal(&task_id, task, e, false, ledger)),
        };

        // 3. Nucleus construction: fresh scope (or the checkpointed
        // carryover on the first resumed task), appends mirrored to the
        // ledger through the retrieval pipeline.
        let scope = match state.carry_scope.take() {
            Some(snapshot) => InternalContextScope::restore(
                snapshot,
                self.config.scope_max_artifacts,
                self.config.scope_max_bytes,
            ),
            None => InternalContextScope::with_budgets(
                self.config.scope_max_artifacts,
                self.config.scope_max_bytes,
            ),
        };
        let mut allowed_tools = self.config.allowed_tools.clone();
        allowed_tools.extend(task.tools.iter().cloned());
        let binding = NucleusBinding {
            goal_id: goal.id.clone(),
            plan_id: plan.id.clone(),
            task_id: task_id.clone(),
            context_ref: context.lock().expect("context lock poisoned").context_ref(),
            allowed_tools: allowed_tools.clone(),
        };
        let nucleus = Nucleus::new(
            binding,
            scope,
            self.hooks.clone(),
            self.llm.clone(),
            NucleusConfig {
                max_context_tokens: self.config.max_context_tokens,
                max_query_rounds: self.config.max_query_rounds,
                llm: self.config.llm.clone(),
            },
            ledger.clone(),
            context.clone(),
        )
        .with_pipeline(self.pipeline.clone());
        let nucleus = Arc::new(tokio::sync::Mutex::new(nucleus));

        // 4. Preflight loop: bounded retrieval rounds.
        let mut round = 0;
        let unresolved = loop {
            let outcome = nucleus.lock().await.preflight();
            match outcome {
                PreflightOutcome::Ready => break None,
                PreflightOutcome::NeedsContext(directives) => {
                    if round >= self.config.preflight_rounds {
                        break Some(directives);
                    }
                    round += 1;
                    nucleus.lock().await.fulfill_directives(&directives).await;
                }
            }
        };
        if let Some(directives) = unresolved {
            let e = Error::ContextUnavailable {
                task_id: task_id.clone(),
                directives,
            };
            return Err(state.task_fatal(&task_id, task, e, false, ledger));
        }

        // 5. Policy pre-check.
        let mut retry = task.retry.unwrap_or(self.config.default_retry);
        let mut timeout_ms = self.config.task_timeout_ms;
        if let Some(policy) = &self.policy {
            let payload = json!({
                "action": task.capability,
                "task_id": task_id,
                "input": task.input,
                "context": context.lock().expect("context lock poisoned").facts_value(),
            });
            let decision = match policy.evaluate(PolicyAction::TaskPre, payload).await {
                Ok(decision) => decision,
                Err(e) => return Err(state.task_fatal(&task_id, task, e, false, ledger)),
            };
            append_shared(
                ledger,
                LedgerEventType::PolicyPre,
                json!({
                    "task_id": task_id,
                    "action": PolicyAction::TaskPre.to_string(),
                    "allowed": decision.allow,
                    "reason": decision.reason,
                }),
            );
            state
                .policy_decisions
                .insert(task_id.clone(), decision.to_value());
            if !decision.allow {
                let e = Error::policy_denied(
                    task_id.clone(),
                    PolicyAction::TaskPre.to_string(),
                    decision.reason.unwrap_or_else(|| "denied".into()),
                );
                return Err(state.task_fatal(&task_id, task, e, false, ledger));
            }
            if let Some(limits) = decision.limits {
                if let Some(t) = limits.timeout_ms {
                    timeout_ms = timeout_ms.min(t);
                }
                if let Some(r) = limits.retries {
                    retry.attempts = retry.attempts.min(r.max(1));
                }
            }
        }

        // 6. Execution with retry and timeout.
        append_shared(
            ledger,
            LedgerEventType::TaskStart,
            json!({"task_id": task_id, "capability": task.capability}),
        );
        if let Some(record) = state.records.get_mut(&task_id) {
            record.status = TaskStatus::Running;
        }
        let run_ctx = RunContext {
            run_id: state.run_id.clone(),
            task_id: task_id.clone(),
            goal: goal.clone(),
            context: context.lock().expect("context lock poisoned").clone(),
            outputs: state.outputs.clone(),
            cancellation: cancellation.clone(),
            tools: self.tools.clone(),
            allowed_tools,
            nucleus: nucleus.clone(),
            narrative: Mutex::new(None),
        };

        let mut attempt: u32 = 1;
        let output = loop {
            let attempt_result = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                capability.execute(&run_ctx, task.input.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(timeout_ms)),
            };

            match attempt_result {
                Ok(output) => break Ok(output),
                Err(e) => {
                    if attempt >= retry.attempts || !e.is_retryable() {
                        break Err(e);
                    }
                    let mut delay_ms = retry.delay_ms(attempt);
                    if retry.jitter {
                        delay_ms = rand::thread_rng().gen_range(0..=delay_ms);
                    }
                    append_shared(
                        ledger,
                        LedgerEventType::TaskRetry,
                        json!({"task_id": task_id, "attempt": attempt, "delay_ms": delay_ms}),
                    );
                    if let Some(record) = state.records.get_mut(&task_id) {
                        record.status = TaskStatus::Retrying;
                    }
                    state.metrics.retries += 1;
                    tracing::debug!(task_id = %task_id, attempt, delay_ms, "retrying task");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if let Some(record) = state.records.get_mut(&task_id) {
                        record.status = TaskStatus::Running;
                    }
                    attempt += 1;
                }
            }
        };
        if let Some(record) = state.records.get_mut(&task_id) {
            record.attempt = attempt;
        }

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let e = Error::task_failed(task_id.clone(), attempt, e.to_string());
                return Err(state.task_fatal(&task_id, task, e, true, ledger));
            }
        };

        // 7. Verification over the output.
        if !task.verification.is_empty() {
            let roots = ExprRoots::new().with_root("output", output.clone());
            for expression in &task.verification {
                match expr::eval_bool(expression, &roots) {
                    Ok(true) => {}
                    Ok(false) => {
                        append_shared(
                            ledger,
                            LedgerEventType::Verification,
                            json!({"task_id": task_id, "passed": false, "expression": expression}),
                        );
                        let e = Error::VerificationFailed {
                            task_id: task_id.clone(),
                            expression: expression.clone(),
                        };
                        return Err(state.task_fatal(&task_id, task, e, true, ledger));
                    }
                    Err(e) => return Err(state.task_fatal(&task_id, task, e, true, ledger)),
                }
            }
            append_shared(
                ledger,
                LedgerEventType::Verification,
                json!({"task_id": task_id, "passed": true}),
            );
        }

        // Policy post-check.
        if let Some(policy) = &self.policy {
            let payload = json!({
                "action": task.capability,
                "task_id": task_id,
                "output": output,
            });
            let decision = match policy.evaluate(PolicyAction::TaskPost, payload).await {
                Ok(decision) => decision,
                Err(e) => return Err(state.task_fatal(&task_id, task, e, true, ledger)),
            };
            append_shared(
                ledger,
                LedgerEventType::PolicyPost,
                json!({
                    "task_id": task_id,
                    "action": PolicyAction::TaskPost.to_string(),
                    "allowed": decision.allow,
                    "reason": decision.reason,
                }),
            );
            if !decision.allow {
                let e = Error::policy_denied(
                    task_id.clone(),
                    PolicyAction::TaskPost.to_string(),
                    decision.reason.unwrap_or_else(|| "denied".into()),
                );
                return Err(state.task_fatal(&task_id, task, e, true, ledger));
            }
        }

        // 8. Nucleus postcheck.
        match nucleus.lock().await.postcheck(&output) {
            PostcheckOutcome::Complete => {}
            PostcheckOutcome::NeedsCompensation { reason } => {
                let e = Error::task_failed(
                    task_id.clone(),
                    attempt,
                    format!("postcheck requested compensation: {}", reason),
                );
                return Err(state.task_fatal(&task_id, task, e, true, ledger));
            }
            PostcheckOutcome::Escalate { reason } => {
                let e = Error::Escalated {
                    task_id: task_id.clone(),
                    reason,
                };
                let mut fatal = state.task_fatal(&task_id, task, e, true, ledger);
                fatal.run_fatal = true;
                return Err(fatal);
            }
        }

        // 9. Record.
        let narrative = run_ctx.take_narrative();
        if let Some(record) = state.records.get_mut(&task_id) {
            record.status = TaskStatus::Succeeded;
            record.output = Some(output.clone());
            record.narrative = narrative.clone();
        }
        state
            .outputs
            .insert(task_id.clone(), TaskOutput { output, narrative });
        state.metrics.tasks_succeeded += 1;
        append_shared(
            ledger,
            LedgerEventType::TaskEnd,
            json!({"task_id": task_id, "capability": task.capability, "status": "succeeded"}),
        );

        let promoted = context
            .lock()
            .expect("context lock poisoned")
            .augmentation_ids();
        state.carry_scope = Some(nucleus.lock().await.scope().snapshot(&promoted));
        Ok(())
    }

    async fn maybe_checkpoint(
        &self,
        state: &mut RunState,
        goal: &Goal,
        plan: &Plan,
        ledger: &SharedLedger,
        context: &SharedContext,
    ) -> std::result::Result<(), ExecutionFailure> {
        let Some(store) = &self.checkpoint_store else {
            return Ok(());
        };
        if state.completed == 0 || state.completed % self.config.checkpoint_interval != 0 {
            return Ok(());
        }
        let checkpoint = Checkpoint {
            run_id: state.run_id.clone(),
            index: state.completed,
            created_at: chrono::Utc::now(),
            plan: plan.clone(),
            goal: goal.clone(),
            context: context.lock().expect("context lock poisoned").clone(),
            internal_scope: state.carry_scope.clone().unwrap_or_default(),
            completed_outputs: state.outputs.clone(),
            ledger_prefix: ledger.lock().expect("ledger lock poisoned").snapshot(),
        };
        let checkpoint_id = checkpoint.checkpoint_id();
        if let Err(e) = store.save(&checkpoint).await {
            append_shared(
                ledger,
                LedgerEventType::Error,
                json!({"kind": e.kind(), "details": e.to_string()}),
            );
            return Err(self.fail(e, state, ledger, context));
        }
        append_shared(
            ledger,
            LedgerEventType::CheckpointWritten,
            json!({"checkpoint_id": checkpoint_id, "index": state.completed}),
        );
        Ok(())
    }

    fn report(
        &self,
        state: &RunState,
        ledger: &SharedLedger,
        context: &SharedContext,
    ) -> ExecutionReport {
        ExecutionReport {
            run_id: state.run_id.clone(),
            outputs_by_task: state.outputs.clone(),
            task_records: state.records.clone(),
            ledger: ledger.lock().expect("ledger lock poisoned").snapshot(),
            context: context.lock().expect("context lock poisoned").clone(),
            metrics: state.metrics,
        }
    }

    fn fail(
        &self,
        error: Error,
        state: &RunState,
        ledger: &SharedLedger,
        context: &SharedContext,
    ) -> ExecutionFailure {
        ExecutionFailure {
            error,
            report: self.report(state, ledger, context),
        }
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("capabilities", &self.capabilities)
            .field("config", &self.config)
            .finish()
    }
}

/// Task-fatal outcome: the task is done for, and `run_fatal` marks errors
/// no compensation edge may absorb.
struct TaskFatal {
    error: Error,
    run_fatal: bool,
}

/// Mutable run-scoped state owned by the scheduler loop.
struct RunState {
    run_id: String,
    records: BTreeMap<String, TaskRecord>,
    outputs: BTreeMap<String, TaskOutput>,
    policy_decisions: BTreeMap<String, Value>,
    metrics: RunMetrics,
    completed: u64,
    carry_scope: Option<ScopeSnapshot>,
}

impl RunState {
    /// Roots for guard evaluation: `context` facts, `outputs` by task, and
    /// `policy` decisions by task. A task with no recorded decision reads
    /// as `undefined` (falsy) under the `policy` root.
    fn guard_roots(&self, context: &SharedContext) -> ExprRoots {
        let outputs = Value::Object(
            self.outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.output.clone()))
                .collect(),
        );
        let policy = Value::Object(
            self.policy_decisions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        ExprRoots::new()
            .with_root(
                "context",
                context.lock().expect("context lock poisoned").facts_value(),
            )
            .with_root("outputs", outputs)
            .with_root("policy", policy)
    }

    /// Record a task-fatal error: `ERROR` entry, failed record, and - when
    /// the task had started - a closing `TASK_END{status:"failed"}`.
    fn task_fatal(
        &mut self,
        task_id: &str,
        task: &TaskSpec,
        error: Error,
        started: bool,
        ledger: &SharedLedger,
    ) -> TaskFatal {
        append_shared(
            ledger,
            LedgerEventType::Error,
            json!({"kind": error.kind(), "task_id": task_id, "details": error.to_string()}),
        );
        if started {
            append_shared(
                ledger,
                LedgerEventType::TaskEnd,
                json!({"task_id": task_id, "capability": task.capability, "status": "failed"}),
            );
        }
        if let Some(record) = self.records.get_mut(task_id) {
            record.status = TaskStatus::Failed;
            record.error = Some(error.to_string());
        }
        self.metrics.tasks_failed += 1;
        TaskFatal {
            error,
            run_fatal: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::plan::EdgeSpec;
    use crate::policy::PolicyDecision;
    use crate::policy::PolicyLimits;
    use crate::registry::{Capability, FnTool};
    use crate::retrieval::ContextProvider;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering as AtomicOrdering;

    struct StaticCapability {
        name: &'static str,
        output: Value,
    }

    #[async_trait]
    impl Capability for StaticCapability {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _run: &RunContext, _input: Value) -> Result<Value> {
            Ok(self.output.clone())
        }
    }

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyCapability {
        name: &'static str,
        failures: AtomicU32,
        output: Value,
    }

    #[async_trait]
    impl Capability for FlakyCapability {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _run: &RunContext, _input: Value) -> Result<Value> {
            let remaining = self.failures.load(AtomicOrdering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, AtomicOrdering::SeqCst);
                return Err(Error::tool(self.name, "connection reset"));
            }
            Ok(self.output.clone())
        }
    }

    struct SummarizeCapability;

    #[async_trait]
    impl Capability for SummarizeCapability {
        fn name(&self) -> &str {
            "summarize"
        }

        async fn execute(&self, run: &RunContext, _input: Value) -> Result<Value> {
            let joined = run
                .output("t1")
                .and_then(|o| o.output.get("results"))
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .concat()
                })
                .unwrap_or_default();
            run.set_narrative(format!("summarized {} upstream results", joined.len()));
            Ok(json!({"summary": joined}))
        }
    }

    struct SleepyCapability;

    #[async_trait]
    impl Capability for SleepyCapability {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn execute(&self, _run: &RunContext, _input: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn registry_of(capabilities: Vec<Arc<dyn Capability>>) -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        for capability in capabilities {
            registry.register(capability);
        }
        Arc::new(registry)
    }

    fn search_and_summarize() -> Arc<CapabilityRegistry> {
        registry_of(vec![
            Arc::new(StaticCapability {
                name: "search",
                output: json!({"results": ["a", "b"]}),
            }),
            Arc::new(SummarizeCapability),
        ])
    }

    fn goal() -> Goal {
        Goal::with_id("g1", "answer the query")
    }

    fn context() -> Context {
        Context::with_id("c1").with_fact("query", "foo")
    }

    fn event_types(report: &ExecutionReport) -> Vec<LedgerEventType> {
        report.ledger.iter().map(|e| e.event_type).collect()
    }

    fn entries_for_task<'a>(
        report: &'a ExecutionReport,
        event_type: LedgerEventType,
        task_id: &str,
    ) -> Vec<&'a LedgerEntry> {
        report
            .ledger
            .iter()
            .filter(|e| e.event_type == event_type && e.detail("task_id") == Some(&json!(task_id)))
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_two_sequential_tasks() {
        let executor = PlanExecutor::builder()
            .capabilities(search_and_summarize())
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "search").with_input(json!({"query": "foo"})))
            .with_task(TaskSpec::new("t2", "summarize"))
            .with_edge(EdgeSpec::new("t1", "t2"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        assert_eq!(
            report.outputs_by_task["t1"].output,
            json!({"results": ["a", "b"]})
        );
        assert_eq!(report.outputs_by_task["t2"].output, json!({"summary": "ab"}));
        assert_eq!(
            event_types(&report),
            vec![
                LedgerEventType::PlanSelected,
                LedgerEventType::TaskStart,
                LedgerEventType::TaskEnd,
                LedgerEventType::GuardEval,
                LedgerEventType::TaskStart,
                LedgerEventType::TaskEnd,
            ]
        );
        assert_eq!(report.metrics.tasks_succeeded, 2);
        assert_eq!(
            report.outputs_by_task["t2"].narrative.as_deref(),
            Some("summarized 2 upstream results")
        );
    }

    #[tokio::test]
    async fn test_guard_skip() {
        let registry = registry_of(vec![
            Arc::new(StaticCapability {
                name: "score",
                output: json!({"score": 5}),
            }),
            Arc::new(StaticCapability {
                name: "celebrate",
                output: json!({"party": true}),
            }),
        ]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "score"))
            .with_task(TaskSpec::new("t2", "celebrate"))
            .with_edge(EdgeSpec::guarded("t1", "t2", "outputs.t1.score > 10"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        assert_eq!(report.task_records["t2"].status, TaskStatus::Skipped);
        assert!(!report.outputs_by_task.contains_key("t2"));
        assert!(entries_for_task(&report, LedgerEventType::TaskStart, "t2").is_empty());
        let guard = &report.entries_of(LedgerEventType::GuardEval)[0];
        assert_eq!(guard.detail("result"), Some(&json!(false)));
        assert_eq!(report.metrics.tasks_skipped, 1);
    }

    struct RefundPolicy;

    #[async_trait]
    impl PolicyEngine for RefundPolicy {
        async fn evaluate(&self, action: PolicyAction, payload: Value) -> Result<PolicyDecision> {
            if action == PolicyAction::TaskPre {
                let amount = payload["input"]["amount"].as_f64().unwrap_or(0.0);
                if amount > 100.0 {
                    return Ok(PolicyDecision::deny("amount exceeds refund limit"));
                }
            }
            Ok(PolicyDecision::allow())
        }
    }

    #[tokio::test]
    async fn test_policy_deny_on_pre_check() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "issue_refund",
            output: json!({"refunded": true}),
        })]);
        let executor = PlanExecutor::builder()
            .capabilities(registry)
            .policy(Arc::new(RefundPolicy))
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "issue_refund").with_input(json!({"amount": 500})));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "policy_denied");
        let report = &failure.report;
        let pre = entries_for_task(report, LedgerEventType::PolicyPre, "t1");
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].detail("allowed"), Some(&json!(false)));
        assert!(entries_for_task(report, LedgerEventType::TaskStart, "t1").is_empty());
        assert!(report.outputs_by_task.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_exponential_backoff() {
        let registry = registry_of(vec![Arc::new(FlakyCapability {
            name: "fetch",
            failures: AtomicU32::new(2),
            output: json!({"ok": true}),
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "fetch").with_retry(RetryPolicy::exp(3, 10)));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        let retries = report.entries_of(LedgerEventType::TaskRetry);
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].detail("attempt"), Some(&json!(1)));
        assert_eq!(retries[0].detail("delay_ms"), Some(&json!(10)));
        assert_eq!(retries[1].detail("attempt"), Some(&json!(2)));
        assert_eq!(retries[1].detail("delay_ms"), Some(&json!(20)));
        assert_eq!(report.outputs_by_task["t1"].output, json!({"ok": true}));
        assert_eq!(report.task_records["t1"].attempt, 3);
        assert_eq!(report.metrics.retries, 2);
    }

    #[tokio::test]
    async fn test_attempts_one_means_zero_retries() {
        let registry = registry_of(vec![Arc::new(FlakyCapability {
            name: "fetch",
            failures: AtomicU32::new(5),
            output: Value::Null,
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref").with_task(TaskSpec::new("t1", "fetch"));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "task_failed");
        let report = &failure.report;
        assert!(report.entries_of(LedgerEventType::TaskRetry).is_empty());
        // failed tasks close with ERROR followed by TASK_END{failed}
        let error_id = entries_for_task(report, LedgerEventType::Error, "t1")[0].id;
        let end = entries_for_task(report, LedgerEventType::TaskEnd, "t1")[0];
        assert!(end.id > error_id);
        assert_eq!(end.detail("status"), Some(&json!("failed")));
    }

    #[tokio::test]
    async fn test_empty_plan_yields_plan_selected_only() {
        let executor = PlanExecutor::builder().build();
        let plan = Plan::new("p1", "ref");

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        assert!(report.outputs_by_task.is_empty());
        assert_eq!(event_types(&report), vec![LedgerEventType::PlanSelected]);
    }

    #[tokio::test]
    async fn test_independent_tasks_run_in_id_order() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t3", "noop"))
            .with_task(TaskSpec::new("t1", "noop"))
            .with_task(TaskSpec::new("t2", "noop"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        let started: Vec<String> = report
            .entries_of(LedgerEventType::TaskStart)
            .iter()
            .filter_map(|e| e.detail("task_id").and_then(Value::as_str).map(String::from))
            .collect();
        assert_eq!(started, vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_guard_on_undefined_output_is_false() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "noop"))
            .with_task(TaskSpec::new("t2", "noop"))
            .with_edge(EdgeSpec::guarded("t1", "t2", "outputs.t9.score > 10"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();
        assert_eq!(report.task_records["t2"].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_capability_is_rejected() {
        let executor = PlanExecutor::builder().build();
        let plan = Plan::new("p1", "ref").with_task(TaskSpec::new("t1", "nonexistent"));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), "capability_missing");
        assert_eq!(failure.report.ledger.len(), 1);
        assert_eq!(
            failure.report.ledger[0].event_type,
            LedgerEventType::Error
        );
    }

    #[tokio::test]
    async fn test_cyclic_plan_is_rejected() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "noop"))
            .with_task(TaskSpec::new("t2", "noop"))
            .with_edge(EdgeSpec::new("t1", "t2"))
            .with_edge(EdgeSpec::new("t2", "t1"));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), "plan_invalid");
    }

    #[tokio::test]
    async fn test_dangling_edge_is_rejected() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "noop"))
            .with_edge(EdgeSpec::new("t1", "ghost"));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), "plan_invalid");
    }

    #[tokio::test]
    async fn test_verification_failure_is_task_fatal() {
        let executor = PlanExecutor::builder()
            .capabilities(search_and_summarize())
            .build();
        let plan = Plan::new("p1", "ref").with_task(
            TaskSpec::new("t1", "search")
                .with_verification("output.results[0] === 'a'")
                .with_verification("output.results[2] === 'c'"),
        );

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "verification_failed");
        let verifications = failure.report.entries_of(LedgerEventType::Verification);
        assert_eq!(verifications.len(), 1);
        assert_eq!(verifications[0].detail("passed"), Some(&json!(false)));
        assert_eq!(
            verifications[0].detail("expression"),
            Some(&json!("output.results[2] === 'c'"))
        );
    }

    #[tokio::test]
    async fn test_verification_pass_emits_single_entry() {
        let executor = PlanExecutor::builder()
            .capabilities(search_and_summarize())
            .build();
        let plan = Plan::new("p1", "ref").with_task(
            TaskSpec::new("t1", "search")
                .with_verification("output.results[0] === 'a'")
                .with_verification("output.results[1] === 'b'"),
        );

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        let verifications = report.entries_of(LedgerEventType::Verification);
        assert_eq!(verifications.len(), 1);
        assert_eq!(verifications[0].detail("passed"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_compensation_edge_keeps_run_alive() {
        let registry = registry_of(vec![
            Arc::new(FlakyCapability {
                name: "fragile",
                failures: AtomicU32::new(5),
                output: Value::Null,
            }),
            Arc::new(StaticCapability {
                name: "cleanup",
                output: json!({"compensated": true}),
            }),
        ]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "fragile"))
            .with_task(TaskSpec::new("t2", "cleanup"))
            .with_edge(EdgeSpec::guarded("t1", "t2", "!outputs.t1"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        assert_eq!(report.task_records["t1"].status, TaskStatus::Failed);
        assert_eq!(
            report.outputs_by_task["t2"].output,
            json!({"compensated": true})
        );
        assert_eq!(report.metrics.tasks_failed, 1);
        assert_eq!(report.metrics.tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn test_cancellation_between_tasks() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder().capabilities(registry).build();
        let plan = Plan::new("p1", "ref").with_task(TaskSpec::new("t1", "noop"));
        let token = CancellationToken::new();
        token.cancel();

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan).with_cancellation(token))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "cancelled");
        let errors = failure.report.entries_of(LedgerEventType::Error);
        assert_eq!(errors[0].detail("kind"), Some(&json!("cancelled")));
        assert!(failure
            .report
            .entries_of(LedgerEventType::TaskStart)
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_fatal() {
        let registry = registry_of(vec![Arc::new(SleepyCapability)]);
        let executor = PlanExecutor::builder()
            .capabilities(registry)
            .config(RunConfig::new().with_task_timeout_ms(50))
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "sleepy").with_retry(RetryPolicy::fixed(2, 5)));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "task_failed");
        assert!(failure.to_string().contains("timed out"));
        assert_eq!(failure.report.entries_of(LedgerEventType::TaskRetry).len(), 1);
    }

    struct LimitedPolicy;

    #[async_trait]
    impl PolicyEngine for LimitedPolicy {
        async fn evaluate(&self, _action: PolicyAction, _payload: Value) -> Result<PolicyDecision> {
            Ok(PolicyDecision::allow().with_limits(PolicyLimits {
                timeout_ms: None,
                retries: Some(1),
            }))
        }
    }

    #[tokio::test]
    async fn test_policy_limits_tighten_retry_budget() {
        let registry = registry_of(vec![Arc::new(FlakyCapability {
            name: "fetch",
            failures: AtomicU32::new(5),
            output: Value::Null,
        })]);
        let executor = PlanExecutor::builder()
            .capabilities(registry)
            .policy(Arc::new(LimitedPolicy))
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "fetch").with_retry(RetryPolicy::fixed(4, 1)));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "task_failed");
        assert!(failure.report.entries_of(LedgerEventType::TaskRetry).is_empty());
    }

    struct NeedsCrmHooks;

    impl NucleusHooks for NeedsCrmHooks {
        fn preflight(
            &self,
            _binding: &NucleusBinding,
            scope: &InternalContextScope,
        ) -> PreflightOutcome {
            if scope.is_empty() {
                PreflightOutcome::NeedsContext(vec!["crm:42".into()])
            } else {
                PreflightOutcome::Ready
            }
        }
    }

    #[tokio::test]
    async fn test_preflight_retrieval_promotes_context() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "greet",
            output: json!({"greeting": "hello"}),
        })]);
        let crm = ContextProvider::new(Arc::new(FnTool::new("crm_lookup", |_| {
            Ok(json!({"type": "crm.customer", "content": {"name": "Alice"}, "promote": true}))
        })))
        .match_prefix("crm:");
        let executor = PlanExecutor::builder()
            .capabilities(registry)
            .pipeline(Arc::new(ContextRetrievalPipeline::new().with_provider(crm)))
            .nucleus_hooks(Arc::new(NeedsCrmHooks))
            .build();
        let initial_context = context();
        let initial_ref = initial_context.context_ref();
        let plan = Plan::new("p1", "ref").with_task(TaskSpec::new("t1", "greet"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), initial_context, plan))
            .await
            .unwrap();

        assert_eq!(report.outputs_by_task["t1"].output, json!({"greeting": "hello"}));
        assert_eq!(report.context.augmentations.len(), 1);
        assert_ne!(report.context.context_ref(), initial_ref);
        let internalized = report.entries_of(LedgerEventType::ContextInternalized);
        assert_eq!(internalized[0].detail("status"), Some(&json!("requested")));
        assert_eq!(
            internalized.last().unwrap().detail("status"),
            Some(&json!("resolved"))
        );
    }

    struct InsatiableHooks;

    impl NucleusHooks for InsatiableHooks {
        fn preflight(
            &self,
            _binding: &NucleusBinding,
            _scope: &InternalContextScope,
        ) -> PreflightOutcome {
            PreflightOutcome::NeedsContext(vec!["oracle:truth".into()])
        }
    }

    #[tokio::test]
    async fn test_unresolvable_preflight_is_context_unavailable() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder()
            .capabilities(registry)
            .nucleus_hooks(Arc::new(InsatiableHooks))
            .build();
        let plan = Plan::new("p1", "ref").with_task(TaskSpec::new("t1", "noop"));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "context_unavailable");
        assert!(failure
            .report
            .entries_of(LedgerEventType::TaskStart)
            .is_empty());
    }

    struct EscalatingHooks;

    impl NucleusHooks for EscalatingHooks {
        fn postcheck(
            &self,
            _binding: &NucleusBinding,
            _scope: &InternalContextScope,
            _output: &Value,
        ) -> PostcheckOutcome {
            PostcheckOutcome::Escalate {
                reason: "output contradicts recorded facts".into(),
            }
        }
    }

    #[tokio::test]
    async fn test_escalation_is_run_fatal_despite_compensation_edges() {
        let registry = registry_of(vec![Arc::new(StaticCapability {
            name: "noop",
            output: json!({}),
        })]);
        let executor = PlanExecutor::builder()
            .capabilities(registry)
            .nucleus_hooks(Arc::new(EscalatingHooks))
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "noop"))
            .with_task(TaskSpec::new("t2", "noop"))
            .with_edge(EdgeSpec::guarded("t1", "t2", "!outputs.t1"));

        let failure = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), "escalated");
        assert!(!failure.report.outputs_by_task.contains_key("t2"));
    }

    #[tokio::test]
    async fn test_checkpoints_written_on_interval() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let executor = PlanExecutor::builder()
            .capabilities(search_and_summarize())
            .checkpoint_store(store.clone())
            .config(RunConfig::new().with_run_id("run-1").with_checkpoint_interval(2))
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "search"))
            .with_task(TaskSpec::new("t2", "summarize"))
            .with_edge(EdgeSpec::new("t1", "t2"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        assert_eq!(store.list("run-1").await.unwrap(), vec!["chk-2"]);
        let written = report.entries_of(LedgerEventType::CheckpointWritten);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].detail("index"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_ledger_ids_strictly_increase_across_a_run() {
        let executor = PlanExecutor::builder()
            .capabilities(search_and_summarize())
            .build();
        let plan = Plan::new("p1", "ref")
            .with_task(TaskSpec::new("t1", "search"))
            .with_task(TaskSpec::new("t2", "summarize"))
            .with_edge(EdgeSpec::new("t1", "t2"));

        let report = executor
            .execute(ExecuteRequest::new(goal(), context(), plan))
            .await
            .unwrap();

        let ids: Vec<u64> = report.ledger.iter().map(|e| e.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
