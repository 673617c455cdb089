//! Nucleus: the per-task reasoning lifecycle.
//!
//! A nucleus adapts an opaque [`LlmCall`] into three bounded phases:
//! `preflight` (may declare missing context), `invoke` (a bounded tool-call
//! loop with built-in context tools), and `postcheck` (self-assessment that
//! can request compensation or escalate). One nucleus serves exactly one
//! task and owns that task's [`InternalContextScope`]; it is not re-entrant.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::Result;
use crate::ledger::{append_shared, LedgerEventType, SharedLedger};
use crate::llm::{LlmCall, LlmConfig, LlmRequest, LlmToolCall, LlmToolSpec};
use crate::retrieval::ContextRetrievalPipeline;
use crate::scope::InternalContextScope;

/// Built-in tool for reading the current scope. Never mutates.
pub const QUERY_CONTEXT: &str = "query_context";
/// Built-in tool for requesting external retrieval between rounds.
pub const REQUEST_CONTEXT_RETRIEVAL: &str = "request_context_retrieval";

const GROUNDING_DIRECTIVES: &str = "\
Ground every answer in the working context:
- Call query_context to inspect available facts and artifacts before \
producing structured output.
- Cite the fact keys and artifact ids that informed the answer.
- If required information is absent, call request_context_retrieval with \
directives instead of fabricating values.";

/// Shared handle to the run's active context packet. Retrieval promotion
/// swaps the value copy-on-write; readers always see a complete packet.
pub type SharedContext = Arc<Mutex<Context>>;

/// Identity a nucleus is bound to for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct NucleusBinding {
    pub goal_id: String,
    pub plan_id: String,
    pub task_id: String,
    pub context_ref: String,
    /// Tool names the bound task may call
    pub allowed_tools: Vec<String>,
}

/// Nucleus bounds and model selection.
#[derive(Debug, Clone)]
pub struct NucleusConfig {
    /// Prompt token budget; past 85% the built-ins are stripped and a
    /// final answer is forced
    pub max_context_tokens: usize,
    /// Maximum tool-call rounds per invoke
    pub max_query_rounds: u32,
    /// Passed through to every LLM call
    pub llm: LlmConfig,
}

impl Default for NucleusConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 32_768,
            max_query_rounds: 25,
            llm: LlmConfig::default(),
        }
    }
}

/// Outcome of the preflight phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PreflightOutcome {
    /// Scope is sufficient; proceed to execution
    Ready,
    /// Retrieval directives that must be fulfilled first
    NeedsContext(Vec<String>),
}

/// Outcome of the postcheck phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PostcheckOutcome {
    /// Output accepted
    Complete,
    /// Output rejected; compensation edges may still run
    NeedsCompensation { reason: String },
    /// Unrecoverable; the run must abort
    Escalate { reason: String },
}

/// Task-specific preflight/postcheck strategy.
///
/// Both phases are pure functions of the binding, scope, and (for
/// postcheck) the task output. The defaults accept everything, which is
/// the right behavior for capabilities that do not reason.
pub trait NucleusHooks: Send + Sync {
    fn preflight(
        &self,
        _binding: &NucleusBinding,
        _scope: &InternalContextScope,
    ) -> PreflightOutcome {
        PreflightOutcome::Ready
    }

    fn postcheck(
        &self,
        _binding: &NucleusBinding,
        _scope: &InternalContextScope,
        _output: &Value,
    ) -> PostcheckOutcome {
        PostcheckOutcome::Complete
    }
}

/// The default accept-everything hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNucleusHooks;

impl NucleusHooks for DefaultNucleusHooks {}

/// Counters for one invoke loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NucleusMetrics {
    pub rounds: u32,
    pub estimated_prompt_tokens: usize,
    pub budget_exhausted: bool,
}

/// Result of one invoke loop.
#[derive(Debug, Clone, Default)]
pub struct NucleusRun {
    /// Final structured output, if the model produced one
    pub output: Option<Value>,
    /// Free-form reasoning from the final round
    pub reasoning: Option<String>,
    /// User tool calls the model requested; forwarded to the caller
    pub pending_tool_calls: Vec<LlmToolCall>,
    pub metrics: NucleusMetrics,
}

/// Estimate prompt tokens: chars/4, scaled by 0.9 when the text carries
/// fenced code (code tokenizes denser than prose).
pub fn estimate_tokens(text: &str) -> usize {
    let base = text.len() / 4;
    if text.contains("```") {
        base * 9 / 10
    } else {
        base
    }
}

/// Per-task reasoning core. See the module docs for the lifecycle.
pub struct Nucleus {
    binding: NucleusBinding,
    scope: InternalContextScope,
    hooks: Arc<dyn NucleusHooks>,
    llm: Arc<dyn LlmCall>,
    config: NucleusConfig,
    ledger: SharedLedger,
    context: SharedContext,
    pipeline: Option<Arc<ContextRetrievalPipeline>>,
}

impl Nucleus {
    pub fn new(
        binding: NucleusBinding,
        scope: InternalContextScope,
        hooks: Arc<dyn NucleusHooks>,
        llm: Arc<dyn LlmCall>,
        config: NucleusConfig,
        ledger: SharedLedger,
        context: SharedContext,
    ) -> Self {
        Self {
            binding,
            scope,
            hooks,
            llm,
            config,
            ledger,
            context,
            pipeline: None,
        }
    }

    /// Wire in the retrieval pipeline used for `request_context_retrieval`
    /// calls and executor-driven preflight fulfillment.
    pub fn with_pipeline(mut self, pipeline: Arc<ContextRetrievalPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn binding(&self) -> &NucleusBinding {
        &self.binding
    }

    pub fn scope(&self) -> &InternalContextScope {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut InternalContextScope {
        &mut self.scope
    }

    /// Preflight: pure function of the current scope.
    pub fn preflight(&self) -> PreflightOutcome {
        self.hooks.preflight(&self.binding, &self.scope)
    }

    /// Postcheck: pure function of scope and output.
    pub fn postcheck(&self, output: &Value) -> PostcheckOutcome {
        self.hooks.postcheck(&self.binding, &self.scope, output)
    }

    /// Fulfill retrieval directives into this nucleus's scope and the
    /// run's active context. Returns the directives that did not resolve.
    pub async fn fulfill_directives(&mut self, directives: &[String]) -> Vec<String> {
        let Some(pipeline) = self.pipeline.clone() else {
            return directives.to_vec();
        };
        let mut context = self.context.lock().expect("context lock poisoned").clone();
        let report = pipeline
            .fulfill(directives, &mut self.scope, &mut context, &self.ledger)
            .await;
        *self.context.lock().expect("context lock poisoned") = context;
        report.unresolved()
    }

    /// Run the bounded tool-call loop.
    ///
    /// Built-in context tools execute locally; user tool calls end the
    /// loop and surface in [`NucleusRun::pending_tool_calls`]. Budget and
    /// round exhaustion are not errors - the run finalizes with whatever
    /// output exists and `metrics.budget_exhausted` set.
    pub async fn invoke(
        &mut self,
        prompt: impl Into<String>,
        user_tools: Vec<LlmToolSpec>,
    ) -> Result<NucleusRun> {
        let mut transcript = format!(
            "{}\n\nTask {} (goal {}, plan {}, context {}).\n\n{}",
            GROUNDING_DIRECTIVES,
            self.binding.task_id,
            self.binding.goal_id,
            self.binding.plan_id,
            self.binding.context_ref,
            prompt.into(),
        );
        let mut metrics = NucleusMetrics::default();

        for round in 1..=self.config.max_query_rounds {
            let estimated = estimate_tokens(&transcript);
            metrics.estimated_prompt_tokens = estimated;
            let force_final = estimated * 100 >= self.config.max_context_tokens * 85;

            let mut tools = user_tools.clone();
            if force_final {
                if !metrics.budget_exhausted {
                    metrics.budget_exhausted = true;
                    transcript.push_str(
                        "\n\nContext budget reached: respond with your final answer now.",
                    );
                }
            } else {
                tools.extend(builtin_tool_specs());
            }

            let response = self
                .llm
                .call(
                    LlmRequest::new(transcript.clone())
                        .with_tools(tools)
                        .with_config(self.config.llm.clone()),
                )
                .await?;
            metrics.rounds = round;
            append_shared(
                &self.ledger,
                LedgerEventType::NucleusInference,
                json!({
                    "task_id": self.binding.task_id,
                    "round": round,
                    "estimated_tokens": estimated,
                    "tool_calls": response.tool_calls.len(),
                    "forced_final": force_final,
                }),
            );

            if response.tool_calls.is_empty() {
                return Ok(NucleusRun {
                    output: response.output,
                    reasoning: response.reasoning,
                    pending_tool_calls: Vec::new(),
                    metrics,
                });
            }

            let mut pending = Vec::new();
            let mut directives = Vec::new();
            for call in response.tool_calls {
                match call.name.as_str() {
                    QUERY_CONTEXT => {
                        let result = self.query_context(&call.input);
                        transcript.push_str(&format!("\n[{}] {}", QUERY_CONTEXT, result));
                    }
                    REQUEST_CONTEXT_RETRIEVAL => {
                        if let Some(list) = call.input.get("directives").and_then(Value::as_array) {
                            directives.extend(
                                list.iter()
                                    .filter_map(Value::as_str)
                                    .map(String::from),
                            );
                        }
                    }
                    _ => pending.push(call),
                }
            }

            if !directives.is_empty() {
                let unresolved = self.fulfill_directives(&directives).await;
                transcript.push_str(&format!(
                    "\n[{}] fulfilled {} of {} directive(s)",
                    REQUEST_CONTEXT_RETRIEVAL,
                    directives.len() - unresolved.len(),
                    directives.len(),
                ));
                for directive in unresolved {
                    transcript.push_str(&format!("\n  unresolved: {}", directive));
                }
            }

            if !pending.is_empty() {
                return Ok(NucleusRun {
                    output: response.output,
                    reasoning: response.reasoning,
                    pending_tool_calls: pending,
                    metrics,
                });
            }
        }

        tracing::debug!(
            task_id = %self.binding.task_id,
            rounds = self.config.max_query_rounds,
            "nucleus query rounds exhausted"
        );
        metrics.budget_exhausted = true;
        Ok(NucleusRun {
            output: None,
            reasoning: None,
            pending_tool_calls: Vec::new(),
            metrics,
        })
    }

    /// Execute a `query_context` call against the scope and active
    /// context. Read-only.
    fn query_context(&self, input: &Value) -> Value {
        let op = input.get("op").and_then(Value::as_str).unwrap_or("list");
        let key = input.get("key").and_then(Value::as_str);
        let context = self.context.lock().expect("context lock poisoned");
        match op {
            "list" => json!({
                "facts": context.facts.keys().collect::<Vec<_>>(),
                "artifacts": self
                    .scope
                    .artifacts()
                    .iter()
                    .map(|a| json!({"id": a.id(), "type": a.artifact_type}))
                    .collect::<Vec<_>>(),
                "augmentations": context.augmentation_ids(),
                "assumptions": self.scope.assumptions().len(),
            }),
            "read_fact" => match key.and_then(|k| context.fact(k)) {
                Some(value) => json!({"key": key, "value": value}),
                None => json!({"key": key, "error": "fact not found"}),
            },
            "read_augmentation" => {
                let found = key.and_then(|k| {
                    context
                        .augmentations
                        .iter()
                        .find(|a| a.id() == k)
                        .cloned()
                });
                match found {
                    Some(artifact) => serde_json::to_value(artifact).unwrap_or(Value::Null),
                    None => json!({"key": key, "error": "augmentation not found"}),
                }
            }
            "read_assumptions" => json!({"assumptions": self.scope.assumptions()}),
            "read_artifact" => match key.and_then(|k| self.scope.get(k)) {
                Some(artifact) => serde_json::to_value(artifact).unwrap_or(Value::Null),
                None => json!({"key": key, "error": "artifact not found"}),
            },
            other => json!({"error": format!("unknown op: {}", other)}),
        }
    }
}

impl std::fmt::Debug for Nucleus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nucleus")
            .field("binding", &self.binding)
            .field("scope_len", &self.scope.len())
            .finish()
    }
}

fn builtin_tool_specs() -> Vec<LlmToolSpec> {
    vec![
        LlmToolSpec::new(QUERY_CONTEXT, "Read facts, artifacts, and assumptions from the working context")
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "op": {"enum": ["list", "read_fact", "read_augmentation", "read_assumptions", "read_artifact"]},
                    "key": {"type": "string"},
                },
                "required": ["op"],
            })),
        LlmToolSpec::new(
            REQUEST_CONTEXT_RETRIEVAL,
            "Request retrieval of missing context by directive instead of fabricating",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "directives": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["directives"],
        })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Artifact;
    use crate::error::Error;
    use crate::ledger::{shared, Ledger};
    use crate::llm::LlmResponse;
    use crate::registry::FnTool;
    use crate::retrieval::ContextProvider;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    /// Scripted LLM: pops one response per call.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<LlmResponse>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request(&self, index: usize) -> LlmRequest {
            self.requests.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl LlmCall for ScriptedLlm {
        async fn call(&self, request: LlmRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Llm("script exhausted".into()))
        }
    }

    fn binding() -> NucleusBinding {
        NucleusBinding {
            goal_id: "g1".into(),
            plan_id: "p1".into(),
            task_id: "t1".into(),
            context_ref: "ref".into(),
            allowed_tools: vec![],
        }
    }

    fn nucleus(llm: Arc<dyn LlmCall>, config: NucleusConfig) -> Nucleus {
        let context = Arc::new(Mutex::new(Context::with_id("c1").with_fact("region", "eu")));
        Nucleus::new(
            binding(),
            InternalContextScope::new(),
            Arc::new(DefaultNucleusHooks),
            llm,
            config,
            shared(Ledger::new()),
            context,
        )
    }

    fn tool_call(name: &str, input: Value) -> LlmToolCall {
        LlmToolCall {
            id: "call-1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn test_final_answer_on_first_round() {
        let llm = ScriptedLlm::new(vec![LlmResponse::answer(json!({"summary": "ab"}))]);
        let mut nucleus = nucleus(llm.clone(), NucleusConfig::default());

        let run = nucleus.invoke("Summarize", vec![]).await.unwrap();
        assert_eq!(run.output, Some(json!({"summary": "ab"})));
        assert_eq!(run.metrics.rounds, 1);
        assert!(!run.metrics.budget_exhausted);

        // grounding directives are always in the prompt
        let prompt = llm.request(0).prompt;
        assert!(prompt.contains("query_context"));
        assert!(prompt.contains("request_context_retrieval"));
    }

    #[tokio::test]
    async fn test_query_context_round_trip() {
        let llm = ScriptedLlm::new(vec![
            LlmResponse::calls(vec![tool_call(
                QUERY_CONTEXT,
                json!({"op": "read_fact", "key": "region"}),
            )]),
            LlmResponse::answer(json!({"region": "eu"})),
        ]);
        let mut nucleus = nucleus(llm.clone(), NucleusConfig::default());

        let run = nucleus.invoke("Where are we?", vec![]).await.unwrap();
        assert_eq!(run.metrics.rounds, 2);
        assert_eq!(run.output, Some(json!({"region": "eu"})));
        // the second prompt carries the locally-executed tool result
        assert!(llm.request(1).prompt.contains("\"eu\""));
    }

    #[tokio::test]
    async fn test_retrieval_between_rounds() {
        let provider_tool = FnTool::new("crm_lookup", |_| {
            Ok(json!({"type": "crm.customer", "content": {"name": "Alice"}, "promote": true}))
        });
        let pipeline = Arc::new(
            ContextRetrievalPipeline::new()
                .with_provider(ContextProvider::new(Arc::new(provider_tool)).match_prefix("crm:")),
        );
        let llm = ScriptedLlm::new(vec![
            LlmResponse::calls(vec![tool_call(
                REQUEST_CONTEXT_RETRIEVAL,
                json!({"directives": ["crm:42"]}),
            )]),
            LlmResponse::answer(json!({"customer": "Alice"})),
        ]);
        let mut nucleus = nucleus(llm, NucleusConfig::default()).with_pipeline(pipeline);
        let context = nucleus.context.clone();
        let before_ref = context.lock().unwrap().context_ref();

        let run = nucleus.invoke("Look up the customer", vec![]).await.unwrap();
        assert_eq!(run.output, Some(json!({"customer": "Alice"})));
        assert_eq!(nucleus.scope().len(), 1);
        let after = context.lock().unwrap();
        assert_eq!(after.augmentations.len(), 1);
        assert_ne!(after.context_ref(), before_ref);
    }

    #[tokio::test]
    async fn test_user_tool_calls_are_forwarded() {
        let llm = ScriptedLlm::new(vec![LlmResponse::calls(vec![tool_call(
            "send_email",
            json!({"to": "alice@example.com"}),
        )])]);
        let mut nucleus = nucleus(llm, NucleusConfig::default());

        let run = nucleus
            .invoke("Notify the customer", vec![LlmToolSpec::new("send_email", "")])
            .await
            .unwrap();
        assert_eq!(run.pending_tool_calls.len(), 1);
        assert_eq!(run.pending_tool_calls[0].name, "send_email");
        assert!(run.output.is_none());
    }

    #[tokio::test]
    async fn test_budget_forces_final_answer() {
        // budget small enough that the first round is already past 85%
        let config = NucleusConfig {
            max_context_tokens: 16,
            ..NucleusConfig::default()
        };
        let llm = ScriptedLlm::new(vec![LlmResponse::answer(json!("done"))]);
        let mut nucleus = nucleus(llm.clone(), config);

        let run = nucleus.invoke("Long prompt", vec![]).await.unwrap();
        assert!(run.metrics.budget_exhausted);
        assert_eq!(run.output, Some(json!("done")));
        // built-ins were stripped
        let offered = llm.request(0).tools;
        assert!(offered.iter().all(|t| t.name != QUERY_CONTEXT));
        assert!(llm.request(0).prompt.contains("final answer"));
    }

    #[tokio::test]
    async fn test_round_exhaustion_is_not_an_error() {
        let loop_call = || {
            LlmResponse::calls(vec![tool_call(QUERY_CONTEXT, json!({"op": "list"}))])
        };
        let config = NucleusConfig {
            max_query_rounds: 3,
            ..NucleusConfig::default()
        };
        let llm = ScriptedLlm::new(vec![loop_call(), loop_call(), loop_call()]);
        let mut nucleus = nucleus(llm, config);

        let run = nucleus.invoke("Spin", vec![]).await.unwrap();
        assert_eq!(run.metrics.rounds, 3);
        assert!(run.metrics.budget_exhausted);
        assert!(run.output.is_none());
    }

    #[tokio::test]
    async fn test_llm_error_propagates() {
        let llm = ScriptedLlm::new(vec![]);
        let mut nucleus = nucleus(llm, NucleusConfig::default());
        let err = nucleus.invoke("Anything", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }

    #[test]
    fn test_token_estimate_is_code_aware() {
        let prose = "word ".repeat(100);
        let code = format!("```rust\n{}```", "let x = 1;\n".repeat(40));
        assert_eq!(estimate_tokens(&prose), prose.len() / 4);
        assert_eq!(estimate_tokens(&code), code.len() / 4 * 9 / 10);
    }

    #[test]
    fn test_query_context_reads_scope_artifacts() {
        let llm = ScriptedLlm::new(vec![]);
        let mut nucleus = nucleus(llm, NucleusConfig::default());
        let artifact = Artifact::new("doc", json!({"page": 1}));
        let id = artifact.id();
        nucleus.scope_mut().insert(artifact);
        nucleus.scope_mut().add_assumption("page 1 is current");

        let listing = nucleus.query_context(&json!({"op": "list"}));
        assert_eq!(listing["artifacts"][0]["id"], json!(id));
        let read = nucleus.query_context(&json!({"op": "read_artifact", "key": id}));
        assert_eq!(read["content"], json!({"page": 1}));
        let assumptions = nucleus.query_context(&json!({"op": "read_assumptions"}));
        assert_eq!(assumptions["assumptions"][0], json!("page 1 is current"));
    }
}
