//! Context retrieval pipeline.
//!
//! Free-form retrieval directives (`crm:CUST-42`,
//! `workspace.context:{"operations":[...]}`) are matched against registered
//! providers, fulfilled through their tools, and the resulting artifacts
//! land in the task scope and - when promotion applies - in the durable
//! context. Directives are opaque to the core; providers own the parsing.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::context::{Artifact, Context};
use crate::error::Result;
use crate::ledger::{append_shared, LedgerEventType, SharedLedger};
use crate::registry::Tool;
use crate::scope::{InternalContextScope, InsertOutcome};

type MatchFn = Box<dyn Fn(&str) -> bool + Send + Sync>;
type BuildInputFn = Box<dyn Fn(&str, &Context) -> Result<Value> + Send + Sync>;

/// A registered retrieval provider: a directive predicate bound to a tool.
pub struct ContextProvider {
    describe: Option<String>,
    matcher: MatchFn,
    build_input: BuildInputFn,
    tool: Arc<dyn Tool>,
    auto_promote: bool,
    max_artifacts: Option<usize>,
}

impl ContextProvider {
    /// Create a provider that matches nothing until a matcher is attached.
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            describe: None,
            matcher: Box::new(|_| false),
            build_input: Box::new(|directive, _| Ok(json!({ "directive": directive }))),
            tool,
            auto_promote: false,
            max_artifacts: None,
        }
    }

    /// Match directives beginning with a namespace prefix; the default
    /// input builder then passes the remainder as `payload`.
    pub fn match_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let builder_prefix = prefix.clone();
        self.matcher = Box::new(move |directive| directive.starts_with(&prefix));
        self.build_input = Box::new(move |directive, _| {
            let payload = directive
                .strip_prefix(&builder_prefix)
                .unwrap_or(directive)
                .to_string();
            Ok(json!({ "directive": directive, "payload": payload }))
        });
        self
    }

    /// Match directives against a regex.
    pub fn match_regex(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| crate::error::Error::Internal(format!("invalid provider regex: {}", e)))?;
        self.matcher = Box::new(move |directive| regex.is_match(directive));
        Ok(self)
    }

    /// Match with an arbitrary predicate.
    pub fn match_with(mut self, matcher: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    /// Override how the tool input is built from a directive.
    pub fn build_input_with(
        mut self,
        build: impl Fn(&str, &Context) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.build_input = Box::new(build);
        self
    }

    /// Promote every artifact this provider returns.
    pub fn auto_promote(mut self) -> Self {
        self.auto_promote = true;
        self
    }

    /// Cap the number of artifacts accepted per directive.
    pub fn max_artifacts(mut self, max: usize) -> Self {
        self.max_artifacts = Some(max);
        self
    }

    /// Human-readable provider description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.describe = Some(description.into());
        self
    }

    fn matches(&self, directive: &str) -> bool {
        (self.matcher)(directive)
    }
}

impl std::fmt::Debug for ContextProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextProvider")
            .field("describe", &self.describe)
            .field("tool", &self.tool.name())
            .field("auto_promote", &self.auto_promote)
            .field("max_artifacts", &self.max_artifacts)
            .finish()
    }
}

/// Terminal status of one directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveStatus {
    Resolved,
    Unmatched,
    Failed,
}

/// Per-directive fulfillment outcome.
#[derive(Debug, Clone)]
pub struct DirectiveResult {
    pub directive: String,
    pub status: DirectiveStatus,
    /// Artifacts now present in the scope for this directive
    pub artifact_ids: Vec<String>,
    pub error: Option<String>,
}

/// Summary of one `fulfill` call.
#[derive(Debug, Clone, Default)]
pub struct FulfillmentReport {
    pub results: Vec<DirectiveResult>,
    pub promoted: usize,
}

impl FulfillmentReport {
    /// Whether every directive resolved.
    pub fn all_resolved(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == DirectiveStatus::Resolved)
    }

    /// Directives that did not resolve.
    pub fn unresolved(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.status != DirectiveStatus::Resolved)
            .map(|r| r.directive.clone())
            .collect()
    }
}

/// Matches directives to providers and promotes their artifacts.
#[derive(Debug, Default)]
pub struct ContextRetrievalPipeline {
    providers: Vec<ContextProvider>,
}

impl ContextRetrievalPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Matching is first-match-wins in registration
    /// order.
    pub fn register(&mut self, provider: ContextProvider) {
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: ContextProvider) -> Self {
        self.register(provider);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Fulfill a batch of directives sequentially (deterministic artifact
    /// order). Provider failures abort only their own directive. Promotion
    /// swaps `context` for a new copy-on-write value.
    pub async fn fulfill(
        &self,
        directives: &[String],
        scope: &mut InternalContextScope,
        context: &mut Context,
        ledger: &SharedLedger,
    ) -> FulfillmentReport {
        let mut report = FulfillmentReport::default();
        for directive in directives {
            let result = self
                .fulfill_one(directive, scope, context, ledger, &mut report.promoted)
                .await;
            report.results.push(result);
        }
        report
    }

    async fn fulfill_one(
        &self,
        directive: &str,
        scope: &mut InternalContextScope,
        context: &mut Context,
        ledger: &SharedLedger,
        promoted: &mut usize,
    ) -> DirectiveResult {
        append_shared(
            ledger,
            LedgerEventType::ContextInternalized,
            json!({ "status": "requested", "directive": directive }),
        );

        let Some(provider) = self.providers.iter().find(|p| p.matches(directive)) else {
            tracing::debug!(directive, "no provider matched directive");
            append_shared(
                ledger,
                LedgerEventType::ContextInternalized,
                json!({ "status": "unmatched", "directive": directive }),
            );
            return DirectiveResult {
                directive: directive.to_string(),
                status: DirectiveStatus::Unmatched,
                artifact_ids: Vec::new(),
                error: None,
            };
        };

        let tool_name = provider.tool.name().to_string();
        let outcome = match (provider.build_input)(directive, context) {
            Ok(input) => provider.tool.call(input).await,
            Err(e) => Err(e),
        };

        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(directive, error = %e, "retrieval provider failed");
                append_shared(
                    ledger,
                    LedgerEventType::ContextInternalized,
                    json!({ "status": "failed", "directive": directive, "error": e.to_string() }),
                );
                return DirectiveResult {
                    directive: directive.to_string(),
                    status: DirectiveStatus::Failed,
                    artifact_ids: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let mut artifacts: Vec<Artifact> = match raw {
            Value::Array(items) => items
                .into_iter()
                .map(|item| Artifact::from_tool_result(&tool_name, item))
                .collect(),
            other => vec![Artifact::from_tool_result(&tool_name, other)],
        };

        if let Some(max) = provider.max_artifacts {
            if artifacts.len() > max {
                let dropped = artifacts.len() - max;
                artifacts.truncate(max);
                append_shared(
                    ledger,
                    LedgerEventType::ContextInternalized,
                    json!({ "status": "truncated", "directive": directive, "dropped": dropped }),
                );
            }
        }

        let mut artifact_ids = Vec::with_capacity(artifacts.len());
        let mut budget_dropped = 0usize;
        for artifact in artifacts {
            let artifact = artifact
                .with_provenance("directive", directive)
                .with_provenance("tool", tool_name.clone());
            let promote = artifact.promote || provider.auto_promote;
            let id = artifact.id();
            match scope.insert(artifact.clone()) {
                InsertOutcome::Rejected { .. } => {
                    budget_dropped += 1;
                    continue;
                }
                InsertOutcome::Appended { .. } | InsertOutcome::Duplicate { .. } => {
                    artifact_ids.push(id);
                }
            }
            if promote {
                let next = context.with_augmentation(artifact);
                if next.augmentations.len() > context.augmentations.len() {
                    *promoted += 1;
                }
                *context = next;
            }
        }

        if budget_dropped > 0 {
            append_shared(
                ledger,
                LedgerEventType::ContextInternalized,
                json!({ "status": "truncated", "directive": directive, "dropped": budget_dropped }),
            );
        }

        append_shared(
            ledger,
            LedgerEventType::ContextInternalized,
            json!({ "status": "resolved", "directive": directive, "artifact_ids": artifact_ids }),
        );
        DirectiveResult {
            directive: directive.to_string(),
            status: DirectiveStatus::Resolved,
            artifact_ids,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{shared, Ledger};
    use crate::registry::FnTool;
    use pretty_assertions::assert_eq;

    fn crm_provider() -> ContextProvider {
        let tool = FnTool::new("crm_lookup", |input: Value| {
            let payload = input["payload"].as_str().unwrap_or_default().to_string();
            Ok(json!({
                "type": "crm.customer",
                "content": {"customer_id": payload, "name": "Alice"},
                "promote": true,
            }))
        });
        ContextProvider::new(Arc::new(tool)).match_prefix("crm:")
    }

    fn entries_with_status(ledger: &SharedLedger, status: &str) -> usize {
        ledger
            .lock()
            .unwrap()
            .entries()
            .iter()
            .filter(|e| e.detail("status") == Some(&json!(status)))
            .count()
    }

    #[tokio::test]
    async fn test_resolve_and_promote() {
        let pipeline = ContextRetrievalPipeline::new().with_provider(crm_provider());
        let mut scope = InternalContextScope::new();
        let mut context = Context::with_id("c1");
        let before_ref = context.context_ref();
        let ledger = shared(Ledger::new());

        let report = pipeline
            .fulfill(&["crm:CUST-42".to_string()], &mut scope, &mut context, &ledger)
            .await;

        assert!(report.all_resolved());
        assert_eq!(report.promoted, 1);
        assert_eq!(scope.len(), 1);
        assert_eq!(context.augmentations.len(), 1);
        assert_ne!(context.context_ref(), before_ref);
        assert_eq!(entries_with_status(&ledger, "requested"), 1);
        assert_eq!(entries_with_status(&ledger, "resolved"), 1);
    }

    #[tokio::test]
    async fn test_unmatched_directive_continues() {
        let pipeline = ContextRetrievalPipeline::new().with_provider(crm_provider());
        let mut scope = InternalContextScope::new();
        let mut context = Context::with_id("c1");
        let ledger = shared(Ledger::new());

        let directives = vec!["billing:INV-9".to_string(), "crm:CUST-42".to_string()];
        let report = pipeline
            .fulfill(&directives, &mut scope, &mut context, &ledger)
            .await;

        assert!(!report.all_resolved());
        assert_eq!(report.unresolved(), vec!["billing:INV-9"]);
        assert_eq!(report.results[0].status, DirectiveStatus::Unmatched);
        assert_eq!(report.results[1].status, DirectiveStatus::Resolved);
        assert_eq!(entries_with_status(&ledger, "unmatched"), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_isolated_per_directive() {
        let failing = ContextProvider::new(Arc::new(FnTool::new("broken", |_| {
            Err(crate::error::Error::tool("broken", "backend offline"))
        })))
        .match_prefix("broken:");
        let pipeline = ContextRetrievalPipeline::new()
            .with_provider(failing)
            .with_provider(crm_provider());
        let mut scope = InternalContextScope::new();
        let mut context = Context::with_id("c1");
        let ledger = shared(Ledger::new());

        let directives = vec!["broken:x".to_string(), "crm:CUST-7".to_string()];
        let report = pipeline
            .fulfill(&directives, &mut scope, &mut context, &ledger)
            .await;

        assert_eq!(report.results[0].status, DirectiveStatus::Failed);
        assert!(report.results[0].error.as_deref().unwrap().contains("backend offline"));
        assert_eq!(report.results[1].status, DirectiveStatus::Resolved);
        assert_eq!(scope.len(), 1);
    }

    #[tokio::test]
    async fn test_fulfillment_is_idempotent() {
        let pipeline = ContextRetrievalPipeline::new().with_provider(crm_provider());
        let mut scope = InternalContextScope::new();
        let mut context = Context::with_id("c1");
        let ledger = shared(Ledger::new());
        let directives = vec!["crm:CUST-42".to_string()];

        pipeline
            .fulfill(&directives, &mut scope, &mut context, &ledger)
            .await;
        let ref_after_first = context.context_ref();
        pipeline
            .fulfill(&directives, &mut scope, &mut context, &ledger)
            .await;

        assert_eq!(scope.len(), 1);
        assert_eq!(context.augmentations.len(), 1);
        assert_eq!(context.context_ref(), ref_after_first);
    }

    #[tokio::test]
    async fn test_max_artifacts_truncation() {
        let tool = FnTool::new("fanout", |_| {
            Ok(json!([
                {"type": "doc.page", "content": {"page": 1}},
                {"type": "doc.page", "content": {"page": 2}},
                {"type": "doc.page", "content": {"page": 3}},
            ]))
        });
        let provider = ContextProvider::new(Arc::new(tool))
            .match_prefix("doc:")
            .max_artifacts(2);
        let pipeline = ContextRetrievalPipeline::new().with_provider(provider);
        let mut scope = InternalContextScope::new();
        let mut context = Context::with_id("c1");
        let ledger = shared(Ledger::new());

        let report = pipeline
            .fulfill(&["doc:manual".to_string()], &mut scope, &mut context, &ledger)
            .await;

        assert_eq!(scope.len(), 2);
        assert_eq!(report.results[0].artifact_ids.len(), 2);
        assert_eq!(entries_with_status(&ledger, "truncated"), 1);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let first = ContextProvider::new(Arc::new(FnTool::new("first", |_| {
            Ok(json!({"type": "a", "content": 1}))
        })))
        .match_prefix("crm:");
        let second = ContextProvider::new(Arc::new(FnTool::new("second", |_| {
            Ok(json!({"type": "b", "content": 2}))
        })))
        .match_prefix("crm:");
        let pipeline = ContextRetrievalPipeline::new()
            .with_provider(first)
            .with_provider(second);
        let mut scope = InternalContextScope::new();
        let mut context = Context::with_id("c1");
        let ledger = shared(Ledger::new());

        pipeline
            .fulfill(&["crm:1".to_string()], &mut scope, &mut context, &ledger)
            .await;
        assert_eq!(scope.artifacts()[0].artifact_type, "a");
    }
}
