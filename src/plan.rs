//! Plans: task graphs with guarded edges and retry policies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::registry::CapabilityRegistry;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay of `base_ms`
    #[default]
    Fixed,
    /// `base_ms * 2^(retry - 1)`
    Exp,
}

/// Per-task retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub attempts: u32,
    /// Delay growth strategy
    #[serde(default)]
    pub backoff: Backoff,
    /// Base delay in milliseconds
    #[serde(default = "RetryPolicy::default_base_ms")]
    pub base_ms: u64,
    /// Apply full jitter: uniform(0, delay)
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    fn default_base_ms() -> u64 {
        500
    }

    /// Create a fixed-backoff policy.
    pub fn fixed(attempts: u32, base_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::Fixed,
            base_ms,
            jitter: false,
        }
    }

    /// Create an exponential-backoff policy.
    pub fn exp(attempts: u32, base_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::Exp,
            base_ms,
            jitter: false,
        }
    }

    /// Enable full jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Undelayed delay for the given retry number (1-based), before jitter.
    pub fn delay_ms(&self, retry: u32) -> u64 {
        match self.backoff {
            Backoff::Fixed => self.base_ms,
            Backoff::Exp => {
                let shift = retry.saturating_sub(1).min(32);
                self.base_ms.saturating_mul(1u64 << shift)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(1, Self::default_base_ms())
    }
}

/// One task in a plan, bound to a named capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the plan
    pub id: String,
    /// Registered capability name
    pub capability: String,
    /// Input map passed to the capability
    #[serde(default)]
    pub input: Value,
    /// Retry policy; absent means a single attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Boolean expressions over `{output}` that must all hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<String>,
    /// Extra tool names this task may use beyond the run-level allowlist
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            input: Value::Null,
            retry: None,
            verification: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_verification(mut self, expression: impl Into<String>) -> Self {
        self.verification.push(expression.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }
}

/// A guarded edge between two tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    /// Boolean expression over `{context, outputs, policy}`; absent means
    /// "follows a successful `from`"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard.into()),
        }
    }
}

/// A directed acyclic task graph produced by a planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// Content ref of the context the plan was produced against
    pub context_ref: String,
    /// Version tag of the capability map the planner saw
    #[serde(default)]
    pub capability_map_version: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Planner's free-form explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Plan {
    pub fn new(id: impl Into<String>, context_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_ref: context_ref.into(),
            capability_map_version: String::new(),
            tasks: Vec::new(),
            edges: Vec::new(),
            rationale: None,
        }
    }

    pub fn with_capability_map_version(mut self, version: impl Into<String>) -> Self {
        self.capability_map_version = version.into();
        self
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Edges pointing at `task_id`.
    pub fn incoming_edges(&self, task_id: &str) -> Vec<&EdgeSpec> {
        self.edges.iter().filter(|e| e.to == task_id).collect()
    }

    /// Edges leaving `task_id`.
    pub fn outgoing_edges(&self, task_id: &str) -> Vec<&EdgeSpec> {
        self.edges.iter().filter(|e| e.from == task_id).collect()
    }

    /// Structural validation: unique task ids, no dangling edges, no
    /// cycles, and every capability resolvable in the registry.
    pub fn validate(&self, registry: &CapabilityRegistry) -> Result<()> {
        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(Error::plan_invalid(format!("duplicate task id: {}", task.id)));
            }
            if !registry.contains(&task.capability) {
                return Err(Error::CapabilityMissing(task.capability.clone()));
            }
        }
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(Error::plan_invalid(format!(
                        "edge {} -> {} references unknown task {}",
                        edge.from, edge.to, endpoint
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Topological order over tasks, deterministic: among ready tasks the
    /// lowest task id runs first (Kahn's algorithm over a sorted ready set).
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.tasks.iter().map(|t| (t.id.as_str(), 0)).collect();
        let mut dedup = BTreeSet::new();
        for edge in &self.edges {
            // parallel edges between the same pair count once
            if dedup.insert((edge.from.as_str(), edge.to.as_str())) {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(&next) = ready.iter().next() {
            ready.remove(next);
            order.push(next.to_string());
            for edge in &self.edges {
                if edge.from == next {
                    if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                        if *d > 0 {
                            *d -= 1;
                            if *d == 0 {
                                ready.insert(edge.to.as_str());
                            }
                        }
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(Error::plan_invalid("plan contains a cycle"));
        }
        Ok(order)
    }
}
