//! Error types for acm-core.

use thiserror::Error;

/// Result type alias using acm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing a plan.
#[derive(Error, Debug)]
pub enum Error {
    /// Plan failed structural validation (cycle, dangling edge, duplicate task)
    #[error("Invalid plan: {0}")]
    PlanInvalid(String),

    /// A task names a capability that is not registered
    #[error("Unknown capability: {0}")]
    CapabilityMissing(String),

    /// Policy engine denied an action
    #[error("Policy denied {action} for task {task_id}: {reason}")]
    PolicyDenied {
        task_id: String,
        action: String,
        reason: String,
    },

    /// A task exhausted its retry budget
    #[error("Task {task_id} failed after {attempts} attempt(s): {message}")]
    TaskFailed {
        task_id: String,
        attempts: u32,
        message: String,
    },

    /// A post-task assertion evaluated false
    #[error("Verification failed for task {task_id}: {expression}")]
    VerificationFailed {
        task_id: String,
        expression: String,
    },

    /// Retrieval could not satisfy the directives a task declared
    #[error("Context unavailable for task {task_id}: unresolved directives {directives:?}")]
    ContextUnavailable {
        task_id: String,
        directives: Vec<String>,
    },

    /// Timeout during a task or tool call
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The run's cancellation token fired
    #[error("Run cancelled")]
    Cancelled,

    /// Nucleus postcheck escalated an unrecoverable condition
    #[error("Task {task_id} escalated: {reason}")]
    Escalated { task_id: String, reason: String },

    /// Guard/verification expression could not be parsed or evaluated
    #[error("Expression error: {0}")]
    Expr(String),

    /// Error surfaced by a capability or tool implementation
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// LLM call error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Checkpoint store error
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a plan validation error.
    pub fn plan_invalid(message: impl Into<String>) -> Self {
        Self::PlanInvalid(message.into())
    }

    /// Create a policy denial error.
    pub fn policy_denied(
        task_id: impl Into<String>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PolicyDenied {
            task_id: task_id.into(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create a task failure error.
    pub fn task_failed(
        task_id: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskFailed {
            task_id: task_id.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Stable snake_case kind tag, as recorded in ledger `ERROR` entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanInvalid(_) => "plan_invalid",
            Self::CapabilityMissing(_) => "capability_missing",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::TaskFailed { .. } => "task_failed",
            Self::VerificationFailed { .. } => "verification_failed",
            Self::ContextUnavailable { .. } => "context_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Escalated { .. } => "escalated",
            Self::Expr(_) => "expression",
            Self::Tool { .. } => "tool",
            Self::Llm(_) => "llm",
            Self::CheckpointStore(_) => "checkpoint_store",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a per-attempt task error is eligible for retry.
    ///
    /// Verification and policy failures express a contract, not transient
    /// I/O, and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Tool { .. }
                | Self::Llm(_)
                | Self::Timeout { .. }
                | Self::Internal(_)
                | Self::Serialization(_)
        )
    }

    /// The task this error is attributed to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::PolicyDenied { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::VerificationFailed { task_id, .. }
            | Self::ContextUnavailable { task_id, .. }
            | Self::Escalated { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
