//! Policy engine interface.
//!
//! The runtime consults an external policy engine at three points: plan
//! admission, task pre-check, and task post-check. The engine returns an
//! allow/deny verdict, optionally tightening the task's timeout and retry
//! budget. Cost models and governance rules live behind this seam and are
//! not part of the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// The enumerated policy actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyAction {
    /// Whole-plan admission, before any task runs
    #[serde(rename = "plan.admit")]
    PlanAdmit,
    /// Per-task pre-check, before the capability executes
    #[serde(rename = "task.pre")]
    TaskPre,
    /// Per-task post-check, after verification passes
    #[serde(rename = "task.post")]
    TaskPost,
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanAdmit => write!(f, "plan.admit"),
            Self::TaskPre => write!(f, "task.pre"),
            Self::TaskPost => write!(f, "task.post"),
        }
    }
}

/// Limits a policy decision may impose on the checked task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyLimits {
    /// Cap on the task timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Cap on total attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Allow/deny verdict with optional limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<PolicyLimits>,
}

impl PolicyDecision {
    /// An unconditional allow.
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            limits: None,
        }
    }

    /// A denial with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            limits: None,
        }
    }

    /// Attach limits to an allow.
    pub fn with_limits(mut self, limits: PolicyLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// JSON form recorded under the `policy.<taskId>` guard root.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// External policy engine seam.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate an action against an action-specific payload.
    async fn evaluate(&self, action: PolicyAction, payload: Value) -> Result<PolicyDecision>;
}

/// Default engine: allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEngine for AllowAllPolicy {
    async fn evaluate(&self, _action: PolicyAction, _payload: Value) -> Result<PolicyDecision> {
        Ok(PolicyDecision::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_action_serde_tags() {
        assert_eq!(
            serde_json::to_string(&PolicyAction::TaskPre).unwrap(),
            "\"task.pre\""
        );
        assert_eq!(PolicyAction::PlanAdmit.to_string(), "plan.admit");
    }

    #[test]
    fn test_decision_value_shape() {
        let decision = PolicyDecision::deny("amount exceeds limit");
        assert_eq!(
            decision.to_value(),
            json!({"allow": false, "reason": "amount exceeds limit"})
        );
    }

    #[tokio::test]
    async fn test_allow_all() {
        let decision = AllowAllPolicy
            .evaluate(PolicyAction::TaskPre, json!({"action": "search"}))
            .await
            .unwrap();
        assert!(decision.allow);
    }
}
