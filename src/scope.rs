//! Per-task internal context scope.
//!
//! The scope is the ephemeral artifact store a nucleus reads from during a
//! single task. It is append-only within the task, its byte counter is
//! monotonic, and inserting an artifact whose id is already present is a
//! no-op, so retrieval fulfillment can be replayed safely.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::context::Artifact;

/// Outcome of an insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Artifact appended to the scope
    Appended { artifact_id: String },
    /// Same id already present; nothing changed
    Duplicate { artifact_id: String },
    /// Budget exceeded; artifact dropped
    Rejected { reason: BudgetLimit },
}

impl InsertOutcome {
    /// Whether the artifact is in the scope after the call.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Appended { .. } | Self::Duplicate { .. })
    }
}

/// Which budget an insert ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    MaxArtifacts,
    MaxBytes,
}

/// Serializable snapshot of a scope, as persisted in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub artifacts: Vec<Artifact>,
    pub assumptions: Vec<String>,
    pub size_bytes: u64,
}

/// Mutable per-task artifact store with ordered append log and budgets.
#[derive(Debug, Clone)]
pub struct InternalContextScope {
    artifacts: Vec<Artifact>,
    index: HashMap<String, usize>,
    assumptions: Vec<String>,
    size_bytes: u64,
    max_artifacts: usize,
    max_bytes: u64,
}

impl InternalContextScope {
    pub const DEFAULT_MAX_ARTIFACTS: usize = 256;
    pub const DEFAULT_MAX_BYTES: u64 = 4 * 1024 * 1024;

    /// Create a scope with default budgets.
    pub fn new() -> Self {
        Self::with_budgets(Self::DEFAULT_MAX_ARTIFACTS, Self::DEFAULT_MAX_BYTES)
    }

    /// Create a scope with explicit budgets.
    pub fn with_budgets(max_artifacts: usize, max_bytes: u64) -> Self {
        Self {
            artifacts: Vec::new(),
            index: HashMap::new(),
            assumptions: Vec::new(),
            size_bytes: 0,
            max_artifacts,
            max_bytes,
        }
    }

    /// Insert an artifact, de-duplicating by content-addressed id.
    pub fn insert(&mut self, artifact: Artifact) -> InsertOutcome {
        let artifact_id = artifact.id();
        if self.index.contains_key(&artifact_id) {
            return InsertOutcome::Duplicate { artifact_id };
        }
        if self.artifacts.len() >= self.max_artifacts {
            return InsertOutcome::Rejected {
                reason: BudgetLimit::MaxArtifacts,
            };
        }
        if self.size_bytes + artifact.size_bytes > self.max_bytes {
            return InsertOutcome::Rejected {
                reason: BudgetLimit::MaxBytes,
            };
        }
        self.size_bytes += artifact.size_bytes;
        self.index.insert(artifact_id.clone(), self.artifacts.len());
        self.artifacts.push(artifact);
        InsertOutcome::Appended { artifact_id }
    }

    /// Look up an artifact by id.
    pub fn get(&self, artifact_id: &str) -> Option<&Artifact> {
        self.index.get(artifact_id).map(|&i| &self.artifacts[i])
    }

    /// Whether an artifact id is present.
    pub fn contains(&self, artifact_id: &str) -> bool {
        self.index.contains_key(artifact_id)
    }

    /// Artifacts in append order.
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Ids in append order.
    pub fn artifact_ids(&self) -> Vec<String> {
        self.artifacts.iter().map(Artifact::id).collect()
    }

    /// Record a free-form assumption readable via `query_context`.
    pub fn add_assumption(&mut self, assumption: impl Into<String>) {
        self.assumptions.push(assumption.into());
    }

    /// Assumptions in recorded order.
    pub fn assumptions(&self) -> &[String] {
        &self.assumptions
    }

    /// Total canonical bytes appended so far. Monotonic: rejected inserts
    /// and duplicates do not change it, and nothing ever removes from it.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Snapshot for checkpointing, excluding artifacts whose ids appear in
    /// `promoted_ids` (those already live in the durable context).
    pub fn snapshot(&self, promoted_ids: &[String]) -> ScopeSnapshot {
        let artifacts: Vec<Artifact> = self
            .artifacts
            .iter()
            .filter(|a| !promoted_ids.iter().any(|p| *p == a.id()))
            .cloned()
            .collect();
        ScopeSnapshot {
            artifacts,
            assumptions: self.assumptions.clone(),
            size_bytes: self.size_bytes,
        }
    }

    /// Rebuild a scope from a snapshot, preserving the monotonic byte
    /// counter recorded at snapshot time.
    pub fn restore(snapshot: ScopeSnapshot, max_artifacts: usize, max_bytes: u64) -> Self {
        let mut scope = Self::with_budgets(max_artifacts, max_bytes);
        for artifact in snapshot.artifacts {
            scope.insert(artifact);
        }
        scope.assumptions = snapshot.assumptions;
        if snapshot.size_bytes > scope.size_bytes {
            scope.size_bytes = snapshot.size_bytes;
        }
        scope
    }
}

impl Default for InternalContextScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_insert_and_dedup() {
        let mut scope = InternalContextScope::new();
        let artifact = Artifact::new("doc", json!({"page": 1}));

        let first = scope.insert(artifact.clone());
        assert!(matches!(first, InsertOutcome::Appended { .. }));
        let second = scope.insert(artifact);
        assert!(matches!(second, InsertOutcome::Duplicate { .. }));
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_size_bytes_is_monotonic() {
        let mut scope = InternalContextScope::new();
        let a = Artifact::new("doc", json!({"page": 1}));
        let b = Artifact::new("doc", json!({"page": 2}));

        scope.insert(a.clone());
        let after_one = scope.size_bytes();
        scope.insert(a); // duplicate
        assert_eq!(scope.size_bytes(), after_one);
        scope.insert(b);
        assert!(scope.size_bytes() > after_one);
    }

    #[test]
    fn test_artifact_budget() {
        let mut scope = InternalContextScope::with_budgets(1, u64::MAX);
        scope.insert(Artifact::new("doc", json!(1)));
        let outcome = scope.insert(Artifact::new("doc", json!(2)));
        assert_eq!(
            outcome,
            InsertOutcome::Rejected {
                reason: BudgetLimit::MaxArtifacts
            }
        );
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_byte_budget() {
        let mut scope = InternalContextScope::with_budgets(16, 4);
        let outcome = scope.insert(Artifact::new("doc", json!("far too large")));
        assert_eq!(
            outcome,
            InsertOutcome::Rejected {
                reason: BudgetLimit::MaxBytes
            }
        );
        assert!(scope.is_empty());
    }

    #[test]
    fn test_snapshot_excludes_promoted() {
        let mut scope = InternalContextScope::new();
        let kept = Artifact::new("doc", json!("kept"));
        let promoted = Artifact::new("doc", json!("promoted"));
        scope.insert(kept.clone());
        scope.insert(promoted.clone());
        scope.add_assumption("customer is on the gold tier");

        let snapshot = scope.snapshot(&[promoted.id()]);
        assert_eq!(snapshot.artifacts.len(), 1);
        assert_eq!(snapshot.artifacts[0].id(), kept.id());
        assert_eq!(snapshot.assumptions.len(), 1);

        let restored = InternalContextScope::restore(
            snapshot,
            InternalContextScope::DEFAULT_MAX_ARTIFACTS,
            InternalContextScope::DEFAULT_MAX_BYTES,
        );
        assert!(restored.contains(&kept.id()));
        assert!(!restored.contains(&promoted.id()));
        // counter carries over even though promoted bytes are not restored
        assert_eq!(restored.size_bytes(), scope.size_bytes());
    }
}
