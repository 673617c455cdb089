//! Core context types: Goal, Artifact, Context.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::canonical::{canonical_bytes, sha256_hex};

/// What the caller wants achieved. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique goal id
    pub id: String,
    /// Free-form statement of intent
    pub intent: String,
    /// Opaque constraint map consumed by planner and nucleus
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub constraints: HashMap<String, Value>,
}

impl Goal {
    /// Create a goal with a generated id.
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            id: format!("goal-{}", Uuid::new_v4()),
            intent: intent.into(),
            constraints: HashMap::new(),
        }
    }

    /// Create a goal with an explicit id.
    pub fn with_id(id: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            intent: intent.into(),
            constraints: HashMap::new(),
        }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }
}

/// A typed unit of retrieved data with provenance and an optional
/// promotion flag.
///
/// Identity is content-addressed: `(type, sha256(content))`. Two artifacts
/// with the same type and structurally equal content share an id and are
/// de-duplicated wherever they land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Namespaced type, e.g. `crm.customer`
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Opaque payload
    pub content: Value,
    /// Whether to promote into the durable context
    #[serde(default)]
    pub promote: bool,
    /// Where the artifact came from (provider, directive, timestamps)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provenance: HashMap<String, Value>,
    /// Size of the canonical content encoding
    #[serde(default)]
    pub size_bytes: u64,
}

impl Artifact {
    /// Create an artifact; `size_bytes` is derived from the canonical
    /// content encoding.
    pub fn new(artifact_type: impl Into<String>, content: Value) -> Self {
        let size_bytes = canonical_bytes(&content).len() as u64;
        Self {
            artifact_type: artifact_type.into(),
            content,
            promote: false,
            provenance: HashMap::new(),
            size_bytes,
        }
    }

    /// Mark the artifact for promotion into the durable context.
    pub fn promoted(mut self) -> Self {
        self.promote = true;
        self
    }

    /// Record a provenance entry.
    pub fn with_provenance(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.provenance.insert(key.into(), value.into());
        self
    }

    /// Content-addressed artifact id: `sha256(type ‖ canonical(content))`.
    pub fn id(&self) -> String {
        let mut bytes = Vec::with_capacity(self.artifact_type.len() + 1 + self.size_bytes as usize);
        bytes.extend_from_slice(self.artifact_type.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&canonical_bytes(&self.content));
        sha256_hex(&bytes)
    }

    /// Decode an artifact from a provider tool result.
    ///
    /// Values that already carry a `type` field deserialize directly;
    /// anything else is wrapped as a `<tool>.result` artifact so lenient
    /// providers still produce addressable content.
    pub fn from_tool_result(tool_name: &str, value: Value) -> Self {
        if value.get("type").and_then(Value::as_str).is_some() {
            if let Ok(mut artifact) = serde_json::from_value::<Artifact>(value.clone()) {
                if artifact.size_bytes == 0 {
                    artifact.size_bytes = canonical_bytes(&artifact.content).len() as u64;
                }
                return artifact;
            }
        }
        Self::new(format!("{}.result", tool_name), value)
    }
}

/// Immutable bundle of facts and augmentations, content-addressed by
/// [`Context::context_ref`].
///
/// Any mutation is copy-on-write: `with_fact` and `with_augmentation`
/// return a new `Context`, never mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Context packet id
    pub id: String,
    /// Named facts; sorted map so the ref is stable
    #[serde(default)]
    pub facts: BTreeMap<String, Value>,
    /// Promoted artifacts, in promotion order
    #[serde(default)]
    pub augmentations: Vec<Artifact>,
    /// Optional caller-assigned version tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Context {
    /// Create an empty context with a generated id.
    pub fn new() -> Self {
        Self::with_id(format!("ctx-{}", Uuid::new_v4()))
    }

    /// Create an empty context with an explicit id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            facts: BTreeMap::new(),
            augmentations: Vec::new(),
            version: None,
        }
    }

    /// Copy-on-write fact insertion.
    pub fn with_fact(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.facts.insert(key.into(), value.into());
        next
    }

    /// Copy-on-write augmentation append. Idempotent: promoting an artifact
    /// whose id is already present returns an unchanged clone.
    pub fn with_augmentation(&self, artifact: Artifact) -> Self {
        let id = artifact.id();
        if self.augmentations.iter().any(|a| a.id() == id) {
            return self.clone();
        }
        let mut next = self.clone();
        next.augmentations.push(artifact);
        next
    }

    /// Read a fact.
    pub fn fact(&self, key: &str) -> Option<&Value> {
        self.facts.get(key)
    }

    /// Ids of all promoted artifacts.
    pub fn augmentation_ids(&self) -> Vec<String> {
        self.augmentations.iter().map(Artifact::id).collect()
    }

    /// Content address over facts and augmentations.
    pub fn context_ref(&self) -> String {
        let body = json!({
            "facts": self.facts,
            "augmentations": self.augmentations,
        });
        sha256_hex(&canonical_bytes(&body))
    }

    /// Facts as a JSON object, the `context` root for guard evaluation.
    pub fn facts_value(&self) -> Value {
        Value::Object(
            self.facts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_artifact_identity_ignores_key_order() {
        let a = Artifact::new("crm.customer", json!({"name": "Alice", "tier": "gold"}));
        let b = Artifact::new("crm.customer", json!({"tier": "gold", "name": "Alice"}));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_artifact_identity_includes_type() {
        let a = Artifact::new("crm.customer", json!({"name": "Alice"}));
        let b = Artifact::new("billing.customer", json!({"name": "Alice"}));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_context_ref_changes_on_promotion() {
        let ctx = Context::with_id("c1").with_fact("region", "eu");
        let before = ctx.context_ref();
        let promoted = ctx.with_augmentation(Artifact::new("doc", json!("hello")));
        assert_ne!(before, promoted.context_ref());
        assert_eq!(before, ctx.context_ref());
    }

    #[test]
    fn test_promotion_is_idempotent() {
        let artifact = Artifact::new("doc", json!({"page": 1}));
        let ctx = Context::with_id("c1").with_augmentation(artifact.clone());
        let again = ctx.with_augmentation(artifact);
        assert_eq!(ctx.augmentations.len(), 1);
        assert_eq!(again.augmentations.len(), 1);
        assert_eq!(ctx.context_ref(), again.context_ref());
    }

    #[test]
    fn test_from_tool_result_passthrough_and_wrap() {
        let typed = Artifact::from_tool_result(
            "crm_lookup",
            json!({"type": "crm.customer", "content": {"name": "Alice"}, "promote": true}),
        );
        assert_eq!(typed.artifact_type, "crm.customer");
        assert!(typed.promote);
        assert!(typed.size_bytes > 0);

        let wrapped = Artifact::from_tool_result("crm_lookup", json!(["raw", "rows"]));
        assert_eq!(wrapped.artifact_type, "crm_lookup.result");
    }
}
