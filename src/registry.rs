//! Capability and tool registries.
//!
//! Capabilities are the named task implementations a plan binds to; tools
//! are the callable side-channels capabilities and retrieval providers use.
//! Both registries are frozen once a run starts - the executor holds them
//! behind `Arc` and never registers during execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::RunContext;

/// A named, executable task implementation.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registered name, e.g. `search` or `issue_refund`.
    fn name(&self) -> &str;

    /// Whether executing this capability has external side effects.
    fn side_effects(&self) -> bool {
        false
    }

    /// JSON schema for the task input, if declared.
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// JSON schema for the task output, if declared.
    fn output_schema(&self) -> Option<Value> {
        None
    }

    /// Execute the task. Receives a read-only run view and the task input;
    /// returns the task output.
    async fn execute(&self, run: &RunContext, input: Value) -> Result<Value>;
}

impl std::fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability").field("name", &self.name()).finish()
    }
}

/// Capability metadata as reported by [`CapabilityRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub side_effects: bool,
}

/// Registry of capabilities, keyed by name.
#[derive(Default)]
pub struct CapabilityRegistry {
    by_name: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name. Re-registering a name
    /// replaces the previous implementation.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.by_name
            .insert(capability.name().to_string(), capability);
    }

    /// Resolve a capability by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Capability>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CapabilityMissing(name.to_string()))
    }

    /// Whether a capability is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Metadata for every registered capability, sorted by name.
    pub fn list(&self) -> Vec<CapabilityInfo> {
        self.by_name
            .values()
            .map(|c| CapabilityInfo {
                name: c.name().to_string(),
                side_effects: c.side_effects(),
            })
            .collect()
    }

    /// Declared input schema for a capability.
    pub fn input_schema(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.resolve(name)?.input_schema())
    }

    /// Declared output schema for a capability.
    pub fn output_schema(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.resolve(name)?.output_schema())
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A callable tool. Tool calls may suspend.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, input: Value) -> Result<Value>;
}

/// Registry of tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    by_name: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.by_name.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Adapter turning a closure into a [`Tool`], convenient for providers
/// and tests.
pub struct FnTool<F> {
    name: String,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, input: Value) -> Result<Value> {
        (self.func)(input)
    }
}
