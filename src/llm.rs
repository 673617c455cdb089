//! The LLM call seam.
//!
//! Provider adapters live outside the core; the runtime sees a single
//! [`LlmCall`] trait whose request/response shapes carry a prompt, the tool
//! specs offered for the round, and the structured tool calls the model
//! returned. Deterministic replay relies on implementations honoring
//! `LlmConfig::seed` where the provider supports it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Provider/model selection and sampling parameters for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl LlmConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A tool offered to the model for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

impl LlmToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// A structured tool call returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// One prompt round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<LlmToolSpec>,
    #[serde(default)]
    pub config: LlmConfig,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            tools: Vec::new(),
            config: LlmConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<LlmToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }
}

/// Model output for one round: free-form reasoning, zero or more tool
/// calls, and optionally a final structured answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<LlmToolCall>,
    /// Final structured output, present when the model answered instead of
    /// calling tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Raw provider payload for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl LlmResponse {
    /// A final answer with no tool calls.
    pub fn answer(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// A response consisting of tool calls.
    pub fn calls(tool_calls: Vec<LlmToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// The single function the core needs from an LLM provider.
#[async_trait]
pub trait LlmCall: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_serde_shape() {
        let request = LlmRequest::new("Summarize the findings")
            .with_tools(vec![LlmToolSpec::new("query_context", "Read the scope")])
            .with_config(LlmConfig::new("anthropic", "claude-sonnet-4").with_seed(7));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["config"]["seed"], json!(7));
        assert_eq!(value["tools"][0]["name"], json!("query_context"));
    }

    #[test]
    fn test_answer_has_no_tool_calls() {
        let response = LlmResponse::answer(json!({"summary": "ab"}));
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.output, Some(json!({"summary": "ab"})));
    }
}
