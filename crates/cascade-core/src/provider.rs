//! Collaborator interfaces consumed by the core.
//!
//! The tool catalog and the AI model provider are external systems; the
//! engine sees them only through these traits. The in-memory
//! implementations below back tests and the CLI's dry-run mode.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Tool provider
// ---------------------------------------------------------------------------

/// Undo action a tool declares in its catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCompensation {
    /// Undo action name, dispatched like any other tool.
    pub action: String,
    /// Undo arguments; `None` binds the forward call's arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// Opaque tool dispatch: `execute_tool(name, args) → result`.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Execute the named tool. May be slow; the executor wraps calls in the
    /// node timeout. Failures surface as `ToolFailure` and retry under the
    /// node's policy.
    async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value>;

    /// The undo action the catalog declares for this tool, if any.
    fn compensation_for(&self, _name: &str) -> Option<ToolCompensation> {
        None
    }

    /// Whether the catalog requires a human confirmation before this tool
    /// runs. The executor suspends the run the same way an approval node
    /// does.
    fn requires_approval(&self, _name: &str) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Model provider
// ---------------------------------------------------------------------------

/// Request for one text generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateTextRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON-only response (ai-step output schemas).
    pub json_mode: bool,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One generation result.
#[derive(Debug, Clone)]
pub struct TextGeneration {
    pub text: String,
    pub usage: TokenUsage,
}

/// Opaque model dispatch: `generate_text(model, system, prompt, options)`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate_text(&self, request: GenerateTextRequest) -> Result<TextGeneration>;
}

// ---------------------------------------------------------------------------
// In-memory tool provider
// ---------------------------------------------------------------------------

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct RecordedToolCall {
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
enum ToolBehaviour {
    Return(Value),
    Fail(String),
    /// Fail the first `n` calls, then return the value.
    FlakyThenReturn(u32, Value),
}

/// Scriptable tool catalog that records every call it receives.
#[derive(Default)]
pub struct StaticToolProvider {
    tools: HashMap<String, ToolBehaviour>,
    compensations: HashMap<String, ToolCompensation>,
    approvals_required: HashMap<String, bool>,
    calls: Mutex<Vec<RecordedToolCall>>,
    failures_seen: Mutex<HashMap<String, u32>>,
}

impl StaticToolProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool that always succeeds with `value`.
    pub fn with_tool(mut self, name: impl Into<String>, value: Value) -> Self {
        self.tools.insert(name.into(), ToolBehaviour::Return(value));
        self
    }

    /// Register a tool that always fails.
    pub fn with_failing_tool(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.tools
            .insert(name.into(), ToolBehaviour::Fail(message.into()));
        self
    }

    /// Register a tool that fails `failures` times before succeeding.
    pub fn with_flaky_tool(mut self, name: impl Into<String>, failures: u32, value: Value) -> Self {
        self.tools
            .insert(name.into(), ToolBehaviour::FlakyThenReturn(failures, value));
        self
    }

    /// Declare an undo action for a registered tool.
    pub fn with_compensation(mut self, name: impl Into<String>, action: impl Into<String>) -> Self {
        self.compensations.insert(
            name.into(),
            ToolCompensation {
                action: action.into(),
                args: None,
            },
        );
        self
    }

    /// Require human confirmation before this tool runs.
    pub fn with_approval_required(mut self, name: impl Into<String>) -> Self {
        self.approvals_required.insert(name.into(), true);
        self
    }

    /// All invocations observed so far, in call order.
    pub fn calls(&self) -> Vec<RecordedToolCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations of one tool.
    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name == name)
            .count()
    }
}

#[async_trait]
impl ToolProvider for StaticToolProvider {
    async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value> {
        self.calls.lock().unwrap().push(RecordedToolCall {
            name: name.to_string(),
            args: args.clone(),
        });

        match self.tools.get(name) {
            Some(ToolBehaviour::Return(value)) => Ok(value.clone()),
            Some(ToolBehaviour::Fail(message)) => Err(EngineError::ToolFailure {
                tool: name.to_string(),
                message: message.clone(),
            }),
            Some(ToolBehaviour::FlakyThenReturn(failures, value)) => {
                let mut seen = self.failures_seen.lock().unwrap();
                let count = seen.entry(name.to_string()).or_insert(0);
                if *count < *failures {
                    *count += 1;
                    Err(EngineError::ToolFailure {
                        tool: name.to_string(),
                        message: format!("transient failure {count}/{failures}"),
                    })
                } else {
                    Ok(value.clone())
                }
            }
            None => Err(EngineError::ToolFailure {
                tool: name.to_string(),
                message: "unknown tool".to_string(),
            }),
        }
    }

    fn compensation_for(&self, name: &str) -> Option<ToolCompensation> {
        self.compensations.get(name).cloned()
    }

    fn requires_approval(&self, name: &str) -> bool {
        self.approvals_required.get(name).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// In-memory model provider
// ---------------------------------------------------------------------------

/// Scriptable model: returns queued responses in order, then echoes the
/// prompt. Usage numbers are synthesized from text lengths.
#[derive(Default)]
pub struct ScriptedModelProvider {
    responses: Mutex<std::collections::VecDeque<String>>,
    requests: Mutex<Vec<GenerateTextRequest>>,
}

impl ScriptedModelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(text.into());
        self
    }

    /// All generation requests observed so far.
    pub fn requests(&self) -> Vec<GenerateTextRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedModelProvider {
    async fn generate_text(&self, request: GenerateTextRequest) -> Result<TextGeneration> {
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("echo: {}", request.prompt));

        let usage = TokenUsage {
            prompt_tokens: request.prompt.len() as u64 / 4,
            completion_tokens: text.len() as u64 / 4,
            total_tokens: (request.prompt.len() + text.len()) as u64 / 4,
        };

        self.requests.lock().unwrap().push(request);

        Ok(TextGeneration { text, usage })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
