//! `ai-step` node: prompt interpolation, model invocation, and optional
//! JSON-mode output validation.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::definition::{AiStepConfig, FieldType, WorkflowNode};
use crate::interpolate::{interpolate, Scope};
use crate::node::NodeExecution;
use crate::provider::{GenerateTextRequest, ModelProvider};
use crate::{EngineError, Result};

const JSON_MODE_DIRECTIVE: &str =
    "Respond with a single valid JSON object matching the requested shape. \
     Do not include any prose outside the JSON.";

pub(crate) async fn run(
    node: &WorkflowNode,
    scope: &Scope,
    model: &dyn ModelProvider,
) -> Result<NodeExecution> {
    let config: AiStepConfig = node.config()?;

    let prompt = interpolate(&config.prompt, scope);
    let mut system = config.system_prompt.as_deref().map(|s| interpolate(s, scope));

    let json_mode = config.output_schema.is_some();
    if let Some(schema) = &config.output_schema {
        let shape = schema_directive(schema);
        system = Some(match system {
            Some(existing) => format!("{existing}\n\n{JSON_MODE_DIRECTIVE}\n{shape}"),
            None => format!("{JSON_MODE_DIRECTIVE}\n{shape}"),
        });
    }

    let request = GenerateTextRequest {
        model: config.model.clone(),
        system,
        prompt: prompt.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        json_mode,
    };

    let generation = model.generate_text(request).await?;
    debug!(
        node_id = %node.id,
        model = %config.model,
        total_tokens = generation.usage.total_tokens,
        "ai step generated"
    );

    let input = json!({
        "model": config.model,
        "prompt": prompt,
    });

    let output = match &config.output_schema {
        Some(schema) => validate_structured(&node.id, &config.model, &generation.text, schema)?,
        None => json!({
            "text": generation.text,
            "usage": generation.usage,
        }),
    };

    Ok(NodeExecution::new(input, output))
}

fn schema_directive(schema: &HashMap<String, FieldType>) -> String {
    let mut fields: Vec<String> = schema
        .iter()
        .map(|(name, ty)| {
            let ty = format!("{ty:?}").to_lowercase();
            format!("  \"{name}\": {ty}")
        })
        .collect();
    fields.sort();
    format!("Expected fields:\n{{\n{}\n}}", fields.join(",\n"))
}

/// Parse the model's text as JSON and check every declared field for
/// presence and type. Both parse and type failures are model failures so
/// the executor retries them under the node's policy.
fn validate_structured(
    node_id: &str,
    model: &str,
    text: &str,
    schema: &HashMap<String, FieldType>,
) -> Result<Value> {
    let parsed: Value =
        serde_json::from_str(strip_fences(text)).map_err(|e| EngineError::ModelFailure {
            model: model.to_string(),
            message: format!("node '{node_id}' expected JSON output: {e}"),
        })?;

    let object = parsed.as_object().ok_or_else(|| EngineError::ModelFailure {
        model: model.to_string(),
        message: format!("node '{node_id}' expected a JSON object"),
    })?;

    for (field, expected) in schema {
        match object.get(field) {
            None => {
                return Err(EngineError::ModelFailure {
                    model: model.to_string(),
                    message: format!("node '{node_id}' output is missing field '{field}'"),
                })
            }
            Some(value) if !expected.matches(value) => {
                return Err(EngineError::ModelFailure {
                    model: model.to_string(),
                    message: format!(
                        "node '{node_id}' output field '{field}' is not a {expected:?}"
                    ),
                })
            }
            Some(_) => {}
        }
    }

    Ok(parsed)
}

/// Models often wrap JSON in markdown fences despite the directive.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}
