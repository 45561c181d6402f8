//! `webhook` node: outbound HTTP request with interpolated url, headers,
//! and body.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::definition::{WebhookConfig, WorkflowNode};
use crate::interpolate::{interpolate, interpolate_value, Scope};
use crate::node::NodeExecution;
use crate::{EngineError, Result};

pub(crate) async fn run(
    node: &WorkflowNode,
    scope: &Scope,
    client: &reqwest::Client,
) -> Result<NodeExecution> {
    let config: WebhookConfig = node.config()?;

    let url = interpolate(&config.url, scope);
    let method: reqwest::Method = config.method.to_uppercase().parse().map_err(|_| {
        EngineError::Validation(format!(
            "node '{}' has invalid HTTP method '{}'",
            node.id, config.method
        ))
    })?;

    let headers: HashMap<String, String> = config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), interpolate(v, scope)))
        .collect();
    let body = config.body.as_ref().map(|b| interpolate_value(b, scope));

    let mut request = client.request(method.clone(), &url);
    for (name, value) in &headers {
        request = request.header(name, value);
    }
    if let Some(body) = &body {
        request = request.json(body);
    }

    let input = json!({
        "url": url,
        "method": method.as_str(),
        "headers": headers,
        "body": body,
    });

    let response = request.send().await.map_err(|e| EngineError::ToolFailure {
        tool: format!("webhook:{url}"),
        message: e.to_string(),
    })?;

    let status = response.status().as_u16();
    let response_headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();

    let text = response.text().await.map_err(|e| EngineError::ToolFailure {
        tool: format!("webhook:{url}"),
        message: format!("failed to read response body: {e}"),
    })?;

    debug!(node_id = %node.id, %url, status, "webhook responded");

    if !(200..300).contains(&status) && !config.allow_non_2xx {
        return Err(EngineError::ToolFailure {
            tool: format!("webhook:{url}"),
            message: format!("unexpected status {status}: {text}"),
        });
    }

    // Hand JSON bodies through typed; anything else stays a string.
    let body_value = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

    let output = json!({
        "status": status,
        "headers": response_headers,
        "body": body_value,
    });

    Ok(NodeExecution::new(input, output))
}
