//! `delay` node: cancellation-aware sleep.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::definition::{DelayConfig, WorkflowNode};
use crate::node::NodeExecution;
use crate::{EngineError, Result};

pub(crate) async fn run(node: &WorkflowNode, cancel: &CancellationToken) -> Result<NodeExecution> {
    let config: DelayConfig = node.config()?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(config.ms)) => {
            Ok(NodeExecution::new(json!({ "ms": config.ms }), Value::Null))
        }
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}
