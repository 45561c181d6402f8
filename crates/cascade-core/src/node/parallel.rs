//! `parallel` node: execute listed body nodes concurrently and gather
//! their outputs keyed by body node id.

use std::collections::HashMap;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::definition::{ParallelConfig, WorkflowNode};
use crate::executor::{Executor, RunContext};
use crate::interpolate::Scope;
use crate::node::NodeExecution;
use crate::{EngineError, Result};

pub(crate) async fn run(
    exec: &Executor,
    rctx: &RunContext<'_>,
    node: &WorkflowNode,
    scope: &Scope,
) -> Result<NodeExecution> {
    let config: ParallelConfig = node.config()?;
    // Membership comes from the node's "body"-labeled edges.
    let body_ids = rctx
        .index
        .bodies
        .get(&node.id)
        .cloned()
        .unwrap_or_default();

    // Branches get a child token so fail-fast can stop siblings without
    // cancelling the run itself.
    let branch_cancel = rctx.cancel.child_token();
    let branch_ctx = RunContext {
        cancel: branch_cancel.clone(),
        ..rctx.clone()
    };

    let mut branches = FuturesUnordered::new();
    for body_id in body_ids.clone() {
        let sub = scope.child(HashMap::new());
        let ctx = branch_ctx.clone();
        branches.push(async move {
            let result = exec.execute_body_node(&ctx, &body_id, &sub).await;
            (body_id, result)
        });
    }

    let mut outputs = Map::new();
    let mut first_error: Option<EngineError> = None;

    while let Some((body_id, result)) = branches.next().await {
        match result {
            Ok(execution) => {
                outputs.insert(body_id, execution.output);
            }
            Err(error) => {
                if config.fail_fast {
                    if first_error.is_none() {
                        warn!(node_id = %node.id, body = %body_id, %error, "parallel branch failed, cancelling siblings");
                        branch_cancel.cancel();
                        first_error = Some(error);
                    }
                } else {
                    // Partial-result mode records the failure in place.
                    outputs.insert(body_id, json!({ "error": error.to_string() }));
                }
            }
        }
    }

    if let Some(error) = first_error {
        return Err(error);
    }

    debug!(node_id = %node.id, branches = body_ids.len(), "parallel node gathered");

    let input = json!({ "bodyNodes": body_ids, "failFast": config.fail_fast });
    Ok(NodeExecution::new(input, Value::Object(outputs)))
}
