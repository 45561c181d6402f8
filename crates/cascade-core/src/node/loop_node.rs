//! `loop` node: iterate over a resolved array, executing body nodes in a
//! scoped sub-context per item.
//!
//! Each iteration layers `iterationVariable` and `indexVariable` over the
//! outer step results. Body outputs from prior iterations are not visible;
//! within one iteration, later body nodes see earlier ones. The break
//! condition is evaluated with the current item bound, before its body
//! runs.

use std::collections::HashMap;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::definition::{LoopConfig, LoopExecutionMode, WorkflowNode};
use crate::executor::{Executor, RunContext};
use crate::interpolate::{resolve_expression, Scope};
use crate::node::NodeExecution;
use crate::predicate;
use crate::{EngineError, Result};

pub(crate) async fn run(
    exec: &Executor,
    rctx: &RunContext<'_>,
    node: &WorkflowNode,
    scope: &Scope,
) -> Result<NodeExecution> {
    let config: LoopConfig = node.config()?;

    let iterator = resolve_expression(&config.iterator_expression, scope);
    let items = match iterator {
        Value::Array(items) => items,
        other => {
            return Err(EngineError::Validation(format!(
                "loop '{}' iterator '{}' did not resolve to an array (got {})",
                node.id,
                config.iterator_expression,
                type_name(&other)
            )))
        }
    };

    let cap = config
        .max_iterations
        .unwrap_or(exec.settings().default_max_iterations) as usize;
    // Membership comes from the node's "body"-labeled edges, already in
    // topological order.
    let body_order = rctx
        .index
        .bodies
        .get(&node.id)
        .cloned()
        .unwrap_or_default();

    // Select the iterations to run: stop at the cap or on the first item
    // whose break condition holds (evaluated with the item already bound).
    let mut selected: Vec<(usize, Scope)> = Vec::new();
    let mut break_triggered = false;
    for (index, item) in items.iter().enumerate() {
        if selected.len() >= cap {
            break;
        }
        let bindings = HashMap::from([
            (config.iteration_variable.clone(), item.clone()),
            (config.index_variable.clone(), json!(index)),
        ]);
        let sub = scope.child(bindings);
        if let Some(break_condition) = &config.break_condition {
            if predicate::evaluate(break_condition, &sub)? {
                break_triggered = true;
                break;
            }
        }
        selected.push((index, sub));
    }

    debug!(
        node_id = %node.id,
        items = items.len(),
        selected = selected.len(),
        break_triggered,
        mode = ?config.execution_mode,
        "loop resolved iterations"
    );

    let iterations: Vec<Value> = match config.execution_mode {
        LoopExecutionMode::Sequential => {
            let mut results = Vec::with_capacity(selected.len());
            for (_, sub) in selected {
                results.push(run_iteration(exec, rctx, &body_order, sub).await?);
            }
            results
        }
        LoopExecutionMode::Parallel => {
            // Sub-contexts are isolated; results aggregate in input order.
            let futures = selected
                .into_iter()
                .map(|(_, sub)| run_iteration(exec, rctx, &body_order, sub));
            join_all(futures)
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?
        }
    };

    let output = json!({
        "iterations": iterations,
        "totalIterations": iterations.len(),
        "breakTriggered": break_triggered,
        "executionMode": config.execution_mode,
    });

    let input = json!({
        "iteratorExpression": config.iterator_expression,
        "itemCount": items.len(),
    });

    Ok(NodeExecution::new(input, output))
}

/// Execute the body nodes once under the iteration's sub-scope, yielding an
/// object keyed by body node id.
async fn run_iteration(
    exec: &Executor,
    rctx: &RunContext<'_>,
    body_order: &[String],
    mut sub: Scope,
) -> Result<Value> {
    let mut results = Map::new();
    for body_id in body_order {
        let execution = exec.execute_body_node(rctx, body_id, &sub).await?;
        sub.insert(body_id.clone(), execution.output.clone());
        results.insert(body_id.clone(), execution.output);
    }
    Ok(Value::Object(results))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
