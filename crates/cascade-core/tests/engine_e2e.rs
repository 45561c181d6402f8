//! End-to-end engine scenarios driven through the public service verbs
//! against an in-memory store.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use cascade_core::config::CascadeConfig;
use cascade_core::definition::{
    NodeKind, Owner, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};
use cascade_core::provider::{ScriptedModelProvider, StaticToolProvider};
use cascade_core::run::{ApprovalDecision, RunOutcome, RunStatus, StepStatus};
use cascade_core::service::{CreateRunInput, OwnerScope, WorkflowService};
use cascade_core::store::Database;

async fn service_with(tools: StaticToolProvider) -> (WorkflowService, Arc<StaticToolProvider>) {
    let db = Arc::new(Database::in_memory().await.unwrap());
    let tools = Arc::new(tools);
    let svc = WorkflowService::new(
        db,
        tools.clone(),
        Arc::new(ScriptedModelProvider::new()),
        CascadeConfig::default(),
    );
    (svc, tools)
}

async fn start(svc: &WorkflowService, definition: &WorkflowDefinition, input: Value) -> (Uuid, RunOutcome) {
    svc.create_definition(definition).await.unwrap();
    let run = svc
        .create_run(CreateRunInput {
            definition_id: definition.id,
            input,
            owner: Owner::default(),
        })
        .await
        .unwrap();
    let outcome = svc.start_run(run.id).await.unwrap();
    (run.id, outcome)
}

fn node(id: &str, kind: NodeKind, data: Value) -> WorkflowNode {
    WorkflowNode::new(id, kind, data)
}

fn tool(id: &str, tool_name: &str, args: Value) -> WorkflowNode {
    node(id, NodeKind::Tool, json!({"toolName": tool_name, "args": args}))
}

// ---------------------------------------------------------------------------
// Scenario 1: straight-line tool chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn straight_line_tool_chain() {
    let (svc, tools) =
        service_with(StaticToolProvider::new().with_tool("lookup", json!({"name": "Alice"}))).await;

    let definition = WorkflowDefinition::draft(
        "chain",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "lookup", json!({"id": "{{input.id}}"})),
            node("out", NodeKind::Output, json!({"value": "{{t1.name}}"})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({"id": "42"})).await;
    assert_eq!(outcome, RunOutcome::Completed { output: json!("Alice") });

    // The tool saw the interpolated argument.
    assert_eq!(tools.calls()[0].args, json!({"id": "42"}));

    // Three steps with contiguous numbering.
    let steps = svc.get_steps(run_id).await.unwrap();
    assert_eq!(steps.len(), 3);
    let numbers: Vec<i64> = steps.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let ids: Vec<&str> = steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(ids, vec!["input", "t1", "out"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    // Completed run: output non-null, error null.
    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("Alice")));
    assert!(run.error.is_none());
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
}

// ---------------------------------------------------------------------------
// Scenario 2: conditional branch
// ---------------------------------------------------------------------------

fn conditional_definition() -> WorkflowDefinition {
    WorkflowDefinition::draft(
        "branching",
        vec![
            node("input", NodeKind::Input, json!({})),
            node("c1", NodeKind::Condition, json!({"expression": "{{input.v}} > 10"})),
            tool("t_hi", "alert", json!({})),
            tool("t_lo", "noop", json!({})),
            node(
                "out",
                NodeKind::Output,
                json!({"value": {"hi": "{{t_hi.ok}}", "lo": "{{t_lo.ok}}"}}),
            ),
        ],
        vec![
            WorkflowEdge::new("input", "c1"),
            WorkflowEdge::labeled("c1", "t_hi", "true"),
            WorkflowEdge::labeled("c1", "t_lo", "false"),
            WorkflowEdge::new("t_hi", "out"),
            WorkflowEdge::new("t_lo", "out"),
        ],
    )
}

#[tokio::test]
async fn condition_selects_true_branch_and_skips_the_other() {
    let (svc, tools) = service_with(
        StaticToolProvider::new()
            .with_tool("alert", json!({"ok": "hi"}))
            .with_tool("noop", json!({"ok": "lo"})),
    )
    .await;

    let (run_id, outcome) = start(&svc, &conditional_definition(), json!({"v": 15})).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(tools.call_count("alert"), 1);
    assert_eq!(tools.call_count("noop"), 0);

    let steps = svc.get_steps(run_id).await.unwrap();
    let status_of = |id: &str| steps.iter().find(|s| s.node_id == id).unwrap().status;
    assert_eq!(status_of("t_hi"), StepStatus::Completed);
    assert_eq!(status_of("t_lo"), StepStatus::Skipped);
    assert_eq!(status_of("out"), StepStatus::Completed);
}

#[tokio::test]
async fn condition_selects_false_branch_for_small_input() {
    let (svc, tools) = service_with(
        StaticToolProvider::new()
            .with_tool("alert", json!({"ok": "hi"}))
            .with_tool("noop", json!({"ok": "lo"})),
    )
    .await;

    let (run_id, outcome) = start(&svc, &conditional_definition(), json!({"v": 3})).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(tools.call_count("alert"), 0);
    assert_eq!(tools.call_count("noop"), 1);

    let steps = svc.get_steps(run_id).await.unwrap();
    let status_of = |id: &str| steps.iter().find(|s| s.node_id == id).unwrap().status;
    assert_eq!(status_of("t_hi"), StepStatus::Skipped);
    assert_eq!(status_of("t_lo"), StepStatus::Completed);
}

// ---------------------------------------------------------------------------
// Scenario 3: loop with break
// ---------------------------------------------------------------------------

fn loop_definition(loop_data: Value) -> WorkflowDefinition {
    WorkflowDefinition::draft(
        "looping",
        vec![
            node("input", NodeKind::Input, json!({})),
            node("l1", NodeKind::Loop, loop_data),
            tool("b1", "echo", json!({"n": "{{n}}", "i": "{{index}}"})),
            node("out", NodeKind::Output, json!({"value": "{{l1.totalIterations}}"})),
        ],
        vec![
            WorkflowEdge::new("input", "l1"),
            // The "body" label marks the iteration body; the unlabeled
            // edge is the post-loop continuation.
            WorkflowEdge::labeled("l1", "b1", "body"),
            WorkflowEdge::new("l1", "out"),
        ],
    )
}

#[tokio::test]
async fn loop_breaks_when_the_condition_holds() {
    let (svc, tools) =
        service_with(StaticToolProvider::new().with_tool("echo", json!({"ok": true}))).await;

    let definition = loop_definition(json!({
        "iteratorExpression": "{{input.items}}",
        "iterationVariable": "n",
        "breakCondition": "{{n}} > 5",
        "bodyNodes": ["b1"]
    }));

    let (run_id, outcome) = start(&svc, &definition, json!({"items": [1, 3, 6, 8, 10]})).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    // Items 1 and 3 executed; 6 triggered the break.
    assert_eq!(tools.call_count("echo"), 2);
    assert_eq!(tools.calls()[0].args, json!({"n": 1, "i": 0}));
    assert_eq!(tools.calls()[1].args, json!({"n": 3, "i": 1}));

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    let state = run.engine_state.unwrap();
    let loop_output = &state.step_results["l1"];
    assert_eq!(loop_output["totalIterations"], 2);
    assert_eq!(loop_output["breakTriggered"], true);
    assert_eq!(loop_output["iterations"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_iterator_executes_no_bodies() {
    let (svc, tools) =
        service_with(StaticToolProvider::new().with_tool("echo", json!({"ok": true}))).await;

    let definition = loop_definition(json!({
        "iteratorExpression": "{{input.items}}",
        "iterationVariable": "n",
        "bodyNodes": ["b1"]
    }));

    let (run_id, outcome) = start(&svc, &definition, json!({"items": []})).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(tools.call_count("echo"), 0);

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    let state = run.engine_state.unwrap();
    let loop_output = &state.step_results["l1"];
    assert_eq!(loop_output["totalIterations"], 0);
    assert_eq!(loop_output["breakTriggered"], false);
}

#[tokio::test]
async fn max_iterations_caps_a_longer_iterator() {
    let (svc, tools) =
        service_with(StaticToolProvider::new().with_tool("echo", json!({"ok": true}))).await;

    let definition = loop_definition(json!({
        "iteratorExpression": "{{input.items}}",
        "iterationVariable": "n",
        "maxIterations": 2,
        "bodyNodes": ["b1"]
    }));

    let (_, outcome) = start(&svc, &definition, json!({"items": [1, 2, 3, 4, 5]})).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(tools.call_count("echo"), 2);
}

#[tokio::test]
async fn break_before_the_first_iteration_runs_nothing() {
    let (svc, tools) =
        service_with(StaticToolProvider::new().with_tool("echo", json!({"ok": true}))).await;

    let definition = loop_definition(json!({
        "iteratorExpression": "{{input.items}}",
        "iterationVariable": "n",
        "breakCondition": "{{n}} > 5",
        "bodyNodes": ["b1"]
    }));

    let (run_id, outcome) = start(&svc, &definition, json!({"items": [10, 1, 2]})).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(tools.call_count("echo"), 0);

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    let state = run.engine_state.unwrap();
    let loop_output = &state.step_results["l1"];
    assert_eq!(loop_output["totalIterations"], 0);
    assert_eq!(loop_output["breakTriggered"], true);
}

#[tokio::test]
async fn non_array_iterator_fails_the_run() {
    let (svc, _) = service_with(StaticToolProvider::new().with_tool("echo", json!({}))).await;

    let definition = loop_definition(json!({
        "iteratorExpression": "{{input.items}}",
        "iterationVariable": "n",
        "bodyNodes": ["b1"]
    }));

    let (run_id, outcome) = start(&svc, &definition, json!({"items": "not-an-array"})).await;
    let RunOutcome::Failed { error } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error["code"], "validation");

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

// ---------------------------------------------------------------------------
// Scenario 4: approval round-trip
// ---------------------------------------------------------------------------

fn approval_definition() -> WorkflowDefinition {
    WorkflowDefinition::draft(
        "gated",
        vec![
            node("input", NodeKind::Input, json!({})),
            node(
                "ap1",
                NodeKind::Approval,
                json!({"message": "Approve cost ${{input.cost}}"}),
            ),
            node(
                "out",
                NodeKind::Output,
                json!({"value": {"approved": "{{ap1.approved}}", "by": "{{ap1.approvedBy}}"}}),
            ),
        ],
        vec![
            WorkflowEdge::new("input", "ap1"),
            WorkflowEdge::new("ap1", "out"),
        ],
    )
}

#[tokio::test]
async fn approval_suspends_and_resumes_to_completion() {
    let (svc, _) = service_with(StaticToolProvider::new()).await;

    let (run_id, outcome) = start(&svc, &approval_definition(), json!({"cost": 5432})).await;
    let RunOutcome::Suspended { approval_id, node_id } = outcome else {
        panic!("expected suspension, got {outcome:?}");
    };
    assert_eq!(node_id, "ap1");

    // The suspended snapshot is durable and carries the pending pointer.
    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Suspended);
    assert!(run.suspended_at.is_some());
    let pending = run.engine_state.as_ref().unwrap().pending_approval.clone().unwrap();
    assert_eq!(pending.approval_id, approval_id);
    assert_eq!(pending.message.as_deref(), Some("Approve cost $5432"));

    // The in-memory registry has the record too.
    assert!(svc.coordinator().is_pending(approval_id));

    let outcome = svc
        .resume_run(run_id, ApprovalDecision::approve("u1"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            output: json!({"approved": true, "by": "u1"})
        }
    );

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.resumed_at.is_some());
}

#[tokio::test]
async fn rejected_approval_fails_the_run() {
    let (svc, _) = service_with(StaticToolProvider::new()).await;

    let (run_id, outcome) = start(&svc, &approval_definition(), json!({"cost": 1})).await;
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));

    let outcome = svc
        .resume_run(run_id, ApprovalDecision::reject("too expensive"))
        .await
        .unwrap();
    let RunOutcome::Failed { error } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error["code"], "approval-rejected");

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn resume_of_a_terminal_run_is_a_no_op() {
    let (svc, _) = service_with(StaticToolProvider::new()).await;

    let (run_id, _) = start(&svc, &approval_definition(), json!({"cost": 1})).await;
    let first = svc
        .resume_run(run_id, ApprovalDecision::approve("u1"))
        .await
        .unwrap();
    assert!(matches!(first, RunOutcome::Completed { .. }));

    let steps_before = svc.get_steps(run_id).await.unwrap().len();

    // A second resume returns the stored outcome and executes nothing.
    let second = svc
        .resume_run(run_id, ApprovalDecision::approve("u2"))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(svc.get_steps(run_id).await.unwrap().len(), steps_before);
}

#[tokio::test]
async fn cross_process_resume_reconstructs_from_the_snapshot() {
    let db = Arc::new(Database::in_memory().await.unwrap());
    let tools = Arc::new(StaticToolProvider::new());
    let svc_a = WorkflowService::new(
        db.clone(),
        tools.clone(),
        Arc::new(ScriptedModelProvider::new()),
        CascadeConfig::default(),
    );
    // A second service over the same store stands in for another process
    // instance: its coordinator and active registry are empty.
    let svc_b = WorkflowService::new(
        db,
        tools,
        Arc::new(ScriptedModelProvider::new()),
        CascadeConfig::default(),
    );

    let (run_id, outcome) = start(&svc_a, &approval_definition(), json!({"cost": 7})).await;
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));

    let outcome = svc_b
        .resume_run(run_id, ApprovalDecision::approve("u9"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            output: json!({"approved": true, "by": "u9"})
        }
    );

    let run = svc_b.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn approval_timeout_fails_the_run() {
    let (svc, _) = service_with(StaticToolProvider::new()).await;

    let definition = WorkflowDefinition::draft(
        "timed-gate",
        vec![
            node("input", NodeKind::Input, json!({})),
            node(
                "ap1",
                NodeKind::Approval,
                json!({"message": "hurry", "timeoutMinutes": 1}),
            ),
            node("out", NodeKind::Output, json!({})),
        ],
        vec![
            WorkflowEdge::new("input", "ap1"),
            WorkflowEdge::new("ap1", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));

    // Paused time fast-forwards the one-minute window.
    let mut status = RunStatus::Suspended;
    for _ in 0..5_000 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        status = svc
            .get_run(run_id, OwnerScope::default())
            .await
            .unwrap()
            .unwrap()
            .status;
        if status.is_terminal() {
            break;
        }
    }

    assert_eq!(status, RunStatus::Failed);
    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.error.unwrap()["code"], "approval-timeout");
}

// ---------------------------------------------------------------------------
// Scenario 5: compensation on failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_rolls_back_prior_tools_in_reverse_order() {
    let tools = StaticToolProvider::new()
        .with_tool("do-1", json!({"ok": 1}))
        .with_tool("do-2", json!({"ok": 2}))
        .with_failing_tool("do-3", "downstream is on fire")
        .with_tool("undo-1", json!({}))
        .with_tool("undo-2", json!({}))
        .with_compensation("do-1", "undo-1")
        .with_compensation("do-2", "undo-2")
        .with_compensation("do-3", "undo-3");
    let (svc, tools) = service_with(tools).await;

    let mut t3 = tool("t3", "do-3", json!({}));
    t3.retry_policy = Some(cascade_core::definition::RetryPolicy {
        max_attempts: Some(2),
        backoff_ms: Some(1),
        ..Default::default()
    });

    let definition = WorkflowDefinition::draft(
        "saga",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "do-1", json!({"step": 1})),
            tool("t2", "do-2", json!({"step": 2})),
            t3,
            node("out", NodeKind::Output, json!({})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "t2"),
            WorkflowEdge::new("t2", "t3"),
            WorkflowEdge::new("t3", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    let RunOutcome::Failed { error } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error["code"], "tool-failure");

    // Forward order, two failed attempts of do-3, then LIFO undo.
    let names: Vec<String> = tools.calls().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["do-1", "do-2", "do-3", "do-3", "undo-2", "undo-1"]);

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    // Failed run: error non-null, output null.
    assert!(run.error.is_some());
    assert!(run.output.is_none());
    // The persisted plan still lists both recorded entries.
    assert_eq!(run.engine_state.unwrap().compensation.len(), 2);

    // Only the reached nodes produced steps; t3's final attempt is the
    // failed record.
    let steps = svc.get_steps(run_id).await.unwrap();
    let ids: Vec<&str> = steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(ids, vec!["input", "t1", "t2", "t3"]);
    assert_eq!(steps.last().unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn unknown_tool_fails_after_exhausting_retries() {
    let (svc, tools) = service_with(
        StaticToolProvider::new()
            .with_tool("do-1", json!({}))
            .with_tool("undo-1", json!({}))
            .with_compensation("do-1", "undo-1"),
    )
    .await;

    let mut ghost = tool("ghost", "no-such-tool", json!({}));
    ghost.retry_policy = Some(cascade_core::definition::RetryPolicy {
        max_attempts: Some(3),
        backoff_ms: Some(1),
        ..Default::default()
    });

    let definition = WorkflowDefinition::draft(
        "ghost-tool",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "do-1", json!({})),
            ghost,
            node("out", NodeKind::Output, json!({})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "ghost"),
            WorkflowEdge::new("ghost", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    let RunOutcome::Failed { error } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error["code"], "tool-failure");
    assert_eq!(tools.call_count("no-such-tool"), 3);
    // The prior tool's compensation executed.
    assert_eq!(tools.call_count("undo-1"), 1);

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn flaky_tool_recovers_within_its_retry_budget() {
    let (svc, tools) =
        service_with(StaticToolProvider::new().with_flaky_tool("flaky", 2, json!({"ok": true})))
            .await;

    let mut t1 = tool("t1", "flaky", json!({}));
    t1.retry_policy = Some(cascade_core::definition::RetryPolicy {
        max_attempts: Some(3),
        backoff_ms: Some(1),
        ..Default::default()
    });

    let definition = WorkflowDefinition::draft(
        "flaky",
        vec![
            node("input", NodeKind::Input, json!({})),
            t1,
            node("out", NodeKind::Output, json!({"value": "{{t1.ok}}"})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    assert_eq!(outcome, RunOutcome::Completed { output: json!(true) });
    assert_eq!(tools.call_count("flaky"), 3);

    // Retries share one step record: the final attempt's outcome.
    let steps = svc.get_steps(run_id).await.unwrap();
    let t1_steps: Vec<_> = steps.iter().filter(|s| s.node_id == "t1").collect();
    assert_eq!(t1_steps.len(), 1);
    assert_eq!(t1_steps[0].status, StepStatus::Completed);
}

// ---------------------------------------------------------------------------
// Scenario 6: cross-tenant isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_are_invisible_across_tenants() {
    let (svc, _) = service_with(StaticToolProvider::new().with_tool("noop", json!({}))).await;

    let definition = WorkflowDefinition::draft(
        "tenanted",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "noop", json!({})),
            node("out", NodeKind::Output, json!({})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "out"),
        ],
    );
    svc.create_definition(&definition).await.unwrap();

    let run = svc
        .create_run(CreateRunInput {
            definition_id: definition.id,
            input: json!({}),
            owner: Owner {
                user_id: Some("u1".into()),
                org_id: Some("org-a".into()),
            },
        })
        .await
        .unwrap();

    let for_org_b = svc
        .get_run(run.id, OwnerScope { user_id: None, org_id: Some("org-b".into()) })
        .await
        .unwrap();
    assert!(for_org_b.is_none());

    let for_org_a = svc
        .get_run(run.id, OwnerScope { user_id: None, org_id: Some("org-a".into()) })
        .await
        .unwrap();
    assert!(for_org_a.is_some());

    let for_user_2 = svc
        .get_run(run.id, OwnerScope { user_id: Some("u2".into()), org_id: None })
        .await
        .unwrap();
    assert!(for_user_2.is_none());

    let for_user_1 = svc
        .get_run(run.id, OwnerScope { user_id: Some("u1".into()), org_id: None })
        .await
        .unwrap();
    assert!(for_user_1.is_some());
}

// ---------------------------------------------------------------------------
// Parallel nodes and persistence laws
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_node_gathers_outputs_by_body_id() {
    let (svc, _) = service_with(
        StaticToolProvider::new()
            .with_tool("ta", json!({"a": 1}))
            .with_tool("tb", json!({"b": 2})),
    )
    .await;

    // Body membership declared by "body"-labeled edges alone.
    let definition = WorkflowDefinition::draft(
        "fan-out",
        vec![
            node("input", NodeKind::Input, json!({})),
            node("p1", NodeKind::Parallel, json!({})),
            tool("pa", "ta", json!({})),
            tool("pb", "tb", json!({})),
            node("out", NodeKind::Output, json!({"value": "{{p1}}"})),
        ],
        vec![
            WorkflowEdge::new("input", "p1"),
            WorkflowEdge::labeled("p1", "pa", "body"),
            WorkflowEdge::labeled("p1", "pb", "body"),
            WorkflowEdge::new("p1", "out"),
        ],
    );

    let (_, outcome) = start(&svc, &definition, json!({})).await;
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            output: json!({"pa": {"a": 1}, "pb": {"b": 2}})
        }
    );
}

#[tokio::test]
async fn parallel_fail_fast_fails_the_node() {
    let (svc, tools) = service_with(
        StaticToolProvider::new()
            .with_tool("ta", json!({"a": 1}))
            .with_failing_tool("tb", "nope"),
    )
    .await;

    // The data list is the designer-facing duplicate of the body edges.
    let mut p1 = node("p1", NodeKind::Parallel, json!({"bodyNodes": ["pa", "pb"]}));
    p1.retry_policy = Some(cascade_core::definition::RetryPolicy {
        max_attempts: Some(1),
        ..Default::default()
    });
    let mut pb = tool("pb", "tb", json!({}));
    pb.retry_policy = Some(cascade_core::definition::RetryPolicy {
        max_attempts: Some(1),
        ..Default::default()
    });

    let definition = WorkflowDefinition::draft(
        "fan-out-fail",
        vec![
            node("input", NodeKind::Input, json!({})),
            p1,
            tool("pa", "ta", json!({})),
            pb,
            node("out", NodeKind::Output, json!({})),
        ],
        vec![
            WorkflowEdge::new("input", "p1"),
            WorkflowEdge::labeled("p1", "pa", "body"),
            WorkflowEdge::labeled("p1", "pb", "body"),
            WorkflowEdge::new("p1", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    assert_eq!(tools.call_count("tb"), 1);

    let run = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn snapshot_round_trip_is_stable() {
    let (svc, _) =
        service_with(StaticToolProvider::new().with_tool("lookup", json!({"name": "Alice"}))).await;

    let definition = WorkflowDefinition::draft(
        "stable",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "lookup", json!({"id": "{{input.id}}"})),
            node("out", NodeKind::Output, json!({"value": "{{t1.name}}"})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "out"),
        ],
    );

    let (run_id, _) = start(&svc, &definition, json!({"id": "7"})).await;

    let first = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();
    let second = svc.get_run(run_id, OwnerScope::default()).await.unwrap().unwrap();

    assert_eq!(first.engine_state, second.engine_state);
    assert_eq!(first.status, second.status);
    assert_eq!(first.output, second.output);

    let state = first.engine_state.unwrap();
    assert_eq!(state.step_results["input"], json!({"id": "7"}));
    assert_eq!(state.step_results["t1"], json!({"name": "Alice"}));
    assert!(state.compensation.is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_suspended_run_rolls_back_and_terminates() {
    let tools = StaticToolProvider::new()
        .with_tool("do-1", json!({}))
        .with_tool("undo-1", json!({}))
        .with_compensation("do-1", "undo-1");
    let (svc, tools) = service_with(tools).await;

    let definition = WorkflowDefinition::draft(
        "cancel-me",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "do-1", json!({})),
            node("ap1", NodeKind::Approval, json!({"message": "go on?"})),
            node("out", NodeKind::Output, json!({})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "ap1"),
            WorkflowEdge::new("ap1", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));

    svc.cancel_run(run_id).await.unwrap();

    // The run task observes the cancel at its suspension point.
    let mut status = RunStatus::Suspended;
    for _ in 0..200 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        status = svc
            .get_run(run_id, OwnerScope::default())
            .await
            .unwrap()
            .unwrap()
            .status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, RunStatus::Cancelled);
    assert_eq!(tools.call_count("undo-1"), 1);
}

// ---------------------------------------------------------------------------
// Gated tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gated_tool_suspends_then_executes_on_approval() {
    let tools = StaticToolProvider::new()
        .with_tool("deploy", json!({"deployed": true}))
        .with_approval_required("deploy");
    let (svc, tools) = service_with(tools).await;

    let definition = WorkflowDefinition::draft(
        "gated-tool",
        vec![
            node("input", NodeKind::Input, json!({})),
            tool("t1", "deploy", json!({"env": "prod"})),
            node("out", NodeKind::Output, json!({"value": "{{t1.deployed}}"})),
        ],
        vec![
            WorkflowEdge::new("input", "t1"),
            WorkflowEdge::new("t1", "out"),
        ],
    );

    let (run_id, outcome) = start(&svc, &definition, json!({})).await;
    let RunOutcome::Suspended { node_id, .. } = outcome else {
        panic!("expected suspension");
    };
    assert_eq!(node_id, "t1");
    assert_eq!(tools.call_count("deploy"), 0);

    let outcome = svc
        .resume_run(run_id, ApprovalDecision::approve("release-manager"))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed { output: json!(true) });
    assert_eq!(tools.call_count("deploy"), 1);
}
