use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use stepflow_engine::{
    ActionExecutor, Engine, EngineConfig, ResolvedAction, Scope, parse_workflow_document,
    resolve::resolve,
};
use stepflow_types::{ErrorKind, ExitReason, RunStatus, SkipReason, StepStatus, WorkflowDefinition};

/// Echoes inputs back, records every call, and fails actions whose `fail` input is `"yes"`.
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<ResolvedAction>>,
}

impl RecordingExecutor {
    fn called_ids(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|call| call.step_id.clone()).collect()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<Value> {
        self.calls.lock().unwrap().push(action.clone());
        if action.inputs.get("fail").map(String::as_str) == Some("yes") {
            let detail = action.inputs.get("detail").cloned().unwrap_or_default();
            bail!("step {} failed: {detail}", action.step_id);
        }
        Ok(serde_json::to_value(&action.inputs)?)
    }
}

fn load(yaml: &str) -> WorkflowDefinition {
    let bundle = parse_workflow_document(yaml).expect("workflow document");
    bundle.first().cloned().expect("one workflow")
}

fn engine() -> (Engine, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    (Engine::new(executor.clone()), executor)
}

#[tokio::test]
async fn false_condition_hides_the_whole_subtree() {
    let workflow = load(
        r#"
workflow: skip
steps:
  - id: outer
    kind: group
    condition: "{{run_outer}}"
    children:
      - id: middle
        kind: loop
        loop: { type: count, count: 3 }
        children:
          - id: leaf
            kind: action
            actionType: record
  - id: sibling
    kind: action
    actionType: record
"#,
    );
    let (engine, executor) = engine();
    let mut scope = Scope::new();
    scope.set("run_outer", json!(false));

    let trace = engine.run(&workflow.steps, scope).await;
    let all: Vec<_> = trace.steps.iter().flat_map(|step| step.walk()).collect();
    assert_eq!(all.iter().filter(|execution| execution.step_id == "outer").count(), 1);
    assert!(!all.iter().any(|execution| execution.step_id == "middle" || execution.step_id == "leaf"));
    assert_eq!(trace.steps[0].skip_reason, Some(SkipReason::Condition));
    assert_eq!(executor.called_ids(), vec!["sibling"]);
}

#[tokio::test]
async fn endless_while_loop_runs_exactly_max_iterations() {
    let workflow = load(
        r#"
workflow: spin
steps:
  - id: poll
    kind: loop
    loop:
      type: while
      condition: "{{ready}} != true"
      maxIterations: 7
    children:
      - id: check
        kind: action
        actionType: record
"#,
    );
    let (engine, executor) = engine();
    let mut scope = Scope::new();
    scope.set("ready", json!(false));

    let trace = engine.run(&workflow.steps, scope).await;
    let detail = trace.steps[0].loop_execution.as_ref().expect("loop detail");
    assert_eq!(detail.iterations.len(), 7);
    assert_eq!(detail.exit_reason, ExitReason::MaxIterations);
    assert_eq!(executor.called_ids().len(), 7);
}

#[tokio::test]
async fn every_loop_type_honors_the_iteration_cap() {
    let workflow = load(
        r#"
workflow: capped
steps:
  - id: many_items
    kind: loop
    loop: { type: forEach, source: "{{items}}", maxIterations: 2 }
    children:
      - { id: visit, kind: action, actionType: record, inputs: { item: "{{item}}" } }
  - id: exact_items
    kind: loop
    loop: { type: forEach, source: "[1,2]", maxIterations: 2 }
    children:
      - { id: exact, kind: action, actionType: record }
  - id: many_rounds
    kind: loop
    loop: { type: count, count: 50, maxIterations: 5 }
    children:
      - { id: tick, kind: action, actionType: record }
"#,
    );
    let (engine, executor) = engine();
    let mut scope = Scope::new();
    scope.set("items", json!(["a", "b", "c", "d"]));

    let trace = engine.run(&workflow.steps, scope).await;
    let exits: Vec<_> = trace
        .steps
        .iter()
        .map(|step| {
            let detail = step.loop_execution.as_ref().expect("loop detail");
            (detail.iterations.len(), detail.exit_reason)
        })
        .collect();
    assert_eq!(
        exits,
        vec![(2, ExitReason::MaxIterations), (2, ExitReason::Completed), (5, ExitReason::MaxIterations)]
    );
    assert_eq!(executor.called_ids().len(), 9);
    assert_eq!(trace.status, RunStatus::Passed);
}

#[tokio::test]
async fn engine_default_cap_applies_when_loop_declares_none() {
    let workflow = load(
        r#"
workflow: spin
steps:
  - id: poll
    kind: loop
    loop: { type: while, condition: "true" }
    children:
      - { id: check, kind: action, actionType: record }
"#,
    );
    let executor = Arc::new(RecordingExecutor::default());
    let engine = Engine::new(executor.clone()).with_config(EngineConfig {
        default_max_iterations: 3,
        ..Default::default()
    });

    let trace = engine.run(&workflow.steps, Scope::new()).await;
    let detail = trace.steps[0].loop_execution.as_ref().expect("loop detail");
    assert_eq!(detail.completed_iterations, 3);
    assert_eq!(detail.max_iterations, 3);
    assert!(detail.hit_iteration_cap());
}

#[tokio::test]
async fn only_the_first_true_branch_runs() {
    let workflow = load(
        r#"
workflow: route
steps:
  - id: choose
    kind: branch
    branches:
      - condition: "{{plan}} == \"enterprise\""
        label: enterprise
        children: [{ id: enterprise_step, kind: action, actionType: record }]
      - condition: "{{plan}} == \"team\""
        label: team
        children: [{ id: team_step, kind: action, actionType: record }]
      - condition: default
        label: fallback
        children: [{ id: fallback_step, kind: action, actionType: record }]
"#,
    );
    let (engine, executor) = engine();
    let mut scope = Scope::new();
    scope.set("plan", json!("team"));

    let trace = engine.run(&workflow.steps, scope).await;
    let detail = trace.steps[0].branch_execution.as_ref().expect("branch detail");
    assert_eq!(detail.selected_branch_index, 1);
    assert_eq!(detail.selected_label, "team");
    assert!(!detail.is_default);
    assert_eq!(detail.evaluated_conditions.len(), 2);
    assert_eq!(executor.called_ids(), vec!["team_step"]);
}

#[tokio::test]
async fn outputs_are_visible_to_later_siblings_verbatim() {
    let workflow = load(
        r#"
workflow: chain
steps:
  - id: wrapper
    kind: group
    children:
      - id: a
        kind: action
        actionType: record
        inputs: { x: "order-{{n}} / {\"raw\": true}" }
        outputs: { x: foo }
      - id: b
        kind: action
        actionType: record
        inputs: { y: "{{foo}}" }
"#,
    );
    let (engine, _) = engine();
    let mut scope = Scope::new();
    scope.set("n", json!(17));

    let trace = engine.run(&workflow.steps, scope).await;
    let a = trace.find("a").expect("a");
    let b = trace.find("b").expect("b");
    assert_eq!(b.resolved_inputs["y"], a.captured_outputs["x"].as_str().expect("string output"));
    assert_eq!(b.resolved_inputs["y"], "order-17 / {\"raw\": true}");
    assert_eq!(trace.variable_changes.len(), 1);
    assert_eq!(trace.variable_changes[0].name, "foo");
}

#[tokio::test]
async fn secrets_are_masked_in_the_trace_but_not_for_the_executor() {
    let workflow = load(
        r#"
workflow: secret
steps:
  - id: call
    kind: action
    actionType: record
    inputs:
      header: "Bearer {{token}}"
      fail: "yes"
      detail: "rejected {{token}}"
"#,
    );
    let (engine, executor) = engine();
    let mut scope = Scope::new();
    scope.set_secret("token", json!("s3cr3t"));

    let trace = engine.run(&workflow.steps, scope).await;
    let call = &trace.steps[0];
    assert_eq!(call.resolved_inputs["header"], "Bearer ******");
    assert_eq!(call.error.as_deref(), Some("step call failed: rejected ******"));

    let rendered = serde_json::to_string(&trace).expect("serialize trace");
    assert!(!rendered.contains("s3cr3t"), "secret leaked into trace: {rendered}");

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls[0].inputs["header"], "Bearer s3cr3t");
}

#[tokio::test]
async fn failure_is_contained_to_the_enclosing_sequence() {
    let steps = r#"
      - { id: a, kind: action, actionType: record, inputs: { fail: "{{should_fail}}" } }
      - { id: b, kind: action, actionType: record }
      - { id: c, kind: action, actionType: record }
"#;
    let group = load(&format!("workflow: g\nsteps:\n  - id: body\n    kind: group\n    children:{steps}"));
    let looped = load(&format!(
        "workflow: l\nsteps:\n  - id: body\n    kind: loop\n    loop: {{ type: forEach, source: \"[1,2]\" }}\n    children:{steps}"
    ));

    let mut scope = Scope::new();
    scope.set("should_fail", json!("yes"));

    let (engine, executor) = engine();
    let trace = engine.run(&group.steps, scope.clone()).await;
    let children = &trace.steps[0].children;
    assert_eq!(children[0].status, StepStatus::Failed);
    assert_eq!(children[1].skip_reason, Some(SkipReason::PriorFailure));
    assert_eq!(children[2].skip_reason, Some(SkipReason::PriorFailure));
    assert_eq!(executor.called_ids(), vec!["a"]);

    let (engine, executor) = self::engine();
    let trace = engine.run(&looped.steps, scope).await;
    let detail = trace.steps[0].loop_execution.as_ref().expect("loop detail");
    assert_eq!(detail.iterations.len(), 2);
    for iteration in &detail.iterations {
        assert_eq!(iteration.children[0].status, StepStatus::Failed);
        assert_eq!(iteration.children[1].status, StepStatus::Skipped);
        assert_eq!(iteration.children[2].status, StepStatus::Skipped);
    }
    assert_eq!(executor.called_ids(), vec!["a", "a"]);
    assert_eq!(trace.status, RunStatus::Failed);
}

#[test]
fn resolving_twice_is_byte_identical() {
    let mut scope = Scope::new();
    scope.set("user", json!({ "id": 9, "tags": ["x", "y"] }));
    scope.set("when", json!(null));
    let template = "{{user.id}}:{{user.tags}}:{{when}}:{{missing.path}}:{{ user.tags[1] }}";

    let first = resolve(template, &scope);
    let second = resolve(template, &scope);
    assert_eq!(first.as_bytes(), second.as_bytes());
    assert_eq!(first, "9:[\"x\",\"y\"]::{{missing.path}}:y");
}

#[tokio::test]
async fn sub_workflow_call_depth_is_limited() {
    let bundle = parse_workflow_document(
        r#"
workflows:
  one:
    steps:
      - { id: to_two, kind: action, actionType: workflow, config: { workflowId: two } }
  two:
    steps:
      - { id: to_three, kind: action, actionType: workflow, config: { workflowId: three } }
  three:
    steps:
      - { id: leaf, kind: action, actionType: record }
"#,
    )
    .expect("bundle");
    let executor = Arc::new(RecordingExecutor::default());
    let engine = Engine::new(executor.clone())
        .with_library(bundle.library().expect("library"))
        .with_config(EngineConfig {
            max_call_depth: 1,
            ..Default::default()
        });
    let root = bundle.get("one").expect("root workflow");

    let trace = engine.run(&root.steps, Scope::new()).await;
    let blocked = trace.find("to_three").expect("nested call recorded");
    assert_eq!(blocked.error_kind, Some(ErrorKind::Recursion));
    assert!(executor.called_ids().is_empty());
    assert_eq!(trace.status, RunStatus::Failed);
}
