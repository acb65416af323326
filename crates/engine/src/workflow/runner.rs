//! Asynchronous workflow runner that streams lifecycle events and responds to
//! pause/cancel controls.
//!
//! The caller owns the event receiver and issues control commands (pause, resume, cancel)
//! through the control channel. Commands take effect between steps and loop iterations.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use stepflow_types::{EnvironmentVariable, RunControl, RunEvent, RunPhase, RunTrace, WorkflowDefinition, workflow::validate_workflow};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::info;

use crate::{
    executor::Engine,
    scope::{Scope, ScopeSeed},
    workflow::control::{RunSignals, emit_status},
};

/// Everything needed to start one run of a workflow.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub workflow: WorkflowDefinition,
    pub environment: Vec<EnvironmentVariable>,
    /// Case variables. These win over environment values and input defaults.
    pub variables: IndexMap<String, Value>,
}

impl RunRequest {
    pub fn new(workflow: WorkflowDefinition) -> Self {
        Self {
            run_id: format!("run-{}", Utc::now().timestamp_millis()),
            workflow,
            environment: Vec::new(),
            variables: IndexMap::new(),
        }
    }
}

/// Drives a workflow run to completion while emitting lifecycle events.
///
/// Fails only when the workflow does not validate. Step failures, evaluation errors and
/// cancellation are reported through the returned trace.
pub async fn drive_run(
    request: RunRequest,
    engine: Arc<Engine>,
    control_rx: Option<UnboundedReceiver<RunControl>>,
    event_tx: Option<UnboundedSender<RunEvent>>,
) -> Result<RunTrace> {
    if let Err(issues) = validate_workflow(&request.workflow) {
        let details = issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        bail!("workflow '{}' is invalid: {details}", request.workflow.workflow);
    }

    let RunRequest {
        run_id,
        workflow,
        environment,
        variables,
    } = request;

    let mut case_variables = workflow.variables.clone();
    case_variables.extend(variables);
    let mut scope = Scope::from_seed(ScopeSeed {
        input_defaults: workflow.input_defaults(),
        environment,
        case_variables,
    });
    for (name, input) in &workflow.inputs {
        if input.secret {
            scope.mark_secret(name);
        }
    }

    if let Some(event_tx) = &event_tx {
        let _ = event_tx.send(RunEvent::RunStarted {
            run_id: run_id.clone(),
            at: Utc::now(),
        });
    }
    emit_status(event_tx.as_ref(), RunPhase::Running, None);
    info!(run_id = %run_id, workflow = %workflow.workflow, "workflow run started");

    let signals = RunSignals::new(control_rx, event_tx.clone());
    let trace = engine
        .run_with_signals(run_id, Some(&workflow.workflow), &workflow.steps, scope, signals)
        .await;

    if let Some(event_tx) = &event_tx {
        let _ = event_tx.send(RunEvent::RunCompleted {
            run_id: trace.run_id.clone(),
            status: trace.status,
            summary: trace.summary,
            finished_at: Utc::now(),
        });
    }
    Ok(trace)
}
