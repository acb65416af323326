//! Step tree interpreter.
//!
//! [`Engine::run`] walks a step tree depth-first on a single logical thread of control:
//! siblings, loop iterations, and branch bodies run strictly in document order. The
//! [`ActionExecutor`] call is the only suspension point.
//!
//! Failure handling is local to the innermost sequence. A step that fails on its own
//! account (action failure, evaluation error, timeout, call-depth violation) stops its later
//! siblings, which are recorded as skipped. Loop iterations and branch bodies are separate
//! sequences, so a failure inside one never stops the next iteration or an outer sibling.

mod branch;
mod repeat;
mod router;
pub mod runner;
mod step_once;
mod subworkflow;

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use futures_util::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use stepflow_types::{
    RunEvent, RunSummary, RunTrace, SkipReason, Step, StepExecution, StepKind, StepStatus, VariableChange, WorkflowDefinition,
    execution::sequence_status,
};
use tracing::{debug, info, warn};

use crate::{
    condition::eval_bool,
    config::EngineConfig,
    error::StepError,
    resolve::mask_with,
    scope::Scope,
    workflow::control::RunSignals,
};

pub use router::ActionRouter;
pub use runner::{ActionExecutor, NoopExecutor, ResolvedAction};

/// Workflows callable from `workflow` actions, keyed by workflow id.
pub type WorkflowLibrary = IndexMap<String, Arc<WorkflowDefinition>>;

/// Interprets step trees against an action executor.
///
/// The engine holds no per-run state; one instance can serve concurrent runs.
#[derive(Clone)]
pub struct Engine {
    executor: Arc<dyn ActionExecutor>,
    config: EngineConfig,
    library: Arc<WorkflowLibrary>,
}

impl Engine {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            executor,
            config: EngineConfig::default(),
            library: Arc::new(WorkflowLibrary::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the sub-workflow library.
    pub fn with_library(mut self, library: WorkflowLibrary) -> Self {
        self.library = Arc::new(library);
        self
    }

    /// Adds one workflow to the sub-workflow library.
    pub fn with_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        Arc::make_mut(&mut self.library).insert(workflow.workflow.clone(), Arc::new(workflow));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `steps` against `scope` and returns the populated trace.
    pub async fn run(&self, steps: &[Step], scope: Scope) -> RunTrace {
        let run_id = format!("run-{}", Utc::now().timestamp_millis());
        self.run_with_signals(run_id, None, steps, scope, RunSignals::detached()).await
    }

    pub(crate) async fn run_with_signals(
        &self,
        run_id: String,
        root_workflow: Option<&str>,
        steps: &[Step],
        scope: Scope,
        signals: RunSignals,
    ) -> RunTrace {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut interpreter = Interpreter::new(self, scope, signals);
        interpreter.root_workflow = root_workflow.filter(|id| !id.is_empty()).map(str::to_string);

        info!(run_id = %run_id, steps = steps.len(), "run started");
        let executions = interpreter.execute_sequence(steps).await;
        let status = RunTrace::derive_status(&executions, interpreter.cancelled);
        let summary = RunSummary::from_steps(&executions);
        info!(
            run_id = %run_id,
            status = ?status,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            "run finished"
        );

        RunTrace {
            run_id,
            status,
            started_at,
            duration_ms: elapsed_ms(clock),
            steps: executions,
            variable_changes: interpreter.changes,
            summary,
        }
    }
}

/// Per-run interpreter state: the scope stack, the call stack, and recorded changes.
pub(crate) struct Interpreter<'e> {
    engine: &'e Engine,
    scope: Scope,
    signals: RunSignals,
    changes: Vec<VariableChange>,
    /// Workflow the run was started for, when known.
    root_workflow: Option<String>,
    /// Workflows entered through `workflow` actions, outermost first.
    call_stack: Vec<String>,
    cancelled: bool,
}

impl<'e> Interpreter<'e> {
    fn new(engine: &'e Engine, scope: Scope, signals: RunSignals) -> Self {
        Self {
            engine,
            scope,
            signals,
            changes: Vec::new(),
            root_workflow: None,
            call_stack: Vec::new(),
            cancelled: false,
        }
    }

    /// Runs a sequential body. Output bindings made by its members land in the frame that
    /// is innermost when the sequence starts.
    fn execute_sequence<'a>(&'a mut self, steps: &'a [Step]) -> BoxFuture<'a, Vec<StepExecution>> {
        async move {
            let output_frame = self.scope.current_frame();
            let mut executions = Vec::with_capacity(steps.len());
            let mut failed_sibling: Option<&str> = None;

            for step in steps {
                if !self.cancelled && self.signals.checkpoint().await {
                    self.cancelled = true;
                    info!(step_id = %step.id, "run cancelled; remaining steps will be skipped");
                }
                if self.cancelled {
                    executions.push(self.finish_skipped(step, SkipReason::Cancelled));
                    continue;
                }
                if let Some(failed_step) = failed_sibling {
                    debug!(step_id = %step.id, failed_step, "step skipped after sibling failure");
                    executions.push(self.finish_skipped(step, SkipReason::PriorFailure));
                    continue;
                }

                let execution = self.execute_step(step, output_frame).await;
                if execution.has_own_failure() {
                    if step.continue_on_fail {
                        info!(step_id = %step.id, "step failed; continuing because continueOnFail is set");
                    } else {
                        failed_sibling = Some(step.id.as_str());
                    }
                }
                executions.push(execution);
            }
            executions
        }
        .boxed()
    }

    async fn execute_step(&mut self, step: &Step, output_frame: usize) -> StepExecution {
        if step.disabled {
            return self.finish_skipped(step, SkipReason::Disabled);
        }

        let mut execution = StepExecution::pending(step);
        let condition_error = match step.condition.as_deref() {
            Some(condition) => match eval_bool(condition, &self.scope) {
                Ok(true) => None,
                Ok(false) => {
                    info!(step_id = %step.id, "step skipped by condition");
                    return self.finish_skipped(step, SkipReason::Condition);
                }
                Err(error) => Some(error),
            },
            None => None,
        };

        execution.start();
        self.signals.emit(RunEvent::StepStarted {
            step_id: execution.step_id.clone(),
            step_name: execution.step_name.clone(),
            step_kind: execution.step_kind,
            started_at: execution.start_time.unwrap_or_else(Utc::now),
        });
        let clock = Instant::now();

        if let Some(error) = condition_error {
            self.fail(&mut execution, StepError::from(error));
            return self.finish(execution, clock);
        }

        match &step.kind {
            StepKind::Action(action) => self.execute_action(step, action, output_frame, &mut execution).await,
            StepKind::Group { children } => {
                let children = self.execute_sequence(children).await;
                execution.status = sequence_status(&children);
                execution.children = children;
            }
            StepKind::Loop { config, children } => self.execute_loop(step, config, children, &mut execution).await,
            StepKind::Branch { branches } => self.execute_branch(step, branches, &mut execution).await,
        }

        self.finish(execution, clock)
    }

    fn finish(&self, mut execution: StepExecution, clock: Instant) -> StepExecution {
        execution.duration_ms = elapsed_ms(clock);
        match execution.status {
            StepStatus::Failed => warn!(
                step_id = %execution.step_id,
                duration_ms = execution.duration_ms,
                error = execution.error.as_deref().unwrap_or("nested step failed"),
                "step failed"
            ),
            status => info!(
                step_id = %execution.step_id,
                status = ?status,
                duration_ms = execution.duration_ms,
                "step finished"
            ),
        }
        self.emit_finished(&execution);
        execution
    }

    fn finish_skipped(&self, step: &Step, reason: SkipReason) -> StepExecution {
        let execution = StepExecution::skipped(step, reason);
        self.emit_finished(&execution);
        execution
    }

    fn emit_finished(&self, execution: &StepExecution) {
        self.signals.emit(RunEvent::StepFinished {
            step_id: execution.step_id.clone(),
            status: execution.status,
            duration_ms: execution.duration_ms,
            attempts: execution.attempts,
            error: execution.error.clone(),
        });
    }

    fn fail(&self, execution: &mut StepExecution, error: StepError) {
        execution.fail(error.kind(), self.mask(&error.to_string()));
    }

    /// Masks every visible secret in `text`.
    fn mask(&self, text: &str) -> String {
        mask_with(text, &self.scope.secrets(), &self.engine.config.redaction_marker)
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    clock.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
