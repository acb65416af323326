//! Loop step execution.
//!
//! Every loop gets its own frame and every iteration a frame inside it, so the item and
//! index variables, along with any output an iteration binds, vanish when the iteration ends.
//! While loops are the exception: an iteration's bindings are carried into the loop frame so
//! the next condition check observes them.

use std::time::Instant;

use serde_json::{Value, json};
use stepflow_types::{
    ExitReason, IterationExecution, LoopConfig, LoopExecution, LoopType, RunEvent, Step, StepExecution, StepStatus,
    execution::sequence_status,
};
use tracing::{info, warn};

use crate::{
    condition::{eval_array, eval_bool, eval_count_spec},
    error::{EvalError, StepError},
    resolve::mask_value,
};

use super::{Interpreter, elapsed_ms};

/// Name of the loop metadata object bound in every iteration.
const LOOP_METADATA_VAR: &str = "loop";

/// Where the iterations of a loop come from.
enum IterationPlan<'a> {
    Items(Vec<Value>),
    Times(u64),
    While(&'a str),
}

impl IterationPlan<'_> {
    fn total(&self) -> Option<usize> {
        match self {
            IterationPlan::Items(items) => Some(items.len()),
            IterationPlan::Times(count) => Some(usize::try_from(*count).unwrap_or(usize::MAX)),
            IterationPlan::While(_) => None,
        }
    }
}

/// Why a round did not start.
enum Stop {
    Exit(ExitReason),
    Fail(EvalError),
}

impl Interpreter<'_> {
    pub(super) async fn execute_loop(
        &mut self,
        step: &Step,
        config: &LoopConfig,
        children: &[Step],
        execution: &mut StepExecution,
    ) {
        let cap = self.engine.config.iteration_cap(config.max_iterations);
        if children.is_empty() {
            execution.loop_execution = Some(LoopExecution::new(config.loop_type, None, cap));
            execution.status = StepStatus::Passed;
            return;
        }

        let plan = match self.plan(config) {
            Ok(plan) => plan,
            Err(error) => {
                let mut detail = LoopExecution::new(config.loop_type, None, cap);
                detail.exit_reason = ExitReason::Error;
                execution.loop_execution = Some(detail);
                self.fail(execution, StepError::from(error));
                return;
            }
        };
        let total = plan.total();
        let mut detail = LoopExecution::new(config.loop_type, total, cap);
        info!(step_id = %step.id, loop_type = ?config.loop_type, total = ?total, max_iterations = cap, "loop started");

        self.scope.push_frame();
        let loop_frame = self.scope.current_frame();
        let mut own_error: Option<EvalError> = None;
        let mut index = 0usize;

        let exit_reason = loop {
            if let Some(stop) = self.before_round(step, &plan, index, cap).await {
                match stop {
                    Stop::Exit(reason) => break reason,
                    Stop::Fail(error) => {
                        own_error = Some(error);
                        break ExitReason::Error;
                    }
                }
            }

            let item = match &plan {
                IterationPlan::Items(items) => items.get(index).cloned().unwrap_or(Value::Null),
                IterationPlan::Times(_) => json!(index),
                IterationPlan::While(_) => Value::Null,
            };

            self.scope.push_frame();
            if !matches!(plan, IterationPlan::While(_)) {
                self.scope.set(config.item_var.clone(), item.clone());
            }
            self.scope.set(config.index_var.clone(), json!(index));
            self.scope.set(LOOP_METADATA_VAR, loop_metadata(index, total));

            match config.break_condition.as_deref().map(|condition| eval_bool(condition, &self.scope)) {
                Some(Ok(true)) => {
                    self.scope.pop_frame();
                    info!(step_id = %step.id, index, "loop break condition met");
                    break ExitReason::Break;
                }
                Some(Err(error)) => {
                    self.scope.pop_frame();
                    own_error = Some(error);
                    break ExitReason::Error;
                }
                Some(Ok(false)) | None => {}
            }

            let masked_item = mask_value(&item, &self.scope.secrets(), &self.engine.config.redaction_marker);
            self.signals.emit(RunEvent::IterationStarted {
                step_id: step.id.clone(),
                index,
                item_value: masked_item.clone(),
            });
            let clock = Instant::now();

            let iteration = match config.continue_condition.as_deref().map(|condition| eval_bool(condition, &self.scope)) {
                Some(Ok(true)) => IterationExecution {
                    index,
                    item_value: masked_item,
                    status: StepStatus::Skipped,
                    duration_ms: 0,
                    children: Vec::new(),
                    error: None,
                },
                Some(Err(error)) => IterationExecution {
                    index,
                    item_value: masked_item,
                    status: StepStatus::Failed,
                    duration_ms: 0,
                    children: Vec::new(),
                    error: Some(self.mask(&error.to_string())),
                },
                Some(Ok(false)) | None => {
                    let body = self.execute_sequence(children).await;
                    IterationExecution {
                        index,
                        item_value: masked_item,
                        status: sequence_status(&body),
                        duration_ms: elapsed_ms(clock),
                        children: body,
                        error: None,
                    }
                }
            };

            if let Some(frame) = self.scope.pop_frame()
                && matches!(plan, IterationPlan::While(_))
            {
                for (name, binding) in frame.bindings() {
                    if name != &config.index_var && name != LOOP_METADATA_VAR {
                        self.scope.bind_in_frame(loop_frame, name.clone(), binding.clone());
                    }
                }
            }

            self.signals.emit(RunEvent::IterationFinished {
                step_id: step.id.clone(),
                index,
                status: iteration.status,
                duration_ms: iteration.duration_ms,
            });
            let failed = iteration.status == StepStatus::Failed;
            detail.record(iteration);
            index += 1;

            if self.cancelled {
                break ExitReason::Cancelled;
            }
            if failed && config.stop_on_failure {
                warn!(step_id = %step.id, index = index - 1, "loop stopped after failed iteration");
                break ExitReason::Error;
            }
        };
        self.scope.pop_frame();

        detail.exit_reason = exit_reason;
        self.signals.emit(RunEvent::LoopFinished {
            step_id: step.id.clone(),
            exit_reason,
            completed_iterations: detail.completed_iterations,
        });
        info!(
            step_id = %step.id,
            exit_reason = ?exit_reason,
            completed = detail.completed_iterations,
            failed = detail.failed_iterations,
            "loop finished"
        );

        let any_failed = detail.failed_iterations > 0;
        execution.loop_execution = Some(detail);
        if let Some(error) = own_error {
            self.fail(execution, StepError::from(error));
        } else if any_failed {
            execution.status = StepStatus::Failed;
        } else {
            execution.status = StepStatus::Passed;
        }
    }

    fn plan<'c>(&self, config: &'c LoopConfig) -> Result<IterationPlan<'c>, EvalError> {
        match config.loop_type {
            LoopType::ForEach => {
                let source = config.source.as_deref().ok_or(EvalError::MissingExpression("source"))?;
                Ok(IterationPlan::Items(eval_array(source, &self.scope)?))
            }
            LoopType::Count => {
                let count = config.count.as_ref().ok_or(EvalError::MissingExpression("count"))?;
                Ok(IterationPlan::Times(eval_count_spec(count, &self.scope)?))
            }
            LoopType::While => {
                let condition = config.condition.as_deref().ok_or(EvalError::MissingExpression("condition"))?;
                Ok(IterationPlan::While(condition))
            }
        }
    }

    /// Checks cancellation, natural termination and the iteration cap, in that order.
    async fn before_round(&mut self, step: &Step, plan: &IterationPlan<'_>, index: usize, cap: u32) -> Option<Stop> {
        if !self.cancelled && self.signals.checkpoint().await {
            self.cancelled = true;
        }
        if self.cancelled {
            return Some(Stop::Exit(ExitReason::Cancelled));
        }

        match plan {
            IterationPlan::Items(items) if index >= items.len() => return Some(Stop::Exit(ExitReason::Completed)),
            IterationPlan::Times(count) if index as u64 >= *count => return Some(Stop::Exit(ExitReason::Completed)),
            IterationPlan::While(condition) => match eval_bool(condition, &self.scope) {
                Ok(false) => return Some(Stop::Exit(ExitReason::ConditionFalse)),
                Err(error) => return Some(Stop::Fail(error)),
                Ok(true) => {}
            },
            _ => {}
        }

        if index >= cap as usize {
            warn!(step_id = %step.id, index, max_iterations = cap, "loop reached its iteration cap");
            return Some(Stop::Exit(ExitReason::MaxIterations));
        }
        None
    }
}

fn loop_metadata(index: usize, total: Option<usize>) -> Value {
    json!({
        "index": index,
        "count": index + 1,
        "first": index == 0,
        "last": total.is_some_and(|total| index + 1 == total),
        "total": total,
    })
}
