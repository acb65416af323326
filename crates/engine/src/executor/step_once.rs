//! Action step execution: input resolution, retries, timeouts, and output binding.

use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use stepflow_types::{ActionStep, RunEvent, SUB_WORKFLOW_ACTION, SkipReason, Step, StepExecution, StepStatus, VariableChange};
use tracing::{debug, warn};

use crate::{
    error::StepError,
    resolve::{mask_value, resolve, select_path, unresolved_placeholders},
    scope::Binding,
};

use super::{Interpreter, ResolvedAction};

/// Max executor invocations for one action step to prevent runaway retry policies.
const MAX_ACTION_ATTEMPTS: u32 = 100;

impl Interpreter<'_> {
    /// Resolves inputs, invokes the executor (or a sub-workflow) and binds outputs into
    /// `output_frame` on success.
    pub(super) async fn execute_action(
        &mut self,
        step: &Step,
        action: &ActionStep,
        output_frame: usize,
        execution: &mut StepExecution,
    ) {
        let inputs: IndexMap<String, String> = step
            .inputs
            .iter()
            .map(|(name, template)| (name.clone(), resolve(template, &self.scope)))
            .collect();
        for (name, template) in &step.inputs {
            let unresolved = unresolved_placeholders(template, &self.scope);
            if !unresolved.is_empty() {
                debug!(step_id = %step.id, input = %name, unresolved = ?unresolved, "input left unresolved placeholders verbatim");
            }
        }
        execution.resolved_inputs = inputs.iter().map(|(name, value)| (name.clone(), self.mask(value))).collect();

        let resolved = ResolvedAction {
            step_id: step.id.clone(),
            action_type: action.action_type.clone(),
            config: action.config.clone(),
            inputs,
        };

        let outcome = if action.action_type == SUB_WORKFLOW_ACTION {
            execution.attempts = 1;
            match self.call_workflow(&resolved, execution).await {
                Ok(Some(result)) => Ok(result),
                Ok(None) => {
                    execution.skip(SkipReason::Cancelled);
                    return;
                }
                Err(error) => Err(error),
            }
        } else {
            self.invoke_with_retry(step, &resolved, execution).await
        };

        match outcome {
            Ok(result) => {
                execution.captured_outputs = self.captured_outputs(&result);
                self.bind_outputs(step, &result, output_frame);
                execution.status = StepStatus::Passed;
            }
            Err(error) => self.fail(execution, error),
        }
    }

    async fn invoke_with_retry(
        &self,
        step: &Step,
        action: &ResolvedAction,
        execution: &mut StepExecution,
    ) -> Result<Value, StepError> {
        let retry = step.retry.clone().unwrap_or_default();
        let max_attempts = retry.count.saturating_add(1).min(MAX_ACTION_ATTEMPTS);
        let delay = Duration::from_millis(retry.delay_ms);
        let timeout_ms = step
            .timeout_ms
            .or(self.engine.config.action_timeout_ms)
            .filter(|timeout| *timeout > 0);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            execution.attempts = attempts;
            match self.invoke_once(action, timeout_ms).await {
                Ok(result) => return Ok(result),
                Err(error) if attempts < max_attempts => {
                    warn!(
                        step_id = %step.id,
                        attempts,
                        max_attempts,
                        error = %self.mask(&error.to_string()),
                        "action attempt failed; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn invoke_once(&self, action: &ResolvedAction, timeout_ms: Option<u64>) -> Result<Value, StepError> {
        let call = self.engine.executor.execute(action);
        let result = match timeout_ms {
            Some(timeout_ms) => match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
                Ok(result) => result,
                Err(_) => return Err(StepError::Timeout(timeout_ms)),
            },
            None => call.await,
        };
        result.map_err(|error| StepError::Action(format!("{error:#}")))
    }

    /// Top-level fields of the result, masked. Non-object results are stored under `result`.
    fn captured_outputs(&self, result: &Value) -> IndexMap<String, Value> {
        let secrets = self.scope.secrets();
        let marker = &self.engine.config.redaction_marker;
        match result {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), mask_value(value, &secrets, marker)))
                .collect(),
            Value::Null => IndexMap::new(),
            other => IndexMap::from([("result".to_string(), mask_value(other, &secrets, marker))]),
        }
    }

    /// Writes each `path -> variable` binding. Missing paths bind the variable undefined.
    pub(super) fn bind_outputs(&mut self, step: &Step, result: &Value, output_frame: usize) {
        for (path, variable) in &step.outputs {
            let value = select_path(result, Some(path));
            if value.is_none() {
                debug!(step_id = %step.id, path = %path, variable = %variable, "output path missing; variable bound undefined");
            }

            let previous = self.scope.binding(variable);
            let secret = previous.is_some_and(|binding| binding.secret);
            let old_value = previous.and_then(|binding| binding.value.clone());
            self.scope
                .bind_in_frame(output_frame, variable.clone(), Binding { value: value.clone(), secret });

            let secrets = self.scope.secrets();
            let marker = &self.engine.config.redaction_marker;
            let masked = |value: Option<Value>| value.map(|value| mask_value(&value, &secrets, marker));
            let change = VariableChange {
                step_id: step.id.clone(),
                name: variable.clone(),
                old_value: masked(old_value),
                new_value: masked(value),
            };
            self.signals.emit(RunEvent::VariableChanged {
                step_id: change.step_id.clone(),
                name: change.name.clone(),
                value: change.new_value.clone(),
            });
            self.changes.push(change);
        }
    }
}
