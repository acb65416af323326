//! `workflow` actions: running a library workflow as a single step.
//!
//! The callee runs against a fresh scope seeded from its own defaults and variables plus the
//! caller's resolved inputs. Its root frame becomes the action result, so the caller binds
//! callee variables through ordinary output paths.
//!
//! Call depth counts nested `workflow` calls only. The workflow a run was started for is
//! never re-entered, but it does not use up a level.

use std::mem;

use serde_json::Value;
use stepflow_types::{StepExecution, StepStatus};
use tracing::info;

use crate::{
    error::StepError,
    scope::{Binding, Scope},
};

use super::{Interpreter, ResolvedAction};

const WORKFLOW_ID_KEY: &str = "workflowId";

impl Interpreter<'_> {
    /// Runs the callee and returns its root frame, or `None` when the run was cancelled
    /// while the callee was running.
    pub(super) async fn call_workflow(
        &mut self,
        action: &ResolvedAction,
        execution: &mut StepExecution,
    ) -> Result<Option<Value>, StepError> {
        let Some(workflow_id) = action.config.get(WORKFLOW_ID_KEY).and_then(Value::as_str) else {
            return Err(StepError::Action(format!("workflow action requires config.{WORKFLOW_ID_KEY}")));
        };
        let active = self.root_workflow.iter().chain(&self.call_stack);
        if active.clone().any(|caller| caller == workflow_id) {
            let chain = active.map(String::as_str).collect::<Vec<_>>().join(" -> ");
            return Err(StepError::Recursion(format!("workflow '{workflow_id}' is already running ({chain} -> {workflow_id})")));
        }
        if self.call_stack.len() >= self.engine.config.max_call_depth {
            return Err(StepError::Recursion(format!(
                "workflow call depth limit of {} reached",
                self.engine.config.max_call_depth
            )));
        }
        let Some(definition) = self.engine.library.get(workflow_id).cloned() else {
            return Err(StepError::Action(format!("unknown workflow '{workflow_id}'")));
        };

        let secrets = self.scope.secrets();
        let mut callee_scope = Scope::new();
        for (name, value) in definition.input_defaults() {
            callee_scope.set(name, value);
        }
        for (name, value) in &definition.variables {
            callee_scope.set(name.clone(), value.clone());
        }
        for (name, value) in &action.inputs {
            let secret = secrets.iter().any(|secret| value.contains(secret.as_str()));
            callee_scope.bind(
                name.clone(),
                Binding {
                    value: Some(Value::String(value.clone())),
                    secret,
                },
            );
        }
        for (name, input) in &definition.inputs {
            if input.secret {
                callee_scope.mark_secret(name);
            }
        }

        info!(step_id = %action.step_id, workflow_id, depth = self.call_stack.len() + 1, "sub-workflow started");
        self.call_stack.push(workflow_id.to_string());
        let caller_scope = mem::replace(&mut self.scope, callee_scope);
        let children = self.execute_sequence(&definition.steps).await;
        let callee_scope = mem::replace(&mut self.scope, caller_scope);
        self.call_stack.pop();

        let failed = children.iter().any(|child| child.status == StepStatus::Failed);
        execution.children = children;
        if self.cancelled {
            info!(step_id = %action.step_id, workflow_id, "sub-workflow cancelled");
            return Ok(None);
        }
        if failed {
            return Err(StepError::Action(format!("sub-workflow '{workflow_id}' failed")));
        }
        Ok(Some(Value::Object(callee_scope.root().values())))
    }
}
