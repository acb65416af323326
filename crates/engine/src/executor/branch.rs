//! Branch step execution: first matching arm wins.

use stepflow_types::{
    BranchConfig, BranchEvaluation, BranchExecution, ErrorKind, RunEvent, SkipReason, Step, StepExecution, StepStatus,
    execution::sequence_status,
};
use tracing::{debug, info};

use crate::condition::eval_bool;

use super::Interpreter;

impl Interpreter<'_> {
    /// Evaluates arm conditions in order and runs the body of the first match in the
    /// enclosing scope. Later arms are never evaluated once one matches.
    pub(super) async fn execute_branch(&mut self, step: &Step, branches: &[BranchConfig], execution: &mut StepExecution) {
        if branches.is_empty() {
            execution.status = StepStatus::Passed;
            return;
        }

        let mut evaluated = Vec::with_capacity(branches.len());
        let mut errors = Vec::new();
        let mut selected = None;

        for (index, branch) in branches.iter().enumerate() {
            let label = branch.label.clone().unwrap_or_else(|| format!("branch_{index}"));
            let outcome = if branch.is_default() {
                Ok(true)
            } else {
                eval_bool(&branch.condition, &self.scope)
            };
            let (result, error) = match outcome {
                Ok(result) => (result, None),
                Err(error) => {
                    let message = self.mask(&format!("{label}: {error}"));
                    debug!(step_id = %step.id, branch = %label, error = %message, "branch condition failed to evaluate");
                    errors.push(message.clone());
                    (false, Some(message))
                }
            };
            evaluated.push(BranchEvaluation {
                index,
                label: label.clone(),
                condition: branch.condition.clone(),
                result,
                error,
            });
            if result {
                selected = Some((index, label, branch));
                break;
            }
        }

        let Some((index, label, branch)) = selected else {
            if errors.is_empty() {
                info!(step_id = %step.id, "no branch matched");
                execution.status = StepStatus::Skipped;
                execution.skip_reason = Some(SkipReason::NoBranchMatched);
            } else {
                execution.fail(ErrorKind::Evaluation, format!("no branch matched; {}", errors.join("; ")));
            }
            return;
        };

        info!(step_id = %step.id, branch = %label, index, "branch selected");
        self.signals.emit(RunEvent::BranchSelected {
            step_id: step.id.clone(),
            index,
            label: label.clone(),
        });
        let children = self.execute_sequence(&branch.children).await;
        execution.status = sequence_status(&children);
        execution.branch_execution = Some(BranchExecution {
            selected_branch_index: index,
            selected_label: label,
            is_default: branch.is_default(),
            evaluated_conditions: evaluated,
            children,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indexmap::IndexMap;
    use serde_json::json;
    use stepflow_types::{ActionStep, StepKind};

    use crate::{
        executor::{Engine, NoopExecutor},
        scope::Scope,
    };

    use super::*;

    fn action(id: &str) -> Step {
        Step {
            id: id.into(),
            name: String::new(),
            condition: None,
            disabled: false,
            continue_on_fail: false,
            timeout_ms: None,
            retry: None,
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            kind: StepKind::Action(ActionStep {
                action_type: "noop".into(),
                ..Default::default()
            }),
        }
    }

    fn arm(condition: &str, child: &str) -> BranchConfig {
        BranchConfig {
            condition: condition.into(),
            label: None,
            children: vec![action(child)],
        }
    }

    fn branch(arms: Vec<BranchConfig>) -> Step {
        let mut step = action("route");
        step.kind = StepKind::Branch { branches: arms };
        step
    }

    fn scope_with_tier(tier: &str) -> Scope {
        let mut scope = Scope::new();
        scope.set("tier", json!(tier));
        scope
    }

    #[tokio::test]
    async fn first_true_arm_runs_and_later_arms_are_not_evaluated() {
        let engine = Engine::new(Arc::new(NoopExecutor));
        let step = branch(vec![
            arm("{{tier}} == \"gold\"", "gold"),
            arm("{{tier}} != \"gold\"", "any"),
            arm("{{undefined_var}} > 1", "never"),
        ]);

        let trace = engine.run(&[step], scope_with_tier("silver")).await;
        let detail = trace.steps[0].branch_execution.as_ref().expect("branch detail");
        assert_eq!(detail.selected_branch_index, 1);
        assert_eq!(detail.selected_label, "branch_1");
        assert_eq!(detail.evaluated_conditions.len(), 2);
        assert_eq!(detail.children.len(), 1);
        assert!(trace.find("gold").is_none());
        assert!(trace.find("never").is_none());
    }

    #[tokio::test]
    async fn default_arm_matches_when_nothing_else_does() {
        let engine = Engine::new(Arc::new(NoopExecutor));
        let step = branch(vec![arm("{{tier}} == \"gold\"", "gold"), arm("default", "fallback")]);

        let trace = engine.run(&[step], scope_with_tier("bronze")).await;
        let detail = trace.steps[0].branch_execution.as_ref().expect("branch detail");
        assert!(detail.is_default);
        assert_eq!(detail.children[0].step_id, "fallback");
        assert_eq!(trace.steps[0].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn no_match_skips_the_branch_step() {
        let engine = Engine::new(Arc::new(NoopExecutor));
        let step = branch(vec![arm("{{tier}} == \"gold\"", "gold")]);

        let trace = engine.run(&[step, action("after")], scope_with_tier("bronze")).await;
        assert_eq!(trace.steps[0].status, StepStatus::Skipped);
        assert_eq!(trace.steps[0].skip_reason, Some(SkipReason::NoBranchMatched));
        assert!(trace.steps[0].branch_execution.is_none());
        assert_eq!(trace.steps[1].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn evaluation_errors_without_a_match_fail_the_step() {
        let engine = Engine::new(Arc::new(NoopExecutor));
        let step = branch(vec![arm("{{missing}} > 2", "never")]);

        let trace = engine.run(&[step], Scope::new()).await;
        assert_eq!(trace.steps[0].status, StepStatus::Failed);
        assert_eq!(trace.steps[0].error_kind, Some(ErrorKind::Evaluation));
        let error = trace.steps[0].error.clone().unwrap_or_default();
        assert!(error.contains("missing"), "unexpected error: {error}");
    }
}
