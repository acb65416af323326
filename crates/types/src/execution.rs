//! Execution trace produced by a workflow run.
//!
//! Every attempted or skipped step yields one [`StepExecution`]. Its nested detail mirrors
//! the step's shape: groups carry `children`, loops carry a [`LoopExecution`], branches carry a
//! [`BranchExecution`]. All types serialize to camelCase JSON for rendering layers.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::workflow::{LoopType, Step, StepKindTag};

/// Lifecycle status of a step or iteration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

/// Why a step was skipped rather than attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The step's condition evaluated false.
    Condition,
    Disabled,
    /// No branch condition matched and there was no default branch.
    NoBranchMatched,
    /// An earlier sibling in the same sequence failed.
    PriorFailure,
    /// The run was cancelled before the step was reached, or while its sub-workflow ran.
    Cancelled,
}

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The action executor reported a failure.
    Action,
    /// A condition, loop source, or count expression could not be evaluated.
    Evaluation,
    Timeout,
    /// A sub-workflow call exceeded the call depth or re-entered an active workflow.
    Recursion,
}

/// Record of a single step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub step_name: String,
    pub step_kind: StepKindTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Resolved input values with secrets masked.
    #[serde(default)]
    pub resolved_inputs: IndexMap<String, String>,
    /// Fields of the action result with secrets masked.
    #[serde(default)]
    pub captured_outputs: IndexMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Executor invocations made, including retries.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_execution: Option<LoopExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_execution: Option<BranchExecution>,
}

impl StepExecution {
    /// Creates a pending record for `step`.
    pub fn pending(step: &Step) -> Self {
        let action_type = match &step.kind {
            crate::workflow::StepKind::Action(action) => Some(action.action_type.clone()),
            _ => None,
        };
        Self {
            step_id: step.id.clone(),
            step_name: step.label().to_string(),
            step_kind: step.kind_tag(),
            action_type,
            status: StepStatus::Pending,
            skip_reason: None,
            start_time: None,
            duration_ms: 0,
            resolved_inputs: IndexMap::new(),
            captured_outputs: IndexMap::new(),
            error: None,
            error_kind: None,
            attempts: 0,
            children: Vec::new(),
            loop_execution: None,
            branch_execution: None,
        }
    }

    /// Creates a skipped record for `step`. No detail is attached.
    pub fn skipped(step: &Step, reason: SkipReason) -> Self {
        let mut execution = Self::pending(step);
        execution.skip(reason);
        execution
    }

    /// Marks the step skipped, keeping any detail already recorded.
    pub fn skip(&mut self, reason: SkipReason) {
        self.status = StepStatus::Skipped;
        self.skip_reason = Some(reason);
    }

    /// Transitions to `Running` and stamps the start time.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Marks the step failed with a message of the given kind.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(message.into());
        self.error_kind = Some(kind);
    }

    /// True when this step failed on its own account rather than through a nested step.
    pub fn has_own_failure(&self) -> bool {
        self.status == StepStatus::Failed && self.error.is_some()
    }

    /// Depth-first iterator over this record and every nested record.
    pub fn walk(&self) -> Vec<&StepExecution> {
        let mut visited = Vec::new();
        collect(self, &mut visited);
        visited
    }

    /// Nested step records held directly by this execution's detail.
    pub fn nested(&self) -> Vec<&StepExecution> {
        let mut nested: Vec<&StepExecution> = self.children.iter().collect();
        if let Some(loop_execution) = &self.loop_execution {
            nested.extend(loop_execution.iterations.iter().flat_map(|iteration| iteration.children.iter()));
        }
        if let Some(branch_execution) = &self.branch_execution {
            nested.extend(branch_execution.children.iter());
        }
        nested
    }
}

fn collect<'a>(execution: &'a StepExecution, visited: &mut Vec<&'a StepExecution>) {
    visited.push(execution);
    for nested in execution.nested() {
        collect(nested, visited);
    }
}

/// Aggregate status of a sequence: failed if any member failed, otherwise passed.
pub fn sequence_status(executions: &[StepExecution]) -> StepStatus {
    if executions.iter().any(|execution| execution.status == StepStatus::Failed) {
        StepStatus::Failed
    } else {
        StepStatus::Passed
    }
}

/// How a loop ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    /// Every planned iteration ran.
    #[default]
    Completed,
    /// The while condition evaluated false.
    ConditionFalse,
    /// The break condition evaluated true.
    Break,
    /// The iteration cap was reached before the loop terminated on its own.
    MaxIterations,
    /// The loop stopped on an evaluation error or a failed iteration.
    Error,
    Cancelled,
}

/// Loop detail attached to a loop step's execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoopExecution {
    pub loop_type: Option<LoopType>,
    /// Planned iterations, when known at loop entry. `None` for while loops.
    #[serde(default)]
    pub total_iterations: Option<usize>,
    pub max_iterations: u32,
    pub completed_iterations: usize,
    pub passed_iterations: usize,
    pub failed_iterations: usize,
    pub skipped_iterations: usize,
    pub exit_reason: ExitReason,
    #[serde(default)]
    pub iterations: Vec<IterationExecution>,
}

impl LoopExecution {
    pub fn new(loop_type: LoopType, total_iterations: Option<usize>, max_iterations: u32) -> Self {
        Self {
            loop_type: Some(loop_type),
            total_iterations,
            max_iterations,
            ..Default::default()
        }
    }

    /// Appends an iteration and updates the counters.
    pub fn record(&mut self, iteration: IterationExecution) {
        self.completed_iterations += 1;
        match iteration.status {
            StepStatus::Passed => self.passed_iterations += 1,
            StepStatus::Failed => self.failed_iterations += 1,
            StepStatus::Skipped => self.skipped_iterations += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }
        self.iterations.push(iteration);
    }

    /// True when the iteration cap cut the loop short.
    pub fn hit_iteration_cap(&self) -> bool {
        self.exit_reason == ExitReason::MaxIterations
    }
}

/// One loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IterationExecution {
    pub index: usize,
    pub item_value: JsonValue,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub children: Vec<StepExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of evaluating one branch condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchEvaluation {
    pub index: usize,
    pub label: String,
    pub condition: String,
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Branch detail attached to a branch step's execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchExecution {
    pub selected_branch_index: usize,
    pub selected_label: String,
    pub is_default: bool,
    #[serde(default)]
    pub evaluated_conditions: Vec<BranchEvaluation>,
    #[serde(default)]
    pub children: Vec<StepExecution>,
}

/// A write made by an output binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableChange {
    pub step_id: String,
    pub name: String,
    /// Value visible before the write. `None` when the variable was undefined.
    pub old_value: Option<JsonValue>,
    /// `None` when the result path was missing and the variable was bound undefined.
    pub new_value: Option<JsonValue>,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Passed,
    Failed,
    Cancelled,
}

/// Step counts across the whole trace, nested records included.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn from_steps(steps: &[StepExecution]) -> Self {
        let mut summary = Self::default();
        for execution in steps.iter().flat_map(StepExecution::walk) {
            summary.total += 1;
            match execution.status {
                StepStatus::Passed => summary.passed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Pending | StepStatus::Running => {}
            }
        }
        summary
    }
}

/// Complete record of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunTrace {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepExecution>,
    #[serde(default)]
    pub variable_changes: Vec<VariableChange>,
    pub summary: RunSummary,
}

impl RunTrace {
    /// Derives the terminal status: cancelled wins, then failed iff any record anywhere failed.
    pub fn derive_status(steps: &[StepExecution], cancelled: bool) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if steps.iter().flat_map(StepExecution::walk).any(|execution| execution.status == StepStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }

    /// Finds the first record for `step_id` anywhere in the trace.
    pub fn find(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps
            .iter()
            .flat_map(StepExecution::walk)
            .find(|execution| execution.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ActionStep, StepKind};

    fn step(id: &str) -> Step {
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
                action_type: "command".into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn run_status_is_failed_when_a_nested_iteration_step_failed() {
        let mut inner = StepExecution::pending(&step("inner"));
        inner.fail(ErrorKind::Action, "boom");

        let mut outer = StepExecution::pending(&step("outer"));
        outer.status = StepStatus::Passed;
        let mut loop_execution = LoopExecution::new(LoopType::Count, Some(1), 100);
        loop_execution.record(IterationExecution {
            index: 0,
            item_value: JsonValue::from(0),
            status: StepStatus::Failed,
            duration_ms: 0,
            children: vec![inner],
            error: None,
        });
        outer.loop_execution = Some(loop_execution);

        let steps = vec![outer];
        assert_eq!(RunTrace::derive_status(&steps, false), RunStatus::Failed);
        assert_eq!(RunTrace::derive_status(&steps, true), RunStatus::Cancelled);

        let summary = RunSummary::from_steps(&steps);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 1);
    }

    #[test]
    fn skipped_record_serializes_without_detail_fields() {
        let execution = StepExecution::skipped(&step("later"), SkipReason::PriorFailure);
        let json = serde_json::to_value(&execution).expect("serialize execution");
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["skipReason"], "priorFailure");
        assert_eq!(json["stepKind"], "action");
        assert!(json.get("children").is_none());
        assert!(json.get("loopExecution").is_none());
        assert!(json.get("branchExecution").is_none());
    }

    #[test]
    fn loop_counters_track_iteration_statuses() {
        let mut loop_execution = LoopExecution::new(LoopType::ForEach, Some(3), 100);
        for (index, status) in [StepStatus::Passed, StepStatus::Skipped, StepStatus::Failed].into_iter().enumerate() {
            loop_execution.record(IterationExecution {
                index,
                item_value: JsonValue::Null,
                status,
                duration_ms: 0,
                children: Vec::new(),
                error: None,
            });
        }
        assert_eq!(loop_execution.completed_iterations, 3);
        assert_eq!(loop_execution.passed_iterations, 1);
        assert_eq!(loop_execution.skipped_iterations, 1);
        assert_eq!(loop_execution.failed_iterations, 1);
        assert!(!loop_execution.hit_iteration_cap());
    }
}
