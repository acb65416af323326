//! Shared type definitions for the Stepflow workflow interpreter.
//!
//! - [`workflow`] holds the authored step tree (actions, groups, loops, branches).
//! - [`execution`] holds the execution trace produced by a run.
//! - [`run`] holds the live event and control messages exchanged with a running workflow.

pub mod execution;
pub mod run;
pub mod workflow;

pub use execution::{
    BranchEvaluation, BranchExecution, ErrorKind, ExitReason, IterationExecution, LoopExecution, RunStatus, RunSummary, RunTrace,
    SkipReason, StepExecution, StepStatus, VariableChange,
};
pub use run::{RunControl, RunEvent, RunPhase};
pub use workflow::{
    ActionStep, BranchConfig, CountSpec, DEFAULT_BRANCH_CONDITION, EnvironmentVariable, LoopConfig, LoopType, RetryPolicy,
    SUB_WORKFLOW_ACTION, Step, StepKind, StepKindTag, WorkflowDefinition, WorkflowInput,
};
