//! Live run events and control commands.
//!
//! A running workflow streams [`RunEvent`]s to its observer and accepts [`RunControl`]
//! commands between steps. Event payloads carry masked text only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    execution::{ExitReason, RunStatus, RunSummary, StepStatus},
    workflow::StepKindTag,
};

/// Commands accepted by a running workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunControl {
    Pause,
    Resume,
    Cancel,
}

/// Non-terminal run phases reported through [`RunEvent::RunStatusChanged`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    Running,
    Paused,
    CancelRequested,
}

/// Lifecycle events emitted while a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        at: DateTime<Utc>,
    },
    RunStatusChanged {
        phase: RunPhase,
        message: Option<String>,
    },
    StepStarted {
        step_id: String,
        step_name: String,
        step_kind: StepKindTag,
        started_at: DateTime<Utc>,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
        attempts: u32,
        error: Option<String>,
    },
    IterationStarted {
        step_id: String,
        index: usize,
        item_value: JsonValue,
    },
    IterationFinished {
        step_id: String,
        index: usize,
        status: StepStatus,
        duration_ms: u64,
    },
    LoopFinished {
        step_id: String,
        exit_reason: ExitReason,
        completed_iterations: usize,
    },
    BranchSelected {
        step_id: String,
        index: usize,
        label: String,
    },
    VariableChanged {
        step_id: String,
        name: String,
        value: Option<JsonValue>,
    },
    RunCompleted {
        run_id: String,
        status: RunStatus,
        summary: RunSummary,
        finished_at: DateTime<Utc>,
    },
}
