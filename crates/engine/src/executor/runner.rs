//! Action executor seam.
//!
//! The interpreter never performs I/O itself. Every leaf action is handed to an
//! [`ActionExecutor`] with its inputs already resolved; the executor's JSON result is the
//! only channel through which data flows back into the workflow (via output bindings).

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value};

/// A leaf action ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAction {
    pub step_id: String,
    /// Executor-defined subtype such as `http` or `command`.
    pub action_type: String,
    /// Opaque configuration, passed through untouched.
    pub config: JsonMap<String, Value>,
    /// Inputs after template resolution. Secrets are not masked here.
    pub inputs: IndexMap<String, String>,
}

/// Executes leaf actions.
///
/// Implementations may call HTTP endpoints, spawn processes, or query databases. They must
/// not retain or mutate workflow state; the returned value is the action result that output
/// bindings select from.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &ResolvedAction) -> Result<Value>;
}

/// An executor that echoes its action back without side effects.
///
/// Useful for previews and tests: the result holds the action type, config, and every
/// resolved input at the top level.
pub struct NoopExecutor;

#[async_trait]
impl ActionExecutor for NoopExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<Value> {
        let mut result = JsonMap::new();
        result.insert("actionType".into(), Value::String(action.action_type.clone()));
        result.insert("config".into(), Value::Object(action.config.clone()));
        for (name, value) in &action.inputs {
            result.insert(name.clone(), Value::String(value.clone()));
        }
        Ok(Value::Object(result))
    }
}
