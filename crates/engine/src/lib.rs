//! # Stepflow Engine
//!
//! Interprets workflow step trees: nested groups, loops, and branches whose leaves are
//! actions handed to a pluggable [`ActionExecutor`]. Every run produces a [`RunTrace`]
//! mirroring the step tree with per-step status, timing, resolved inputs, captured outputs,
//! loop and branch diagnostics, and variable changes. Secrets are masked everywhere they are
//! rendered.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use stepflow_engine::{Engine, NoopExecutor, Scope, parse_workflow_document};
//!
//! let bundle = parse_workflow_document(r#"
//! workflow: "ping"
//! steps:
//!   - id: "hello"
//!     kind: action
//!     actionType: echo
//!     inputs:
//!       greeting: "hi {{name}}"
//! "#)?;
//! let workflow = bundle.first().expect("one workflow");
//!
//! let mut scope = Scope::new();
//! scope.set("name", serde_json::json!("ada"));
//! let engine = Engine::new(Arc::new(NoopExecutor));
//! let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! let trace = runtime.block_on(engine.run(&workflow.steps, scope));
//! assert_eq!(trace.steps[0].resolved_inputs["greeting"], "hi ada");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`resolve`**: `{{ path }}` template substitution and secret masking
//! - **`scope`**: layered variable frames
//! - **`condition`**: condition, loop source, and count evaluation
//! - **`executor`**: the step tree interpreter and the action executor seam
//! - **`workflow`**: documents, run control, and the event-streaming runner
//! - **`config`**: engine limits and defaults

pub mod condition;
pub mod config;
pub mod error;
pub mod executor;
pub mod resolve;
pub mod scope;
pub mod workflow;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use error::{EvalError, StepError};
pub use executor::{ActionExecutor, ActionRouter, Engine, NoopExecutor, ResolvedAction, WorkflowLibrary};
pub use scope::{Binding, Scope, ScopeSeed};
pub use stepflow_types::RunTrace;
pub use workflow::document::{WorkflowBundle, build_library, parse_workflow_document, parse_workflow_file};
pub use workflow::runner::{RunRequest, drive_run};
