//! Workflow-level runtime: documents, run control, and the event-streaming runner.

pub mod control;
pub mod document;
pub mod runner;
