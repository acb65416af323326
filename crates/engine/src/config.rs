//! Engine configuration.
//!
//! Values come from defaults, then an optional YAML/JSON file, then `STEPFLOW_*`
//! environment variables.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resolve::DEFAULT_REDACTION_MARKER;

/// Iteration ceiling applied to loops that do not declare `maxIterations`.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
/// Sub-workflow nesting limit.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 8;

pub const MAX_ITERATIONS_ENV: &str = "STEPFLOW_MAX_ITERATIONS";
pub const MAX_CALL_DEPTH_ENV: &str = "STEPFLOW_MAX_CALL_DEPTH";
pub const ACTION_TIMEOUT_ENV: &str = "STEPFLOW_ACTION_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub default_max_iterations: u32,
    pub max_call_depth: usize,
    /// Timeout for action steps that do not declare `timeoutMs`. `None` waits indefinitely.
    pub action_timeout_ms: Option<u64>,
    pub redaction_marker: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            action_timeout_ms: None,
            redaction_marker: DEFAULT_REDACTION_MARKER.to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads a configuration file. YAML is a superset of JSON, so both are accepted.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).with_context(|| format!("Invalid engine config: {}", path.display()))
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable source.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(MAX_ITERATIONS_ENV) {
            self.default_max_iterations = raw
                .trim()
                .parse()
                .with_context(|| format!("{MAX_ITERATIONS_ENV} must be a positive integer, got '{raw}'"))?;
        }
        if let Some(raw) = lookup(MAX_CALL_DEPTH_ENV) {
            self.max_call_depth = raw
                .trim()
                .parse()
                .with_context(|| format!("{MAX_CALL_DEPTH_ENV} must be a positive integer, got '{raw}'"))?;
        }
        if let Some(raw) = lookup(ACTION_TIMEOUT_ENV) {
            self.action_timeout_ms = Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("{ACTION_TIMEOUT_ENV} must be milliseconds, got '{raw}'"))?,
            );
        }
        Ok(self)
    }

    /// Effective cap for a loop: its own limit when positive, else the configured default.
    pub fn iteration_cap(&self, declared: Option<u32>) -> u32 {
        declared
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_max_iterations)
            .max(1)
    }
}
