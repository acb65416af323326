//! Action executors shipped with the command line runner.

use std::{str::FromStr, sync::Arc};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use stepflow_engine::{ActionExecutor, ActionRouter, NoopExecutor, ResolvedAction};
use tokio::process::Command;
use tracing::debug;

/// Routes `command` to the shell, `http` to the HTTP client, and everything else to the
/// echoing no-op executor.
pub fn default_router() -> ActionRouter {
    ActionRouter::new()
        .route("command", Arc::new(ShellExecutor))
        .route("http", Arc::new(HttpExecutor::default()))
        .fallback(Arc::new(NoopExecutor))
}

/// Runs the `command` input through `sh -c`.
///
/// Result: `{ "stdout", "stderr", "exitCode" }`. A non-zero exit fails the action.
pub struct ShellExecutor;

#[async_trait]
impl ActionExecutor for ShellExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<Value> {
        let command_line = action
            .inputs
            .get("command")
            .filter(|command| !command.trim().is_empty())
            .context("command action requires a 'command' input")?;

        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line).kill_on_drop(true);
        if let Some(directory) = action.inputs.get("cwd") {
            command.current_dir(directory);
        }
        debug!(step_id = %action.step_id, "spawning shell command");
        let output = command
            .output()
            .await
            .with_context(|| format!("failed to spawn shell for step '{}'", action.step_id))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            bail!("command exited with status {exit_code}: {stderr}");
        }
        Ok(json!({ "stdout": stdout, "stderr": stderr, "exitCode": exit_code }))
    }
}

/// Sends the request described by the `url`, `method`, and `body` inputs.
///
/// Headers come from the `headers` object in the step config. Result:
/// `{ "status", "headers", "body" }`, with a JSON body decoded when possible. HTTP error
/// statuses are results, not failures; only transport errors fail the action.
#[derive(Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

#[async_trait]
impl ActionExecutor for HttpExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<Value> {
        let url = action.inputs.get("url").context("http action requires a 'url' input")?;
        let method_name = action.inputs.get("method").map(String::as_str).unwrap_or("GET");
        let method = reqwest::Method::from_str(&method_name.to_ascii_uppercase())
            .with_context(|| format!("unsupported method: {method_name}"))?;

        let mut builder = self.client.request(method, url);
        if let Some(Value::Object(headers)) = action.config.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                builder = builder.header(name.as_str(), value);
            }
        }
        if let Some(body) = action.inputs.get("body") {
            builder = match serde_json::from_str::<Value>(body) {
                Ok(json_body) => builder.json(&json_body),
                Err(_) => builder.body(body.clone()),
            };
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request for step '{}' failed", action.step_id))?;
        let status = response.status().as_u16();
        let headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str().to_string(), json!(value))))
            .collect();
        let text = response
            .text()
            .await
            .with_context(|| format!("failed to read response body for step '{}'", action.step_id))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status, "headers": headers, "body": body }))
    }
}
