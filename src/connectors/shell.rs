//! Shell connector - execute commands through the OS shell.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{field, ActionDef, ActionResult, Connector};
use crate::error::{Error, Result};
use crate::flow::StepStatus;

/// Executes shell commands via `sh -c`.
pub struct ShellConnector;

impl ShellConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for ShellConnector {
    fn name(&self) -> &str {
        "shell"
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![ActionDef {
            name: "run".to_string(),
            description: "Execute a shell command".to_string(),
            input: [
                (
                    "command".to_string(),
                    field("string", "Command to execute", true),
                ),
                ("dir".to_string(), field("string", "Working directory", false)),
            ]
            .into_iter()
            .collect(),
            output: [
                ("stdout".to_string(), field("string", "Standard output", false)),
                ("stderr".to_string(), field("string", "Standard error", false)),
                ("exit_code".to_string(), field("integer", "Exit code", false)),
            ]
            .into_iter()
            .collect(),
        }]
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        action: &str,
        input: &Map<String, Value>,
    ) -> Result<ActionResult> {
        if action != "run" {
            return Err(Error::Connector(format!(
                "shell connector: unknown action {:?}",
                action
            )));
        }

        let command = input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if command.is_empty() {
            return Err(Error::Connector(
                "shell connector: 'command' is required".to_string(),
            ));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = input.get("dir").and_then(Value::as_str).filter(|d| !d.is_empty()) {
            cmd.current_dir(dir);
        }

        debug!("shell: sh -c {:?}", command);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Execution("shell connector: command cancelled".to_string()));
            }
            output = cmd.output() => output.map_err(|e| {
                Error::Connector(format!("shell connector: {}", e))
            })?,
        };

        // None means the process was killed by a signal.
        let exit_code = output.status.code().unwrap_or(-1);

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut out = Map::new();
        out.insert(
            "stdout".to_string(),
            Value::String(stdout.trim_end_matches('\n').to_string()),
        );
        out.insert(
            "stderr".to_string(),
            Value::String(stderr.trim_end_matches('\n').to_string()),
        );
        out.insert("exit_code".to_string(), Value::from(exit_code));

        let status = if exit_code == 0 {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };

        Ok(ActionResult {
            status,
            output: out,
            error: String::new(),
        })
    }
}
