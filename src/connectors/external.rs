//! Subprocess connector plugins.
//!
//! A plugin is an executable speaking JSON over stdio:
//!
//! - Metadata: invoked with `--describe`, prints
//!   `{"name": "...", "actions": [...]}` and exits 0.
//! - Invocation: invoked with no arguments; the engine writes
//!   `{"action": "...", "input": {...}}` to stdin and the plugin writes
//!   `{"status": "...", "output": {...}, "error": "..."}` to stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ActionDef, ActionResult, Connector};
use crate::error::{Error, Result};
use crate::flow::StepStatus;

/// A connector backed by an external executable.
pub struct ExternalConnector {
    name: String,
    path: PathBuf,
    actions: Vec<ActionDef>,
}

#[derive(Debug, Deserialize)]
struct DescribeOutput {
    #[serde(default)]
    name: String,
    #[serde(default)]
    actions: Vec<ActionDef>,
}

#[derive(Debug, Serialize)]
struct PluginRequest<'a> {
    action: &'a str,
    input: &'a Map<String, Value>,
}

/// Probe an executable with `--describe` and wrap it as a connector.
///
/// An empty advertised name defaults to the file stem.
pub async fn load_plugin(path: &Path) -> Result<ExternalConnector> {
    let out = Command::new(path)
        .arg("--describe")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Connector(format!("running {} --describe: {}", path.display(), e)))?;

    if !out.status.success() {
        return Err(Error::Connector(format!(
            "{} --describe exited with {}: {}",
            path.display(),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let desc: DescribeOutput = serde_json::from_slice(&out.stdout).map_err(|e| {
        Error::Connector(format!(
            "parsing describe output from {}: {}",
            path.display(),
            e
        ))
    })?;

    let name = if desc.name.is_empty() {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    } else {
        desc.name
    };

    Ok(ExternalConnector {
        name,
        path: path.to_path_buf(),
        actions: desc.actions,
    })
}

/// Discover and load all plugins from a directory.
///
/// Skips directories and non-executable entries. Failed probes produce a
/// warning and are excluded; a missing directory yields no plugins.
pub async fn discover_plugins(dir: &Path) -> Result<Vec<ExternalConnector>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Connector(format!(
                "reading plugins directory {}: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    paths.sort();

    let mut plugins = Vec::new();
    for path in paths {
        if path.is_dir() || !is_executable(&path) {
            continue;
        }
        match load_plugin(&path).await {
            Ok(plugin) => plugins.push(plugin),
            Err(e) => warn!("failed to load plugin {}: {}", path.display(), e),
        }
    }

    Ok(plugins)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[async_trait]
impl Connector for ExternalConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn actions(&self) -> Vec<ActionDef> {
        self.actions.clone()
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        action: &str,
        input: &Map<String, Value>,
    ) -> Result<ActionResult> {
        let request = serde_json::to_vec(&PluginRequest { action, input })?;

        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Connector(format!("running plugin {}: {}", self.path.display(), e))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            Error::Connector(format!("plugin {:?}: stdin unavailable", self.name))
        })?;
        stdin.write_all(&request).await.map_err(|e| {
            Error::Connector(format!("writing to plugin {:?}: {}", self.name, e))
        })?;
        drop(stdin);

        let out = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Execution(format!("plugin {:?}: cancelled", self.name)));
            }
            out = child.wait_with_output() => out.map_err(|e| {
                Error::Connector(format!("waiting for plugin {:?}: {}", self.name, e))
            })?,
        };

        // Valid JSON on stdout wins regardless of exit status.
        if let Ok(response) = serde_json::from_slice::<ActionResult>(&out.stdout) {
            return Ok(response);
        }

        if !out.status.success() {
            let code = out.status.code().unwrap_or(-1);
            return Ok(ActionResult {
                status: StepStatus::Error,
                output: Map::new(),
                error: format!(
                    "plugin exited with code {}: {}",
                    code,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }

        Err(Error::Connector(format!(
            "parsing response from plugin {:?}: invalid JSON",
            self.name
        )))
    }

    fn validate(&self) -> Result<()> {
        std::fs::metadata(&self.path).map(|_| ()).map_err(|e| {
            Error::Connector(format!("plugin binary {}: {}", self.path.display(), e))
        })
    }
}
