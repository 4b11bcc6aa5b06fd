//! Flow type definitions.
//!
//! A flow is a declarative document: an ordered list of steps, each invoking
//! a named connector action with an input bag that may contain `${{ ... }}`
//! expressions. These types are the parsed form of that document plus the
//! structured execution record the engine produces.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete flow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: notify-oncall
/// description: Page the on-call channel when a deploy fails
///
/// input:
///   properties:
///     service:
///       type: string
///       required: true
///
/// steps:
///   - name: check-health
///     connector: http
///     action: request
///     input:
///       url: "https://status.example.com/${{ input.service }}"
///
///   - name: page
///     connector: log
///     action: print
///     when: ${{ steps.check-health.output.status_code >= "500" }}
///     input:
///       message: "service ${{ input.service }} is down"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDef {
    /// Unique flow name (used as identifier).
    #[serde(default)]
    pub name: String,

    /// Version string (opaque, for humans).
    #[serde(default)]
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Input schema for the flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<SchemaDef>,

    /// Output schema (descriptive only; not enforced by the engine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<SchemaDef>,

    /// How the flow is triggered (consumed by the webhook listener).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerDef>,

    /// Ordered steps of the flow.
    #[serde(default)]
    pub steps: Vec<StepDef>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Input or output schema of a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDef {
    #[serde(default)]
    pub properties: HashMap<String, FieldDef>,
}

/// A single field in a schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type", default)]
    pub field_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub required: bool,
}

/// How a flow is triggered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerDef {
    #[serde(rename = "type", default)]
    pub trigger_type: String,

    #[serde(default)]
    pub path: String,
}

/// A single step in a flow, or a parallel group of steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDef {
    /// Unique step name within the flow.
    #[serde(default)]
    pub name: String,

    /// Connector to invoke. The literal `flow` runs a sub-flow instead.
    #[serde(default)]
    pub connector: String,

    /// Action exposed by the connector.
    #[serde(default)]
    pub action: String,

    /// Input bag; string values may contain `${{ ... }}` expressions.
    #[serde(default)]
    pub input: Map<String, Value>,

    /// Failure policy: abort (default), continue, skip, or retry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub on_error: String,

    /// Retry configuration; required when `on_error` is `retry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDef>,

    /// Condition expression; the step only runs when it evaluates true.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,

    /// Sibling steps run concurrently. When non-empty this step is a group
    /// marker and its own connector/action/input are ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<StepDef>,

    /// Sub-flow name when `connector` is `flow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

/// Retry configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDef {
    /// Maximum retry attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in seconds; doubled on every attempt.
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: f64,
}

impl Default for RetryDef {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_seconds() -> f64 {
    1.0
}

/// Status of a single executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The connector ran the action and reported success.
    Success,
    /// The connector ran the action and reported a logical failure.
    Failed,
    /// Engine-side failure: missing connector, resolution error, or the
    /// connector itself errored.
    Error,
    /// The step's `when` condition evaluated false.
    Skipped,
    /// Dry-run mode; the step was resolved but not executed.
    DryRun,
    /// Dry-run mode; input resolution failed.
    ResolveError,
    /// Mirrored from a sub-flow that completed partially.
    Partial,
}

impl StepStatus {
    /// Whether this status triggers the step's `on_error` policy.
    pub fn is_failure(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
            StepStatus::DryRun => "dry_run",
            StepStatus::ResolveError => "resolve_error",
            StepStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Success,
    /// At least one step failed under `on_error: continue`.
    Partial,
    Failed,
    DryRun,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Success => "success",
            FlowStatus::Partial => "partial",
            FlowStatus::Failed => "failed",
            FlowStatus::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FlowStatus> for StepStatus {
    fn from(status: FlowStatus) -> Self {
        match status {
            FlowStatus::Success => StepStatus::Success,
            FlowStatus::Partial => StepStatus::Partial,
            FlowStatus::Failed => StepStatus::Failed,
            FlowStatus::DryRun => StepStatus::DryRun,
        }
    }
}

/// Result of executing a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connector: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output: Map<String, Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default)]
    pub duration_ms: u64,

    /// Retry attempts actually performed.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl StepResult {
    pub fn new(name: &str, connector: &str, action: &str, status: StepStatus) -> Self {
        Self {
            name: name.to_string(),
            connector: connector.to_string(),
            action: action.to_string(),
            status,
            output: Map::new(),
            error: String::new(),
            duration_ms: 0,
            retries: 0,
        }
    }
}

/// Result of an entire flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow: String,

    pub status: FlowStatus,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub input: Map<String, Value>,

    pub steps: Vec<StepResult>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl FlowResult {
    /// Create an in-progress result for a flow starting now.
    pub fn started(flow: &FlowDef, status: FlowStatus, input: Map<String, Value>) -> Self {
        Self {
            flow: flow.name.clone(),
            status,
            started_at: Utc::now(),
            completed_at: None,
            input,
            steps: Vec::with_capacity(flow.steps.len()),
            error: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            StepStatus::Success,
            StepStatus::Failed,
            StepStatus::Error,
            StepStatus::Skipped,
            StepStatus::DryRun,
            StepStatus::ResolveError,
            StepStatus::Partial,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            let back: StepStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn test_step_result_serialization_omits_empty_fields() {
        let sr = StepResult::new("s", "log", "print", StepStatus::Success);
        let json = serde_json::to_value(&sr).unwrap();
        assert!(json.get("output").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("retries").is_none());
        assert_eq!(json["status"], "success");
    }

    #[test]
    fn test_retry_defaults() {
        let retry: RetryDef = serde_yaml::from_str("{}").unwrap();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.backoff_seconds, 1.0);
    }

    #[test]
    fn test_flow_status_maps_to_step_status() {
        assert_eq!(StepStatus::from(FlowStatus::Success), StepStatus::Success);
        assert_eq!(StepStatus::from(FlowStatus::Partial), StepStatus::Partial);
        assert_eq!(StepStatus::from(FlowStatus::Failed), StepStatus::Failed);
    }
}
