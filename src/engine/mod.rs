//! Flow execution engine.
//!
//! The engine walks a validated flow's steps in order, fanning out inside
//! parallel groups, applying per-step failure policies, and recording a
//! structured execution result. Sub-flows recurse through a loader callback
//! so the engine stays independent of the document format.

mod context;
mod secrets;
mod validator;

pub use context::{render_value, StepContext};
pub use secrets::load_secrets;
pub use validator::{validate_flow, validate_input, ValidationError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectors::Registry;
use crate::error::Result;
use crate::flow::{FlowDef, FlowResult, FlowStatus, StepDef, StepResult, StepStatus};

/// Callback used to resolve sub-flow names for flow composition steps.
pub type FlowLoader = Arc<dyn Fn(&str) -> Result<FlowDef> + Send + Sync>;

/// Executes flow definitions against a connector registry.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    flow_loader: Option<FlowLoader>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            flow_loader: None,
        }
    }

    /// Enable flow composition.
    ///
    /// The engine does not detect sub-flow cycles; loaders built over
    /// mutable flow sets should guard against recursive self-reference.
    pub fn with_flow_loader(mut self, loader: FlowLoader) -> Self {
        self.flow_loader = Some(loader);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute a flow with the given input.
    pub async fn run(
        &self,
        flow: &FlowDef,
        input: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        self.run_with_secrets(flow, input, HashMap::new(), cancel).await
    }

    /// Execute a flow with the given input and secrets.
    pub async fn run_with_secrets(
        &self,
        flow: &FlowDef,
        input: Map<String, Value>,
        secrets: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        validate_input(flow, &input)?;

        let result = FlowResult::started(flow, FlowStatus::Success, input.clone());
        let sctx = StepContext::new(input).with_secrets(secrets);

        info!(flow = %flow.name, "starting flow");
        self.run_with_context(flow, result, sctx, cancel).await
    }

    async fn run_with_context(
        &self,
        flow: &FlowDef,
        mut result: FlowResult,
        mut sctx: StepContext,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        for step in &flow.steps {
            if cancel.is_cancelled() {
                result.status = FlowStatus::Failed;
                result.error = "execution cancelled".to_string();
                break;
            }

            // Parallel group: run all siblings, then record their results in
            // declaration order.
            if !step.parallel.is_empty() {
                let group = self.execute_parallel(&step.parallel, &sctx, &cancel).await;
                for sr in group {
                    sctx.add_step_result(&sr);
                    let abort = apply_on_error(&sr, &step.on_error, &mut result);
                    result.steps.push(sr);
                    if abort {
                        result.completed_at = Some(Utc::now());
                        return Ok(result);
                    }
                }
                continue;
            }

            if !step.when.is_empty() {
                match sctx.evaluate_condition(&step.when) {
                    Err(e) => {
                        let mut sr = StepResult::new(
                            &step.name,
                            &step.connector,
                            &step.action,
                            StepStatus::Error,
                        );
                        sr.error = format!("evaluating condition: {}", e);
                        sctx.add_step_result(&sr);
                        let abort = apply_on_error(&sr, &step.on_error, &mut result);
                        result.steps.push(sr);
                        if abort {
                            result.completed_at = Some(Utc::now());
                            return Ok(result);
                        }
                        continue;
                    }
                    Ok(false) => {
                        debug!(step = %step.name, "condition false, skipping");
                        let sr = StepResult::new(
                            &step.name,
                            &step.connector,
                            &step.action,
                            StepStatus::Skipped,
                        );
                        sctx.add_step_result(&sr);
                        result.steps.push(sr);
                        continue;
                    }
                    Ok(true) => {}
                }
            }

            let sr = self.execute_step_with_retry(step, &sctx, &cancel).await;
            sctx.add_step_result(&sr);
            let abort = apply_on_error(&sr, &step.on_error, &mut result);
            result.steps.push(sr);
            if abort {
                result.completed_at = Some(Utc::now());
                return Ok(result);
            }
        }

        result.completed_at = Some(Utc::now());
        info!(flow = %flow.name, status = %result.status, "flow finished");
        Ok(result)
    }

    /// Validate and resolve every step without invoking connectors.
    ///
    /// Parallel groups are flattened into their children. Later steps see
    /// synthetic `{_dry_run: true}` outputs in place of real results.
    pub fn dry_run(&self, flow: &FlowDef, input: Map<String, Value>) -> Result<FlowResult> {
        validate_flow(flow, &self.registry)?;
        validate_input(flow, &input)?;

        let mut result = FlowResult::started(flow, FlowStatus::DryRun, input.clone());
        let mut sctx = StepContext::new(input);

        for step in &flow.steps {
            let children: Vec<&StepDef> = if step.parallel.is_empty() {
                vec![step]
            } else {
                step.parallel.iter().collect()
            };

            for s in children {
                let mut sr =
                    StepResult::new(&s.name, &s.connector, &s.action, StepStatus::DryRun);
                if !s.when.is_empty() {
                    sr.output
                        .insert("_when".to_string(), Value::String(s.when.clone()));
                }

                match sctx.resolve_map(&s.input) {
                    Ok(resolved) => {
                        for (key, value) in resolved {
                            sr.output.insert(key, value);
                        }
                    }
                    Err(e) => {
                        sr.status = StepStatus::ResolveError;
                        sr.error = e.to_string();
                    }
                }
                result.steps.push(sr);

                let mut synthetic =
                    StepResult::new(&s.name, &s.connector, &s.action, StepStatus::DryRun);
                synthetic
                    .output
                    .insert("_dry_run".to_string(), Value::Bool(true));
                sctx.add_step_result(&synthetic);
            }
        }

        result.completed_at = Some(Utc::now());
        Ok(result)
    }

    /// Run all sub-steps of a parallel group concurrently.
    ///
    /// Every worker reads a snapshot of the context taken at group entry, so
    /// siblings never observe each other's outputs. Results come back in
    /// declaration order regardless of completion order.
    // Boxed explicitly (rather than left as an `async fn`) to break the
    // recursive opaque-type cycle: this function spawns tasks that can
    // eventually call back into `run` (flow composition), and the compiler
    // cannot infer `Send` for a self-referential chain of opaque futures.
    fn execute_parallel<'a>(
        &'a self,
        steps: &'a [StepDef],
        sctx: &'a StepContext,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<StepResult>> + Send + 'a>> {
        Box::pin(async move {
            let snapshot = Arc::new(sctx.clone());
            let mut join_set = JoinSet::new();

            for (idx, step) in steps.iter().enumerate() {
                let engine = self.clone();
                let step = step.clone();
                let snapshot = snapshot.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let sr = engine.execute_parallel_branch(&step, &snapshot, &cancel).await;
                    (idx, sr)
                });
            }

            let mut slots: Vec<Option<StepResult>> = (0..steps.len()).map(|_| None).collect();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((idx, sr)) => slots[idx] = Some(sr),
                    Err(e) => warn!("parallel step task failed: {}", e),
                }
            }

            slots
                .into_iter()
                .enumerate()
                .map(|(idx, slot)| {
                    slot.unwrap_or_else(|| {
                        let step = &steps[idx];
                        let mut sr = StepResult::new(
                            &step.name,
                            &step.connector,
                            &step.action,
                            StepStatus::Error,
                        );
                        sr.error = "parallel step aborted unexpectedly".to_string();
                        sr
                    })
                })
                .collect()
        })
    }

    async fn execute_parallel_branch(
        &self,
        step: &StepDef,
        sctx: &StepContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        if !step.when.is_empty() {
            match sctx.evaluate_condition(&step.when) {
                Err(e) => {
                    let mut sr = StepResult::new(
                        &step.name,
                        &step.connector,
                        &step.action,
                        StepStatus::Error,
                    );
                    sr.error = format!("evaluating condition: {}", e);
                    return sr;
                }
                Ok(false) => {
                    return StepResult::new(
                        &step.name,
                        &step.connector,
                        &step.action,
                        StepStatus::Skipped,
                    )
                }
                Ok(true) => {}
            }
        }

        self.execute_step_with_retry(step, sctx, cancel).await
    }

    /// Execute a step, retrying on failure if configured.
    ///
    /// The input is re-resolved on every attempt, and the exponential
    /// backoff sleep is cancellation-aware.
    async fn execute_step_with_retry(
        &self,
        step: &StepDef,
        sctx: &StepContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let mut sr = self.execute_step(step, sctx, cancel).await;

        let Some(retry) = &step.retry else {
            return sr;
        };
        if step.on_error != "retry" {
            return sr;
        }

        let max_retries = if retry.max_retries == 0 { 3 } else { retry.max_retries };
        let backoff = if retry.backoff_seconds <= 0.0 { 1.0 } else { retry.backoff_seconds };

        for attempt in 1..=max_retries {
            if !sr.status.is_failure() {
                break;
            }

            let shift = (attempt - 1).min(20);
            let delay = Duration::from_secs_f64(backoff * f64::powi(2.0, shift as i32));
            debug!(step = %step.name, attempt, ?delay, "retrying after backoff");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    sr.status = StepStatus::Error;
                    sr.error = "cancelled during retry".to_string();
                    sr.retries = attempt;
                    return sr;
                }
                _ = sleep(delay) => {}
            }

            sr = self.execute_step(step, sctx, cancel).await;
            sr.retries = attempt;
        }

        sr
    }

    async fn execute_step(
        &self,
        step: &StepDef,
        sctx: &StepContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let start = Instant::now();
        let mut sr = if step.connector == "flow" {
            self.execute_flow_step(step, sctx, cancel).await
        } else {
            self.execute_connector_step(step, sctx, cancel).await
        };
        sr.duration_ms = start.elapsed().as_millis() as u64;
        sr
    }

    async fn execute_connector_step(
        &self,
        step: &StepDef,
        sctx: &StepContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let mut sr = StepResult::new(&step.name, &step.connector, &step.action, StepStatus::Error);

        let Some(connector) = self.registry.get(&step.connector) else {
            sr.error = format!("connector {:?} not found", step.connector);
            return sr;
        };

        let resolved = match sctx.resolve_map(&step.input) {
            Ok(map) => map,
            Err(e) => {
                sr.error = format!("resolving input: {}", e);
                return sr;
            }
        };

        info!(step = %step.name, connector = %step.connector, action = %step.action, "executing step");

        match connector.execute(cancel, &step.action, &resolved).await {
            Ok(outcome) => {
                sr.status = outcome.status;
                sr.output = outcome.output;
                sr.error = outcome.error;
            }
            Err(e) => {
                warn!(step = %step.name, "connector error: {}", e);
                sr.error = e.to_string();
            }
        }

        sr
    }

    /// Run another flow as a step (flow composition).
    ///
    /// The sub-flow gets a fresh context: it sees nothing of the parent
    /// except the explicitly passed input.
    // Boxed explicitly (rather than left as an `async fn`) to break the
    // recursive opaque-type cycle: this function recurses into `run` for
    // flow composition, and the compiler cannot infer `Send` for a
    // self-referential chain of opaque futures.
    fn execute_flow_step<'a>(
        &'a self,
        step: &'a StepDef,
        sctx: &'a StepContext,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StepResult> + Send + 'a>> {
        Box::pin(async move {
            let mut sr = StepResult::new(&step.name, "flow", "run", StepStatus::Error);

            let Some(loader) = &self.flow_loader else {
                sr.error = "flow composition not configured (no flow loader set)".to_string();
                return sr;
            };

            let mut child_input = match sctx.resolve_map(&step.input) {
                Ok(map) => map,
                Err(e) => {
                    sr.error = format!("resolving sub-flow input: {}", e);
                    return sr;
                }
            };

            let flow_name = step
                .flow
                .clone()
                .filter(|name| !name.is_empty())
                .or_else(|| {
                    child_input
                        .get("flow")
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or_default();
            if flow_name.is_empty() {
                sr.error = "flow step requires 'flow' field or input.flow".to_string();
                return sr;
            }

            let child_flow = match loader(&flow_name) {
                Ok(flow) => flow,
                Err(e) => {
                    sr.error = format!("loading flow {:?}: {}", flow_name, e);
                    return sr;
                }
            };

            // The "flow" key addresses the sub-flow; it is not an input field.
            child_input.remove("flow");

            info!(step = %step.name, flow = %flow_name, "running sub-flow");

            let child_result = match self.run(&child_flow, child_input, cancel.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    sr.error = format!("running flow {:?}: {}", flow_name, e);
                    return sr;
                }
            };

            sr.status = StepStatus::from(child_result.status);
            sr.output.insert(
                "flow_status".to_string(),
                Value::String(child_result.status.to_string()),
            );
            sr.output.insert(
                "steps".to_string(),
                Value::from(child_result.steps.len() as u64),
            );
            // Merge child step outputs; later children win on key collisions.
            for child_step in &child_result.steps {
                for (key, value) in &child_step.output {
                    sr.output.insert(key.clone(), value.clone());
                }
            }
            if !child_result.error.is_empty() {
                sr.error = child_result.error;
            }

            sr
        })
    }
}

/// Apply a step's `on_error` policy to the flow result.
///
/// Returns true when the flow must abort.
fn apply_on_error(sr: &StepResult, on_error: &str, result: &mut FlowResult) -> bool {
    if !sr.status.is_failure() {
        return false;
    }

    match on_error {
        "continue" => {
            // Sticky: a failed flow is never downgraded to partial.
            if result.status != FlowStatus::Failed {
                result.status = FlowStatus::Partial;
            }
            false
        }
        "skip" => false,
        // Default, "abort", and exhausted "retry" all abort.
        _ => {
            result.status = FlowStatus::Failed;
            result.error = format!("step {:?} failed: {}", sr.name, sr.error);
            true
        }
    }
}
