//! Flow validation.
//!
//! Runs once before execution and collects every issue it finds rather than
//! stopping at the first, so authors can fix a document in one pass.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};

use super::context::expr_regex;
use crate::connectors::Registry;
use crate::error::{Error, Result};
use crate::flow::{FlowDef, StepDef};

/// Aggregate of all validation issues found in a flow.
#[derive(Debug, Default)]
pub struct ValidationError {
    errors: Vec<String>,
}

impl ValidationError {
    fn add(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed:\n  - {}", self.errors.join("\n  - "))
    }
}

impl std::error::Error for ValidationError {}

/// Validate a flow definition against the registry and internal consistency.
///
/// Checks required fields, unique step names, known connectors and actions,
/// `on_error` policies, and that step references only point at steps that
/// execute earlier. A parallel group counts as a single position, so
/// siblings cannot reference each other.
pub fn validate_flow(flow: &FlowDef, registry: &Registry) -> Result<()> {
    let mut ve = ValidationError::default();

    if flow.name.is_empty() {
        ve.add("flow 'name' is required");
    }
    if flow.steps.is_empty() {
        ve.add("flow must have at least one step");
    }

    let mut step_names: HashMap<&str, usize> = HashMap::new();
    for (i, step) in flow.steps.iter().enumerate() {
        if !step.parallel.is_empty() {
            if step.name.is_empty() {
                ve.add(format!("step {}: 'name' is required", i + 1));
            } else {
                record_step_name(step, i, &mut step_names, &mut ve);
            }
            check_on_error(step, &mut ve);

            for child in &step.parallel {
                if !child.parallel.is_empty() {
                    ve.add(format!(
                        "step {:?}: nested parallel groups are not supported",
                        child.name
                    ));
                }
                check_step(child, i, registry, &mut step_names, &mut ve);
            }
            // All siblings are registered before any reference check, at the
            // group's own index, so intra-group references are rejected.
            for child in &step.parallel {
                check_step_refs(&child.input, &step_names, &child.name, i, &mut ve);
            }
            continue;
        }

        check_step(step, i, registry, &mut step_names, &mut ve);
        check_step_refs(&step.input, &step_names, &step.name, i, &mut ve);
    }

    if ve.has_errors() {
        Err(Error::Validation(ve))
    } else {
        Ok(())
    }
}

/// Check that every required property in the flow's input schema is present.
pub fn validate_input(flow: &FlowDef, input: &Map<String, Value>) -> Result<()> {
    let Some(schema) = &flow.input else {
        return Ok(());
    };

    let mut ve = ValidationError::default();
    let mut names: Vec<&String> = schema.properties.keys().collect();
    names.sort();
    for name in names {
        if schema.properties[name].required && !input.contains_key(name) {
            ve.add(format!("required input field {:?} is missing", name));
        }
    }

    if ve.has_errors() {
        Err(Error::Validation(ve))
    } else {
        Ok(())
    }
}

fn record_step_name<'a>(
    step: &'a StepDef,
    index: usize,
    step_names: &mut HashMap<&'a str, usize>,
    ve: &mut ValidationError,
) {
    if let Some(prev) = step_names.insert(&step.name, index) {
        ve.add(format!(
            "step {}: duplicate step name {:?} (first at step {})",
            index + 1,
            step.name,
            prev + 1
        ));
    }
}

fn check_step<'a>(
    step: &'a StepDef,
    index: usize,
    registry: &Registry,
    step_names: &mut HashMap<&'a str, usize>,
    ve: &mut ValidationError,
) {
    if step.name.is_empty() {
        ve.add(format!("step {}: 'name' is required", index + 1));
        return;
    }
    record_step_name(step, index, step_names, ve);

    if step.connector.is_empty() {
        ve.add(format!("step {:?}: 'connector' is required", step.name));
    } else if step.connector == "flow" {
        // Sub-flow steps are engine-intrinsic; the registry is not consulted.
        let named = step.flow.as_deref().map(|f| !f.is_empty()).unwrap_or(false);
        if !named && !step.input.contains_key("flow") {
            ve.add(format!(
                "step {:?}: flow step requires 'flow' field or input.flow",
                step.name
            ));
        }
    } else if let Some(connector) = registry.get(&step.connector) {
        if !step.action.is_empty()
            && !connector.actions().iter().any(|a| a.name == step.action)
        {
            ve.add(format!(
                "step {:?}: connector {:?} does not support action {:?}",
                step.name, step.connector, step.action
            ));
        }
    } else {
        ve.add(format!(
            "step {:?}: connector {:?} not found in registry",
            step.name, step.connector
        ));
    }

    check_on_error(step, ve);
}

fn check_on_error(step: &StepDef, ve: &mut ValidationError) {
    match step.on_error.as_str() {
        "" | "abort" | "continue" | "skip" => {}
        "retry" => match &step.retry {
            None => ve.add(format!(
                "step {:?}: on_error 'retry' requires a 'retry' configuration",
                step.name
            )),
            Some(retry) if retry.max_retries < 1 => ve.add(format!(
                "step {:?}: retry.max_retries must be at least 1",
                step.name
            )),
            Some(_) => {}
        },
        other => ve.add(format!(
            "step {:?}: invalid on_error value {:?} (must be abort, continue, skip, or retry)",
            step.name, other
        )),
    }
}

fn check_step_refs(
    input: &Map<String, Value>,
    step_names: &HashMap<&str, usize>,
    current: &str,
    index: usize,
    ve: &mut ValidationError,
) {
    for value in input.values() {
        check_value_refs(value, step_names, current, index, ve);
    }
}

fn check_value_refs(
    value: &Value,
    step_names: &HashMap<&str, usize>,
    current: &str,
    index: usize,
    ve: &mut ValidationError,
) {
    match value {
        Value::String(s) => check_string_refs(s, step_names, current, index, ve),
        Value::Object(map) => {
            for item in map.values() {
                check_value_refs(item, step_names, current, index, ve);
            }
        }
        Value::Array(items) => {
            for item in items {
                check_value_refs(item, step_names, current, index, ve);
            }
        }
        _ => {}
    }
}

fn check_string_refs(
    s: &str,
    step_names: &HashMap<&str, usize>,
    current: &str,
    index: usize,
    ve: &mut ValidationError,
) {
    for caps in expr_regex().captures_iter(s) {
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let path = expr.split('|').next().unwrap_or_default().trim();

        let Some(rest) = path.strip_prefix("steps.") else {
            continue;
        };
        let ref_name = rest.split('.').next().unwrap_or_default();

        match step_names.get(ref_name) {
            None => ve.add(format!(
                "step {:?}: references unknown step {:?}",
                current, ref_name
            )),
            Some(&idx) if idx >= index => ve.add(format!(
                "step {:?}: references step {:?} which has not executed yet",
                current, ref_name
            )),
            Some(_) => {}
        }
    }
}
