//! Log connector - print messages from flows.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{field, ActionDef, ActionResult, Connector};
use crate::engine::render_value;
use crate::error::{Error, Result};

/// Prints messages to stdout for debugging flows.
pub struct LogConnector;

impl LogConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LogConnector {
    fn name(&self) -> &str {
        "log"
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![ActionDef {
            name: "print".to_string(),
            description: "Print a message to stdout".to_string(),
            input: [(
                "message".to_string(),
                field("string", "Message to print", true),
            )]
            .into_iter()
            .collect(),
            output: [(
                "message".to_string(),
                field("string", "The printed message", false),
            )]
            .into_iter()
            .collect(),
        }]
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        action: &str,
        input: &Map<String, Value>,
    ) -> Result<ActionResult> {
        if action != "print" {
            return Err(Error::Connector(format!(
                "log connector: unknown action {:?}",
                action
            )));
        }

        let message = render_value(input.get("message").unwrap_or(&Value::Null));
        println!("[log] {}", message);

        let mut output = Map::new();
        output.insert("message".to_string(), Value::String(message));
        Ok(ActionResult::success(output))
    }
}
