//! Webhook connector - trigger-only placeholder.
//!
//! Webhook serving is done by the server module; this connector exists so
//! flows declaring a `webhook` trigger validate against the registry.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{ActionDef, ActionResult, Connector};
use crate::error::{Error, Result};

pub struct WebhookConnector;

impl WebhookConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebhookConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    fn name(&self) -> &str {
        "webhook"
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![ActionDef {
            name: "trigger".to_string(),
            description: "Webhook trigger (handled by the server)".to_string(),
            ..ActionDef::default()
        }]
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _action: &str,
        _input: &Map<String, Value>,
    ) -> Result<ActionResult> {
        Err(Error::Connector(
            "webhook connector: cannot be executed directly; it is a trigger-only connector"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_always_errors() {
        let connector = WebhookConnector::new();
        let err = connector
            .execute(&CancellationToken::new(), "trigger", &Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("trigger-only"));
    }
}
