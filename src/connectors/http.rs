//! HTTP connector - generic HTTP requests.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{field, ActionDef, ActionResult, Connector};
use crate::engine::render_value;
use crate::error::{Error, Result};
use crate::flow::StepStatus;

/// Generic HTTP request connector.
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn name(&self) -> &str {
        "http"
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![ActionDef {
            name: "request".to_string(),
            description: "Make an HTTP request".to_string(),
            input: [
                ("url".to_string(), field("string", "Request URL", true)),
                (
                    "method".to_string(),
                    field("string", "HTTP method (GET, POST, PUT, DELETE)", false),
                ),
                (
                    "headers".to_string(),
                    field("object", "Request headers", false),
                ),
                (
                    "body".to_string(),
                    field("any", "Request body (JSON-encoded if object)", false),
                ),
            ]
            .into_iter()
            .collect(),
            output: [
                (
                    "status_code".to_string(),
                    field("integer", "HTTP status code", false),
                ),
                ("body".to_string(), field("any", "Response body", false)),
                (
                    "headers".to_string(),
                    field("object", "Response headers", false),
                ),
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
        if action != "request" {
            return Err(Error::Connector(format!(
                "http connector: unknown action {:?}",
                action
            )));
        }

        let url = input.get("url").and_then(Value::as_str).unwrap_or_default();
        if url.is_empty() {
            return Err(Error::Connector("http connector: 'url' is required".to_string()));
        }

        let method_name = input
            .get("method")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            Error::Connector(format!("http connector: invalid method {:?}", method_name))
        })?;

        let mut request = self.client.request(method, url);

        let mut has_content_type = false;
        if let Some(Value::Object(headers)) = input.get("headers") {
            for (key, value) in headers {
                if key.eq_ignore_ascii_case("content-type") {
                    has_content_type = true;
                }
                request = request.header(key, render_value(value));
            }
        }

        if let Some(body) = input.get("body").filter(|b| !b.is_null()) {
            request = request.body(serde_json::to_vec(body)?);
            if !has_content_type {
                request = request.header(CONTENT_TYPE, "application/json");
            }
        }

        debug!("http {} {}", method_name, url);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Execution("http connector: request cancelled".to_string()));
            }
            response = request.send() => response.map_err(|e| {
                Error::Connector(format!("http connector: request failed: {}", e))
            })?,
        };

        let status_code = response.status().as_u16();

        let mut headers = Map::new();
        for key in response.headers().keys() {
            let values: Vec<Value> = response
                .headers()
                .get_all(key)
                .iter()
                .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();
            let value = if values.len() == 1 {
                values.into_iter().next().expect("single header value")
            } else {
                Value::Array(values)
            };
            headers.insert(key.to_string(), value);
        }

        let body_text = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Execution("http connector: request cancelled".to_string()));
            }
            text = response.text() => text.map_err(|e| {
                Error::Connector(format!("http connector: reading response: {}", e))
            })?,
        };

        // Parse JSON bodies; fall back to the raw string.
        let body = match serde_json::from_str::<Value>(&body_text) {
            Ok(value) => value,
            Err(_) => Value::String(body_text),
        };

        let mut output = Map::new();
        output.insert("status_code".to_string(), Value::from(status_code));
        output.insert("body".to_string(), body);
        output.insert("headers".to_string(), Value::Object(headers));

        let status = if status_code >= 400 {
            StepStatus::Failed
        } else {
            StepStatus::Success
        };

        Ok(ActionResult {
            status,
            output,
            error: String::new(),
        })
    }
}
