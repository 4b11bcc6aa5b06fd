//! Tool-protocol server over stdio.
//!
//! Speaks JSON-RPC 2.0 on stdin/stdout following the MCP (Model Context
//! Protocol) wire format, exposing every loaded flow as a callable tool
//! whose input schema derives from the flow's input properties.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::Result;
use crate::flow::{FlowDef, FlowStatus};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Exposes flows as tools over a JSON-RPC stdio transport.
pub struct McpServer {
    engine: Engine,
    flows: HashMap<String, FlowDef>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

fn ok_response(id: Option<Value>, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn err_response(id: Option<Value>, code: i64, message: String) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError { code, message }),
    }
}

impl McpServer {
    pub fn new(engine: Engine, flows: HashMap<String, FlowDef>) -> Self {
        Self { engine, flows }
    }

    /// Serve requests from stdin until EOF.
    pub async fn serve_stdio(&self) -> Result<()> {
        info!("tool server ready on stdio ({} flows)", self.flows.len());

        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request: RpcRequest = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    debug!("ignoring malformed request: {}", e);
                    continue;
                }
            };

            if let Some(response) = self.handle_request(request).await {
                let mut payload = serde_json::to_vec(&response)?;
                payload.push(b'\n');
                stdout.write_all(&payload).await?;
                stdout.flush().await?;
            }
        }

        Ok(())
    }

    async fn handle_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        match request.method.as_str() {
            "initialize" => Some(ok_response(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": "relay",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )),

            // Notifications get no response.
            "notifications/initialized" => None,

            "tools/list" => Some(ok_response(
                request.id,
                json!({"tools": self.list_tools()}),
            )),

            "tools/call" => {
                let params = match request.params.map(serde_json::from_value::<CallToolParams>) {
                    Some(Ok(params)) => params,
                    Some(Err(e)) => {
                        return Some(err_response(
                            request.id,
                            -32602,
                            format!("invalid params: {}", e),
                        ))
                    }
                    None => {
                        return Some(err_response(
                            request.id,
                            -32602,
                            "invalid params: missing".to_string(),
                        ))
                    }
                };
                let (text, is_error) = self.call_tool(params).await;
                Some(ok_response(
                    request.id,
                    json!({
                        "content": [{"type": "text", "text": text}],
                        "isError": is_error,
                    }),
                ))
            }

            other => Some(err_response(
                request.id,
                -32601,
                format!("method not found: {}", other),
            )),
        }
    }

    fn list_tools(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.flows.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let flow = &self.flows[name];
                json!({
                    "name": flow.name,
                    "description": flow.description,
                    "inputSchema": input_schema(flow),
                })
            })
            .collect()
    }

    async fn call_tool(&self, params: CallToolParams) -> (String, bool) {
        let Some(flow) = self.flows.get(&params.name) else {
            return (format!("flow {:?} not found", params.name), true);
        };

        match self
            .engine
            .run(flow, params.arguments, CancellationToken::new())
            .await
        {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result)
                    .unwrap_or_else(|e| format!("error serializing result: {}", e));
                (text, result.status == FlowStatus::Failed)
            }
            Err(e) => (format!("error: {}", e), true),
        }
    }
}

/// Derive a JSON schema object from the flow's input properties.
fn input_schema(flow: &FlowDef) -> Value {
    let mut schema = json!({"type": "object"});

    let Some(input) = &flow.input else {
        return schema;
    };
    if input.properties.is_empty() {
        return schema;
    }

    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();
    let mut names: Vec<&String> = input.properties.keys().collect();
    names.sort();

    for name in names {
        let field = &input.properties[name];
        let mut prop = Map::new();
        prop.insert("type".to_string(), Value::String(field.field_type.clone()));
        if !field.description.is_empty() {
            prop.insert(
                "description".to_string(),
                Value::String(field.description.clone()),
            );
        }
        properties.insert(name.clone(), Value::Object(prop));
        if field.required {
            required.push(name.clone());
        }
    }

    schema["properties"] = Value::Object(properties);
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{LogConnector, Registry};
    use crate::flow::{FieldDef, SchemaDef, StepDef};
    use std::sync::Arc;

    fn test_server() -> McpServer {
        let registry = Registry::new();
        registry.register(Arc::new(LogConnector::new())).unwrap();
        let engine = Engine::new(Arc::new(registry));

        let mut flows = HashMap::new();
        flows.insert(
            "greet".to_string(),
            FlowDef {
                name: "greet".to_string(),
                description: "Say hello".to_string(),
                input: Some(SchemaDef {
                    properties: [(
                        "name".to_string(),
                        FieldDef {
                            field_type: "string".to_string(),
                            description: "Who to greet".to_string(),
                            required: true,
                        },
                    )]
                    .into_iter()
                    .collect(),
                }),
                steps: vec![StepDef {
                    name: "say".to_string(),
                    connector: "log".to_string(),
                    action: "print".to_string(),
                    input: serde_json::json!({"message": "hello ${{ input.name }}"})
                        .as_object()
                        .unwrap()
                        .clone(),
                    ..StepDef::default()
                }],
                ..FlowDef::default()
            },
        );

        McpServer::new(engine, flows)
    }

    #[tokio::test]
    async fn test_initialize() {
        let server = test_server();
        let response = server
            .handle_request(RpcRequest {
                id: Some(json!(1)),
                method: "initialize".to_string(),
                params: None,
            })
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "relay");
    }

    #[tokio::test]
    async fn test_initialized_notification_has_no_response() {
        let server = test_server();
        let response = server
            .handle_request(RpcRequest {
                id: None,
                method: "notifications/initialized".to_string(),
                params: None,
            })
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_tools_list_derives_schema() {
        let server = test_server();
        let response = server
            .handle_request(RpcRequest {
                id: Some(json!(2)),
                method: "tools/list".to_string(),
                params: None,
            })
            .await
            .unwrap();

        let result = response.result.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "greet");
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
        assert_eq!(tools[0]["inputSchema"]["properties"]["name"]["type"], "string");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["name"]));
    }

    #[tokio::test]
    async fn test_tools_call_runs_flow() {
        let server = test_server();
        let response = server
            .handle_request(RpcRequest {
                id: Some(json!(3)),
                method: "tools/call".to_string(),
                params: Some(json!({"name": "greet", "arguments": {"name": "World"}})),
            })
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("\"status\": \"success\""));
        assert!(text.contains("hello World"));
    }

    #[tokio::test]
    async fn test_tools_call_unknown_flow() {
        let server = test_server();
        let response = server
            .handle_request(RpcRequest {
                id: Some(json!(4)),
                method: "tools/call".to_string(),
                params: Some(json!({"name": "ghost", "arguments": {}})),
            })
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = test_server();
        let response = server
            .handle_request(RpcRequest {
                id: Some(json!(5)),
                method: "bogus/method".to_string(),
                params: None,
            })
            .await
            .unwrap();

        assert_eq!(response.error.unwrap().code, -32601);
    }
}
