//! Webhook HTTP listener.
//!
//! Each flow with a `webhook` trigger is mapped eagerly at startup:
//! `POST <trigger.path>` runs the flow with the JSON request body as input.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Engine;
use crate::error::Result;
use crate::flow::{FlowDef, FlowStatus, SchemaDef};

/// Serves HTTP requests that trigger flows.
pub struct WebhookServer {
    state: Arc<AppState>,
}

struct AppState {
    engine: Engine,
    flows: HashMap<String, FlowDef>,
    /// trigger path -> flow name
    routes: HashMap<String, String>,
}

impl WebhookServer {
    pub fn new(engine: Engine, flows: HashMap<String, FlowDef>) -> Self {
        let mut routes = HashMap::new();
        for flow in flows.values() {
            if let Some(trigger) = &flow.trigger {
                if trigger.trigger_type == "webhook" && !trigger.path.is_empty() {
                    routes.insert(trigger.path.clone(), flow.name.clone());
                }
            }
        }

        Self {
            state: Arc::new(AppState {
                engine,
                flows,
                routes,
            }),
        }
    }

    /// Webhook routes, as path -> flow name.
    pub fn routes(&self) -> &HashMap<String, String> {
        &self.state.routes
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/flows", get(handle_list_flows))
            .fallback(handle_trigger)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve until the process exits.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("webhook server listening on {}", addr);
        for (path, flow) in &self.state.routes {
            info!("  POST {} -> {}", path, flow);
        }
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Serialize)]
struct FlowInfo {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trigger_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<SchemaDef>,
}

async fn handle_list_flows(State(state): State<Arc<AppState>>) -> Json<Vec<FlowInfo>> {
    let mut infos: Vec<FlowInfo> = state
        .flows
        .values()
        .map(|flow| FlowInfo {
            name: flow.name.clone(),
            description: flow.description.clone(),
            trigger_path: flow
                .trigger
                .as_ref()
                .map(|t| t.path.clone())
                .filter(|p| !p.is_empty()),
            input: flow.input.clone(),
        })
        .collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Json(infos)
}

async fn handle_trigger(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({"error": "method not allowed"})),
        );
    }

    let Some(flow_name) = state.routes.get(uri.path()) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no flow mapped to path {:?}", uri.path())})),
        );
    };
    let flow = &state.flows[flow_name];

    let input: Map<String, Value> = if body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "request body must be a JSON object"})),
                )
            }
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("invalid JSON body: {}", e)})),
                )
            }
        }
    };

    info!(flow = %flow_name, path = %uri.path(), "webhook trigger");

    match state.engine.run(flow, input, CancellationToken::new()).await {
        Ok(result) => {
            let status = if result.status == FlowStatus::Failed {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            match serde_json::to_value(&result) {
                Ok(value) => (status, Json(value)),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": format!("serializing result: {}", e)})),
                ),
            }
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{LogConnector, Registry};
    use crate::flow::TriggerDef;

    fn flows() -> HashMap<String, FlowDef> {
        let mut flows = HashMap::new();
        flows.insert(
            "hooked".to_string(),
            FlowDef {
                name: "hooked".to_string(),
                trigger: Some(TriggerDef {
                    trigger_type: "webhook".to_string(),
                    path: "/hooks/deploy".to_string(),
                }),
                steps: vec![Default::default()],
                ..FlowDef::default()
            },
        );
        flows.insert(
            "manual".to_string(),
            FlowDef {
                name: "manual".to_string(),
                steps: vec![Default::default()],
                ..FlowDef::default()
            },
        );
        flows.insert(
            "cron-ish".to_string(),
            FlowDef {
                name: "cron-ish".to_string(),
                trigger: Some(TriggerDef {
                    trigger_type: "schedule".to_string(),
                    path: "/ignored".to_string(),
                }),
                steps: vec![Default::default()],
                ..FlowDef::default()
            },
        );
        flows
    }

    #[test]
    fn test_route_map_only_includes_webhook_triggers() {
        let registry = Registry::new();
        registry.register(Arc::new(LogConnector::new())).unwrap();
        let engine = Engine::new(Arc::new(registry));

        let server = WebhookServer::new(engine, flows());
        assert_eq!(server.routes().len(), 1);
        assert_eq!(server.routes()["/hooks/deploy"], "hooked");
    }
}
