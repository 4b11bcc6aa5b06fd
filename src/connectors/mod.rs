//! Connector capability boundary.
//!
//! A connector advertises a set of named actions and executes them against a
//! resolved input bag. In-process built-ins and out-of-process subprocess
//! plugins implement the same contract.

mod external;
mod http;
mod log;
mod shell;
mod webhook;

pub use external::{discover_plugins, load_plugin, ExternalConnector};
pub use http::HttpConnector;
pub use log::LogConnector;
pub use shell::ShellConnector;
pub use webhook::WebhookConnector;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::flow::{FieldDef, StepStatus};

/// Describes an action a connector supports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input: HashMap<String, FieldDef>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: HashMap<String, FieldDef>,
}

/// Outcome of executing one connector action.
///
/// `status` distinguishes a logical failure reported by the action
/// (`failed`) from an execution-environment failure (`error`). This is also
/// the wire shape subprocess plugins write to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output: Map<String, Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ActionResult {
    pub fn success(output: Map<String, Value>) -> Self {
        Self {
            status: StepStatus::Success,
            output,
            error: String::new(),
        }
    }

    pub fn failed(output: Map<String, Value>, error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output,
            error: error.into(),
        }
    }
}

/// Interface all flow connectors implement.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable identifier used in flow documents (e.g. "http", "shell").
    fn name(&self) -> &str;

    /// Available actions with their input/output schemas.
    fn actions(&self) -> Vec<ActionDef>;

    /// Run a single action with an already-resolved input bag.
    ///
    /// Returning `Err` signals an execution-environment failure; the engine
    /// records it as step status `error`.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        action: &str,
        input: &Map<String, Value>,
    ) -> Result<ActionResult>;

    /// Optional self-check, e.g. a subprocess plugin verifying its binary.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-lifetime mapping from connector name to implementation.
///
/// Registrations happen during startup; afterwards the registry is
/// effectively read-only, but mutations stay safe under the lock.
pub struct Registry {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connector. Fails if the name is already taken.
    pub fn register(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let name = connector.name().to_string();
        let mut map = self.connectors.write().expect("registry lock poisoned");
        if map.contains_key(&name) {
            return Err(Error::Connector(format!(
                "connector {:?} already registered",
                name
            )));
        }
        map.insert(name, connector);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.connectors
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Names of all registered connectors, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connectors
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience for building an action input/output schema.
pub(crate) fn field(field_type: &str, description: &str, required: bool) -> FieldDef {
    FieldDef {
        field_type: field_type.to_string(),
        description: description.to_string(),
        required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = Registry::new();
        registry.register(Arc::new(HttpConnector::new())).unwrap();
        registry.register(Arc::new(ShellConnector::new())).unwrap();
        registry.register(Arc::new(LogConnector::new())).unwrap();
        registry.register(Arc::new(WebhookConnector::new())).unwrap();

        assert!(registry.has("http"));
        assert!(registry.has("shell"));
        assert!(registry.has("log"));
        assert!(registry.has("webhook"));
        assert!(!registry.has("nonexistent"));

        assert_eq!(registry.list(), vec!["http", "log", "shell", "webhook"]);
        assert_eq!(registry.get("shell").unwrap().name(), "shell");
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = Registry::new();
        registry.register(Arc::new(LogConnector::new())).unwrap();
        let err = registry
            .register(Arc::new(LogConnector::new()))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_builtins_advertise_actions() {
        let connectors: Vec<(Arc<dyn Connector>, &str)> = vec![
            (Arc::new(HttpConnector::new()), "request"),
            (Arc::new(ShellConnector::new()), "run"),
            (Arc::new(LogConnector::new()), "print"),
            (Arc::new(WebhookConnector::new()), "trigger"),
        ];
        for (connector, action) in connectors {
            let actions = connector.actions();
            assert!(
                actions.iter().any(|a| a.name == action),
                "{} should advertise {}",
                connector.name(),
                action
            );
            connector.validate().unwrap();
        }
    }
}
