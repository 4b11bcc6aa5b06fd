//! Flow YAML loading.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use super::types::FlowDef;
use crate::error::{Error, Result};

/// Parse a flow from a YAML string.
pub fn parse_flow(yaml: &str) -> Result<FlowDef> {
    if yaml.trim().is_empty() {
        return Err(Error::Parse("empty flow definition".to_string()));
    }

    let flow: FlowDef = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Parse(format!("invalid YAML: {}", e)))?;

    if flow.name.is_empty() {
        return Err(Error::Parse("missing required field 'name'".to_string()));
    }
    if flow.steps.is_empty() {
        return Err(Error::Parse("flow must have at least one step".to_string()));
    }

    Ok(flow)
}

/// Parse a flow from a file path.
pub fn parse_flow_file(path: &Path) -> Result<FlowDef> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Flow(format!("reading flow file {}: {}", path.display(), e)))?;
    parse_flow(&content).map_err(|e| Error::Parse(format!("flow file {}: {}", path.display(), e)))
}

/// Load all flow files from a directory tree, keyed by flow name.
///
/// Walks the directory recursively and parses every `.yaml`/`.yml` file.
/// A duplicate flow name across files is an error.
pub fn load_flows(dir: &Path) -> Result<HashMap<String, FlowDef>> {
    let mut flows = HashMap::new();
    walk_dir(dir, &mut flows)
        .map_err(|e| Error::Flow(format!("loading flows from {}: {}", dir.display(), e)))?;
    debug!("loaded {} flow(s) from {}", flows.len(), dir.display());
    Ok(flows)
}

fn walk_dir(dir: &Path, flows: &mut HashMap<String, FlowDef>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            walk_dir(&path, flows)?;
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if ext.as_deref() != Some("yaml") && ext.as_deref() != Some("yml") {
            continue;
        }

        let flow = parse_flow_file(&path)?;
        if flows.contains_key(&flow.name) {
            return Err(Error::Parse(format!(
                "duplicate flow name {:?} in {}",
                flow.name,
                path.display()
            )));
        }
        flows.insert(flow.name.clone(), flow);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_flow() {
        let yaml = r#"
name: deploy-notify
version: "1.0"
description: Notify after deploy
steps:
  - name: notify
    connector: log
    action: print
    input:
      message: "deployed ${{ input.service }}"
"#;
        let flow = parse_flow(yaml).unwrap();
        assert_eq!(flow.name, "deploy-notify");
        assert_eq!(flow.version, "1.0");
        assert_eq!(flow.steps.len(), 1);
        assert_eq!(flow.steps[0].connector, "log");
        assert_eq!(
            flow.steps[0].input["message"],
            "deployed ${{ input.service }}"
        );
    }

    #[test]
    fn test_parse_flow_with_retry_and_when() {
        let yaml = r#"
name: flaky
steps:
  - name: fetch
    connector: http
    action: request
    input:
      url: https://example.com
    on_error: retry
    retry:
      max_retries: 5
      backoff_seconds: 0.5
  - name: report
    connector: log
    action: print
    when: ${{ steps.fetch.status == "success" }}
    input:
      message: ok
"#;
        let flow = parse_flow(yaml).unwrap();
        let retry = flow.steps[0].retry.as_ref().unwrap();
        assert_eq!(flow.steps[0].on_error, "retry");
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.backoff_seconds, 0.5);
        assert_eq!(flow.steps[1].when, "${{ steps.fetch.status == \"success\" }}");
    }

    #[test]
    fn test_parse_flow_with_parallel_group() {
        let yaml = r#"
name: fan-out
steps:
  - name: group
    parallel:
      - name: a
        connector: log
        action: print
        input: { message: one }
      - name: b
        connector: log
        action: print
        input: { message: two }
"#;
        let flow = parse_flow(yaml).unwrap();
        assert_eq!(flow.steps.len(), 1);
        assert_eq!(flow.steps[0].parallel.len(), 2);
        assert_eq!(flow.steps[0].parallel[1].name, "b");
    }

    #[test]
    fn test_parse_flow_with_input_schema_and_trigger() {
        let yaml = r#"
name: hooked
input:
  properties:
    service:
      type: string
      description: Target service
      required: true
trigger:
  type: webhook
  path: /hooks/deploy
steps:
  - name: s
    connector: log
    action: print
"#;
        let flow = parse_flow(yaml).unwrap();
        let schema = flow.input.unwrap();
        assert!(schema.properties["service"].required);
        let trigger = flow.trigger.unwrap();
        assert_eq!(trigger.trigger_type, "webhook");
        assert_eq!(trigger.path, "/hooks/deploy");
    }

    #[test]
    fn test_parse_empty_flow() {
        let err = parse_flow("").unwrap_err();
        assert!(err.to_string().contains("empty flow definition"));
    }

    #[test]
    fn test_parse_missing_name() {
        let err = parse_flow("steps:\n  - name: s\n    connector: log\n").unwrap_err();
        assert!(err.to_string().contains("'name'"));
    }

    #[test]
    fn test_parse_missing_steps() {
        let err = parse_flow("name: empty\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_flow("name: [broken").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("invalid yaml"));
    }

    #[test]
    fn test_load_flows_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "name: flow-a\nsteps:\n  - name: s\n    connector: log\n    action: print\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nested/b.yml"),
            "name: flow-b\nsteps:\n  - name: s\n    connector: log\n    action: print\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a flow").unwrap();

        let flows = load_flows(dir.path()).unwrap();
        assert_eq!(flows.len(), 2);
        assert!(flows.contains_key("flow-a"));
        assert!(flows.contains_key("flow-b"));
    }

    #[test]
    fn test_load_flows_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let body = "name: dup\nsteps:\n  - name: s\n    connector: log\n    action: print\n";
        std::fs::write(dir.path().join("a.yaml"), body).unwrap();
        std::fs::write(dir.path().join("b.yaml"), body).unwrap();

        let err = load_flows(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate flow name"));
    }
}
