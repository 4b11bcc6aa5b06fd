//! Step context and expression resolution.
//!
//! A `${{ ... }}` expression is a dotted path rooted at `input`, `steps`,
//! `env`, or `secret`, optionally piped through one of a small set of string
//! functions. Resolution is pure: it reads the context, never writes it, and
//! always allocates fresh containers.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::flow::StepResult;

/// Matches `${{ expr }}` and captures the inner expression.
pub(crate) fn expr_regex() -> &'static Regex {
    static EXPR_REGEX: OnceLock<Regex> = OnceLock::new();
    EXPR_REGEX.get_or_init(|| Regex::new(r"\$\{\{\s*(.+?)\s*\}\}").expect("valid regex"))
}

/// State available during flow execution for expression resolution.
///
/// `env` is snapshotted once at creation and never mutated; `steps` grows as
/// the engine appends each completed step's result.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub input: Map<String, Value>,
    pub steps: HashMap<String, StepResult>,
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
}

impl StepContext {
    /// Create a context from flow input, snapshotting the process environment.
    pub fn new(input: Map<String, Value>) -> Self {
        Self {
            input,
            steps: HashMap::new(),
            env: std::env::vars().collect(),
            secrets: HashMap::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Record a completed step's result for later reference.
    pub fn add_step_result(&mut self, result: &StepResult) {
        self.steps.insert(result.name.clone(), result.clone());
    }

    /// Recursively resolve all expressions in an input bag.
    pub fn resolve_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for (key, value) in map {
            let resolved = self.resolve_value(value).map_err(|e| match e {
                Error::Resolve(msg) => Error::Resolve(format!("resolving {:?}: {}", key, msg)),
                other => other,
            })?;
            out.insert(key.clone(), resolved);
        }
        Ok(out)
    }

    /// Resolve expressions in an arbitrary value tree.
    pub fn resolve_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_value(item)?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Replace all `${{ ... }}` expressions in a string.
    ///
    /// When the whole string is a single expression the raw typed value is
    /// returned, so an integer stays an integer. Otherwise every occurrence
    /// is rendered into a string.
    pub fn resolve_string(&self, s: &str) -> Result<Value> {
        let re = expr_regex();
        match re.captures(s) {
            None => return Ok(Value::String(s.to_string())),
            Some(caps) => {
                let whole = caps.get(0).expect("match group");
                if whole.start() == 0 && whole.end() == s.len() {
                    return self.evaluate_expr(caps.get(1).expect("capture group").as_str());
                }
            }
        }

        let mut result = String::new();
        let mut last = 0;
        for caps in re.captures_iter(s) {
            let whole = caps.get(0).expect("match group");
            result.push_str(&s[last..whole.start()]);
            let value = self.evaluate_expr(caps.get(1).expect("capture group").as_str())?;
            result.push_str(&render_value(&value));
            last = whole.end();
        }
        result.push_str(&s[last..]);
        Ok(Value::String(result))
    }

    /// Evaluate a single expression body like `input.name | slugify`.
    fn evaluate_expr(&self, expr: &str) -> Result<Value> {
        let (path, pipe) = match expr.split_once('|') {
            Some((path, pipe)) => (path.trim(), Some(pipe.trim())),
            None => (expr.trim(), None),
        };

        let value = self.resolve_path(path)?;
        match pipe {
            Some(name) => apply_pipe(value, name),
            None => Ok(value),
        }
    }

    /// Resolve a dotted path like `input.name` or
    /// `steps.create-repo.output.repo_url`.
    fn resolve_path(&self, path: &str) -> Result<Value> {
        match path {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }

        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };

        match root {
            "input" => {
                let Some(rest) = rest else {
                    return Ok(Value::Object(self.input.clone()));
                };
                // Missing input fields resolve to empty string (optional fields).
                Ok(lookup_nested(&self.input, rest)
                    .cloned()
                    .unwrap_or_else(|_| Value::String(String::new())))
            }

            "steps" => {
                let Some(rest) = rest else {
                    return Err(Error::Resolve(format!(
                        "incomplete step reference: {:?}",
                        path
                    )));
                };
                if let Some((step_name, output_path)) = rest.split_once(".output.") {
                    let sr = self.step_result(step_name)?;
                    if sr.output.is_empty() {
                        return Err(Error::Resolve(format!(
                            "step {:?} has no output",
                            step_name
                        )));
                    }
                    return lookup_nested(&sr.output, output_path).cloned();
                }
                let (step_name, field) = match rest.split_once('.') {
                    Some((name, field)) => (name, Some(field)),
                    None => (rest, None),
                };
                let sr = self.step_result(step_name)?;
                match field {
                    Some("status") => Ok(Value::String(sr.status.to_string())),
                    Some("output") => Ok(Value::Object(sr.output.clone())),
                    _ => Err(Error::Resolve(format!("invalid step reference: {:?}", path))),
                }
            }

            "env" => {
                let Some(rest) = rest else {
                    return Err(Error::Resolve(format!(
                        "incomplete env reference: {:?}",
                        path
                    )));
                };
                Ok(Value::String(self.env.get(rest).cloned().unwrap_or_default()))
            }

            "secret" => {
                let Some(rest) = rest else {
                    return Err(Error::Resolve(format!(
                        "incomplete secret reference: {:?}",
                        path
                    )));
                };
                Ok(Value::String(
                    self.secrets.get(rest).cloned().unwrap_or_default(),
                ))
            }

            _ => Err(Error::Resolve(format!(
                "unknown variable root {:?} in {:?}",
                root, path
            ))),
        }
    }

    fn step_result(&self, name: &str) -> Result<&StepResult> {
        self.steps
            .get(name)
            .ok_or_else(|| Error::Resolve(format!("step {:?} not found", name)))
    }

    /// Evaluate a `when` condition.
    ///
    /// An empty condition always runs. Otherwise the string must be exactly
    /// one `${{ ... }}` expression whose body is either a bare path (tested
    /// for truthiness) or a binary comparison between paths and/or quoted
    /// string literals.
    pub fn evaluate_condition(&self, when: &str) -> Result<bool> {
        let trimmed = when.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        let re = expr_regex();
        let caps = re.captures(trimmed).ok_or_else(|| invalid_condition(when))?;
        let whole = caps.get(0).expect("match group");
        if whole.start() != 0 || whole.end() != trimmed.len() {
            return Err(invalid_condition(when));
        }

        let body = caps.get(1).expect("capture group").as_str();
        match split_comparison(body) {
            Some((lhs, op, rhs)) => {
                let left = self.eval_operand(lhs.trim())?;
                let right = self.eval_operand(rhs.trim())?;
                Ok(compare_values(&left, op, &right))
            }
            None => {
                let value = self.evaluate_expr(body)?;
                Ok(is_truthy(&value))
            }
        }
    }

    fn eval_operand(&self, operand: &str) -> Result<Value> {
        if operand.len() >= 2 && operand.starts_with('"') && operand.ends_with('"') {
            return Ok(Value::String(operand[1..operand.len() - 1].to_string()));
        }
        if operand.is_empty() {
            return Err(Error::Resolve("empty comparison operand".to_string()));
        }
        self.resolve_path(operand)
    }
}

fn invalid_condition(when: &str) -> Error {
    Error::Resolve(format!(
        "invalid condition {:?}: expected a single ${{{{ ... }}}} expression",
        when
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

fn split_comparison(body: &str) -> Option<(&str, CompareOp, &str)> {
    // Two-character operators first so ">=" is not split at ">".
    const OPS: [(&str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];
    for (symbol, op) in OPS {
        if let Some(idx) = body.find(symbol) {
            return Some((&body[..idx], op, &body[idx + symbol.len()..]));
        }
    }
    None
}

/// Compare two values: numerically when both sides look numeric, otherwise
/// by string equality / lexicographic order.
fn compare_values(left: &Value, op: CompareOp, right: &Value) -> bool {
    let ls = render_value(left);
    let rs = render_value(right);

    if let (Ok(ln), Ok(rn)) = (ls.trim().parse::<f64>(), rs.trim().parse::<f64>()) {
        return match op {
            CompareOp::Eq => ln == rn,
            CompareOp::Ne => ln != rn,
            CompareOp::Ge => ln >= rn,
            CompareOp::Le => ln <= rn,
            CompareOp::Gt => ln > rn,
            CompareOp::Lt => ln < rn,
        };
    }

    match op {
        CompareOp::Eq => ls == rs,
        CompareOp::Ne => ls != rs,
        CompareOp::Ge => ls >= rs,
        CompareOp::Le => ls <= rs,
        CompareOp::Gt => ls > rs,
        CompareOp::Lt => ls < rs,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Render a value for string interpolation: strings verbatim, everything
/// else in its compact JSON form.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup_nested<'a>(map: &'a Map<String, Value>, path: &str) -> Result<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next().unwrap_or_default();
    let mut current = map
        .get(first)
        .ok_or_else(|| Error::Resolve(format!("key {:?} not found", first)))?;
    for part in parts {
        let obj = current.as_object().ok_or_else(|| {
            Error::Resolve(format!("cannot index into non-object at {:?}", part))
        })?;
        current = obj
            .get(part)
            .ok_or_else(|| Error::Resolve(format!("key {:?} not found", part)))?;
    }
    Ok(current)
}

fn apply_pipe(value: Value, name: &str) -> Result<Value> {
    let s = render_value(&value);
    let out = match name {
        "slugify" => slugify(&s),
        "upper" => s.to_uppercase(),
        "lower" => s.to_lowercase(),
        "trim" => s.trim().to_string(),
        _ => {
            return Err(Error::Resolve(format!(
                "unknown pipe function {:?}",
                name
            )))
        }
    };
    Ok(Value::String(out))
}

/// Lowercase; keep letters and digits; map space, `-`, `_` to `-`; drop
/// everything else; collapse runs of `-`; trim leading/trailing `-`.
fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if (c == ' ' || c == '-' || c == '_') && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::StepStatus;
    use serde_json::json;

    fn context_with_input(input: Value) -> StepContext {
        let Value::Object(map) = input else {
            panic!("input must be an object");
        };
        StepContext::new(map)
    }

    #[test]
    fn test_resolve_input_variables() {
        let ctx = context_with_input(json!({"name": "Acme Corp", "email": "cto@acme.com"}));

        for (input, expected) in [
            ("${{ input.name }}", "Acme Corp"),
            ("Hello ${{ input.name }}!", "Hello Acme Corp!"),
            ("${{ input.email }}", "cto@acme.com"),
        ] {
            let result = ctx.resolve_string(input).unwrap();
            assert_eq!(result, json!(expected), "resolve_string({:?})", input);
        }
    }

    #[test]
    fn test_resolve_step_output_variables() {
        let mut ctx = context_with_input(json!({"name": "Test"}));
        let mut sr = StepResult::new("step1", "http", "request", StepStatus::Success);
        sr.output = json!({"repo_url": "https://github.com/test", "count": 42})
            .as_object()
            .unwrap()
            .clone();
        ctx.add_step_result(&sr);

        let url = ctx
            .resolve_string("${{ steps.step1.output.repo_url }}")
            .unwrap();
        assert_eq!(url, json!("https://github.com/test"));

        // A whole-string expression preserves the value's type.
        let count = ctx.resolve_string("${{ steps.step1.output.count }}").unwrap();
        assert_eq!(count, json!(42));

        let status = ctx.resolve_string("${{ steps.step1.status }}").unwrap();
        assert_eq!(status, json!("success"));
    }

    #[test]
    fn test_resolve_nested_output_path() {
        let mut ctx = context_with_input(json!({}));
        let mut sr = StepResult::new("fetch", "http", "request", StepStatus::Success);
        sr.output = json!({"body": {"repo": {"id": 7}}})
            .as_object()
            .unwrap()
            .clone();
        ctx.add_step_result(&sr);

        let id = ctx
            .resolve_string("${{ steps.fetch.output.body.repo.id }}")
            .unwrap();
        assert_eq!(id, json!(7));

        let err = ctx
            .resolve_string("${{ steps.fetch.output.body.missing }}")
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_resolve_unknown_step_fails() {
        let ctx = context_with_input(json!({}));
        let err = ctx.resolve_string("${{ steps.ghost.output.x }}").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolve_missing_input_is_empty_string() {
        let ctx = context_with_input(json!({}));
        let result = ctx.resolve_string("value=${{ input.absent }}").unwrap();
        assert_eq!(result, json!("value="));
    }

    #[test]
    fn test_resolve_env_variables() {
        let ctx = context_with_input(json!({}));
        // HOME should always be set.
        let home = ctx.resolve_string("${{ env.HOME }}").unwrap();
        assert_ne!(home, json!(""));

        let missing = ctx.resolve_string("${{ env.RELAY_DOES_NOT_EXIST }}").unwrap();
        assert_eq!(missing, json!(""));
    }

    #[test]
    fn test_resolve_secrets() {
        let ctx = context_with_input(json!({})).with_secrets(
            [("API_KEY".to_string(), "sk-test-123".to_string())]
                .into_iter()
                .collect(),
        );

        let result = ctx.resolve_string("k=${{ secret.API_KEY }}").unwrap();
        assert_eq!(result, json!("k=sk-test-123"));

        let missing = ctx.resolve_string("k=${{ secret.OTHER }}").unwrap();
        assert_eq!(missing, json!("k="));
    }

    #[test]
    fn test_resolve_pipe_functions() {
        let ctx = context_with_input(json!({"name": "Acme Corp", "padded": "  x  "}));

        for (input, expected) in [
            ("${{ input.name | slugify }}", "acme-corp"),
            ("${{ input.name | upper }}", "ACME CORP"),
            ("${{ input.name | lower }}", "acme corp"),
            ("${{ input.padded | trim }}", "x"),
        ] {
            let result = ctx.resolve_string(input).unwrap();
            assert_eq!(result, json!(expected), "resolve_string({:?})", input);
        }

        let err = ctx.resolve_string("${{ input.name | reverse }}").unwrap_err();
        assert!(err.to_string().contains("unknown pipe function"));
    }

    #[test]
    fn test_resolve_map_deep() {
        let ctx = context_with_input(json!({"name": "Test"}));
        let input = json!({
            "title": "Hello ${{ input.name }}",
            "literal": "no variables here",
            "number": 42,
            "nested": {"inner": "${{ input.name }}"},
            "list": ["${{ input.name | lower }}", 1],
        });

        let resolved = ctx.resolve_map(input.as_object().unwrap()).unwrap();
        assert_eq!(resolved["title"], json!("Hello Test"));
        assert_eq!(resolved["literal"], json!("no variables here"));
        assert_eq!(resolved["number"], json!(42));
        assert_eq!(resolved["nested"]["inner"], json!("Test"));
        assert_eq!(resolved["list"], json!(["test", 1]));
    }

    #[test]
    fn test_resolve_without_expressions_is_identity() {
        let ctx = context_with_input(json!({}));
        let input = json!({"a": [1, 2, {"b": true}], "c": "plain", "d": null});
        let resolved = ctx.resolve_value(&input).unwrap();
        assert_eq!(resolved, input);
    }

    #[test]
    fn test_resolve_bool_literals() {
        let ctx = context_with_input(json!({}));
        assert_eq!(ctx.resolve_string("${{ true }}").unwrap(), json!(true));
        assert_eq!(ctx.resolve_string("${{ false }}").unwrap(), json!(false));
    }

    #[test]
    fn test_unknown_root_fails() {
        let ctx = context_with_input(json!({}));
        let err = ctx.resolve_string("${{ nope.field }}").unwrap_err();
        assert!(err.to_string().contains("unknown variable root"));
    }

    #[test]
    fn test_interpolation_renders_values() {
        let ctx = context_with_input(json!({"n": 7, "ok": true, "obj": {"a": 1}}));
        let result = ctx
            .resolve_string("n=${{ input.n }} ok=${{ input.ok }} obj=${{ input.obj }}")
            .unwrap();
        assert_eq!(result, json!("n=7 ok=true obj={\"a\":1}"));
    }

    #[test]
    fn test_slugify() {
        for (input, expected) in [
            ("Acme Corp", "acme-corp"),
            ("Hello   World", "hello-world"),
            ("test-already-slug", "test-already-slug"),
            ("  leading trailing  ", "leading-trailing"),
            ("Special!@#Chars", "specialchars"),
            ("Acme Corp!", "acme-corp"),
            ("Überholt Größe", "überholt-größe"),
        ] {
            assert_eq!(slugify(input), expected, "slugify({:?})", input);
        }
    }

    #[test]
    fn test_condition_empty_runs() {
        let ctx = context_with_input(json!({}));
        assert!(ctx.evaluate_condition("").unwrap());
        assert!(ctx.evaluate_condition("   ").unwrap());
    }

    #[test]
    fn test_condition_string_equality() {
        let ctx = context_with_input(json!({"mode": "active"}));
        assert!(ctx
            .evaluate_condition("${{ input.mode == \"active\" }}")
            .unwrap());
        assert!(!ctx
            .evaluate_condition("${{ input.mode == \"inactive\" }}")
            .unwrap());
        assert!(ctx
            .evaluate_condition("${{ input.mode != \"inactive\" }}")
            .unwrap());
    }

    #[test]
    fn test_condition_on_step_status() {
        let mut ctx = context_with_input(json!({}));
        let sr = StepResult::new("step1", "shell", "run", StepStatus::Success);
        ctx.add_step_result(&sr);

        assert!(ctx
            .evaluate_condition("${{ steps.step1.status == \"success\" }}")
            .unwrap());
        assert!(!ctx
            .evaluate_condition("${{ steps.step1.status == \"failed\" }}")
            .unwrap());
    }

    #[test]
    fn test_condition_numeric_comparison() {
        let mut ctx = context_with_input(json!({}));
        let mut sr = StepResult::new("fetch", "http", "request", StepStatus::Success);
        sr.output = json!({"status_code": 200}).as_object().unwrap().clone();
        ctx.add_step_result(&sr);

        // Both-sides-numeric coerces even when the literal is quoted.
        assert!(ctx
            .evaluate_condition("${{ steps.fetch.output.status_code == \"200\" }}")
            .unwrap());
        assert!(ctx
            .evaluate_condition("${{ steps.fetch.output.status_code < \"400\" }}")
            .unwrap());
        assert!(ctx
            .evaluate_condition("${{ steps.fetch.output.status_code >= \"200\" }}")
            .unwrap());
        assert!(!ctx
            .evaluate_condition("${{ steps.fetch.output.status_code > \"299\" }}")
            .unwrap());
    }

    #[test]
    fn test_condition_lexicographic_when_not_numeric() {
        let ctx = context_with_input(json!({"a": "apple", "b": "banana"}));
        assert!(ctx.evaluate_condition("${{ input.a < input.b }}").unwrap());
        assert!(!ctx.evaluate_condition("${{ input.a > input.b }}").unwrap());
    }

    #[test]
    fn test_condition_truthiness() {
        let ctx = context_with_input(json!({"yes": "x", "no": "", "zero": 0, "one": 1}));
        assert!(ctx.evaluate_condition("${{ input.yes }}").unwrap());
        assert!(!ctx.evaluate_condition("${{ input.no }}").unwrap());
        assert!(!ctx.evaluate_condition("${{ input.zero }}").unwrap());
        assert!(ctx.evaluate_condition("${{ input.one }}").unwrap());
        assert!(!ctx.evaluate_condition("${{ input.missing }}").unwrap());
        assert!(ctx.evaluate_condition("${{ true }}").unwrap());
        assert!(!ctx.evaluate_condition("${{ false }}").unwrap());
    }

    #[test]
    fn test_condition_syntax_errors() {
        let ctx = context_with_input(json!({}));
        assert!(ctx.evaluate_condition("input.x == \"y\"").is_err());
        assert!(ctx.evaluate_condition("prefix ${{ input.x }}").is_err());
        assert!(ctx.evaluate_condition("${{ steps.ghost.status }}").is_err());
    }

    #[test]
    fn test_resolution_does_not_mutate_context() {
        let ctx = context_with_input(json!({"name": "Test"}));
        let before = ctx.input.clone();
        let _ = ctx.resolve_string("${{ input.name }}").unwrap();
        let _ = ctx.evaluate_condition("${{ input.name == \"Test\" }}").unwrap();
        assert_eq!(ctx.input, before);
        assert!(ctx.steps.is_empty());
    }
}
