//! Expression evaluation seam.
//!
//! The real expression language (YAQL/Jinja-like) lives outside the engine;
//! the engine only passes contexts in and consumes values out through the
//! [`Evaluator`] trait. [`TemplateEvaluator`] is the built-in minimal
//! implementation: enough for the engine's own data flow (`$.` lookups,
//! `env()`, `task(name).result`) and for running the test suite without the
//! external evaluator.

use serde_json::Value;

/// Error produced while evaluating an expression.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to evaluate expression '{expression}': {detail}")]
pub struct ExprError {
    pub expression: String,
    pub detail: String,
}

impl ExprError {
    pub fn new(expression: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            detail: detail.into(),
        }
    }
}

/// Expression evaluator contract.
///
/// `ctx` is a JSON object exposing workflow variables at the top level, the
/// environment under `__env` and completed task data under `__tasks`.
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate a single expression (without delimiters) against a context.
    fn eval(&self, expr: &str, ctx: &Value) -> Result<Value, ExprError>;
}

/// Whether a string contains an embedded expression.
pub fn is_expression(s: &str) -> bool {
    s.contains("<%") && s.contains("%>")
}

/// Evaluate a JSON value, replacing every embedded expression.
///
/// Strings consisting of exactly one `<% … %>` block evaluate to the
/// expression's value (any JSON type); strings with surrounding text
/// interpolate results textually. Arrays and objects are walked recursively.
pub fn eval_value(evaluator: &dyn Evaluator, value: &Value, ctx: &Value) -> Result<Value, ExprError> {
    match value {
        Value::String(s) if is_expression(s) => eval_template(evaluator, s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|v| eval_value(evaluator, v, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| eval_value(evaluator, v, ctx).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Evaluate every value of an expression map against a context.
pub fn eval_map(
    evaluator: &dyn Evaluator,
    map: &std::collections::BTreeMap<String, Value>,
    ctx: &Value,
) -> Result<serde_json::Map<String, Value>, ExprError> {
    map.iter()
        .map(|(k, v)| eval_value(evaluator, v, ctx).map(|v| (k.clone(), v)))
        .collect()
}

fn eval_template(evaluator: &dyn Evaluator, s: &str, ctx: &Value) -> Result<Value, ExprError> {
    let trimmed = s.trim();
    if trimmed.starts_with("<%") && trimmed.ends_with("%>") && trimmed.matches("<%").count() == 1 {
        let inner = trimmed[2..trimmed.len() - 2].trim();
        return evaluator.eval(inner, ctx);
    }

    // Mixed template: interpolate each block into the surrounding text.
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("<%") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("%>")
            .ok_or_else(|| ExprError::new(s, "unterminated expression block"))?;
        let value = evaluator.eval(after[..end].trim(), ctx)?;
        match value {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Minimal built-in evaluator.
///
/// Supported forms:
/// - `$.a.b.c`: context lookup by path
/// - `$`: the whole context
/// - `env().name`: lookup under the `__env` context key
/// - `task(name).result`: result of a completed task (under `__tasks`)
/// - integer and quoted-string literals
#[derive(Debug, Default, Clone)]
pub struct TemplateEvaluator;

impl TemplateEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
        let mut current = root;
        for part in path.split('.') {
            if part.is_empty() {
                continue;
            }
            current = current.get(part)?;
        }
        Some(current)
    }
}

impl Evaluator for TemplateEvaluator {
    fn eval(&self, expr: &str, ctx: &Value) -> Result<Value, ExprError> {
        let expr = expr.trim();

        if expr == "$" {
            return Ok(ctx.clone());
        }

        if let Some(path) = expr.strip_prefix("$.") {
            return Self::lookup(ctx, path)
                .cloned()
                .ok_or_else(|| ExprError::new(expr, format!("no such variable: {}", path)));
        }

        if let Some(path) = expr.strip_prefix("env().") {
            let env = ctx.get("__env").unwrap_or(&Value::Null);
            return Self::lookup(env, path)
                .cloned()
                .ok_or_else(|| ExprError::new(expr, format!("no such environment variable: {}", path)));
        }

        if let Some(rest) = expr.strip_prefix("task(") {
            let (name, tail) = rest
                .split_once(')')
                .ok_or_else(|| ExprError::new(expr, "malformed task() reference"))?;
            let name = name.trim();
            let tasks = ctx.get("__tasks").unwrap_or(&Value::Null);
            let task = tasks
                .get(name)
                .ok_or_else(|| ExprError::new(expr, format!("no such task: {}", name)))?;
            let path = tail.trim_start_matches('.');
            return Self::lookup(task, path)
                .cloned()
                .ok_or_else(|| ExprError::new(expr, format!("no '{}' on task {}", path, name)));
        }

        if let Ok(n) = expr.parse::<i64>() {
            return Ok(Value::from(n));
        }

        if (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
            || (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
        {
            return Ok(Value::String(expr[1..expr.len() - 1].to_string()));
        }

        Err(ExprError::new(expr, "unsupported expression"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "name": "Ivan",
            "names_info": [{"name": "John"}],
            "concurrency": 2,
            "__env": {"region": "eu"},
            "__tasks": {"task1": {"result": ["a", "b"]}}
        })
    }

    #[test]
    fn test_path_lookup() {
        let ev = TemplateEvaluator::new();
        assert_eq!(ev.eval("$.name", &ctx()).expect("should eval"), json!("Ivan"));
        assert_eq!(
            ev.eval("$.concurrency", &ctx()).expect("should eval"),
            json!(2)
        );
    }

    #[test]
    fn test_missing_path_is_error() {
        let ev = TemplateEvaluator::new();
        let err = ev.eval("$.missing", &ctx()).expect_err("should fail");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_env_and_task_lookup() {
        let ev = TemplateEvaluator::new();
        assert_eq!(
            ev.eval("env().region", &ctx()).expect("should eval"),
            json!("eu")
        );
        assert_eq!(
            ev.eval("task(task1).result", &ctx()).expect("should eval"),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_full_block_preserves_type() {
        let ev = TemplateEvaluator::new();
        let out = eval_value(&ev, &json!("<% $.concurrency %>"), &ctx()).expect("should eval");
        assert_eq!(out, json!(2));
    }

    #[test]
    fn test_interpolation() {
        let ev = TemplateEvaluator::new();
        let out =
            eval_value(&ev, &json!("Hello, <% $.name %>!"), &ctx()).expect("should eval");
        assert_eq!(out, json!("Hello, Ivan!"));
    }

    #[test]
    fn test_nested_structures() {
        let ev = TemplateEvaluator::new();
        let out = eval_value(
            &ev,
            &json!({"greeting": ["<% $.name %>", "literal"]}),
            &ctx(),
        )
        .expect("should eval");
        assert_eq!(out, json!({"greeting": ["Ivan", "literal"]}));
    }

    #[test]
    fn test_literals() {
        let ev = TemplateEvaluator::new();
        assert_eq!(ev.eval("42", &ctx()).expect("should eval"), json!(42));
        assert_eq!(
            ev.eval("'plain'", &ctx()).expect("should eval"),
            json!("plain")
        );
    }
}
