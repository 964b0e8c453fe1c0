//! With-items preparation.
//!
//! Evaluates the `with-items` bindings and the concurrency policy of a task
//! at start. Iteration tuples are fixed here, once; dispatch and capacity
//! accounting happen in the task handler against the stored
//! [`WithItemsContext`](crate::persistence::WithItemsContext).

use serde_json::Value;

use crate::error::EngineError;
use crate::expr::{eval_value, Evaluator};
use crate::persistence::WithItemsContext;
use crate::spec::TaskSpec;

pub(crate) const INVALID_CONCURRENCY: &str = "Invalid data type in ConcurrencyPolicy";

/// Evaluated with-items plan.
#[derive(Debug)]
pub(crate) struct PreparedItems {
    /// One object per iteration mapping binding variables to their items.
    pub items: Vec<Value>,

    pub context: WithItemsContext,
}

/// Evaluate the with-items clause of a task, if it has one.
///
/// Bound collections of differing length truncate to the shortest. A
/// binding that does not evaluate to an array is a task fault, as is a
/// concurrency value that is not a positive integer.
pub(crate) fn prepare(
    evaluator: &dyn Evaluator,
    spec: &TaskSpec,
    ctx: &Value,
) -> Result<Option<PreparedItems>, EngineError> {
    let Some(with_items) = &spec.with_items else {
        return Ok(None);
    };

    let mut lists: Vec<(String, Vec<Value>)> = Vec::with_capacity(with_items.bindings.len());
    for binding in &with_items.bindings {
        let value = eval_value(evaluator, &binding.items, ctx)?;
        match value {
            Value::Array(items) => lists.push((binding.var.clone(), items)),
            other => {
                return Err(EngineError::InvalidModel(format!(
                    "Invalid array in 'with-items' for variable '{}': {}",
                    binding.var, other
                )))
            }
        }
    }

    let count = lists.iter().map(|(_, l)| l.len()).min().unwrap_or(0) as u32;

    let items = (0..count as usize)
        .map(|i| {
            let mut tuple = serde_json::Map::new();
            for (var, list) in &lists {
                tuple.insert(var.clone(), list[i].clone());
            }
            Value::Object(tuple)
        })
        .collect();

    let concurrency = eval_concurrency(evaluator, spec, ctx)?;

    Ok(Some(PreparedItems {
        items,
        context: WithItemsContext {
            count,
            index: 0,
            capacity: concurrency,
            concurrency,
        },
    }))
}

/// Evaluate the concurrency policy: a positive integer or an expression
/// producing one. Anything else fails the task.
fn eval_concurrency(
    evaluator: &dyn Evaluator,
    spec: &TaskSpec,
    ctx: &Value,
) -> Result<Option<u32>, EngineError> {
    let Some(raw) = &spec.concurrency else {
        return Ok(None);
    };

    let value = eval_value(evaluator, raw, ctx)?;

    match value.as_u64() {
        Some(n) if n > 0 => Ok(Some(n as u32)),
        _ => Err(EngineError::InvalidModel(format!(
            "{}: {}",
            INVALID_CONCURRENCY, value
        ))),
    }
}
