//! Retry policy evaluation.

use crate::error::EngineError;
use crate::expr::{eval_value, Evaluator};
use crate::persistence::TaskExecution;
use serde_json::Value;

use super::task_handler::ChildExecution;

/// A retry granted by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetrySchedule {
    /// Seconds to wait before the next attempt.
    pub delay: u64,

    /// Attempt number of the new child execution.
    pub next_attempt: u32,
}

/// Decide whether a failed child execution gets another attempt.
///
/// Grants a retry while the count is not exhausted, `break-on` does not
/// evaluate to true, and `continue-on` (when present) evaluates to true.
pub(crate) fn evaluate_retry(
    evaluator: &dyn Evaluator,
    task: &TaskExecution,
    child: &ChildExecution,
) -> Result<Option<RetrySchedule>, EngineError> {
    let Some(retry) = &task.spec.retry else {
        return Ok(None);
    };

    if child.attempt >= retry.count {
        return Ok(None);
    }

    if let Some(expr) = &retry.break_on {
        if eval_condition(evaluator, expr, &task.in_context)? {
            return Ok(None);
        }
    }

    if let Some(expr) = &retry.continue_on {
        if !eval_condition(evaluator, expr, &task.in_context)? {
            return Ok(None);
        }
    }

    Ok(Some(RetrySchedule {
        delay: retry.delay,
        next_attempt: child.attempt + 1,
    }))
}

fn eval_condition(
    evaluator: &dyn Evaluator,
    expr: &str,
    ctx: &Value,
) -> Result<bool, EngineError> {
    let value = eval_value(evaluator, &Value::String(expr.to_string()), ctx)?;
    Ok(matches!(value, Value::Bool(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TemplateEvaluator;
    use crate::spec::{RetrySpec, TaskSpec};
    use crate::state::State;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn failed_child(attempt: u32) -> ChildExecution {
        ChildExecution {
            id: Uuid::now_v7(),
            task_execution_id: Some(Uuid::now_v7()),
            state: State::Error,
            state_info: Some("boom".into()),
            output: None,
            accepted: true,
            index: 0,
            attempt,
            is_workflow: false,
            updated_at: Utc::now(),
        }
    }

    fn task_with_retry(retry: Option<RetrySpec>, ctx: Value) -> TaskExecution {
        let mut spec = TaskSpec::action("t", "std.fail");
        spec.retry = retry;
        TaskExecution::new(Uuid::now_v7(), spec, ctx)
    }

    #[test]
    fn test_no_policy_no_retry() {
        let ev = TemplateEvaluator::new();
        let task = task_with_retry(None, json!({}));
        assert_eq!(
            evaluate_retry(&ev, &task, &failed_child(0)).expect("should evaluate"),
            None
        );
    }

    #[test]
    fn test_retry_until_count_exhausted() {
        let ev = TemplateEvaluator::new();
        let task = task_with_retry(Some(RetrySpec::new(2, 7)), json!({}));

        let schedule = evaluate_retry(&ev, &task, &failed_child(0))
            .expect("should evaluate")
            .expect("should grant retry");
        assert_eq!(schedule, RetrySchedule { delay: 7, next_attempt: 1 });

        let schedule = evaluate_retry(&ev, &task, &failed_child(1))
            .expect("should evaluate")
            .expect("should grant retry");
        assert_eq!(schedule.next_attempt, 2);

        assert_eq!(
            evaluate_retry(&ev, &task, &failed_child(2)).expect("should evaluate"),
            None
        );
    }

    #[test]
    fn test_break_on_stops_retrying() {
        let ev = TemplateEvaluator::new();
        let mut retry = RetrySpec::new(3, 1);
        retry.break_on = Some("<% $.fatal %>".into());

        let task = task_with_retry(Some(retry.clone()), json!({"fatal": true}));
        assert_eq!(
            evaluate_retry(&ev, &task, &failed_child(0)).expect("should evaluate"),
            None
        );

        let task = task_with_retry(Some(retry), json!({"fatal": false}));
        assert!(evaluate_retry(&ev, &task, &failed_child(0))
            .expect("should evaluate")
            .is_some());
    }

    #[test]
    fn test_continue_on_gates_retrying() {
        let ev = TemplateEvaluator::new();
        let mut retry = RetrySpec::new(3, 1);
        retry.continue_on = Some("<% $.keep_going %>".into());

        let task = task_with_retry(Some(retry.clone()), json!({"keep_going": true}));
        assert!(evaluate_retry(&ev, &task, &failed_child(0))
            .expect("should evaluate")
            .is_some());

        let task = task_with_retry(Some(retry), json!({"keep_going": false}));
        assert_eq!(
            evaluate_retry(&ev, &task, &failed_child(0)).expect("should evaluate"),
            None
        );
    }
}
