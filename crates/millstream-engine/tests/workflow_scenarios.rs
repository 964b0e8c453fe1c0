//! End-to-end engine scenarios against the in-memory store.
//!
//! The harness drives a real engine (scheduler loops included) with a
//! [`QueueExecutor`]: dispatched actions are pulled off the queue and
//! completed through `on_action_complete`, which makes action timing fully
//! controllable from the test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use millstream_engine::config::{EngineConfig, SchedulerConfig};
use millstream_engine::engine::{job_names, Engine, EngineHandle};
use millstream_engine::executor::{ActionDispatch, ActionExecutor, ActionResult, QueueExecutor};
use millstream_engine::expr::TemplateEvaluator;
use millstream_engine::persistence::{
    ActionExecution, ExecutionParams, ExecutionRuntime, MemoryStore, ScheduledJob, Store,
    TaskExecution, WorkflowDefinition, WorkflowExecution,
};
use millstream_engine::spec::{
    InputParam, JoinMode, JoinSpec, RetrySpec, TaskSpec, WithItemsSpec, WorkflowSpec,
    WorkflowType,
};
use millstream_engine::state::State;

struct Harness {
    store: Arc<MemoryStore>,
    executor: Arc<QueueExecutor>,
    engine: Arc<Engine>,
    handle: EngineHandle,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default().with_scheduler(
        SchedulerConfig::default()
            .with_fixed_delay(Duration::from_millis(20))
            .with_capture_timeout(Duration::from_millis(400)),
    );
    // Individual tests opt back into the heartbeat sweep.
    config.action_heartbeat.interval = 0;
    config
}

async fn harness() -> Harness {
    harness_with_config(test_config()).await
}

async fn harness_with_config(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(QueueExecutor::new());
    let engine = Engine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&executor) as Arc<dyn ActionExecutor>,
        Arc::new(TemplateEvaluator::new()),
        config,
    );
    let handle = engine.start().await.expect("engine should start");

    Harness {
        store,
        executor,
        engine,
        handle,
    }
}

fn direct_spec(tasks: Vec<TaskSpec>) -> WorkflowSpec {
    spec_with_input(vec![], tasks)
}

fn spec_with_input(input: Vec<InputParam>, tasks: Vec<TaskSpec>) -> WorkflowSpec {
    WorkflowSpec {
        name: "wf".to_string(),
        workflow_type: WorkflowType::Direct,
        input,
        output: None,
        vars: BTreeMap::new(),
        tasks: tasks.into_iter().map(|t| (t.name.clone(), t)).collect(),
    }
}

async fn register(store: &MemoryStore, spec: WorkflowSpec) {
    let def = WorkflowDefinition::new("", "", spec);
    let mut tx = store.begin(false).await.expect("should begin");
    tx.create_workflow_definition(&def)
        .await
        .expect("should register definition");
    tx.commit().await.expect("should commit");
}

/// Standard action behavior: `std.echo` returns its `output` input,
/// `std.fail` fails, `std.noop` returns null.
fn standard_result(dispatch: &ActionDispatch) -> ActionResult {
    match dispatch.action_name.as_str() {
        "std.echo" => ActionResult::ok(
            dispatch
                .input
                .get("output")
                .cloned()
                .unwrap_or(Value::Null),
        ),
        "std.fail" => ActionResult::error("Fail action expected behavior"),
        "std.noop" => ActionResult::ok(Value::Null),
        other => ActionResult::error(format!("unknown test action: {}", other)),
    }
}

/// Complete every pending dispatch with the standard behavior.
async fn pump(h: &Harness) {
    while let Some(dispatch) = h.executor.next_dispatch() {
        let result = standard_result(&dispatch);
        h.engine
            .on_action_complete(dispatch.action_execution_id, result)
            .await
            .expect("completion should apply");
    }
}

/// Pump until the workflow reaches a terminal state.
async fn drive(h: &Harness, wf_ex_id: Uuid, timeout: Duration) -> WorkflowExecution {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        pump(h).await;

        let wf_ex = h
            .engine
            .workflow_execution(wf_ex_id)
            .await
            .expect("workflow should exist");
        if wf_ex.state.is_completed() {
            return wf_ex;
        }

        if tokio::time::Instant::now() >= deadline {
            panic!(
                "workflow {} did not complete in time (state {})",
                wf_ex_id, wf_ex.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a terminal workflow state without completing any dispatches.
async fn await_workflow(h: &Harness, wf_ex_id: Uuid, timeout: Duration) -> WorkflowExecution {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let wf_ex = h
            .engine
            .workflow_execution(wf_ex_id)
            .await
            .expect("workflow should exist");
        if wf_ex.state.is_completed() {
            return wf_ex;
        }

        if tokio::time::Instant::now() >= deadline {
            panic!(
                "workflow {} did not complete in time (state {})",
                wf_ex_id, wf_ex.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the next dispatch without completing it.
async fn await_dispatch(executor: &QueueExecutor, timeout: Duration) -> ActionDispatch {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(dispatch) = executor.next_dispatch() {
            return dispatch;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no dispatch arrived in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collect exactly `n` dispatches without completing them.
async fn await_dispatches(
    executor: &QueueExecutor,
    n: usize,
    timeout: Duration,
) -> Vec<ActionDispatch> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut dispatches = Vec::with_capacity(n);

    loop {
        while let Some(dispatch) = executor.next_dispatch() {
            dispatches.push(dispatch);
        }
        if dispatches.len() >= n {
            return dispatches;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("only {} of {} dispatches arrived in time", dispatches.len(), n);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn task_by_name<'a>(tasks: &'a [TaskExecution], name: &str) -> &'a TaskExecution {
    tasks
        .iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("task '{}' should exist", name))
}

// =============================================================================
// Scenarios
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_linear_happy_path() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.input.insert("output".into(), json!("A"));
    task1.on_success.push("task2".into());
    let mut task2 = TaskSpec::action("task2", "std.echo");
    task2.input.insert("output".into(), json!("B"));

    register(&h.store, direct_spec(vec![task1, task2])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 2);

    let task1 = task_by_name(&tasks, "task1");
    let task2 = task_by_name(&tasks, "task2");
    assert_eq!(task1.state, State::Success);
    assert_eq!(task2.state, State::Success);
    assert!(task1.processed && task2.processed);

    assert_eq!(
        h.engine.task_result(task1.id).await.expect("should aggregate"),
        json!("A")
    );
    assert_eq!(
        h.engine.task_result(task2.id).await.expect("should aggregate"),
        json!("B")
    );

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_with_items_simple() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.with_items = Some(WithItemsSpec::new("name_info", json!("<% $.names_info %>")));
    task1
        .input
        .insert("output".into(), json!("<% $.name_info.name %>"));

    register(
        &h.store,
        spec_with_input(vec![InputParam::required("names_info")], vec![task1]),
    )
    .await;

    let input = json!({
        "names_info": [{"name": "John"}, {"name": "Ivan"}, {"name": "Mistral"}]
    });
    let wf_ex = h
        .engine
        .start_workflow("wf", "", input, "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 1);
    let task1 = task_by_name(&tasks, "task1");
    assert_eq!(task1.state, State::Success);

    let wi = task1.runtime.with_items.expect("with-items context");
    assert_eq!(wi.count, 3);

    let result = h.engine.task_result(task1.id).await.expect("should aggregate");
    assert_eq!(result, json!(["John", "Ivan", "Mistral"]));

    // Every declared iteration has exactly one accepted action.
    let actions = h.engine.action_executions(task1.id).await.expect("should list");
    assert_eq!(actions.len(), 3);
    assert_eq!(actions.iter().filter(|a| a.accepted).count(), 3);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_with_items_result_positions_follow_iteration_order() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.with_items = Some(WithItemsSpec::new("name", json!(["John", "Ivan", "Mistral"])));
    task1.input.insert("output".into(), json!("<% $.name %>"));

    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    // All three dispatch up front (unbounded concurrency); complete them in
    // reverse order.
    let dispatches = await_dispatches(&h.executor, 3, Duration::from_secs(5)).await;
    for dispatch in dispatches.iter().rev() {
        h.engine
            .on_action_complete(dispatch.action_execution_id, standard_result(dispatch))
            .await
            .expect("completion should apply");
    }

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let result = h
        .engine
        .task_result(task_by_name(&tasks, "task1").id)
        .await
        .expect("should aggregate");

    // Positions follow iteration order, not completion order.
    assert_eq!(result, json!(["John", "Ivan", "Mistral"]));

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_with_items_empty_list_routes_on_success() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.with_items = Some(WithItemsSpec::new("name", json!("<% $.names %>")));
    task1.input.insert("output".into(), json!("<% $.name %>"));
    task1.on_success.push("task2".into());
    let mut task2 = TaskSpec::action("task2", "std.echo");
    task2.input.insert("output".into(), json!("done"));

    register(
        &h.store,
        spec_with_input(vec![InputParam::required("names")], vec![task1, task2]),
    )
    .await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({"names": []}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 2);

    let task1 = task_by_name(&tasks, "task1");
    let task2 = task_by_name(&tasks, "task2");
    assert_eq!(task1.state, State::Success);
    assert_eq!(task2.state, State::Success);

    assert_eq!(
        h.engine.task_result(task1.id).await.expect("should aggregate"),
        json!([])
    );

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_with_items_retry_exhausted_routes_on_error() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.fail");
    task1.with_items = Some(WithItemsSpec::new("i", json!([1, 2])));
    task1.retry = Some(RetrySpec::new(1, 1));
    task1.on_error.push("task2".into());
    task1
        .publish_on_error
        .insert("result".into(), json!("With-items failed"));
    let mut task2 = TaskSpec::action("task2", "std.echo");
    task2.input.insert("output".into(), json!("recovered"));

    register(&h.store, direct_spec(vec![task1, task2])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(10)).await;
    assert_eq!(wf_ex.state, State::Success, "error was handled by on-error");

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 2);

    let task1 = task_by_name(&tasks, "task1");
    let task2 = task_by_name(&tasks, "task2");
    assert_eq!(task1.state, State::Error);
    assert!(task1.error_handled);
    assert_eq!(task1.published, json!({"result": "With-items failed"}));
    assert_eq!(task2.state, State::Success);

    // 2 items x (1 + 1 retry) attempts; only the final attempts count.
    let actions = h.engine.action_executions(task1.id).await.expect("should list");
    assert_eq!(actions.len(), 4);
    assert_eq!(actions.iter().filter(|a| a.accepted).count(), 2);
    assert_eq!(task1.runtime.retry.retry_no, 1);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_with_items_concurrency_one() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.with_items = Some(WithItemsSpec::new("name", json!(["John", "Ivan", "Mistral"])));
    task1.input.insert("output".into(), json!("<% $.name %>"));
    task1.concurrency = Some(json!(1));

    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    for step in 0..3 {
        // Exactly one dispatch may be outstanding at a time.
        let dispatch = await_dispatch(&h.executor, Duration::from_secs(5)).await;
        assert_eq!(
            h.executor.pending(),
            0,
            "step {}: concurrency bound broken",
            step
        );

        let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
        let task1 = task_by_name(&tasks, "task1");
        let running = h
            .engine
            .action_executions(task1.id)
            .await
            .expect("should list")
            .iter()
            .filter(|a| a.state == State::Running)
            .count();
        assert_eq!(running, 1, "step {}: more than one running action", step);

        h.engine
            .on_action_complete(dispatch.action_execution_id, standard_result(&dispatch))
            .await
            .expect("completion should apply");
    }

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let result = h
        .engine
        .task_result(task_by_name(&tasks, "task1").id)
        .await
        .expect("should aggregate");
    assert_eq!(result, json!(["John", "Ivan", "Mistral"]));

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_invalid_concurrency_expression_fails_task_and_workflow() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.with_items = Some(WithItemsSpec::new("name", json!(["a", "b"])));
    task1.input.insert("output".into(), json!("<% $.name %>"));
    task1.concurrency = Some(json!("<% $.concurrency %>"));

    register(
        &h.store,
        spec_with_input(vec![InputParam::required("concurrency")], vec![task1]),
    )
    .await;

    // A string-typed concurrency value is a policy type error.
    let wf_ex = h
        .engine
        .start_workflow(
            "wf",
            "",
            json!({"concurrency": "2"}),
            "",
            ExecutionParams::default(),
        )
        .await
        .expect("should start");

    let wf_ex = await_workflow(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Error);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let task1 = task_by_name(&tasks, "task1");
    assert_eq!(task1.state, State::Error);
    assert!(task1
        .state_info
        .as_deref()
        .expect("should carry diagnostics")
        .contains("Invalid data type in ConcurrencyPolicy"));
    assert!(wf_ex
        .state_info
        .as_deref()
        .expect("should carry diagnostics")
        .contains("Invalid data type in ConcurrencyPolicy"));

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_integrity_monitor_rescues_stuck_task() {
    let h = harness().await;

    let spec = direct_spec(vec![TaskSpec::action("task1", "std.echo")]);

    // Fabricate a workflow whose task completion nudge was lost: the task
    // is RUNNING, its only action finished long ago.
    let long_ago = Utc::now() - chrono::Duration::seconds(180);

    let mut wf_ex = WorkflowExecution::new(spec.clone(), json!({}), ExecutionParams::default());
    wf_ex.state = State::Running;

    let task_spec = spec.task("task1").expect("task1 exists").clone();
    let mut task = TaskExecution::new(wf_ex.id, task_spec, json!({}));
    task.state = State::Running;
    task.updated_at = long_ago;

    let mut action = ActionExecution::new(task.id, "std.echo", json!({"output": "A"}), 0);
    action.state = State::Success;
    action.output = Some(json!("A"));
    action.accepted = true;
    action.runtime = ExecutionRuntime::default();
    action.updated_at = long_ago;

    {
        let mut tx = h.store.begin(false).await.expect("should begin");
        tx.create_workflow_execution(&wf_ex).await.expect("should create");
        tx.create_task_execution(&task).await.expect("should create");
        tx.create_action_execution(&action).await.expect("should create");
        tx.commit().await.expect("should commit");
    }

    h.engine
        .check_and_fix_integrity(wf_ex.id)
        .await
        .expect("integrity pass should run");

    let wf_ex = await_workflow(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(task_by_name(&tasks, "task1").state, State::Success);

    h.handle.shutdown().await;
}

// =============================================================================
// Universal properties
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_completion_is_idempotent() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.input.insert("output".into(), json!("A"));
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let dispatch = await_dispatch(&h.executor, Duration::from_secs(5)).await;

    // The executor delivers at-least-once; apply the same result twice.
    for _ in 0..2 {
        h.engine
            .on_action_complete(dispatch.action_execution_id, standard_result(&dispatch))
            .await
            .expect("completion should apply");
    }

    let wf_ex = await_workflow(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let task1 = task_by_name(&tasks, "task1");
    let actions = h.engine.action_executions(task1.id).await.expect("should list");
    assert_eq!(actions.len(), 1);
    assert_eq!(
        h.engine.task_result(task1.id).await.expect("should aggregate"),
        json!("A")
    );

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_terminal_states_are_frozen() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.input.insert("output".into(), json!("A"));
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");
    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);
    let settled = wf_ex.clone();

    // Late stop requests and duplicate completions change nothing.
    h.engine
        .cancel_workflow(wf_ex.id, Some("too late".into()))
        .await
        .expect("stop on terminal workflow is a no-op");

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let actions = h
        .engine
        .action_executions(task_by_name(&tasks, "task1").id)
        .await
        .expect("should list");
    h.engine
        .on_action_complete(actions[0].id, ActionResult::error("late failure"))
        .await
        .expect("late completion is absorbed");

    let after = h
        .engine
        .workflow_execution(wf_ex.id)
        .await
        .expect("should load");
    assert_eq!(after.state, settled.state);
    assert_eq!(after.output, settled.output);
    assert_eq!(after.state_info, settled.state_info);

    let actions = h
        .engine
        .action_executions(task_by_name(&tasks, "task1").id)
        .await
        .expect("should list");
    assert_eq!(actions[0].state, State::Success);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_scheduler_fires_jobs_across_restart() {
    let store = Arc::new(MemoryStore::new());

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.input.insert("output".into(), json!("A"));
    register(&store, direct_spec(vec![task1])).await;

    // First engine plans the workflow (persisting a start job) but is shut
    // down before its scheduler ever polls.
    let planned = {
        let executor = Arc::new(QueueExecutor::new());
        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            executor,
            Arc::new(TemplateEvaluator::new()),
            test_config(),
        );

        engine
            .plan_workflow("wf", "", json!({}), "", ExecutionParams::default())
            .await
            .expect("should plan")
    };
    assert_eq!(planned.state, State::Idle);

    // A second engine over the same store picks the job up.
    let executor = Arc::new(QueueExecutor::new());
    let engine = Engine::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&executor) as Arc<dyn ActionExecutor>,
        Arc::new(TemplateEvaluator::new()),
        test_config(),
    );
    let handle = engine.start().await.expect("engine should start");

    let h = Harness {
        store,
        executor,
        engine,
        handle,
    };

    let wf_ex = drive(&h, planned.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_scheduler_recovers_abandoned_captures() {
    let h = harness().await;

    // A job captured by a worker that died: captured long ago, never
    // settled. The recovery sweep must make it fire again.
    let mut job = ScheduledJob::new(
        job_names::INTEGRITY_CHECK,
        json!({"workflow_execution_id": Uuid::now_v7()}),
        0,
    );
    job.captured_at = Some(Utc::now() - chrono::Duration::seconds(30));
    job.processing = true;

    {
        let mut tx = h.store.begin(false).await.expect("should begin");
        tx.create_scheduled_job(&job).await.expect("should create");
        tx.commit().await.expect("should commit");
    }

    // Fires against a missing workflow, which is a clean no-op, and the
    // row is deleted, which proves it was recovered and invoked.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.store.scheduled_job_count().await == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("abandoned job was never recovered and fired");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.handle.shutdown().await;
}

// =============================================================================
// Sub-workflows, joins, lifecycle
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_sub_workflow_result_feeds_parent_task() {
    let h = harness().await;

    let mut inner = TaskSpec::action("inner", "std.echo");
    inner.input.insert("output".into(), json!("from-sub"));
    let mut sub_spec = direct_spec(vec![inner]);
    sub_spec.name = "sub".into();
    sub_spec.output = Some(json!("<% task(inner).result %>"));
    register(&h.store, sub_spec).await;

    let task1 = TaskSpec::sub_workflow("task1", "sub");
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let task1 = task_by_name(&tasks, "task1");
    assert_eq!(task1.state, State::Success);

    let subs = h
        .engine
        .sub_workflow_executions(task1.id)
        .await
        .expect("should list");
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].state, State::Success);
    assert_eq!(subs[0].root_execution_id, Some(wf_ex.id));
    assert!(subs[0].accepted);

    assert_eq!(
        h.engine.task_result(task1.id).await.expect("should aggregate"),
        json!("from-sub")
    );

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_failed_sub_workflow_routes_on_error() {
    let h = harness().await;

    let mut sub_spec = direct_spec(vec![TaskSpec::action("inner", "std.fail")]);
    sub_spec.name = "sub".into();
    register(&h.store, sub_spec).await;

    let mut task1 = TaskSpec::sub_workflow("task1", "sub");
    task1.on_error.push("task2".into());
    let mut task2 = TaskSpec::action("task2", "std.echo");
    task2.input.insert("output".into(), json!("recovered"));
    register(&h.store, direct_spec(vec![task1, task2])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 2);
    assert_eq!(task_by_name(&tasks, "task1").state, State::Error);
    assert!(task_by_name(&tasks, "task1").error_handled);
    assert_eq!(task_by_name(&tasks, "task2").state, State::Success);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_join_all_runs_once_after_all_predecessors() {
    let h = harness().await;

    let mut a = TaskSpec::action("a", "std.echo");
    a.input.insert("output".into(), json!("a"));
    a.on_success.push("join_task".into());
    let mut b = TaskSpec::action("b", "std.echo");
    b.input.insert("output".into(), json!("b"));
    b.on_success.push("join_task".into());
    let mut join_task = TaskSpec::action("join_task", "std.echo");
    join_task.input.insert("output".into(), json!("joined"));
    join_task.join = Some(JoinSpec::Mode(JoinMode::All));

    register(&h.store, direct_spec(vec![a, b, join_task])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 3, "the join target must run exactly once");
    assert_eq!(task_by_name(&tasks, "join_task").state, State::Success);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_pause_holds_routing_and_resume_continues() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.input.insert("output".into(), json!("A"));
    task1.on_success.push("task2".into());
    let mut task2 = TaskSpec::action("task2", "std.echo");
    task2.input.insert("output".into(), json!("B"));
    register(&h.store, direct_spec(vec![task1, task2])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    h.engine
        .pause_workflow(wf_ex.id)
        .await
        .expect("should pause");

    // task1 completes while paused, but routing must not advance.
    pump(&h).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let paused = h
        .engine
        .workflow_execution(wf_ex.id)
        .await
        .expect("should load");
    assert_eq!(paused.state, State::Paused);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 1, "task2 must not spawn while paused");

    h.engine
        .resume_workflow(wf_ex.id)
        .await
        .expect("should resume");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    assert_eq!(tasks.len(), 2);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_cancel_interrupts_running_actions() {
    let h = harness().await;

    let task1 = TaskSpec::action("task1", "std.noop");
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    // Wait for the dispatch, but do not complete it.
    let dispatch = await_dispatch(&h.executor, Duration::from_secs(5)).await;

    h.engine
        .cancel_workflow(wf_ex.id, Some("operator cancelled".into()))
        .await
        .expect("should cancel");

    let wf_ex = h
        .engine
        .workflow_execution(wf_ex.id)
        .await
        .expect("should load");
    assert_eq!(wf_ex.state, State::Cancelled);
    assert_eq!(wf_ex.state_info.as_deref(), Some("operator cancelled"));

    // Cooperative interrupt was sent to the executor.
    assert!(h
        .executor
        .interrupted()
        .contains(&dispatch.action_execution_id));

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_rerun_failed_task_to_success() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.noop");
    task1.input.insert("output".into(), json!("fine"));
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    // First attempt fails against a flaky backend.
    let dispatch = await_dispatch(&h.executor, Duration::from_secs(5)).await;
    h.engine
        .on_action_complete(
            dispatch.action_execution_id,
            ActionResult::error("flaky backend"),
        )
        .await
        .expect("completion should apply");

    let failed = await_workflow(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(failed.state, State::Error);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let task1_id = task_by_name(&tasks, "task1").id;

    h.engine
        .rerun_workflow(wf_ex.id, task1_id, true, None)
        .await
        .expect("should rerun");

    let revived = h
        .engine
        .workflow_execution(wf_ex.id)
        .await
        .expect("should load");
    assert_eq!(revived.state, State::Running);

    // Second attempt succeeds.
    let dispatch = await_dispatch(&h.executor, Duration::from_secs(5)).await;
    h.engine
        .on_action_complete(
            dispatch.action_execution_id,
            ActionResult::ok(json!("fine")),
        )
        .await
        .expect("completion should apply");

    let wf_ex = await_workflow(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);

    let actions = h.engine.action_executions(task1_id).await.expect("should list");
    assert_eq!(actions.len(), 2);
    assert_eq!(actions.iter().filter(|a| a.accepted).count(), 1);
    assert_eq!(
        h.engine.task_result(task1_id).await.expect("should aggregate"),
        json!("fine")
    );

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_read_only_execution_refuses_rerun() {
    let h = harness().await;

    let task1 = TaskSpec::action("task1", "std.fail");
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let failed = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(failed.state, State::Error);

    h.engine
        .mark_workflow_read_only(wf_ex.id)
        .await
        .expect("should freeze");

    let frozen = h
        .engine
        .workflow_execution(wf_ex.id)
        .await
        .expect("should load");
    assert!(frozen.read_only);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let err = h
        .engine
        .rerun_workflow(wf_ex.id, task_by_name(&tasks, "task1").id, true, None)
        .await
        .expect_err("frozen execution must refuse rerun");
    assert!(err.to_string().contains("read-only"));

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_workflow_output_expression() {
    let h = harness().await;

    let mut task1 = TaskSpec::action("task1", "std.echo");
    task1.input.insert("output".into(), json!("A"));
    task1
        .publish
        .insert("echoed".into(), json!("<% task(task1).result %>"));

    let mut spec = direct_spec(vec![task1]);
    spec.output = Some(json!({"final": "<% $.echoed %>"}));
    register(&h.store, spec).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    let wf_ex = drive(&h, wf_ex.id, Duration::from_secs(5)).await;
    assert_eq!(wf_ex.state, State::Success);
    assert_eq!(wf_ex.output, Some(json!({"final": "A"})));

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_missing_required_input_rejected_before_creation() {
    let h = harness().await;

    let task1 = TaskSpec::action("task1", "std.noop");
    register(
        &h.store,
        spec_with_input(vec![InputParam::required("names")], vec![task1]),
    )
    .await;

    let err = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect_err("missing input must be rejected");
    assert!(err.to_string().contains("names"));

    // Nothing was persisted.
    assert_eq!(h.store.workflow_execution_count().await, 0);

    h.handle.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_lost_action_heartbeat_fails_iteration() {
    let mut config = test_config();
    config.action_heartbeat.first_heartbeat_timeout = 0;
    config.action_heartbeat.max_missed_heartbeats = 1;
    config.action_heartbeat.interval = 1;
    let h = harness_with_config(config).await;

    let task1 = TaskSpec::action("task1", "std.noop");
    register(&h.store, direct_spec(vec![task1])).await;

    let wf_ex = h
        .engine
        .start_workflow("wf", "", json!({}), "", ExecutionParams::default())
        .await
        .expect("should start");

    // Never complete the dispatch; the sweep declares the action lost.
    let wf_ex = await_workflow(&h, wf_ex.id, Duration::from_secs(10)).await;
    assert_eq!(wf_ex.state, State::Error);

    let tasks = h.engine.task_executions(wf_ex.id).await.expect("should list");
    let task1 = task_by_name(&tasks, "task1");
    assert_eq!(task1.state, State::Error);

    let actions = h.engine.action_executions(task1.id).await.expect("should list");
    assert_eq!(actions[0].state, State::Error);
    assert!(actions[0]
        .state_info
        .as_deref()
        .expect("should carry diagnostics")
        .contains("heartbeat"));

    h.handle.shutdown().await;
}
