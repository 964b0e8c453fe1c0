//! Task execution handling.
//!
//! Drives the task state machine: idempotent spawning (unique-key guarded),
//! input evaluation, action / sub-workflow / with-items dispatch, retry
//! scheduling, and completion routing (publish, next tasks, `processed`).
//!
//! Tasks never talk to the executor directly: dispatch and follow-up
//! evaluation go through the post-commit queue so no side effect exists for
//! a state the database did not persist.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::engine::{job_names, Command, Engine, PostCommitQueue, TaskContinueArgs, TaskRetryArgs, TaskTimeoutArgs};
use crate::error::EngineError;
use crate::executor::ActionDispatch;
use crate::persistence::{
    retry_on_db_error, task_unique_key, ActionExecution, ExecutionRuntime, NextTask,
    ScheduledJob, StoreError, StoreTx, TaskExecution, WorkflowExecution,
};
use crate::spec::{TaskEvent, TaskSpec, TaskType};
use crate::state::State;

use super::policies;
use super::with_items;

/// Uniform view over a task's children: action executions, or sub-workflow
/// executions for workflow-type tasks.
#[derive(Debug, Clone)]
pub(crate) struct ChildExecution {
    pub id: Uuid,
    pub task_execution_id: Option<Uuid>,
    pub state: State,
    pub state_info: Option<String>,
    pub output: Option<Value>,
    pub accepted: bool,
    pub index: u32,
    pub attempt: u32,
    pub is_workflow: bool,
    pub updated_at: DateTime<Utc>,
}

impl ChildExecution {
    pub(crate) fn from_action(a: &ActionExecution) -> Self {
        Self {
            id: a.id,
            task_execution_id: Some(a.task_execution_id),
            state: a.state,
            state_info: a.state_info.clone(),
            output: a.output.clone(),
            accepted: a.accepted,
            index: a.runtime.index,
            attempt: a.runtime.attempt,
            is_workflow: false,
            updated_at: a.updated_at,
        }
    }

    pub(crate) fn from_workflow(w: &WorkflowExecution) -> Self {
        Self {
            id: w.id,
            task_execution_id: w.task_execution_id,
            state: w.state,
            state_info: w.state_info.clone(),
            output: w.output.clone(),
            accepted: w.accepted,
            index: w.runtime.index,
            attempt: w.runtime.attempt,
            is_workflow: true,
            updated_at: w.updated_at,
        }
    }

    /// Value this child contributes to the task result.
    fn result_value(&self) -> Value {
        match self.state {
            State::Error => self
                .state_info
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            _ => self.output.clone().unwrap_or(Value::Null),
        }
    }
}

/// Merge an object's entries into a JSON-object context value.
pub(crate) fn merge_object(ctx: &mut Value, add: &serde_json::Map<String, Value>) {
    if let Value::Object(map) = ctx {
        for (k, v) in add {
            map.insert(k.clone(), v.clone());
        }
    }
}

impl Engine {
    // =========================================================================
    // Children and data flow
    // =========================================================================

    pub(crate) async fn load_children(
        &self,
        tx: &mut dyn StoreTx,
        task: &TaskExecution,
    ) -> Result<Vec<ChildExecution>, EngineError> {
        let children = match task.task_type {
            TaskType::Action => tx
                .get_action_executions(task.id)
                .await?
                .iter()
                .map(ChildExecution::from_action)
                .collect(),
            TaskType::Workflow => tx
                .get_sub_workflow_executions(task.id)
                .await?
                .iter()
                .map(ChildExecution::from_workflow)
                .collect(),
        };

        Ok(children)
    }

    /// Aggregate a task's result from its children.
    ///
    /// For with-items tasks: one entry per iteration, positioned by
    /// iteration index regardless of completion order. Otherwise the single
    /// accepted child's output.
    pub(crate) fn aggregate_children(
        &self,
        task: &TaskExecution,
        children: &[ChildExecution],
    ) -> Value {
        let mut latest: std::collections::BTreeMap<u32, &ChildExecution> = Default::default();
        for child in children {
            if !child.accepted || !child.state.is_completed() {
                continue;
            }
            let keep = match latest.get(&child.index) {
                Some(existing) => child.attempt >= existing.attempt,
                None => true,
            };
            if keep {
                latest.insert(child.index, child);
            }
        }

        match task.runtime.with_items {
            Some(wi) => Value::Array(
                (0..wi.count)
                    .map(|i| latest.get(&i).map(|c| c.result_value()).unwrap_or(Value::Null))
                    .collect(),
            ),
            None => latest
                .get(&0)
                .map(|c| c.result_value())
                .unwrap_or(Value::Null),
        }
    }

    pub(crate) async fn aggregate_task_result(
        &self,
        tx: &mut dyn StoreTx,
        task: &TaskExecution,
    ) -> Result<Value, EngineError> {
        let children = self.load_children(tx, task).await?;
        Ok(self.aggregate_children(task, &children))
    }

    /// Build the context a task (or the workflow output expression) sees:
    /// the workflow context, the published variables of processed tasks,
    /// and completed task results under `__tasks`.
    pub(crate) async fn build_context(
        &self,
        tx: &mut dyn StoreTx,
        wf_ex: &WorkflowExecution,
        tasks: &[TaskExecution],
    ) -> Result<Value, EngineError> {
        let mut ctx = wf_ex.context.clone();
        if !ctx.is_object() {
            ctx = Value::Object(serde_json::Map::new());
        }

        let mut task_data = serde_json::Map::new();
        for task in tasks {
            if task.processed {
                if let Value::Object(published) = &task.published {
                    merge_object(&mut ctx, published);
                }
            }
            if task.state.is_completed() {
                let result = self.aggregate_task_result(tx, task).await?;
                task_data.insert(task.name.clone(), serde_json::json!({ "result": result }));
            }
        }

        if let Value::Object(map) = &mut ctx {
            map.insert("__tasks".to_string(), Value::Object(task_data));
        }

        Ok(ctx)
    }

    // =========================================================================
    // Spawning
    // =========================================================================

    /// Create and start a task, idempotently.
    ///
    /// A concurrent spawn of the same task loses the unique-key insert race
    /// and silently adopts the winner. When `waiting` is set the task is
    /// only materialized in WAITING (join target whose predecessors are not
    /// done); a later call with `waiting = false` activates it.
    pub(crate) async fn run_task(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &WorkflowExecution,
        tasks: &[TaskExecution],
        spec: &TaskSpec,
        waiting: bool,
    ) -> Result<(), EngineError> {
        let key = task_unique_key(wf_ex.id, &spec.name);

        if let Some(existing) = tx.find_task_execution_by_unique_key(&key).await? {
            if existing.state == State::Waiting && !waiting {
                let mut task = existing;
                task.in_context = self.build_context(tx, wf_ex, tasks).await?;
                self.activate_task(tx, queue, wf_ex, task).await?;
            }
            return Ok(());
        }

        let in_context = self.build_context(tx, wf_ex, tasks).await?;
        let mut task = TaskExecution::new(wf_ex.id, spec.clone(), in_context);
        let defer_wait = spec.wait.unwrap_or(0) > 0;

        if waiting || defer_wait {
            task.state = State::Waiting;
        }

        match tx.create_task_execution(&task).await {
            Err(StoreError::DuplicateKey(_)) => {
                debug!(task = %spec.name, "lost task creation race, adopting existing");
                return Ok(());
            }
            other => other?,
        }

        info!(task = %task.name, task_execution_id = %task.id, "task created");

        if waiting {
            return Ok(());
        }

        if defer_wait {
            self.schedule_task_continue(queue, &task);
            return Ok(());
        }

        self.dispatch_work(tx, queue, wf_ex, task).await
    }

    /// Move a WAITING task forward (join satisfied, or wait served).
    async fn activate_task(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &WorkflowExecution,
        mut task: TaskExecution,
    ) -> Result<(), EngineError> {
        if task.spec.wait.unwrap_or(0) > 0 && !task.runtime.waited {
            tx.update_task_execution(&task).await?;
            self.schedule_task_continue(queue, &task);
            return Ok(());
        }

        task.state = State::Running;
        task.touch();
        self.dispatch_work(tx, queue, wf_ex, task).await
    }

    fn schedule_task_continue(&self, queue: &mut PostCommitQueue, task: &TaskExecution) {
        let args = TaskContinueArgs {
            task_execution_id: task.id,
        };
        let job = ScheduledJob::new(
            job_names::TASK_CONTINUE,
            serde_json::to_value(&args).unwrap_or(Value::Null),
            task.spec.wait.unwrap_or(0) as i64,
        )
        .with_key(format!("continue-{}", task.id));

        queue.push(Command::ScheduleJob { job });
    }

    /// Scheduled continuation after a `wait` delay.
    pub(crate) async fn continue_task(&self, task_execution_id: Uuid) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = async {
                let Some(mut task) = tx.load_task_execution(task_execution_id).await? else {
                    return Ok(());
                };
                if task.state != State::Waiting || task.runtime.waited {
                    return Ok(());
                }

                tx.lock_task_execution(task.id).await?;
                task.runtime.waited = true;
                task.state = State::Running;
                task.touch();

                let wf_ex = tx.get_workflow_execution(task.workflow_execution_id).await?;
                self.dispatch_work(tx.as_mut(), &mut queue, &wf_ex, task).await
            }
            .await;

            match result {
                Ok(()) => self.finish(tx, queue).await,
                Err(e) => {
                    self.abort(tx).await;
                    Err(e)
                }
            }
        })
        .await
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Evaluate the task's work plan and dispatch the first batch.
    ///
    /// Expression and policy failures fail the task, not the transaction:
    /// the task completes in ERROR with the failure in `state_info`.
    pub(crate) async fn dispatch_work(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &WorkflowExecution,
        mut task: TaskExecution,
    ) -> Result<(), EngineError> {
        match with_items::prepare(self.evaluator(), &task.spec, &task.in_context) {
            Err(e) if is_task_fault(&e) => {
                let msg = e.to_string();
                return self
                    .complete_task(tx, queue, wf_ex, &mut task, State::Error, Some(msg))
                    .await;
            }
            Err(e) => return Err(e),

            Ok(None) => {
                task.runtime.items = vec![Value::Object(serde_json::Map::new())];

                if let Err(e) = self.dispatch_iteration(tx, queue, wf_ex, &mut task, 0, 0).await {
                    if is_task_fault(&e) {
                        let msg = e.to_string();
                        return self
                            .complete_task(tx, queue, wf_ex, &mut task, State::Error, Some(msg))
                            .await;
                    }
                    return Err(e);
                }

                tx.update_task_execution(&task).await?;
            }

            Ok(Some(prepared)) => {
                task.runtime.items = prepared.items;
                let mut wi = prepared.context;

                if wi.count == 0 {
                    task.runtime.with_items = Some(wi);
                    tx.update_task_execution(&task).await?;
                    return self
                        .complete_task(tx, queue, wf_ex, &mut task, State::Success, None)
                        .await;
                }

                let initial = match wi.capacity {
                    Some(cap) => cap.min(wi.count),
                    None => wi.count,
                };

                for _ in 0..initial {
                    let index = wi.index;
                    if let Err(e) = self
                        .dispatch_iteration(tx, queue, wf_ex, &mut task, index, 0)
                        .await
                    {
                        if is_task_fault(&e) {
                            let msg = e.to_string();
                            task.runtime.with_items = Some(wi);
                            return self
                                .complete_task(tx, queue, wf_ex, &mut task, State::Error, Some(msg))
                                .await;
                        }
                        return Err(e);
                    }
                    wi.index += 1;
                    if let Some(cap) = wi.capacity {
                        wi.capacity = Some(cap - 1);
                    }
                }

                task.runtime.with_items = Some(wi);
                tx.update_task_execution(&task).await?;
            }
        }

        Ok(())
    }

    /// Create and dispatch one iteration's child (action or sub-workflow).
    pub(crate) async fn dispatch_iteration(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &WorkflowExecution,
        task: &mut TaskExecution,
        index: u32,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let mut eval_ctx = task.in_context.clone();
        if let Some(Value::Object(item)) = task.runtime.items.get(index as usize) {
            merge_object(&mut eval_ctx, item);
        }

        let input = crate::expr::eval_map(self.evaluator(), &task.spec.input, &eval_ctx)?;

        match task.task_type {
            TaskType::Action => {
                let action_name = task.spec.action.clone().ok_or_else(|| {
                    EngineError::InvalidAction(format!("task {} names no action", task.name))
                })?;

                let mut action = ActionExecution::new(
                    task.id,
                    action_name.clone(),
                    Value::Object(input.clone()),
                    self.config().action_heartbeat.first_heartbeat_timeout,
                );
                action.runtime = ExecutionRuntime { index, attempt };
                tx.create_action_execution(&action).await?;

                let deadline = task
                    .spec
                    .timeout
                    .map(|t| Utc::now() + chrono::Duration::seconds(t as i64));

                queue.push(Command::RunAction {
                    dispatch: ActionDispatch {
                        action_execution_id: action.id,
                        action_name,
                        input: Value::Object(input),
                        is_sync: action.is_sync,
                        deadline,
                    },
                });

                if let Some(timeout) = task.spec.timeout {
                    let args = TaskTimeoutArgs {
                        action_execution_id: action.id,
                    };
                    let job = ScheduledJob::new(
                        job_names::TASK_TIMEOUT,
                        serde_json::to_value(&args).unwrap_or(Value::Null),
                        timeout as i64,
                    );
                    queue.push(Command::ScheduleJob { job });
                }

                debug!(task = %task.name, index, attempt, action_execution_id = %action.id, "dispatched action");
            }

            TaskType::Workflow => {
                let workflow = task.spec.workflow.clone().ok_or_else(|| {
                    EngineError::InvalidModel(format!("task {} names no workflow", task.name))
                })?;

                queue.push(Command::StartSubWorkflow {
                    task_execution_id: task.id,
                    workflow,
                    namespace: wf_ex.workflow_namespace.clone(),
                    input: Value::Object(input),
                    index,
                    attempt,
                });

                debug!(task = %task.name, index, attempt, "dispatching sub-workflow");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Child completion
    // =========================================================================

    /// Evaluate a task after one of its children finished. Invoked by the
    /// scheduler (`task.on_action_complete` jobs) and by the integrity
    /// monitor's re-injection.
    #[instrument(skip(self))]
    pub(crate) async fn on_scheduled_child_complete(
        &self,
        child_id: Uuid,
        workflow_child: bool,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = self
                .child_complete_inner(tx.as_mut(), &mut queue, child_id, workflow_child)
                .await;

            match result {
                Ok(()) => self.finish(tx, queue).await,
                Err(e) => {
                    self.abort(tx).await;
                    Err(e)
                }
            }
        })
        .await
    }

    async fn child_complete_inner(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        child_id: Uuid,
        workflow_child: bool,
    ) -> Result<(), EngineError> {
        let child = if workflow_child {
            match tx.load_workflow_execution(child_id).await? {
                Some(wf) => ChildExecution::from_workflow(&wf),
                None => return Ok(()),
            }
        } else {
            match tx.get_action_execution(child_id).await {
                Ok(a) => ChildExecution::from_action(&a),
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        };

        if !child.state.is_completed() {
            debug!(%child_id, "child not completed yet, nothing to evaluate");
            return Ok(());
        }

        let Some(task_id) = child.task_execution_id else {
            return Ok(());
        };

        if tx.lock_task_execution(task_id).await.is_err() {
            return Ok(());
        }
        let mut task = tx.get_task_execution(task_id).await?;

        // Late completion of an in-flight sibling: the child row already
        // carries its result, the task outcome is settled.
        if task.state.is_completed() {
            return Ok(());
        }

        let wf_ex = tx.get_workflow_execution(task.workflow_execution_id).await?;

        // Completions arrive at least once. An errored attempt whose retry
        // was already booked is settled; re-delivery must not accept it
        // back or schedule another retry.
        let already_superseded = task
            .runtime
            .retry
            .attempts
            .get(&child.index)
            .map(|&next| next > child.attempt)
            .unwrap_or(false);
        if child.state == State::Error && already_superseded {
            return Ok(());
        }

        // A finished sub-workflow counts toward the result once evaluated.
        if workflow_child && !child.accepted {
            if let Some(mut sub) = tx.load_workflow_execution(child_id).await? {
                sub.accepted = true;
                tx.update_workflow_execution(&sub).await?;
            }
        }

        // Retry policy for failed children.
        if child.state == State::Error {
            if let Some(schedule) =
                policies::evaluate_retry(self.evaluator(), &task, &child)?
            {
                self.supersede_child(tx, &child).await?;

                task.runtime
                    .retry
                    .attempts
                    .insert(child.index, schedule.next_attempt);
                task.runtime.retry.retry_no = task
                    .runtime
                    .retry
                    .attempts
                    .values()
                    .copied()
                    .max()
                    .unwrap_or(0);
                task.touch();
                tx.update_task_execution(&task).await?;

                let args = TaskRetryArgs {
                    task_execution_id: task.id,
                    index: child.index,
                    attempt: schedule.next_attempt,
                };
                let job = ScheduledJob::new(
                    job_names::TASK_RETRY,
                    serde_json::to_value(&args).unwrap_or(Value::Null),
                    schedule.delay as i64,
                )
                .with_key(format!("retry-{}-{}", task.id, child.index));
                queue.push(Command::ScheduleJob { job });

                info!(
                    task = %task.name,
                    index = child.index,
                    attempt = schedule.next_attempt,
                    delay = schedule.delay,
                    "scheduled task retry"
                );
                return Ok(());
            }
        }

        let children = self.load_children(tx, &task).await?;
        let has_final_failure = children
            .iter()
            .any(|c| c.accepted && matches!(c.state, State::Error | State::Cancelled));

        // Keep the pipeline full, unless the task is failing, in which
        // case no new iterations are dispatched. Free slots are derived
        // from the children still running, which keeps re-delivered
        // completion events from inflating the budget.
        if let Some(mut wi) = task.runtime.with_items {
            if !has_final_failure && wi.index < wi.count {
                let running = children
                    .iter()
                    .filter(|c| !c.state.is_completed())
                    .count() as u32;
                let mut available = match wi.concurrency {
                    Some(limit) => limit.saturating_sub(running),
                    None => wi.count - wi.index,
                };

                while wi.index < wi.count && available > 0 {
                    let index = wi.index;
                    if let Err(e) = self
                        .dispatch_iteration(tx, queue, &wf_ex, &mut task, index, 0)
                        .await
                    {
                        if is_task_fault(&e) {
                            let msg = e.to_string();
                            task.runtime.with_items = Some(wi);
                            return self
                                .complete_task(tx, queue, &wf_ex, &mut task, State::Error, Some(msg))
                                .await;
                        }
                        return Err(e);
                    }
                    wi.index += 1;
                    available -= 1;
                }

                if wi.concurrency.is_some() {
                    wi.capacity = Some(available);
                }
            }

            task.runtime.with_items = Some(wi);
        }

        match completion_status(&task, &children) {
            Some(final_state) => {
                self.complete_task(tx, queue, &wf_ex, &mut task, final_state, None)
                    .await
            }
            None => {
                task.touch();
                tx.update_task_execution(&task).await?;
                Ok(())
            }
        }
    }

    /// Flip a retried attempt out of the accepted set.
    async fn supersede_child(
        &self,
        tx: &mut dyn StoreTx,
        child: &ChildExecution,
    ) -> Result<(), EngineError> {
        if child.is_workflow {
            if let Some(mut sub) = tx.load_workflow_execution(child.id).await? {
                sub.accepted = false;
                tx.update_workflow_execution(&sub).await?;
            }
        } else {
            let mut action = tx.get_action_execution(child.id).await?;
            action.accepted = false;
            action.touch();
            tx.update_action_execution(&action).await?;
        }
        Ok(())
    }

    /// Scheduled retry of a single iteration.
    pub(crate) async fn retry_task_iteration(
        &self,
        task_execution_id: Uuid,
        index: u32,
        attempt: u32,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = async {
                let Some(mut task) = tx.load_task_execution(task_execution_id).await? else {
                    return Ok(());
                };
                if task.state.is_completed() {
                    return Ok(());
                }

                tx.lock_task_execution(task.id).await?;
                let wf_ex = tx.get_workflow_execution(task.workflow_execution_id).await?;

                if let Err(e) = self
                    .dispatch_iteration(tx.as_mut(), &mut queue, &wf_ex, &mut task, index, attempt)
                    .await
                {
                    if is_task_fault(&e) {
                        let msg = e.to_string();
                        return self
                            .complete_task(
                                tx.as_mut(),
                                &mut queue,
                                &wf_ex,
                                &mut task,
                                State::Error,
                                Some(msg),
                            )
                            .await;
                    }
                    return Err(e);
                }

                task.touch();
                tx.update_task_execution(&task).await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => self.finish(tx, queue).await,
                Err(e) => {
                    self.abort(tx).await;
                    Err(e)
                }
            }
        })
        .await
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Complete a task: aggregate the result, publish, compute next tasks,
    /// mark processed and hand the workflow a completion check.
    pub(crate) async fn complete_task(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &WorkflowExecution,
        task: &mut TaskExecution,
        final_state: State,
        state_info: Option<String>,
    ) -> Result<(), EngineError> {
        if task.state.is_completed() {
            return Ok(());
        }

        let children = self.load_children(tx, task).await?;
        let result = self.aggregate_children(task, &children);

        let mut final_state = final_state;
        let mut state_info = state_info.or_else(|| {
            children
                .iter()
                .filter(|c| c.accepted && c.state == State::Error)
                .min_by_key(|c| c.index)
                .and_then(|c| c.state_info.clone())
        });

        // Publish context: everything the task saw, plus its own result.
        let tasks = tx.get_task_executions(wf_ex.id).await?;
        let mut ctx = self.build_context(tx, wf_ex, &tasks).await?;
        if let Value::Object(map) = &mut ctx {
            let entry = map
                .entry("__tasks")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(task_map) = entry {
                task_map.insert(
                    task.name.clone(),
                    serde_json::json!({ "result": result.clone() }),
                );
            }
        }

        let publish_spec = match final_state {
            State::Success => &task.spec.publish,
            State::Error => &task.spec.publish_on_error,
            _ => &task.spec.publish, // cancelled tasks publish nothing below
        };

        if final_state == State::Cancelled {
            task.published = Value::Object(serde_json::Map::new());
        } else {
            match crate::expr::eval_map(self.evaluator(), publish_spec, &ctx) {
                Ok(published) => task.published = Value::Object(published),
                Err(e) => {
                    final_state = State::Error;
                    state_info = Some(e.to_string());
                    task.published = Value::Object(serde_json::Map::new());
                }
            }
        }

        let mut next_tasks = Vec::new();
        match final_state {
            State::Success => {
                for name in &task.spec.on_success {
                    next_tasks.push(NextTask {
                        name: name.clone(),
                        event: TaskEvent::OnSuccess,
                    });
                }
            }
            State::Error => {
                for name in &task.spec.on_error {
                    next_tasks.push(NextTask {
                        name: name.clone(),
                        event: TaskEvent::OnError,
                    });
                }
            }
            _ => {}
        }
        if final_state != State::Cancelled {
            for name in &task.spec.on_complete {
                next_tasks.push(NextTask {
                    name: name.clone(),
                    event: TaskEvent::OnComplete,
                });
            }
        }

        task.error_handled = final_state == State::Error && !task.spec.on_error.is_empty();
        task.has_next_tasks = !next_tasks.is_empty();
        task.next_tasks = next_tasks;
        task.state = final_state;
        task.state_info = state_info;
        task.processed = true;
        task.finished_at = Some(Utc::now());
        task.touch();

        tx.update_task_execution(task).await?;

        info!(task = %task.name, state = %final_state, "task completed");

        queue.push(Command::CheckAndComplete {
            workflow_execution_id: wf_ex.id,
        });

        Ok(())
    }

    /// Fail a task outright (fatal paths: sub-workflow launch failure,
    /// unrecoverable action completion errors). Routes through the normal
    /// completion path so on-error handling still applies.
    pub async fn force_fail_task(
        &self,
        task_execution_id: Uuid,
        msg: &str,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = async {
                let Some(mut task) = tx.load_task_execution(task_execution_id).await? else {
                    return Ok(());
                };
                if task.state.is_completed() {
                    return Ok(());
                }

                tx.lock_task_execution(task.id).await?;
                let wf_ex = tx.get_workflow_execution(task.workflow_execution_id).await?;

                self.complete_task(
                    tx.as_mut(),
                    &mut queue,
                    &wf_ex,
                    &mut task,
                    State::Error,
                    Some(msg.to_string()),
                )
                .await
            }
            .await;

            match result {
                Ok(()) => self.finish(tx, queue).await,
                Err(e) => {
                    self.abort(tx).await;
                    Err(e)
                }
            }
        })
        .await
    }
}

/// Whether an error fails the task rather than the transaction.
fn is_task_fault(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::Expr(_) | EngineError::InvalidModel(_) | EngineError::InvalidAction(_)
    )
}

/// Decide whether a task is finished, and with which state.
///
/// A task completes as soon as any accepted child is terminally failed or
/// cancelled (in-flight siblings keep recording results, but no new work
/// starts), or when every iteration has an accepted successful child.
fn completion_status(task: &TaskExecution, children: &[ChildExecution]) -> Option<State> {
    let count = task.runtime.with_items.map(|w| w.count).unwrap_or(1);

    let mut latest: std::collections::BTreeMap<u32, &ChildExecution> = Default::default();
    for child in children {
        if !child.accepted || !child.state.is_completed() {
            continue;
        }
        let keep = match latest.get(&child.index) {
            Some(existing) => child.attempt >= existing.attempt,
            None => true,
        };
        if keep {
            latest.insert(child.index, child);
        }
    }

    if latest.values().any(|c| c.state == State::Cancelled) {
        return Some(State::Cancelled);
    }
    if latest.values().any(|c| c.state == State::Error) {
        return Some(State::Error);
    }

    let all_done = (0..count).all(|i| latest.contains_key(&i));
    if all_done {
        Some(State::Success)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{TaskRuntime, WithItemsContext};
    use serde_json::json;

    fn child(index: u32, attempt: u32, state: State, accepted: bool) -> ChildExecution {
        ChildExecution {
            id: Uuid::now_v7(),
            task_execution_id: Some(Uuid::now_v7()),
            state,
            state_info: None,
            output: Some(json!(format!("out-{}-{}", index, attempt))),
            accepted,
            index,
            attempt,
            is_workflow: false,
            updated_at: Utc::now(),
        }
    }

    fn with_items_task(count: u32) -> TaskExecution {
        let mut task = TaskExecution::new(
            Uuid::now_v7(),
            crate::spec::TaskSpec::action("t", "std.echo"),
            json!({}),
        );
        task.runtime = TaskRuntime {
            with_items: Some(WithItemsContext {
                count,
                index: count,
                capacity: None,
                concurrency: None,
            }),
            ..Default::default()
        };
        task
    }

    #[test]
    fn test_completion_waits_for_all_iterations() {
        let task = with_items_task(3);
        let children = vec![
            child(0, 0, State::Success, true),
            child(2, 0, State::Success, true),
        ];
        assert_eq!(completion_status(&task, &children), None);
    }

    #[test]
    fn test_completion_success_when_every_index_done() {
        let task = with_items_task(2);
        let children = vec![
            child(0, 0, State::Success, true),
            child(1, 0, State::Success, true),
        ];
        assert_eq!(completion_status(&task, &children), Some(State::Success));
    }

    #[test]
    fn test_completion_fails_fast_on_final_error() {
        let task = with_items_task(3);
        let children = vec![
            child(0, 0, State::Error, true),
            child(1, 0, State::Success, true),
        ];
        assert_eq!(completion_status(&task, &children), Some(State::Error));
    }

    #[test]
    fn test_superseded_attempts_do_not_complete() {
        let task = with_items_task(1);
        // A failed attempt that was superseded by a scheduled retry.
        let children = vec![child(0, 0, State::Error, false)];
        assert_eq!(completion_status(&task, &children), None);
    }

    #[test]
    fn test_latest_attempt_wins() {
        let task = with_items_task(1);
        let children = vec![
            child(0, 0, State::Error, false),
            child(0, 1, State::Success, true),
        ];
        assert_eq!(completion_status(&task, &children), Some(State::Success));
    }
}
