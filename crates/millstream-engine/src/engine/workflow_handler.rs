//! Workflow lifecycle handling.
//!
//! Start, plan, stop, pause, resume, rerun and the completion check.
//! Sub-workflow trees are supervised recursively: cancel and terminate
//! walk down, pause and resume touch the leaves first, and a completing
//! sub-workflow reports back to its parent task like an action would.

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::controller::controller_for;
use crate::engine::{job_names, Command, Engine, PostCommitQueue, StartPlannedArgs};
use crate::error::EngineError;
use crate::persistence::{
    retry_on_db_error, ExecutionParams, ExecutionRuntime, ScheduledJob, StoreError, StoreTx,
    TaskExecution, WorkflowDefinition, WorkflowExecution,
};
use crate::spec::TaskType;
use crate::state::State;

impl Engine {
    // =========================================================================
    // Start / plan
    // =========================================================================

    /// Start a workflow by definition name and namespace.
    ///
    /// Creates the execution, runs the controller's initial task set and
    /// schedules the first integrity check. When the start was requested on
    /// behalf of a task (sub-workflow launch) and fails with an engine
    /// error, the parent task is force-failed instead of leaving it stuck.
    #[instrument(skip(self, input, params))]
    pub async fn start_workflow(
        &self,
        identifier: &str,
        namespace: &str,
        input: Value,
        description: &str,
        params: ExecutionParams,
    ) -> Result<WorkflowExecution, EngineError> {
        let parent_task = params.task_execution_id;

        let result = retry_on_db_error(|| {
            let input = input.clone();
            let params = params.clone();
            async move {
                let (mut tx, mut queue) = self.begin().await?;

                let started = self
                    .start_workflow_inner(
                        tx.as_mut(),
                        &mut queue,
                        identifier,
                        namespace,
                        input,
                        description,
                        params,
                    )
                    .await;

                match started {
                    Ok(wf_ex) => {
                        self.finish(tx, queue).await?;
                        Ok(wf_ex)
                    }
                    Err(e) => {
                        self.abort(tx).await;
                        Err(e)
                    }
                }
            }
        })
        .await;

        match result {
            Err(e) => {
                if let Some(task_id) = parent_task {
                    let msg = format!("Failed to run task [error={}]", e);
                    if let Err(fail_err) = self.force_fail_task(task_id, &msg).await {
                        error!(%task_id, "failed to fail parent task: {}", fail_err);
                    }
                }
                Err(e)
            }
            ok => ok,
        }
    }

    async fn start_workflow_inner(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        identifier: &str,
        namespace: &str,
        input: Value,
        description: &str,
        mut params: ExecutionParams,
    ) -> Result<WorkflowExecution, EngineError> {
        let def = get_definition(tx, identifier, namespace).await?;

        if params.namespace.is_none() {
            params.namespace = Some(def.namespace.clone());
        }

        let mut wf_ex = self
            .create_execution(tx, &def, input, description, params, ExecutionRuntime::default())
            .await?;

        self.start_execution(tx, queue, &mut wf_ex).await?;
        Ok(wf_ex)
    }

    /// Create a workflow execution without starting it; the start happens
    /// through a scheduled job so the caller returns immediately.
    #[instrument(skip(self, input, params))]
    pub async fn plan_workflow(
        &self,
        identifier: &str,
        namespace: &str,
        input: Value,
        description: &str,
        mut params: ExecutionParams,
    ) -> Result<WorkflowExecution, EngineError> {
        let (mut tx, mut queue) = self.begin().await?;

        let planned = async {
            let def = get_definition(tx.as_mut(), identifier, namespace).await?;

            if params.namespace.is_none() {
                params.namespace = Some(def.namespace.clone());
            }

            let wf_ex = self
                .create_execution(
                    tx.as_mut(),
                    &def,
                    input,
                    description,
                    params,
                    ExecutionRuntime::default(),
                )
                .await?;

            let args = StartPlannedArgs {
                workflow_execution_id: wf_ex.id,
            };
            queue.push(Command::ScheduleJob {
                job: ScheduledJob::new(
                    job_names::WORKFLOW_START_PLANNED,
                    serde_json::to_value(&args)?,
                    0,
                ),
            });

            self.schedule_integrity(&mut queue, wf_ex.id, 10);
            Ok(wf_ex)
        }
        .await;

        match planned {
            Ok(wf_ex) => {
                self.finish(tx, queue).await?;
                Ok(wf_ex)
            }
            Err(e) => {
                self.abort(tx).await;
                Err(e)
            }
        }
    }

    /// Scheduled continuation of [`Engine::plan_workflow`].
    pub(crate) async fn start_planned_workflow(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = async {
                let Some(mut wf_ex) = tx.load_workflow_execution(workflow_execution_id).await?
                else {
                    return Ok(());
                };
                if wf_ex.state != State::Idle {
                    return Ok(());
                }

                tx.lock_workflow_execution(wf_ex.id).await?;
                self.start_execution(tx.as_mut(), &mut queue, &mut wf_ex).await
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

    /// Launch one sub-workflow iteration (post-commit command).
    ///
    /// Failures force-fail the parent task through the regular error
    /// routing rather than propagating.
    pub(crate) async fn start_sub_workflow(
        &self,
        task_execution_id: Uuid,
        workflow: &str,
        namespace: &str,
        input: Value,
        index: u32,
        attempt: u32,
    ) {
        let result = retry_on_db_error(|| {
            let input = input.clone();
            async move {
                let (mut tx, mut queue) = self.begin().await?;

                let started = self
                    .start_sub_workflow_inner(
                        tx.as_mut(),
                        &mut queue,
                        task_execution_id,
                        workflow,
                        namespace,
                        input,
                        index,
                        attempt,
                    )
                    .await;

                match started {
                    Ok(()) => self.finish(tx, queue).await,
                    Err(e) => {
                        self.abort(tx).await;
                        Err(e)
                    }
                }
            }
        })
        .await;

        if let Err(e) = result {
            let msg = format!(
                "Failed to run task [error={}, workflow={}]",
                e, workflow
            );
            error!(%task_execution_id, "{}", msg);

            if let Err(fail_err) = self.force_fail_task(task_execution_id, &msg).await {
                error!(%task_execution_id, "failed to fail parent task: {}", fail_err);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_sub_workflow_inner(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        task_execution_id: Uuid,
        workflow: &str,
        namespace: &str,
        input: Value,
        index: u32,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let Some(task) = tx.load_task_execution(task_execution_id).await? else {
            return Ok(());
        };
        if task.state.is_completed() {
            return Ok(());
        }

        let parent = tx.get_workflow_execution(task.workflow_execution_id).await?;
        let def = get_definition(tx, workflow, namespace).await?;

        let params = ExecutionParams {
            env: parent.params.env.clone(),
            task_execution_id: Some(task.id),
            root_execution_id: Some(parent.root_execution_id.unwrap_or(parent.id)),
            namespace: Some(def.namespace.clone()),
            task_name: None,
        };

        let mut wf_ex = self
            .create_execution(tx, &def, input, "", params, ExecutionRuntime { index, attempt })
            .await?;

        self.start_execution(tx, queue, &mut wf_ex).await
    }

    /// Validate the input, build the initial context and insert the
    /// execution in IDLE.
    async fn create_execution(
        &self,
        tx: &mut dyn StoreTx,
        def: &WorkflowDefinition,
        input: Value,
        description: &str,
        params: ExecutionParams,
        runtime: ExecutionRuntime,
    ) -> Result<WorkflowExecution, EngineError> {
        let spec = def.spec.clone();

        let Value::Object(given) = input else {
            return Err(EngineError::InvalidInput(
                "workflow input must be an object".to_string(),
            ));
        };

        let declared: std::collections::BTreeSet<&str> =
            spec.input.iter().map(|p| p.name.as_str()).collect();

        for key in given.keys() {
            if !declared.contains(key.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "unexpected input parameter '{}' for workflow '{}'",
                    key, spec.name
                )));
            }
        }

        let mut merged = given;
        for param in &spec.input {
            if !merged.contains_key(&param.name) {
                match &param.default {
                    Some(default) => {
                        merged.insert(param.name.clone(), default.clone());
                    }
                    None => {
                        return Err(EngineError::InvalidInput(format!(
                            "missing required input parameter '{}' for workflow '{}'",
                            param.name, spec.name
                        )))
                    }
                }
            }
        }

        let mut context = serde_json::Map::new();
        for (k, v) in &merged {
            context.insert(k.clone(), v.clone());
        }
        context.insert("__env".to_string(), Value::Object(params.env.clone()));

        // Workflow vars may reference input and environment.
        let vars = crate::expr::eval_map(
            self.evaluator(),
            &spec.vars,
            &Value::Object(context.clone()),
        )?;
        for (k, v) in vars {
            context.insert(k, v);
        }

        let mut wf_ex = WorkflowExecution::new(spec, Value::Object(merged), params);
        wf_ex.description = description.to_string();
        wf_ex.workflow_definition_id = Some(def.id);
        wf_ex.context = Value::Object(context);
        wf_ex.runtime = runtime;

        tx.create_workflow_execution(&wf_ex).await?;

        info!(workflow = %wf_ex.name, workflow_execution_id = %wf_ex.id, "created workflow execution");
        Ok(wf_ex)
    }

    /// Move an execution to RUNNING and spawn the initial task set.
    async fn start_execution(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &mut WorkflowExecution,
    ) -> Result<(), EngineError> {
        if !wf_ex.state.can_transition(State::Running) {
            return Err(EngineError::InvalidState(format!(
                "workflow {} cannot start from {}",
                wf_ex.id, wf_ex.state
            )));
        }

        wf_ex.state = State::Running;
        wf_ex.state_info = None;
        wf_ex.touch();
        tx.update_workflow_execution(wf_ex).await?;

        let controller = controller_for(wf_ex.spec.workflow_type);
        let selections = controller.next_tasks(wf_ex, &[])?;

        for selection in &selections {
            let spec = wf_ex.spec.task(&selection.name).cloned().ok_or_else(|| {
                EngineError::InvalidModel(format!("unknown task '{}'", selection.name))
            })?;
            self.run_task(tx, queue, wf_ex, &[], &spec, selection.waiting)
                .await?;
        }

        self.schedule_integrity(queue, wf_ex.id, 10);

        info!(workflow_execution_id = %wf_ex.id, tasks = selections.len(), "workflow started");
        Ok(())
    }

    // =========================================================================
    // Completion check
    // =========================================================================

    /// Advance a workflow: spawn whatever the controller says is runnable;
    /// when nothing is left, settle the final state and output.
    #[instrument(skip(self))]
    pub async fn check_and_complete(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = self
                .check_and_complete_inner(tx.as_mut(), &mut queue, workflow_execution_id)
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

    async fn check_and_complete_inner(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        workflow_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        if tx
            .load_workflow_execution(workflow_execution_id)
            .await?
            .is_none()
        {
            return Ok(());
        }

        tx.lock_workflow_execution(workflow_execution_id).await?;
        let mut wf_ex = tx.get_workflow_execution(workflow_execution_id).await?;

        if wf_ex.state.is_completed() {
            return Ok(());
        }
        if wf_ex.state == State::Paused {
            debug!(workflow_execution_id = %wf_ex.id, "workflow paused, not advancing");
            return Ok(());
        }

        let tasks = tx.get_task_executions(wf_ex.id).await?;
        let controller = controller_for(wf_ex.spec.workflow_type);
        let selections = controller.next_tasks(&wf_ex, &tasks)?;

        if !selections.is_empty() {
            for selection in &selections {
                let spec = wf_ex.spec.task(&selection.name).cloned().ok_or_else(|| {
                    EngineError::InvalidModel(format!("unknown task '{}'", selection.name))
                })?;
                self.run_task(tx, queue, &wf_ex, &tasks, &spec, selection.waiting)
                    .await?;
            }

            if selections.iter().any(|s| !s.waiting) {
                return Ok(());
            }

            // Only join placeholders left. If every non-waiting task is
            // settled, the missing routes can never fire: fail the joins
            // instead of hanging the workflow.
            let others_done = tasks
                .iter()
                .filter(|t| t.state != State::Waiting)
                .all(|t| t.state.is_completed() && t.processed);
            if !others_done {
                return Ok(());
            }

            for selection in &selections {
                let key = crate::persistence::task_unique_key(wf_ex.id, &selection.name);
                if let Some(mut task) = tx.find_task_execution_by_unique_key(&key).await? {
                    if task.state == State::Waiting {
                        self.complete_task(
                            tx,
                            queue,
                            &wf_ex,
                            &mut task,
                            State::Error,
                            Some(format!(
                                "join of task '{}' can no longer be satisfied",
                                selection.name
                            )),
                        )
                        .await?;
                    }
                }
            }
            return Ok(());
        }

        let all_done = !tasks.is_empty()
            && tasks.iter().all(|t| t.state.is_completed() && t.processed);
        if !all_done {
            return Ok(());
        }

        let final_state = workflow_final_state(&tasks);
        let mut state_info = None;

        let mut output = Value::Object(serde_json::Map::new());
        if final_state == State::Error {
            let failed: Vec<String> = tasks
                .iter()
                .filter(|t| t.state == State::Error && !t.error_handled)
                .map(|t| {
                    format!(
                        "{}: {}",
                        t.name,
                        t.state_info.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            state_info = Some(format!("Failure caused by error in tasks: {}", failed.join("; ")));
        } else if final_state == State::Success {
            if let Some(output_spec) = wf_ex.spec.output.clone() {
                let ctx = self.build_context(tx, &wf_ex, &tasks).await?;
                match crate::expr::eval_value(self.evaluator(), &output_spec, &ctx) {
                    Ok(value) => output = value,
                    Err(e) => {
                        return self
                            .settle_workflow(
                                tx,
                                queue,
                                &mut wf_ex,
                                State::Error,
                                Some(e.to_string()),
                                Value::Object(serde_json::Map::new()),
                            )
                            .await
                    }
                }
            }
        }

        self.settle_workflow(tx, queue, &mut wf_ex, final_state, state_info, output)
            .await
    }

    /// Write the terminal state and propagate it outward.
    async fn settle_workflow(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        wf_ex: &mut WorkflowExecution,
        final_state: State,
        state_info: Option<String>,
        output: Value,
    ) -> Result<(), EngineError> {
        wf_ex.state = final_state;
        wf_ex.state_info = state_info;
        wf_ex.output = Some(output);
        wf_ex.touch();
        tx.update_workflow_execution(wf_ex).await?;

        info!(
            workflow_execution_id = %wf_ex.id,
            state = %final_state,
            "workflow completed"
        );

        // A sub-workflow acts as its parent task's "action": hand the
        // result up for evaluation.
        if wf_ex.is_sub_workflow() {
            queue.push(Command::ScheduleOnActionComplete {
                child_id: wf_ex.id,
                workflow_child: true,
            });
        }

        Ok(())
    }

    /// Freeze a failed execution and its failed descendants. The read-only
    /// flag is the one mutation a terminal execution accepts; a frozen
    /// execution refuses rerun.
    pub async fn mark_workflow_read_only(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let mut tx = self.store().begin(false).await?;

        let result = async {
            let wf_ex = tx.get_workflow_execution(workflow_execution_id).await?;

            let mut ids = vec![wf_ex.id];
            for sub in tx
                .get_workflow_executions_by_root(wf_ex.id, Some(State::Error))
                .await?
            {
                ids.push(sub.id);
            }
            tx.mark_workflow_executions_read_only(&ids).await?;
            Ok::<(), EngineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Stop / cancel / force-fail
    // =========================================================================

    /// Stop a workflow in ERROR or CANCELLED, recursively taking down
    /// incomplete sub-workflows. Running actions receive a cooperative
    /// interrupt; the engine does not wait for them.
    pub fn stop_workflow(
        &self,
        workflow_execution_id: Uuid,
        state: State,
        msg: Option<String>,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            if !matches!(state, State::Error | State::Cancelled) {
                return Err(EngineError::InvalidState(format!(
                    "workflows can only be stopped in ERROR or CANCELLED, not {}",
                    state
                )));
            }

            let sub_ids = retry_on_db_error(|| {
                let msg = msg.clone();
                async move {
                    let (mut tx, mut queue) = self.begin().await?;

                    let stopped = self
                        .stop_workflow_inner(
                            tx.as_mut(),
                            &mut queue,
                            workflow_execution_id,
                            state,
                            msg,
                        )
                        .await;

                    match stopped {
                        Ok(subs) => {
                            self.finish(tx, queue).await?;
                            Ok(subs)
                        }
                        Err(e) => {
                            self.abort(tx).await;
                            Err(e)
                        }
                    }
                }
            })
            .await?;

            for sub_id in sub_ids {
                self.stop_workflow(sub_id, state, msg.clone()).await?;
            }

            Ok(())
        })
    }

    async fn stop_workflow_inner(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        workflow_execution_id: Uuid,
        state: State,
        msg: Option<String>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let Some(mut wf_ex) = tx.load_workflow_execution(workflow_execution_id).await? else {
            return Ok(vec![]);
        };
        if wf_ex.state.is_completed() {
            return Ok(vec![]);
        }

        tx.lock_workflow_execution(wf_ex.id).await?;

        let tasks = tx.get_task_executions(wf_ex.id).await?;
        let mut sub_ids = Vec::new();

        for task in &tasks {
            if task.state.is_completed() {
                continue;
            }

            match task.task_type {
                TaskType::Action => {
                    self.cancel_incomplete_actions(tx, queue, task.id).await?;
                }
                TaskType::Workflow => {
                    for sub in tx.get_sub_workflow_executions(task.id).await? {
                        if !sub.state.is_completed() {
                            sub_ids.push(sub.id);
                        }
                    }
                }
            }
        }

        if wf_ex.state.can_transition(state) {
            wf_ex.state = state;
            wf_ex.state_info = msg;
            wf_ex.touch();
            tx.update_workflow_execution(&wf_ex).await?;

            warn!(workflow_execution_id = %wf_ex.id, state = %state, "workflow stopped");

            if wf_ex.is_sub_workflow() {
                queue.push(Command::ScheduleOnActionComplete {
                    child_id: wf_ex.id,
                    workflow_child: true,
                });
            }
        }

        Ok(sub_ids)
    }

    /// Fail a workflow with the given message.
    pub async fn force_fail_workflow(
        &self,
        workflow_execution_id: Uuid,
        msg: &str,
    ) -> Result<(), EngineError> {
        self.stop_workflow(workflow_execution_id, State::Error, Some(msg.to_string()))
            .await
    }

    /// Cancel a workflow and its incomplete sub-workflows.
    pub async fn cancel_workflow(
        &self,
        workflow_execution_id: Uuid,
        msg: Option<String>,
    ) -> Result<(), EngineError> {
        self.stop_workflow(workflow_execution_id, State::Cancelled, msg)
            .await
    }

    // =========================================================================
    // Pause / resume
    // =========================================================================

    /// Pause a workflow; sub-workflows are paused first so a partial
    /// failure leaves the pause retryable.
    pub fn pause_workflow(
        &self,
        workflow_execution_id: Uuid,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            for sub_id in self.incomplete_sub_workflows(workflow_execution_id).await? {
                self.pause_workflow(sub_id).await?;
            }

            retry_on_db_error(|| async move {
                let mut tx = self.store().begin(false).await?;

                let paused = async {
                    let Some(mut wf_ex) =
                        tx.load_workflow_execution(workflow_execution_id).await?
                    else {
                        return Ok(());
                    };
                    if !wf_ex.state.can_transition(State::Paused) {
                        return Ok(());
                    }

                    tx.lock_workflow_execution(wf_ex.id).await?;
                    wf_ex.state = State::Paused;
                    wf_ex.touch();
                    tx.update_workflow_execution(&wf_ex).await?;

                    info!(%workflow_execution_id, "workflow paused");
                    Ok(())
                }
                .await;

                match paused {
                    Ok(()) => {
                        tx.commit().await?;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = tx.rollback().await;
                        Err(e)
                    }
                }
            })
            .await
        })
    }

    /// Resume a paused (or idle) workflow; sub-workflows resume first so
    /// the continuation sees them running.
    pub fn resume_workflow(
        &self,
        workflow_execution_id: Uuid,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            {
                let mut tx = self.store().begin(true).await?;
                let Some(wf_ex) = tx.load_workflow_execution(workflow_execution_id).await? else {
                    return Ok(());
                };
                tx.commit().await?;

                if !wf_ex.state.is_paused_or_idle() {
                    return Ok(());
                }
            }

            for sub_id in self.incomplete_sub_workflows(workflow_execution_id).await? {
                self.resume_workflow(sub_id).await?;
            }

            retry_on_db_error(|| async move {
                let (mut tx, mut queue) = self.begin().await?;

                let resumed = async {
                    let Some(mut wf_ex) =
                        tx.load_workflow_execution(workflow_execution_id).await?
                    else {
                        return Ok(());
                    };
                    if !wf_ex.state.is_paused_or_idle() {
                        return Ok(());
                    }

                    tx.lock_workflow_execution(wf_ex.id).await?;
                    wf_ex.state = State::Running;
                    wf_ex.touch();
                    tx.update_workflow_execution(&wf_ex).await?;

                    queue.push(Command::CheckAndComplete {
                        workflow_execution_id: wf_ex.id,
                    });

                    info!(%workflow_execution_id, "workflow resumed");
                    Ok(())
                }
                .await;

                match resumed {
                    Ok(()) => self.finish(tx, queue).await,
                    Err(e) => {
                        self.abort(tx).await;
                        Err(e)
                    }
                }
            })
            .await
        })
    }

    async fn incomplete_sub_workflows(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<Uuid>, EngineError> {
        let mut tx = self.store().begin(true).await?;

        let Some(wf_ex) = tx.load_workflow_execution(workflow_execution_id).await? else {
            tx.commit().await?;
            return Ok(vec![]);
        };

        let mut sub_ids = Vec::new();
        for task in tx.get_task_executions(wf_ex.id).await? {
            for sub in tx.get_sub_workflow_executions(task.id).await? {
                if !sub.state.is_completed() {
                    sub_ids.push(sub.id);
                }
            }
        }

        tx.commit().await?;
        Ok(sub_ids)
    }

    // =========================================================================
    // Rerun
    // =========================================================================

    /// Re-run a failed task inside a (possibly failed) workflow.
    ///
    /// `reset` re-runs every iteration from scratch; without it only the
    /// failed iterations get a fresh attempt. `env` merges replacement
    /// environment variables into the context.
    #[instrument(skip(self, env))]
    pub async fn rerun_workflow(
        &self,
        workflow_execution_id: Uuid,
        task_execution_id: Uuid,
        reset: bool,
        env: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), EngineError> {
        let (mut tx, mut queue) = self.begin().await?;

        let result = self
            .rerun_inner(
                tx.as_mut(),
                &mut queue,
                workflow_execution_id,
                task_execution_id,
                reset,
                env,
            )
            .await;

        match result {
            Ok(()) => self.finish(tx, queue).await,
            Err(e) => {
                self.abort(tx).await;
                Err(e)
            }
        }
    }

    async fn rerun_inner(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut PostCommitQueue,
        workflow_execution_id: Uuid,
        task_execution_id: Uuid,
        reset: bool,
        env: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), EngineError> {
        let mut wf_ex = tx.get_workflow_execution(workflow_execution_id).await?;

        if wf_ex.state == State::Paused {
            return Ok(());
        }
        if wf_ex.read_only {
            return Err(EngineError::InvalidState(format!(
                "workflow {} is read-only",
                wf_ex.id
            )));
        }

        tx.lock_workflow_execution(wf_ex.id).await?;
        tx.lock_task_execution(task_execution_id).await?;
        let mut task = tx.get_task_execution(task_execution_id).await?;

        if !matches!(task.state, State::Error | State::Cancelled) {
            return Err(EngineError::InvalidState(format!(
                "only failed or cancelled tasks can be re-run, task {} is {}",
                task.name, task.state
            )));
        }

        if let Some(env) = env {
            for (k, v) in &env {
                wf_ex.params.env.insert(k.clone(), v.clone());
            }
            if let Value::Object(ctx) = &mut wf_ex.context {
                ctx.insert("__env".to_string(), Value::Object(wf_ex.params.env.clone()));
            }
        }

        // Rerun deliberately leaves the terminal-state machine: the
        // execution goes back to RUNNING by reset.
        wf_ex.state = State::Running;
        wf_ex.state_info = None;
        wf_ex.output = None;
        wf_ex.touch();
        tx.update_workflow_execution(&wf_ex).await?;

        task.state = State::Running;
        task.state_info = None;
        task.processed = false;
        task.finished_at = None;
        task.error_handled = false;
        task.has_next_tasks = false;
        task.next_tasks.clear();
        task.published = Value::Object(serde_json::Map::new());

        let children = self.load_children(tx, &task).await?;

        if reset {
            for child in &children {
                if child.accepted {
                    self.supersede_child_for_rerun(tx, child).await?;
                }
            }

            task.runtime.retry = Default::default();
            task.runtime.with_items = None;
            task.runtime.items.clear();
            task.touch();
            tx.update_task_execution(&task).await?;

            let task = tx.get_task_execution(task_execution_id).await?;
            self.dispatch_work(tx, queue, &wf_ex, task).await?;
        } else {
            // Fresh attempts for the failed iterations only.
            let mut redispatched = 0u32;
            let failed: Vec<_> = children
                .iter()
                .filter(|c| c.accepted && c.state == State::Error)
                .cloned()
                .collect();

            for child in &failed {
                self.supersede_child_for_rerun(tx, child).await?;
                self.dispatch_iteration(tx, queue, &wf_ex, &mut task, child.index, child.attempt + 1)
                    .await?;
                redispatched += 1;
            }

            if let Some(mut wi) = task.runtime.with_items {
                wi.capacity = wi.concurrency.map(|c| c.saturating_sub(redispatched.min(c)));
                task.runtime.with_items = Some(wi);
            }

            task.touch();
            tx.update_task_execution(&task).await?;
        }

        self.schedule_integrity(queue, wf_ex.id, self.config().execution_integrity_check_delay);

        info!(
            workflow_execution_id = %wf_ex.id,
            task = %task.name,
            reset,
            "task re-run requested"
        );
        Ok(())
    }

    async fn supersede_child_for_rerun(
        &self,
        tx: &mut dyn StoreTx,
        child: &crate::engine::task_handler::ChildExecution,
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
}

async fn get_definition(
    tx: &mut dyn StoreTx,
    identifier: &str,
    namespace: &str,
) -> Result<WorkflowDefinition, EngineError> {
    match tx.get_workflow_definition(identifier, namespace).await {
        Ok(def) => Ok(def),
        Err(StoreError::NotFound { .. }) => {
            Err(EngineError::definition_not_found(identifier, namespace))
        }
        Err(e) => Err(e.into()),
    }
}

/// Final workflow state from its settled task set.
fn workflow_final_state(tasks: &[TaskExecution]) -> State {
    if tasks.iter().any(|t| t.state == State::Cancelled) {
        State::Cancelled
    } else if tasks
        .iter()
        .any(|t| t.state == State::Error && !t.error_handled)
    {
        State::Error
    } else {
        State::Success
    }
}
