//! Integrity monitor.
//!
//! A completion nudge can be lost between an executor reply and the task
//! state update (crash, dropped scheduler job). The monitor runs as a
//! self-rescheduling job per workflow execution: it scans RUNNING tasks
//! that have not moved for a while, and when all of a task's children are
//! finished it re-injects the completion evaluation for the most recently
//! finished child. Nothing is surfaced to callers; the anomaly self-heals.

use chrono::Utc;
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::engine::{job_names, Command, Engine, IntegrityArgs, PostCommitQueue};
use crate::error::EngineError;
use crate::persistence::{retry_on_db_error, ScheduledJob};

/// Fixed self-reschedule interval, independent of the configured staleness
/// threshold (matches the long-standing production behavior).
const RESCHEDULE_DELAY_SECS: i64 = 120;

fn integrity_key(workflow_execution_id: Uuid) -> String {
    format!("wfh_c_a_f_i-{}", workflow_execution_id)
}

impl Engine {
    /// Queue an integrity check for a workflow execution. Deduplicated per
    /// execution by the job key; disabled by a negative configured delay.
    pub(crate) fn schedule_integrity(
        &self,
        queue: &mut PostCommitQueue,
        workflow_execution_id: Uuid,
        delay_secs: i64,
    ) {
        if !self.config().integrity_check_enabled() {
            return;
        }

        let args = IntegrityArgs {
            workflow_execution_id,
        };
        let job = ScheduledJob::new(
            job_names::INTEGRITY_CHECK,
            serde_json::to_value(&args).unwrap_or(Value::Null),
            delay_secs.max(0),
        )
        .with_key(integrity_key(workflow_execution_id));

        queue.push(Command::ScheduleJob { job });
    }

    /// One integrity pass over a workflow execution.
    ///
    /// Reschedules itself while the workflow is alive and re-injects
    /// completion evaluation for tasks stuck in RUNNING whose children have
    /// all finished longer ago than the configured threshold.
    #[instrument(skip(self))]
    pub async fn check_and_fix_integrity(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        if !self.config().integrity_check_enabled() {
            return Ok(());
        }

        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let result = async {
                let Some(wf_ex) = tx.load_workflow_execution(workflow_execution_id).await?
                else {
                    return Ok(());
                };
                if wf_ex.state.is_completed() {
                    // Terminal workflow: let the job chain die out.
                    return Ok(());
                }

                self.schedule_integrity(&mut queue, wf_ex.id, RESCHEDULE_DELAY_SECS);

                let check_after = self.config().execution_integrity_check_delay;
                let cutoff = Utc::now() - chrono::Duration::seconds(check_after);
                let batch = self.config().execution_integrity_check_batch_size;

                let stale = tx
                    .get_stale_running_task_executions(wf_ex.id, cutoff, batch)
                    .await?;

                for task in &stale {
                    let children = self.load_children(tx.as_mut(), task).await?;
                    if children.is_empty() {
                        continue;
                    }

                    if !children.iter().all(|c| c.state.is_completed()) {
                        continue;
                    }

                    let Some(last) = children.iter().max_by_key(|c| c.updated_at) else {
                        continue;
                    };

                    let idle_for = Utc::now() - last.updated_at;
                    if idle_for.num_seconds() <= check_after {
                        continue;
                    }

                    warn!(
                        task_execution_id = %task.id,
                        task = %task.name,
                        "task stuck in RUNNING with all children finished, re-injecting completion"
                    );

                    queue.push(Command::ScheduleOnActionComplete {
                        child_id: last.id,
                        workflow_child: last.is_workflow,
                    });
                }

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
}
