//! The dispatch loop: continuously advances pending work into running work
//! while respecting the concurrency bound, dependency order and priority.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::error::AppResult;
use crate::executor::{TaskExecutor, TaskOutput, TaskSink};
use crate::hub::EventHub;
use crate::types::{LogLevel, Task, TaskPatch, TaskResult, TaskStatus};

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    db: Database,
    executor: Arc<TaskExecutor>,
    hub: EventHub,
    max_concurrent: usize,
    poll_interval: Duration,
    /// Tasks already warned about a vanished dependency, so the log entry
    /// appears once per task rather than once per tick.
    missing_dep_warned: Mutex<HashSet<i64>>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        executor: Arc<TaskExecutor>,
        hub: EventHub,
        max_concurrent: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                db,
                executor,
                hub,
                max_concurrent,
                poll_interval,
                missing_dep_warned: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Run the scheduler loop forever. Errors inside a tick are logged and
    /// never escape; the loop only ends when its task is aborted.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            ticker.tick().await;

            // Reap finished executor tasks.
            while let Some(res) = inflight.try_join_next() {
                if let Err(e) = res {
                    error!("executor task panicked: {e}");
                }
            }

            if let Err(e) = self.tick(&mut inflight) {
                error!("scheduler loop error: {e}");
            }
        }
    }

    /// Dispatch as many tasks as there are free slots this tick.
    fn tick(&self, inflight: &mut JoinSet<()>) -> AppResult<()> {
        loop {
            let active = self.inner.db.count_tasks(TaskStatus::InProgress)?;
            if active >= self.inner.max_concurrent as i64 {
                return Ok(());
            }
            let Some(task) = self.inner.db.get_next_pending_task()? else {
                return Ok(());
            };
            if !self.dependencies_met(&task)? {
                return Ok(());
            }
            self.dispatch(task, inflight)?;
        }
    }

    /// Every dependency must exist and be completed. A vanished dependency
    /// blocks the task indefinitely and is surfaced in its log once.
    fn dependencies_met(&self, task: &Task) -> AppResult<bool> {
        for dep_id in &task.depends_on {
            match self.inner.db.get_task(*dep_id)? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                Some(_) => return Ok(false),
                None => {
                    let newly_warned = self
                        .inner
                        .missing_dep_warned
                        .lock()
                        .unwrap()
                        .insert(task.id);
                    if newly_warned {
                        self.inner.db.add_log(
                            task.id,
                            LogLevel::Warn,
                            &format!("dependency {} does not exist; task is blocked", dep_id),
                            None,
                        )?;
                    }
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn dispatch(&self, task: Task, inflight: &mut JoinSet<()>) -> AppResult<()> {
        let (branch, workdir) = self
            .inner
            .executor
            .workspaces()
            .workspace_names(task.id, &task.title);

        let task = self.inner.db.update_task(
            task.id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                branch: Some(branch),
                working_directory: Some(workdir.to_string_lossy().to_string()),
                ..Default::default()
            },
        )?;

        info!(task_id = task.id, title = %task.title, "dispatching task");
        self.inner.hub.broadcast_state(task.id, TaskStatus::InProgress);

        let executor = Arc::clone(&self.inner.executor);
        let sink = self.clone();
        inflight.spawn(async move {
            executor.execute_task(task, sink).await;
        });
        Ok(())
    }
}

impl TaskSink for Scheduler {
    fn on_output(&self, task_id: i64, output: TaskOutput) -> impl Future<Output = ()> + Send {
        async move {
            let level = output.event.level();
            let message = output.event.message();
            if let Err(e) = self
                .inner
                .db
                .add_log(task_id, level, &message, Some(&output.raw))
            {
                warn!(task_id, "failed to persist log entry: {e}");
            }
            self.inner
                .hub
                .broadcast_output(task_id, level, &message, Some(&output.raw));
        }
    }

    fn on_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: String,
    ) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(e) = self.inner.db.add_log(task_id, level, &message, None) {
                warn!(task_id, "failed to persist log entry: {e}");
            }
            self.inner.hub.broadcast_output(task_id, level, &message, None);
        }
    }

    fn on_complete(&self, task_id: i64, result: TaskResult) -> impl Future<Output = ()> + Send {
        async move {
            let patch = TaskPatch {
                status: Some(result.status),
                exit_code: result.exit_code,
                output: result.output.clone(),
                plan: result.plan.clone(),
                error: result.error.clone(),
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
                cost_usd: result.cost_usd,
                ..Default::default()
            };
            if let Err(e) = self.inner.db.update_task(task_id, patch) {
                warn!(task_id, "failed to record terminal state: {e}");
            }

            let (level, message) = match result.status {
                TaskStatus::Completed => (
                    LogLevel::Info,
                    format!("task completed (exit code {})", result.exit_code.unwrap_or(0)),
                ),
                TaskStatus::Cancelled => (LogLevel::Warn, "task cancelled".to_string()),
                _ => (
                    LogLevel::Error,
                    format!(
                        "task failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    ),
                ),
            };
            if let Err(e) = self.inner.db.add_log(task_id, level, &message, None) {
                warn!(task_id, "failed to persist completion log: {e}");
            }

            self.inner.hub.broadcast_complete(task_id, &result);
        }
    }
}
