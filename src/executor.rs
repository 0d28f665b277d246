//! Execution of a single task end-to-end: workspace, agent process, event
//! stream, finalization.
//!
//! The executor owns no durable state. It reports everything through a
//! [`TaskSink`], which keeps it testable without a store or a hub, and keeps
//! the terminal status write in the hands of the caller's completion hook.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::events::{parse_line, AgentEvent, OutputAccumulator, PLAN_SENTINEL};
use crate::types::{LogLevel, Task, TaskMode, TaskResult, TaskStatus};
use crate::workspace::WorkspaceManager;

/// Buffer size for the child's stdout. Individual events can be large; they
/// are delivered whole regardless of length.
const STDOUT_BUFFER: usize = 1024 * 1024;

/// One parsed line from the agent, with the verbatim text alongside.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub event: AgentEvent,
    pub raw: String,
}

/// Receiver of executor callbacks. The scheduler implements this against the
/// store and the hub; tests implement it with in-memory collectors.
pub trait TaskSink: Send + Sync + 'static {
    /// A parsed event from the agent's stdout.
    fn on_output(&self, task_id: i64, output: TaskOutput) -> impl Future<Output = ()> + Send;

    /// An out-of-band notice from the executor itself (not agent output).
    fn on_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: String,
    ) -> impl Future<Output = ()> + Send;

    /// Terminal result. Called exactly once per execution, last.
    fn on_complete(&self, task_id: i64, result: TaskResult) -> impl Future<Output = ()> + Send;
}

fn compose_prompt(task: &Task) -> String {
    let mut prompt = String::new();
    if task.mode == TaskMode::Plan {
        prompt.push_str(&format!(
            "IMPORTANT: Before writing any code, output a detailed implementation \
             plan as markdown. After the plan, write '{}', then implement.\n\n",
            PLAN_SENTINEL
        ));
    }
    prompt.push_str(&task.prompt);
    prompt.push_str(
        "\n\nWhen the work is done: commit your changes on this branch, merge the \
         branch into the base repository's checked-out branch, and push. Leave no \
         uncommitted work behind.",
    );
    prompt
}

/// Runs agent processes, one per task, in isolated workspaces.
pub struct TaskExecutor {
    workspaces: WorkspaceManager,
    log_dir: PathBuf,
    agent_cmd: String,
    /// task id -> cancellation trigger for the running child.
    active: Mutex<HashMap<i64, oneshot::Sender<()>>>,
}

impl TaskExecutor {
    pub fn new(workspaces: WorkspaceManager, log_dir: PathBuf, agent_cmd: String) -> Self {
        Self {
            workspaces,
            log_dir,
            agent_cmd,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Request cancellation of a running task. Idempotent; unknown ids are a
    /// no-op. The executor finalizes the task as `cancelled` once the child
    /// is gone.
    pub fn cancel(&self, task_id: i64) {
        let sender = self.active.lock().unwrap().remove(&task_id);
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    /// Run one task to completion. Every outcome, including workspace
    /// failures and cancellation, ends in exactly one `on_complete` call.
    pub async fn execute_task<S: TaskSink>(&self, task: Task, sink: S) {
        let repo_override = task.repo_path.clone();
        let repo_override = repo_override.as_deref();

        let (branch, workdir) = match self
            .workspaces
            .create_workspace(task.id, &task.title, repo_override)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                sink.on_complete(
                    task.id,
                    TaskResult::failed_before_start(format!("workspace creation failed: {}", e)),
                )
                .await;
                return;
            }
        };

        let prompt = compose_prompt(&task);

        let mut cmd = Command::new(&self.agent_cmd);
        cmd.current_dir(&workdir)
            .arg("-p")
            .arg(&prompt)
            .args(["--output-format", "stream-json"])
            .arg("--verbose")
            .arg("--dangerously-skip-permissions")
            .env_remove("CLAUDECODE")
            .env("CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.workspaces
                    .remove_workspace(&workdir, &branch, true, repo_override)
                    .await;
                sink.on_complete(
                    task.id,
                    TaskResult::failed_before_start(format!(
                        "failed to start {}: {}",
                        self.agent_cmd, e
                    )),
                )
                .await;
                return;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.active.lock().unwrap().insert(task.id, cancel_tx);

        // Drain stderr concurrently so a chatty child cannot block on it.
        let stderr_task = stderr.map(|mut err| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = err.read_to_string(&mut text).await;
                text
            })
        });

        let log_path = self.log_dir.join(format!("task-{}.log", task.id));
        let mut log_file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                sink.on_log(
                    task.id,
                    LogLevel::Warn,
                    format!("failed to open {}: {}", log_path.display(), e),
                )
                .await;
                None
            }
        };
        let mut log_write_warned = false;

        let mut acc = OutputAccumulator::new();

        if let Some(out) = stdout {
            let mut reader = BufReader::with_capacity(STDOUT_BUFFER, out).lines();
            let mut kill_sent = false;
            loop {
                let next = if kill_sent {
                    reader.next_line().await
                } else {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            let _ = child.start_kill();
                            kill_sent = true;
                            continue;
                        }
                        line = reader.next_line() => line,
                    }
                };

                match next {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Some(file) = log_file.as_mut() {
                            let mut bytes = line.clone().into_bytes();
                            bytes.push(b'\n');
                            if let Err(e) = file.write_all(&bytes).await {
                                if !log_write_warned {
                                    log_write_warned = true;
                                    sink.on_log(
                                        task.id,
                                        LogLevel::Warn,
                                        format!("log file write failed: {}", e),
                                    )
                                    .await;
                                }
                            }
                        }
                        let event = parse_line(&line);
                        acc.observe(&event);
                        sink.on_output(task.id, TaskOutput { event, raw: line }).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        sink.on_log(
                            task.id,
                            LogLevel::Warn,
                            format!("stdout read failed: {}", e),
                        )
                        .await;
                        break;
                    }
                }
            }
            if let Some(file) = log_file.as_mut() {
                let _ = file.flush().await;
            }
        }

        let wait_result = child.wait().await;
        let stderr_text = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        // If our map entry is already gone, cancel() won the race and the
        // child was killed on request.
        let was_active = self.active.lock().unwrap().remove(&task.id).is_some();
        let cancelled = !was_active;

        let exit_code = wait_result.as_ref().ok().and_then(|s| s.code());
        let fin = acc.finalize(task.mode);

        let result = if cancelled {
            self.workspaces
                .remove_workspace(&workdir, &branch, true, repo_override)
                .await;
            TaskResult {
                status: TaskStatus::Cancelled,
                exit_code,
                output: fin.output,
                plan: fin.plan,
                error: None,
                input_tokens: fin.input_tokens,
                output_tokens: fin.output_tokens,
                cost_usd: fin.cost_usd,
            }
        } else if exit_code == Some(0) {
            // Success keeps the workspace: it holds the committed work.
            TaskResult {
                status: TaskStatus::Completed,
                exit_code,
                output: fin.output,
                plan: fin.plan,
                error: None,
                input_tokens: fin.input_tokens,
                output_tokens: fin.output_tokens,
                cost_usd: fin.cost_usd,
            }
        } else {
            self.workspaces
                .remove_workspace(&workdir, &branch, true, repo_override)
                .await;
            let error = if !stderr_text.trim().is_empty() {
                stderr_text.trim().to_string()
            } else {
                match &wait_result {
                    Ok(status) => format!("agent exited with status {:?}", status.code()),
                    Err(e) => format!("failed to wait for agent: {}", e),
                }
            };
            TaskResult {
                status: TaskStatus::Failed,
                exit_code: exit_code.or(Some(1)),
                output: fin.output,
                plan: fin.plan,
                error: Some(error),
                input_tokens: fin.input_tokens,
                output_tokens: fin.output_tokens,
                cost_usd: fin.cost_usd,
            }
        };

        sink.on_complete(task.id, result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskStatus};

    fn sample_task(mode: TaskMode) -> Task {
        Task {
            id: 1,
            title: "t".to_string(),
            prompt: "do the thing".to_string(),
            status: TaskStatus::Pending,
            mode,
            priority: TaskPriority::Medium,
            branch: None,
            working_directory: None,
            output: None,
            plan: None,
            error: None,
            exit_code: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            depends_on: vec![],
            repo_path: None,
            tags: vec![],
            created_at: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn execute_prompt_is_user_prompt_plus_workflow() {
        let prompt = compose_prompt(&sample_task(TaskMode::Execute));
        assert!(prompt.starts_with("do the thing"));
        assert!(prompt.contains("commit your changes"));
        assert!(!prompt.contains(PLAN_SENTINEL));
    }

    #[test]
    fn plan_prompt_prepends_sentinel_instructions() {
        let prompt = compose_prompt(&sample_task(TaskMode::Plan));
        assert!(prompt.starts_with("IMPORTANT:"));
        assert!(prompt.contains(PLAN_SENTINEL));
        assert!(prompt.contains("do the thing"));
    }
}
