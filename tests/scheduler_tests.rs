//! End-to-end scheduler tests against a stub agent and a real git repository.
//!
//! The agent executable is a shell script that emits the same stream-json
//! events the real CLI would, so the full dispatch → workspace → stream →
//! finalize path runs without any network access.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use agent_dispatch::db::Database;
use agent_dispatch::executor::TaskExecutor;
use agent_dispatch::hub::EventHub;
use agent_dispatch::scheduler::Scheduler;
use agent_dispatch::types::{CreateTaskRequest, Task, TaskMode, TaskPriority, TaskStatus};
use agent_dispatch::workspace::WorkspaceManager;
use serde_json::Value;
use tokio::time::Instant;

const HAPPY_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","model":"stub-model"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","result":"hi","usage":{"input_tokens":10,"output_tokens":5},"total_cost_usd":0.01}'
exit 0
"#;

const SLOW_AGENT: &str = r#"#!/bin/sh
sleep 0.4
echo '{"type":"result","result":"done","usage":{"input_tokens":1,"output_tokens":1},"total_cost_usd":0.001}'
exit 0
"#;

const FOREVER_AGENT: &str = r#"#!/bin/sh
while true; do
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"still going"}]}}'
  sleep 0.05
done
"#;

const PLAN_AGENT: &str = r#"#!/bin/sh
echo '{"type":"result","result":"the plan\n---PLAN END---\nthe impl"}'
exit 0
"#;

const FAILING_AGENT: &str = r#"#!/bin/sh
echo "agent blew up" >&2
exit 3
"#;

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    if !out.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    db: Database,
    hub: EventHub,
    executor: Arc<TaskExecutor>,
    repo: PathBuf,
    worktrees: PathBuf,
}

impl Fixture {
    /// Build a git repo, a stub agent script and the execution stack around
    /// them. `git_repo` controls whether the base directory is a real repo.
    fn new(agent_script: &str, git_repo: bool) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");

        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).expect("mkdir repo");
        if git_repo {
            run_git(&repo, &["init"]);
            run_git(&repo, &["config", "user.email", "test@example.com"]);
            run_git(&repo, &["config", "user.name", "Test"]);
            std::fs::write(repo.join("README.md"), "hello\n").expect("write");
            run_git(&repo, &["add", "."]);
            run_git(&repo, &["commit", "-m", "init"]);
        }

        let agent = tmp.path().join("agent.sh");
        std::fs::write(&agent, agent_script).expect("write agent script");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755))
                .expect("chmod agent script");
        }

        let worktrees = tmp.path().join("worktrees");
        let log_dir = tmp.path().join("logs");
        std::fs::create_dir_all(&log_dir).expect("mkdir logs");

        let db = Database::open_in_memory().expect("db");
        let hub = EventHub::new();
        let workspaces = WorkspaceManager::new(repo.clone(), worktrees.clone());
        let executor = Arc::new(TaskExecutor::new(
            workspaces,
            log_dir,
            agent.to_string_lossy().to_string(),
        ));

        Self {
            _tmp: tmp,
            db,
            hub,
            executor,
            repo,
            worktrees,
        }
    }

    /// Start a scheduler with a fast poll interval; returns its task handle.
    fn start_scheduler(&self, max_concurrent: usize) -> tokio::task::JoinHandle<()> {
        let scheduler = Scheduler::new(
            self.db.clone(),
            Arc::clone(&self.executor),
            self.hub.clone(),
            max_concurrent,
            Duration::from_millis(50),
        );
        tokio::spawn(scheduler.run())
    }

    fn create(&self, title: &str, mode: TaskMode, depends_on: Vec<i64>) -> Task {
        self.db
            .create_task(&CreateTaskRequest {
                title: title.to_string(),
                prompt: "do the thing".to_string(),
                mode,
                priority: TaskPriority::Medium,
                depends_on,
                repo_path: None,
                tags: vec![],
            })
            .expect("create task")
    }

    fn branch_exists(&self, branch: &str) -> bool {
        let out = Command::new("git")
            .args(["branch", "--list", branch])
            .current_dir(&self.repo)
            .output()
            .expect("git branch");
        !String::from_utf8_lossy(&out.stdout).trim().is_empty()
    }
}

async fn wait_for<F>(db: &Database, task_id: i64, timeout: Duration, predicate: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let task = db
            .get_task(task_id)
            .expect("get_task")
            .expect("task exists");
        if predicate(&task) {
            return task;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting on task {} (status {:?})",
                task_id, task.status
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn happy_path_completes_with_usage_and_events() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(HAPPY_AGENT, true);
    let (_, mut observer) = fx.hub.attach();
    let scheduler = fx.start_scheduler(3);

    let task = fx.create("t", TaskMode::Execute, vec![]);

    let task = wait_for(&fx.db, task.id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Completed
    })
    .await;

    assert_eq!(task.exit_code, Some(0));
    assert!(task.output.as_deref().unwrap_or("").contains("hi"));
    assert_eq!(task.input_tokens, Some(10));
    assert_eq!(task.output_tokens, Some(5));
    assert_eq!(task.cost_usd, Some(0.01));
    let started = task.started_at.expect("started_at set");
    let completed = task.completed_at.expect("completed_at set");
    assert!(task.created_at <= started && started <= completed);

    // Success keeps the workspace: it holds the committed work.
    let workdir = PathBuf::from(task.working_directory.as_deref().unwrap());
    assert!(workdir.exists());
    assert!(workdir.starts_with(&fx.worktrees));

    // Observer saw the dispatch, at least one output event, and completion.
    let mut saw_state = false;
    let mut saw_output = false;
    let mut complete: Option<Value> = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while complete.is_none() && Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), observer.recv()).await {
            Ok(Some(message)) => {
                let payload: Value = serde_json::from_str(&message).unwrap();
                assert_eq!(payload["task_id"], task.id);
                match payload["type"].as_str() {
                    Some("state") if payload["status"] == "in_progress" => saw_state = true,
                    Some("output") => saw_output = true,
                    Some("complete") => complete = Some(payload),
                    _ => {}
                }
            }
            _ => break,
        }
    }
    assert!(saw_state, "observer missed the in_progress state event");
    assert!(saw_output, "observer missed output events");
    let complete = complete.expect("observer missed the complete event");
    assert_eq!(complete["status"], "completed");
    assert_eq!(complete["exit_code"], 0);
    assert_eq!(complete["input_tokens"], 10);
    assert_eq!(complete["output_tokens"], 5);
    assert_eq!(complete["cost"], 0.01);

    scheduler.abort();
}

#[tokio::test]
async fn dependent_task_waits_for_its_dependency() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(HAPPY_AGENT, true);
    let scheduler = fx.start_scheduler(5);

    let a = fx.create("a", TaskMode::Execute, vec![]);
    let b = fx.create("b", TaskMode::Execute, vec![a.id]);

    // B must never start while A is unfinished.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let b_now = fx.db.get_task(b.id).unwrap().unwrap();
        let a_now = fx.db.get_task(a.id).unwrap().unwrap();
        if a_now.status != TaskStatus::Completed {
            assert_eq!(
                b_now.status,
                TaskStatus::Pending,
                "dependent task started before its dependency completed"
            );
        }
        if b_now.status == TaskStatus::Completed {
            break;
        }
        if Instant::now() > deadline {
            panic!("dependency chain did not finish");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let a = fx.db.get_task(a.id).unwrap().unwrap();
    let b = fx.db.get_task(b.id).unwrap().unwrap();
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());

    scheduler.abort();
}

#[tokio::test]
async fn concurrency_cap_is_never_exceeded() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(SLOW_AGENT, true);
    let scheduler = fx.start_scheduler(3);

    let ids: Vec<i64> = (0..5)
        .map(|i| fx.create(&format!("t{}", i), TaskMode::Execute, vec![]).id)
        .collect();

    let mut max_active = 0i64;
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let active = fx.db.count_tasks(TaskStatus::InProgress).unwrap();
        assert!(active <= 3, "concurrency bound violated: {} active", active);
        max_active = max_active.max(active);

        let completed = fx.db.count_tasks(TaskStatus::Completed).unwrap();
        if completed == ids.len() as i64 {
            break;
        }
        if Instant::now() > deadline {
            panic!("tasks did not finish; {} completed", completed);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(max_active, 3, "scheduler never saturated its slots");

    scheduler.abort();
}

#[tokio::test]
async fn zero_concurrency_dispatches_nothing() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(HAPPY_AGENT, true);
    let scheduler = fx.start_scheduler(0);

    let task = fx.create("t", TaskMode::Execute, vec![]);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let task = fx.db.get_task(task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.started_at, None);

    scheduler.abort();
}

#[tokio::test]
async fn cancel_mid_run_removes_workspace_and_branch() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(FOREVER_AGENT, true);
    let scheduler = fx.start_scheduler(3);

    let task = fx.create("endless", TaskMode::Execute, vec![]);

    wait_for(&fx.db, task.id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::InProgress
    })
    .await;
    // Let at least one event arrive before pulling the plug.
    let deadline = Instant::now() + Duration::from_secs(10);
    while fx.db.get_task_logs(task.id).unwrap().is_empty() {
        if Instant::now() > deadline {
            panic!("no output from the stub agent");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fx.executor.cancel(task.id);

    let task = wait_for(&fx.db, task.id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Cancelled
    })
    .await;

    assert!(task.completed_at.is_some());
    let workdir = PathBuf::from(task.working_directory.as_deref().unwrap());
    assert!(!workdir.exists(), "cancelled workspace should be removed");
    assert!(
        !fx.branch_exists(task.branch.as_deref().unwrap()),
        "cancelled branch should be deleted"
    );

    scheduler.abort();
}

#[tokio::test]
async fn plan_mode_splits_plan_from_output() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(PLAN_AGENT, true);
    let scheduler = fx.start_scheduler(3);

    let task = fx.create("plan me", TaskMode::Plan, vec![]);

    let task = wait_for(&fx.db, task.id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Completed
    })
    .await;

    assert_eq!(task.plan.as_deref(), Some("the plan"));
    assert_eq!(task.output.as_deref(), Some("the impl"));

    scheduler.abort();
}

#[tokio::test]
async fn failing_agent_marks_task_failed_and_cleans_up() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let fx = Fixture::new(FAILING_AGENT, true);
    let scheduler = fx.start_scheduler(3);

    let task = fx.create("doomed", TaskMode::Execute, vec![]);

    let task = wait_for(&fx.db, task.id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Failed
    })
    .await;

    assert_eq!(task.exit_code, Some(3));
    assert!(task.error.as_deref().unwrap().contains("agent blew up"));
    let workdir = PathBuf::from(task.working_directory.as_deref().unwrap());
    assert!(!workdir.exists(), "failed workspace should be removed");
    assert!(!fx.branch_exists(task.branch.as_deref().unwrap()));

    scheduler.abort();
}

#[tokio::test]
async fn workspace_failure_fails_task_without_running_agent() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    // Base directory exists but is not a git repository.
    let fx = Fixture::new(HAPPY_AGENT, false);
    let scheduler = fx.start_scheduler(3);

    let task = fx.create("no repo", TaskMode::Execute, vec![]);

    let task = wait_for(&fx.db, task.id, Duration::from_secs(10), |t| {
        t.status == TaskStatus::Failed
    })
    .await;

    assert_eq!(task.exit_code, Some(1));
    assert!(task
        .error
        .as_deref()
        .unwrap()
        .contains("workspace creation failed"));
    // The agent never ran: no usage, no output.
    assert_eq!(task.input_tokens, None);
    assert_eq!(task.output, None);

    scheduler.abort();
}
