//! TaskAgent end to end against the recording engine

use crucible_agent::{
    SandboxRuntime, StatusBoard, StatusSink, TaskAgent, TaskKind, TaskRequirements, TaskSpec,
    TaskStatus,
};
use crucible_container::testing::{Operation, RecordingEngine};
use crucible_container::{CommandStatus, ExecOutput};
use crucible_foundation::{Error, EventBus, SandboxConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> (Arc<RecordingEngine>, SandboxRuntime) {
    runtime_with(SandboxConfig::default())
}

fn runtime_with(config: SandboxConfig) -> (Arc<RecordingEngine>, SandboxRuntime) {
    let engine = Arc::new(RecordingEngine::new());
    let runtime = SandboxRuntime::with_engine(config, engine.clone());
    (engine, runtime)
}

fn event_types(bus: &EventBus) -> Vec<String> {
    let mut types: Vec<String> = bus.history(None).into_iter().map(|e| e.event_type).collect();
    types.reverse();
    types
}

#[tokio::test]
async fn test_failing_command_fails_task_and_removes_container() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "fails").with_command("exit 1"))
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].exit_code, Some(1));
    assert_eq!(report.failure_reason.as_deref(), Some("1 of 1 commands failed"));

    let metrics = agent.metrics();
    assert_eq!(metrics.tasks_failed, 1);
    assert_eq!(metrics.tasks_completed, 0);
    assert_eq!(metrics.containers_created, 1);
    assert_eq!(metrics.containers_destroyed, 1);

    assert!(runtime.manager().list().await.is_empty());
    assert!(engine.live_containers().is_empty());
    assert!(event_types(runtime.bus()).contains(&"task.failed".to_string()));
}

#[tokio::test]
async fn test_successful_task_reports_every_command() {
    let (_engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(
            TaskSpec::new(TaskKind::Testing, "passes")
                .with_commands(["echo one", "echo two >&2", "true"]),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[0].stdout, "one\n");
    assert_eq!(report.results[1].stderr, "two\n");
    assert!(report.setup_results.is_empty());
    assert!(report.container_id.is_some());
    assert!(report.logs.lines().iter().any(|l| l.contains("one")));

    let metrics = agent.metrics();
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(
        metrics.average_task_duration,
        metrics.total_execution_time / metrics.tasks_completed as u32
    );

    let types = event_types(runtime.bus());
    let started = types.iter().position(|t| t == "task.started").unwrap();
    let destroyed = types.iter().position(|t| t == "container.destroyed").unwrap();
    let completed = types.iter().position(|t| t == "task.completed").unwrap();
    assert!(started < destroyed && destroyed < completed);
    assert_eq!(types.iter().filter(|t| *t == "task.log").count(), 3);
}

#[tokio::test]
async fn test_no_repository_means_no_clone() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "plain").with_command("true"))
        .await
        .unwrap();

    assert!(!engine.executed("git clone"));
    assert!(!engine.executed("apt-get install"));
}

#[tokio::test]
async fn test_repository_analysis_clones_and_installs_tooling() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(
            TaskSpec::new(TaskKind::RepositoryAnalysis, "analyse")
                .with_repository("https://github.com/example/project.git")
                .with_command("ls"),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.setup_results.len(), 2);

    let execs = engine.exec_commands();
    let clone = execs
        .iter()
        .position(|argv| argv.first().map(String::as_str) == Some("git"))
        .unwrap();
    let tooling = execs
        .iter()
        .position(|argv| argv.join(" ").contains("apt-get install"))
        .unwrap();
    let task = execs.iter().position(|argv| argv.join(" ") == "sh -c ls").unwrap();
    assert!(clone < tooling && tooling < task);
    assert_eq!(
        execs[clone],
        vec!["git", "clone", "--", "https://github.com/example/project.git", "/workspace"]
    );
}

#[tokio::test]
async fn test_setup_failure_skips_commands() {
    let (engine, runtime) = runtime();
    engine.respond(
        "git clone",
        ExecOutput {
            stdout: String::new(),
            stderr: "fatal: repository not found".to_string(),
            exit_code: 128,
        },
    );
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(
            TaskSpec::new(TaskKind::Testing, "clone fails")
                .with_repository("https://github.com/example/missing.git")
                .with_commands(["make test", "make lint"]),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.status == CommandStatus::Skipped));
    assert!(report.failure_reason.unwrap().starts_with("setup step `git clone"));
    assert!(!engine.executed("make test"));
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn test_invalid_repository_rejected_before_engine() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let err = agent
        .execute_task(
            TaskSpec::new(TaskKind::Custom, "inject")
                .with_repository("--upload-pack=touch /tmp/pwned")
                .with_command("true"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(engine.calls().is_empty());
    assert_eq!(agent.metrics().tasks_failed, 0);
}

#[tokio::test]
async fn test_concurrent_tasks_get_distinct_containers() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let (a, b) = tokio::join!(
        agent.execute_task(TaskSpec::new(TaskKind::Custom, "a").with_command("echo a")),
        agent.execute_task(TaskSpec::new(TaskKind::Custom, "b").with_command("echo b")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.is_success() && b.is_success());
    assert_eq!(a.spec.description, "a");
    assert_eq!(a.results[0].stdout, "a\n");
    assert_eq!(b.spec.description, "b");
    assert_eq!(b.results[0].stdout, "b\n");
    assert_ne!(a.container_id, b.container_id);
    assert_ne!(a.id, b.id);
    assert_eq!(engine.count(Operation::Run), 2);

    let metrics = agent.metrics();
    assert_eq!(metrics.containers_created, 2);
    assert_eq!(metrics.containers_destroyed, 2);
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn test_deadline_fails_task_and_pads_results() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(
            TaskSpec::new(TaskKind::Custom, "slow")
                .with_commands(["echo fast", "sleep 5", "echo never"])
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failure_reason.as_deref(), Some("deadline exceeded"));
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[0].status, CommandStatus::Succeeded);
    assert_eq!(report.results[1].status, CommandStatus::TimedOut);
    assert_eq!(report.results[2].status, CommandStatus::Skipped);
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn test_cancel_all_stops_running_task() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let worker = agent.clone();
    let handle = tokio::spawn(async move {
        worker
            .execute_task(
                TaskSpec::new(TaskKind::Custom, "long").with_commands(["sleep 5", "echo b"]),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agent.get_status().await.active_tasks, 1);
    agent.cancel_all();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(report.results[0].status, CommandStatus::Cancelled);
    assert_eq!(report.results[1].status, CommandStatus::Skipped);
    assert!(engine.live_containers().is_empty());

    // The agent keeps accepting work
    let next = agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "after").with_command("true"))
        .await
        .unwrap();
    assert!(next.is_success());
}

#[tokio::test]
async fn test_creation_failure_returns_error() {
    let (engine, runtime) = runtime();
    engine.fail(Operation::Run, "pull access denied");
    let agent = runtime.spawn_agent();

    let err = agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "x").with_command("true"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Engine { .. }));
    let metrics = agent.metrics();
    assert_eq!(metrics.tasks_failed, 1);
    assert_eq!(metrics.containers_created, 0);

    let types = event_types(runtime.bus());
    assert!(types.contains(&"container.failed".to_string()));
    assert!(types.contains(&"task.failed".to_string()));
    assert!(!types.contains(&"task.started".to_string()));
}

#[tokio::test]
async fn test_deadline_during_creation_is_timeout() {
    let mut config = SandboxConfig::default();
    config.container.bootstrap = vec!["sleep 5".to_string()];
    let (engine, runtime) = runtime_with(config);
    let agent = runtime.spawn_agent();

    let err = agent
        .execute_task(
            TaskSpec::new(TaskKind::Custom, "slow boot")
                .with_command("true")
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(agent.metrics().tasks_failed, 1);
    assert!(runtime.manager().list().await.is_empty());
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn test_huge_timeout_means_no_deadline() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    let spec = TaskSpec::from_json_str(
        r#"{
            "kind": "custom",
            "description": "unbounded",
            "commands": ["echo ok"],
            "timeout_secs": 18446744073709551615
        }"#,
    )
    .unwrap();
    assert_eq!(spec.timeout_secs, Some(u64::MAX));

    let report = agent.execute_task(spec).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.results[0].stdout, "ok\n");
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn test_huge_configured_task_timeout_runs() {
    let mut config = SandboxConfig::default();
    config.execution.task_timeout_secs = u64::MAX;
    let (_engine, runtime) = runtime_with(config);
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "x").with_command("true"))
        .await
        .unwrap();
    assert!(report.is_success());
}

#[tokio::test]
async fn test_half_started_container_is_torn_down() {
    let (engine, runtime) = runtime();
    engine.respond(
        "apt-get update",
        ExecOutput {
            stdout: String::new(),
            stderr: "Temporary failure resolving".to_string(),
            exit_code: 100,
        },
    );
    let agent = runtime.spawn_agent();

    assert!(agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "x").with_command("true"))
        .await
        .is_err());

    assert!(engine.live_containers().is_empty());
    assert!(runtime.manager().list().await.is_empty());
}

#[tokio::test]
async fn test_engine_error_mid_task_is_returned_after_cleanup() {
    let (engine, runtime) = runtime();
    engine.fail_exec_matching("make test", "connection reset by peer");
    let agent = runtime.spawn_agent();

    let err = agent
        .execute_task(TaskSpec::new(TaskKind::Testing, "x").with_command("make test"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Engine { .. }));
    assert!(engine.live_containers().is_empty());
    assert_eq!(agent.metrics().tasks_failed, 1);
    assert_eq!(agent.get_status().await.active_containers, 0);
}

#[tokio::test]
async fn test_language_requirement_selects_image() {
    let (engine, runtime) = runtime();
    let agent = runtime.spawn_agent();

    agent
        .execute_task(
            TaskSpec::new(TaskKind::Testing, "py").with_command("true").with_requirements(
                TaskRequirements {
                    language: Some("python".to_string()),
                    memory: Some("1g".to_string()),
                    ..TaskRequirements::default()
                },
            ),
        )
        .await
        .unwrap();

    let run = engine
        .calls()
        .into_iter()
        .find_map(|call| match call {
            crucible_container::testing::EngineCall::Run { image, args, .. } => Some((image, args)),
            _ => None,
        })
        .unwrap();
    assert_eq!(run.0, "python:3.12-slim");
    assert!(run.1.windows(2).any(|w| w[0] == "--memory" && w[1] == "1g"));
}

#[tokio::test]
async fn test_completion_callback_sees_every_report() {
    let engine = Arc::new(RecordingEngine::new());
    let runtime = SandboxRuntime::with_engine(SandboxConfig::default(), engine);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    let agent = TaskAgent::new(
        runtime.manager().clone(),
        runtime.bus().clone(),
        Arc::new(SandboxConfig::default()),
    )
    .with_completion_callback(move |_report| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "ok").with_command("true"))
        .await
        .unwrap();
    agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "bad").with_command("false"))
        .await
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_status_board_follows_agent() {
    let (_engine, runtime) = runtime();
    let board = Arc::new(StatusBoard::new());
    runtime.subscribe_status(board.clone());

    let agent = runtime.spawn_agent();
    agent
        .execute_task(TaskSpec::new(TaskKind::Custom, "watched").with_command("echo hi"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let entry = board.get(agent.id()).unwrap();
    assert_eq!(entry.state(), Some("completed"));
    assert!(entry.logs.iter().any(|l| l.contains("Task started: watched")));
    assert!(entry.logs.iter().any(|l| l.contains("echo hi")));

    agent.retire().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(board.list_active().is_empty());
}

#[tokio::test]
async fn test_shutdown_destroys_leftovers() {
    let (engine, runtime) = runtime();
    runtime
        .manager()
        .create(crucible_container::ContainerOverrides::new())
        .await
        .unwrap();

    assert_eq!(runtime.shutdown("test").await, 1);
    assert!(engine.live_containers().is_empty());
    assert_eq!(event_types(runtime.bus()).last().map(String::as_str), Some("system.shutdown"));
}

#[tokio::test]
async fn test_halt_on_error_from_config() {
    let mut config = SandboxConfig::default();
    config.execution.halt_on_error = true;
    let (engine, runtime) = runtime_with(config);
    let agent = runtime.spawn_agent();

    let report = agent
        .execute_task(
            TaskSpec::new(TaskKind::Custom, "halt").with_commands(["false", "echo after"]),
        )
        .await
        .unwrap();

    assert_eq!(report.results[1].status, CommandStatus::Skipped);
    assert!(!engine.executed("echo after"));
}
