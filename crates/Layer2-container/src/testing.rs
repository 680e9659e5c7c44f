//! Scripted in-memory engine for tests
//!
//! `RecordingEngine` keeps a trace of every call and interprets a small
//! subset of shell so that command sequences behave plausibly:
//!
//! | script              | result                       |
//! |---------------------|------------------------------|
//! | `echo X`            | stdout `X\n`, exit 0         |
//! | `echo X >&2`        | stderr `X\n`, exit 0         |
//! | `true` / `false`    | exit 0 / exit 1              |
//! | `exit N`            | exit N                       |
//! | `sleep N`           | waits N seconds, exit 0      |
//! | `a && b`            | runs `b` only if `a` exits 0 |
//! | anything else       | no output, exit 0            |
//!
//! Canned responses and per-operation failures can be injected.

use crate::config::ContainerConfig;
use crate::engine::{ContainerEngine, EngineError, EngineResult, ExecOutput};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Engine operations, for failure injection and trace queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Run,
    Exec,
    Inspect,
    Logs,
    Stop,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Run {
        name: String,
        image: String,
        args: Vec<String>,
    },
    Exec {
        runtime_id: String,
        argv: Vec<String>,
        working_dir: Option<String>,
    },
    Inspect(String),
    Logs(String),
    Stop(String),
    Remove(String),
}

impl EngineCall {
    pub fn operation(&self) -> Operation {
        match self {
            EngineCall::Run { .. } => Operation::Run,
            EngineCall::Exec { .. } => Operation::Exec,
            EngineCall::Inspect(_) => Operation::Inspect,
            EngineCall::Logs(_) => Operation::Logs,
            EngineCall::Stop(_) => Operation::Stop,
            EngineCall::Remove(_) => Operation::Remove,
        }
    }
}

#[derive(Debug, Default)]
struct LiveContainer {
    auto_remove: bool,
    stopped: bool,
    output: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    live: Mutex<HashMap<String, LiveContainer>>,
    failures: Mutex<HashMap<Operation, String>>,
    exec_failures: Mutex<Vec<(String, String)>>,
    responses: Mutex<Vec<(String, ExecOutput)>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail with `message` as engine stderr
    pub fn fail(&self, operation: Operation, message: impl Into<String>) {
        self.failures.lock().insert(operation, message.into());
    }

    pub fn clear_failure(&self, operation: Operation) {
        self.failures.lock().remove(&operation);
    }

    /// Fail execs whose command line contains `pattern`
    pub fn fail_exec_matching(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.exec_failures.lock().push((pattern.into(), message.into()));
    }

    /// Canned output for execs whose command line contains `pattern`
    pub fn respond(&self, pattern: impl Into<String>, output: ExecOutput) {
        self.responses.lock().push((pattern.into(), output));
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    /// Argument vectors of every exec, in call order
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                EngineCall::Exec { argv, .. } => Some(argv.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether any exec command line contains `needle`
    pub fn executed(&self, needle: &str) -> bool {
        self.exec_commands()
            .iter()
            .any(|argv| argv.join(" ").contains(needle))
    }

    /// Engine ids of containers that have not been removed
    pub fn live_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn record(&self, call: EngineCall) -> EngineResult<()> {
        let operation = call.operation();
        self.calls.lock().push(call);
        match self.failures.lock().get(&operation) {
            Some(message) => Err(EngineError::CommandFailed {
                operation: format!("{:?}", operation).to_lowercase(),
                code: Some(1),
                stderr: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn ensure_live(&self, runtime_id: &str) -> EngineResult<()> {
        if self.live.lock().contains_key(runtime_id) {
            Ok(())
        } else {
            Err(EngineError::NoSuchContainer(runtime_id.to_string()))
        }
    }

    fn ensure_running(&self, runtime_id: &str) -> EngineResult<()> {
        match self.live.lock().get(runtime_id) {
            Some(container) if container.stopped => Err(EngineError::CommandFailed {
                operation: "exec".to_string(),
                code: Some(126),
                stderr: format!("container {} is not running", runtime_id),
            }),
            Some(_) => Ok(()),
            None => Err(EngineError::NoSuchContainer(runtime_id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn run(&self, config: &ContainerConfig) -> EngineResult<String> {
        self.record(EngineCall::Run {
            name: config.name.clone(),
            image: config.image.clone(),
            args: config.build_run_args(),
        })?;

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let runtime_id = format!("fake-{}", n);
        self.live.lock().insert(
            runtime_id.clone(),
            LiveContainer {
                auto_remove: config.auto_remove,
                ..LiveContainer::default()
            },
        );
        Ok(runtime_id)
    }

    async fn exec(
        &self,
        runtime_id: &str,
        argv: &[String],
        working_dir: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        self.record(EngineCall::Exec {
            runtime_id: runtime_id.to_string(),
            argv: argv.to_vec(),
            working_dir: working_dir.map(String::from),
        })?;
        self.ensure_running(runtime_id)?;

        let line = argv.join(" ");
        let injected = self
            .exec_failures
            .lock()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, message)| message.clone());
        if let Some(message) = injected {
            return Err(EngineError::CommandFailed {
                operation: "exec".to_string(),
                code: Some(126),
                stderr: message,
            });
        }

        let canned = self
            .responses
            .lock()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone());

        let output = match canned {
            Some(output) => output,
            None => match argv {
                [sh, flag, script] if sh == "sh" && flag == "-c" => run_script(script).await,
                _ => run_argv(argv),
            },
        };

        if let Some(container) = self.live.lock().get_mut(runtime_id) {
            container.output.extend(output.stdout.lines().map(String::from));
        }
        Ok(output)
    }

    async fn inspect_address(&self, runtime_id: &str) -> EngineResult<String> {
        self.record(EngineCall::Inspect(runtime_id.to_string()))?;
        self.ensure_live(runtime_id)?;
        let n = runtime_id
            .trim_start_matches("fake-")
            .parse::<u64>()
            .unwrap_or(0);
        Ok(format!("172.17.0.{}", n + 1))
    }

    async fn logs(&self, runtime_id: &str) -> EngineResult<Vec<String>> {
        self.record(EngineCall::Logs(runtime_id.to_string()))?;
        self.live
            .lock()
            .get(runtime_id)
            .map(|c| c.output.clone())
            .ok_or_else(|| EngineError::NoSuchContainer(runtime_id.to_string()))
    }

    async fn stop(&self, runtime_id: &str, _timeout: Duration) -> EngineResult<()> {
        self.record(EngineCall::Stop(runtime_id.to_string()))?;
        let mut live = self.live.lock();
        let auto_remove = match live.get_mut(runtime_id) {
            Some(container) => {
                container.stopped = true;
                container.auto_remove
            }
            None => return Err(EngineError::NoSuchContainer(runtime_id.to_string())),
        };
        if auto_remove {
            live.remove(runtime_id);
        }
        Ok(())
    }

    async fn remove(&self, runtime_id: &str) -> EngineResult<()> {
        self.record(EngineCall::Remove(runtime_id.to_string()))?;
        match self.live.lock().remove(runtime_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NoSuchContainer(runtime_id.to_string())),
        }
    }
}

async fn run_script(script: &str) -> ExecOutput {
    let mut result = ExecOutput::default();
    for step in script.split("&&") {
        let step_output = run_step(step.trim()).await;
        result.stdout.push_str(&step_output.stdout);
        result.stderr.push_str(&step_output.stderr);
        result.exit_code = step_output.exit_code;
        if result.exit_code != 0 {
            break;
        }
    }
    result
}

async fn run_step(step: &str) -> ExecOutput {
    let mut output = ExecOutput::default();
    let (program, rest) = match step.split_once(' ') {
        Some((program, rest)) => (program, rest.trim()),
        None => (step, ""),
    };

    match program {
        "echo" => match rest.strip_suffix(">&2") {
            Some(text) => output.stderr = format!("{}\n", unquote(text.trim())),
            None => output.stdout = format!("{}\n", unquote(rest)),
        },
        "false" => output.exit_code = 1,
        "exit" => output.exit_code = rest.parse().unwrap_or(1),
        "sleep" => {
            let secs = rest.parse::<f64>().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
        }
        _ => {}
    }
    output
}

fn run_argv(argv: &[String]) -> ExecOutput {
    let mut output = ExecOutput::default();
    match argv.first().map(String::as_str) {
        Some("echo") => output.stdout = format!("{}\n", argv[1..].join(" ")),
        Some("false") => output.exit_code = 1,
        _ => {}
    }
    output
}

fn unquote(text: &str) -> &str {
    let quoted = text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"'))
            || (text.starts_with('\'') && text.ends_with('\'')));
    if quoted {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerOverrides;
    use crucible_foundation::ContainerDefaults;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn started(engine: &RecordingEngine) -> String {
        let config =
            ContainerConfig::resolve(&ContainerDefaults::default(), ContainerOverrides::new())
                .unwrap();
        engine.run(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_script_interpretation() {
        let engine = RecordingEngine::new();
        let id = started(&engine).await;

        let out = engine.exec(&id, &sh("echo hi"), None).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.exit_code, 0);

        let out = engine.exec(&id, &sh("echo 'oops' >&2"), None).await.unwrap();
        assert_eq!(out.stderr, "oops\n");
        assert!(out.stdout.is_empty());

        let out = engine.exec(&id, &sh("exit 3"), None).await.unwrap();
        assert_eq!(out.exit_code, 3);

        let out = engine.exec(&id, &sh("false && echo never"), None).await.unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_trace_and_lifecycle() {
        let engine = RecordingEngine::new();
        let id = started(&engine).await;
        assert_eq!(id, "fake-1");
        assert_eq!(engine.inspect_address(&id).await.unwrap(), "172.17.0.2");

        engine.stop(&id, Duration::from_secs(1)).await.unwrap();
        engine.remove(&id).await.unwrap();
        assert!(engine.live_containers().is_empty());

        let err = engine.exec(&id, &sh("true"), None).await.unwrap_err();
        assert!(err.is_no_such_container());

        assert_eq!(engine.count(Operation::Run), 1);
        assert_eq!(engine.count(Operation::Exec), 1);
        assert!(matches!(engine.calls()[0], EngineCall::Run { .. }));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let engine = RecordingEngine::new();
        engine.fail(Operation::Run, "pull access denied");

        let config =
            ContainerConfig::resolve(&ContainerDefaults::default(), ContainerOverrides::new())
                .unwrap();
        let err = engine.run(&config).await.unwrap_err();
        assert!(err.to_string().contains("pull access denied"));

        engine.clear_failure(Operation::Run);
        let id = engine.run(&config).await.unwrap();

        engine.fail_exec_matching("git clone", "daemon hung up");
        let argv: Vec<String> = ["git", "clone", "--", "x"].iter().map(|s| s.to_string()).collect();
        assert!(engine.exec(&id, &argv, None).await.is_err());
        assert!(engine.executed("git clone"));
    }
}
