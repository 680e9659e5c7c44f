//! Commands run inside a container and their captured outcomes

use crucible_foundation::{Error, ExecutionSettings, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// CommandSpec
// ============================================================================

/// One unit of work inside a container
///
/// `Shell` is handed to `sh -c` as a single argument; `Exec` is an argument
/// vector run without a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandSpec {
    pub fn shell(script: impl Into<String>) -> Self {
        CommandSpec::Shell(script.into())
    }

    pub fn exec<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Exec(argv.into_iter().map(Into::into).collect())
    }

    /// Argument vector handed to the engine's exec
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(script) => {
                vec!["sh".to_string(), "-c".to_string(), script.clone()]
            }
            CommandSpec::Exec(argv) => argv.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let empty = match self {
            CommandSpec::Shell(script) => script.trim().is_empty(),
            CommandSpec::Exec(argv) => argv.first().map_or(true, |p| p.is_empty()),
        };
        if empty {
            return Err(Error::Validation("command is empty".to_string()));
        }
        if self.argv().iter().any(|arg| arg.contains('\0')) {
            return Err(Error::Validation(format!(
                "command contains a NUL byte: {}",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Shell(script) => f.write_str(script),
            CommandSpec::Exec(argv) => match shlex::try_join(argv.iter().map(String::as_str)) {
                Ok(joined) => f.write_str(&joined),
                Err(_) => f.write_str(&argv.join(" ")),
            },
        }
    }
}

impl From<&str> for CommandSpec {
    fn from(script: &str) -> Self {
        CommandSpec::Shell(script.to_string())
    }
}

impl From<String> for CommandSpec {
    fn from(script: String) -> Self {
        CommandSpec::Shell(script)
    }
}

// ============================================================================
// CommandResult
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    /// Not attempted (halt on error, deadline, cancellation)
    Skipped,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Succeeded => "succeeded",
            CommandStatus::Failed => "failed",
            CommandStatus::TimedOut => "timed_out",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Display form of the command
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command never produced an exit code
    pub exit_code: Option<i64>,
    pub success: bool,
    pub status: CommandStatus,
    pub duration: Duration,
}

impl CommandResult {
    /// Outcome of a command that ran to completion
    pub fn completed(
        command: &CommandSpec,
        stdout: String,
        stderr: String,
        exit_code: i64,
        duration: Duration,
    ) -> Self {
        let success = exit_code == 0;
        Self {
            command: command.to_string(),
            stdout,
            stderr,
            exit_code: Some(exit_code),
            success,
            status: if success {
                CommandStatus::Succeeded
            } else {
                CommandStatus::Failed
            },
            duration,
        }
    }

    pub fn timed_out(command: &CommandSpec, after: Duration) -> Self {
        Self {
            command: command.to_string(),
            stdout: String::new(),
            stderr: format!("command timed out after {}s", after.as_secs()),
            exit_code: None,
            success: false,
            status: CommandStatus::TimedOut,
            duration: after,
        }
    }

    pub fn cancelled(command: &CommandSpec, duration: Duration) -> Self {
        Self {
            command: command.to_string(),
            stdout: String::new(),
            stderr: "command cancelled".to_string(),
            exit_code: None,
            success: false,
            status: CommandStatus::Cancelled,
            duration,
        }
    }

    pub fn skipped(command: &CommandSpec, reason: &str) -> Self {
        Self {
            command: command.to_string(),
            stdout: String::new(),
            stderr: format!("skipped: {}", reason),
            exit_code: None,
            success: false,
            status: CommandStatus::Skipped,
            duration: Duration::ZERO,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.status == CommandStatus::Skipped
    }
}

// ============================================================================
// ExecPolicy
// ============================================================================

/// Notified as each command of a sequence finishes
pub trait CommandObserver: Send + Sync {
    fn on_command_finished(&self, index: usize, result: &CommandResult);
}

/// How `execute_commands` runs a sequence
#[derive(Clone, Default)]
pub struct ExecPolicy {
    /// Skip the rest of the sequence after the first unsuccessful command
    pub halt_on_error: bool,
    /// Limit for each individual command
    pub command_timeout: Option<Duration>,
    /// Nothing starts after this instant; a running command is cut off at it
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub observer: Option<Arc<dyn CommandObserver>>,
}

impl ExecPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Halt flag and command timeout from configuration
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            halt_on_error: settings.halt_on_error,
            command_timeout: settings.command_timeout(),
            ..Self::default()
        }
    }

    pub fn with_halt_on_error(mut self, halt: bool) -> Self {
        self.halt_on_error = halt;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Time budget for the next command: the command timeout capped by the
    /// remaining time to the deadline
    pub fn budget(&self) -> Option<Duration> {
        let remaining = self
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));
        match (self.command_timeout, remaining) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (t, r) => t.or(r),
        }
    }
}

impl fmt::Debug for ExecPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecPolicy")
            .field("halt_on_error", &self.halt_on_error)
            .field("command_timeout", &self.command_timeout)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_argv() {
        let shell = CommandSpec::shell("echo hi && ls");
        assert_eq!(shell.argv(), vec!["sh", "-c", "echo hi && ls"]);
        assert_eq!(shell.to_string(), "echo hi && ls");

        let exec = CommandSpec::exec(["git", "clone", "--", "https://x/y z"]);
        assert_eq!(exec.argv().len(), 4);
        let shown = exec.to_string();
        assert!(shown.starts_with("git clone -- "));
        assert!(shown.ends_with("y z'"));
    }

    #[test]
    fn test_command_spec_validate() {
        assert!(CommandSpec::shell("true").validate().is_ok());
        assert!(CommandSpec::shell("   ").validate().is_err());
        assert!(CommandSpec::Exec(vec![]).validate().is_err());
        assert!(CommandSpec::exec(["echo", "a\0b"]).validate().is_err());
    }

    #[test]
    fn test_command_spec_deserializes_untagged() {
        let specs: Vec<CommandSpec> =
            serde_json::from_str(r#"["echo hi", ["ls", "-la"]]"#).unwrap();
        assert_eq!(specs[0], CommandSpec::shell("echo hi"));
        assert_eq!(specs[1], CommandSpec::exec(["ls", "-la"]));
    }

    #[test]
    fn test_results() {
        let cmd = CommandSpec::shell("false");
        let failed =
            CommandResult::completed(&cmd, String::new(), String::new(), 1, Duration::ZERO);
        assert!(!failed.success);
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.exit_code, Some(1));

        let skipped = CommandResult::skipped(&cmd, "halted");
        assert!(skipped.is_skipped());
        assert_eq!(skipped.exit_code, None);
        assert_eq!(skipped.status.to_string(), "skipped");
    }

    #[test]
    fn test_policy_budget() {
        let policy = ExecPolicy::new();
        assert_eq!(policy.budget(), None);
        assert!(!policy.deadline_passed());

        let policy = ExecPolicy::new().with_command_timeout(Some(Duration::from_secs(5)));
        assert_eq!(policy.budget(), Some(Duration::from_secs(5)));

        let policy = policy.with_deadline(Some(Instant::now() + Duration::from_secs(1)));
        assert!(policy.budget().unwrap() <= Duration::from_secs(1));

        let settings = ExecutionSettings::default();
        let policy = ExecPolicy::from_settings(&settings);
        assert_eq!(policy.command_timeout, Some(Duration::from_secs(600)));
        assert!(!policy.halt_on_error);
    }
}
