//! # crucible-agent
//!
//! Task-bound agents for Crucible. Every task runs in a container created
//! for it and destroyed after it, whatever the outcome.
//!
//! - **TaskAgent**: runs tasks, tracks containers and metrics
//! - **SandboxRuntime**: owns the engine, bus and manager; spawns agents
//! - **StatusSink / StatusRelay**: presentation contract fed from the bus
//!
//! ## Example
//!
//! ```ignore
//! use crucible_agent::{SandboxRuntime, StatusBoard, TaskKind, TaskSpec};
//!
//! let runtime = SandboxRuntime::init(SandboxConfig::load()?).await?;
//! runtime.subscribe_status(Arc::new(StatusBoard::new()));
//!
//! let agent = runtime.spawn_agent();
//! let report = agent
//!     .execute_task(TaskSpec::new(TaskKind::Testing, "unit tests").with_command("make test"))
//!     .await?;
//! println!("{}: {}", report.id, report.status);
//!
//! runtime.shutdown("done").await;
//! ```

pub mod agent;
pub mod metrics;
pub mod runtime;
pub mod status;
pub mod task;

pub use agent::{AgentStatus, CompletionCallback, TaskAgent};
pub use metrics::AgentMetrics;
pub use runtime::SandboxRuntime;
pub use status::{ActiveEntry, StatusBoard, StatusRelay, StatusSink};
pub use task::{TaskId, TaskKind, TaskRecord, TaskReport, TaskRequirements, TaskSpec, TaskStatus};
