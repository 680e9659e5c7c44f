//! Status presentation
//!
//! `StatusSink` is the contract a presenter (terminal panel, web view, log
//! file) implements. `StatusBoard` keeps everything in memory; `StatusRelay`
//! is an event listener that turns bus events into sink calls, so agents
//! never talk to a presenter directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crucible_foundation::{EventCategory, EventListener, SandboxEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Log lines kept per entry by default
const DEFAULT_LOG_LINES: usize = 200;

/// One agent as a presenter sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEntry {
    pub id: String,
    /// Merged status fields
    pub status: Map<String, Value>,
    pub logs: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveEntry {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.status.get(key)
    }

    pub fn state(&self) -> Option<&str> {
        self.status.get("state").and_then(Value::as_str)
    }
}

pub trait StatusSink: Send + Sync {
    /// Merge `patch` (an object) into the entry, creating it if needed
    fn update_status(&self, id: &str, patch: Value);

    fn remove_agent(&self, id: &str);

    fn append_log(&self, id: &str, line: &str);

    fn list_active(&self) -> Vec<ActiveEntry>;
}

// ============================================================================
// StatusBoard
// ============================================================================

#[derive(Debug)]
struct BoardEntry {
    status: Map<String, Value>,
    logs: VecDeque<String>,
    updated_at: DateTime<Utc>,
}

impl BoardEntry {
    fn new() -> Self {
        Self {
            status: Map::new(),
            logs: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }
}

/// In-memory `StatusSink`
#[derive(Debug)]
pub struct StatusBoard {
    entries: RwLock<BTreeMap<String, BoardEntry>>,
    max_log_lines: usize,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::with_log_lines(DEFAULT_LOG_LINES)
    }

    pub fn with_log_lines(max_log_lines: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_log_lines: max_log_lines.max(1),
        }
    }

    pub fn get(&self, id: &str) -> Option<ActiveEntry> {
        self.entries.read().get(id).map(|e| snapshot(id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(id: &str, entry: &BoardEntry) -> ActiveEntry {
    ActiveEntry {
        id: id.to_string(),
        status: entry.status.clone(),
        logs: entry.logs.iter().cloned().collect(),
        updated_at: entry.updated_at,
    }
}

impl StatusSink for StatusBoard {
    fn update_status(&self, id: &str, patch: Value) {
        let mut entries = self.entries.write();
        let entry = entries.entry(id.to_string()).or_insert_with(BoardEntry::new);
        match patch {
            Value::Object(fields) => entry.status.extend(fields),
            Value::Null => {}
            other => {
                entry.status.insert("value".to_string(), other);
            }
        }
        entry.updated_at = Utc::now();
    }

    fn remove_agent(&self, id: &str) {
        self.entries.write().remove(id);
    }

    fn append_log(&self, id: &str, line: &str) {
        let mut entries = self.entries.write();
        let entry = entries.entry(id.to_string()).or_insert_with(BoardEntry::new);
        if entry.logs.len() >= self.max_log_lines {
            entry.logs.pop_front();
        }
        entry.logs.push_back(line.to_string());
        entry.updated_at = Utc::now();
    }

    fn list_active(&self) -> Vec<ActiveEntry> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| snapshot(id, entry))
            .collect()
    }
}

// ============================================================================
// StatusRelay
// ============================================================================

/// Forwards agent, task and container events into a `StatusSink`
pub struct StatusRelay {
    sink: Arc<dyn StatusSink>,
}

impl StatusRelay {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventListener for StatusRelay {
    fn name(&self) -> &str {
        "status-relay"
    }

    fn categories(&self) -> Option<Vec<EventCategory>> {
        Some(vec![
            EventCategory::Agent,
            EventCategory::Task,
            EventCategory::Container,
        ])
    }

    async fn on_event(&self, event: &SandboxEvent) {
        // Only agent-owned events have somewhere to go
        let Some(agent_id) = event.agent_id.as_deref() else {
            return;
        };
        let data = |key: &str| event.data_str(key).unwrap_or_default().to_string();

        match event.event_type.as_str() {
            "agent.status" => self.sink.update_status(agent_id, event.data.clone()),
            "agent.removed" => self.sink.remove_agent(agent_id),
            "task.log" => self.sink.append_log(agent_id, &data("line")),
            "task.started" => {
                self.sink.update_status(
                    agent_id,
                    json!({
                        "state": "running",
                        "task_id": data("task_id"),
                        "container_id": data("container_id"),
                        "kind": data("kind"),
                    }),
                );
                self.sink
                    .append_log(agent_id, &format!("Task started: {}", data("description")));
            }
            "task.completed" => {
                self.sink.update_status(
                    agent_id,
                    json!({ "state": "completed", "duration_ms": event.data.get("duration_ms") }),
                );
                self.sink.append_log(agent_id, "Task completed");
            }
            "task.failed" => {
                self.sink.update_status(
                    agent_id,
                    json!({ "state": "failed", "error": data("reason") }),
                );
                self.sink
                    .append_log(agent_id, &format!("Task failed: {}", data("reason")));
            }
            "container.created" => self.sink.append_log(
                agent_id,
                &format!("Container {} at {}", data("name"), data("address")),
            ),
            "container.destroyed" => self
                .sink
                .append_log(agent_id, &format!("Container {} destroyed", data("name"))),
            "container.failed" => self
                .sink
                .append_log(agent_id, &format!("Container failed: {}", data("error"))),
            _ => {}
        }
    }
}
