//! Terminal status presenter

use crucible_agent::{ActiveEntry, StatusBoard, StatusSink};
use serde_json::Value;

/// Keeps a `StatusBoard` and echoes state changes and log lines to stderr
pub struct ConsoleStatus {
    board: StatusBoard,
}

impl ConsoleStatus {
    pub fn new() -> Self {
        Self {
            board: StatusBoard::new(),
        }
    }
}

impl StatusSink for ConsoleStatus {
    fn update_status(&self, id: &str, patch: Value) {
        let previous = self.board.get(id).and_then(|e| e.state().map(String::from));
        self.board.update_status(id, patch);

        if let Some(entry) = self.board.get(id) {
            if let Some(state) = entry.state() {
                if previous.as_deref() != Some(state) {
                    eprintln!("[{}] {}", id, state);
                }
            }
        }
    }

    fn remove_agent(&self, id: &str) {
        self.board.remove_agent(id);
    }

    fn append_log(&self, id: &str, line: &str) {
        eprintln!("[{}] {}", id, line);
        self.board.append_log(id, line);
    }

    fn list_active(&self) -> Vec<ActiveEntry> {
        self.board.list_active()
    }
}
