//! Running agent metrics
//!
//! Counters only ever increase. `average_task_duration` is recomputed from
//! the totals after every finished task, never accumulated incrementally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub containers_created: u64,
    pub containers_destroyed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Sum of the durations of every finished task, completed or failed
    pub total_execution_time: Duration,
    /// `total_execution_time / tasks_completed`, zero before the first completion
    pub average_task_duration: Duration,
    pub last_active: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_container_created(&mut self) {
        self.containers_created += 1;
        self.touch();
    }

    pub fn record_container_destroyed(&mut self) {
        self.containers_destroyed += 1;
        self.touch();
    }

    pub fn record_task_completed(&mut self, duration: Duration) {
        self.tasks_completed += 1;
        self.add_execution_time(duration);
    }

    pub fn record_task_failed(&mut self, duration: Duration) {
        self.tasks_failed += 1;
        self.add_execution_time(duration);
    }

    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Completed share of finished tasks, 0.0 when none finished
    pub fn success_rate(&self) -> f64 {
        match self.tasks_finished() {
            0 => 0.0,
            n => self.tasks_completed as f64 / n as f64,
        }
    }

    fn add_execution_time(&mut self, duration: Duration) {
        self.total_execution_time += duration;
        self.average_task_duration = match self.tasks_completed {
            0 => Duration::ZERO,
            n => self.total_execution_time / u32::try_from(n).unwrap_or(u32::MAX),
        };
        self.touch();
    }

    fn touch(&mut self) {
        self.last_active = Some(Utc::now());
    }
}
