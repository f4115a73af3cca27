//! A Job is one concrete execution of a Task: created when a trigger
//! fires, and tracked from `Pending` through to a terminal status.

use crate::time::Instant;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_hash_id: String,
    pub trigger_time: Instant,
    #[serde(default)]
    pub start_time: Option<Instant>,
    #[serde(default)]
    pub end_time: Option<Instant>,
    pub status: JobStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output_log_path: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Job {
    /// A brand new job, not yet started, for `task_hash_id` firing at
    /// `trigger_time`.
    pub fn pending(task_hash_id: impl Into<String>, trigger_time: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_hash_id: task_hash_id.into(),
            trigger_time,
            start_time: None,
            end_time: None,
            status: JobStatus::Pending,
            exit_code: None,
            error_message: None,
            output_log_path: None,
            retry_count: 0,
        }
    }

    pub fn mark_running(&mut self, now: Instant, output_log_path: impl Into<String>) {
        self.status = JobStatus::Running;
        self.start_time = Some(now);
        self.output_log_path = Some(output_log_path.into());
    }

    pub fn mark_completed(&mut self, now: Instant, exit_code: i32) {
        self.status = JobStatus::Completed;
        self.end_time = Some(now);
        self.exit_code = Some(exit_code);
    }

    pub fn mark_failed(&mut self, now: Instant, exit_code: Option<i32>, error_message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.end_time = Some(now);
        self.exit_code = exit_code;
        self.error_message = Some(error_message.into());
    }

    pub fn mark_timeout(&mut self, now: Instant) {
        self.status = JobStatus::Timeout;
        self.end_time = Some(now);
        self.error_message = Some("execution exceeded configured timeout".to_string());
    }

    /// A fresh retry attempt against the same task and trigger instant,
    /// carrying the incremented retry count forward.
    pub fn retry(&self) -> Self {
        let mut next = Job::pending(self.task_hash_id.clone(), self.trigger_time);
        next.retry_count = self.retry_count + 1;
        next
    }
}
