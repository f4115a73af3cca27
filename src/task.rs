//! A Task is the catalog entry: the declarative, user-authored description
//! of "run this, on this schedule". Tasks are content-addressed — two tasks
//! with identical defining fields collapse to the same `hash_id`, which is
//! what makes catalog reconciliation idempotent.

use crate::error::{Result, SchedulerError};
use crate::time::Instant;
use crate::trigger::{ScheduleType, TriggerConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// What a task actually runs: a shell command or a registered in-process
/// callable, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTarget {
    Command(String),
    Callable(String),
}

impl TaskTarget {
    /// The string stamped as the subprocess runner's log header
    /// (`"command: <target>"`), shared by both target kinds.
    pub fn label(&self) -> &str {
        match self {
            TaskTarget::Command(cmd) => cmd,
            TaskTarget::Callable(key) => key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub hash_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub schedule_config: TriggerConfig,
    pub target: TaskTarget,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: Instant,
    pub updated_at: Instant,
}

fn default_retry_delay() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

/// The shape a task definition takes in a catalog YAML file: every field
/// `NewTask` needs, deserializable straight off the resolved YAML tree.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub schedule_config: TriggerConfig,
    pub target: TaskTarget,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl From<TaskDefinition> for NewTask {
    fn from(def: TaskDefinition) -> Self {
        NewTask {
            name: def.name,
            description: def.description,
            schedule_type: def.schedule_type,
            schedule_config: def.schedule_config,
            target: def.target,
            working_directory: def.working_directory,
            environment: def.environment,
            timeout_seconds: def.timeout_seconds,
            max_retries: def.max_retries,
            retry_delay_seconds: def.retry_delay_seconds,
            enabled: def.enabled,
        }
    }
}

/// Fields a caller supplies to create or update a task; the Store fills in
/// `hash_id`/timestamps.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub schedule_config: TriggerConfig,
    pub target: TaskTarget,
    pub working_directory: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub enabled: bool,
}

impl Task {
    pub fn new(new_task: NewTask, now: Instant) -> Result<Self> {
        if new_task.name.trim().is_empty() {
            return Err(SchedulerError::validation("Task name must not be empty"));
        }
        match &new_task.target {
            TaskTarget::Command(cmd) if cmd.trim().is_empty() => {
                return Err(SchedulerError::validation("Command must not be empty"));
            }
            TaskTarget::Callable(key) if key.trim().is_empty() => {
                return Err(SchedulerError::validation("Callable key must not be empty"));
            }
            _ => {}
        }

        // Validates the trigger config as a side effect; the trigger
        // itself is built fresh by the scheduler from these fields.
        crate::trigger::Trigger::new(new_task.schedule_type, new_task.schedule_config.clone())?;

        let hash_id = compute_hash_id(
            &new_task.name,
            &new_task.target,
            new_task.schedule_type,
            &new_task.schedule_config,
            &new_task.working_directory,
            &new_task.environment,
        );

        Ok(Task {
            hash_id,
            name: new_task.name,
            description: new_task.description,
            schedule_type: new_task.schedule_type,
            schedule_config: new_task.schedule_config,
            target: new_task.target,
            working_directory: new_task.working_directory,
            environment: new_task.environment,
            timeout_seconds: new_task.timeout_seconds,
            max_retries: new_task.max_retries,
            retry_delay_seconds: new_task.retry_delay_seconds,
            enabled: new_task.enabled,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn trigger(&self) -> Result<crate::trigger::Trigger> {
        crate::trigger::Trigger::new(self.schedule_type, self.schedule_config.clone())
    }
}

fn compute_hash_id(
    name: &str,
    target: &TaskTarget,
    schedule_type: ScheduleType,
    schedule_config: &TriggerConfig,
    working_directory: &Option<String>,
    environment: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    match target {
        TaskTarget::Command(cmd) => {
            hasher.update(b"command\0");
            hasher.update(cmd.as_bytes());
        }
        TaskTarget::Callable(key) => {
            hasher.update(b"callable\0");
            hasher.update(key.as_bytes());
        }
    }
    hasher.update(b"\0");
    hasher.update(format!("{schedule_type:?}").as_bytes());
    hasher.update(b"\0");
    // serde_json gives a stable, order-independent-enough rendering for
    // the scalar/collection fields TriggerConfig carries.
    if let Ok(serialized) = serde_json::to_vec(schedule_config) {
        hasher.update(&serialized);
    }
    hasher.update(b"\0");
    if let Some(dir) = working_directory {
        hasher.update(dir.as_bytes());
    }
    hasher.update(b"\0");
    for (key, value) in environment {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
