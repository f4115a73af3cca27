//! Merges the programmatic task list with a directory of `*.yaml` task
//! definitions, diffs the result against what was last pushed live, and
//! drives the Scheduler's live set through its control channel. Never
//! mutates a live trigger in place: a task whose definition changed is
//! removed then re-added.

use crate::config;
use crate::error::Result;
use crate::scheduler::SchedulerHandle;
use crate::store::Store;
use crate::task::{Task, TaskDefinition};
use crate::time::Clock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Default directory-scan cadence: periodic, once per second.
pub const DEFAULT_SCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileFingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

fn fingerprint(path: &Path) -> std::io::Result<FileFingerprint> {
    let meta = std::fs::metadata(path)?;
    Ok(FileFingerprint {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

/// A cached parse of one task definition file: the `Task` it produced, plus
/// every file (including transitive imports) that fed into it, so a change
/// to an imported file is detected even though the task file itself didn't
/// change on disk.
struct CachedTaskFile {
    task: Task,
    sources: Vec<PathBuf>,
}

/// The part of a `Task` that can change without its `hash_id` changing —
/// `hash_id` is content-addressed over the scheduling-relevant fields only,
/// so these mutable fields need their own equality check to detect an
/// in-place edit that still needs a remove-then-add.
#[derive(Debug, Clone, PartialEq)]
struct TaskSignature {
    hash_id: String,
    description: Option<String>,
    timeout_seconds: Option<u64>,
    max_retries: u32,
    retry_delay_seconds: u64,
    enabled: bool,
}

fn signature(task: &Task) -> TaskSignature {
    TaskSignature {
        hash_id: task.hash_id.clone(),
        description: task.description.clone(),
        timeout_seconds: task.timeout_seconds,
        max_retries: task.max_retries,
        retry_delay_seconds: task.retry_delay_seconds,
        enabled: task.enabled,
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    handle: SchedulerHandle,
    task_dir: PathBuf,
    programmatic: Vec<Task>,
    cached_files: HashMap<PathBuf, CachedTaskFile>,
    fingerprints: HashMap<PathBuf, FileFingerprint>,
    live: HashMap<String, TaskSignature>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        handle: SchedulerHandle,
        task_dir: impl Into<PathBuf>,
        programmatic: Vec<Task>,
    ) -> Self {
        Self {
            store,
            clock,
            handle,
            task_dir: task_dir.into(),
            programmatic,
            cached_files: HashMap::new(),
            fingerprints: HashMap::new(),
            live: HashMap::new(),
        }
    }

    /// Run the periodic reconcile loop until `stop` resolves.
    pub async fn run(mut self, mut stop: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(DEFAULT_SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "reconcile pass failed");
                    }
                }
                _ = &mut stop => {
                    info!("reconciler stopping");
                    break;
                }
            }
        }
    }

    /// One merge-diff-apply pass over the catalog.
    pub async fn reconcile_once(&mut self) -> Result<()> {
        self.rescan_directory()?;

        let mut union: HashMap<String, Task> = HashMap::new();
        for cached in self.cached_files.values() {
            union.insert(cached.task.hash_id.clone(), cached.task.clone());
        }
        // Programmatic entries win on hash_id collision.
        for task in &self.programmatic {
            union.insert(task.hash_id.clone(), task.clone());
        }

        let mut to_add: Vec<Task> = Vec::new();
        let mut to_remove: Vec<String> = Vec::new();

        for (hash_id, task) in &union {
            let sig = signature(task);
            match self.live.get(hash_id) {
                None => to_add.push(task.clone()),
                Some(prev) if *prev != sig => {
                    // Content changed under a stable hash_id (e.g. retries,
                    // timeout, enabled flag): never mutate live state in
                    // place, emit remove then add.
                    to_remove.push(hash_id.clone());
                    to_add.push(task.clone());
                }
                Some(_) => {}
            }
        }
        for hash_id in self.live.keys() {
            if !union.contains_key(hash_id) {
                to_remove.push(hash_id.clone());
            }
        }

        for hash_id in &to_remove {
            self.handle.remove_task(hash_id.clone()).await;
            self.live.remove(hash_id);
            debug!(%hash_id, "reconciler removed task from live set");
        }
        for task in to_add {
            let hash_id = task.hash_id.clone();
            self.store.upsert_task(task.clone()).await?;
            self.live.insert(hash_id.clone(), signature(&task));
            self.handle.upsert_task(task).await;
            debug!(%hash_id, "reconciler upserted task into live set");
        }

        Ok(())
    }

    /// Scan `task_dir` for `*.yaml` files, reparsing any that are new or
    /// whose fingerprint (or an imported file's fingerprint) changed, and
    /// drop cache entries for files that disappeared.
    fn rescan_directory(&mut self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.task_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut seen = std::collections::HashSet::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            seen.insert(path.clone());
            if self.needs_reparse(&path)? {
                match self.parse_task_file(&path) {
                    Ok(cached) => {
                        self.cached_files.insert(path.clone(), cached);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to parse task file"),
                }
            }
        }

        self.cached_files.retain(|path, _| seen.contains(path));
        self.fingerprints.retain(|path, _| seen.contains(path));
        Ok(())
    }

    fn needs_reparse(&self, path: &Path) -> Result<bool> {
        let Some(cached) = self.cached_files.get(path) else {
            return Ok(true);
        };
        for source in &cached.sources {
            let current = fingerprint(source).ok();
            let previous = self.fingerprints.get(source).cloned();
            if current != previous {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn parse_task_file(&mut self, path: &Path) -> Result<CachedTaskFile> {
        let (value, sources) = config::load_yaml_resolved(path)?;
        let definition: TaskDefinition = serde_yaml::from_value(value)?;
        let now = self.clock.now();
        let task = Task::new(definition.into(), now)?;

        for source in &sources {
            if let Ok(fp) = fingerprint(source) {
                self.fingerprints.insert(source.clone(), fp);
            }
        }
        Ok(CachedTaskFile { task, sources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::CallableRegistry;
    use crate::executor::JobExecutor;
    use crate::scheduler::Scheduler;
    use crate::store::SqliteStore;
    use crate::task::{NewTask, TaskTarget};
    use crate::time::MockClock;
    use crate::trigger::{ScheduleType, TriggerConfig};
    use jiff::civil::time as civil_time;
    use std::collections::BTreeMap;

    fn make_scheduler_handle(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> SchedulerHandle {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(JobExecutor::new(store.clone(), clock.clone(), CallableRegistry::new(), dir.path().into()));
        std::mem::forget(dir);
        let scheduler = Scheduler::new(store, clock, executor);
        let handle = scheduler.handle();
        tokio::spawn(scheduler.run());
        handle
    }

    fn daily_yaml(name: &str, command: &str) -> String {
        format!(
            "name: {name}\nschedule_type: daily\nschedule_config:\n  run_time: \"12:00:00\"\ntarget:\n  command: \"{command}\"\n"
        )
    }

    #[tokio::test]
    async fn picks_up_a_new_task_file() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(crate::time::mock::start()));
        let handle = make_scheduler_handle(store.clone(), clock.clone());

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("backup.yaml"), daily_yaml("backup", "echo hi")).unwrap();

        let mut reconciler = Reconciler::new(store.clone(), clock, handle, dir.path(), Vec::new());
        reconciler.reconcile_once().await.unwrap();

        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
        assert_eq!(reconciler.live.len(), 1);
    }

    #[tokio::test]
    async fn programmatic_task_wins_on_collision() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(crate::time::mock::start()));
        let handle = make_scheduler_handle(store.clone(), clock.clone());

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("backup.yaml"), daily_yaml("backup", "echo from-yaml")).unwrap();

        let now = crate::time::mock::start();
        let programmatic_task = Task::new(
            NewTask {
                name: "backup".to_string(),
                description: None,
                schedule_type: ScheduleType::Daily,
                schedule_config: TriggerConfig {
                    run_time: Some(civil_time(12, 0, 0, 0)),
                    ..Default::default()
                },
                target: TaskTarget::Command("echo from-yaml".to_string()),
                working_directory: None,
                environment: BTreeMap::new(),
                timeout_seconds: None,
                max_retries: 5,
                retry_delay_seconds: 60,
                enabled: true,
            },
            now,
        )
        .unwrap();

        let mut reconciler = Reconciler::new(store.clone(), clock, handle, dir.path(), vec![programmatic_task]);
        reconciler.reconcile_once().await.unwrap();

        let tasks = store.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].max_retries, 5);
    }

    #[tokio::test]
    async fn removing_a_task_file_emits_remove() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(crate::time::mock::start()));
        let handle = make_scheduler_handle(store.clone(), clock.clone());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.yaml");
        std::fs::write(&path, daily_yaml("backup", "echo hi")).unwrap();

        let mut reconciler = Reconciler::new(store.clone(), clock, handle, dir.path(), Vec::new());
        reconciler.reconcile_once().await.unwrap();
        assert_eq!(reconciler.live.len(), 1);

        std::fs::remove_file(&path).unwrap();
        reconciler.reconcile_once().await.unwrap();
        assert_eq!(reconciler.live.len(), 0);
    }

    #[tokio::test]
    async fn edited_task_file_triggers_remove_then_add() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(crate::time::mock::start()));
        let handle = make_scheduler_handle(store.clone(), clock.clone());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.yaml");
        std::fs::write(&path, daily_yaml("backup", "echo hi")).unwrap();

        let mut reconciler = Reconciler::new(store.clone(), clock, handle, dir.path(), Vec::new());
        reconciler.reconcile_once().await.unwrap();
        let original_hash = reconciler.live.keys().next().cloned().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, daily_yaml("backup", "echo changed")).unwrap();
        reconciler.reconcile_once().await.unwrap();

        let new_hash = reconciler.live.keys().next().cloned().unwrap();
        assert_ne!(original_hash, new_hash);
        assert_eq!(reconciler.live.len(), 1);
    }
}
