//! The scheduling loop: wakes up exactly when the next task is due (or
//! when told to, over the control channel), fires it, and goes back to
//! sleep. An owned async loop driven by `tokio::select!`, generalized
//! from a manually-ticked `run_pending`/`idle_seconds` pattern.

use crate::executor::JobExecutor;
use crate::store::Store;
use crate::task::Task;
use crate::time::{Clock, Instant};
use crate::trigger::Trigger;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ScheduledTask {
    task: Task,
    trigger: Trigger,
    next_run: Option<Instant>,
}

pub enum ControlMessage {
    Upsert(Task),
    Remove(String),
    TriggerNow(String, oneshot::Sender<crate::error::Result<Uuid>>),
    Shutdown,
}

/// A cheap, cloneable send-only view onto a running `Scheduler`.
#[derive(Clone)]
pub struct SchedulerHandle {
    control: mpsc::Sender<ControlMessage>,
}

impl SchedulerHandle {
    pub async fn upsert_task(&self, task: Task) {
        let _ = self.control.send(ControlMessage::Upsert(task)).await;
    }

    pub async fn remove_task(&self, hash_id: impl Into<String>) {
        let _ = self.control.send(ControlMessage::Remove(hash_id.into())).await;
    }

    /// Fire `hash_id` immediately, outside its normal schedule, returning
    /// the id of the job it created.
    pub async fn trigger_now(&self, hash_id: impl Into<String>) -> crate::error::Result<Uuid> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(ControlMessage::TriggerNow(hash_id.into(), tx))
            .await
            .map_err(|_| crate::error::SchedulerError::internal("scheduler is not running"))?;
        rx.await
            .map_err(|_| crate::error::SchedulerError::internal("scheduler dropped the request"))?
    }

    pub async fn shutdown(&self) {
        let _ = self.control.send(ControlMessage::Shutdown).await;
    }

    /// A handle into no running scheduler: every call is a silent no-op.
    /// Used to seed a `watch` channel before the first scheduler worker has
    /// started (see `supervisor`).
    pub fn detached() -> Self {
        let (control, _rx) = mpsc::channel(1);
        Self { control }
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    executor: Arc<JobExecutor>,
    tasks: HashMap<String, ScheduledTask>,
    running: Arc<Mutex<HashSet<String>>>,
    control_rx: mpsc::Receiver<ControlMessage>,
    control_tx: mpsc::Sender<ControlMessage>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, executor: Arc<JobExecutor>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(256);
        Self {
            store,
            clock,
            executor,
            tasks: HashMap::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            control_rx,
            control_tx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Load every enabled task from the Store into the live set, and mark
    /// any job still `Pending`/`Running` from a previous process lifetime
    /// as `Failed` — the process died mid-execution, so neither status can
    /// be trusted.
    pub async fn bootstrap(&mut self) -> crate::error::Result<()> {
        let now = self.clock.now();
        for task in self.store.list_tasks().await? {
            if task.enabled {
                self.insert_task(task, now)?;
            }
        }
        for mut job in self.store.list_jobs(None).await? {
            if matches!(job.status, crate::job::JobStatus::Pending | crate::job::JobStatus::Running) {
                job.mark_failed(now, None, "process restarted mid-execution");
                self.store.update_job(&job).await?;
            }
        }
        Ok(())
    }

    fn insert_task(&mut self, task: Task, now: Instant) -> crate::error::Result<()> {
        let trigger = task.trigger()?;
        let next_run = trigger.get_next_run(now)?;
        self.tasks.insert(
            task.hash_id.clone(),
            ScheduledTask {
                task,
                trigger,
                next_run,
            },
        );
        Ok(())
    }

    fn next_wake(&self) -> Option<Instant> {
        self.tasks.values().filter_map(|t| t.next_run).min()
    }

    pub async fn run(mut self) {
        if let Err(e) = self.bootstrap().await {
            warn!(error = %e, "scheduler bootstrap failed");
        }

        loop {
            let wake = self.next_wake();
            let sleep = match wake {
                Some(instant) => {
                    let now = self.clock.now();
                    let duration = now
                        .until(instant)
                        .ok()
                        .and_then(|span| span.total(jiff::Unit::Second).ok())
                        .map(|secs| std::time::Duration::from_secs_f64(secs.max(0.0)))
                        .unwrap_or(std::time::Duration::ZERO);
                    tokio::time::sleep(duration)
                }
                None => tokio::time::sleep(std::time::Duration::from_secs(3600)),
            };

            tokio::select! {
                _ = sleep => {
                    self.fire_due().await;
                }
                msg = self.control_rx.recv() => {
                    match msg {
                        None | Some(ControlMessage::Shutdown) => {
                            info!("scheduler shutting down");
                            break;
                        }
                        Some(other) => self.handle_control(other).await,
                    }
                }
            }
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Upsert(task) => {
                let now = self.clock.now();
                let hash_id = task.hash_id.clone();
                match self.insert_task(task, now) {
                    Ok(()) => debug!(%hash_id, "task upserted into live set"),
                    Err(e) => warn!(%hash_id, error = %e, "failed to schedule task"),
                }
            }
            ControlMessage::Remove(hash_id) => {
                self.tasks.remove(&hash_id);
                debug!(%hash_id, "task removed from live set");
            }
            ControlMessage::TriggerNow(hash_id, respond_to) => {
                let result = self.fire_now(&hash_id).await;
                let _ = respond_to.send(result);
            }
            ControlMessage::Shutdown => unreachable!("handled by caller"),
        }
    }

    async fn fire_now(&mut self, hash_id: &str) -> crate::error::Result<Uuid> {
        let task = self
            .tasks
            .get(hash_id)
            .map(|t| t.task.clone())
            .ok_or_else(|| crate::error::SchedulerError::not_found(format!("No task with hash_id {hash_id}")))?;

        if self.running.lock().expect("lock poisoned").contains(hash_id) {
            return Err(crate::error::SchedulerError::conflict(format!(
                "Task {hash_id} already has a job running"
            )));
        }

        let now = self.clock.now();
        let job = crate::job::Job::pending(task.hash_id.clone(), now);
        let job_id = self.spawn_execution(task, job);
        Ok(job_id)
    }

    async fn fire_due(&mut self) {
        let now = self.clock.now();
        let due: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.next_run.map(|next| next <= now).unwrap_or(false))
            .map(|(hash_id, _)| hash_id.clone())
            .collect();

        for hash_id in due {
            let Some(scheduled) = self.tasks.get_mut(&hash_id) else {
                continue;
            };
            let trigger_time = scheduled.next_run.unwrap_or(now);
            match scheduled.trigger.get_next_run(now) {
                Ok(next) => scheduled.next_run = next,
                Err(e) => warn!(%hash_id, error = %e, "failed to compute next run"),
            }

            if self.running.lock().expect("lock poisoned").contains(&hash_id) {
                debug!(%hash_id, "skipping fire: previous job still running");
                continue;
            }

            let task = scheduled.task.clone();
            let job = crate::job::Job::pending(task.hash_id.clone(), trigger_time);
            self.spawn_execution(task, job);
        }
    }

    /// Spawn `job` (already `Pending`) running `task`, returning the id the
    /// caller can poll — the same id `JobExecutor::execute` persists, since
    /// `job` is constructed before the execution starts rather than inside
    /// it.
    fn spawn_execution(&self, task: Task, job: crate::job::Job) -> Uuid {
        let hash_id = task.hash_id.clone();
        let job_id = job.id;
        self.running.lock().expect("lock poisoned").insert(hash_id.clone());

        let executor = self.executor.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            match executor.execute(&task, job).await {
                Ok(job) => info!(task = %task.name, job_id = %job.id, status = ?job.status, "job finished"),
                Err(e) => warn!(task = %task.name, error = %e, "job execution failed to run at all"),
            }
            running.lock().expect("lock poisoned").remove(&hash_id);
        });
        job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::CallableRegistry;
    use crate::job::JobStatus;
    use crate::store::SqliteStore;
    use crate::task::{NewTask, TaskTarget};
    use crate::time::RealClock;
    use crate::trigger::ScheduleType;
    use jiff::ToSpan;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn bootstrap_loads_enabled_tasks() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let now = RealClock.now();
        let task = Task::new(
            NewTask {
                name: "t".to_string(),
                description: None,
                schedule_type: ScheduleType::Immediate,
                schedule_config: crate::trigger::TriggerConfig::default(),
                target: TaskTarget::Command("echo hi".to_string()),
                working_directory: None,
                environment: BTreeMap::new(),
                timeout_seconds: None,
                max_retries: 0,
                retry_delay_seconds: 0,
                enabled: true,
            },
            now,
        )
        .unwrap();
        store.upsert_task(task).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            Arc::new(RealClock),
            CallableRegistry::new(),
            dir.path().into(),
        ));
        let mut scheduler = Scheduler::new(store, Arc::new(RealClock), executor);
        scheduler.bootstrap().await.unwrap();
        assert_eq!(scheduler.tasks.len(), 1);
    }

    #[tokio::test]
    async fn next_wake_is_the_soonest_task() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            Arc::new(RealClock),
            CallableRegistry::new(),
            dir.path().into(),
        ));
        let mut scheduler = Scheduler::new(store, Arc::new(RealClock), executor);
        let now = RealClock.now();
        scheduler
            .insert_task(
                Task::new(
                    NewTask {
                        name: "later".to_string(),
                        description: None,
                        schedule_type: ScheduleType::Interval,
                        schedule_config: crate::trigger::TriggerConfig {
                            start_time: Some(jiff::civil::time(0, 0, 0, 0)),
                            end_time: Some(jiff::civil::time(23, 59, 59, 0)),
                            interval: Some(1.hours()),
                            ..Default::default()
                        },
                        target: TaskTarget::Command("echo later".to_string()),
                        working_directory: None,
                        environment: BTreeMap::new(),
                        timeout_seconds: None,
                        max_retries: 0,
                        retry_delay_seconds: 0,
                        enabled: true,
                    },
                    now,
                )
                .unwrap(),
                now,
            )
            .unwrap();
        scheduler
            .insert_task(
                Task::new(
                    NewTask {
                        name: "now".to_string(),
                        description: None,
                        schedule_type: ScheduleType::Immediate,
                        schedule_config: crate::trigger::TriggerConfig::default(),
                        target: TaskTarget::Command("echo now".to_string()),
                        working_directory: None,
                        environment: BTreeMap::new(),
                        timeout_seconds: None,
                        max_retries: 0,
                        retry_delay_seconds: 0,
                        enabled: true,
                    },
                    now,
                )
                .unwrap(),
                now,
            )
            .unwrap();

        assert_eq!(scheduler.next_wake(), Some(now));
    }

    fn immediate_task(name: &str, command: &str, now: Instant) -> Task {
        Task::new(
            NewTask {
                name: name.to_string(),
                description: None,
                schedule_type: ScheduleType::Immediate,
                schedule_config: crate::trigger::TriggerConfig::default(),
                target: TaskTarget::Command(command.to_string()),
                working_directory: None,
                environment: BTreeMap::new(),
                timeout_seconds: None,
                max_retries: 0,
                retry_delay_seconds: 0,
                enabled: true,
            },
            now,
        )
        .unwrap()
    }

    /// Spec §8 scenario 6: the `job_id` a manual trigger hands back must be
    /// the id of the Job the executor actually persists, not an id minted
    /// independently of it.
    #[tokio::test]
    async fn trigger_now_returns_the_id_of_the_persisted_job() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let now = RealClock.now();
        let task = immediate_task("smoke", "echo hi", now);
        let hash_id = task.hash_id.clone();
        store.upsert_task(task.clone()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(JobExecutor::new(store.clone(), Arc::new(RealClock), CallableRegistry::new(), dir.path().into()));
        let mut scheduler = Scheduler::new(store.clone(), Arc::new(RealClock), executor);
        scheduler.insert_task(task, now).unwrap();
        let handle = scheduler.handle();
        tokio::spawn(scheduler.run());

        let job_id = handle.trigger_now(hash_id).await.unwrap();

        let mut job = None;
        for _ in 0..50 {
            if let Some(found) = store.get_job(job_id).await.unwrap() {
                if found.status.is_terminal() {
                    job = Some(found);
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let job = job.expect("job never reached a terminal status");
        assert_eq!(job.id, job_id);
        assert_eq!(job.status, JobStatus::Completed);
    }

    /// Spec §4.4: a manual trigger is "subject to the same at-most-one-
    /// active rule" as a scheduled fire.
    #[tokio::test]
    async fn trigger_now_conflicts_while_a_job_is_already_running() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let now = RealClock.now();
        let task = immediate_task("slow", "sleep 1", now);
        let hash_id = task.hash_id.clone();
        store.upsert_task(task.clone()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(JobExecutor::new(store.clone(), Arc::new(RealClock), CallableRegistry::new(), dir.path().into()));
        let mut scheduler = Scheduler::new(store.clone(), Arc::new(RealClock), executor);
        scheduler.insert_task(task, now).unwrap();
        let handle = scheduler.handle();
        tokio::spawn(scheduler.run());

        handle.trigger_now(hash_id.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = handle.trigger_now(hash_id).await.unwrap_err();
        assert!(matches!(err, crate::error::SchedulerError::Conflict(_)));
    }
}
