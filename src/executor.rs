//! Drives one Task trigger-firing through to a terminal Job, including the
//! retry loop. One `JobExecutor::execute` call is one logical "this task
//! fired" event; it may write several Job rows if retries fire.

use crate::callable::CallableRegistry;
use crate::job::{Job, JobStatus};
use crate::store::Store;
use crate::subprocess::SubprocessRunner;
use crate::task::Task;
use crate::time::Clock;
use std::path::PathBuf;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Invoked with `(message, task, job)` when a job's final attempt lands on a
/// non-`COMPLETED` terminal state. Any panic the callback raises is caught
/// and logged, never propagated to the executor.
pub trait AlertCallback: Send + Sync {
    fn alert(&self, message: &str, task: &Task, job: &Job);
}

impl<F> AlertCallback for F
where
    F: Fn(&str, &Task, &Job) + Send + Sync,
{
    fn alert(&self, message: &str, task: &Task, job: &Job) {
        self(message, task, job)
    }
}

pub struct JobExecutor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    registry: CallableRegistry,
    log_dir: PathBuf,
    alert: Option<Arc<dyn AlertCallback>>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, registry: CallableRegistry, log_dir: PathBuf) -> Self {
        Self {
            store,
            clock,
            registry,
            log_dir,
            alert: None,
        }
    }

    /// Attach an alert callback, invoked on final non-`COMPLETED` terminal
    /// status after retries are exhausted.
    pub fn with_alert(mut self, alert: impl AlertCallback + 'static) -> Self {
        self.alert = Some(Arc::new(alert));
        self
    }

    /// Run `task` through `job` (already `Pending`, with its id already
    /// assigned by the caller) to a terminal status, retrying up to
    /// `task.max_retries` times on non-zero exit or timeout. Returns the
    /// final Job (whatever terminal status it landed on); every attempt
    /// along the way is already persisted. The caller constructs `job` up
    /// front precisely so its id is known before the execution starts —
    /// e.g. so a "trigger now" caller can hand that id back immediately.
    pub async fn execute(&self, task: &Task, mut job: Job) -> crate::error::Result<Job> {
        let mut attempt: u32 = job.retry_count;

        loop {
            self.store.insert_job(&job).await?;

            let log_path = self.log_dir.join(format!("{}.log", job.id));
            let runner = SubprocessRunner::new();

            let start = self.clock.now();
            if let Err(e) = runner
                .start(
                    &task.target,
                    task.working_directory.as_deref(),
                    &task.environment,
                    log_path.clone(),
                    Some(&self.registry),
                )
                .await
            {
                job.mark_failed(start, None, e.to_string());
                self.store.update_job(&job).await?;
                self.fire_alert(task, &job);
                return Ok(job);
            }
            job.mark_running(start, log_path.to_string_lossy().into_owned());
            self.store.update_job(&job).await?;

            let timed_out = match task.timeout_seconds {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait_until_done(&runner))
                    .await
                    .is_err(),
                None => {
                    wait_until_done(&runner).await;
                    false
                }
            };

            let now = self.clock.now();
            if timed_out {
                runner.stop().await.ok();
                job.mark_timeout(now);
                warn!(task = %task.name, job_id = %job.id, "job timed out");
            } else {
                match runner.status().await {
                    Ok(status) => match status.exit_code {
                        Some(0) => job.mark_completed(now, 0),
                        other => job.mark_failed(now, other, format!("exited with status {other:?}")),
                    },
                    Err(e) => {
                        job.mark_failed(now, None, e.to_string());
                        warn!(task = %task.name, job_id = %job.id, error = %e, "failed to read runner status");
                    }
                }
            }
            self.store.update_job(&job).await?;

            if job.status == JobStatus::Completed {
                info!(task = %task.name, job_id = %job.id, attempt, "job completed");
                return Ok(job);
            }
            if attempt >= task.max_retries {
                warn!(task = %task.name, job_id = %job.id, attempt, "job failed, retries exhausted");
                self.fire_alert(task, &job);
                return Ok(job);
            }

            attempt += 1;
            info!(task = %task.name, job_id = %job.id, attempt, "retrying job");
            tokio::time::sleep(Duration::from_secs(task.retry_delay_seconds)).await;
            job = job.retry();
        }
    }

    /// Invoke the alert callback, swallowing any panic it raises (spec
    /// §4.3 step 7) so a misbehaving callback can never take the scheduler
    /// down with it.
    fn fire_alert(&self, task: &Task, job: &Job) {
        let Some(alert) = &self.alert else { return };
        let message = format!("task \"{}\" job {} ended as {:?}", task.name, job.id, job.status);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| alert.alert(&message, task, job)));
        if let Err(panic) = outcome {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(task = %task.name, job_id = %job.id, %reason, "alert callback panicked");
        }
    }
}

async fn wait_until_done(runner: &SubprocessRunner) {
    loop {
        match runner.status().await {
            Ok(status) if !status.running => return,
            _ => tokio::time::sleep(Duration::from_millis(150)).await,
        }
    }
}
