//! End-to-end integration test driving the scheduler through a full
//! fire-execute-persist cycle without going through the HTTP layer.

use pretty_assertions::assert_eq;
use quicksched::trigger::{ScheduleType, TriggerConfig};
use quicksched::{CallableRegistry, Clock, Job, JobExecutor, JobStatus, NewTask, RealClock, SqliteStore, Store, Task, TaskTarget};
use std::collections::BTreeMap;
use std::sync::Arc;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn immediate_task(name: &str, command: &str, now: quicksched::Instant) -> Task {
    Task::new(
        NewTask {
            name: name.to_string(),
            description: None,
            schedule_type: ScheduleType::Immediate,
            schedule_config: TriggerConfig::default(),
            target: TaskTarget::Command(command.to_string()),
            working_directory: None,
            environment: BTreeMap::new(),
            timeout_seconds: None,
            max_retries: 1,
            retry_delay_seconds: 0,
            enabled: true,
        },
        now,
    )
    .unwrap()
}

#[tokio::test]
async fn immediate_task_fires_and_persists_a_completed_job() -> TestResult {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory()?);
    let clock = Arc::new(RealClock);
    let now = clock.now();
    let task = immediate_task("smoke", "echo hello", now);
    store.upsert_task(task.clone()).await?;

    let dir = tempfile::tempdir()?;
    let executor = JobExecutor::new(store.clone(), clock, CallableRegistry::new(), dir.path().into());

    let job = executor.execute(&task, Job::pending(task.hash_id.clone(), now)).await?;
    assert_eq!(job.status, JobStatus::Completed);

    let jobs: Vec<Job> = store.list_jobs(Some(&task.hash_id)).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job.id);

    Ok(())
}

#[tokio::test]
async fn failing_task_retries_then_reports_failed() -> TestResult {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory()?);
    let clock = Arc::new(RealClock);
    let now = clock.now();
    let task = immediate_task("will-fail", "exit 1", now);
    store.upsert_task(task.clone()).await?;

    let dir = tempfile::tempdir()?;
    let executor = JobExecutor::new(store.clone(), clock, CallableRegistry::new(), dir.path().into());

    let job = executor.execute(&task, Job::pending(task.hash_id.clone(), now)).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);

    let jobs = store.list_jobs(Some(&task.hash_id)).await?;
    assert_eq!(jobs.len(), 2);

    Ok(())
}

#[tokio::test]
async fn deleting_a_task_cascades_its_jobs_but_not_others() -> TestResult {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory()?);
    let now = RealClock.now();
    let kept = immediate_task("kept", "echo keep", now);
    let removed = immediate_task("removed", "echo bye", now);
    store.upsert_task(kept.clone()).await?;
    store.upsert_task(removed.clone()).await?;

    store.insert_job(&Job::pending(kept.hash_id.clone(), now)).await?;
    store.insert_job(&Job::pending(removed.hash_id.clone(), now)).await?;

    store.delete_task(&removed.hash_id).await?;

    assert_eq!(store.list_jobs(Some(&kept.hash_id)).await?.len(), 1);
    assert_eq!(store.list_jobs(Some(&removed.hash_id)).await?.len(), 0);
    assert_eq!(store.count_tasks().await?, 1);

    Ok(())
}
