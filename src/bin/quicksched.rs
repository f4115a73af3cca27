//! Binary entry point: loads the YAML config, seeds two sample
//! programmatic tasks out of the box, and hands everything to the
//! [`Supervisor`](quicksched::Supervisor).

use clap::Parser;
use quicksched::trigger::{ScheduleType, TriggerConfig};
use quicksched::{CallableRegistry, Clock, Config, NewTask, RealClock, SqliteStore, Store, Supervisor, Task, TaskTarget};
use jiff::ToSpan;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quicksched", about = "Self-hosted job scheduler")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

fn seed_tasks(now: quicksched::Instant) -> Vec<Task> {
    let memory_monitor = Task::new(
        NewTask {
            name: "Memory Monitor".to_string(),
            description: Some("Monitor system memory usage and alert if above threshold".to_string()),
            schedule_type: ScheduleType::Daily,
            schedule_config: TriggerConfig {
                timezone: "America/New_York".to_string(),
                run_time: Some(jiff::civil::time(12, 0, 0, 0)),
                ..Default::default()
            },
            target: TaskTarget::Command("free -h".to_string()),
            working_directory: None,
            environment: BTreeMap::new(),
            timeout_seconds: None,
            max_retries: 0,
            retry_delay_seconds: 60,
            enabled: true,
        },
        now,
    );

    let bad_job = Task::new(
        NewTask {
            name: "Bad Job".to_string(),
            description: Some("A job that will fail".to_string()),
            schedule_type: ScheduleType::Interval,
            schedule_config: TriggerConfig {
                timezone: "America/New_York".to_string(),
                start_time: Some(jiff::civil::time(10, 0, 0, 0)),
                end_time: Some(jiff::civil::time(13, 0, 0, 0)),
                interval: Some(30.minutes()),
                ..Default::default()
            },
            target: TaskTarget::Command("exit 1".to_string()),
            working_directory: None,
            environment: BTreeMap::new(),
            timeout_seconds: None,
            max_retries: 0,
            retry_delay_seconds: 60,
            enabled: true,
        },
        now,
    );

    [memory_monitor, bad_job].into_iter().filter_map(Result::ok).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let loaded = quicksched::config::load(&args.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, config = %args.config, "falling back to default config");
        quicksched::LoadedConfig {
            config: Config::default(),
            source_files: Vec::new(),
        }
    });
    let config = loaded.config;

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("scheduler.db");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path)?);

    let registry = CallableRegistry::new();
    let now = RealClock.now();
    let clock: Arc<dyn Clock> = Arc::new(RealClock);

    let supervisor = Supervisor::new(store, clock, &config, seed_tasks(now), registry);
    supervisor.run().await
}
