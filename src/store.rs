//! The persistent catalog and job history. Backed by SQLite through
//! `rusqlite`; "session" is a borrowed guard over a single
//! `Mutex<Connection>`, making the single-writer contract literal instead
//! of advisory.

use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobStatus};
use crate::task::Task;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_task(&self, task: Task) -> Result<Task>;
    async fn get_task(&self, hash_id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
    async fn delete_task(&self, hash_id: &str) -> Result<()>;
    async fn count_tasks(&self) -> Result<u64>;

    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn list_jobs(&self, task_hash_id: Option<&str>) -> Result<Vec<Job>>;
    async fn count_jobs(&self) -> Result<u64>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS tasks (
                hash_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                schedule_type TEXT NOT NULL,
                schedule_config TEXT NOT NULL,
                target TEXT NOT NULL,
                working_directory TEXT,
                environment TEXT NOT NULL,
                timeout_seconds INTEGER,
                max_retries INTEGER NOT NULL,
                retry_delay_seconds INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                task_hash_id TEXT NOT NULL REFERENCES tasks(hash_id) ON DELETE CASCADE,
                trigger_time TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                status TEXT NOT NULL,
                exit_code INTEGER,
                error_message TEXT,
                output_log_path TEXT,
                retry_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_task_hash_id ON jobs(task_hash_id);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let schedule_type_raw: String = row.get("schedule_type")?;
        let schedule_config_raw: String = row.get("schedule_config")?;
        let target_raw: String = row.get("target")?;
        let environment_raw: String = row.get("environment")?;
        let created_at_raw: String = row.get("created_at")?;
        let updated_at_raw: String = row.get("updated_at")?;

        let to_sqlite_err = |e: serde_json::Error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        };

        Ok(Task {
            hash_id: row.get("hash_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            schedule_type: serde_json::from_str(&schedule_type_raw).map_err(to_sqlite_err)?,
            schedule_config: serde_json::from_str(&schedule_config_raw).map_err(to_sqlite_err)?,
            target: serde_json::from_str(&target_raw).map_err(to_sqlite_err)?,
            working_directory: row.get("working_directory")?,
            environment: serde_json::from_str(&environment_raw).map_err(to_sqlite_err)?,
            timeout_seconds: row.get::<_, Option<i64>>("timeout_seconds")?.map(|v| v as u64),
            max_retries: row.get::<_, i64>("max_retries")? as u32,
            retry_delay_seconds: row.get::<_, i64>("retry_delay_seconds")? as u64,
            enabled: row.get("enabled")?,
            created_at: created_at_raw.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "created_at".into(), rusqlite::types::Type::Text)
            })?,
            updated_at: updated_at_raw.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "updated_at".into(), rusqlite::types::Type::Text)
            })?,
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let id_raw: String = row.get("id")?;
        let status_raw: String = row.get("status")?;
        let trigger_time_raw: String = row.get("trigger_time")?;
        let start_time_raw: Option<String> = row.get("start_time")?;
        let end_time_raw: Option<String> = row.get("end_time")?;

        let parse_instant = |s: &str| -> rusqlite::Result<crate::time::Instant> {
            s.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "timestamp".into(), rusqlite::types::Type::Text)
            })
        };
        let status = match status_raw.as_str() {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "timeout" => JobStatus::Timeout,
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    0,
                    format!("unknown job status: {other}"),
                    rusqlite::types::Type::Text,
                ))
            }
        };

        Ok(Job {
            id: id_raw
                .parse()
                .map_err(|_| rusqlite::Error::InvalidColumnType(0, "id".into(), rusqlite::types::Type::Text))?,
            task_hash_id: row.get("task_hash_id")?,
            trigger_time: parse_instant(&trigger_time_raw)?,
            start_time: start_time_raw.as_deref().map(parse_instant).transpose()?,
            end_time: end_time_raw.as_deref().map(parse_instant).transpose()?,
            status,
            exit_code: row.get("exit_code")?,
            error_message: row.get("error_message")?,
            output_log_path: row.get("output_log_path")?,
            retry_count: row.get::<_, i64>("retry_count")? as u32,
        })
    }
}

fn status_str(status: JobStatus) -> &'static str {
    status.as_str()
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_task(&self, task: Task) -> Result<Task> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO tasks (hash_id, name, description, schedule_type, schedule_config, target,
                working_directory, environment, timeout_seconds, max_retries, retry_delay_seconds,
                enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(hash_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                schedule_type = excluded.schedule_type,
                schedule_config = excluded.schedule_config,
                target = excluded.target,
                working_directory = excluded.working_directory,
                environment = excluded.environment,
                timeout_seconds = excluded.timeout_seconds,
                max_retries = excluded.max_retries,
                retry_delay_seconds = excluded.retry_delay_seconds,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                task.hash_id,
                task.name,
                task.description,
                serde_json::to_string(&task.schedule_type)?,
                serde_json::to_string(&task.schedule_config)?,
                serde_json::to_string(&task.target)?,
                task.working_directory,
                serde_json::to_string(&task.environment)?,
                task.timeout_seconds.map(|v| v as i64),
                task.max_retries,
                task.retry_delay_seconds,
                task.enabled,
                task.created_at.to_string(),
                task.updated_at.to_string(),
            ],
        )?;
        Ok(task)
    }

    async fn get_task(&self, hash_id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT * FROM tasks WHERE hash_id = ?1",
            params![hash_id],
            Self::row_to_task,
        )
        .optional()
        .map_err(SchedulerError::from)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at")?;
        let tasks = stmt
            .query_map([], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    async fn delete_task(&self, hash_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let affected = conn.execute("DELETE FROM tasks WHERE hash_id = ?1", params![hash_id])?;
        if affected == 0 {
            return Err(SchedulerError::not_found(format!("No task with hash_id {hash_id}")));
        }
        Ok(())
    }

    async fn count_tasks(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO jobs (id, task_hash_id, trigger_time, start_time, end_time, status,
                exit_code, error_message, output_log_path, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id.to_string(),
                job.task_hash_id,
                job.trigger_time.to_string(),
                job.start_time.map(|t| t.to_string()),
                job.end_time.map(|t| t.to_string()),
                status_str(job.status),
                job.exit_code,
                job.error_message,
                job.output_log_path,
                job.retry_count,
            ],
        )?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let affected = conn.execute(
            "UPDATE jobs SET start_time = ?1, end_time = ?2, status = ?3, exit_code = ?4,
                error_message = ?5, output_log_path = ?6, retry_count = ?7
             WHERE id = ?8",
            params![
                job.start_time.map(|t| t.to_string()),
                job.end_time.map(|t| t.to_string()),
                status_str(job.status),
                job.exit_code,
                job.error_message,
                job.output_log_path,
                job.retry_count,
                job.id.to_string(),
            ],
        )?;
        if affected == 0 {
            return Err(SchedulerError::not_found(format!("No job with id {}", job.id)));
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_job,
        )
        .optional()
        .map_err(SchedulerError::from)
    }

    async fn list_jobs(&self, task_hash_id: Option<&str>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let jobs = match task_hash_id {
            Some(hash_id) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE task_hash_id = ?1 ORDER BY trigger_time DESC",
                )?;
                stmt.query_map(params![hash_id], Self::row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY trigger_time DESC")?;
                stmt.query_map([], Self::row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(jobs)
    }

    async fn count_jobs(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
