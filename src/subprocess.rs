//! Runs a task's target — a shell command or a registered callable — as a
//! single tracked execution. Output always lands in a log file whose first
//! line is `command: <target>`, so a human staring at the log directory
//! can tell what ran without cross-referencing the catalog.

use crate::callable::CallableRegistry;
use crate::error::{Result, SchedulerError};
use crate::task::TaskTarget;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunnerStatus {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

enum RunningKind {
    Process(Child, Option<u32>),
    Callable(Option<JoinHandle<Result<()>>>),
    Finished(i32),
}

struct RunningState {
    kind: RunningKind,
    log_path: PathBuf,
}

/// One runner tracks exactly one in-flight execution at a time; the Job
/// Executor owns one runner per job.
pub struct SubprocessRunner {
    state: Mutex<Option<RunningState>>,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    pub async fn start(
        &self,
        target: &TaskTarget,
        working_directory: Option<&str>,
        environment: &BTreeMap<String, String>,
        log_path: PathBuf,
        registry: Option<&CallableRegistry>,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Err(SchedulerError::conflict("Runner is already running"));
        }

        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log_file = std::fs::File::create(&log_path)?;
        use std::io::Write;
        writeln!(log_file, "command: {}", target.label())?;
        drop(log_file);

        let kind = match target {
            TaskTarget::Command(command) => {
                let stdout_file = std::fs::OpenOptions::new().append(true).open(&log_path)?;
                let stderr_file = std::fs::OpenOptions::new().append(true).open(&log_path)?;

                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                if let Some(dir) = working_directory {
                    cmd.current_dir(dir);
                }
                cmd.envs(environment.iter());
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::from(stdout_file));
                cmd.stderr(Stdio::from(stderr_file));

                let child = cmd
                    .spawn()
                    .map_err(|e| SchedulerError::validation(format!("Failed to start command: {e}")))?;
                let pid = child.id();
                RunningKind::Process(child, pid)
            }
            TaskTarget::Callable(key) => {
                let registry = registry
                    .ok_or_else(|| SchedulerError::validation("No callable registry configured"))?;
                if !registry.contains(key) {
                    return Err(SchedulerError::validation(format!(
                        "Unknown callable target: {key}"
                    )));
                }
                let registry = registry.clone();
                let key = key.clone();
                let handle = tokio::task::spawn_blocking(move || registry.call(&key));
                RunningKind::Callable(Some(handle))
            }
        };

        *guard = Some(RunningState { kind, log_path });
        Ok(())
    }

    pub async fn status(&self) -> Result<RunnerStatus> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(RunnerStatus {
                running: false,
                exit_code: None,
                output: String::new(),
            });
        };
        let output = read_output(&state.log_path)?;

        match &mut state.kind {
            RunningKind::Process(child, _pid) => match child.try_wait()? {
                Some(exit) => {
                    let code = exit.code();
                    state.kind = RunningKind::Finished(code.unwrap_or(-1));
                    Ok(RunnerStatus {
                        running: false,
                        exit_code: code,
                        output,
                    })
                }
                None => Ok(RunnerStatus {
                    running: true,
                    exit_code: None,
                    output,
                }),
            },
            RunningKind::Callable(handle_slot) => {
                let finished = handle_slot.as_ref().map(|h| h.is_finished()).unwrap_or(false);
                if finished {
                    let handle = handle_slot.take().expect("checked Some above");
                    let result = handle
                        .await
                        .map_err(|e| SchedulerError::internal(format!("callable task panicked: {e}")))?;
                    let code = match result {
                        Ok(()) => 0,
                        Err(err) => {
                            append_line(&state.log_path, &format!("error: {err}"))?;
                            1
                        }
                    };
                    state.kind = RunningKind::Finished(code);
                    Ok(RunnerStatus {
                        running: false,
                        exit_code: Some(code),
                        output,
                    })
                } else {
                    Ok(RunnerStatus {
                        running: true,
                        exit_code: None,
                        output,
                    })
                }
            }
            RunningKind::Finished(code) => Ok(RunnerStatus {
                running: false,
                exit_code: Some(*code),
                output,
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.state.lock().await.as_ref(), Some(state) if matches!(state.kind, RunningKind::Process(..) | RunningKind::Callable(Some(_))))
    }

    /// Graceful-then-hard stop: SIGTERM (unix) followed by a grace period,
    /// then a hard kill if the process is still alive.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(SchedulerError::conflict("Runner is not running"));
        };

        match &mut state.kind {
            RunningKind::Process(child, pid) => {
                #[cfg(unix)]
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(*pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                #[cfg(not(unix))]
                let _ = pid;

                tokio::select! {
                    _ = child.wait() => {}
                    _ = tokio::time::sleep(STOP_GRACE_PERIOD) => {
                        child.start_kill().ok();
                        child.wait().await.ok();
                    }
                }
                *guard = None;
                Ok(())
            }
            RunningKind::Callable(handle_slot) => {
                if let Some(handle) = handle_slot.take() {
                    handle.abort();
                }
                *guard = None;
                Ok(())
            }
            RunningKind::Finished(_) => Err(SchedulerError::conflict("Runner is not running")),
        }
    }
}

fn read_output(log_path: &Path) -> Result<String> {
    match std::fs::read_to_string(log_path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn append_line(log_path: &Path, line: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(log_path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
