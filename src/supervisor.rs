//! Owns the three long-running workers — scheduler+reconciler, HTTP API,
//! web UI: start each, poll liveness once a second, restart whichever
//! died. The scheduler worker publishes its current [`SchedulerHandle`]
//! over a `watch` channel so a restarted API worker always picks up the
//! live one instead of a stale, disconnected one.

use crate::callable::CallableRegistry;
use crate::config::Config;
use crate::executor::JobExecutor;
use crate::http::{self, ApiState};
use crate::reconciler::Reconciler;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::store::Store;
use crate::task::Task;
use crate::time::Clock;
use crate::web::{self, WebState};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Factory = Box<dyn Fn() -> BoxFuture + Send + Sync>;

struct Worker {
    name: &'static str,
    factory: Factory,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn spawn(name: &'static str, factory: Factory) -> Self {
        let handle = tokio::spawn(factory());
        Self { name, factory, handle }
    }

    fn restart(&mut self) {
        info!(worker = self.name, "restarting dead worker");
        self.handle = tokio::spawn((self.factory)());
    }
}

pub struct Supervisor {
    workers: Vec<Worker>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: &Config,
        programmatic_tasks: Vec<Task>,
        registry: CallableRegistry,
    ) -> Self {
        let task_dir = config
            .task_directories
            .first()
            .cloned()
            .unwrap_or_else(|| config.data_dir.join("tasks"));
        let log_dir = config.data_dir.join("logs");
        let executor = Arc::new(JobExecutor::new(store.clone(), clock.clone(), registry, log_dir));

        let (handle_tx, handle_rx) = watch::channel(SchedulerHandle::detached());

        let workers = vec![
            Self::scheduler_worker(store.clone(), clock, executor, task_dir, programmatic_tasks, handle_tx),
            Self::api_worker(store.clone(), handle_rx, config.backend_api_host.clone(), config.backend_api_port),
            Self::web_worker(store, config.frontend_host.clone(), config.frontend_port),
        ];

        Self { workers }
    }

    /// Poll every worker once a second, restarting any that have exited.
    /// Never returns.
    pub async fn run(mut self) -> ! {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            for worker in &mut self.workers {
                if worker.handle.is_finished() {
                    error!(worker = worker.name, "worker exited unexpectedly");
                    worker.restart();
                }
            }
        }
    }

    fn scheduler_worker(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        executor: Arc<JobExecutor>,
        task_dir: PathBuf,
        programmatic: Vec<Task>,
        handle_tx: watch::Sender<SchedulerHandle>,
    ) -> Worker {
        let factory: Factory = Box::new(move || {
            let store = store.clone();
            let clock = clock.clone();
            let executor = executor.clone();
            let task_dir = task_dir.clone();
            let programmatic = programmatic.clone();
            let handle_tx = handle_tx.clone();
            Box::pin(async move {
                let scheduler = Scheduler::new(store.clone(), clock.clone(), executor);
                let _ = handle_tx.send(scheduler.handle());

                let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
                let reconciler = Reconciler::new(store, clock, scheduler.handle(), task_dir, programmatic);
                let reconciler_task = tokio::spawn(reconciler.run(stop_rx));

                scheduler.run().await;

                let _ = stop_tx.send(());
                let _ = reconciler_task.await;
            })
        });
        Worker::spawn("scheduler", factory)
    }

    fn api_worker(store: Arc<dyn Store>, handle_rx: watch::Receiver<SchedulerHandle>, host: String, port: u16) -> Worker {
        let factory: Factory = Box::new(move || {
            let store = store.clone();
            let scheduler = handle_rx.borrow().clone();
            let host = host.clone();
            Box::pin(async move {
                let state = ApiState { store, scheduler };
                let app = http::router(state);
                serve(&host, port, app, "API").await
            })
        });
        Worker::spawn("api", factory)
    }

    fn web_worker(store: Arc<dyn Store>, host: String, port: u16) -> Worker {
        let factory: Factory = Box::new(move || {
            let store = store.clone();
            let host = host.clone();
            Box::pin(async move {
                let app = web::router(WebState { store });
                serve(&host, port, app, "web UI").await
            })
        });
        Worker::spawn("web", factory)
    }
}

async fn serve(host: &str, port: u16, app: axum::Router, label: &str) {
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(%host, port, error = %e, "invalid {label} bind address");
            return;
        }
    };
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "{label} listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "{label} server exited");
            }
        }
        Err(e) => error!(%addr, error = %e, "failed to bind {label} listener"),
    }
}
