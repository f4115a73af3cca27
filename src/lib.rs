//! # quicksched
//!
//! `quicksched` is a self-hosted job scheduler: given a declarative catalog
//! of [`Task`]s, it computes when each should next fire, dispatches and
//! supervises the resulting [`Job`] executions, persists outcomes, and
//! enforces retry policy. An HTTP control API and a read-only web UI sit on
//! top of the same [`Store`] the engine itself uses.
//!
//! The modules here map directly onto the components of the design: a pure
//! [`trigger`] algebra turns a schedule into fire instants, [`scheduler`]
//! drives those instants into job executions with at-most-one-active-per-
//! task semantics, [`executor`] supervises one execution through to a
//! terminal status and retry policy, [`reconciler`] keeps the live schedule
//! in sync with a catalog directory, and [`store`] is the durable mapping
//! of tasks and jobs everything else reads and writes through.

pub mod callable;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod job;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod subprocess;
pub mod supervisor;
pub mod task;
pub mod time;
pub mod trigger;
pub mod web;

pub use callable::{Callable, CallableRegistry};
pub use config::{Config, LoadedConfig};
pub use error::{Result, SchedulerError};
pub use executor::{AlertCallback, JobExecutor};
pub use job::{Job, JobStatus};
pub use reconciler::Reconciler;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use store::{SqliteStore, Store};
pub use subprocess::{RunnerStatus, SubprocessRunner};
pub use supervisor::Supervisor;
pub use task::{NewTask, Task, TaskDefinition, TaskTarget};
pub use time::{Clock, Instant, RealClock};
pub use trigger::{ScheduleType, Trigger, TriggerConfig};
