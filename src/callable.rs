//! In-process work functions that a task can target instead of a shell
//! command. Registered once at startup under a string key; tasks and jobs
//! only ever carry the key, never the function pointer itself, since both
//! are persisted to the Store.

use crate::error::{Result, SchedulerError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A named, zero-argument unit of work a task can target.
pub trait Callable: Send + Sync {
    fn call(&self) -> Result<()>;
}

impl<F> Callable for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn call(&self) -> Result<()> {
        self()
    }
}

/// Process-wide table of registered callables, keyed by the name tasks
/// reference from their `callable_func` field.
#[derive(Clone, Default)]
pub struct CallableRegistry {
    entries: Arc<RwLock<HashMap<String, Arc<dyn Callable>>>>,
}

impl fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let keys: Vec<String> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        f.debug_struct("CallableRegistry").field("keys", &keys).finish()
    }
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callable` under `key`, replacing any prior registration.
    pub fn register(&self, key: impl Into<String>, callable: impl Callable + 'static) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(key.into(), Arc::new(callable));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().expect("registry lock poisoned").contains_key(key)
    }

    /// Run the callable registered under `key`.
    ///
    /// Errors with `SchedulerError::Validation` if no callable is
    /// registered under that key — the Subprocess Runner maps this onto
    /// the same "invalid target" case as an unparseable shell command.
    pub fn call(&self, key: &str) -> Result<()> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let callable = entries
            .get(key)
            .ok_or_else(|| SchedulerError::validation(format!("Unknown callable target: {key}")))?
            .clone();
        drop(entries);
        callable.call()
    }
}
