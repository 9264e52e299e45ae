//! Named command locks.
//!
//! Long-running command operations (calibrate, model activation) must not
//! run concurrently with themselves, but also must not hold the shared data
//! locks across collaborator I/O. The registry hands out one mutex per
//! command name; ownership is explicit, the registry lives on the system
//! rather than in a process-global table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

#[derive(Default)]
pub struct CommandLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Scoped handle to a named lock. Dropping it releases the lock.
pub struct CommandGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl CommandLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the named lock is available and return a scoped guard.
    pub fn acquire(&self, name: &str) -> CommandGuard {
        let lock = self.named(name);
        CommandGuard { _guard: lock.lock_arc() }
    }

    /// Non-blocking variant; `None` when another caller holds the lock.
    pub fn try_acquire(&self, name: &str) -> Option<CommandGuard> {
        let lock = self.named(name);
        lock.try_lock_arc().map(|guard| CommandGuard { _guard: guard })
    }

    fn named(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}
