use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::registry::InstanceState;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Per-sandbox liveness history. Ephemeral and shared between the monitor and the lifecycle
/// operations that must reset it.
#[derive(Debug, Clone, Default)]
pub struct HealthHistory {
    entries: Arc<Mutex<HashMap<String, SandboxHealth>>>,
}

/// The tracked liveness of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxHealth {
    /// The last state the monitor settled on
    pub last_state: InstanceState,

    /// Consecutive checks that found the sandbox stopped while it was believed running
    pub failures: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HealthHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// The tracked liveness of a sandbox.
    pub fn get(&self, sandbox_id: &str) -> Option<SandboxHealth> {
        self.entries().get(sandbox_id).copied()
    }

    /// Records the liveness of a sandbox.
    pub fn set(&self, sandbox_id: &str, health: SandboxHealth) {
        self.entries().insert(sandbox_id.to_string(), health);
    }

    /// Forgets a sandbox, e.g. when it is destroyed or explicitly started.
    pub fn clear(&self, sandbox_id: &str) {
        self.entries().remove(sandbox_id);
    }

    /// Forgets every sandbox.
    pub fn clear_all(&self) {
        self.entries().clear();
    }

    /// Number of tracked sandboxes.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no sandbox is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SandboxHealth>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
