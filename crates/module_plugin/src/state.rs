use std::sync::RwLock;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Default)]
struct Inner {
    state: ModuleState,
    last_error: Option<String>,
}

/// Execution state of an executable module, as observed by the host.
///
/// The host drives the transitions around each execute dispatch; modules only read.
#[derive(Debug, Default)]
pub struct StateTracker {
    inner: RwLock<Inner>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        let mut inner = self.write();
        inner.state = ModuleState::Running;
        inner.last_error = None;
    }

    pub fn complete(&self) {
        self.write().state = ModuleState::Completed;
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut inner = self.write();
        inner.state = ModuleState::Error;
        inner.last_error = Some(error.into());
    }

    pub fn reset(&self) {
        *self.write() = Inner::default();
    }

    pub fn state(&self) -> ModuleState {
        self.read().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    // A poisoned lock only means a writer panicked mid-assignment of plain values.
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}
