//! Progress of a client joining a server, polled from outside the network tasks.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug)]
struct Inner {
    state: JoinState,
    activity: String,
    progress: f32,
    error_message: Option<String>,
}

#[derive(Debug)]
pub struct JoinStatus {
    inner: Mutex<Inner>,
}

impl Default for JoinStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: JoinState::InProgress,
                activity: "Connecting".to_string(),
                progress: 0.0,
                error_message: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> JoinState {
        self.lock().state
    }

    pub fn current_activity(&self) -> String {
        self.lock().activity.clone()
    }

    /// Starts a new activity; progress restarts at zero.
    pub fn set_current_activity(&self, activity: impl Into<String>) {
        let mut inner = self.lock();
        inner.activity = activity.into();
        inner.progress = 0.0;
    }

    pub fn current_progress(&self) -> f32 {
        self.lock().progress
    }

    pub fn set_current_progress(&self, fraction: f32) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.lock().progress = fraction;
    }

    pub fn set_complete(&self) {
        let mut inner = self.lock();
        if inner.state == JoinState::InProgress {
            inner.state = JoinState::Complete;
            inner.progress = 1.0;
        }
    }

    /// Marks the join as failed with a user-facing reason. The first error wins.
    pub fn set_error_message(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.state == JoinState::Failed {
            return;
        }
        inner.state = JoinState::Failed;
        inner.error_message = Some(message.into());
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state() != JoinState::InProgress
    }
}
