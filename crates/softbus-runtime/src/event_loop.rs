//! Per-group event loop
//!
//! TigerStyle: One loop per group thread, woken explicitly.
//!
//! The loop is a current-thread tokio runtime parked on a `Notify`. Any thread
//! can wake it; a wake that arrives while the loop is not parked is stored and
//! makes the next `run_once` return immediately.

use softbus_core::error::{Error, Result};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;

/// Handle used by other threads to wake a group
#[derive(Debug, Clone)]
pub(crate) struct LoopWaker {
    notify: Arc<Notify>,
}

impl LoopWaker {
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Event loop owned by one group thread
pub(crate) struct EventLoop {
    runtime: Runtime,
    notify: Arc<Notify>,
}

impl EventLoop {
    /// Build the loop for `group`
    pub(crate) fn new(group: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .build()
            .map_err(|e| Error::EventLoopFailed {
                group,
                reason: e.to_string(),
            })?;

        Ok(Self {
            runtime,
            notify: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn waker(&self) -> LoopWaker {
        LoopWaker {
            notify: self.notify.clone(),
        }
    }

    /// Park until woken once
    pub(crate) fn run_once(&self) {
        self.runtime.block_on(self.notify.notified());
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}
