//! Shared helpers for bus integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use softbus_core::{BusConfig, FiberConfig};
use softbus_runtime::{static_check, Bus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fiber stack generous enough for formatting and tracing
pub const TEST_FIBER_STACK_SIZE_BYTES: usize = 256 * 1024;

const WAIT_TIMEOUT_MS: u64 = 5_000;
const WAIT_POLL_MS: u64 = 2;

/// Poll `cond` until it holds or the timeout passes
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(WAIT_TIMEOUT_MS);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(WAIT_POLL_MS));
    }
    cond()
}

pub fn init(config: BusConfig) -> Bus {
    Bus::init(config, &static_check()).expect("bus init")
}

pub fn fiber(fid: u32) -> FiberConfig {
    FiberConfig::new(fid).with_stack_size(TEST_FIBER_STACK_SIZE_BYTES)
}

/// Ordered record of callbacks, shared with every thread
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn wait_for(&self, event: &str) -> bool {
        wait_until(|| self.contains(event))
    }

    pub fn wait_for_len(&self, len: usize) -> bool {
        wait_until(|| self.len() >= len)
    }
}
