//! Idle/busy scheduler
//!
//! TigerStyle: Explicit states, one running entry per group.
//!
//! The same bookkeeping drives both the service scheduler and the fiber
//! scheduler of a group. Entries are slot indices into the group's tables.
//! A busy entry sits in the FIFO busy queue exactly once.

use std::collections::VecDeque;

/// Scheduling state of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing to do
    Idle,
    /// Queued to run
    Busy,
    /// Currently running
    Running,
    /// Running, and woken again before it stopped
    RunningWoken,
}

/// Idle/busy bookkeeping for one table of a group
#[derive(Debug)]
pub(crate) struct Scheduler {
    states: Vec<RunState>,
    busy: VecDeque<usize>,
    current: Option<usize>,
}

impl Scheduler {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            states: vec![RunState::Idle; count],
            busy: VecDeque::with_capacity(count),
            current: None,
        }
    }

    pub(crate) fn state(&self, index: usize) -> RunState {
        self.states[index]
    }

    pub(crate) fn current(&self) -> Option<usize> {
        self.current
    }

    pub(crate) fn busy_len(&self) -> usize {
        self.busy.len()
    }

    /// Mark an entry as having work.
    ///
    /// Returns true if it moved from idle to busy.
    pub(crate) fn wake(&mut self, index: usize) -> bool {
        match self.states[index] {
            RunState::Idle => {
                self.states[index] = RunState::Busy;
                self.busy.push_back(index);
                true
            }
            RunState::Running => {
                self.states[index] = RunState::RunningWoken;
                false
            }
            RunState::Busy | RunState::RunningWoken => false,
        }
    }

    /// Move an entry back to idle if it is waiting in the busy queue
    pub(crate) fn settle(&mut self, index: usize) {
        if self.states[index] == RunState::Busy {
            self.busy.retain(|&i| i != index);
            self.states[index] = RunState::Idle;
        }
        debug_assert!(!self.busy.contains(&index) || self.states[index] == RunState::Busy);
    }

    /// Take the busy head and make it current
    pub(crate) fn pop_busy(&mut self) -> Option<usize> {
        debug_assert!(self.current.is_none(), "pop_busy while an entry is running");
        let index = self.busy.pop_front()?;
        debug_assert_eq!(self.states[index], RunState::Busy);
        self.states[index] = RunState::Running;
        self.current = Some(index);
        Some(index)
    }

    /// Make `index` current, pulling it out of the busy queue if needed.
    ///
    /// Returns false if another entry is already running.
    pub(crate) fn begin(&mut self, index: usize) -> bool {
        if self.current.is_some() {
            return false;
        }
        if self.states[index] == RunState::Busy {
            self.busy.retain(|&i| i != index);
        }
        self.states[index] = RunState::Running;
        self.current = Some(index);
        true
    }

    /// Stop the current entry, busy if `has_work` and idle otherwise.
    ///
    /// Used by services, whose work is exactly their queued messages.
    pub(crate) fn finish(&mut self, index: usize, has_work: bool) {
        debug_assert_eq!(self.current, Some(index));
        self.current = None;

        if has_work {
            self.states[index] = RunState::Busy;
            self.busy.push_back(index);
        } else {
            self.states[index] = RunState::Idle;
        }
    }

    /// Stop the current entry, busy again only if it was woken while running.
    ///
    /// Used by fibers, whose work is signalled by wake-ups.
    pub(crate) fn suspend(&mut self, index: usize) {
        let woken = self.states[index] == RunState::RunningWoken;
        self.finish(index, woken);
    }
}
