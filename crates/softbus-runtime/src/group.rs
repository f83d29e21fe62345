//! Groups: one OS thread, one event loop, two schedulers
//!
//! TigerStyle: Fixed tables, explicit startup handshake, symmetric teardown.
//!
//! A group thread registers itself, signals ready and blocks until it is told
//! to run or to abort. Running means `on_init` for services then fibers, the
//! drive loop, and `on_exit` for fibers then services.

use crate::event_loop::{EventLoop, LoopWaker};
use crate::fiber::{self, FiberEntry};
use crate::handle::BusHandle;
use crate::scheduler::Scheduler;
use crate::service::{self, ServiceEntry};
use crate::stack::FiberStack;
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use softbus_core::constants::FIBER_RESUME_BATCH_COUNT_MAX;
use softbus_core::error::{Error, Result};
use softbus_core::{FiberId, ServiceId};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, info, info_span};

thread_local! {
    /// (bus generation, group index) of the group running on this thread
    static CURRENT_GROUP: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// The group owning the calling thread, if any
pub(crate) fn current_group() -> Option<(u64, usize)> {
    CURRENT_GROUP.with(Cell::get)
}

/// Diagnostic view of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub index: usize,
    /// Configured thread priority; recorded, not applied to the OS thread
    pub priority: i64,
    /// Configured thread stack size, zero for the platform default
    pub stack_size_bytes: usize,
    pub services: Vec<ServiceId>,
    pub fibers: Vec<FiberId>,
    /// Set once the thread has started
    pub thread_id: Option<ThreadId>,
    pub thread_name: Option<String>,
}

/// State of one group shared with every thread
pub(crate) struct GroupShared {
    pub(crate) index: usize,
    priority: i64,
    stack_size_bytes: usize,
    pub(crate) services: Vec<Arc<ServiceEntry>>,
    pub(crate) fibers: Vec<Arc<FiberEntry>>,
    pub(crate) service_sched: Mutex<Scheduler>,
    pub(crate) fiber_sched: Mutex<Scheduler>,
    pub(crate) looping: AtomicBool,
    pub(crate) waker: LoopWaker,
    thread: OnceCell<(ThreadId, Option<String>)>,
}

impl GroupShared {
    pub(crate) fn new(
        index: usize,
        priority: i64,
        stack_size_bytes: usize,
        services: Vec<Arc<ServiceEntry>>,
        fibers: Vec<Arc<FiberEntry>>,
        waker: LoopWaker,
    ) -> Self {
        debug_assert!(services.iter().enumerate().all(|(i, s)| s.index == i && s.group == index));
        debug_assert!(fibers.iter().enumerate().all(|(i, f)| f.index == i && f.group == index));

        Self {
            index,
            priority,
            stack_size_bytes,
            service_sched: Mutex::new(Scheduler::new(services.len())),
            fiber_sched: Mutex::new(Scheduler::new(fibers.len())),
            services,
            fibers,
            looping: AtomicBool::new(true),
            waker,
            thread: OnceCell::new(),
        }
    }

    pub(crate) fn info(&self) -> GroupInfo {
        let thread = self.thread.get();
        GroupInfo {
            index: self.index,
            priority: self.priority,
            stack_size_bytes: self.stack_size_bytes,
            services: self.services.iter().map(|s| s.sid).collect(),
            fibers: self.fibers.iter().map(|f| f.fid).collect(),
            thread_id: thread.map(|(id, _)| *id),
            thread_name: thread.and_then(|(_, name)| name.clone()),
        }
    }

    /// Ask the drive loop to stop after its current pass
    pub(crate) fn stop(&self) {
        self.looping.store(false, Ordering::Release);
        self.waker.wake();
    }
}

impl std::fmt::Debug for GroupShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupShared")
            .field("index", &self.index)
            .field("services", &self.services.len())
            .field("fibers", &self.fibers.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Thread
// =============================================================================

/// Second half of the startup handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Start {
    Run,
    Abort,
}

/// Owner side of a spawned group thread
#[derive(Debug)]
pub(crate) struct GroupThread {
    pub(crate) index: usize,
    start_tx: Sender<Start>,
    ready_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl GroupThread {
    /// Spawn the thread for `group`; it blocks after signalling ready
    pub(crate) fn spawn(
        bus: BusHandle,
        group: Arc<GroupShared>,
        event_loop: EventLoop,
        stacks: Vec<FiberStack>,
    ) -> Result<Self> {
        let index = group.index;
        let (ready_tx, ready_rx) = bounded(1);
        let (start_tx, start_rx) = bounded(1);

        let mut builder = std::thread::Builder::new().name(format!("softbus-group-{}", index));
        if group.stack_size_bytes != 0 {
            builder = builder.stack_size(group.stack_size_bytes);
        }

        let join = builder
            .spawn(move || group_main(bus, group, event_loop, stacks, ready_tx, start_rx))
            .map_err(|e| Error::ThreadSpawnFailed {
                group: index,
                reason: e.to_string(),
            })?;

        Ok(Self {
            index,
            start_tx,
            ready_rx,
            join: Some(join),
        })
    }

    /// Block until the thread has registered itself
    pub(crate) fn wait_ready(&self) -> Result<()> {
        self.ready_rx
            .recv()
            .map_err(|_| Error::GroupPanicked { group: self.index })
    }

    /// Release the thread from its start barrier
    pub(crate) fn start(&self, start: Start) -> Result<()> {
        self.start_tx
            .send(start)
            .map_err(|_| Error::GroupPanicked { group: self.index })
    }

    /// Wait for the thread to finish
    pub(crate) fn join(&mut self) -> Result<()> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| Error::GroupPanicked { group: self.index }),
            None => Ok(()),
        }
    }
}

fn group_main(
    bus: BusHandle,
    group: Arc<GroupShared>,
    event_loop: EventLoop,
    stacks: Vec<FiberStack>,
    ready_tx: Sender<()>,
    start_rx: Receiver<Start>,
) {
    let span = info_span!("group", group = group.index);
    let _enter = span.enter();

    CURRENT_GROUP.with(|cell| cell.set(Some((bus.generation(), group.index))));
    let current = std::thread::current();
    let _ = group
        .thread
        .set((current.id(), current.name().map(str::to_owned)));
    fiber::install(stacks);

    let start = match ready_tx.send(()) {
        Ok(()) => start_rx.recv().unwrap_or(Start::Abort),
        Err(_) => Start::Abort,
    };

    match start {
        Start::Run => run(&bus, &group, &event_loop),
        Start::Abort => debug!("Group released without load"),
    }

    fiber::uninstall();
    CURRENT_GROUP.with(|cell| cell.set(None));
}

fn run(bus: &BusHandle, group: &GroupShared, event_loop: &EventLoop) {
    info!(
        services = group.services.len(),
        fibers = group.fibers.len(),
        "Group started"
    );

    service::init_all(bus, group);
    fiber::init_all(bus, group);

    while group.looping.load(Ordering::Acquire) {
        event_loop.run_once();
        drive(bus, group);
    }

    fiber::exit_all(bus, group);
    service::exit_all(bus, group);

    info!("Group stopped");
}

/// One pass over the busy queues of both schedulers
fn drive(bus: &BusHandle, group: &GroupShared) {
    // Services that become busy during this pass wait for the next one
    let rounds = group.service_sched.lock().busy_len();
    for _ in 0..rounds {
        if !service::dispatch_next(bus, group) {
            break;
        }
    }

    for _ in 0..FIBER_RESUME_BATCH_COUNT_MAX {
        if !fiber::resume_next(bus, group) {
            break;
        }
    }

    let services_busy = group.service_sched.lock().busy_len();
    let fibers_busy = group.fiber_sched.lock().busy_len();
    if services_busy + fibers_busy > 0 {
        group.waker.wake();
    }
}
