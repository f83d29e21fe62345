//! Fibers and the fiber scheduler
//!
//! TigerStyle: Cooperative only, one running fiber per group, no preemption.
//!
//! Each fiber owns a stack for the whole bus lifetime. The first resume
//! creates a coroutine on that stack and enters `route`; later resumes
//! continue after the last yield. When `route` returns the coroutine is
//! dropped and its stack goes back to the slot, so the next resume starts
//! `route` again.
//!
//! Coroutines cannot leave the thread that created them, so the slots live in
//! thread-local storage of the group thread. Shared scheduling state lives in
//! the group.

use crate::group::GroupShared;
use crate::handle::BusHandle;
use crate::protocol::fatal;
use crate::stack::FiberStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use once_cell::sync::OnceCell;
use softbus_core::error::BusError;
use softbus_core::FiberId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

/// A cooperatively scheduled task with its own stack
///
/// Every callback runs on the fiber's stack, on the owning group thread.
pub trait Fiber: Send + Sync + 'static {
    fn on_init(&self, _ctx: &FiberContext) {}

    fn on_exit(&self, _ctx: &FiberContext) {}

    /// Entry point. May call [`FiberContext::yield_now`] any number of times.
    fn route(&self, ctx: &FiberContext);
}

/// What a fiber callback can reach
#[derive(Clone)]
pub struct FiberContext {
    fid: FiberId,
    bus: BusHandle,
}

impl FiberContext {
    pub(crate) fn new(fid: FiberId, bus: BusHandle) -> Self {
        Self { fid, bus }
    }

    pub fn fid(&self) -> FiberId {
        self.fid
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// Suspend this fiber and switch back to whoever resumed it
    pub fn yield_now(&self) {
        self.bus.filber_yield();
    }
}

impl std::fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberContext")
            .field("fid", &self.fid)
            .finish_non_exhaustive()
    }
}

/// Outcome of one resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// The fiber yielded and will continue where it left off
    Yielded,
    /// `route` returned; the next resume starts it again
    Finished,
}

/// Runtime state of one configured fiber
pub(crate) struct FiberEntry {
    pub(crate) fid: FiberId,
    pub(crate) group: usize,
    pub(crate) index: usize,
    binding: OnceCell<Arc<dyn Fiber>>,
}

impl FiberEntry {
    pub(crate) fn new(fid: FiberId, group: usize, index: usize) -> Self {
        Self {
            fid,
            group,
            index,
            binding: OnceCell::new(),
        }
    }

    pub(crate) fn binding(&self) -> Option<&Arc<dyn Fiber>> {
        self.binding.get()
    }

    pub(crate) fn bind(&self, fiber: Arc<dyn Fiber>) -> Result<(), BusError> {
        self.binding
            .set(fiber)
            .map_err(|_| BusError::no_perm(format!("fiber {} already registered", self.fid)))
    }
}

impl std::fmt::Debug for FiberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberEntry")
            .field("fid", &self.fid)
            .field("group", &self.group)
            .field("index", &self.index)
            .field("registered", &self.binding().is_some())
            .finish()
    }
}

// =============================================================================
// Thread-Local Slots
// =============================================================================

type FiberCoroutine = Coroutine<(), (), (), FiberStack>;

enum Slot {
    /// Not inside `route`; the stack is free
    Parked(FiberStack),
    /// Suspended inside `route`
    Active(FiberCoroutine),
    /// Taken out while running
    Lent,
}

struct LocalFibers {
    slots: RefCell<Vec<Slot>>,
}

thread_local! {
    static LOCAL_FIBERS: RefCell<Option<Rc<LocalFibers>>> = const { RefCell::new(None) };
    static CURRENT_YIELDER: Cell<*const Yielder<(), ()>> = const { Cell::new(std::ptr::null()) };
}

/// Give the current group thread its fiber stacks, in table order
pub(crate) fn install(stacks: Vec<FiberStack>) {
    let stack_bytes: usize = stacks.iter().map(FiberStack::size_bytes).sum();
    debug!(fibers = stacks.len(), stack_bytes, "Installing fiber stacks");
    let local = LocalFibers {
        slots: RefCell::new(stacks.into_iter().map(Slot::Parked).collect()),
    };
    LOCAL_FIBERS.with(|cell| {
        let previous = cell.borrow_mut().replace(Rc::new(local));
        debug_assert!(previous.is_none(), "fiber slots installed twice");
    });
}

/// Drop every slot of the current thread, unwinding suspended fibers
pub(crate) fn uninstall() {
    let local = LOCAL_FIBERS.with(|cell| cell.borrow_mut().take());
    drop(local);
}

fn local() -> Rc<LocalFibers> {
    match LOCAL_FIBERS.with(|cell| cell.borrow().clone()) {
        Some(local) => local,
        None => fatal(format_args!("fiber operation outside a group thread")),
    }
}

fn take_slot(local: &LocalFibers, index: usize) -> Slot {
    std::mem::replace(&mut local.slots.borrow_mut()[index], Slot::Lent)
}

fn put_slot(local: &LocalFibers, index: usize, slot: Slot) {
    local.slots.borrow_mut()[index] = slot;
}

// =============================================================================
// Resume / Yield
// =============================================================================

/// Switch into fiber `index`, which the scheduler has already made current
pub(crate) fn run_current(bus: &BusHandle, group: &GroupShared, index: usize) -> FiberStatus {
    let entry = &group.fibers[index];
    let local = local();

    let mut coroutine = match take_slot(&local, index) {
        Slot::Active(coroutine) => coroutine,
        Slot::Parked(stack) => match entry.binding() {
            Some(fiber) => {
                let fiber = Arc::clone(fiber);
                let ctx = FiberContext::new(entry.fid, bus.clone());
                Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
                    CURRENT_YIELDER.with(|cell| cell.set(yielder as *const Yielder<(), ()>));
                    fiber.route(&ctx);
                })
            }
            None => {
                put_slot(&local, index, Slot::Parked(stack));
                return FiberStatus::Finished;
            }
        },
        Slot::Lent => fatal(format_args!("fiber {} re-entered while running", entry.fid)),
    };

    let result = coroutine.resume(());
    CURRENT_YIELDER.with(|cell| cell.set(std::ptr::null()));

    let (slot, status) = match result {
        CoroutineResult::Yield(()) => (Slot::Active(coroutine), FiberStatus::Yielded),
        CoroutineResult::Return(()) => (Slot::Parked(coroutine.into_stack()), FiberStatus::Finished),
    };
    put_slot(&local, index, slot);

    trace!(fid = entry.fid, ?status, "Fiber switched back");
    status
}

/// Suspend the fiber running on this thread
pub(crate) fn yield_current() {
    let yielder = CURRENT_YIELDER.with(Cell::get);
    if yielder.is_null() {
        fatal(format_args!("yield outside of a running fiber"));
    }

    // SAFETY: the pointer was set by the coroutine body now executing on this
    // thread; its Yielder lives on that coroutine's stack until `route` returns.
    unsafe { (*yielder).suspend(()) };

    CURRENT_YIELDER.with(|cell| cell.set(yielder));
}

/// Resume the busy head of `group`, if any
pub(crate) fn resume_next(bus: &BusHandle, group: &GroupShared) -> bool {
    let Some(index) = group.fiber_sched.lock().pop_busy() else {
        return false;
    };
    run_current(bus, group, index);
    group.fiber_sched.lock().suspend(index);
    true
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Run `f` on the parked stack of fiber `index` with it marked current.
///
/// A fiber still suspended inside `route` is unwound first.
fn on_own_stack(group: &GroupShared, index: usize, f: impl FnOnce()) {
    let local = local();
    let mut stack = match take_slot(&local, index) {
        Slot::Parked(stack) => stack,
        Slot::Active(mut coroutine) => {
            debug!(fid = group.fibers[index].fid, "Unwinding suspended fiber");
            coroutine.force_unwind();
            coroutine.into_stack()
        }
        Slot::Lent => return,
    };

    let began = group.fiber_sched.lock().begin(index);
    debug_assert!(began, "lifecycle callback while a fiber is running");
    stack.run(f);
    group.fiber_sched.lock().finish(index, false);

    put_slot(&local, index, Slot::Parked(stack));
}

/// Run `on_init` for every bound fiber of the group, in table order
pub(crate) fn init_all(bus: &BusHandle, group: &GroupShared) {
    for entry in &group.fibers {
        let Some(fiber) = entry.binding() else {
            debug!(fid = entry.fid, "Fiber not registered, skipping init");
            continue;
        };
        let ctx = FiberContext::new(entry.fid, bus.clone());
        on_own_stack(group, entry.index, || fiber.on_init(&ctx));
    }
}

/// Run `on_exit` for every bound fiber of the group, in table order
pub(crate) fn exit_all(bus: &BusHandle, group: &GroupShared) {
    for entry in &group.fibers {
        let Some(fiber) = entry.binding() else {
            continue;
        };
        let ctx = FiberContext::new(entry.fid, bus.clone());
        on_own_stack(group, entry.index, || fiber.on_exit(&ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl Fiber for Idle {
        fn route(&self, _ctx: &FiberContext) {}
    }

    #[test]
    fn test_entry_binds_once() {
        let entry = FiberEntry::new(7, 0, 0);
        assert!(entry.binding().is_none());
        entry.bind(Arc::new(Idle)).unwrap();
        assert!(entry.bind(Arc::new(Idle)).is_err());
    }

    #[test]
    #[should_panic(expected = "yield outside of a running fiber")]
    fn test_yield_outside_fiber_is_fatal() {
        yield_current();
    }

    #[test]
    #[should_panic(expected = "outside a group thread")]
    fn test_slots_require_group_thread() {
        local();
    }
}
