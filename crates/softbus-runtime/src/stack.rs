//! Stack switching
//!
//! TigerStyle: Guarded stacks by default, raw buffers only behind `unsafe`.
//!
//! Register save/restore and the actual switch are delegated to `corosensei`,
//! which carries the per-architecture assembly. Stacks the bus allocates are
//! mapped with a guard page below them, so an overflow faults. A raw buffer has
//! no such page; whoever hands one in promises it is deep enough.

#[cfg(windows)]
compile_error!("softbus fiber stacks are not supported on Windows");

use corosensei::stack::{DefaultStack, Stack, StackPointer};
use softbus_core::constants::{FIBER_STACK_ALIGNMENT_BYTES, FIBER_STACK_CONTEXT_BYTES};
use std::marker::PhantomData;
use std::num::NonZeroUsize;

/// Smallest buffer that still holds one saved context plus one pointer
const STACK_SIZE_BYTES_REQUIRED: usize = FIBER_STACK_CONTEXT_BYTES + std::mem::size_of::<usize>();

/// Usable `[limit, top)` of a buffer, with `top` rounded down to the stack alignment
fn stack_bounds(buf: &[u8]) -> (NonZeroUsize, NonZeroUsize) {
    assert!(
        buf.len() > STACK_SIZE_BYTES_REQUIRED,
        "stack size {} bytes must exceed {} bytes",
        buf.len(),
        STACK_SIZE_BYTES_REQUIRED
    );

    let limit = buf.as_ptr() as usize;
    let top = (limit + buf.len()) & !(FIBER_STACK_ALIGNMENT_BYTES - 1);
    assert!(
        top - limit > STACK_SIZE_BYTES_REQUIRED,
        "aligned stack size {} bytes must exceed {} bytes",
        top - limit,
        STACK_SIZE_BYTES_REQUIRED
    );
    debug_assert_eq!(top % FIBER_STACK_ALIGNMENT_BYTES, 0);

    match (NonZeroUsize::new(top), NonZeroUsize::new(limit)) {
        (Some(top), Some(limit)) => (top, limit),
        _ => unreachable!("slice at address zero"),
    }
}

/// Stack memory lent out for one `on_stack` call
struct BorrowedStack<'a> {
    base: StackPointer,
    limit: StackPointer,
    _mem: PhantomData<&'a mut [u8]>,
}

// SAFETY: `base` and `limit` delimit memory exclusively borrowed for `'a`,
// and `base` is aligned to FIBER_STACK_ALIGNMENT_BYTES.
unsafe impl Stack for BorrowedStack<'_> {
    fn base(&self) -> StackPointer {
        self.base
    }

    fn limit(&self) -> StackPointer {
        self.limit
    }
}

/// Run `func` on `stack` and return its result once it completes.
///
/// A panic inside `func` propagates to the caller after switching back.
///
/// # Panics
///
/// Panics if `stack` cannot hold one saved execution context plus one pointer.
///
/// # Safety
///
/// `stack` has no guard page. `func` and everything it calls must fit in
/// `stack.len()` bytes minus one saved context. Going deeper writes below the
/// start of the slice into unrelated memory.
pub unsafe fn call_in_stack<R>(stack: &mut [u8], func: impl FnOnce() -> R) -> R {
    let (base, limit) = stack_bounds(stack);
    let borrowed = BorrowedStack {
        base,
        limit,
        _mem: PhantomData,
    };

    corosensei::on_stack(borrowed, func)
}

/// Stack owned by a fiber for the whole bus lifetime
pub(crate) enum FiberStack {
    /// Mapped by the bus, guard page below `limit`
    Guarded(DefaultStack),
    /// Caller-supplied buffer, no guard page
    Buffer {
        buf: Box<[u8]>,
        base: StackPointer,
        limit: StackPointer,
    },
}

impl FiberStack {
    /// Map a guarded stack with at least `size_bytes` usable
    pub(crate) fn allocate(size_bytes: usize) -> std::io::Result<Self> {
        DefaultStack::new(size_bytes).map(Self::Guarded)
    }

    /// Wrap a caller-supplied buffer.
    ///
    /// # Safety
    ///
    /// Every closure later run on this stack must fit in `buf`, as for
    /// [`call_in_stack`].
    pub(crate) unsafe fn from_buffer(buf: Box<[u8]>) -> Self {
        let (base, limit) = stack_bounds(&buf);
        Self::Buffer { buf, base, limit }
    }

    pub(crate) fn is_guarded(&self) -> bool {
        matches!(self, Self::Guarded(_))
    }

    /// Usable bytes between `limit` and `base`
    pub(crate) fn size_bytes(&self) -> usize {
        self.base().get() - self.limit().get()
    }

    /// Run `func` on this stack outside of any coroutine
    pub(crate) fn run<R>(&mut self, func: impl FnOnce() -> R) -> R {
        let borrowed = BorrowedStack {
            base: self.base(),
            limit: self.limit(),
            _mem: PhantomData,
        };

        // The `&mut self` borrow keeps the memory exclusive for the call. Its
        // depth contract was accepted when the stack was built.
        corosensei::on_stack(borrowed, func)
    }
}

// SAFETY: a guarded stack delegates to `DefaultStack`. A buffer is boxed and
// never moves while the FiberStack is alive, so `base`/`limit` stay valid;
// `base` is aligned by `stack_bounds`.
unsafe impl Stack for FiberStack {
    fn base(&self) -> StackPointer {
        match self {
            Self::Guarded(stack) => stack.base(),
            Self::Buffer { base, .. } => *base,
        }
    }

    fn limit(&self) -> StackPointer {
        match self {
            Self::Guarded(stack) => stack.limit(),
            Self::Buffer { limit, .. } => *limit,
        }
    }
}

impl std::fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStack")
            .field("guarded", &self.is_guarded())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_STACK_SIZE_BYTES: usize = 64 * 1024;

    /// Set in the child process that is expected to die on the guard page
    const OVERFLOW_CHILD_ENV: &str = "SOFTBUS_STACK_OVERFLOW_CHILD";

    fn local_address() -> usize {
        let marker = 0u64;
        std::hint::black_box(&marker) as *const u64 as usize
    }

    /// Uses 4 KiB of stack per level
    #[inline(never)]
    fn burn_stack(depth: usize) -> u64 {
        let mut frame = [0xAAu8; 4096];
        std::hint::black_box(&mut frame);
        if depth == 0 {
            return u64::from(frame[0]);
        }
        burn_stack(depth - 1) + u64::from(std::hint::black_box(&frame)[4095])
    }

    #[test]
    fn test_call_in_stack_returns_value() {
        let mut stack = vec![0u8; TEST_STACK_SIZE_BYTES];
        // SAFETY: the closure uses a few words of stack
        let result = unsafe { call_in_stack(&mut stack, || 40 + 2) };
        assert_eq!(result, 42);
    }

    #[test]
    fn test_call_in_stack_runs_on_buffer() {
        let mut stack = vec![0u8; TEST_STACK_SIZE_BYTES];
        let start = stack.as_ptr() as usize;
        let end = start + stack.len();

        // SAFETY: one local, far below 64 KiB
        let inside = unsafe { call_in_stack(&mut stack, local_address) };
        assert!(inside >= start && inside < end, "local not on supplied stack");

        let outside = local_address();
        assert!(outside < start || outside >= end);
    }

    #[test]
    fn test_call_in_stack_captures_environment() {
        let mut stack = vec![0u8; TEST_STACK_SIZE_BYTES];
        let mut values = Vec::new();
        // SAFETY: the pushes allocate on the heap, not the stack
        unsafe {
            call_in_stack(&mut stack, || {
                for i in 0..16 {
                    values.push(i * 2);
                }
            });
        }
        assert_eq!(values.len(), 16);
        assert_eq!(values[15], 30);
    }

    #[test]
    #[should_panic(expected = "must exceed")]
    fn test_tiny_stack_rejected() {
        let mut stack = [0u8; 64];
        // SAFETY: rejected before any switch
        unsafe { call_in_stack(&mut stack, || ()) };
    }

    #[test]
    fn test_bounds_are_aligned() {
        let buf = vec![0u8; TEST_STACK_SIZE_BYTES + 7];
        let (top, limit) = stack_bounds(&buf[3..]);
        assert_eq!(top.get() % FIBER_STACK_ALIGNMENT_BYTES, 0);
        assert!(top.get() <= buf[3..].as_ptr() as usize + buf.len() - 3);
        assert_eq!(limit.get(), buf[3..].as_ptr() as usize);
    }

    #[test]
    fn test_allocated_stack_is_guarded_and_large_enough() {
        let mut stack = FiberStack::allocate(TEST_STACK_SIZE_BYTES).unwrap();
        assert!(stack.is_guarded());
        assert!(stack.size_bytes() >= TEST_STACK_SIZE_BYTES);

        let (limit, base) = (stack.limit().get(), stack.base().get());
        let inside = stack.run(local_address);
        assert!(inside >= limit && inside < base, "local not on fiber stack");

        // 32 KiB of frames fit in a 64 KiB stack
        assert_eq!(stack.run(|| burn_stack(8)), 0xAA * 9);
        assert_eq!(stack.run(|| "ok"), "ok");
    }

    #[test]
    fn test_buffer_stack_keeps_its_bounds() {
        let buf = vec![0u8; TEST_STACK_SIZE_BYTES].into_boxed_slice();
        let start = buf.as_ptr() as usize;
        // SAFETY: only small closures run on it below
        let mut stack = unsafe { FiberStack::from_buffer(buf) };
        assert!(!stack.is_guarded());
        assert_eq!(stack.limit().get(), start);
        assert!(stack.size_bytes() <= TEST_STACK_SIZE_BYTES);
        assert_eq!(stack.run(|| 7u8), 7);
    }

    #[test]
    fn test_overflowing_guarded_stack_faults_the_process() {
        if std::env::var_os(OVERFLOW_CHILD_ENV).is_some() {
            let mut stack = FiberStack::allocate(16 * 1024).unwrap();
            // 256 KiB of frames on a 16 KiB stack must hit the guard page
            let value = stack.run(|| burn_stack(64));
            println!("overflow not detected: {}", value);
            std::process::exit(0);
        }

        let exe = std::env::current_exe().unwrap();
        let output = std::process::Command::new(exe)
            .args([
                "--exact",
                "stack::tests::test_overflowing_guarded_stack_faults_the_process",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(OVERFLOW_CHILD_ENV, "1")
            .output()
            .unwrap();

        assert!(!output.status.success(), "overflow ran to completion");
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(!stdout.contains("overflow not detected"), "{}", stdout);

        use std::os::unix::process::ExitStatusExt;
        assert!(
            output.status.signal().is_some(),
            "child exited without a fault: {:?}",
            output.status
        );
    }
}
