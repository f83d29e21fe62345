//! TigerStyle constants for SoftBus
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Error Codes
// =============================================================================

/// No error
pub const BUS_ERR_NONE: i32 = 0;

/// Service ID not found
pub const BUS_ERR_NO_SID: i32 = -1;

/// Message, channel or fiber ID not found
pub const BUS_ERR_NO_MID: i32 = -2;

/// No permission
pub const BUS_ERR_NO_PERM: i32 = -3;

// =============================================================================
// Group Limits
// =============================================================================

/// Maximum number of groups (OS threads) per bus
pub const GROUP_COUNT_MAX: usize = 256;

/// Maximum number of services in one group
pub const GROUP_SERVICES_COUNT_MAX: usize = 4096;

/// Maximum number of fibers in one group
pub const GROUP_FIBERS_COUNT_MAX: usize = 4096;

/// Maximum number of channels per bus
pub const CHANNEL_COUNT_MAX: usize = 1024;

/// Minimum OS thread stack size for a group thread when explicitly set (64 KB)
pub const GROUP_THREAD_STACK_SIZE_BYTES_MIN: usize = 64 * 1024;

// =============================================================================
// Service Limits
// =============================================================================

/// Default request queue depth per service
pub const SERVICE_QUEUE_DEPTH_DEFAULT: usize = 1024;

/// Maximum request queue depth per service
pub const SERVICE_QUEUE_DEPTH_MAX: usize = 1_000_000;

/// Maximum messages delivered to one service before it is re-queued behind
/// the other busy services of its group
pub const SERVICE_DISPATCH_BATCH_COUNT_MAX: usize = 64;

/// Maximum message handlers declared by a single service
pub const SERVICE_HANDLERS_COUNT_MAX: usize = 1024;

// =============================================================================
// Fiber Limits
// =============================================================================

/// Required alignment of a fiber stack top in bytes
pub const FIBER_STACK_ALIGNMENT_BYTES: usize = 16;

/// Bytes reserved at the top of a stack for the saved caller context and the
/// return trampoline
pub const FIBER_STACK_CONTEXT_BYTES: usize = 256;

/// Minimum fiber stack size that still leaves room for a frame (4 KB)
pub const FIBER_STACK_SIZE_BYTES_MIN: usize = 4 * 1024;

/// Default fiber stack size (64 KB)
pub const FIBER_STACK_SIZE_BYTES_DEFAULT: usize = 64 * 1024;

/// Maximum fiber stack size (16 MB)
pub const FIBER_STACK_SIZE_BYTES_MAX: usize = 16 * 1024 * 1024;

/// Maximum busy fibers resumed in one drive-loop pass
pub const FIBER_RESUME_BATCH_COUNT_MAX: usize = 64;

// Compile-time assertions for constant validity
const _: () = {
    assert!(FIBER_STACK_ALIGNMENT_BYTES.is_power_of_two());
    assert!(FIBER_STACK_ALIGNMENT_BYTES >= std::mem::size_of::<usize>());
    assert!(FIBER_STACK_CONTEXT_BYTES % FIBER_STACK_ALIGNMENT_BYTES == 0);
    assert!(FIBER_STACK_SIZE_BYTES_MIN > FIBER_STACK_CONTEXT_BYTES);
    assert!(FIBER_STACK_SIZE_BYTES_DEFAULT >= FIBER_STACK_SIZE_BYTES_MIN);
    assert!(FIBER_STACK_SIZE_BYTES_MAX >= FIBER_STACK_SIZE_BYTES_DEFAULT);
    assert!(SERVICE_QUEUE_DEPTH_DEFAULT <= SERVICE_QUEUE_DEPTH_MAX);
    assert!(SERVICE_DISPATCH_BATCH_COUNT_MAX > 0);
};
