//! SoftBus Runtime
//!
//! In-process actor bus: group threads, schedulers, fibers and routing.
//!
//! # Overview
//!
//! Each group is one OS thread running an event loop that drives two
//! schedulers, one for services and one for fibers:
//! - Services are message-driven and run handlers to completion
//! - Fibers run on their own stacks and yield cooperatively
//! - Messages travel through three priority lanes per service
//! - Data travels through pluggable channels
//!
//! # TigerStyle
//! - Fixed tables, built once at init
//! - Explicit lifecycle: init, register, load, exit
//! - Protocol misuse aborts instead of corrupting state

mod bus;
mod channel;
mod event_loop;
mod fiber;
mod group;
mod handle;
mod protocol;
mod queue;
mod scheduler;
mod service;
pub mod stack;

pub use bus::{static_check, Bus};
pub use channel::MemoryChannel;
pub use fiber::{Fiber, FiberContext, FiberStatus};
pub use group::GroupInfo;
pub use handle::{BusHandle, Outgoing, Pick};
pub use queue::{QueueFullError, ServiceQueue};
pub use scheduler::RunState;
pub use service::{MessageHandle, Service, ServiceContext, ServiceStats};
pub use stack::call_in_stack;
