//! SoftBus Core
//!
//! Core types, errors, and constants for the SoftBus in-process message bus.
//!
//! # Overview
//!
//! SoftBus moves reference-counted messages and streamed data between
//! services and fibers that live on a fixed set of groups. Each group is one
//! OS thread with its own event loop, service scheduler and fiber scheduler.
//! This crate holds the pieces shared by every layer: ids, limits, error
//! taxonomy, configuration and the [`Message`] / [`Data`] objects.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `FIBER_STACK_SIZE_BYTES_MAX`)
//! - Assertions on every invariant the type system cannot express
//! - No recursion (bounded iteration only)

pub mod abi;
pub mod channel;
pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod message;
pub mod telemetry;

/// Service identifier
pub type ServiceId = u32;

/// Fiber identifier
pub type FiberId = u32;

/// Channel identifier
pub type ChannelId = u32;

/// Message identifier, matched against declared handlers
pub type MessageId = u32;

pub use abi::StaticCheck;
pub use channel::Channel;
pub use config::{BusConfig, ChannelConfig, FiberConfig, GroupConfig, ServiceConfig};
pub use constants::*;
pub use data::Data;
pub use error::{BusError, Error, ErrorCode, Result};
pub use message::{DropFn, Message, MessageAttrs, MessageHeader, MessageKind, Payload};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
