//! Error types for SoftBus
//!
//! TigerStyle: Explicit error types with context, using thiserror.
//!
//! Two tiers exist. [`BusError`] is the recoverable, code-carrying tier that
//! maps onto the `BUS_ERR_*` taxonomy and can travel inside a synthesized
//! response message. [`Error`] covers lifecycle and configuration failures.
//! Protocol violations are neither: they abort through the runtime's fatal path.

use crate::constants::{BUS_ERR_NONE, BUS_ERR_NO_MID, BUS_ERR_NO_PERM, BUS_ERR_NO_SID};
use crate::ServiceId;
use thiserror::Error;

/// Result type alias for SoftBus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error code carried by messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    #[default]
    None = BUS_ERR_NONE,
    /// Service ID not found
    NoSid = BUS_ERR_NO_SID,
    /// Message, channel or fiber ID not found
    NoMid = BUS_ERR_NO_MID,
    /// No permission
    NoPerm = BUS_ERR_NO_PERM,
}

impl ErrorCode {
    /// Raw `BUS_ERR_*` value
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether this code signals success
    pub fn is_ok(self) -> bool {
        self == ErrorCode::None
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::None => write!(f, "none"),
            ErrorCode::NoSid => write!(f, "no_sid"),
            ErrorCode::NoMid => write!(f, "no_mid"),
            ErrorCode::NoPerm => write!(f, "no_perm"),
        }
    }
}

/// Recoverable bus error, reported by return value or synthesized message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Service not found: {sid}")]
    NoSid { sid: ServiceId },

    #[error("{what} not found: {id}")]
    NoMid { what: &'static str, id: u32 },

    #[error("Permission denied: {reason}")]
    NoPerm { reason: String },
}

impl BusError {
    /// Create a service not found error
    pub fn no_sid(sid: ServiceId) -> Self {
        Self::NoSid { sid }
    }

    /// Create an id lookup failure
    pub fn no_mid(what: &'static str, id: u32) -> Self {
        Self::NoMid { what, id }
    }

    /// Create a permission error
    pub fn no_perm(reason: impl Into<String>) -> Self {
        Self::NoPerm {
            reason: reason.into(),
        }
    }

    /// The `BUS_ERR_*` code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoSid { .. } => ErrorCode::NoSid,
            Self::NoMid { .. } => ErrorCode::NoMid,
            Self::NoPerm { .. } => ErrorCode::NoPerm,
        }
    }
}

/// SoftBus lifecycle and configuration errors
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Initialization Errors
    // =========================================================================
    #[error("ABI mismatch: {field}, expected {expected} bytes, got {actual} bytes")]
    AbiMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Bus already initialized in this process")]
    AlreadyInitialized,

    #[error("Invalid bus state: {reason}")]
    InvalidState { reason: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Duplicate service id: {sid}")]
    DuplicateService { sid: ServiceId },

    #[error("Duplicate fiber id: {fid}")]
    DuplicateFiber { fid: u32 },

    #[error("Duplicate channel id: {chid}")]
    DuplicateChannel { chid: u32 },

    // =========================================================================
    // Group Errors
    // =========================================================================
    #[error("Event loop setup failed for group {group}: {reason}")]
    EventLoopFailed { group: usize, reason: String },

    #[error("Thread spawn failed for group {group}: {reason}")]
    ThreadSpawnFailed { group: usize, reason: String },

    #[error("Group {group} thread panicked")]
    GroupPanicked { group: usize },

    #[error("Stack allocation failed for fiber {fid}: {reason}")]
    StackAllocFailed { fid: u32, reason: String },

    // =========================================================================
    // Bus Errors
    // =========================================================================
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// The `BUS_ERR_*` code carried by this error, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Bus(e) => Some(e.code()),
            _ => None,
        }
    }
}
