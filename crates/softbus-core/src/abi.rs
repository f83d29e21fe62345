//! Structural compatibility check
//!
//! TigerStyle: Fail before touching any resource.
//!
//! A caller built against one layout of the runtime records the sizes it was
//! compiled with. `init` compares them against the runtime's own sizes and
//! refuses to start on the first difference.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Structure sizes a caller was built against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCheck {
    /// Size of this struct
    pub sz_self: usize,
    /// Size of a service entry
    pub sz_bus_service: usize,
    /// Size of a fiber entry
    pub sz_bus_filber: usize,
    /// Size of a group
    pub sz_bus_group: usize,
}

impl StaticCheck {
    /// Build a check from the three runtime sizes
    pub const fn new(sz_bus_service: usize, sz_bus_filber: usize, sz_bus_group: usize) -> Self {
        Self {
            sz_self: std::mem::size_of::<StaticCheck>(),
            sz_bus_service,
            sz_bus_filber,
            sz_bus_group,
        }
    }

    /// Compare `self` (the caller's view) with `runtime` (the runtime's view).
    ///
    /// Returns `AbiMismatch` naming the first field that differs, with the
    /// runtime's size as `expected` and the caller's as `actual`.
    pub fn verify(&self, runtime: &StaticCheck) -> Result<()> {
        let fields = [
            ("sz_self", self.sz_self, runtime.sz_self),
            ("sz_bus_service", self.sz_bus_service, runtime.sz_bus_service),
            ("sz_bus_filber", self.sz_bus_filber, runtime.sz_bus_filber),
            ("sz_bus_group", self.sz_bus_group, runtime.sz_bus_group),
        ];

        for (field, caller, runtime) in fields {
            if caller != runtime {
                return Err(Error::AbiMismatch {
                    field,
                    expected: runtime,
                    actual: caller,
                });
            }
        }

        Ok(())
    }
}
