//! Configuration for SoftBus
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.
//!
//! The serializable part (groups, services, fibers, sizes) can be loaded from
//! any serde format. Channel strategies and caller-supplied fiber stacks are
//! attached in code and skipped by serde.

use crate::channel::Channel;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::{ChannelId, FiberId, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Main configuration for a bus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Service groups, one OS thread each
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Channels, attached with [`BusConfig::with_channel`]
    #[serde(skip)]
    pub channels: Vec<ChannelConfig>,
}

impl BusConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group
    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }

    /// Attach a channel strategy under `chid`
    pub fn with_channel(mut self, chid: ChannelId, channel: Arc<dyn Channel>) -> Self {
        self.channels.push(ChannelConfig { chid, channel });
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.groups.len() > GROUP_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "groups",
                format!("{} exceeds limit {}", self.groups.len(), GROUP_COUNT_MAX),
            ));
        }

        if self.channels.len() > CHANNEL_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "channels",
                format!("{} exceeds limit {}", self.channels.len(), CHANNEL_COUNT_MAX),
            ));
        }

        let mut sids = HashSet::new();
        let mut fids = HashSet::new();
        for (index, group) in self.groups.iter().enumerate() {
            group.validate(index)?;

            for service in &group.services {
                if !sids.insert(service.sid) {
                    return Err(Error::DuplicateService { sid: service.sid });
                }
            }
            for fiber in &group.fibers {
                if !fids.insert(fiber.fid) {
                    return Err(Error::DuplicateFiber { fid: fiber.fid });
                }
            }
        }

        let mut chids = HashSet::new();
        for channel in &self.channels {
            if !chids.insert(channel.chid) {
                return Err(Error::DuplicateChannel { chid: channel.chid });
            }
        }

        Ok(())
    }
}

/// One group: an OS thread with its event loop and schedulers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Thread priority, recorded for diagnostics
    #[serde(default)]
    pub priority: i64,

    /// Thread stack size. Zero means the platform default.
    #[serde(default)]
    pub stack_size_bytes: usize,

    /// Service table, in initialization order
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Fiber table, in initialization order
    #[serde(default)]
    pub fibers: Vec<FiberConfig>,
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_fiber(mut self, fiber: FiberConfig) -> Self {
        self.fibers.push(fiber);
        self
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.stack_size_bytes != 0 && self.stack_size_bytes < GROUP_THREAD_STACK_SIZE_BYTES_MIN {
            return Err(Error::invalid_configuration(
                format!("groups[{}].stack_size_bytes", index),
                format!(
                    "{} below minimum {}",
                    self.stack_size_bytes, GROUP_THREAD_STACK_SIZE_BYTES_MIN
                ),
            ));
        }

        if self.services.len() > GROUP_SERVICES_COUNT_MAX {
            return Err(Error::invalid_configuration(
                format!("groups[{}].services", index),
                format!(
                    "{} exceeds limit {}",
                    self.services.len(),
                    GROUP_SERVICES_COUNT_MAX
                ),
            ));
        }

        if self.fibers.len() > GROUP_FIBERS_COUNT_MAX {
            return Err(Error::invalid_configuration(
                format!("groups[{}].fibers", index),
                format!("{} exceeds limit {}", self.fibers.len(), GROUP_FIBERS_COUNT_MAX),
            ));
        }

        for service in &self.services {
            service.validate(index)?;
        }
        for fiber in &self.fibers {
            fiber.validate(index)?;
        }

        Ok(())
    }
}

/// A service slot in a group's table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service ID, unique across the bus
    pub sid: ServiceId,

    /// Bound on queued requests (urgent plus normal). Zero means unlimited.
    #[serde(default = "default_queue_depth_max")]
    pub queue_depth_max: usize,
}

fn default_queue_depth_max() -> usize {
    SERVICE_QUEUE_DEPTH_DEFAULT
}

impl ServiceConfig {
    pub fn new(sid: ServiceId) -> Self {
        Self {
            sid,
            queue_depth_max: default_queue_depth_max(),
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth_max = depth;
        self
    }

    fn validate(&self, group: usize) -> Result<()> {
        if self.queue_depth_max > SERVICE_QUEUE_DEPTH_MAX {
            return Err(Error::invalid_configuration(
                format!("groups[{}].services[sid={}].queue_depth_max", group, self.sid),
                format!(
                    "{} exceeds limit {}",
                    self.queue_depth_max, SERVICE_QUEUE_DEPTH_MAX
                ),
            ));
        }
        Ok(())
    }
}

/// A fiber slot in a group's table
#[derive(Clone, Serialize, Deserialize)]
pub struct FiberConfig {
    /// Fiber ID, unique across the bus
    pub fid: FiberId,

    /// Size of the stack allocated when no buffer was supplied
    #[serde(default = "default_fiber_stack_size")]
    pub stack_size_bytes: usize,

    /// Caller-supplied stack buffer, set only through [`FiberConfig::with_stack`]
    #[serde(skip)]
    stack: Option<Box<[u8]>>,
}

fn default_fiber_stack_size() -> usize {
    FIBER_STACK_SIZE_BYTES_DEFAULT
}

impl FiberConfig {
    pub fn new(fid: FiberId) -> Self {
        Self {
            fid,
            stack_size_bytes: default_fiber_stack_size(),
            stack: None,
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    /// Run the fiber on `stack` instead of an allocated one.
    ///
    /// Without this, the runtime maps a stack of `stack_size_bytes` with a
    /// guard page below it, so an overflow faults instead of writing past
    /// the end.
    ///
    /// # Safety
    ///
    /// A plain buffer has no guard page. Every callback of this fiber
    /// (`on_init`, `route`, `on_exit`) and everything they call must fit in
    /// `stack.len()` bytes minus one saved context; deeper use overwrites
    /// whatever memory lies below the buffer.
    pub unsafe fn with_stack(mut self, stack: Box<[u8]>) -> Self {
        self.stack_size_bytes = stack.len();
        self.stack = Some(stack);
        self
    }

    /// Whether a caller-supplied buffer is attached
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Detach the caller-supplied buffer, if any
    pub fn take_stack(&mut self) -> Option<Box<[u8]>> {
        self.stack.take()
    }

    /// Effective stack size in bytes
    pub fn effective_stack_size(&self) -> usize {
        self.stack
            .as_ref()
            .map_or(self.stack_size_bytes, |stack| stack.len())
    }

    fn validate(&self, group: usize) -> Result<()> {
        let size = self.effective_stack_size();
        if !(FIBER_STACK_SIZE_BYTES_MIN..=FIBER_STACK_SIZE_BYTES_MAX).contains(&size) {
            return Err(Error::invalid_configuration(
                format!("groups[{}].fibers[fid={}].stack_size_bytes", group, self.fid),
                format!(
                    "{} outside [{}, {}]",
                    size, FIBER_STACK_SIZE_BYTES_MIN, FIBER_STACK_SIZE_BYTES_MAX
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for FiberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberConfig")
            .field("fid", &self.fid)
            .field("stack_size_bytes", &self.effective_stack_size())
            .field("caller_stack", &self.stack.is_some())
            .finish()
    }
}

/// A channel strategy bound to an id
#[derive(Clone)]
pub struct ChannelConfig {
    pub chid: ChannelId,
    pub channel: Arc<dyn Channel>,
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("chid", &self.chid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;

    struct NullChannel;

    impl Channel for NullChannel {
        fn on_push(&self, _sid: ServiceId, _data: Data) {}
        fn on_pull(&self, _sid: ServiceId, callback: &mut dyn FnMut(Option<Data>)) {
            callback(None);
        }
    }

    fn two_groups() -> BusConfig {
        BusConfig::new()
            .with_group(
                GroupConfig::new()
                    .with_service(ServiceConfig::new(1))
                    .with_fiber(FiberConfig::new(100)),
            )
            .with_group(GroupConfig::new().with_service(ServiceConfig::new(2)))
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(BusConfig::default().validate().is_ok());
        assert!(two_groups().validate().is_ok());
    }

    #[test]
    fn test_duplicate_sid_across_groups() {
        let config = two_groups().with_group(GroupConfig::new().with_service(ServiceConfig::new(1)));
        assert!(matches!(
            config.validate(),
            Err(Error::DuplicateService { sid: 1 })
        ));
    }

    #[test]
    fn test_duplicate_fid_and_chid() {
        let config = two_groups().with_group(GroupConfig::new().with_fiber(FiberConfig::new(100)));
        assert!(matches!(
            config.validate(),
            Err(Error::DuplicateFiber { fid: 100 })
        ));

        let config = two_groups()
            .with_channel(7, Arc::new(NullChannel))
            .with_channel(7, Arc::new(NullChannel));
        assert!(matches!(
            config.validate(),
            Err(Error::DuplicateChannel { chid: 7 })
        ));
    }

    #[test]
    fn test_fiber_stack_bounds() {
        let config = BusConfig::new()
            .with_group(GroupConfig::new().with_fiber(FiberConfig::new(1).with_stack_size(64)));
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration { .. })
        ));

        let stack = vec![0u8; FIBER_STACK_SIZE_BYTES_MIN].into_boxed_slice();
        // SAFETY: the fiber is only validated, never run
        let mut fiber = unsafe { FiberConfig::new(1).with_stack(stack) };
        assert!(fiber.has_stack());
        assert_eq!(fiber.effective_stack_size(), FIBER_STACK_SIZE_BYTES_MIN);
        let taken = fiber.take_stack().unwrap();
        assert_eq!(taken.len(), FIBER_STACK_SIZE_BYTES_MIN);
        assert!(!fiber.has_stack());
        let config = BusConfig::new().with_group(GroupConfig::new().with_fiber(fiber));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_group_stack_minimum() {
        let config = BusConfig::new().with_group(GroupConfig::new().with_stack_size(1024));
        assert!(config.validate().is_err());

        let config = BusConfig::new()
            .with_group(GroupConfig::new().with_stack_size(GROUP_THREAD_STACK_SIZE_BYTES_MIN));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_depth_limit() {
        let service = ServiceConfig::new(1).with_queue_depth(SERVICE_QUEUE_DEPTH_MAX + 1);
        let config = BusConfig::new().with_group(GroupConfig::new().with_service(service));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "groups": [
                { "priority": 3, "services": [ { "sid": 10 } ], "fibers": [ { "fid": 20 } ] }
            ]
        }"#;
        let config: BusConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.groups.len(), 1);
        let group = &config.groups[0];
        assert_eq!(group.priority, 3);
        assert_eq!(group.stack_size_bytes, 0);
        assert_eq!(group.services[0].queue_depth_max, SERVICE_QUEUE_DEPTH_DEFAULT);
        assert_eq!(group.fibers[0].stack_size_bytes, FIBER_STACK_SIZE_BYTES_DEFAULT);
        assert!(!group.fibers[0].has_stack());
        assert!(config.channels.is_empty());
        assert!(config.validate().is_ok());
    }
}
