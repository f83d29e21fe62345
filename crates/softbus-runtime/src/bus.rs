//! Bus lifecycle
//!
//! TigerStyle: Single entry point, explicit configuration, clean shutdown.
//!
//! One bus may exist per process. `init` validates everything, builds every
//! group and waits for all group threads to report ready; `load` releases
//! them; `exit` stops and joins them. Any failure in `init` rolls back what
//! was built before it.

use crate::event_loop::EventLoop;
use crate::fiber::FiberEntry;
use crate::group::{current_group, GroupShared, GroupThread, Start};
use crate::handle::BusHandle;
use crate::service::ServiceEntry;
use crate::stack::FiberStack;
use parking_lot::Mutex;
use softbus_core::abi::StaticCheck;
use softbus_core::channel::Channel;
use softbus_core::config::BusConfig;
use softbus_core::error::{Error, Result};
use softbus_core::{ChannelId, FiberId, ServiceId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Sizes of the runtime's own structures, for [`Bus::init`]
pub const fn static_check() -> StaticCheck {
    StaticCheck::new(
        std::mem::size_of::<ServiceEntry>(),
        std::mem::size_of::<FiberEntry>(),
        std::mem::size_of::<GroupShared>(),
    )
}

// =============================================================================
// Process Singleton
// =============================================================================

static BUS_ACTIVE: AtomicBool = AtomicBool::new(false);
static BUS_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Held while a bus exists; releases the process slot on drop
#[derive(Debug)]
struct SingletonClaim {
    _private: (),
}

impl SingletonClaim {
    fn acquire() -> Result<Self> {
        BUS_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyInitialized)?;
        Ok(Self { _private: () })
    }
}

impl Drop for SingletonClaim {
    fn drop(&mut self) {
        BUS_ACTIVE.store(false, Ordering::Release);
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusState {
    /// Threads ready, registration open
    Initialized,
    /// Groups running
    Loaded,
    /// Groups joined
    Exited,
}

/// Tables shared by every handle and group thread.
///
/// Built once in `init`; only the state and the per-entry locks change later.
pub(crate) struct BusShared {
    /// Distinguishes this bus from earlier ones on reused threads
    pub(crate) generation: u64,
    pub(crate) state: Mutex<BusState>,
    pub(crate) groups: Vec<Arc<GroupShared>>,
    pub(crate) services: BTreeMap<ServiceId, Arc<ServiceEntry>>,
    pub(crate) fibers: BTreeMap<FiberId, Arc<FiberEntry>>,
    pub(crate) channels: BTreeMap<ChannelId, Arc<dyn Channel>>,
}

impl std::fmt::Debug for BusShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusShared")
            .field("generation", &self.generation)
            .field("state", &*self.state.lock())
            .field("groups", &self.groups.len())
            .field("services", &self.services.len())
            .field("fibers", &self.fibers.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Owner of a running bus
///
/// Dropping it performs [`Bus::exit`] if that has not happened yet.
pub struct Bus {
    handle: BusHandle,
    threads: Vec<GroupThread>,
    claim: Option<SingletonClaim>,
}

/// A group built but not yet running
struct PendingGroup {
    shared: Arc<GroupShared>,
    event_loop: EventLoop,
    stacks: Vec<FiberStack>,
}

impl Bus {
    /// Build every group and start its thread, blocked until [`Bus::load`].
    ///
    /// `check` must equal [`static_check`]; the comparison happens before
    /// anything else is touched.
    #[instrument(skip_all, fields(groups = config.groups.len()))]
    pub fn init(config: BusConfig, check: &StaticCheck) -> Result<Bus> {
        check.verify(&static_check())?;
        config.validate()?;
        let claim = SingletonClaim::acquire()?;
        let generation = BUS_GENERATION.fetch_add(1, Ordering::Relaxed);

        let BusConfig { groups, channels } = config;

        let mut services = BTreeMap::new();
        let mut fibers = BTreeMap::new();
        let mut pending = Vec::with_capacity(groups.len());

        for (index, group_config) in groups.into_iter().enumerate() {
            let event_loop = EventLoop::new(index)?;

            let group_services: Vec<Arc<ServiceEntry>> = group_config
                .services
                .iter()
                .enumerate()
                .map(|(slot, service)| {
                    Arc::new(ServiceEntry::new(service.sid, index, slot, service.queue_depth_max))
                })
                .collect();

            let mut group_fibers = Vec::with_capacity(group_config.fibers.len());
            let mut stacks = Vec::with_capacity(group_config.fibers.len());
            for (slot, mut fiber) in group_config.fibers.into_iter().enumerate() {
                group_fibers.push(Arc::new(FiberEntry::new(fiber.fid, index, slot)));
                stacks.push(match fiber.take_stack() {
                    // SAFETY: a buffer only gets here through the unsafe
                    // `FiberConfig::with_stack`, whose caller took on the depth contract
                    Some(buf) => unsafe { FiberStack::from_buffer(buf) },
                    None => FiberStack::allocate(fiber.stack_size_bytes).map_err(|e| {
                        Error::StackAllocFailed {
                            fid: fiber.fid,
                            reason: e.to_string(),
                        }
                    })?,
                });
            }

            for entry in &group_services {
                services.insert(entry.sid, Arc::clone(entry));
            }
            for entry in &group_fibers {
                fibers.insert(entry.fid, Arc::clone(entry));
            }

            let shared = Arc::new(GroupShared::new(
                index,
                group_config.priority,
                group_config.stack_size_bytes,
                group_services,
                group_fibers,
                event_loop.waker(),
            ));
            pending.push(PendingGroup {
                shared,
                event_loop,
                stacks,
            });
        }

        let shared = Arc::new(BusShared {
            generation,
            state: Mutex::new(BusState::Initialized),
            groups: pending.iter().map(|group| Arc::clone(&group.shared)).collect(),
            services,
            fibers,
            channels: channels
                .into_iter()
                .map(|config| (config.chid, config.channel))
                .collect(),
        });
        let handle = BusHandle::new(shared);

        let mut threads = Vec::with_capacity(pending.len());
        for group in pending {
            let spawned = GroupThread::spawn(handle.clone(), group.shared, group.event_loop, group.stacks)
                .and_then(|thread| {
                    let ready = thread.wait_ready();
                    threads.push(thread);
                    ready
                });
            if let Err(e) = spawned {
                error!(error = %e, "Bus init failed, rolling back");
                abort_threads(&mut threads);
                return Err(e);
            }
        }

        info!(
            generation,
            groups = threads.len(),
            services = handle.shared().services.len(),
            fibers = handle.shared().fibers.len(),
            "Bus initialized"
        );

        Ok(Bus {
            handle,
            threads,
            claim: Some(claim),
        })
    }

    /// A handle for registration and messaging
    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Release every group thread into its drive loop
    #[instrument(skip(self))]
    pub fn load(&mut self) -> Result<()> {
        {
            let mut state = self.handle.shared().state.lock();
            if *state != BusState::Initialized {
                return Err(Error::invalid_state(format!("load in state {:?}", *state)));
            }
            *state = BusState::Loaded;
        }

        // Every live thread gets its start signal even if one has died
        let mut first_err = None;
        for thread in &self.threads {
            if let Err(e) = thread.start(Start::Run) {
                error!(group = thread.index, "Group thread gone before load");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(groups = self.threads.len(), "Bus loaded");
                Ok(())
            }
        }
    }

    /// Stop and join every group thread, then release all queued messages
    #[instrument(skip(self))]
    pub fn exit(&mut self) -> Result<()> {
        let shared = Arc::clone(self.handle.shared());
        if current_group().is_some_and(|(generation, _)| generation == shared.generation) {
            return Err(Error::invalid_state("exit from a group thread"));
        }

        let previous = {
            let mut state = shared.state.lock();
            let previous = *state;
            if previous == BusState::Exited {
                return Err(Error::invalid_state("bus already exited"));
            }
            *state = BusState::Exited;
            previous
        };

        if previous == BusState::Initialized {
            for thread in &self.threads {
                let _ = thread.start(Start::Abort);
            }
        } else {
            for group in &shared.groups {
                group.stop();
            }
        }

        let mut first_err = None;
        for thread in &mut self.threads {
            if let Err(e) = thread.join() {
                error!(group = thread.index, error = %e, "Group thread failed");
                first_err.get_or_insert(e);
            }
        }
        self.threads.clear();

        let mut released = 0;
        for entry in shared.services.values() {
            released += entry.queue.lock().drain().len();
        }
        self.claim.take();

        info!(released, "Bus exited");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if self.claim.is_none() {
            return;
        }
        if let Err(e) = self.exit() {
            warn!(error = %e, "Bus exit on drop failed");
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("shared", self.handle.shared())
            .field("threads", &self.threads.len())
            .finish()
    }
}

fn abort_threads(threads: &mut Vec<GroupThread>) {
    for thread in threads.iter() {
        let _ = thread.start(Start::Abort);
    }
    for thread in threads.iter_mut() {
        let _ = thread.join();
    }
    threads.clear();
}
