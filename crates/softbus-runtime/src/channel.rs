//! Channel routing
//!
//! TigerStyle: The bus never inspects data, channels own storage.
//!
//! `send_dat` wraps a payload in a [`Data`] and hands it to the channel's
//! `on_push`. Delivery is pull-based: the receiving service drains its backlog
//! with `recv_dat`, which dispatches each item to its data handler.

use crate::bus::BusShared;
use crate::handle::BusHandle;
use crate::service::ServiceContext;
use parking_lot::Mutex;
use softbus_core::channel::Channel;
use softbus_core::data::Data;
use softbus_core::error::BusError;
use softbus_core::message::{DropFn, Payload};
use softbus_core::{ChannelId, ServiceId};
use std::collections::{HashMap, VecDeque};
use tracing::{trace, warn};

/// In-memory FIFO channel with one backlog per receiving service
#[derive(Debug, Default)]
pub struct MemoryChannel {
    backlogs: Mutex<HashMap<ServiceId, VecDeque<Data>>>,
    /// Items kept per receiver; zero means unlimited
    depth_max: usize,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `depth_max` items per receiver, dropping newer ones
    pub fn with_depth(depth_max: usize) -> Self {
        Self {
            backlogs: Mutex::new(HashMap::new()),
            depth_max,
        }
    }

    /// Items waiting for `sid`
    pub fn pending(&self, sid: ServiceId) -> usize {
        self.backlogs.lock().get(&sid).map_or(0, VecDeque::len)
    }
}

impl Channel for MemoryChannel {
    fn on_init(&self, sid: ServiceId) {
        self.backlogs.lock().entry(sid).or_default();
    }

    fn on_exit(&self, sid: ServiceId) {
        let backlog = self.backlogs.lock().remove(&sid);
        drop(backlog);
    }

    fn on_push(&self, sid: ServiceId, data: Data) {
        let mut backlogs = self.backlogs.lock();
        let backlog = backlogs.entry(sid).or_default();
        if self.depth_max != 0 && backlog.len() >= self.depth_max {
            drop(backlogs);
            warn!(sid, chid = data.chid(), "Channel backlog full, data dropped");
            return;
        }
        backlog.push_back(data);
    }

    fn on_pull(&self, sid: ServiceId, callback: &mut dyn FnMut(Option<Data>)) {
        // Callback runs unlocked; it may push more data
        let items = self
            .backlogs
            .lock()
            .get_mut(&sid)
            .map(std::mem::take)
            .unwrap_or_default();

        for data in items {
            callback(Some(data));
        }
        callback(None);
    }
}

// =============================================================================
// Routing
// =============================================================================

fn lookup<'a>(
    bus: &'a BusShared,
    sid: ServiceId,
    chid: ChannelId,
) -> Result<&'a dyn Channel, BusError> {
    let channel = bus
        .channels
        .get(&chid)
        .ok_or_else(|| BusError::no_mid("channel", chid))?;
    if !bus.services.contains_key(&sid) {
        return Err(BusError::no_sid(sid));
    }
    Ok(channel.as_ref())
}

/// Wrap a payload and push it into channel `chid` for `tsid`
pub(crate) fn send(
    bus: &BusShared,
    fsid: ServiceId,
    tsid: ServiceId,
    chid: ChannelId,
    payload: Option<Payload>,
    drop_fn: Option<DropFn>,
) -> Result<(), BusError> {
    let channel = lookup(bus, tsid, chid)?;
    let data = Data::new(fsid, tsid, chid, payload, drop_fn);

    trace!(fsid, tsid, chid, "Data pushed");
    channel.on_push(tsid, data);
    Ok(())
}

/// Raw pull: `callback` sees every item, then `None`
pub(crate) fn pull(
    bus: &BusShared,
    sid: ServiceId,
    chid: ChannelId,
    callback: &mut dyn FnMut(Option<Data>),
) -> Result<(), BusError> {
    let channel = lookup(bus, sid, chid)?;
    channel.on_pull(sid, callback);
    Ok(())
}

/// Pull the backlog of `sid` from `chid` into its data handler.
///
/// Returns the number of items delivered.
pub(crate) fn receive(bus: &BusHandle, sid: ServiceId, chid: ChannelId) -> Result<usize, BusError> {
    let shared = bus.shared();
    let channel = lookup(shared, sid, chid)?;
    let entry = bus.owned_service(sid)?;

    let binding = entry
        .binding()
        .filter(|binding| binding.handles_data(chid))
        .ok_or_else(|| BusError::no_mid("data handler", chid))?;

    let ctx = ServiceContext::new(sid, bus.clone());
    let mut delivered = 0;
    channel.on_pull(sid, &mut |data| {
        if let Some(data) = data {
            binding.service.on_data(&ctx, chid, &data);
            delivered += 1;
        }
    });

    trace!(sid, chid, delivered, "Data received");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn data(tsid: ServiceId, value: u32) -> Data {
        Data::new(1, tsid, 9, Some(Box::new(value)), None)
    }

    fn pull_all(channel: &MemoryChannel, sid: ServiceId) -> (Vec<u32>, usize) {
        let mut values = Vec::new();
        let mut sentinels = 0;
        channel.on_pull(sid, &mut |item| match item {
            Some(item) => values.push(*item.payload_as::<u32>().unwrap()),
            None => sentinels += 1,
        });
        (values, sentinels)
    }

    #[test]
    fn test_memory_channel_fifo_per_receiver() {
        let channel = MemoryChannel::new();
        channel.on_push(2, data(2, 10));
        channel.on_push(3, data(3, 99));
        channel.on_push(2, data(2, 11));

        assert_eq!(channel.pending(2), 2);
        assert_eq!(pull_all(&channel, 2), (vec![10, 11], 1));
        assert_eq!(pull_all(&channel, 2), (vec![], 1));
        assert_eq!(channel.pending(3), 1);
    }

    #[test]
    fn test_memory_channel_depth_limit() {
        let channel = MemoryChannel::with_depth(1);
        channel.on_push(2, data(2, 1));
        channel.on_push(2, data(2, 2));
        assert_eq!(pull_all(&channel, 2), (vec![1], 1));
    }

    #[test]
    fn test_memory_channel_exit_releases_backlog() {
        let drops = Arc::new(AtomicUsize::new(0));
        let channel = MemoryChannel::new();
        channel.on_init(5);

        let counter = drops.clone();
        channel.on_push(
            5,
            Data::new(
                1,
                5,
                9,
                None,
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            ),
        );
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        channel.on_exit(5);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(channel.pending(5), 0);
    }
}
