//! Services and the service scheduler
//!
//! TigerStyle: Handlers run to completion on the owning group thread.
//!
//! A service is configured as an empty slot and bound to a [`Service`]
//! implementation between `init` and `load`. The handler table is captured at
//! bind time and never changes afterwards.

use crate::group::GroupShared;
use crate::handle::{BusHandle, Outgoing};
use crate::protocol::{synthesize_reply, ProtocolState};
use crate::queue::{Lane, ServiceQueue};
use crate::scheduler::RunState;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use softbus_core::constants::{SERVICE_DISPATCH_BATCH_COUNT_MAX, SERVICE_HANDLERS_COUNT_MAX};
use softbus_core::data::Data;
use softbus_core::error::{BusError, ErrorCode};
use softbus_core::message::{Message, MessageKind, Payload};
use softbus_core::{ChannelId, MessageId, ServiceId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One declared message handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub msgid: MessageId,
    pub kind: MessageKind,
}

impl MessageHandle {
    /// Handle requests with `msgid`
    pub fn request(msgid: MessageId) -> Self {
        Self {
            msgid,
            kind: MessageKind::Request,
        }
    }

    /// Handle responses to requests with `msgid`
    pub fn response(msgid: MessageId) -> Self {
        Self {
            msgid,
            kind: MessageKind::Response,
        }
    }
}

/// A message-driven actor
///
/// Every callback runs on the group thread that owns the service.
pub trait Service: Send + Sync + 'static {
    /// Message handlers, captured once at registration
    fn message_handles(&self) -> Vec<MessageHandle> {
        Vec::new()
    }

    /// Channels this service receives data from, captured once at registration
    fn data_handles(&self) -> Vec<ChannelId> {
        Vec::new()
    }

    fn on_init(&self, _ctx: &ServiceContext) {}

    fn on_exit(&self, _ctx: &ServiceContext) {}

    /// Handle one message matching a declared handler
    fn on_message(&self, ctx: &ServiceContext, msg: &Message);

    /// Handle one data item pulled from a declared channel
    fn on_data(&self, _ctx: &ServiceContext, _chid: ChannelId, _data: &Data) {}
}

/// What a service callback can reach
#[derive(Clone)]
pub struct ServiceContext {
    sid: ServiceId,
    bus: BusHandle,
}

impl ServiceContext {
    pub(crate) fn new(sid: ServiceId, bus: BusHandle) -> Self {
        Self { sid, bus }
    }

    /// The service this callback runs for
    pub fn sid(&self) -> ServiceId {
        self.sid
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// Answer `request` with a successful response carrying `payload`
    pub fn reply(&self, request: &Message, payload: Option<Payload>) -> Result<(), BusError> {
        debug_assert_eq!(request.tsid(), self.sid);
        let mut out = Outgoing::reply_to(request);
        if let Some(payload) = payload {
            out = out.with_payload(payload);
        }
        self.bus.send_msg(out)
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("sid", &self.sid)
            .finish_non_exhaustive()
    }
}

/// Queue and scheduling snapshot of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub sid: ServiceId,
    pub group: usize,
    pub state: RunState,
    pub registered: bool,
    pub responses_queued: usize,
    pub urgent_queued: usize,
    pub normal_queued: usize,
    pub enqueued_count: u64,
    pub processed_count: u64,
    pub outstanding_requests: usize,
    pub pending_replies: usize,
}

impl ServiceStats {
    pub fn queued(&self) -> usize {
        self.responses_queued + self.urgent_queued + self.normal_queued
    }
}

// =============================================================================
// Registry Entry
// =============================================================================

/// Handler table captured at registration
pub(crate) struct Binding {
    pub(crate) service: Arc<dyn Service>,
    requests: HashSet<MessageId>,
    responses: HashSet<MessageId>,
    pub(crate) channels: Vec<ChannelId>,
}

impl Binding {
    pub(crate) fn capture(service: Arc<dyn Service>) -> Result<Self, BusError> {
        let handles = service.message_handles();
        if handles.len() > SERVICE_HANDLERS_COUNT_MAX {
            return Err(BusError::no_perm(format!(
                "{} message handlers exceed limit {}",
                handles.len(),
                SERVICE_HANDLERS_COUNT_MAX
            )));
        }

        let mut requests = HashSet::new();
        let mut responses = HashSet::new();
        for handle in handles {
            match handle.kind {
                MessageKind::Request => requests.insert(handle.msgid),
                MessageKind::Response => responses.insert(handle.msgid),
            };
        }

        let mut channels = service.data_handles();
        channels.sort_unstable();
        channels.dedup();

        Ok(Self {
            service,
            requests,
            responses,
            channels,
        })
    }

    pub(crate) fn handles_request(&self, msgid: MessageId) -> bool {
        self.requests.contains(&msgid)
    }

    pub(crate) fn handles_response(&self, msgid: MessageId) -> bool {
        self.responses.contains(&msgid)
    }

    pub(crate) fn handles_data(&self, chid: ChannelId) -> bool {
        self.channels.contains(&chid)
    }
}

/// Runtime state of one configured service
pub(crate) struct ServiceEntry {
    pub(crate) sid: ServiceId,
    /// Owning group
    pub(crate) group: usize,
    /// Slot in the group's service table
    pub(crate) index: usize,
    pub(crate) queue: Mutex<ServiceQueue>,
    pub(crate) protocol: Mutex<ProtocolState>,
    binding: OnceCell<Binding>,
}

impl ServiceEntry {
    pub(crate) fn new(sid: ServiceId, group: usize, index: usize, queue_depth_max: usize) -> Self {
        Self {
            sid,
            group,
            index,
            queue: Mutex::new(ServiceQueue::new(queue_depth_max)),
            protocol: Mutex::new(ProtocolState::default()),
            binding: OnceCell::new(),
        }
    }

    pub(crate) fn binding(&self) -> Option<&Binding> {
        self.binding.get()
    }

    pub(crate) fn bind(&self, binding: Binding) -> Result<(), BusError> {
        self.binding
            .set(binding)
            .map_err(|_| BusError::no_perm(format!("service {} already registered", self.sid)))
    }

    /// Consistent snapshot: queue and scheduler are read under the queue lock
    pub(crate) fn stats(&self, group: &GroupShared) -> ServiceStats {
        debug_assert_eq!(group.index, self.group);
        let queue = self.queue.lock();
        let state = group.service_sched.lock().state(self.index);
        let protocol = self.protocol.lock();
        ServiceStats {
            sid: self.sid,
            group: self.group,
            state,
            registered: self.binding().is_some(),
            responses_queued: queue.lane_len(Lane::Response),
            urgent_queued: queue.lane_len(Lane::Urgent),
            normal_queued: queue.lane_len(Lane::Normal),
            enqueued_count: queue.enqueued_count(),
            processed_count: queue.processed_count(),
            outstanding_requests: protocol.outstanding_len(),
            pending_replies: protocol.pending_len(),
        }
    }

    /// Record the reply obligation for a request about to be handed out
    pub(crate) fn accept(&self, msg: &Message) {
        if msg.header().expects_reply() {
            self.protocol.lock().accept_request(msg.fsid(), msg.uuid());
        }
    }
}

impl std::fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("sid", &self.sid)
            .field("group", &self.group)
            .field("index", &self.index)
            .field("registered", &self.binding().is_some())
            .finish()
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Run handlers for the busy head of `group`, if any.
///
/// Returns false when no service was busy.
pub(crate) fn dispatch_next(bus: &BusHandle, group: &GroupShared) -> bool {
    let Some(index) = group.service_sched.lock().pop_busy() else {
        return false;
    };
    let entry = &group.services[index];
    let ctx = ServiceContext::new(entry.sid, bus.clone());

    let mut delivered = 0;
    while delivered < SERVICE_DISPATCH_BATCH_COUNT_MAX {
        // Re-checked every message so a late response still overtakes requests
        let Some(msg) = entry.queue.lock().pop_next() else {
            break;
        };
        deliver(bus, entry, &ctx, msg);
        delivered += 1;
    }

    let queue = entry.queue.lock();
    group.service_sched.lock().finish(index, !queue.is_empty());
    drop(queue);

    trace!(sid = entry.sid, delivered, "Service dispatched");
    true
}

fn deliver(bus: &BusHandle, entry: &ServiceEntry, ctx: &ServiceContext, msg: Message) {
    let header = *msg.header();
    let handled = entry.binding().filter(|binding| match header.kind {
        MessageKind::Request => binding.handles_request(header.msgid),
        MessageKind::Response => binding.handles_response(header.msgid),
    });

    let Some(binding) = handled else {
        match header.kind {
            MessageKind::Request if header.expects_reply() => {
                // An unbound slot has no service behind it at all
                let errc = if entry.binding().is_none() {
                    ErrorCode::NoSid
                } else {
                    ErrorCode::NoMid
                };
                drop(msg);
                synthesize_reply(bus.shared(), &header, errc);
            }
            _ => {
                warn!(
                    sid = entry.sid,
                    msgid = header.msgid,
                    kind = %header.kind,
                    "No handler, message dropped"
                );
            }
        }
        return;
    };

    entry.accept(&msg);
    binding.service.on_message(ctx, &msg);
}

/// Run `on_init` for every bound service of the group, in table order
pub(crate) fn init_all(bus: &BusHandle, group: &GroupShared) {
    for entry in &group.services {
        let Some(binding) = entry.binding() else {
            debug!(sid = entry.sid, "Service not registered, skipping init");
            continue;
        };
        let ctx = ServiceContext::new(entry.sid, bus.clone());

        for chid in &binding.channels {
            if let Some(channel) = bus.shared().channels.get(chid) {
                channel.on_init(entry.sid);
            }
        }
        with_current(group, entry.index, || binding.service.on_init(&ctx));
    }
}

/// Run `on_exit` for every bound service of the group, in table order
pub(crate) fn exit_all(bus: &BusHandle, group: &GroupShared) {
    for entry in &group.services {
        let Some(binding) = entry.binding() else {
            continue;
        };
        let ctx = ServiceContext::new(entry.sid, bus.clone());

        with_current(group, entry.index, || binding.service.on_exit(&ctx));
        for chid in &binding.channels {
            if let Some(channel) = bus.shared().channels.get(chid) {
                channel.on_exit(entry.sid);
            }
        }
    }
}

/// Mark `index` current for the duration of a lifecycle callback
fn with_current(group: &GroupShared, index: usize, f: impl FnOnce()) {
    let began = group.service_sched.lock().begin(index);
    debug_assert!(began, "lifecycle callback while a service is running");
    f();
    let queue = group.services[index].queue.lock();
    group.service_sched.lock().finish(index, !queue.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Service for Echo {
        fn message_handles(&self) -> Vec<MessageHandle> {
            vec![
                MessageHandle::request(1),
                MessageHandle::request(2),
                MessageHandle::response(1),
            ]
        }

        fn data_handles(&self) -> Vec<ChannelId> {
            vec![5, 4, 4]
        }

        fn on_message(&self, _ctx: &ServiceContext, _msg: &Message) {}
    }

    struct TooMany;

    impl Service for TooMany {
        fn message_handles(&self) -> Vec<MessageHandle> {
            (0..=SERVICE_HANDLERS_COUNT_MAX as u32)
                .map(MessageHandle::request)
                .collect()
        }

        fn on_message(&self, _ctx: &ServiceContext, _msg: &Message) {}
    }

    #[test]
    fn test_binding_splits_handles_by_kind() {
        let binding = Binding::capture(Arc::new(Echo)).unwrap();
        assert!(binding.handles_request(1));
        assert!(binding.handles_request(2));
        assert!(binding.handles_response(1));
        assert!(!binding.handles_response(2));
        assert!(binding.handles_data(4));
        assert_eq!(binding.channels, vec![4, 5]);
    }

    #[test]
    fn test_binding_rejects_handler_overflow() {
        let err = Binding::capture(Arc::new(TooMany)).err().unwrap();
        assert_eq!(err.code(), ErrorCode::NoPerm);
    }

    #[test]
    fn test_entry_binds_once() {
        let entry = ServiceEntry::new(3, 0, 0, 0);
        assert!(entry.binding().is_none());
        entry.bind(Binding::capture(Arc::new(Echo)).unwrap()).unwrap();

        let err = entry
            .bind(Binding::capture(Arc::new(Echo)).unwrap())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoPerm);
        assert!(entry.binding().is_some());
    }
}
