//! Bus handles for services, fibers and embedding code
//!
//! TigerStyle: Every operation names its caller, errors are explicit.
//!
//! A [`BusHandle`] is cheap to clone and usable from any thread. Producer-side
//! operations (`send_msg`, `send_dat`, `filber_wake`, stats) work anywhere.
//! Consumer-side operations (`recv_msg`, `pick_msg`, `recv_dat`, `pull_dat`,
//! `filber_resume`) are only allowed on the thread of the owning group.

use crate::bus::{BusShared, BusState};
use crate::channel;
use crate::fiber::{self, Fiber, FiberStatus};
use crate::group::{current_group, GroupInfo, GroupShared};
use crate::protocol::{self, fatal};
use crate::service::{Binding, Service, ServiceEntry, ServiceStats};
use softbus_core::data::Data;
use softbus_core::error::{BusError, ErrorCode};
use softbus_core::message::{DropFn, Message, MessageAttrs, MessageKind, Payload};
use softbus_core::{ChannelId, FiberId, MessageId, ServiceId};
use std::sync::Arc;
use tracing::{info, trace};

/// Decision returned by a [`BusHandle::pick_msg`] callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// Leave the message queued
    Skip,
    /// Remove the message from the queue
    Take,
}

/// A message about to be sent
///
/// Built with [`Outgoing::request`], [`Outgoing::response`] or
/// [`Outgoing::reply_to`], then passed to [`BusHandle::send_msg`].
pub struct Outgoing {
    pub(crate) fsid: ServiceId,
    pub(crate) tsid: ServiceId,
    pub(crate) kind: MessageKind,
    pub(crate) msgid: MessageId,
    pub(crate) uuid: u32,
    pub(crate) attrs: MessageAttrs,
    pub(crate) errc: ErrorCode,
    pub(crate) payload: Option<Payload>,
    pub(crate) drop: Option<DropFn>,
}

impl Outgoing {
    fn new(kind: MessageKind, fsid: ServiceId, tsid: ServiceId, msgid: MessageId, uuid: u32) -> Self {
        Self {
            fsid,
            tsid,
            kind,
            msgid,
            uuid,
            attrs: MessageAttrs::empty(),
            errc: ErrorCode::None,
            payload: None,
            drop: None,
        }
    }

    /// A request from `fsid` to `tsid`; a reply is expected unless [`Outgoing::no_reply`]
    pub fn request(fsid: ServiceId, tsid: ServiceId, msgid: MessageId, uuid: u32) -> Self {
        Self::new(MessageKind::Request, fsid, tsid, msgid, uuid)
    }

    /// A response from `fsid` to the requester `tsid`
    pub fn response(fsid: ServiceId, tsid: ServiceId, msgid: MessageId, uuid: u32) -> Self {
        Self::new(MessageKind::Response, fsid, tsid, msgid, uuid)
    }

    /// The response matching a delivered request
    pub fn reply_to(request: &Message) -> Self {
        Self::response(request.tsid(), request.fsid(), request.msgid(), request.uuid())
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Runs once with the payload when the last reference is released
    pub fn with_drop(mut self, drop: DropFn) -> Self {
        self.drop = Some(drop);
        self
    }

    pub fn with_attrs(mut self, attrs: MessageAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    /// Queue ahead of normal requests
    pub fn urgent(mut self) -> Self {
        self.attrs |= MessageAttrs::URGENCY_REQUEST;
        self
    }

    /// Fire and forget
    pub fn no_reply(mut self) -> Self {
        self.attrs |= MessageAttrs::NO_REPLY_EXPECTED;
        self
    }

    pub fn with_errc(mut self, errc: ErrorCode) -> Self {
        self.errc = errc;
        self
    }
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outgoing")
            .field("fsid", &self.fsid)
            .field("tsid", &self.tsid)
            .field("kind", &self.kind)
            .field("msgid", &self.msgid)
            .field("uuid", &self.uuid)
            .field("attrs", &self.attrs)
            .field("errc", &self.errc)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

// =============================================================================
// BusHandle
// =============================================================================

/// Handle to a bus, shared by services, fibers and the embedding program
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<BusShared>,
}

impl BusHandle {
    pub(crate) fn new(shared: Arc<BusShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<BusShared> {
        &self.shared
    }

    pub(crate) fn generation(&self) -> u64 {
        self.shared.generation
    }

    fn on_group(&self, group: usize) -> bool {
        current_group() == Some((self.shared.generation, group))
    }

    /// Look up `sid`, requiring the caller to run on its group thread
    pub(crate) fn owned_service(&self, sid: ServiceId) -> Result<&Arc<ServiceEntry>, BusError> {
        let entry = self
            .shared
            .services
            .get(&sid)
            .ok_or_else(|| BusError::no_sid(sid))?;
        if !self.on_group(entry.group) {
            return Err(BusError::no_perm(format!(
                "service {} is consumed on group {} only",
                sid, entry.group
            )));
        }
        Ok(entry)
    }

    fn group_of(&self, group: usize) -> &GroupShared {
        &self.shared.groups[group]
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Bind an implementation to the configured service `sid`.
    ///
    /// Only allowed between `init` and `load`.
    pub fn register_service(&self, sid: ServiceId, service: Arc<dyn Service>) -> Result<(), BusError> {
        let state = self.shared.state.lock();
        if *state != BusState::Initialized {
            return Err(BusError::no_perm(format!("registration closed in state {:?}", *state)));
        }

        let entry = self
            .shared
            .services
            .get(&sid)
            .ok_or_else(|| BusError::no_sid(sid))?;

        let binding = Binding::capture(service)?;
        if let Some(chid) = binding
            .channels
            .iter()
            .find(|chid| !self.shared.channels.contains_key(*chid))
        {
            return Err(BusError::no_mid("channel", *chid));
        }

        entry.bind(binding)?;
        drop(state);

        info!(sid, group = entry.group, "Service registered");
        Ok(())
    }

    /// Bind an implementation to the configured fiber `fid`.
    ///
    /// Only allowed between `init` and `load`.
    pub fn register_filber(&self, fid: FiberId, fiber: Arc<dyn Fiber>) -> Result<(), BusError> {
        let state = self.shared.state.lock();
        if *state != BusState::Initialized {
            return Err(BusError::no_perm(format!("registration closed in state {:?}", *state)));
        }

        let entry = self
            .shared
            .fibers
            .get(&fid)
            .ok_or_else(|| BusError::no_mid("fiber", fid))?;
        entry.bind(fiber)?;
        drop(state);

        info!(fid, group = entry.group, "Fiber registered");
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Send a request or response.
    ///
    /// A refused request that expects a reply is answered with a synthesized
    /// error response and counts as sent. Protocol misuse is fatal.
    pub fn send_msg(&self, out: Outgoing) -> Result<(), BusError> {
        protocol::send(&self.shared, out)
    }

    /// Deliver queued messages of `kind` to `callback`, in priority order.
    ///
    /// Only messages queued at the time of the call are delivered. Returns the
    /// number delivered.
    pub fn recv_msg(
        &self,
        sid: ServiceId,
        kind: MessageKind,
        mut callback: impl FnMut(&Message),
    ) -> Result<usize, BusError> {
        let entry = self.owned_service(sid)?;
        let count = entry.queue.lock().len_kind(kind);

        let mut delivered = 0;
        while delivered < count {
            let Some(msg) = entry.queue.lock().pop_kind(kind) else {
                break;
            };
            entry.accept(&msg);
            callback(&msg);
            delivered += 1;
        }

        self.settle(entry);
        trace!(sid, %kind, delivered, "Messages received");
        Ok(delivered)
    }

    /// Offer every queued message of `kind` to `pick`, removing the taken ones.
    ///
    /// A taken request is accepted only after `pick` returns [`Pick::Take`],
    /// so it cannot be answered from inside `pick`: that reply counts as
    /// unsolicited and is fatal. Keep a reference with [`Message::add_ref`]
    /// and reply once `pick_msg` returns. Returns the number taken.
    pub fn pick_msg(
        &self,
        sid: ServiceId,
        kind: MessageKind,
        mut pick: impl FnMut(&Message) -> Pick,
    ) -> Result<usize, BusError> {
        let entry = self.owned_service(sid)?;
        let candidates = entry.queue.lock().snapshot(kind);

        let mut taken = 0;
        for msg in candidates {
            if pick(&msg) == Pick::Skip {
                continue;
            }
            if let Some(queued) = entry.queue.lock().remove(&msg) {
                entry.accept(&queued);
                taken += 1;
            }
        }

        self.settle(entry);
        trace!(sid, %kind, taken, "Messages picked");
        Ok(taken)
    }

    /// Idle a waiting service whose queue was drained outside dispatch
    fn settle(&self, entry: &ServiceEntry) {
        let queue = entry.queue.lock();
        if queue.is_empty() {
            self.group_of(entry.group).service_sched.lock().settle(entry.index);
        }
    }

    // =========================================================================
    // Data
    // =========================================================================

    /// Push data for `tsid` into channel `chid`
    pub fn send_dat(
        &self,
        fsid: ServiceId,
        tsid: ServiceId,
        chid: ChannelId,
        payload: Option<Payload>,
        drop: Option<DropFn>,
    ) -> Result<(), BusError> {
        channel::send(&self.shared, fsid, tsid, chid, payload, drop)
    }

    /// Pull the backlog of `sid` from `chid` into its data handler
    pub fn recv_dat(&self, sid: ServiceId, chid: ChannelId) -> Result<usize, BusError> {
        channel::receive(self, sid, chid)
    }

    /// Raw pull: `callback` sees every item of the backlog, then `None`
    pub fn pull_dat(
        &self,
        sid: ServiceId,
        chid: ChannelId,
        mut callback: impl FnMut(Option<Data>),
    ) -> Result<(), BusError> {
        self.owned_service(sid)?;
        channel::pull(&self.shared, sid, chid, &mut callback)
    }

    // =========================================================================
    // Fibers
    // =========================================================================

    /// Switch into fiber `fid` until it yields or `route` returns.
    ///
    /// Must run on the fiber's group thread, outside any other fiber.
    pub fn filber_resume(&self, fid: FiberId) -> Result<FiberStatus, BusError> {
        let entry = self
            .shared
            .fibers
            .get(&fid)
            .ok_or_else(|| BusError::no_mid("fiber", fid))?;
        if !self.on_group(entry.group) {
            return Err(BusError::no_perm(format!(
                "fiber {} resumes on group {} only",
                fid, entry.group
            )));
        }
        if entry.binding().is_none() {
            return Err(BusError::no_perm(format!("fiber {} not registered", fid)));
        }

        let group = self.group_of(entry.group);
        {
            let mut sched = group.fiber_sched.lock();
            if !sched.begin(entry.index) {
                let running = sched.current().map(|index| group.fibers[index].fid);
                drop(sched);
                fatal(format_args!(
                    "fiber {} resumed while fiber {:?} is running",
                    fid, running
                ));
            }
        }

        let status = fiber::run_current(self, group, entry.index);
        group.fiber_sched.lock().suspend(entry.index);
        Ok(status)
    }

    /// Suspend the running fiber. Fatal outside a fiber.
    pub fn filber_yield(&self) {
        fiber::yield_current();
    }

    /// Queue fiber `fid` for resumption by its group's drive loop
    pub fn filber_wake(&self, fid: FiberId) -> Result<(), BusError> {
        let entry = self
            .shared
            .fibers
            .get(&fid)
            .ok_or_else(|| BusError::no_mid("fiber", fid))?;
        if entry.binding().is_none() {
            return Err(BusError::no_perm(format!("fiber {} not registered", fid)));
        }

        let group = self.group_of(entry.group);
        if group.fiber_sched.lock().wake(entry.index) {
            group.waker.wake();
        }
        trace!(fid, "Fiber woken");
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn service_stats(&self, sid: ServiceId) -> Result<ServiceStats, BusError> {
        let entry = self
            .shared
            .services
            .get(&sid)
            .ok_or_else(|| BusError::no_sid(sid))?;
        Ok(entry.stats(self.group_of(entry.group)))
    }

    pub fn group_info(&self, index: usize) -> Option<GroupInfo> {
        self.shared.groups.get(index).map(|group| group.info())
    }

    pub fn group_count(&self) -> usize {
        self.shared.groups.len()
    }

    /// Index of the group whose thread is calling, if any
    pub fn current_group(&self) -> Option<usize> {
        current_group()
            .filter(|(generation, _)| *generation == self.shared.generation)
            .map(|(_, group)| group)
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("generation", &self.shared.generation)
            .finish_non_exhaustive()
    }
}
