//! Request/response protocol
//!
//! TigerStyle: Misuse aborts immediately, recoverable errors travel as messages.
//!
//! Every service keeps two books. `outstanding` holds the uuids of requests it
//! sent and still waits on; `pending_replies` holds the `(requester, uuid)`
//! pairs it received and still owes a response for. A uuid is resolved the
//! moment its response (real or synthesized) is enqueued to the requester.

use crate::bus::BusShared;
use crate::handle::Outgoing;
use crate::queue::QueueFullError;
use crate::service::ServiceEntry;
use softbus_core::error::{BusError, ErrorCode};
use softbus_core::message::{DropFn, Message, MessageHeader, MessageKind, Payload};
use softbus_core::ServiceId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Abort on an unrecoverable misuse of the bus
#[cold]
#[track_caller]
pub(crate) fn fatal(reason: std::fmt::Arguments<'_>) -> ! {
    error!(%reason, "Fatal bus violation");
    panic!("softbus fatal: {}", reason);
}

/// Protocol books of one service
#[derive(Debug, Default)]
pub(crate) struct ProtocolState {
    /// Next sequence id handed to a message sent by this service
    seqid: u32,
    /// uuid -> target of each unanswered request this service sent
    outstanding: HashMap<u32, ServiceId>,
    /// (requester, uuid) of each delivered request still owed a response
    pending_replies: HashSet<(ServiceId, u32)>,
}

impl ProtocolState {
    pub(crate) fn next_seqid(&mut self) -> u32 {
        let seqid = self.seqid;
        self.seqid = self.seqid.wrapping_add(1);
        seqid
    }

    /// Record a request awaiting its response.
    ///
    /// Returns false if `uuid` is already outstanding.
    pub(crate) fn open_request(&mut self, uuid: u32, tsid: ServiceId) -> bool {
        if self.outstanding.contains_key(&uuid) {
            return false;
        }
        self.outstanding.insert(uuid, tsid);
        true
    }

    /// Close the request `uuid`, returning the service it was sent to
    pub(crate) fn resolve_request(&mut self, uuid: u32) -> Option<ServiceId> {
        self.outstanding.remove(&uuid)
    }

    /// Record that a request from `requester` was handed to this service
    pub(crate) fn accept_request(&mut self, requester: ServiceId, uuid: u32) {
        let inserted = self.pending_replies.insert((requester, uuid));
        debug_assert!(inserted, "request accepted twice");
    }

    /// Consume the right to answer `requester`'s request `uuid`
    pub(crate) fn take_reply(&mut self, requester: ServiceId, uuid: u32) -> bool {
        self.pending_replies.remove(&(requester, uuid))
    }

    pub(crate) fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending_replies.len()
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Route one outgoing message
pub(crate) fn send(bus: &BusShared, out: Outgoing) -> Result<(), BusError> {
    let sender = bus.services.get(&out.fsid);
    let seqid = sender.map_or(0, |entry| entry.protocol.lock().next_seqid());

    let header = MessageHeader {
        errc: out.errc,
        fsid: out.fsid,
        tsid: out.tsid,
        kind: out.kind,
        msgid: out.msgid,
        seqid,
        attrs: out.attrs,
        uuid: out.uuid,
    };

    match header.kind {
        MessageKind::Request => send_request(bus, sender, header, out.payload, out.drop),
        MessageKind::Response => send_response(bus, sender, header, out.payload, out.drop),
    }
}

fn send_request(
    bus: &BusShared,
    sender: Option<&Arc<ServiceEntry>>,
    header: MessageHeader,
    payload: Option<Payload>,
    drop_fn: Option<DropFn>,
) -> Result<(), BusError> {
    if header.expects_reply() {
        let Some(sender) = sender else {
            fatal(format_args!(
                "request msgid={} from unknown service {} expects a reply",
                header.msgid, header.fsid
            ));
        };

        let has_handler = sender
            .binding()
            .is_some_and(|binding| binding.handles_response(header.msgid));
        if !has_handler {
            fatal(format_args!(
                "service {} sent request msgid={} without a response handler",
                header.fsid, header.msgid
            ));
        }

        if !sender.protocol.lock().open_request(header.uuid, header.tsid) {
            fatal(format_args!(
                "service {} reused outstanding uuid {}",
                header.fsid, header.uuid
            ));
        }
    }

    let msg = Message::new(header, payload, drop_fn);
    let Some(target) = bus.services.get(&header.tsid) else {
        drop(msg);
        return refuse(bus, &header, BusError::no_sid(header.tsid));
    };

    match enqueue(bus, target, msg) {
        Ok(()) => {
            trace!(
                fsid = header.fsid,
                tsid = header.tsid,
                msgid = header.msgid,
                uuid = header.uuid,
                urgent = header.is_urgent(),
                "Request enqueued"
            );
            Ok(())
        }
        Err(full) => {
            warn!(tsid = header.tsid, error = %full, "Request refused");
            refuse(bus, &header, BusError::no_perm(full.to_string()))
        }
    }
}

fn send_response(
    bus: &BusShared,
    sender: Option<&Arc<ServiceEntry>>,
    header: MessageHeader,
    payload: Option<Payload>,
    drop_fn: Option<DropFn>,
) -> Result<(), BusError> {
    let answered = sender.is_some_and(|entry| entry.protocol.lock().take_reply(header.tsid, header.uuid));
    if !answered {
        fatal(format_args!(
            "service {} sent unsolicited response uuid={} to {}",
            header.fsid, header.uuid, header.tsid
        ));
    }

    let msg = Message::new(header, payload, drop_fn);
    match bus.services.get(&header.tsid) {
        Some(requester) => {
            deliver_response(bus, requester, msg);
            Ok(())
        }
        None => Err(BusError::no_sid(header.tsid)),
    }
}

/// Report a refused request.
///
/// When a reply is expected the error goes back as a synthesized response and
/// the send counts as done; otherwise the caller gets `err`.
fn refuse(bus: &BusShared, request: &MessageHeader, err: BusError) -> Result<(), BusError> {
    if request.expects_reply() {
        synthesize_reply(bus, request, err.code());
        Ok(())
    } else {
        debug!(
            fsid = request.fsid,
            tsid = request.tsid,
            msgid = request.msgid,
            error = %err,
            "Request dropped"
        );
        Err(err)
    }
}

/// Answer `request` on the bus's behalf with an empty error response
pub(crate) fn synthesize_reply(bus: &BusShared, request: &MessageHeader, errc: ErrorCode) {
    debug_assert!(!errc.is_ok());
    debug_assert!(request.expects_reply());

    let Some(requester) = bus.services.get(&request.fsid) else {
        warn!(fsid = request.fsid, "Requester vanished, error response dropped");
        return;
    };

    debug!(
        fsid = request.tsid,
        tsid = request.fsid,
        msgid = request.msgid,
        uuid = request.uuid,
        errc = %errc,
        "Synthesized error response"
    );
    deliver_response(bus, requester, Message::error(request.reply(errc, 0)));
}

fn deliver_response(bus: &BusShared, requester: &Arc<ServiceEntry>, rsp: Message) {
    debug_assert_eq!(rsp.kind(), MessageKind::Response);

    let resolved = requester.protocol.lock().resolve_request(rsp.uuid());
    debug_assert!(
        resolved.is_none() || resolved == Some(rsp.fsid()),
        "response from a service the request was not sent to"
    );

    // Responses never count against the depth limit
    let result = enqueue(bus, requester, rsp);
    debug_assert!(result.is_ok());
}

/// Push into a service queue, waking its group on the empty to non-empty edge.
///
/// Lock order is queue, then scheduler.
pub(crate) fn enqueue(
    bus: &BusShared,
    entry: &ServiceEntry,
    msg: Message,
) -> Result<(), QueueFullError> {
    let group = &bus.groups[entry.group];

    let mut queue = entry.queue.lock();
    let was_empty = queue.is_empty();
    queue.push(msg)?;

    if was_empty {
        let woke = group.service_sched.lock().wake(entry.index);
        drop(queue);
        if woke {
            group.waker.wake();
        }
    }

    Ok(())
}
