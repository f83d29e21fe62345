//! Reference-counted request/response messages
//!
//! TigerStyle: One owner per reference, destructor runs exactly once.
//!
//! A [`Message`] is a handle to a shared, immutable message body. Cloning a
//! handle (or calling [`Message::add_ref`]) adds one reference; dropping it
//! (or calling [`Message::dec_ref`]) releases one. When the last reference goes
//! away the payload is handed to its destructor, or simply dropped when none
//! was supplied.

use crate::error::ErrorCode;
use crate::{MessageId, ServiceId};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque message or data payload
pub type Payload = Box<dyn Any + Send + Sync>;

/// Destructor invoked once with the payload when the last reference drops
pub type DropFn = Box<dyn FnOnce(Payload) + Send + Sync>;

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// Request message.
    ///
    /// Unless [`MessageAttrs::NO_REPLY_EXPECTED`] is set, the sender must
    /// already have a response handler for the message id, and the uuid must
    /// not collide with another unanswered request of the same sender.
    Request,
    /// Response message. Only valid after receiving the matching request.
    Response,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "req"),
            MessageKind::Response => write!(f, "rsp"),
        }
    }
}

bitflags! {
    /// Message attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageAttrs: u32 {
        /// A reply is not expected
        const NO_REPLY_EXPECTED = 1;
        /// The request is delivered ahead of normal requests
        const URGENCY_REQUEST = 2;
    }
}

/// Routing fields of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Error code
    pub errc: ErrorCode,
    /// From service
    pub fsid: ServiceId,
    /// To service
    pub tsid: ServiceId,
    /// Message type
    pub kind: MessageKind,
    /// Message ID
    pub msgid: MessageId,
    /// Per-sender sequence ID
    pub seqid: u32,
    /// Attributes
    pub attrs: MessageAttrs,
    /// User-defined unique identifier
    pub uuid: u32,
}

impl MessageHeader {
    /// Header of the response that answers this request.
    ///
    /// Sender and receiver swap; message id and uuid are kept so the
    /// requester can pair it.
    pub fn reply(&self, errc: ErrorCode, seqid: u32) -> Self {
        debug_assert_eq!(self.kind, MessageKind::Request);
        Self {
            errc,
            fsid: self.tsid,
            tsid: self.fsid,
            kind: MessageKind::Response,
            msgid: self.msgid,
            seqid,
            attrs: MessageAttrs::empty(),
            uuid: self.uuid,
        }
    }

    /// Whether the sender of this request waits for a response
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::Request && !self.attrs.contains(MessageAttrs::NO_REPLY_EXPECTED)
    }

    /// Whether this request jumps ahead of normal requests
    pub fn is_urgent(&self) -> bool {
        self.kind == MessageKind::Request && self.attrs.contains(MessageAttrs::URGENCY_REQUEST)
    }
}

/// Payload slot shared by messages and data.
///
/// Runs the destructor exactly once, when the owning body is dropped.
pub(crate) struct Body {
    payload: Option<Payload>,
    drop: Option<DropFn>,
}

impl Body {
    pub(crate) fn new(payload: Option<Payload>, drop: Option<DropFn>) -> Self {
        Self { payload, drop }
    }

    pub(crate) fn payload(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.payload.as_deref()
    }

    pub(crate) fn has_drop(&self) -> bool {
        self.drop.is_some()
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        let drop_fn = self.drop.take();
        match (self.payload.take(), drop_fn) {
            (Some(payload), Some(drop_fn)) => drop_fn(payload),
            (None, Some(drop_fn)) => drop_fn(Box::new(())),
            (payload, None) => drop(payload),
        }
    }
}

struct MessageInner {
    header: MessageHeader,
    body: Body,
}

/// Reference-counted message handle
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    /// Create a message with a reference count of 1
    pub fn new(header: MessageHeader, payload: Option<Payload>, drop: Option<DropFn>) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                header,
                body: Body::new(payload, drop),
            }),
        }
    }

    /// Create an error message with no payload
    pub fn error(header: MessageHeader) -> Self {
        debug_assert!(!header.errc.is_ok(), "error message must carry an error code");
        Self::new(header, None, None)
    }

    /// Increase the reference count by one
    pub fn add_ref(&self) -> Message {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Decrease the reference count by one.
    ///
    /// The destructor runs if this was the last reference.
    pub fn dec_ref(self) {
        drop(self);
    }

    /// Current number of references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same message
    pub fn ptr_eq(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn header(&self) -> &MessageHeader {
        &self.inner.header
    }

    pub fn errc(&self) -> ErrorCode {
        self.inner.header.errc
    }

    pub fn fsid(&self) -> ServiceId {
        self.inner.header.fsid
    }

    pub fn tsid(&self) -> ServiceId {
        self.inner.header.tsid
    }

    pub fn kind(&self) -> MessageKind {
        self.inner.header.kind
    }

    pub fn msgid(&self) -> MessageId {
        self.inner.header.msgid
    }

    pub fn seqid(&self) -> u32 {
        self.inner.header.seqid
    }

    pub fn attrs(&self) -> MessageAttrs {
        self.inner.header.attrs
    }

    pub fn uuid(&self) -> u32 {
        self.inner.header.uuid
    }

    /// The opaque payload, if any
    pub fn payload(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.inner.body.payload()
    }

    /// Downcast the payload to a concrete type
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload().and_then(|p| p.downcast_ref::<T>())
    }

    /// Whether a custom destructor is attached
    pub fn has_drop(&self) -> bool {
        self.inner.body.has_drop()
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.inner.header)
            .field("has_payload", &self.payload().is_some())
            .field("refcnt", &self.ref_count())
            .finish()
    }
}
