//! Reference-counted channel data
//!
//! TigerStyle: Same ownership rules as [`Message`](crate::Message).
//!
//! The bus never looks inside a [`Data`] payload. It only carries routing
//! fields so a channel can file the item under its receiver.

use crate::message::{Body, DropFn, Payload};
use crate::{ChannelId, ServiceId};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

struct DataInner {
    fsid: ServiceId,
    tsid: ServiceId,
    chid: ChannelId,
    body: Body,
}

/// Reference-counted data handle routed through a channel
pub struct Data {
    inner: Arc<DataInner>,
}

impl Data {
    /// Create a data item with a reference count of 1
    pub fn new(
        fsid: ServiceId,
        tsid: ServiceId,
        chid: ChannelId,
        payload: Option<Payload>,
        drop: Option<DropFn>,
    ) -> Self {
        Self {
            inner: Arc::new(DataInner {
                fsid,
                tsid,
                chid,
                body: Body::new(payload, drop),
            }),
        }
    }

    /// Increase the reference count by one
    pub fn add_ref(&self) -> Data {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Decrease the reference count by one
    pub fn dec_ref(self) {
        drop(self);
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Data) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn fsid(&self) -> ServiceId {
        self.inner.fsid
    }

    pub fn tsid(&self) -> ServiceId {
        self.inner.tsid
    }

    pub fn chid(&self) -> ChannelId {
        self.inner.chid
    }

    pub fn payload(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.inner.body.payload()
    }

    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn has_drop(&self) -> bool {
        self.inner.body.has_drop()
    }
}

impl Clone for Data {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("fsid", &self.inner.fsid)
            .field("tsid", &self.inner.tsid)
            .field("chid", &self.inner.chid)
            .field("refcnt", &self.ref_count())
            .finish()
    }
}
