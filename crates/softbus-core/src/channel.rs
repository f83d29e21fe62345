//! Channel contract
//!
//! TigerStyle: The bus routes, the channel stores.
//!
//! A channel owns whatever storage and backpressure policy it wants. The bus
//! only calls these four hooks and never inspects a [`Data`] payload.

use crate::data::Data;
use crate::ServiceId;

/// Routing endpoint for streamed data
pub trait Channel: Send + Sync + 'static {
    /// Called on the receiving service's group thread before the service's
    /// own `on_init`
    fn on_init(&self, _sid: ServiceId) {}

    /// Called on the receiving service's group thread after the service's
    /// own `on_exit`
    fn on_exit(&self, _sid: ServiceId) {}

    /// Accept one item addressed to `sid`.
    ///
    /// Called on the sender's thread. The channel takes over the reference.
    fn on_push(&self, sid: ServiceId, data: Data);

    /// Hand every available item for `sid` to `callback`, then call it once
    /// with `None` to signal exhaustion
    fn on_pull(&self, sid: ServiceId, callback: &mut dyn FnMut(Option<Data>));
}
