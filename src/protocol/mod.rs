//! Interface between the cache and the Channel Access client library
//!
//! The cache never talks to the network itself. Everything it needs from a CA client
//! (channel creation, subscriptions, puts and a few synchronous queries) goes through
//! [`ProtocolClient`]. Implementations deliver their callbacks on their own threads,
//! concurrently with callers of the cache, and the cache is written to expect that.
//!
//! [`loopback::LoopbackClient`] is an in-memory implementation that serves PVs held in
//! the same process.

pub mod loopback;
pub use loopback::LoopbackClient;

use std::sync::Arc;

use crate::{
    condition::ErrorCondition,
    dbr::{Dbr, DbrBasicType, DbrType, DbrValue},
};

/// Identifies a channel created by a [`ProtocolClient`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// Identifies a subscription created by a [`ProtocolClient`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// The channel has never been connected
    NeverConnected,
    Connected,
    /// The channel was connected, and the connection was lost
    Disconnected,
    Closed,
}

/// Events raised for a channel outside of value updates
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Up,
    Down,
    /// An asynchronous error reported against this channel
    Exception(ErrorCondition, String),
}

/// Called with every connection change and exception of a channel
pub type ConnectionHandler = Arc<dyn Fn(ChannelId, ChannelEvent) + Send + Sync>;

/// Called with every update of a subscription
///
/// A non-normal status from the server arrives as an `Err`.
pub type ValueHandler = Arc<dyn Fn(Result<Dbr, ErrorCondition>) + Send + Sync>;

/// Called exactly once when a put with completion has been processed
pub type PutHandler = Box<dyn FnOnce(ErrorCondition) + Send>;

/// Capabilities the cache needs from a Channel Access client
///
/// Channel and subscription management, `write` and `flush` must not block on the
/// network: they queue work and report the outcome through the handlers. `state`,
/// `element_count` and `native_kind` answer immediately from what is already known
/// about a channel.
pub trait ProtocolClient: Send + Sync + 'static {
    /// Start connecting a channel to a named PV
    fn create_channel(
        &self,
        name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<ChannelId, ErrorCondition>;

    /// Close a channel, dropping all of its subscriptions
    fn close_channel(&self, channel: ChannelId);

    /// Subscribe to value changes of a channel, in the requested DBR type
    ///
    /// The first update is the current value. A `count` of zero asks for the
    /// native element count.
    fn subscribe(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        on_value: ValueHandler,
    ) -> Result<SubscriptionId, ErrorCondition>;

    fn unsubscribe(&self, subscription: SubscriptionId);

    /// Put a value to a channel
    ///
    /// If `on_complete` is given, it is called once the server has processed the
    /// put. An `Err` means the put was never issued, and `on_complete` is dropped
    /// without being called.
    fn write(
        &self,
        channel: ChannelId,
        value: DbrValue,
        on_complete: Option<PutHandler>,
    ) -> Result<(), ErrorCondition>;

    /// Send any queued requests
    fn flush(&self) {}

    fn state(&self, channel: ChannelId) -> ChannelState;

    /// Native element count of a connected channel, 0 if unknown
    fn element_count(&self, channel: ChannelId) -> usize;

    fn native_kind(&self, channel: ChannelId) -> Option<DbrBasicType>;

    /// Human readable text for an error code
    fn error_message(&self, condition: ErrorCondition) -> String {
        condition.to_string()
    }
}
