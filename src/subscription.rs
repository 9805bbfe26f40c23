use thiserror::Error;
use tokio::sync::broadcast;

use crate::snapshot::PvSnapshot;

/// Error type for `Subscription::recv`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriberRecvError {
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
}

impl From<broadcast::error::RecvError> for SubscriberRecvError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::Closed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Error type for `Subscription::try_recv`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriberTryRecvError {
    #[error("No messages outstanding")]
    Empty,
    #[error("Channel closed")]
    Closed,
    #[error("Receiver lagged by {0} messages")]
    Lagged(u64),
}

impl From<broadcast::error::TryRecvError> for SubscriberTryRecvError {
    fn from(err: broadcast::error::TryRecvError) -> Self {
        match err {
            broadcast::error::TryRecvError::Empty => Self::Empty,
            broadcast::error::TryRecvError::Closed => Self::Closed,
            broadcast::error::TryRecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Snapshots of one PV, pushed every time the cache updates it
///
/// The snapshot current at the time of subscribing is delivered first. A receiver
/// that falls more than the notify capacity behind skips the oldest updates and is
/// told how many it missed.
pub struct Subscription {
    initial: Option<PvSnapshot>,
    inner: broadcast::Receiver<PvSnapshot>,
}

impl Subscription {
    pub(crate) fn new(initial: PvSnapshot, inner: broadcast::Receiver<PvSnapshot>) -> Self {
        Self {
            initial: Some(initial),
            inner,
        }
    }

    /// Blocking receive for synchronous contexts
    pub fn blocking_recv(&mut self) -> Result<PvSnapshot, SubscriberRecvError> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        Ok(self.inner.blocking_recv()?)
    }

    /// Receive the next snapshot
    pub async fn recv(&mut self) -> Result<PvSnapshot, SubscriberRecvError> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        Ok(self.inner.recv().await?)
    }

    /// Try to receive a snapshot without waiting
    pub fn try_recv(&mut self) -> Result<PvSnapshot, SubscriberTryRecvError> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        Ok(self.inner.try_recv()?)
    }

    /// True once the cache has dropped this PV's notifier
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of snapshots waiting to be received
    pub fn len(&self) -> usize {
        self.inner.len() + usize::from(self.initial.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
