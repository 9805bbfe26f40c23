//! The PV registry: an append-only arena of cached PV records.
//!
//! Every distinct name gets one [`PvRecord`], addressed by its index in the arena.
//! Indices are handed out once and never reused while the registry lives, so they can
//! be captured by protocol callbacks. Each record also carries a generation number,
//! renewed whenever its connection state is thrown away, and callbacks present both.
//! A callback whose index or generation no longer matches is ignored.
//!
//! The registry lock only ever guards short, non-blocking work. Anything that talks
//! to the protocol client is collected into a [`Teardown`] (or a queued
//! registration) and run after the lock is released.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Condvar, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    condition::{CacheError, ErrorCondition, ErrorReport},
    dbr::Status,
    protocol::{ChannelId, ProtocolClient, SubscriptionId},
    snapshot::{DISCONNECTED_SEVERITY, DISCONNECTED_STATUS, PvSnapshot},
};

/// Stable handle of a PV record
pub type PvIndex = usize;

/// Longest single wait while blocked for values, so shutdown is noticed promptly
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Connection lifecycle of a record
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PvState {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SubscriptionSlot {
    Empty,
    /// A subscribe call is in flight, outside the registry lock
    Requested,
    Active(SubscriptionId),
}

/// The two subscriptions a record may hold
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SubscriptionRole {
    Value = 0,
    EnumLabels = 1,
}

/// Allocate an empty vector able to hold `capacity` items, reporting failure
pub(crate) fn try_vec<T>(capacity: usize) -> Result<Vec<T>, ErrorCondition> {
    let mut items = Vec::new();
    items
        .try_reserve_exact(capacity)
        .map_err(|_| ErrorCondition::AllocMem)?;
    Ok(items)
}

pub(crate) struct PvRecord {
    pub name: String,
    pub index: PvIndex,
    pub generation: u64,
    pub state: PvState,
    /// Waiting in the connect queue
    pub queued: bool,
    /// Created for a `base.FIELD` read
    pub is_field: bool,
    pub element_count: usize,
    pub values: Vec<f64>,
    pub strings: Vec<String>,
    pub status: i16,
    pub status_text: String,
    pub severity: i16,
    pub severity_text: String,
    pub timestamp: Option<SystemTime>,
    pub enum_labels: Vec<String>,
    pub field_names: Vec<String>,
    pub field_values: Vec<String>,
    pub channel: Option<ChannelId>,
    pub subscriptions: [SubscriptionSlot; 2],
    pub last_error: ErrorCondition,
    pub last_error_message: String,
    pub has_value: bool,
    notifier: Option<broadcast::Sender<PvSnapshot>>,
}

impl PvRecord {
    fn new(
        name: &str,
        index: PvIndex,
        generation: u64,
        field_names: &[String],
        is_field: bool,
    ) -> Self {
        let mut record = PvRecord {
            name: name.to_owned(),
            index,
            generation,
            state: PvState::Unconnected,
            queued: false,
            is_field,
            element_count: 0,
            values: Vec::new(),
            strings: Vec::new(),
            status: 0,
            status_text: String::new(),
            severity: 0,
            severity_text: String::new(),
            timestamp: None,
            enum_labels: Vec::new(),
            field_names: field_names.to_vec(),
            field_values: vec![String::new(); field_names.len()],
            channel: None,
            subscriptions: [SubscriptionSlot::Empty; 2],
            last_error: ErrorCondition::Disconn,
            last_error_message: ErrorCondition::Disconn.to_string(),
            has_value: false,
            notifier: None,
        };
        record.set_disconnected();
        record
    }

    /// Mark as not connected, keeping the cached values and timestamp
    pub fn set_disconnected(&mut self) {
        self.status_text = DISCONNECTED_STATUS.0.to_string();
        self.status = DISCONNECTED_STATUS.1;
        self.severity_text = DISCONNECTED_SEVERITY.0.to_string();
        self.severity = DISCONNECTED_SEVERITY.1;
        self.set_error(ErrorCondition::Disconn, ErrorCondition::Disconn.to_string());
    }

    pub fn set_error(&mut self, condition: ErrorCondition, message: String) {
        self.last_error = condition;
        self.last_error_message = message;
    }

    pub fn set_alarm(&mut self, status: Status) {
        self.status = status.status;
        self.status_text = status.status_text();
        self.severity = status.severity;
        self.severity_text = status.severity_text();
    }

    /// Size the value and string arrays for a new element count
    ///
    /// Both arrays change together or not at all. On allocation failure the
    /// record keeps its previous arrays and count.
    pub fn resize_values(&mut self, count: usize) -> Result<(), ErrorCondition> {
        if count == self.element_count && self.values.len() == count {
            return Ok(());
        }
        if count > self.values.len() {
            let extra = count - self.values.len();
            self.values
                .try_reserve_exact(extra)
                .map_err(|_| ErrorCondition::AllocMem)?;
            self.strings
                .try_reserve_exact(count - self.strings.len())
                .map_err(|_| ErrorCondition::AllocMem)?;
        }
        self.values.resize(count, 0.0);
        self.strings.resize(count, String::new());
        self.element_count = count;
        Ok(())
    }

    /// Replace the cached sample with freshly decoded arrays, as one unit
    pub fn store_sample(&mut self, values: Vec<f64>, strings: Vec<String>) {
        debug_assert_eq!(values.len(), strings.len());
        self.element_count = values.len();
        self.values = values;
        self.strings = strings;
    }

    /// Throw away connection state and cached data, keeping the slot
    fn reset(&mut self, generation: u64, teardown: &mut Teardown) {
        teardown.take_from(self);
        self.generation = generation;
        self.state = PvState::Unconnected;
        self.queued = false;
        self.element_count = 0;
        self.values.clear();
        self.strings.clear();
        self.timestamp = None;
        self.enum_labels.clear();
        self.field_values = vec![String::new(); self.field_names.len()];
        self.has_value = false;
        self.set_disconnected();
        self.publish();
    }

    pub fn snapshot(&self) -> PvSnapshot {
        let connected = self.element_count > 0;
        let (timestamp_text, timestamp_epoch) =
            PvSnapshot::timestamp_parts(self.timestamp.filter(|_| connected));
        let (status_text, status, severity_text, severity) = if connected {
            (
                self.status_text.clone(),
                self.status,
                self.severity_text.clone(),
                self.severity,
            )
        } else {
            (
                DISCONNECTED_STATUS.0.to_string(),
                DISCONNECTED_STATUS.1,
                DISCONNECTED_SEVERITY.0.to_string(),
                DISCONNECTED_SEVERITY.1,
            )
        };
        PvSnapshot {
            name: self.name.clone(),
            index: self.index,
            element_count: self.element_count,
            values: self.values.clone(),
            strings: self.strings.clone(),
            status,
            status_text,
            severity,
            severity_text,
            timestamp: self.timestamp.filter(|_| connected),
            timestamp_text,
            timestamp_epoch,
            field_names: self.field_names.clone(),
            field_values: self.field_values.clone(),
            error: ErrorReport::new(self.last_error, self.last_error_message.clone()),
            has_value: self.has_value,
        }
    }

    /// Push the current snapshot to anyone subscribed to this PV
    pub fn publish(&self) {
        if let Some(notifier) = &self.notifier
            && notifier.receiver_count() > 0
        {
            let _ = notifier.send(self.snapshot());
        }
    }
}

/// Protocol resources taken out of the registry, to be released without its lock
#[derive(Debug, Default)]
pub(crate) struct Teardown {
    channels: Vec<ChannelId>,
    subscriptions: Vec<SubscriptionId>,
}

impl Teardown {
    fn take_from(&mut self, record: &mut PvRecord) {
        for slot in record.subscriptions.iter_mut() {
            if let SubscriptionSlot::Active(id) = *slot {
                self.subscriptions.push(id);
            }
            *slot = SubscriptionSlot::Empty;
        }
        if let Some(channel) = record.channel.take() {
            self.channels.push(channel);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.subscriptions.is_empty()
    }

    pub fn release(self, client: &dyn ProtocolClient) {
        if self.is_empty() {
            return;
        }
        debug!(
            "Releasing {} subscriptions and {} channels",
            self.subscriptions.len(),
            self.channels.len()
        );
        for subscription in self.subscriptions {
            client.unsubscribe(subscription);
        }
        for channel in self.channels {
            client.close_channel(channel);
        }
        client.flush();
    }
}

/// FIFO of records waiting for the connect worker
#[derive(Default)]
pub(crate) struct ConnectQueue {
    pending: Mutex<VecDeque<(PvIndex, u64)>>,
    available: Condvar,
}

impl ConnectQueue {
    fn push(&self, index: PvIndex, generation: u64) {
        self.pending.lock().unwrap().push_back((index, generation));
        self.available.notify_one();
    }

    /// Take the next entry, waiting up to `idle` if there is none
    ///
    /// Cancellation is checked under the queue lock, pairing with [`Self::wake`].
    pub fn pop(&self, idle: Duration, cancel: &CancellationToken) -> Option<(PvIndex, u64)> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() && !cancel.is_cancelled() {
            pending = self.available.wait_timeout(pending, idle).unwrap().0;
        }
        pending.pop_front()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn clear(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Wake a waiting worker, e.g. to see shutdown
    pub fn wake(&self) {
        let _pending = self.pending.lock().unwrap();
        self.available.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    pub index: PvIndex,
    pub created: bool,
    /// An existing record went back in the connect queue
    pub requeued: bool,
}

impl Registration {
    /// True if the record has no connection yet because of this registration
    pub fn is_new(&self) -> bool {
        self.created || self.requeued
    }
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    records: Vec<PvRecord>,
    lookup: HashMap<String, PvIndex>,
    torn_down: bool,
}

impl RegistryInner {
    /// The record at `index`, if it is still the same generation
    pub fn get_mut(&mut self, index: PvIndex, generation: u64) -> Option<&mut PvRecord> {
        if self.torn_down {
            return None;
        }
        self.records
            .get_mut(index)
            .filter(|r| r.generation == generation)
    }

    pub fn index_of(&self, name: &str) -> Option<PvIndex> {
        self.lookup.get(name).copied()
    }

    pub fn record_mut(&mut self, index: PvIndex) -> Option<&mut PvRecord> {
        if self.torn_down {
            return None;
        }
        self.records.get_mut(index)
    }
}

pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    /// Signalled whenever a record gains a value or fails to connect
    updated: Condvar,
    queue: ConnectQueue,
    generations: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner::default()),
            updated: Condvar::new(),
            queue: ConnectQueue::default(),
            generations: AtomicU64::new(1),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap()
    }

    pub fn queue(&self) -> &ConnectQueue {
        &self.queue
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Wake everyone waiting for values
    pub fn notify_updated(&self) {
        self.updated.notify_all();
    }

    /// Find or create the record for a name
    ///
    /// New records are queued for connection. An existing record that has no
    /// channel and is not already queued, because creating its channel failed
    /// or it was removed, is queued again.
    pub fn register(
        &self,
        name: &str,
        field_names: &[String],
        is_field: bool,
    ) -> Result<Registration, CacheError> {
        let mut inner = self.lock();
        if inner.torn_down {
            return Err(CacheError::ShuttingDown);
        }
        if let Some(index) = inner.index_of(name) {
            let record = &mut inner.records[index];
            if !field_names.is_empty() && record.field_names != field_names {
                if record.field_names.is_empty() {
                    record.field_names = field_names.to_vec();
                    record.field_values = vec![String::new(); field_names.len()];
                } else {
                    warn!(
                        "{name} is already registered with fields {:?}, ignoring {:?}",
                        record.field_names, field_names
                    );
                }
            }
            let requeue = record.channel.is_none()
                && !record.queued
                && record.state == PvState::Unconnected;
            let generation = record.generation;
            if requeue {
                record.queued = true;
                record.state = PvState::Connecting;
            }
            drop(inner);
            if requeue {
                debug!("Re-queueing {name} for connection");
                self.queue.push(index, generation);
            }
            return Ok(Registration {
                index,
                created: false,
                requeued: requeue,
            });
        }

        inner
            .records
            .try_reserve(1)
            .map_err(|_| CacheError::AllocMem)?;
        let index = inner.records.len();
        let generation = self.next_generation();
        let mut record = PvRecord::new(name, index, generation, field_names, is_field);
        record.state = PvState::Connecting;
        record.queued = true;
        inner.records.push(record);
        inner.lookup.insert(name.to_owned(), index);
        drop(inner);
        trace!("Registered {name} as {index}");
        self.queue.push(index, generation);
        Ok(Registration {
            index,
            created: true,
            requeued: false,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Block until every listed record has a value, has failed to connect, or
    /// the deadline passes
    pub fn wait_for_values(
        &self,
        pending: &[PvIndex],
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let mut remaining = pending.to_vec();
        let mut inner = self.lock();
        loop {
            if inner.torn_down || cancel.is_cancelled() {
                return;
            }
            remaining.retain(|index| {
                inner.records.get(*index).is_some_and(|r| {
                    !r.has_value && !(r.state == PvState::Unconnected && !r.queued)
                })
            });
            let now = Instant::now();
            if remaining.is_empty() || now >= deadline {
                return;
            }
            let wait = (deadline - now).min(WAIT_SLICE);
            inner = self.updated.wait_timeout(inner, wait).unwrap().0;
        }
    }

    /// Copy out snapshots of the listed records
    pub fn snapshots(&self, indices: &[PvIndex]) -> Result<Vec<PvSnapshot>, CacheError> {
        let inner = self.lock();
        if inner.torn_down {
            return Err(CacheError::ShuttingDown);
        }
        Ok(indices
            .iter()
            .filter_map(|i| inner.records.get(*i))
            .map(PvRecord::snapshot)
            .collect())
    }

    pub fn all_snapshots(&self) -> Vec<PvSnapshot> {
        let inner = self.lock();
        inner.records.iter().map(PvRecord::snapshot).collect()
    }

    /// Open a push notification channel for a record, with its current snapshot
    pub fn watch(
        &self,
        index: PvIndex,
        capacity: usize,
    ) -> Option<(broadcast::Receiver<PvSnapshot>, PvSnapshot)> {
        let mut inner = self.lock();
        let record = inner.record_mut(index)?;
        let notifier = record
            .notifier
            .get_or_insert_with(|| broadcast::Sender::new(capacity.max(1)));
        let receiver = notifier.subscribe();
        Some((receiver, record.snapshot()))
    }

    /// Reset the records of the given names, and their `name.FIELD` records, in place
    pub fn remove(&self, names: &[String]) -> (usize, Teardown) {
        let mut teardown = Teardown::default();
        let mut inner = self.lock();
        let mut removed = 0;
        if inner.torn_down {
            return (removed, teardown);
        }
        let generations = &self.generations;
        for record in inner.records.iter_mut() {
            let matches = names.iter().any(|n| {
                record.name == *n
                    || record
                        .name
                        .strip_prefix(n.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            });
            if matches {
                let generation = generations.fetch_add(1, Ordering::Relaxed);
                record.reset(generation, &mut teardown);
                removed += 1;
            }
        }
        drop(inner);
        self.updated.notify_all();
        (removed, teardown)
    }

    /// Empty the registry, so that the next registration starts from nothing
    pub fn clear(&self) -> Teardown {
        let mut teardown = Teardown::default();
        let mut inner = self.lock();
        for record in inner.records.iter_mut() {
            teardown.take_from(record);
        }
        inner.records.clear();
        inner.lookup.clear();
        drop(inner);
        self.queue.clear();
        teardown
    }

    /// Refuse all further work and hand back everything still open
    pub fn tear_down(&self) -> Teardown {
        let mut teardown = Teardown::default();
        let mut inner = self.lock();
        inner.torn_down = true;
        for record in inner.records.iter_mut() {
            teardown.take_from(record);
            // Closes every push subscription
            record.notifier = None;
        }
        drop(inner);
        self.queue.clear();
        self.queue.wake();
        self.updated.notify_all();
        teardown
    }
}
