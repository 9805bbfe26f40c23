//! The write path, and the channels it writes through.
//!
//! Writes keep their own name to channel map, independent of the registry, so that a
//! PV can be written without ever being read. In polling mode the map is emptied after
//! every batch.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use num::NumCast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    cache::Shared,
    condition::{CacheError, ErrorCondition, ErrorReport},
    dbr::DbrValue,
    protocol::{ChannelId, ChannelState, ConnectionHandler, ProtocolClient, PutHandler},
    read::clean_names,
    snapshot::WriteResult,
};

/// Longest single wait, so shutdown is noticed promptly
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Data type of the values handed to a write
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteKind {
    String = 0,
    Float = 1,
    Double = 2,
    Char = 3,
    Short = 4,
    Long = 5,
    /// 64-bit integers, sent as Long
    Quad = 6,
}

impl TryFrom<u32> for WriteKind {
    type Error = CacheError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => WriteKind::String,
            1 => WriteKind::Float,
            2 => WriteKind::Double,
            3 => WriteKind::Char,
            4 => WriteKind::Short,
            5 => WriteKind::Long,
            6 => WriteKind::Quad,
            _ => return Err(CacheError::UnknownDataType(value)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    Strings(Vec<String>),
    Doubles(Vec<f64>),
    Integers(Vec<i64>),
}

impl BlockData {
    fn len(&self) -> usize {
        match self {
            BlockData::Strings(v) => v.len(),
            BlockData::Doubles(v) => v.len(),
            BlockData::Integers(v) => v.len(),
        }
    }
}

/// Values to write, as `rows` x `cols` stored row by row
///
/// By default each row holds the values for one name. A block with a single row
/// and several names is read column by column instead, one value per name.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueBlock {
    rows: usize,
    cols: usize,
    data: BlockData,
}

impl ValueBlock {
    pub fn new(rows: usize, cols: usize, data: BlockData) -> Result<Self, CacheError> {
        if data.len() == 0 {
            return Err(CacheError::InvalidInput("empty value block"));
        }
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(CacheError::BadShape {
                rows,
                cols,
                actual: data.len(),
            });
        }
        Ok(ValueBlock { rows, cols, data })
    }
    pub fn strings(rows: usize, cols: usize, values: Vec<String>) -> Result<Self, CacheError> {
        Self::new(rows, cols, BlockData::Strings(values))
    }
    pub fn doubles(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self, CacheError> {
        Self::new(rows, cols, BlockData::Doubles(values))
    }
    pub fn integers(rows: usize, cols: usize, values: Vec<i64>) -> Result<Self, CacheError> {
        Self::new(rows, cols, BlockData::Integers(values))
    }
    /// A single row of values
    pub fn row(data: BlockData) -> Result<Self, CacheError> {
        let cols = data.len();
        Self::new(1, cols, data)
    }
    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }

    fn holds(&self, kind: WriteKind) -> bool {
        matches!(
            (&self.data, kind),
            (BlockData::Strings(_), WriteKind::String)
                | (BlockData::Doubles(_), WriteKind::Float | WriteKind::Double)
                | (
                    BlockData::Integers(_),
                    WriteKind::Char | WriteKind::Short | WriteKind::Long | WriteKind::Quad
                )
        )
    }

    /// Number of value sets, and the number of values in each
    fn layout(&self, column_major: bool) -> (usize, usize) {
        if column_major {
            (self.cols, self.rows)
        } else {
            (self.rows, self.cols)
        }
    }

    /// The first `count` values of a value set, as the kind the caller declared
    fn value_set(
        &self,
        set: usize,
        count: usize,
        column_major: bool,
        kind: WriteKind,
    ) -> Result<DbrValue, ErrorCondition> {
        let position = |v: usize| {
            if column_major {
                set + v * self.cols
            } else {
                v + set * self.cols
            }
        };
        fn cast<T: Copy + NumCast, U: NumCast>(items: &[T]) -> Result<Vec<U>, ErrorCondition> {
            items
                .iter()
                .map(|v| NumCast::from(*v).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        Ok(match &self.data {
            BlockData::Strings(values) => {
                DbrValue::String((0..count).map(|v| values[position(v)].clone()).collect())
            }
            BlockData::Doubles(values) => {
                let items: Vec<f64> = (0..count).map(|v| values[position(v)]).collect();
                match kind {
                    WriteKind::Float => DbrValue::Float(cast(&items)?),
                    _ => DbrValue::Double(items),
                }
            }
            BlockData::Integers(values) => {
                let items: Vec<i64> = (0..count).map(|v| values[position(v)]).collect();
                match kind {
                    WriteKind::Char => DbrValue::Char(cast(&items)?),
                    WriteKind::Short => DbrValue::Int(cast(&items)?),
                    _ => DbrValue::Long(cast(&items)?),
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// How long to wait for connections, and then for completions. Zero uses the
    /// cache default.
    pub timeout: Duration,
    /// Wait for the server to confirm each put
    pub synchronous: bool,
    /// Read the value block column by column, one value per name per row
    pub column_major: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            timeout: Duration::ZERO,
            synchronous: false,
            column_major: false,
        }
    }
}

impl WriteOptions {
    /// Wait for every put to complete, up to `timeout`
    pub fn synchronous(timeout: Duration) -> Self {
        WriteOptions {
            timeout,
            synchronous: true,
            ..Default::default()
        }
    }
}

/// Channels used only for writing
#[derive(Default)]
pub(crate) struct WriteChannels {
    channels: Mutex<HashMap<String, ChannelId>>,
    /// Bumped by every connection event of a write channel
    events: Mutex<u64>,
    changed: Condvar,
}

impl WriteChannels {
    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    fn signal(&self) {
        *self.events.lock().unwrap() += 1;
        self.changed.notify_all();
    }

    /// Look up or create the channel of every name, returning those newly created
    fn resolve(
        &self,
        shared: &Arc<Shared>,
        names: &[String],
    ) -> (Vec<Result<ChannelId, ErrorCondition>>, Vec<ChannelId>) {
        let mut created = Vec::new();
        let resolved = names
            .iter()
            .map(|name| {
                // Looked up per name, so a name given twice shares the channel
                // created for its first occurrence
                let known = self.channels.lock().unwrap().get(name).copied();
                if let Some(channel) = known {
                    return Ok(channel);
                }
                let weak = Arc::downgrade(shared);
                let handler: ConnectionHandler = Arc::new(move |_, _| {
                    if let Some(shared) = weak.upgrade() {
                        shared.write_channels.signal();
                    }
                });
                match shared.client.create_channel(name, handler) {
                    Ok(channel) => {
                        trace!("Created write channel {channel:?} for {name}");
                        self.channels
                            .lock()
                            .unwrap()
                            .insert(name.clone(), channel);
                        created.push(channel);
                        Ok(channel)
                    }
                    Err(condition) => {
                        warn!("Could not create write channel for {name}: {condition}");
                        Err(condition)
                    }
                }
            })
            .collect();
        shared.client.flush();
        (resolved, created)
    }

    /// Block until every channel is connected or the deadline passes
    fn wait_connected(
        &self,
        client: &dyn ProtocolClient,
        pending: &[ChannelId],
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let mut seen = *self.events.lock().unwrap();
        loop {
            if cancel.is_cancelled()
                || pending
                    .iter()
                    .all(|c| client.state(*c) == ChannelState::Connected)
            {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let events = self.events.lock().unwrap();
            let events = if *events == seen {
                self.changed
                    .wait_timeout(events, (deadline - now).min(WAIT_SLICE))
                    .unwrap()
                    .0
            } else {
                events
            };
            seen = *events;
        }
    }

    pub fn close_all(&self, client: &dyn ProtocolClient) {
        let channels: Vec<ChannelId> = self
            .channels
            .lock()
            .unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect();
        if channels.is_empty() {
            return;
        }
        debug!("Closing {} write channels", channels.len());
        for channel in channels {
            client.close_channel(channel);
        }
        client.flush();
    }
}

/// Completion status of the puts of one synchronous batch
struct PutTracker {
    state: Mutex<PutState>,
    done: Condvar,
}

struct PutState {
    pending: usize,
    results: Vec<Option<ErrorCondition>>,
}

impl PutTracker {
    fn new(size: usize) -> Self {
        PutTracker {
            state: Mutex::new(PutState {
                pending: 0,
                results: vec![None; size],
            }),
            done: Condvar::new(),
        }
    }

    fn begin(&self) {
        self.state.lock().unwrap().pending += 1;
    }

    /// The put was never issued, so no completion will arrive
    fn abandon(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.done.notify_all();
        }
    }

    fn complete(&self, slot: usize, status: ErrorCondition) {
        let mut state = self.state.lock().unwrap();
        if let Some(result) = state.results.get_mut(slot) {
            *result = Some(status);
        }
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.done.notify_all();
        }
    }

    /// Wait for every begun put to complete, returning the results so far
    fn wait(&self, deadline: Instant, cancel: &CancellationToken) -> Vec<Option<ErrorCondition>> {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = Instant::now();
            if state.pending == 0 || now >= deadline || cancel.is_cancelled() {
                return state.results.clone();
            }
            state = self
                .done
                .wait_timeout(state, (deadline - now).min(WAIT_SLICE))
                .unwrap()
                .0;
        }
    }
}

/// One write batch, as laid out over its names
struct Batch<'a> {
    values: &'a ValueBlock,
    kind: WriteKind,
    column_major: bool,
    /// Number of value sets in the block
    sets: usize,
    per_set: usize,
    synchronous: bool,
    tracker: Arc<PutTracker>,
}

/// What is known about one name of a batch before completions arrive
#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Done(ErrorCondition),
    AwaitingCompletion,
}

impl Shared {
    pub(crate) fn write<S: AsRef<str>>(
        self: &Arc<Self>,
        names: &[S],
        values: &ValueBlock,
        kind: WriteKind,
        options: &WriteOptions,
    ) -> Result<WriteResult, CacheError> {
        self.check_running()?;
        if names.is_empty() {
            return Err(CacheError::InvalidInput("no PV names given"));
        }
        if !values.holds(kind) {
            return Err(CacheError::InvalidInput(
                "value block does not hold the declared data type",
            ));
        }
        let names = clean_names(names, "empty PV name")?;

        let _polling = self.config.polling.then(|| self.polling_lock.lock().unwrap());
        let _batch = self.write_lock.lock().unwrap();
        let _span = debug_span!("write", count = names.len(), ?kind).entered();
        let timeout = self.effective_timeout(options.timeout);
        let client = self.client.as_ref();

        let (channels, created) = self.write_channels.resolve(self, &names);
        if !created.is_empty() {
            self.write_channels.wait_connected(
                client,
                &created,
                Instant::now() + timeout,
                &self.cancel,
            );
        }
        self.check_running()?;

        let column_major = options.column_major || (values.rows() == 1 && names.len() > 1);
        let (sets, per_set) = values.layout(column_major);
        let batch = Batch {
            values,
            kind,
            column_major,
            sets,
            per_set,
            synchronous: options.synchronous,
            tracker: Arc::new(PutTracker::new(names.len())),
        };
        let outcomes: Vec<Outcome> = names
            .iter()
            .zip(channels)
            .enumerate()
            .map(|(slot, (name, channel))| match channel {
                Ok(channel) => self.put(&batch, slot, name, channel),
                Err(condition) => Outcome::Done(condition),
            })
            .collect();
        client.flush();

        let completions = if options.synchronous {
            batch.tracker.wait(Instant::now() + timeout, &self.cancel)
        } else {
            Vec::new()
        };
        let errors = outcomes
            .iter()
            .enumerate()
            .map(|(slot, outcome)| {
                let condition = match outcome {
                    Outcome::Done(condition) => *condition,
                    Outcome::AwaitingCompletion => completions
                        .get(slot)
                        .copied()
                        .flatten()
                        .unwrap_or(ErrorCondition::Disconn),
                };
                if !condition.is_normal() {
                    warn!("Write to {} failed: {condition}", names[slot]);
                }
                ErrorReport::new(condition, client.error_message(condition))
            })
            .collect();

        if self.config.polling {
            self.write_channels.close_all(client);
        }
        Ok(WriteResult { names, errors })
    }

    /// Convert and issue the put for one name of a batch
    fn put(&self, batch: &Batch, slot: usize, name: &str, channel: ChannelId) -> Outcome {
        let client = self.client.as_ref();
        if client.state(channel) != ChannelState::Connected {
            return Outcome::Done(ErrorCondition::Disconn);
        }
        let Some(native) = client.native_kind(channel) else {
            return Outcome::Done(ErrorCondition::Disconn);
        };
        if slot >= batch.sets {
            debug!("No values for {name}, the block has {} value sets", batch.sets);
            return Outcome::Done(ErrorCondition::BadCount);
        }
        let count = batch.per_set.min(client.element_count(channel));
        if count == 0 {
            return Outcome::Done(ErrorCondition::BadCount);
        }
        let value = match batch
            .values
            .value_set(slot, count, batch.column_major, batch.kind)
        {
            Ok(DbrValue::String(text)) => Ok(DbrValue::reencode_strings(&text, native)),
            Ok(value) => value.convert_to(native),
            Err(condition) => Err(condition),
        };
        let value = match value {
            Ok(value) => value,
            Err(condition) => {
                warn!("Could not convert value for {name} to {native:?}");
                return Outcome::Done(condition);
            }
        };
        trace!("Writing {value:?} to {name}");

        if batch.synchronous {
            batch.tracker.begin();
            let completion = batch.tracker.clone();
            let on_complete: PutHandler = Box::new(move |status| completion.complete(slot, status));
            match client.write(channel, value, Some(on_complete)) {
                Ok(()) => Outcome::AwaitingCompletion,
                Err(condition) => {
                    batch.tracker.abandon();
                    Outcome::Done(condition)
                }
            }
        } else {
            match client.write(channel, value, None) {
                Ok(()) => Outcome::Done(ErrorCondition::Normal),
                Err(condition) => Outcome::Done(condition),
            }
        }
    }
}
