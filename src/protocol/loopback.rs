use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::SystemTime,
};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    condition::ErrorCondition,
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue, Status},
    protocol::{
        ChannelEvent, ChannelId, ChannelState, ConnectionHandler, PutHandler, ProtocolClient,
        SubscriptionId, ValueHandler,
    },
    utils::wrapping_inplace_add,
};

type Job = Box<dyn FnOnce() + Send>;

/// How a loopback PV answers a put that asked for completion
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PutBehaviour {
    /// Store the value and report success
    Complete,
    /// Leave the value alone and report this condition
    Fail(ErrorCondition),
    /// Store the value but never call back
    Ignore,
}

#[derive(Debug)]
struct PV {
    value: DbrValue,
    status: Status,
    /// The last time this value was written
    timestamp: SystemTime,
    enum_strings: Vec<String>,
    /// Record fields readable as `NAME.FIELD`
    fields: HashMap<String, String>,
    online: bool,
    put_behaviour: PutBehaviour,
    puts: u64,
}

impl PV {
    fn new(value: DbrValue) -> Self {
        PV {
            value,
            status: Status::default(),
            timestamp: SystemTime::now(),
            enum_strings: Vec::new(),
            fields: HashMap::new(),
            online: true,
            put_behaviour: PutBehaviour::Complete,
            puts: 0,
        }
    }

    /// Load the value, or one of its fields, as a given DBR type
    fn load_as(
        &self,
        field: Option<&str>,
        dbr_type: DbrType,
        count: usize,
    ) -> Result<Dbr, ErrorCondition> {
        let value = match field {
            Some(field) => DbrValue::String(vec![
                self.fields.get(field).cloned().unwrap_or_default(),
            ])
            .convert_to(dbr_type.basic_type)?,
            None => match (&self.value, dbr_type.basic_type) {
                (DbrValue::Enum(index), DbrBasicType::String) => DbrValue::String(vec![
                    self.enum_strings
                        .get(usize::from(*index))
                        .cloned()
                        .unwrap_or_else(|| index.to_string()),
                ]),
                (value, basic_type) => value.convert_to(basic_type)?,
            },
        };
        let mut value = value;
        if count > 0 && count < value.get_count() {
            let _ = value.resize(count);
        }
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Time => Dbr::Time {
                status: self.status,
                timestamp: self.timestamp,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status: self.status,
                enum_strings: self.enum_strings.clone(),
                value,
            },
            DbrCategory::Status | DbrCategory::Graphics => return Err(ErrorCondition::BadType),
        })
    }

    /// Store a value from a put, parsing numbers out of strings
    fn store_from_ca(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        let native_type = self.value.get_type();
        let value = if value.get_type() == DbrBasicType::String {
            value
                .parse_into(native_type, &self.enum_strings)
                .map_err(|_| ErrorCondition::NoConvert)?
        } else {
            value.convert_to(native_type)?
        };
        self.store(value, Status::default());
        Ok(())
    }

    fn store(&mut self, value: DbrValue, status: Status) {
        self.value = value;
        self.status = status;
        self.timestamp = SystemTime::now();
    }
}

struct Channel {
    pv_name: String,
    field: Option<String>,
    state: ChannelState,
    on_connection: ConnectionHandler,
}

struct Monitor {
    channel: ChannelId,
    dbr_type: DbrType,
    count: usize,
    on_value: ValueHandler,
}

#[derive(Default)]
struct LoopbackState {
    pvs: HashMap<String, PV>,
    channels: HashMap<ChannelId, Channel>,
    subscriptions: HashMap<SubscriptionId, Monitor>,
    /// Names whose channel creation fails outright
    rejected: HashMap<String, ErrorCondition>,
    next_id: u64,
}

impl LoopbackState {
    /// Split a channel name into the PV it reads and, for `NAME.FIELD`, the field
    fn resolve(&self, name: &str) -> (String, Option<String>) {
        if self.pvs.contains_key(name) {
            return (name.to_owned(), None);
        }
        if let Some((base, field)) = name.split_once('.')
            && self
                .pvs
                .get(base)
                .is_some_and(|pv| pv.fields.contains_key(field))
        {
            return (base.to_owned(), Some(field.to_owned()));
        }
        (name.to_owned(), None)
    }

    fn is_reachable(&self, channel: &Channel) -> bool {
        self.pvs.get(&channel.pv_name).is_some_and(|pv| {
            pv.online
                && channel
                    .field
                    .as_ref()
                    .is_none_or(|f| pv.fields.contains_key(f))
        })
    }

    /// Build the update for one subscription, if its channel is connected
    fn update_for(&self, subscription: &Monitor) -> Option<Result<Dbr, ErrorCondition>> {
        let channel = self.channels.get(&subscription.channel)?;
        if channel.state != ChannelState::Connected {
            return None;
        }
        let pv = self.pvs.get(&channel.pv_name)?;
        Some(pv.load_as(
            channel.field.as_deref(),
            subscription.dbr_type,
            subscription.count,
        ))
    }
}

/// Typed access to a PV served by a [`LoopbackClient`]
///
/// Handles can be cloned and passed across threads; all of them refer to the same PV.
#[derive(Clone)]
pub struct LoopbackPv {
    client: LoopbackClient,
    name: String,
}

impl LoopbackPv {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load(&self) -> Option<DbrValue> {
        let state = self.client.state.lock().unwrap();
        state.pvs.get(&self.name).map(|pv| pv.value.clone())
    }

    /// Store a new value, converted to the native type of the PV
    pub fn store(&self, value: impl Into<DbrValue>) -> Result<(), ErrorCondition> {
        self.store_with_status(value, Status::default())
    }

    /// Store a new value along with an alarm state
    pub fn store_with_status(
        &self,
        value: impl Into<DbrValue>,
        status: Status,
    ) -> Result<(), ErrorCondition> {
        let value = value.into();
        let mut state = self.client.state.lock().unwrap();
        let pv = state
            .pvs
            .get_mut(&self.name)
            .ok_or(ErrorCondition::UnavailInServ)?;
        let value = value.convert_to(pv.value.get_type())?;
        pv.store(value, status);
        self.client.post_updates(&state, &self.name);
        Ok(())
    }

    pub fn set_enum_strings(&self, labels: &[&str]) {
        self.client.modify(&self.name, |pv| {
            pv.enum_strings = labels.iter().map(|l| l.to_string()).collect();
        });
    }

    pub fn set_field(&self, field: &str, text: &str) {
        self.client.modify(&self.name, |pv| {
            pv.fields.insert(field.to_owned(), text.to_owned());
        });
    }

    pub fn set_put_behaviour(&self, behaviour: PutBehaviour) {
        let mut state = self.client.state.lock().unwrap();
        if let Some(pv) = state.pvs.get_mut(&self.name) {
            pv.put_behaviour = behaviour;
        }
    }

    /// Number of puts that reached this PV
    pub fn put_count(&self) -> u64 {
        let state = self.client.state.lock().unwrap();
        state.pvs.get(&self.name).map(|pv| pv.puts).unwrap_or(0)
    }

    /// Drop every channel to this PV, as if the server went away
    pub fn disconnect(&self) {
        self.client.set_online(&self.name, false);
    }

    /// Bring the PV back; connected subscriptions receive the current value again
    pub fn reconnect(&self) {
        self.client.set_online(&self.name, true);
    }

    /// Report an asynchronous error on every channel to this PV
    pub fn raise_exception(&self, condition: ErrorCondition, context: &str) {
        let state = self.client.state.lock().unwrap();
        for (id, channel) in state.channels.iter() {
            if channel.pv_name == self.name {
                let handler = channel.on_connection.clone();
                let id = *id;
                let context = context.to_owned();
                self.client.dispatch(move || {
                    handler(id, ChannelEvent::Exception(condition, context))
                });
            }
        }
    }
}

#[derive(Debug)]
pub struct PVAlreadyExists;

/// A [`ProtocolClient`] that serves PVs held in the same process
///
/// Callbacks are delivered on a dedicated dispatcher thread, never on the thread
/// that made the request, the same way a CA client library with preemptive
/// callbacks behaves.
#[derive(Clone)]
pub struct LoopbackClient {
    state: Arc<Mutex<LoopbackState>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Default for LoopbackClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackClient {
    pub fn new() -> LoopbackClient {
        let (jobs, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
        thread::spawn(move || {
            while let Some(job) = jobs_rx.blocking_recv() {
                job();
            }
            trace!("Loopback dispatcher finished");
        });
        LoopbackClient {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            jobs,
        }
    }

    pub fn add_pv(
        &self,
        name: &str,
        initial_value: impl Into<DbrValue>,
    ) -> Result<LoopbackPv, PVAlreadyExists> {
        let mut state = self.state.lock().unwrap();
        if state.pvs.contains_key(name) {
            return Err(PVAlreadyExists);
        }
        state
            .pvs
            .insert(name.to_owned(), PV::new(initial_value.into()));
        // Channels that were searching for this name can connect now
        self.connect_waiting(&mut state, name);
        Ok(LoopbackPv {
            client: self.clone(),
            name: name.to_owned(),
        })
    }

    /// Add an enumerated PV with its state labels
    pub fn add_enum_pv(
        &self,
        name: &str,
        index: u16,
        labels: &[&str],
    ) -> Result<LoopbackPv, PVAlreadyExists> {
        let pv = self.add_pv(name, DbrValue::Enum(index))?;
        pv.set_enum_strings(labels);
        Ok(pv)
    }

    pub fn pv(&self, name: &str) -> Option<LoopbackPv> {
        let state = self.state.lock().unwrap();
        state.pvs.contains_key(name).then(|| LoopbackPv {
            client: self.clone(),
            name: name.to_owned(),
        })
    }

    /// Make channel creation for a name fail immediately
    pub fn reject_channel(&self, name: &str, condition: ErrorCondition) {
        let mut state = self.state.lock().unwrap();
        state.rejected.insert(name.to_owned(), condition);
    }

    /// Number of open channels, in any state
    pub fn channel_count(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            warn!("Loopback dispatcher has gone away, dropping callback");
        }
    }

    fn modify(&self, name: &str, change: impl FnOnce(&mut PV)) {
        let mut state = self.state.lock().unwrap();
        if let Some(pv) = state.pvs.get_mut(name) {
            change(pv);
        }
        self.post_updates(&state, name);
    }

    /// Send the current value of a PV to every subscription on it
    fn post_updates(&self, state: &LoopbackState, name: &str) {
        for subscription in state.subscriptions.values() {
            let Some(channel) = state.channels.get(&subscription.channel) else {
                continue;
            };
            if channel.pv_name != name {
                continue;
            }
            if let Some(update) = state.update_for(subscription) {
                let handler = subscription.on_value.clone();
                self.dispatch(move || handler(update));
            }
        }
    }

    fn connect_waiting(&self, state: &mut LoopbackState, name: &str) {
        let mut connected = Vec::new();
        for (id, channel) in state.channels.iter() {
            if channel.pv_name == name
                && channel.state != ChannelState::Connected
                && state.is_reachable(channel)
            {
                connected.push(*id);
            }
        }
        for id in connected {
            if let Some(channel) = state.channels.get_mut(&id) {
                channel.state = ChannelState::Connected;
                let handler = channel.on_connection.clone();
                self.dispatch(move || handler(id, ChannelEvent::Up));
            }
        }
    }

    fn set_online(&self, name: &str, online: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(pv) = state.pvs.get_mut(name) else {
            return;
        };
        pv.online = online;
        if online {
            self.connect_waiting(&mut state, name);
            // Subscriptions survive a reconnect, and get the value again
            self.post_updates(&state, name);
        } else {
            for (id, channel) in state.channels.iter_mut() {
                if channel.pv_name == name && channel.state == ChannelState::Connected {
                    channel.state = ChannelState::Disconnected;
                    let handler = channel.on_connection.clone();
                    let id = *id;
                    self.dispatch(move || handler(id, ChannelEvent::Down));
                }
            }
        }
    }
}

impl ProtocolClient for LoopbackClient {
    fn create_channel(
        &self,
        name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<ChannelId, ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        if let Some(condition) = state.rejected.get(name) {
            return Err(*condition);
        }
        let id = ChannelId(wrapping_inplace_add(&mut state.next_id));
        let (pv_name, field) = state.resolve(name);
        let mut channel = Channel {
            pv_name,
            field,
            state: ChannelState::NeverConnected,
            on_connection,
        };
        if state.is_reachable(&channel) {
            channel.state = ChannelState::Connected;
            let handler = channel.on_connection.clone();
            self.dispatch(move || handler(id, ChannelEvent::Up));
        } else {
            debug!("Loopback: no PV named {name} yet, channel {id:?} waiting");
        }
        state.channels.insert(id, channel);
        Ok(id)
    }

    fn close_channel(&self, channel: ChannelId) {
        let mut state = self.state.lock().unwrap();
        state.channels.remove(&channel);
        state.subscriptions.retain(|_, s| s.channel != channel);
    }

    fn subscribe(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        on_value: ValueHandler,
    ) -> Result<SubscriptionId, ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        if !state.channels.contains_key(&channel) {
            return Err(ErrorCondition::BadChId);
        }
        let id = SubscriptionId(wrapping_inplace_add(&mut state.next_id));
        let subscription = Monitor {
            channel,
            dbr_type,
            count,
            on_value,
        };
        if let Some(update) = state.update_for(&subscription) {
            let handler = subscription.on_value.clone();
            self.dispatch(move || handler(update));
        }
        state.subscriptions.insert(id, subscription);
        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.state.lock().unwrap().subscriptions.remove(&subscription);
    }

    fn write(
        &self,
        channel: ChannelId,
        value: DbrValue,
        on_complete: Option<PutHandler>,
    ) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        let target = state.channels.get(&channel).ok_or(ErrorCondition::BadChId)?;
        if target.state != ChannelState::Connected {
            return Err(ErrorCondition::Disconn);
        }
        let (pv_name, field) = (target.pv_name.clone(), target.field.clone());
        let pv = state
            .pvs
            .get_mut(&pv_name)
            .ok_or(ErrorCondition::Disconn)?;
        pv.puts += 1;
        debug!("Loopback: Processing write to {pv_name}: {value:?}");
        let behaviour = pv.put_behaviour;
        let result = match (behaviour, field) {
            (PutBehaviour::Fail(condition), _) => Err(condition),
            (_, Some(field)) => match value.convert_to(DbrBasicType::String)? {
                DbrValue::String(text) => {
                    pv.fields
                        .insert(field, text.into_iter().next().unwrap_or_default());
                    Ok(())
                }
                _ => Err(ErrorCondition::NoConvert),
            },
            (_, None) => pv.store_from_ca(&value),
        };
        match result {
            Ok(()) => self.post_updates(&state, &pv_name),
            Err(e) if on_complete.is_none() => return Err(e),
            Err(_) => (),
        }
        if let Some(on_complete) = on_complete {
            let status = match result {
                Ok(()) => ErrorCondition::Normal,
                Err(e) => e,
            };
            if behaviour != PutBehaviour::Ignore {
                self.dispatch(move || on_complete(status));
            }
        }
        Ok(())
    }

    fn state(&self, channel: ChannelId) -> ChannelState {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(&channel)
            .map(|c| c.state)
            .unwrap_or(ChannelState::Closed)
    }

    fn element_count(&self, channel: ChannelId) -> usize {
        let state = self.state.lock().unwrap();
        let Some(channel) = state.channels.get(&channel) else {
            return 0;
        };
        if channel.state != ChannelState::Connected {
            return 0;
        }
        match (&channel.field, state.pvs.get(&channel.pv_name)) {
            (_, None) => 0,
            (Some(_), Some(_)) => 1,
            (None, Some(pv)) => pv.value.get_count(),
        }
    }

    fn native_kind(&self, channel: ChannelId) -> Option<DbrBasicType> {
        let state = self.state.lock().unwrap();
        let channel = state.channels.get(&channel)?;
        if channel.state != ChannelState::Connected {
            return None;
        }
        match &channel.field {
            Some(_) => Some(DbrBasicType::String),
            None => state.pvs.get(&channel.pv_name).map(|pv| pv.value.get_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc as std_mpsc, time::Duration};

    use super::*;
    use crate::dbr::DBR_CTRL_ENUM;

    fn recording_connection() -> (ConnectionHandler, std_mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        (
            Arc::new(move |_, event| {
                let _ = tx.lock().unwrap().send(event);
            }),
            rx,
        )
    }

    #[test]
    fn test_connects_late_pv() {
        let client = LoopbackClient::new();
        let (handler, events) = recording_connection();
        let channel = client.create_channel("LATE", handler).unwrap();
        assert_eq!(client.state(channel), ChannelState::NeverConnected);
        client.add_pv("LATE", 1.5f64).unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ChannelEvent::Up
        );
        assert_eq!(client.state(channel), ChannelState::Connected);
        assert_eq!(client.element_count(channel), 1);
        assert_eq!(client.native_kind(channel), Some(DbrBasicType::Double));
    }

    #[test]
    fn test_subscription_sees_stores() {
        let client = LoopbackClient::new();
        let pv = client.add_pv("TEST", 42i16).unwrap();
        let (handler, _events) = recording_connection();
        let channel = client.create_channel("TEST", handler).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        client
            .subscribe(
                channel,
                DbrType::time(DbrBasicType::Int),
                0,
                Arc::new(move |update| {
                    let _ = tx.lock().unwrap().send(update);
                }),
            )
            .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(first.value(), &DbrValue::Int(vec![42]));
        pv.store(413i16).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(second.value(), &DbrValue::Int(vec![413]));
    }

    #[test]
    fn test_enum_labels_and_string_put() {
        let client = LoopbackClient::new();
        let pv = client.add_enum_pv("MODE", 0, &["Off", "On"]).unwrap();
        let (handler, _events) = recording_connection();
        let channel = client.create_channel("MODE", handler).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        client
            .subscribe(
                channel,
                DBR_CTRL_ENUM,
                1,
                Arc::new(move |update| {
                    let _ = tx.lock().unwrap().send(update);
                }),
            )
            .unwrap();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap() {
            Dbr::Control { enum_strings, .. } => assert_eq!(enum_strings, vec!["Off", "On"]),
            other => panic!("Unexpected update {other:?}"),
        }
        client.write(channel, "On".into(), None).unwrap();
        assert_eq!(pv.load(), Some(DbrValue::Enum(1)));
    }

    #[test]
    fn test_rejected_and_failed_puts() {
        let client = LoopbackClient::new();
        client.reject_channel("BAD", ErrorCondition::BadStr);
        let (handler, _events) = recording_connection();
        assert_eq!(
            client.create_channel("BAD", handler.clone()),
            Err(ErrorCondition::BadStr)
        );

        let pv = client.add_pv("TEST", 1i32).unwrap();
        pv.set_put_behaviour(PutBehaviour::Fail(ErrorCondition::PutFail));
        let channel = client.create_channel("TEST", handler).unwrap();
        let (tx, rx) = std_mpsc::channel();
        client
            .write(
                channel,
                5i32.into(),
                Some(Box::new(move |status| {
                    let _ = tx.send(status);
                })),
            )
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            ErrorCondition::PutFail
        );
        assert_eq!(pv.load(), Some(DbrValue::Long(vec![1])));
        assert_eq!(pv.put_count(), 1);
    }
}
