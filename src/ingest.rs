//! Handlers for connection and value callbacks from the protocol client.
//!
//! These run on the client's own threads, concurrently with readers and writers.
//! They hold only a weak reference to the cache and the `(index, generation)` of the
//! record they were created for, so a callback that outlives its record, or the whole
//! cache, does nothing.

use std::{
    sync::{Arc, Weak},
    time::SystemTime,
};

use tracing::{debug, trace, warn};

use crate::{
    cache::Shared,
    condition::ErrorCondition,
    dbr::{DBR_BASIC_STRING, DBR_CTRL_ENUM, Dbr, DbrBasicType, DbrType, DbrValue, Status},
    protocol::{ChannelEvent, ChannelId, ConnectionHandler, ValueHandler},
    registry::{
        PvIndex, PvRecord, PvState, SubscriptionRole, SubscriptionSlot, try_vec,
    },
    utils::{format_general, parse_leading_f64},
};

/// Why a value sample could not be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecodeFault {
    AllocMem,
    /// An enum index with no matching label
    EnumIndex { index: u16, labels: usize },
}

/// Numeric and display form of every element of a sample
pub(crate) fn decode(
    value: &DbrValue,
    labels: &[String],
) -> Result<(Vec<f64>, Vec<String>), DecodeFault> {
    fn render<T: Copy>(
        items: &[T],
        numeric: impl Fn(T) -> f64,
        display: impl Fn(T) -> String,
    ) -> Result<(Vec<f64>, Vec<String>), DecodeFault> {
        let mut values = try_vec(items.len()).map_err(|_| DecodeFault::AllocMem)?;
        let mut strings = try_vec(items.len()).map_err(|_| DecodeFault::AllocMem)?;
        for item in items {
            values.push(numeric(*item));
            strings.push(display(*item));
        }
        Ok((values, strings))
    }

    match value {
        DbrValue::String(items) => {
            let mut values = try_vec(items.len()).map_err(|_| DecodeFault::AllocMem)?;
            let mut strings = try_vec(items.len()).map_err(|_| DecodeFault::AllocMem)?;
            for item in items {
                values.push(parse_leading_f64(item));
                strings.push(item.clone());
            }
            Ok((values, strings))
        }
        DbrValue::Char(items) => render(items, f64::from, |c| char::from(c as u8).to_string()),
        DbrValue::Int(items) => render(items, f64::from, |v| v.to_string()),
        DbrValue::Long(items) => render(items, f64::from, |v| v.to_string()),
        DbrValue::Float(items) => render(items, f64::from, |v| format_general(f64::from(v))),
        DbrValue::Double(items) => render(items, |v| v, format_general),
        DbrValue::Enum(index) => {
            let text = enum_text(*index, labels)?;
            Ok((vec![f64::from(*index)], vec![text]))
        }
    }
}

/// Label of an enum index. Without any labels the number itself is shown.
fn enum_text(index: u16, labels: &[String]) -> Result<String, DecodeFault> {
    if labels.is_empty() {
        return Ok(index.to_string());
    }
    labels
        .get(usize::from(index))
        .cloned()
        .ok_or(DecodeFault::EnumIndex {
            index,
            labels: labels.len(),
        })
}

/// Build the connection handler for a registry record
pub(crate) fn connection_handler(
    shared: Weak<Shared>,
    index: PvIndex,
    generation: u64,
) -> ConnectionHandler {
    Arc::new(move |channel, event| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.cancel.is_cancelled() {
            return;
        }
        match event {
            ChannelEvent::Up => connection_up(&shared, index, generation, channel),
            ChannelEvent::Down => connection_down(&shared, index, generation),
            ChannelEvent::Exception(condition, context) => {
                exception(&shared, index, generation, condition, &context)
            }
        }
    })
}

fn value_handler(shared: Weak<Shared>, index: PvIndex, generation: u64) -> ValueHandler {
    Arc::new(move |update| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.cancel.is_cancelled() {
            return;
        }
        ingest_value(&shared, index, generation, update);
    })
}

fn connection_up(shared: &Arc<Shared>, index: PvIndex, generation: u64, channel: ChannelId) {
    // Synchronous queries on the client, made before taking the registry lock
    let count = shared.client.element_count(channel);
    let kind = shared.client.native_kind(channel);

    let mut requests: Vec<(SubscriptionRole, DbrType)> = Vec::new();
    {
        let mut inner = shared.registry.lock();
        let Some(record) = inner.get_mut(index, generation) else {
            trace!("Connection for stale record {index} ignored");
            return;
        };
        let Some(kind) = kind else {
            debug!("{} went away again before it could be queried", record.name);
            return;
        };
        record.channel = Some(channel);
        if let Err(condition) = record.resize_values(count) {
            warn!("Could not allocate {count} elements for {}", record.name);
            record.set_error(condition, condition.to_string());
            record.publish();
            return;
        }
        record.state = PvState::Connected;
        debug!("{} connected: {count} x {kind:?}", record.name);

        let value_type = if record.is_field {
            DBR_BASIC_STRING
        } else {
            DbrType::time(kind)
        };
        let value_slot = &mut record.subscriptions[SubscriptionRole::Value as usize];
        if *value_slot == SubscriptionSlot::Empty {
            *value_slot = SubscriptionSlot::Requested;
            requests.push((SubscriptionRole::Value, value_type));
        }
        if kind == DbrBasicType::Enum && !record.is_field && record.enum_labels.is_empty() {
            let label_slot = &mut record.subscriptions[SubscriptionRole::EnumLabels as usize];
            if *label_slot == SubscriptionSlot::Empty {
                *label_slot = SubscriptionSlot::Requested;
                requests.push((SubscriptionRole::EnumLabels, DBR_CTRL_ENUM));
            }
        }
        record.publish();
    }

    for (role, dbr_type) in requests {
        let handler = value_handler(Arc::downgrade(shared), index, generation);
        let result = shared.client.subscribe(channel, dbr_type, 0, handler);
        let mut inner = shared.registry.lock();
        let unused = match (result, inner.get_mut(index, generation)) {
            (Ok(id), Some(record)) => {
                let slot = &mut record.subscriptions[role as usize];
                // Labels may have arrived before the subscribe call returned
                let finished =
                    role == SubscriptionRole::EnumLabels && !record.enum_labels.is_empty();
                if *slot == SubscriptionSlot::Requested && !finished {
                    *slot = SubscriptionSlot::Active(id);
                    trace!("Subscribed to {} as {dbr_type}", record.name);
                    None
                } else {
                    *slot = SubscriptionSlot::Empty;
                    Some(id)
                }
            }
            (Ok(id), None) => Some(id),
            (Err(condition), Some(record)) => {
                warn!("Could not subscribe to {} as {dbr_type}: {condition}", record.name);
                record.subscriptions[role as usize] = SubscriptionSlot::Empty;
                record.set_error(condition, shared.client.error_message(condition));
                record.publish();
                None
            }
            (Err(_), None) => None,
        };
        drop(inner);
        if let Some(id) = unused {
            shared.client.unsubscribe(id);
        }
    }
    shared.client.flush();
}

fn connection_down(shared: &Shared, index: PvIndex, generation: u64) {
    let mut inner = shared.registry.lock();
    let Some(record) = inner.get_mut(index, generation) else {
        return;
    };
    debug!("{} disconnected", record.name);
    record.state = PvState::Disconnected;
    record.set_disconnected();
    record.publish();
    drop(inner);
    shared.registry.notify_updated();
}

fn exception(
    shared: &Shared,
    index: PvIndex,
    generation: u64,
    condition: ErrorCondition,
    context: &str,
) {
    let mut message = shared.client.error_message(condition);
    if !context.is_empty() {
        message = format!("{message} ({context})");
    }
    let mut inner = shared.registry.lock();
    if let Some(record) = inner.get_mut(index, generation) {
        warn!("Exception on {}: {message}", record.name);
        record.set_error(condition, message);
        record.publish();
    }
}

fn ingest_value(
    shared: &Shared,
    index: PvIndex,
    generation: u64,
    update: Result<Dbr, ErrorCondition>,
) {
    let failure = update
        .as_ref()
        .err()
        .map(|condition| (*condition, shared.client.error_message(*condition)));
    let mut unsubscribe = None;
    let mut inner = shared.registry.lock();
    let Some(record) = inner.get_mut(index, generation) else {
        return;
    };

    let field_update = match (update, failure) {
        (_, Some((condition, message))) => {
            record.set_error(condition, message);
            None
        }
        (Ok(Dbr::Time {
            status,
            timestamp,
            value,
        }), None) => {
            store_sample(record, status, timestamp, &value);
            None
        }
        (Ok(Dbr::Control { enum_strings, .. }), None) => {
            store_labels(record, enum_strings);
            if let SubscriptionSlot::Active(id) =
                record.subscriptions[SubscriptionRole::EnumLabels as usize]
            {
                record.subscriptions[SubscriptionRole::EnumLabels as usize] =
                    SubscriptionSlot::Empty;
                unsubscribe = Some(id);
            }
            None
        }
        (Ok(Dbr::Basic(DbrValue::String(text))), None) if record.is_field => {
            let text = text.into_iter().next().unwrap_or_default();
            store_field_value(record, &text);
            Some((record.name.clone(), text))
        }
        (Ok(other), None) => {
            warn!("Unexpected {} update for {}", other.data_type(), record.name);
            record.set_error(ErrorCondition::BadType, ErrorCondition::BadType.to_string());
            None
        }
        (Err(_), None) => None,
    };
    record.publish();

    // The attribute slot of the base record, named by the part after the first '.'
    if let Some((name, text)) = field_update
        && let Some((base, field)) = name.split_once('.')
        && let Some(base_index) = inner.index_of(base)
        && let Some(base_record) = inner.record_mut(base_index)
        && let Some(slot) = base_record.field_names.iter().position(|f| f == field)
    {
        base_record.field_values[slot] = text;
        base_record.publish();
    }
    drop(inner);
    shared.registry.notify_updated();
    if let Some(id) = unsubscribe {
        shared.client.unsubscribe(id);
    }
}

fn store_sample(record: &mut PvRecord, status: Status, timestamp: SystemTime, value: &DbrValue) {
    match decode(value, &record.enum_labels) {
        Ok((values, strings)) => {
            record.store_sample(values, strings);
            record.timestamp = Some(timestamp);
            record.set_alarm(status);
            record.set_error(ErrorCondition::Normal, ErrorCondition::Normal.to_string());
            record.has_value = true;
        }
        Err(DecodeFault::AllocMem) => {
            warn!(
                "Could not allocate {} elements for {}",
                value.get_count(),
                record.name
            );
            record.set_error(ErrorCondition::AllocMem, ErrorCondition::AllocMem.to_string());
        }
        Err(DecodeFault::EnumIndex { index, labels }) => {
            warn!(
                "{} has enum value {index} with only {labels} labels, sample skipped",
                record.name
            );
        }
    }
}

fn store_labels(record: &mut PvRecord, labels: Vec<String>) {
    trace!("{} has enum labels {labels:?}", record.name);
    if record.has_value {
        let mut strings = Vec::with_capacity(record.values.len());
        for value in &record.values {
            match enum_text(*value as u16, &labels) {
                Ok(text) => strings.push(text),
                Err(_) => {
                    warn!("{} has enum value {value} beyond its labels", record.name);
                    record.enum_labels = labels;
                    return;
                }
            }
        }
        record.strings = strings;
    }
    record.enum_labels = labels;
}

fn store_field_value(record: &mut PvRecord, text: &str) {
    record.store_sample(vec![parse_leading_f64(text)], vec![text.to_owned()]);
    record.set_alarm(Status::default());
    record.set_error(ErrorCondition::Normal, ErrorCondition::Normal.to_string());
    record.has_value = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decode_numbers() {
        let (values, strings) = decode(&DbrValue::Double(vec![2.5, 1e7]), &[]).unwrap();
        assert_eq!(values, vec![2.5, 1e7]);
        assert_eq!(strings, vec!["2.5", "1e+07"]);

        let (values, strings) = decode(&DbrValue::Long(vec![-3, 42]), &[]).unwrap();
        assert_eq!(values, vec![-3.0, 42.0]);
        assert_eq!(strings, vec!["-3", "42"]);

        let (values, strings) = decode(&DbrValue::Char(vec![72, 105]), &[]).unwrap();
        assert_eq!(values, vec![72.0, 105.0]);
        assert_eq!(strings, vec!["H", "i"]);
    }

    #[test]
    fn test_decode_strings() {
        let value = DbrValue::String(vec!["12.5 mm".into(), "off".into()]);
        let (values, strings) = decode(&value, &[]).unwrap();
        assert_eq!(values, vec![12.5, 0.0]);
        assert_eq!(strings, vec!["12.5 mm", "off"]);
    }

    #[test]
    fn test_decode_enums() {
        let states = labels(&["Off", "On"]);
        let (values, strings) = decode(&DbrValue::Enum(1), &states).unwrap();
        assert_eq!(values, vec![1.0]);
        assert_eq!(strings, vec!["On"]);

        assert_eq!(
            decode(&DbrValue::Enum(2), &states),
            Err(DecodeFault::EnumIndex {
                index: 2,
                labels: 2
            })
        );
        // Before the labels are known the index is shown as is
        let (_, strings) = decode(&DbrValue::Enum(5), &[]).unwrap();
        assert_eq!(strings, vec!["5"]);
    }
}
