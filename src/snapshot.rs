//! Point-in-time copies of cached PV state, as handed to callers.

use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::{condition::ErrorReport, dbr::epics_seconds};

/// Status text of a PV that is not connected, or has never been
pub const DISCONNECTED_STATUS: (&str, i16) = ("INVALID", 3);
/// Severity text of a PV that is not connected, or has never been
pub const DISCONNECTED_SEVERITY: (&str, i16) = ("DISCONNECTED", 9);
/// Timestamp text before a first sample
pub const UNKNOWN_TIMESTAMP: &str = "unknown";

/// Render a timestamp the way the cache reports it, in local time
pub fn format_timestamp(timestamp: SystemTime) -> String {
    DateTime::<Local>::from(timestamp)
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Everything cached about one PV, copied out under the registry lock
#[derive(Clone, Debug, PartialEq)]
pub struct PvSnapshot {
    pub name: String,
    /// Stable registry handle of the PV
    pub index: usize,
    pub element_count: usize,
    pub values: Vec<f64>,
    pub strings: Vec<String>,
    pub status: i16,
    pub status_text: String,
    pub severity: i16,
    pub severity_text: String,
    pub timestamp: Option<SystemTime>,
    pub timestamp_text: String,
    /// Seconds since the EPICS epoch, 0 before a first sample
    pub timestamp_epoch: u32,
    pub field_names: Vec<String>,
    pub field_values: Vec<String>,
    pub error: ErrorReport,
    pub has_value: bool,
}

impl PvSnapshot {
    pub fn is_connected(&self) -> bool {
        self.severity != DISCONNECTED_SEVERITY.1
    }

    /// Value of a named field, if this PV was read with it
    pub fn field(&self, name: &str) -> Option<&str> {
        self.field_names
            .iter()
            .position(|f| f == name)
            .and_then(|i| self.field_values.get(i))
            .map(String::as_str)
    }

    pub(crate) fn timestamp_parts(timestamp: Option<SystemTime>) -> (String, u32) {
        match timestamp {
            Some(t) => (format_timestamp(t), epics_seconds(t)),
            None => (UNKNOWN_TIMESTAMP.to_string(), 0),
        }
    }
}

/// Result of a read: one snapshot per requested name, in request order
///
/// Requested fields appear in the `field_values` of each snapshot.
#[derive(Clone, Debug, Default)]
pub struct ReadResult {
    pub snapshots: Vec<PvSnapshot>,
    /// Largest element count of any snapshot, to size a uniform 2-D output
    pub max_element_count: usize,
}

impl ReadResult {
    /// True if every PV read without error
    pub fn ok(&self) -> bool {
        self.snapshots.iter().all(|s| s.error.is_ok())
    }

    pub fn get(&self, name: &str) -> Option<&PvSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    /// First numeric and display value of every PV
    pub fn first_values(&self) -> Vec<(f64, String)> {
        self.snapshots
            .iter()
            .map(|s| {
                (
                    s.values.first().copied().unwrap_or(0.0),
                    s.strings.first().cloned().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Numeric values as rows of `max_element_count`, padded with zeros
    pub fn value_matrix(&self) -> Vec<Vec<f64>> {
        self.snapshots
            .iter()
            .map(|s| {
                let mut row = s.values.clone();
                row.resize(self.max_element_count, 0.0);
                row
            })
            .collect()
    }

    /// Display strings as rows of `max_element_count`, padded with empty strings
    pub fn string_matrix(&self) -> Vec<Vec<String>> {
        self.snapshots
            .iter()
            .map(|s| {
                let mut row = s.strings.clone();
                row.resize(self.max_element_count, String::new());
                row
            })
            .collect()
    }
}

/// Result of a write batch: one report per requested name, in request order
#[derive(Clone, Debug, Default)]
pub struct WriteResult {
    pub names: Vec<String>,
    pub errors: Vec<ErrorReport>,
}

impl WriteResult {
    pub fn ok(&self) -> bool {
        self.errors.iter().all(ErrorReport::is_ok)
    }

    pub fn error_for(&self, name: &str) -> Option<&ErrorReport> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.errors.get(i))
    }
}

/// Settings and contents of a cache, for diagnostics
#[derive(Clone, Debug)]
pub struct CacheInfo {
    pub polling: bool,
    /// Effective settings and CA environment variables, as name/value pairs
    pub settings: Vec<(String, String)>,
    pub pvs: Vec<PvSnapshot>,
    pub write_channels: usize,
}
