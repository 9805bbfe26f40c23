//! Represent CA DBR values, as delivered by and handed to the protocol client.
//!
//! CA defines seven basic array types, which define the data, and several categories
//! of attached metadata. The cache only ever asks for three of the categories: the
//! time-stamped value of a PV, the plain string value of a record field, and the
//! control information of an enumerated PV (its state labels).
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. The options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`]), called `SHORT` by most CA tools
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into the labels delivered by
//!   [`Dbr::Control`]
//! - [`DbrValue::String`] ([`Vec<String>`]), natively a `[u8; 40]` per element
//!
//! Alarm state travels as [`Status`], whose codes index the EPICS alarm status and
//! severity tables ([`ALARM_STATUS_STRINGS`], [`ALARM_SEVERITY_STRINGS`]).

use num::{NumCast, cast::AsPrimitive};
use std::{
    fmt::Debug,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    condition::ErrorCondition,
    utils::{format_general, parse_leading_f64, parse_leading_i64},
};

/// Seconds between the Unix epoch and the EPICS epoch (1990-01-01)
pub const EPICS_EPOCH_OFFSET: u64 = 631152000;

pub const ALARM_STATUS_STRINGS: [&str; 22] = [
    "NO_ALARM",
    "READ",
    "WRITE",
    "HIHI",
    "HIGH",
    "LOLO",
    "LOW",
    "STATE",
    "COS",
    "COMM",
    "TIMEOUT",
    "HWLIMIT",
    "CALC",
    "SCAN",
    "LINK",
    "SOFT",
    "BAD_SUB",
    "UDF",
    "DISABLE",
    "SIMM",
    "READ_ACCESS",
    "WRITE_ACCESS",
];

pub const ALARM_SEVERITY_STRINGS: [&str; 4] = ["NO_ALARM", "MINOR", "MAJOR", "INVALID"];

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug, PartialEq)]
pub enum DbrParseError {
    SelfIsNotString,
    CannotParse(String),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    /// Enum targets accept either one of `labels` or a bare index.
    pub fn parse_into(
        &self,
        basic_type: DbrBasicType,
        labels: &[String],
    ) -> Result<DbrValue, DbrParseError> {
        fn _parse_vec<T: FromStr>(from: &[String]) -> Result<Vec<T>, DbrParseError> {
            from.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => {
                let [s] = val.as_slice() else {
                    return Err(DbrParseError::CannotParse(val.join(" ")));
                };
                match labels.iter().position(|l| l == s) {
                    Some(index) => DbrValue::Enum(index as u16),
                    None => DbrValue::Enum(
                        s.trim()
                            .parse()
                            .map_err(|_| DbrParseError::CannotParse(s.clone()))?,
                    ),
                }
            }
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_vec(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_vec(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_vec(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_vec(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_vec(val)?),
        })
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        /// A single numeric value used as an enum index
        fn _to_enum<T: Copy + NumCast>(from: &[T]) -> Result<DbrValue, ErrorCondition> {
            match from {
                [val] => Ok(DbrValue::Enum(
                    NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?,
                )),
                _ => Err(ErrorCondition::NoConvert),
            }
        }
        fn _display<T: ToString>(from: &[T]) -> DbrValue {
            DbrValue::String(from.iter().map(|v| v.to_string()).collect())
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(vec![(*val).into()]),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(vec![(*val).into()]),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(vec![(*val).into()]),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(val.iter().map(|c| *c as u8).collect())
                        .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                DbrValue::Int(val) => _display(val),
                DbrValue::Long(val) => _display(val),
                DbrValue::Float(val) => DbrValue::String(
                    val.iter().map(|v| format_general((*v).into())).collect(),
                ),
                DbrValue::Double(val) => {
                    DbrValue::String(val.iter().map(|v| format_general(*v)).collect())
                }
                DbrValue::Enum(val) => DbrValue::String(vec![val.to_string()]),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => _to_enum(val)?,
                DbrValue::Int(val) => _to_enum(val)?,
                DbrValue::Long(val) => _to_enum(val)?,
                DbrValue::Float(val) => _to_enum(val)?,
                DbrValue::Double(val) => _to_enum(val)?,
                DbrValue::String(_) => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Re-encode string elements the way a C client would before sending them
    /// as text to a channel of the given native type.
    ///
    /// The first `,` is taken as a decimal separator. Numeric targets are
    /// rendered from the leading number of the text, wrapping integers to the
    /// native width; string and enum targets pass the text through.
    pub fn reencode_strings(values: &[String], native: DbrBasicType) -> DbrValue {
        let encoded = values
            .iter()
            .map(|raw| {
                let text = raw.replacen(',', ".", 1);
                match native {
                    DbrBasicType::String | DbrBasicType::Enum => text,
                    DbrBasicType::Float => format!("{:.6}", parse_leading_f64(&text) as f32),
                    DbrBasicType::Double => format!("{:.6}", parse_leading_f64(&text)),
                    DbrBasicType::Char => (parse_leading_i64(&text) as i8).to_string(),
                    DbrBasicType::Int => (parse_leading_i64(&text) as i16).to_string(),
                    DbrBasicType::Long => (parse_leading_i64(&text) as i32).to_string(),
                }
            })
            .collect();
        DbrValue::String(encoded)
    }

    /// Shorten or extend the value to a number of elements
    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }
}

/// `From` a single element or a vector of them, for each numeric array kind
macro_rules! impl_from_elements {
    ($($variant:ident: $typ:ty),*) => {
        $(
            impl From<Vec<$typ>> for DbrValue {
                fn from(value: Vec<$typ>) -> Self {
                    DbrValue::$variant(value)
                }
            }
            impl From<$typ> for DbrValue {
                fn from(value: $typ) -> Self {
                    DbrValue::$variant(vec![value])
                }
            }
        )*
    };
}
impl_from_elements!(Char: i8, Int: i16, Long: i32, Float: f32, Double: f64);

impl From<Vec<String>> for DbrValue {
    fn from(value: Vec<String>) -> Self {
        DbrValue::String(value)
    }
}

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

/// A combination of basic type and category, named `DBR_*_*` in CA
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_BASIC_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Basic,
};

pub const DBR_CTRL_ENUM: DbrType = DbrType {
    basic_type: DbrBasicType::Enum,
    category: DbrCategory::Control,
};

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
    /// The time-stamped variant of a native type, as used for value subscriptions
    pub fn time(basic_type: DbrBasicType) -> Self {
        Self::new(basic_type, DbrCategory::Time)
    }
}

impl std::fmt::Display for DbrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
        };
        let kind = match self.basic_type {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "SHORT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        };
        write!(f, "DBR_{category}{kind}")
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

impl Status {
    pub fn new(status: i16, severity: i16) -> Self {
        Status { status, severity }
    }
    /// Alarm status as its EPICS name, or the bare number if outside the table
    pub fn status_text(&self) -> String {
        usize::try_from(self.status)
            .ok()
            .and_then(|i| ALARM_STATUS_STRINGS.get(i))
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.status.to_string())
    }
    pub fn severity_text(&self) -> String {
        usize::try_from(self.severity)
            .ok()
            .and_then(|i| ALARM_SEVERITY_STRINGS.get(i))
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.severity.to_string())
    }
}

/// Seconds since the EPICS epoch, saturating at zero for earlier times
pub fn epics_seconds(timestamp: SystemTime) -> u32 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().saturating_sub(EPICS_EPOCH_OFFSET))
        .unwrap_or(0)
        .try_into()
        .unwrap_or(u32::MAX)
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    /// Control information. The cache only requests this for enumerated PVs,
    /// where it carries the state labels.
    Control {
        status: Status,
        enum_strings: Vec<String>,
        value: DbrValue,
    },
}

impl Dbr {
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Time { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType::new(self.value().get_type(), category)
    }
}
