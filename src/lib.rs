//! Read-through, write-through cache of EPICS process variables.
//!
//! A [`PvCache`] sits between application code and a Channel Access client library.
//! Callers resolve PV names to stable handles, read point-in-time snapshots with a
//! bounded wait, and write values to one or many PVs, optionally waiting for the
//! server to confirm each put. The cache fills itself in the background: a connect
//! worker creates a channel for each newly seen name, and updates pushed by the
//! client library overwrite the cached sample of their PV as they arrive.
//!
//! The crate is split into:
//!
//! - Data representation of values exchanged with the client library (["DBR" types])
//!   in module [dbr], and the protocol's error conditions in [condition].
//! - [`protocol::ProtocolClient`], the trait the cache uses to talk to a CA client
//!   library, with an in-memory [`protocol::LoopbackClient`] that serves PVs from
//!   the same process.
//! - [`PvCache`] itself, built through [`PvCacheBuilder`], returning [`PvSnapshot`]s
//!   from reads and per-PV [`ErrorReport`]s from writes.
//!
//! Two operating modes are supported. In event mode (the default) channels and
//! subscriptions persist between calls, and repeated reads are cheap lookups. In
//! polling mode every read and write connects, samples or writes, and then drops all
//! of its channels again; reads and writes are serialised against each other.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use pvcache::{PvCache, protocol::LoopbackClient};
//!
//! let client = LoopbackClient::new();
//! client.add_pv("NUMERIC_VALUE", 42i32).unwrap();
//! let cache = PvCache::builder().polling(false).start(client).unwrap();
//!
//! let result = cache.read(&["NUMERIC_VALUE"], Duration::from_secs(2)).unwrap();
//! let snapshot = &result.snapshots[0];
//! assert_eq!(snapshot.values, vec![42.0]);
//! assert_eq!(snapshot.strings, vec!["42"]);
//! assert_eq!(snapshot.severity_text, "NO_ALARM");
//! ```
//!
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod condition;
pub mod dbr;
pub mod protocol;
pub mod snapshot;

mod cache;
mod ingest;
mod read;
mod registry;
mod subscription;
mod utils;
mod worker;
mod write;

pub use crate::cache::{PvCache, PvCacheBuilder};
pub use crate::condition::{CacheError, ErrorCondition, ErrorReport};
pub use crate::registry::PvIndex;
pub use crate::snapshot::{CacheInfo, PvSnapshot, ReadResult, WriteResult};
pub use crate::subscription::{SubscriberRecvError, SubscriberTryRecvError, Subscription};
pub use crate::utils::{EPICS_CA_ENVIRONMENT, format_general};
pub use crate::write::{BlockData, ValueBlock, WriteKind, WriteOptions};
