use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    condition::CacheError,
    protocol::ProtocolClient,
    registry::{PvIndex, Registry},
    snapshot::{CacheInfo, ReadResult, WriteResult},
    subscription::Subscription,
    utils::{
        clean_pv_name, get_default_connect_idle, get_default_polling_mode, get_default_timeout,
        read_ca_environment,
    },
    worker,
    write::{ValueBlock, WriteChannels, WriteKind, WriteOptions},
};

/// Effective settings of a running cache
#[derive(Clone, Debug)]
pub(crate) struct CacheConfig {
    pub polling: bool,
    pub default_timeout: Duration,
    pub connect_idle: Duration,
    pub notify_capacity: usize,
}

/// State shared between the cache handle, its worker, and protocol callbacks
pub(crate) struct Shared {
    pub client: Arc<dyn ProtocolClient>,
    pub config: CacheConfig,
    pub registry: Registry,
    pub write_channels: WriteChannels,
    /// At most one read in flight
    pub read_lock: Mutex<()>,
    /// At most one write batch in flight
    pub write_lock: Mutex<()>,
    /// Serialises reads against writes, in polling mode only
    pub polling_lock: Mutex<()>,
    pub cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub fn check_running(&self) -> Result<(), CacheError> {
        if self.cancel.is_cancelled() {
            Err(CacheError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// A zero timeout means "use the default"
    pub fn effective_timeout(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.config.default_timeout
        } else {
            timeout
        }
    }

    fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!("Shutting down PV cache");
        self.cancel.cancel();
        self.registry.queue().wake();
        if let Some(worker) = self.worker.lock().unwrap().take()
            && worker.join().is_err()
        {
            error!("Connect worker panicked");
        }
        self.registry.tear_down().release(self.client.as_ref());
        self.write_channels.close_all(self.client.as_ref());
        info!("PV cache shut down");
    }
}

pub struct PvCacheBuilder {
    polling: bool,
    default_timeout: Duration,
    connect_idle: Duration,
    notify_capacity: usize,
}

impl Default for PvCacheBuilder {
    fn default() -> Self {
        PvCacheBuilder {
            polling: get_default_polling_mode(),
            default_timeout: Duration::from_secs_f32(get_default_timeout()),
            connect_idle: Duration::from_secs_f32(get_default_connect_idle()),
            notify_capacity: 64,
        }
    }
}

impl PvCacheBuilder {
    pub fn new() -> Self {
        PvCacheBuilder::default()
    }
    /// Tear down every channel after each read and write
    pub fn polling(mut self, polling: bool) -> Self {
        self.polling = polling;
        self
    }
    /// Timeout used by calls that pass a zero timeout
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
    /// How long the connect worker sleeps when there is nothing to connect
    pub fn connect_idle(mut self, idle: Duration) -> Self {
        self.connect_idle = idle;
        self
    }
    /// Updates buffered per push subscription before a slow receiver lags
    pub fn notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity.max(1);
        self
    }

    /// Start the cache on top of a protocol client
    pub fn start(self, client: impl ProtocolClient) -> Result<PvCache, CacheError> {
        let config = CacheConfig {
            polling: self.polling,
            default_timeout: self.default_timeout,
            connect_idle: self.connect_idle,
            notify_capacity: self.notify_capacity,
        };
        debug!("Starting PV cache with {config:?}");
        let shared = Arc::new(Shared {
            client: Arc::new(client),
            config,
            registry: Registry::new(),
            write_channels: WriteChannels::default(),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            polling_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        });
        let handle =
            worker::spawn(&shared).map_err(|e| CacheError::WorkerSpawn(e.to_string()))?;
        *shared.worker.lock().unwrap() = Some(handle);
        Ok(PvCache { shared })
    }
}

/// A read-through, write-through cache of process variables
///
/// Reads register unknown names and wait a bounded time for their first value;
/// known names answer straight from the cache, kept current by subscriptions. Writes
/// go through their own set of channels, so a PV can be written without being read.
///
/// Dropping the cache shuts it down.
pub struct PvCache {
    shared: Arc<Shared>,
}

impl PvCache {
    pub fn builder() -> PvCacheBuilder {
        PvCacheBuilder::new()
    }

    /// Start a cache with settings taken from the environment
    pub fn start(client: impl ProtocolClient) -> Result<PvCache, CacheError> {
        PvCacheBuilder::new().start(client)
    }

    pub fn is_polling(&self) -> bool {
        self.shared.config.polling
    }

    /// Resolve a name to its stable index, registering it if unknown
    ///
    /// Never waits for the network. An existing PV whose channel could not be
    /// created, or that was removed, is queued for connection again.
    pub fn register(&self, name: &str) -> Result<PvIndex, CacheError> {
        self.shared.check_running()?;
        let name = clean_pv_name(name);
        if name.is_empty() {
            return Err(CacheError::InvalidInput("empty PV name"));
        }
        Ok(self.shared.registry.register(&name, &[], false)?.index)
    }

    /// Read PVs, waiting up to `timeout` for any seen for the first time
    pub fn read<S: AsRef<str>>(
        &self,
        names: &[S],
        timeout: Duration,
    ) -> Result<ReadResult, CacheError> {
        self.shared.read(names, &[] as &[&str], timeout)
    }

    /// Read PVs along with record fields, each read as its own `NAME.FIELD` PV
    pub fn read_with_fields<S: AsRef<str>, F: AsRef<str>>(
        &self,
        names: &[S],
        fields: &[F],
        timeout: Duration,
    ) -> Result<ReadResult, CacheError> {
        self.shared.read(names, fields, timeout)
    }

    /// Write a block of values, one set of values per name
    pub fn write<S: AsRef<str>>(
        &self,
        names: &[S],
        values: &ValueBlock,
        kind: WriteKind,
        options: &WriteOptions,
    ) -> Result<WriteResult, CacheError> {
        self.shared.write(names, values, kind, options)
    }

    /// [`PvCache::read_with_fields`] on tokio's blocking pool
    pub async fn read_async(
        &self,
        names: Vec<String>,
        fields: Vec<String>,
        timeout: Duration,
    ) -> Result<ReadResult, CacheError> {
        let shared = self.shared.clone();
        join_blocking(tokio::task::spawn_blocking(move || {
            shared.read(names.as_slice(), fields.as_slice(), timeout)
        }))
        .await
    }

    /// [`PvCache::write`] on tokio's blocking pool
    pub async fn write_async(
        &self,
        names: Vec<String>,
        values: ValueBlock,
        kind: WriteKind,
        options: WriteOptions,
    ) -> Result<WriteResult, CacheError> {
        let shared = self.shared.clone();
        join_blocking(tokio::task::spawn_blocking(move || {
            shared.write(names.as_slice(), &values, kind, &options)
        }))
        .await
    }

    /// Receive a snapshot of a PV every time it changes
    ///
    /// The current snapshot is delivered first. Only available in event mode: in
    /// polling mode every read drops all records, and their subscriptions with them.
    pub fn subscribe(&self, name: &str) -> Result<Subscription, CacheError> {
        if self.shared.config.polling {
            return Err(CacheError::InvalidInput(
                "push subscriptions are not available in polling mode",
            ));
        }
        let index = self.register(name)?;
        let (receiver, current) = self
            .shared
            .registry
            .watch(index, self.shared.config.notify_capacity)
            .ok_or(CacheError::ShuttingDown)?;
        Ok(Subscription::new(current, receiver))
    }

    /// Drop the connections of PVs, and of their `NAME.FIELD` records
    ///
    /// The records stay registered, reset to their unconnected state. Returns the
    /// number of records reset.
    pub fn remove_pvs<S: AsRef<str>>(&self, names: &[S]) -> Result<usize, CacheError> {
        self.shared.check_running()?;
        let names: Vec<String> = names.iter().map(|n| clean_pv_name(n.as_ref())).collect();
        let (removed, teardown) = self.shared.registry.remove(&names);
        teardown.release(self.shared.client.as_ref());
        debug!("Removed {removed} PV records");
        Ok(removed)
    }

    /// Settings, CA environment, and a snapshot of every registered PV
    pub fn info(&self) -> Result<CacheInfo, CacheError> {
        self.shared.check_running()?;
        let config = &self.shared.config;
        let mut settings = vec![
            ("polling".to_string(), config.polling.to_string()),
            (
                "default_timeout".to_string(),
                format!("{:.3}", config.default_timeout.as_secs_f64()),
            ),
            (
                "connect_idle".to_string(),
                format!("{:.3}", config.connect_idle.as_secs_f64()),
            ),
        ];
        settings.extend(read_ca_environment());
        Ok(CacheInfo {
            polling: config.polling,
            settings,
            pvs: self.shared.registry.all_snapshots(),
            write_channels: self.shared.write_channels.len(),
        })
    }

    /// Stop the connect worker and close every channel
    ///
    /// All later calls fail with [`CacheError::ShuttingDown`].
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for PvCache {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

async fn join_blocking<T>(
    task: tokio::task::JoinHandle<Result<T, CacheError>>,
) -> Result<T, CacheError> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(CacheError::ShuttingDown),
    }
}
