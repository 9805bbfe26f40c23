//! The connect worker: creates protocol channels for newly registered PVs.

use std::{
    io,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{cache::Shared, ingest, registry::PvIndex, registry::PvState};

/// Start the worker thread. It runs until the cache is cancelled.
pub(crate) fn spawn(shared: &Arc<Shared>) -> io::Result<JoinHandle<()>> {
    let shared = Arc::downgrade(shared);
    thread::Builder::new()
        .name("pv-connect".to_string())
        .spawn(move || run(shared))
}

fn run(shared: Weak<Shared>) {
    let _span = debug_span!("connect_worker").entered();
    debug!("Connect worker started");
    loop {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.cancel.is_cancelled() {
            break;
        }
        if let Some((index, generation)) = shared
            .registry
            .queue()
            .pop(shared.config.connect_idle, &shared.cancel)
        {
            connect(&shared, index, generation);
        }
    }
    debug!("Connect worker finished");
}

fn connect(shared: &Arc<Shared>, index: PvIndex, generation: u64) {
    let name = {
        let mut inner = shared.registry.lock();
        let Some(record) = inner.get_mut(index, generation) else {
            trace!("Skipping stale queue entry {index}");
            return;
        };
        record.queued = false;
        record.name.clone()
    };

    let handler = ingest::connection_handler(Arc::downgrade(shared), index, generation);
    match shared.client.create_channel(&name, handler) {
        Ok(channel) => {
            shared.client.flush();
            let mut inner = shared.registry.lock();
            match inner.get_mut(index, generation) {
                Some(record) => {
                    trace!("Created channel {channel:?} for {name}");
                    record.channel = Some(channel);
                }
                None => {
                    // Removed or reset while the channel was being created
                    drop(inner);
                    shared.client.close_channel(channel);
                }
            }
        }
        Err(condition) => {
            warn!("Could not create channel for {name}: {condition}");
            let message = shared.client.error_message(condition);
            let mut inner = shared.registry.lock();
            if let Some(record) = inner.get_mut(index, generation) {
                record.state = PvState::Unconnected;
                record.set_error(condition, message);
                record.publish();
            }
            drop(inner);
            shared.registry.notify_updated();
        }
    }
}
