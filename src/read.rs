use std::time::{Duration, Instant};

use tracing::{debug, debug_span};

use crate::{
    cache::Shared,
    condition::CacheError,
    snapshot::ReadResult,
    utils::clean_pv_name,
};

/// Clean a list of names, refusing an empty list or an empty name
pub(crate) fn clean_names<S: AsRef<str>>(
    names: &[S],
    what: &'static str,
) -> Result<Vec<String>, CacheError> {
    let cleaned: Vec<String> = names.iter().map(|n| clean_pv_name(n.as_ref())).collect();
    if cleaned.iter().any(String::is_empty) {
        return Err(CacheError::InvalidInput(what));
    }
    Ok(cleaned)
}

impl Shared {
    pub(crate) fn read<S: AsRef<str>, F: AsRef<str>>(
        &self,
        names: &[S],
        fields: &[F],
        timeout: Duration,
    ) -> Result<ReadResult, CacheError> {
        self.check_running()?;
        if names.is_empty() {
            return Err(CacheError::InvalidInput("no PV names given"));
        }
        let names = clean_names(names, "empty PV name")?;
        let fields = clean_names(fields, "empty field name")?;

        let _polling = self.config.polling.then(|| self.polling_lock.lock().unwrap());
        let _reader = self.read_lock.lock().unwrap();
        let _span = debug_span!("read", count = names.len()).entered();
        let deadline = Instant::now() + self.effective_timeout(timeout);

        let mut name_indices = Vec::with_capacity(names.len());
        let mut field_indices = Vec::with_capacity(names.len() * fields.len());
        let mut pending = Vec::new();
        for name in &names {
            let registration = self.registry.register(name, &fields, false)?;
            name_indices.push(registration.index);
            if registration.is_new() {
                pending.push(registration.index);
            }
            for field in &fields {
                let registration = self.registry.register(&format!("{name}.{field}"), &[], true)?;
                field_indices.push(registration.index);
                if registration.is_new() {
                    pending.push(registration.index);
                }
            }
        }

        if !pending.is_empty() {
            debug!("Waiting for {} new PVs", pending.len());
            self.registry.wait_for_values(&pending, deadline, &self.cancel);
        }
        self.check_running()?;

        // One copy under one lock; field records only count towards the element count
        let requested = name_indices.len();
        let mut snapshots = self.registry.snapshots(&[name_indices, field_indices].concat())?;
        let max_element_count = snapshots
            .iter()
            .map(|s| s.element_count)
            .max()
            .unwrap_or(0);
        snapshots.truncate(requested);

        if self.config.polling {
            self.registry.clear().release(self.client.as_ref());
        }
        Ok(ReadResult {
            snapshots,
            max_element_count,
        })
    }
}
