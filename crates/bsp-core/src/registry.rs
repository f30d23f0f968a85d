//! StreamRegistry: name-keyed lookup of live streams

use crate::error::{BspError, BspResult};
use crate::stream::{StreamHandle, StreamId};
use crate::stream_info::StreamInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Process-lifetime mapping from stream names to stream handles.
///
/// Pipelines and schedulers resolve streams through the registry by name and
/// compare the [`StreamId`] they captured to detect replaced bindings.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new stream under `name`, replacing any existing binding
    pub fn open(
        &self,
        name: &str,
        info: StreamInfo,
        capacity: usize,
        marker_capacity: usize,
    ) -> BspResult<Arc<StreamHandle>> {
        if name.is_empty() {
            return Err(BspError::invalid_argument("stream_name", "stream name cannot be empty"));
        }
        let handle = Arc::new(StreamHandle::new(name, info, capacity, marker_capacity)?);
        self.insert(handle.clone());
        Ok(handle)
    }

    /// Register a handle under its own name; returns the binding it replaced
    pub fn insert(&self, handle: Arc<StreamHandle>) -> Option<Arc<StreamHandle>> {
        let previous = self
            .streams
            .write()
            .insert(handle.name().to_string(), handle.clone());

        match &previous {
            Some(old) => info!(
                stream = handle.name(),
                old_id = %old.id(),
                new_id = %handle.id(),
                "Stream binding replaced"
            ),
            None => info!(
                stream = handle.name(),
                id = %handle.id(),
                channels = handle.info().channel_count(),
                srate = handle.sampling_rate(),
                "Stream opened"
            ),
        }

        previous
    }

    /// Look up a stream by name
    pub fn get(&self, name: &str) -> BspResult<Arc<StreamHandle>> {
        self.streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BspError::NotFound {
                kind: "stream",
                name: name.to_string(),
                hint: Some("open the stream before reading from it".to_string()),
            })
    }

    /// Look up a stream and verify it is still the binding identified by `expected`
    pub fn get_bound(&self, name: &str, expected: StreamId) -> BspResult<Arc<StreamHandle>> {
        let handle = self.get(name)?;
        if handle.id() != expected {
            return Err(BspError::StaleBinding {
                kind: "stream",
                name: name.to_string(),
                expected: expected.to_string(),
                found: handle.id().to_string(),
            });
        }
        Ok(handle)
    }

    /// Remove a binding
    pub fn remove(&self, name: &str) -> Option<Arc<StreamHandle>> {
        let removed = self.streams.write().remove(name);
        if removed.is_some() {
            info!(stream = name, "Stream closed");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.read().contains_key(name)
    }

    /// Registered stream names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_info::SignalKind;

    fn info() -> StreamInfo {
        StreamInfo::new(SignalKind::Eeg, 100.0, &["C3", "C4"]).unwrap()
    }

    #[test]
    fn test_open_and_lookup() {
        let registry = StreamRegistry::new();
        let handle = registry.open("eeg", info(), 100, 8).unwrap();

        assert_eq!(registry.get("eeg").unwrap().id(), handle.id());
        assert!(registry.get_bound("eeg", handle.id()).is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(BspError::NotFound { kind: "stream", .. })
        ));
        assert_eq!(registry.names(), vec!["eeg".to_string()]);
    }

    #[test]
    fn test_replaced_binding_is_stale() {
        let registry = StreamRegistry::new();
        let first = registry.open("eeg", info(), 100, 8).unwrap();
        let second = registry.open("eeg", info(), 100, 8).unwrap();

        assert_eq!(registry.len(), 1);
        let err = registry.get_bound("eeg", first.id()).unwrap_err();
        assert!(matches!(err, BspError::StaleBinding { .. }));
        assert!(registry.get_bound("eeg", second.id()).is_ok());
    }

    #[test]
    fn test_remove() {
        let registry = StreamRegistry::new();
        registry.open("eeg", info(), 100, 8).unwrap();
        assert!(registry.remove("eeg").is_some());
        assert!(registry.remove("eeg").is_none());
        assert!(registry.is_empty());
    }
}
