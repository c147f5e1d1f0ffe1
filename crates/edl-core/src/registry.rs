//! Mapping registry: the read-mostly snapshot of dataset definitions.
//!
//! The registry is replaced wholesale when the configuration digest changes.
//! Readers resolve a definition once per request and keep that pointer for
//! the request's lifetime; a replace never mutates live definitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::config::{DatasetDefinition, LayerConfig};

/// 16-byte content digest over the raw configuration bytes.
pub fn digest(bytes: &[u8]) -> [u8; 16] {
    md5::compute(bytes).0
}

/// Immutable view of the configuration in force for one request.
#[derive(Debug)]
pub struct Snapshot {
    pub config: LayerConfig,
    pub digest: [u8; 16],
    datasets: HashMap<String, Arc<DatasetDefinition>>,
}

impl Snapshot {
    pub fn new(config: LayerConfig, digest: [u8; 16]) -> Self {
        let datasets = config
            .datasets
            .iter()
            .map(|ds| (ds.name.clone(), Arc::new(ds.clone())))
            .collect();
        Snapshot {
            config,
            digest,
            datasets,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<DatasetDefinition>> {
        self.datasets.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasets.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Holds the current snapshot and swaps it atomically on config change.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: RwLock::new(Arc::new(Snapshot::new(LayerConfig::default(), [0; 16]))),
        }
    }

    /// The snapshot in force right now. Callers hold on to it for the
    /// duration of a request; later replaces do not affect it.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<DatasetDefinition>> {
        self.snapshot().lookup(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.snapshot().list()
    }

    /// Installs a new configuration. Equal digests are a no-op; returns
    /// whether the snapshot was actually replaced.
    pub fn replace(&self, config: LayerConfig, digest: [u8; 16]) -> bool {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        if guard.digest == digest {
            return false;
        }
        *guard = Arc::new(Snapshot::new(config, digest));
        info!("updated configuration with new values");
        true
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
