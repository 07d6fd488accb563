use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memfile::MemoryFile;
use crate::registry::Registry;

/// Identity of an IPC namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(Ulid);

impl NamespaceId {
    pub fn generate() -> Self {
        NamespaceId(Ulid::new())
    }

    pub fn from_u128(raw: u128) -> Self {
        NamespaceId(Ulid::from(raw))
    }

    pub fn as_u128(&self) -> u128 {
        u128::from(self.0)
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shm registries of every IPC namespace in the sandbox, one per namespace.
pub struct Namespaces {
    config: Config,
    mf: Arc<dyn MemoryFile>,
    clock: Arc<dyn Clock>,
    registries: RwLock<HashMap<NamespaceId, Arc<Registry>>>,
}

impl Namespaces {
    pub fn new(config: Config, mf: Arc<dyn MemoryFile>, clock: Arc<dyn Clock>) -> Self {
        Namespaces {
            config,
            mf,
            clock,
            registries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a namespace with an empty registry.
    pub fn create(&self) -> Arc<Registry> {
        let id = NamespaceId::generate();
        let registry = Registry::new(id, self.config.clone(), Arc::clone(&self.mf), Arc::clone(&self.clock));
        self.registries.write().insert(id, Arc::clone(&registry));
        registry
    }

    /// Register a registry rebuilt from a snapshot.
    pub fn insert_restored(&self, registry: Arc<Registry>) -> Result<()> {
        let mut registries = self.registries.write();
        let id = registry.namespace();
        if registries.contains_key(&id) {
            return Err(Error::AlreadyExists);
        }
        info!(namespace = %id, segments = registry.len(), "restored namespace registered");
        registries.insert(id, registry);
        Ok(())
    }

    pub fn get(&self, id: NamespaceId) -> Result<Arc<Registry>> {
        self.registries.read().get(&id).cloned().ok_or(Error::NotFound)
    }

    /// Tear down a namespace. Segments still mapped survive until detached.
    pub fn destroy(&self, id: NamespaceId) -> Result<()> {
        let registry = self.registries.write().remove(&id).ok_or(Error::NotFound)?;
        registry.release();
        Ok(())
    }

    pub fn ids(&self) -> Vec<NamespaceId> {
        let mut ids: Vec<_> = self.registries.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.registries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
