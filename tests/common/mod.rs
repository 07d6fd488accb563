#![allow(dead_code)]

use std::sync::Arc;

use shmns::clock::ManualClock;
use shmns::snapshot::RestoreContext;
use shmns::{Config, Credentials, HeapMemoryFile, MemoryFileId, NamespaceId, Registry};

/// TestNs is an isolated namespace with its own memory file and clock
pub struct TestNs {
    pub registry: Arc<Registry>,
    pub mf: Arc<HeapMemoryFile>,
    pub clock: Arc<ManualClock>,
    pub config: Config,
}

impl TestNs {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let mf = Arc::new(HeapMemoryFile::new(MemoryFileId(1), 1 << 30));
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Registry::new(NamespaceId::generate(), config.clone(), mf.clone(), clock.clone());
        TestNs { registry, mf, clock, config }
    }

    /// Unprivileged user whose primary group matches its uid
    pub fn user(&self, uid: u32) -> Credentials {
        Credentials::new(self.registry.namespace(), uid, uid)
    }

    pub fn root(&self) -> Credentials {
        Credentials::root(self.registry.namespace())
    }

    /// Context restoring into the same memory file
    pub fn restore_context(&self) -> RestoreContext {
        RestoreContext::new(self.config.clone(), self.mf.clone(), self.clock.clone())
    }

    /// Sum of page-rounded sizes over live segments, in pages
    pub fn live_pages(registry: &Registry) -> u64 {
        let page_size = registry.config().page_size();
        registry
            .ids()
            .into_iter()
            .filter_map(|id| registry.find_by_id(id).ok())
            .map(|shm| shm.effective_size() / page_size)
            .sum()
    }

    /// Assert that total_pages matches the live segments
    pub fn assert_accounting(&self) {
        assert_eq!(
            self.registry.total_pages(),
            Self::live_pages(&self.registry),
            "total_pages out of sync with live segments"
        );
    }
}
