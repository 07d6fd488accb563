use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{Credentials, Pid};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memfile::MemoryFile;
use crate::namespace::NamespaceId;
use crate::refs::Refs;
use crate::shm::{Shm, ShmInner};
use crate::types::{IPC_PRIVATE, Key, ShmGet, ShmId, ShmInfo, ShmParams};

/// Maps and accounting guarded by the registry lock.
pub(crate) struct RegistryInner {
    /// Live segments by ID, in ID order.
    pub(crate) shms: BTreeMap<ShmId, Arc<Shm>>,
    /// Segments with a non-private key.
    pub(crate) keys_to_shms: HashMap<Key, Arc<Shm>>,
    /// Sum of every live segment's effective size, in pages.
    pub(crate) total_pages: u64,
    pub(crate) last_id_used: ShmId,
}

impl RegistryInner {
    pub(crate) fn new() -> Self {
        RegistryInner {
            shms: BTreeMap::new(),
            keys_to_shms: HashMap::new(),
            total_pages: 0,
            last_id_used: 0,
        }
    }

    fn next_free_id(&self) -> Option<ShmId> {
        probe_free_id(self.last_id_used, ShmId::MAX, |id| self.shms.contains_key(&id))
    }
}

/// Probe `last + 1 ..= max`, then `0 ..= last`, for an ID not in use.
fn probe_free_id(last: ShmId, max: ShmId, in_use: impl Fn(ShmId) -> bool) -> Option<ShmId> {
    let mut id = last;
    loop {
        id = if id >= max { 0 } else { id + 1 };
        if !in_use(id) {
            return Some(id);
        }
        if id == last {
            return None;
        }
    }
}

/// Shared memory segments of one IPC namespace.
pub struct Registry {
    pub(crate) namespace: NamespaceId,
    pub(crate) config: Config,
    pub(crate) mf: Arc<dyn MemoryFile>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(
        namespace: NamespaceId,
        config: Config,
        mf: Arc<dyn MemoryFile>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        info!(%namespace, memory_file = mf.id().0, "creating shm registry");
        Arc::new(Registry {
            namespace,
            config,
            mf,
            clock,
            inner: Mutex::new(RegistryInner::new()),
        })
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `shmget`: find the segment for `req.key`, or create one.
    pub fn find_or_create(self: &Arc<Self>, creds: &Credentials, pid: Pid, req: &ShmGet) -> Result<Arc<Shm>> {
        let mut inner = self.inner.lock();

        if !req.private {
            if let Some(shm) = inner.keys_to_shms.get(&req.key).cloned() {
                if req.create && req.exclusive {
                    debug!(key = req.key, id = shm.id, "exclusive create of existing key");
                    return Err(Error::AlreadyExists);
                }
                shm.check_reattach(creds, req, self.config.strict_reattach_size)?;
                debug!(key = req.key, id = shm.id, "found segment by key");
                return Ok(shm);
            }
            if !req.create {
                debug!(key = req.key, "no segment for key");
                return Err(Error::NotFound);
            }
        }

        self.create_locked(&mut inner, creds, pid, req)
    }

    fn create_locked(
        self: &Arc<Self>,
        inner: &mut RegistryInner,
        creds: &Credentials,
        pid: Pid,
        req: &ShmGet,
    ) -> Result<Arc<Shm>> {
        let config = &self.config;
        if req.size < config.shm_min || req.size > config.shm_max {
            return Err(Error::InvalidSize);
        }
        let effective_size = config.page_round_up(req.size).ok_or(Error::InvalidSize)?;
        let pages = effective_size / config.page_size;

        match inner.total_pages.checked_add(pages) {
            Some(total) if total <= config.shm_all => {}
            _ => {
                warn!(total_pages = inner.total_pages, pages, limit = config.shm_all, "shm page limit reached");
                return Err(Error::ResourceExhausted);
            }
        }
        if inner.shms.len() >= config.shm_mni as usize {
            warn!(segments = inner.shms.len(), limit = config.shm_mni, "shm segment limit reached");
            return Err(Error::ResourceExhausted);
        }
        let id = inner.next_free_id().ok_or(Error::ResourceExhausted)?;

        // Nothing is committed until the reservation succeeds.
        let file_range = self
            .mf
            .reserve(effective_size)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;

        let key = if req.private { IPC_PRIVATE } else { req.key };
        let now = self.clock.now();
        let shm = Arc::new(Shm {
            refs: Refs::new(),
            id,
            creator: creds.owner(),
            size: req.size,
            effective_size,
            file_range,
            namespace: self.namespace,
            mf: Arc::clone(&self.mf),
            registry: Arc::downgrade(self),
            clock: Arc::clone(&self.clock),
            inner: Mutex::new(ShmInner {
                key,
                perms: req.mode,
                owner: creds.owner(),
                attach_time: 0,
                detach_time: 0,
                change_time: now,
                creator_pid: pid,
                last_attach_detach_pid: 0,
                pending_destruction: false,
                attach_count: 0,
                unclaimed: 0,
                destroyed: false,
            }),
        });

        inner.shms.insert(id, Arc::clone(&shm));
        if key != IPC_PRIVATE {
            inner.keys_to_shms.insert(key, Arc::clone(&shm));
        }
        inner.total_pages += pages;
        inner.last_id_used = id;

        info!(id, key, size = req.size, effective_size, pid, "segment created");
        Ok(shm)
    }

    /// Look up a live segment by ID.
    pub fn find_by_id(&self, id: ShmId) -> Result<Arc<Shm>> {
        let inner = self.inner.lock();
        inner.shms.get(&id).cloned().ok_or(Error::NotFound)
    }

    /// `shmctl(id, IPC_RMID)`.
    pub fn mark_destroyed(&self, creds: &Credentials, id: ShmId) -> Result<()> {
        let shm = self.find_by_id(id)?;
        shm.mark_destroyed(creds)
    }

    /// Tear down the namespace: every segment is marked for destruction and
    /// goes away once its last mapping is detached.
    pub fn release(&self) {
        let shms: Vec<Arc<Shm>> = self.inner.lock().shms.values().cloned().collect();
        info!(namespace = %self.namespace, segments = shms.len(), "releasing shm registry");
        for shm in shms {
            shm.mark_destroyed_unchecked();
        }
    }

    /// Unlink a segment whose reference count reached zero.
    pub(crate) fn remove(&self, shm: &Shm) {
        let mut inner = self.inner.lock();
        let mut seg = shm.inner.lock();
        if seg.destroyed {
            return;
        }
        seg.destroyed = true;

        if let Some(existing) = inner.shms.get(&shm.id) {
            if std::ptr::eq(Arc::as_ptr(existing), shm) {
                inner.shms.remove(&shm.id);
            }
        }
        if seg.key != IPC_PRIVATE {
            if let Some(existing) = inner.keys_to_shms.get(&seg.key) {
                if std::ptr::eq(Arc::as_ptr(existing), shm) {
                    inner.keys_to_shms.remove(&seg.key);
                }
            }
        }
        inner.total_pages -= shm.effective_size / self.config.page_size;
        debug!(id = shm.id, total_pages = inner.total_pages, "segment removed from registry");
    }

    /// Drop the key so it can name a new segment while this one drains.
    pub(crate) fn dissociate_key(&self, shm: &Shm) {
        let mut inner = self.inner.lock();
        let mut seg = shm.inner.lock();
        if seg.key == IPC_PRIVATE {
            return;
        }
        if let Some(existing) = inner.keys_to_shms.get(&seg.key) {
            if std::ptr::eq(Arc::as_ptr(existing), shm) {
                inner.keys_to_shms.remove(&seg.key);
            }
        }
        debug!(id = shm.id, key = seg.key, "key dissociated");
        seg.key = IPC_PRIVATE;
    }

    pub fn total_pages(&self) -> u64 {
        self.inner.lock().total_pages
    }

    pub fn last_id_used(&self) -> ShmId {
        self.inner.lock().last_id_used
    }

    /// IDs of live segments in ascending order.
    pub fn ids(&self) -> Vec<ShmId> {
        self.inner.lock().shms.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().shms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ID currently bound to `key`, if any.
    pub fn id_for_key(&self, key: Key) -> Option<ShmId> {
        self.inner.lock().keys_to_shms.get(&key).map(|shm| shm.id)
    }

    /// `IPC_INFO`.
    pub fn ipc_info(&self) -> ShmParams {
        ShmParams {
            shmmax: self.config.shm_max,
            shmmin: self.config.shm_min,
            shmmni: self.config.shm_mni,
            shmseg: self.config.shm_mni,
            shmall: self.config.shm_all,
        }
    }

    /// `SHM_INFO`.
    pub fn shm_info(&self) -> ShmInfo {
        let inner = self.inner.lock();
        ShmInfo {
            used_ids: inner.shms.len() as u32,
            shm_tot: inner.total_pages,
            shm_rss: inner.total_pages,
            shm_swp: 0,
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.shms.is_empty() {
            debug!(namespace = %self.namespace, segments = inner.shms.len(), "registry dropped with live segments");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use crate::clock::ManualClock;
    use crate::memfile::{HeapMemoryFile, MemoryFileId};

    fn registry(config: Config) -> (Arc<Registry>, Credentials) {
        let ns = NamespaceId::generate();
        let mf = Arc::new(HeapMemoryFile::new(MemoryFileId(1), 1 << 30));
        let registry = Registry::new(ns, config, mf, Arc::new(ManualClock::new(100)));
        (registry, Credentials::new(ns, 1000, 1000))
    }

    #[test]
    fn test_ids_probe_past_used() {
        let mut inner = RegistryInner::new();
        assert_eq!(inner.next_free_id(), Some(1));

        inner.last_id_used = ShmId::MAX;
        assert_eq!(inner.next_free_id(), Some(0));
    }

    #[test]
    fn test_probe_reaches_last_used_id() {
        let used: HashSet<ShmId> = [0, 1, 3].into_iter().collect();
        assert_eq!(probe_free_id(2, 3, |id| used.contains(&id)), Some(2));

        let full: HashSet<ShmId> = (0..=3).collect();
        assert_eq!(probe_free_id(2, 3, |id| full.contains(&id)), None);
        assert_eq!(probe_free_id(3, 3, |id| id == 0), Some(1));
    }

    #[test]
    fn test_id_allocation_wraps_and_skips() {
        let (registry, creds) = registry(Config::default());
        let a = registry.find_or_create(&creds, 1, &ShmGet::create(IPC_PRIVATE, 1, 0o600)).unwrap();
        assert_eq!(a.id(), 1);

        registry.inner.lock().last_id_used = ShmId::MAX;
        let b = registry.find_or_create(&creds, 1, &ShmGet::create(IPC_PRIVATE, 1, 0o600)).unwrap();
        assert_eq!(b.id(), 0);
        let c = registry.find_or_create(&creds, 1, &ShmGet::create(IPC_PRIVATE, 1, 0o600)).unwrap();
        assert_eq!(c.id(), 2, "ID 1 is still in use");
        assert_eq!(registry.last_id_used(), 2);
    }

    #[test]
    fn test_private_segments_skip_key_map() {
        let (registry, creds) = registry(Config::default());
        let a = registry.find_or_create(&creds, 1, &ShmGet::create(IPC_PRIVATE, 10, 0o600)).unwrap();
        let b = registry.find_or_create(&creds, 1, &ShmGet::create(IPC_PRIVATE, 10, 0o600)).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(registry.inner.lock().keys_to_shms.is_empty());
        assert_eq!(registry.total_pages(), 2);
    }

    #[test]
    fn test_size_limits() {
        let (registry, creds) = registry(Config::default().with_shm_max(8192));
        assert_eq!(
            registry.find_or_create(&creds, 1, &ShmGet::create(5, 0, 0o600)).unwrap_err(),
            Error::InvalidSize
        );
        assert_eq!(
            registry.find_or_create(&creds, 1, &ShmGet::create(5, 8193, 0o600)).unwrap_err(),
            Error::InvalidSize
        );
        assert!(registry.find_or_create(&creds, 1, &ShmGet::create(5, 8192, 0o600)).is_ok());
    }

    #[test]
    fn test_segment_count_limit() {
        let (registry, creds) = registry(Config::default().with_shm_mni(2));
        registry.find_or_create(&creds, 1, &ShmGet::create(1, 1, 0o600)).unwrap();
        registry.find_or_create(&creds, 1, &ShmGet::create(2, 1, 0o600)).unwrap();
        assert_eq!(
            registry.find_or_create(&creds, 1, &ShmGet::create(3, 1, 0o600)).unwrap_err(),
            Error::ResourceExhausted
        );
        assert_eq!(registry.id_for_key(3), None);
        assert_eq!(registry.last_id_used(), 2);
    }

    #[test]
    fn test_allocation_failure_leaves_no_trace() {
        let ns = NamespaceId::generate();
        let mf = Arc::new(HeapMemoryFile::new(MemoryFileId(1), 4096));
        let registry = Registry::new(ns, Config::default(), mf, Arc::new(ManualClock::new(0)));
        let creds = Credentials::new(ns, 0, 0);

        registry.find_or_create(&creds, 1, &ShmGet::create(1, 4096, 0o600)).unwrap();
        let err = registry.find_or_create(&creds, 1, &ShmGet::create(2, 4096, 0o600)).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)), "got {:?}", err);
        assert_eq!(registry.last_id_used(), 1);
        assert_eq!(registry.total_pages(), 1);
        assert_eq!(registry.id_for_key(2), None);
    }

    #[test]
    fn test_strict_reattach_size() {
        let (registry, creds) = registry(Config::default().with_strict_reattach_size(true));
        registry.find_or_create(&creds, 1, &ShmGet::create(9, 1000, 0o600)).unwrap();
        assert_eq!(
            registry.find_or_create(&creds, 1, &ShmGet::lookup(9, 500, 0o600)).unwrap_err(),
            Error::InvalidSize
        );
        assert!(registry.find_or_create(&creds, 1, &ShmGet::lookup(9, 0, 0o600)).is_ok());
        assert!(registry.find_or_create(&creds, 1, &ShmGet::lookup(9, 1000, 0o600)).is_ok());
    }

    #[test]
    fn test_info() {
        let (registry, creds) = registry(Config::default());
        registry.find_or_create(&creds, 1, &ShmGet::create(1, 3 * 4096, 0o600)).unwrap();
        let info = registry.shm_info();
        assert_eq!(info.used_ids, 1);
        assert_eq!(info.shm_tot, 3);
        assert_eq!(registry.ipc_info().shmmni, 4096);
    }
}
