//! Checkpoint and restore of a registry and its segments.
//!
//! A snapshot is a header followed by one registry record, one segment
//! record per segment in ID order and one refs record per segment in the
//! same order. Locks, back-pointers and the clock are not saved; loading
//! re-links segments to the rebuilt registry and to memory files supplied by
//! the [`RestoreContext`].

pub mod records;

pub use records::{RefsRecord, RegistryRecord, ShmRecord, SnapshotHeader, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use bincode::Decode;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memfile::{MemoryFile, MemoryFileId};
use crate::namespace::NamespaceId;
use crate::refs::Refs;
use crate::registry::{Registry, RegistryInner};
use crate::shm::{Shm, ShmInner};
use crate::types::{IPC_PRIVATE, ShmId};
use self::records::compute_checksum;

/// Everything a load needs that the snapshot does not carry.
pub struct RestoreContext {
    config: Config,
    clock: Arc<dyn Clock>,
    /// Allocator for segments created after the restore.
    memory_file: Arc<dyn MemoryFile>,
    memory_files: HashMap<MemoryFileId, Arc<dyn MemoryFile>>,
    /// Mappings of each segment restored alongside the registry.
    attached: HashMap<ShmId, u64>,
}

impl RestoreContext {
    pub fn new(config: Config, memory_file: Arc<dyn MemoryFile>, clock: Arc<dyn Clock>) -> Self {
        let mut memory_files = HashMap::new();
        memory_files.insert(memory_file.id(), Arc::clone(&memory_file));
        RestoreContext {
            config,
            clock,
            memory_file,
            memory_files,
            attached: HashMap::new(),
        }
    }

    /// Make another memory file resolvable by its ID.
    pub fn with_memory_file(mut self, mf: Arc<dyn MemoryFile>) -> Self {
        self.memory_files.insert(mf.id(), mf);
        self
    }

    /// Declare `count` restored mappings of segment `id`.
    pub fn with_attached(mut self, id: ShmId, count: u64) -> Self {
        *self.attached.entry(id).or_insert(0) += count;
        self
    }
}

/// Serialize `registry` and every segment it holds.
///
/// Holds the registry lock throughout; callers quiesce mutators first.
pub fn save(registry: &Registry) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    let inner = registry.inner.lock();

    let mut shm_records = Vec::with_capacity(inner.shms.len());
    let mut refs_records = Vec::with_capacity(inner.shms.len());
    for shm in inner.shms.values() {
        let seg = shm.inner.lock();
        shm_records.push(ShmRecord::capture(shm, &seg));
        refs_records.push(RefsRecord { count: shm.refs.read_refs() });
    }

    let mut keys_to_shms: Vec<_> = inner
        .keys_to_shms
        .iter()
        .map(|(&key, shm)| (key, shm.id))
        .collect();
    keys_to_shms.sort_unstable();

    let record = RegistryRecord {
        namespace: registry.namespace.as_u128(),
        shm_ids: inner.shms.keys().copied().collect(),
        keys_to_shms,
        total_pages: inner.total_pages,
        last_id_used: inner.last_id_used,
    };

    let mut body = bincode::encode_to_vec(&record, config)?;
    for shm in &shm_records {
        body.extend_from_slice(&bincode::encode_to_vec(shm, config)?);
    }
    for refs in &refs_records {
        body.extend_from_slice(&bincode::encode_to_vec(refs, config)?);
    }

    let header = SnapshotHeader::new(shm_records.len() as u32, &body);
    let mut out = bincode::encode_to_vec(&header, config)?;
    out.extend_from_slice(&body);

    info!(
        namespace = %registry.namespace,
        segments = shm_records.len(),
        total_pages = inner.total_pages,
        bytes = out.len(),
        "registry saved"
    );
    Ok(out)
}

/// Rebuild a registry from `data`. Either the whole graph is restored or
/// nothing is.
pub fn load(data: &[u8], ctx: &RestoreContext) -> Result<Arc<Registry>> {
    let graph = SavedGraph::decode(data).inspect_err(|e| warn!(error = %e, "snapshot rejected"))?;
    let prepared = graph.validate(ctx).inspect_err(|e| warn!(error = %e, "snapshot rejected"))?;
    let registry = prepared.restore(ctx);
    info!(
        namespace = %registry.namespace,
        segments = registry.len(),
        total_pages = registry.total_pages(),
        "registry loaded"
    );
    Ok(registry)
}

/// Upper bound on the bytes one record may claim while decoding.
const MAX_RECORD_BYTES: usize = 64 << 20;

fn decode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_RECORD_BYTES>()
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptState(msg.into())
}

/// Decoded records, not yet checked against each other.
struct SavedGraph {
    registry: RegistryRecord,
    shms: Vec<ShmRecord>,
    refs: Vec<RefsRecord>,
}

/// A segment record whose back-references have been resolved.
struct PreparedShm {
    record: ShmRecord,
    count: i64,
    attached: u64,
    mf: Arc<dyn MemoryFile>,
}

struct PreparedGraph {
    namespace: NamespaceId,
    registry: RegistryRecord,
    shms: Vec<PreparedShm>,
}

impl SavedGraph {
    fn decode(data: &[u8]) -> Result<Self> {
        let (header, header_len): (SnapshotHeader, usize) = bincode::decode_from_slice(data, decode_config())?;
        if header.magic != SNAPSHOT_MAGIC {
            return Err(corrupt(format!("bad magic {:#x}", header.magic)));
        }
        if header.version != SNAPSHOT_VERSION {
            return Err(corrupt(format!(
                "unsupported snapshot version {} (expected {})",
                header.version, SNAPSHOT_VERSION
            )));
        }

        let body = &data[header_len..];
        if body.len() as u64 != header.body_len {
            return Err(corrupt(format!(
                "body is {} bytes, header says {}",
                body.len(),
                header.body_len
            )));
        }
        let checksum = compute_checksum(body);
        if checksum != header.checksum {
            return Err(corrupt(format!(
                "checksum mismatch: expected {}, got {}",
                header.checksum, checksum
            )));
        }

        let mut offset = 0;
        let registry: RegistryRecord = decode_next(body, &mut offset)?;
        let count = header.segment_count as usize;
        let shms = (0..count)
            .map(|_| decode_next::<ShmRecord>(body, &mut offset))
            .collect::<Result<Vec<_>>>()?;
        let refs = (0..count)
            .map(|_| decode_next::<RefsRecord>(body, &mut offset))
            .collect::<Result<Vec<_>>>()?;
        if offset != body.len() {
            return Err(corrupt(format!("{} trailing bytes", body.len() - offset)));
        }

        debug!(segments = count, "snapshot decoded");
        Ok(SavedGraph { registry, shms, refs })
    }

    /// Check the registry invariants and resolve back-references.
    fn validate(self, ctx: &RestoreContext) -> Result<PreparedGraph> {
        let SavedGraph { registry, shms, refs } = self;
        let page_size = ctx.config.page_size;

        if registry.shm_ids.len() != shms.len() {
            return Err(corrupt(format!(
                "registry lists {} segments, snapshot holds {}",
                registry.shm_ids.len(),
                shms.len()
            )));
        }
        if registry.last_id_used < 0 {
            return Err(corrupt(format!("negative last ID {}", registry.last_id_used)));
        }

        let mut prev: Option<ShmId> = None;
        let mut pages = 0u64;
        for (&id, shm) in registry.shm_ids.iter().zip(&shms) {
            if id < 0 || prev.is_some_and(|p| p >= id) {
                return Err(corrupt(format!("segment IDs not unique and ascending at {}", id)));
            }
            prev = Some(id);
            if shm.id != id {
                return Err(corrupt(format!("segment record {} out of order, expected {}", shm.id, id)));
            }
            if shm.namespace != registry.namespace {
                return Err(corrupt(format!("segment {} belongs to another namespace", id)));
            }
            if shm.file_range.start > shm.file_range.end {
                return Err(corrupt(format!("segment {} has inverted range {:?}", id, shm.file_range)));
            }
            if shm.size == 0
                || shm.effective_size < shm.size
                || shm.effective_size % page_size != 0
                || shm.file_range.len() != shm.effective_size
            {
                return Err(corrupt(format!(
                    "segment {} has size {}, effective size {}, range {:?}",
                    id, shm.size, shm.effective_size, shm.file_range
                )));
            }
            pages = pages
                .checked_add(shm.effective_size / page_size)
                .ok_or_else(|| corrupt(format!("page count overflows at segment {}", id)))?;
        }
        if pages != registry.total_pages {
            return Err(corrupt(format!(
                "total pages {} but segments hold {}",
                registry.total_pages, pages
            )));
        }

        let mut ranges: Vec<_> = shms.iter().map(|s| (s.memory_file, s.file_range, s.id)).collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            let (mf, lo, lo_id) = pair[0];
            let (hi_mf, hi, hi_id) = pair[1];
            if mf == hi_mf && hi.start < lo.end {
                return Err(corrupt(format!(
                    "segments {} and {} overlap in memory file {}",
                    lo_id, hi_id, mf.0
                )));
            }
        }

        let by_id: BTreeMap<ShmId, &ShmRecord> = shms.iter().map(|s| (s.id, s)).collect();
        let mut keys = HashSet::new();
        for &(key, id) in &registry.keys_to_shms {
            if key == IPC_PRIVATE || !keys.insert(key) {
                return Err(corrupt(format!("key {} bound twice or private", key)));
            }
            match by_id.get(&id) {
                Some(shm) if shm.key == key => {}
                _ => return Err(corrupt(format!("key {} bound to unknown segment {}", key, id))),
            }
        }
        let keyed = shms.iter().filter(|s| s.key != IPC_PRIVATE).count();
        if keyed != keys.len() {
            return Err(corrupt(format!(
                "{} keyed segments but {} key bindings",
                keyed,
                keys.len()
            )));
        }

        for id in ctx.attached.keys() {
            if !by_id.contains_key(id) {
                return Err(corrupt(format!("mappings restored for unknown segment {}", id)));
            }
        }

        let mut prepared = Vec::with_capacity(shms.len());
        for (record, refs) in shms.into_iter().zip(refs) {
            let attached = ctx.attached.get(&record.id).copied().unwrap_or(0);
            let expected = attached as i64 + if record.pending_destruction { 0 } else { 1 };
            if refs.count <= 0 || refs.count != expected {
                return Err(corrupt(format!(
                    "segment {} has {} references, expected {} for {} mappings",
                    record.id, refs.count, expected, attached
                )));
            }
            let mf = ctx
                .memory_files
                .get(&record.memory_file)
                .cloned()
                .ok_or_else(|| corrupt(format!("segment {} uses unknown memory file {}", record.id, record.memory_file.0)))?;
            prepared.push(PreparedShm { record, count: refs.count, attached, mf });
        }

        Ok(PreparedGraph {
            namespace: NamespaceId::from_u128(registry.namespace),
            registry,
            shms: prepared,
        })
    }
}

impl PreparedGraph {
    /// Build the live graph, pointing every segment back at its registry.
    fn restore(self, ctx: &RestoreContext) -> Arc<Registry> {
        let PreparedGraph { namespace, registry, shms } = self;

        Arc::new_cyclic(|weak: &Weak<Registry>| {
            let mut inner = RegistryInner::new();
            inner.total_pages = registry.total_pages;
            inner.last_id_used = registry.last_id_used;

            for prepared in shms {
                let shm = Arc::new(prepared.after_load(namespace, weak.clone(), Arc::clone(&ctx.clock)));
                inner.shms.insert(shm.id, shm);
            }
            for (key, id) in registry.keys_to_shms {
                if let Some(shm) = inner.shms.get(&id) {
                    let shm = Arc::clone(shm);
                    inner.keys_to_shms.insert(key, shm);
                }
            }

            Registry {
                namespace,
                config: ctx.config.clone(),
                mf: Arc::clone(&ctx.memory_file),
                clock: Arc::clone(&ctx.clock),
                inner: Mutex::new(inner),
            }
        })
    }
}

impl PreparedShm {
    fn after_load(self, namespace: NamespaceId, registry: Weak<Registry>, clock: Arc<dyn Clock>) -> Shm {
        let PreparedShm { record, count, attached, mf } = self;
        debug!(id = record.id, refs = count, attached, "segment restored");
        Shm {
            refs: Refs::from_raw(count),
            id: record.id,
            creator: record.creator,
            size: record.size,
            effective_size: record.effective_size,
            file_range: record.file_range,
            namespace,
            mf,
            registry,
            clock,
            inner: Mutex::new(ShmInner {
                key: record.key,
                perms: record.perms,
                owner: record.owner,
                attach_time: record.attach_time,
                detach_time: record.detach_time,
                change_time: record.change_time,
                creator_pid: record.creator_pid,
                last_attach_detach_pid: record.last_attach_detach_pid,
                pending_destruction: record.pending_destruction,
                attach_count: attached,
                unclaimed: attached,
                destroyed: false,
            }),
        }
    }
}

fn decode_next<T: Decode<()>>(body: &[u8], offset: &mut usize) -> Result<T> {
    let (value, read) = bincode::decode_from_slice(&body[*offset..], decode_config())?;
    *offset += read;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::clock::ManualClock;
    use crate::memfile::HeapMemoryFile;
    use crate::types::ShmGet;

    fn setup() -> (Arc<Registry>, Arc<HeapMemoryFile>, Credentials) {
        let ns = NamespaceId::generate();
        let mf = Arc::new(HeapMemoryFile::new(MemoryFileId(3), 1 << 24));
        let registry = Registry::new(ns, Config::default(), mf.clone(), Arc::new(ManualClock::new(50)));
        (registry, mf, Credentials::new(ns, 1000, 1000))
    }

    fn context(mf: Arc<HeapMemoryFile>) -> RestoreContext {
        RestoreContext::new(Config::default(), mf, Arc::new(ManualClock::new(60)))
    }

    #[test]
    fn test_empty_registry_round_trip() {
        let (registry, mf, _) = setup();
        let bytes = save(&registry).unwrap();
        let restored = load(&bytes, &context(mf)).unwrap();
        assert_eq!(restored.namespace(), registry.namespace());
        assert!(restored.is_empty());
        assert_eq!(save(&restored).unwrap(), bytes);
    }

    #[test]
    fn test_checksum_detects_flipped_byte() {
        let (registry, mf, creds) = setup();
        registry.find_or_create(&creds, 1, &ShmGet::create(5, 100, 0o600)).unwrap();
        let mut bytes = save(&registry).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(load(&bytes, &context(mf)), Err(Error::CorruptState(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (registry, mf, _) = setup();
        let bytes = save(&registry).unwrap();
        let (mut header, len): (SnapshotHeader, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        header.version = SNAPSHOT_VERSION + 1;
        let mut tampered = bincode::encode_to_vec(&header, bincode::config::standard()).unwrap();
        tampered.extend_from_slice(&bytes[len..]);

        match load(&tampered, &context(mf)) {
            Err(Error::CorruptState(msg)) => assert!(msg.contains("version"), "{}", msg),
            other => panic!("expected CorruptState, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_unknown_memory_file_rejected() {
        let (registry, _mf, creds) = setup();
        registry.find_or_create(&creds, 1, &ShmGet::create(5, 100, 0o600)).unwrap();
        let bytes = save(&registry).unwrap();

        let other = Arc::new(HeapMemoryFile::new(MemoryFileId(99), 1 << 20));
        assert!(matches!(load(&bytes, &context(other)), Err(Error::CorruptState(_))));
    }

    #[test]
    fn test_attachments_must_match_refs() {
        let (registry, mf, creds) = setup();
        let shm = registry.find_or_create(&creds, 1, &ShmGet::create(5, 100, 0o600)).unwrap();
        let _mapping = shm.attach(&creds, 1, false).unwrap();
        let bytes = save(&registry).unwrap();

        assert!(matches!(load(&bytes, &context(mf.clone())), Err(Error::CorruptState(_))));
        let restored = load(&bytes, &context(mf).with_attached(shm.id(), 1)).unwrap();
        assert_eq!(restored.find_by_id(shm.id()).unwrap().read_refs(), 2);
    }
}
