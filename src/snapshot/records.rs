use serde::{Serialize, Deserialize};
use bincode::{Encode, Decode};

use crate::auth::{FileOwner, Mode, Pid};
use crate::clock::Timestamp;
use crate::memfile::{FileRange, MemoryFileId};
use crate::shm::{Shm, ShmInner};
use crate::types::{Key, ShmId};

pub const SNAPSHOT_MAGIC: u32 = 0x53484D53; // "SHMS"
/// Field order of every record is the wire order. Changing, adding or
/// reordering a field needs a version bump.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Precedes the record sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Number of segment records, and of refs records.
    pub segment_count: u32,
    /// Length of the encoded records following the header.
    pub body_len: u64,
    /// Checksum of the record bytes.
    pub checksum: u64,
}

impl SnapshotHeader {
    pub fn new(segment_count: u32, body: &[u8]) -> Self {
        SnapshotHeader {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            segment_count,
            body_len: body.len() as u64,
            checksum: compute_checksum(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RegistryRecord {
    /// Owning namespace, by identity.
    pub namespace: u128,
    /// Segment IDs in ascending order; segment records follow in this order.
    pub shm_ids: Vec<ShmId>,
    /// Key bindings sorted by key.
    pub keys_to_shms: Vec<(Key, ShmId)>,
    pub total_pages: u64,
    pub last_id_used: ShmId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ShmRecord {
    pub id: ShmId,
    /// Backing memory file, by identity.
    pub memory_file: MemoryFileId,
    /// Owning namespace, by identity.
    pub namespace: u128,
    pub creator: FileOwner,
    pub size: u64,
    pub effective_size: u64,
    pub file_range: FileRange,
    pub key: Key,
    pub perms: Mode,
    pub owner: FileOwner,
    pub attach_time: Timestamp,
    pub detach_time: Timestamp,
    pub change_time: Timestamp,
    pub creator_pid: Pid,
    pub last_attach_detach_pid: Pid,
    pub pending_destruction: bool,
}

impl ShmRecord {
    pub(crate) fn capture(shm: &Shm, inner: &ShmInner) -> Self {
        ShmRecord {
            id: shm.id,
            memory_file: shm.mf.id(),
            namespace: shm.namespace.as_u128(),
            creator: shm.creator,
            size: shm.size,
            effective_size: shm.effective_size,
            file_range: shm.file_range,
            key: inner.key,
            perms: inner.perms,
            owner: inner.owner,
            attach_time: inner.attach_time,
            detach_time: inner.detach_time,
            change_time: inner.change_time,
            creator_pid: inner.creator_pid,
            last_attach_detach_pid: inner.last_attach_detach_pid,
            pending_destruction: inner.pending_destruction,
        }
    }
}

/// Raw count of a segment's reference handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RefsRecord {
    pub count: i64,
}

/// Compute simple checksum for snapshot validation
pub(crate) fn compute_checksum(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, &byte| {
        acc.wrapping_mul(31).wrapping_add(byte as u64)
    })
}
