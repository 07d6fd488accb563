use std::collections::BTreeMap;
use std::io;

use bincode::{Decode, Encode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Half-open byte range `[start, end)` in a memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct FileRange {
    pub start: u64,
    pub end: u64,
}

impl FileRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Stable identity of a memory file, used to re-link segments after restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct MemoryFileId(pub u64);

pub trait MemoryFile: Send + Sync {
    fn id(&self) -> MemoryFileId;

    /// Reserve `len` bytes. Must not block.
    fn reserve(&self, len: u64) -> io::Result<FileRange>;

    /// Return a range obtained from `reserve`.
    fn release(&self, range: FileRange);
}

struct HeapInner {
    /// First never-allocated offset.
    next: u64,
    /// Free ranges by start offset, coalesced.
    free: BTreeMap<u64, u64>,
    /// Reserved ranges by start offset.
    outstanding: BTreeMap<u64, u64>,
    releases: u64,
    bad_releases: u64,
}

/// First-fit range allocator bounded by `limit` bytes.
pub struct HeapMemoryFile {
    id: MemoryFileId,
    limit: u64,
    inner: Mutex<HeapInner>,
}

/// Serialized form of a [`HeapMemoryFile`], saved next to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct HeapState {
    pub id: MemoryFileId,
    pub limit: u64,
    pub next: u64,
    pub free: Vec<FileRange>,
    pub outstanding: Vec<FileRange>,
}

impl HeapMemoryFile {
    pub fn new(id: MemoryFileId, limit: u64) -> Self {
        HeapMemoryFile {
            id,
            limit,
            inner: Mutex::new(HeapInner {
                next: 0,
                free: BTreeMap::new(),
                outstanding: BTreeMap::new(),
                releases: 0,
                bad_releases: 0,
            }),
        }
    }

    /// Bytes currently reserved.
    pub fn usage(&self) -> u64 {
        let inner = self.inner.lock();
        inner.outstanding.iter().map(|(start, end)| end - start).sum()
    }

    pub fn outstanding(&self) -> Vec<FileRange> {
        let inner = self.inner.lock();
        inner
            .outstanding
            .iter()
            .map(|(&start, &end)| FileRange { start, end })
            .collect()
    }

    /// Successful releases so far.
    pub fn releases(&self) -> u64 {
        self.inner.lock().releases
    }

    /// Releases of ranges that were not reserved (double frees).
    pub fn bad_releases(&self) -> u64 {
        self.inner.lock().bad_releases
    }

    pub fn save_state(&self) -> HeapState {
        let inner = self.inner.lock();
        let to_ranges = |map: &BTreeMap<u64, u64>| -> Vec<FileRange> {
            map.iter()
                .map(|(&start, &end)| FileRange { start, end })
                .collect()
        };
        HeapState {
            id: self.id,
            limit: self.limit,
            next: inner.next,
            free: to_ranges(&inner.free),
            outstanding: to_ranges(&inner.outstanding),
        }
    }

    pub fn from_state(state: HeapState) -> Self {
        let from_ranges = |ranges: Vec<FileRange>| -> BTreeMap<u64, u64> {
            ranges.into_iter().map(|r| (r.start, r.end)).collect()
        };
        HeapMemoryFile {
            id: state.id,
            limit: state.limit,
            inner: Mutex::new(HeapInner {
                next: state.next,
                free: from_ranges(state.free),
                outstanding: from_ranges(state.outstanding),
                releases: 0,
                bad_releases: 0,
            }),
        }
    }
}

impl MemoryFile for HeapMemoryFile {
    fn id(&self) -> MemoryFileId {
        self.id
    }

    fn reserve(&self, len: u64) -> io::Result<FileRange> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length reservation"));
        }
        let mut inner = self.inner.lock();

        let fit = inner
            .free
            .iter()
            .find(|(start, end)| *end - *start >= len)
            .map(|(&start, &end)| (start, end));

        let range = if let Some((start, end)) = fit {
            inner.free.remove(&start);
            if end - start > len {
                inner.free.insert(start + len, end);
            }
            FileRange { start, end: start + len }
        } else {
            let end = inner
                .next
                .checked_add(len)
                .filter(|&end| end <= self.limit)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        format!("memory file {} exhausted: {} of {} bytes in use", self.id.0, inner.next, self.limit),
                    )
                })?;
            let range = FileRange { start: inner.next, end };
            inner.next = end;
            range
        };

        inner.outstanding.insert(range.start, range.end);
        debug!(start = range.start, end = range.end, "reserved range");
        Ok(range)
    }

    fn release(&self, range: FileRange) {
        let mut inner = self.inner.lock();
        if inner.outstanding.get(&range.start) != Some(&range.end) {
            inner.bad_releases += 1;
            error!(start = range.start, end = range.end, "release of unreserved range");
            return;
        }
        inner.outstanding.remove(&range.start);
        inner.releases += 1;

        let mut start = range.start;
        let mut end = range.end;
        if let Some((&prev_start, &prev_end)) = inner.free.range(..start).next_back() {
            if prev_end == start {
                inner.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = inner.free.remove(&end) {
            end = next_end;
        }
        if end == inner.next {
            inner.next = start;
        } else {
            inner.free.insert(start, end);
        }
        debug!(start = range.start, end = range.end, "released range");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_reuse() {
        let mf = HeapMemoryFile::new(MemoryFileId(1), 16 * 4096);
        let a = mf.reserve(4096).unwrap();
        let b = mf.reserve(8192).unwrap();
        assert_eq!(a, FileRange { start: 0, end: 4096 });
        assert_eq!(b, FileRange { start: 4096, end: 12288 });

        mf.release(a);
        let c = mf.reserve(4096).unwrap();
        assert_eq!(c, a, "freed range should be reused first-fit");
        assert_eq!(mf.usage(), 12288);
    }

    #[test]
    fn test_limit() {
        let mf = HeapMemoryFile::new(MemoryFileId(1), 8192);
        mf.reserve(8192).unwrap();
        let err = mf.reserve(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_double_release_is_counted() {
        let mf = HeapMemoryFile::new(MemoryFileId(1), 8192);
        let a = mf.reserve(4096).unwrap();
        mf.release(a);
        mf.release(a);
        assert_eq!(mf.releases(), 1);
        assert_eq!(mf.bad_releases(), 1);
    }

    #[test]
    fn test_coalescing_returns_tail() {
        let mf = HeapMemoryFile::new(MemoryFileId(1), 3 * 4096);
        let a = mf.reserve(4096).unwrap();
        let b = mf.reserve(4096).unwrap();
        let c = mf.reserve(4096).unwrap();
        mf.release(a);
        mf.release(c);
        mf.release(b);
        assert_eq!(mf.usage(), 0);
        assert_eq!(mf.reserve(3 * 4096).unwrap(), FileRange { start: 0, end: 3 * 4096 });
    }

    #[test]
    fn test_state_round_trip() {
        let mf = HeapMemoryFile::new(MemoryFileId(7), 4 * 4096);
        let a = mf.reserve(4096).unwrap();
        let _b = mf.reserve(4096).unwrap();
        mf.release(a);

        let restored = HeapMemoryFile::from_state(mf.save_state());
        assert_eq!(restored.id(), MemoryFileId(7));
        assert_eq!(restored.outstanding(), mf.outstanding());
        assert_eq!(restored.reserve(4096).unwrap(), a);
    }
}
