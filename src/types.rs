use serde::{Serialize, Deserialize};
use bincode::{Encode, Decode};

use crate::auth::{Mode, Pid};
use crate::clock::Timestamp;

pub type ShmId = i32;
pub type Key = i32;

/// Key of a segment reachable only by ID.
pub const IPC_PRIVATE: Key = 0;

// shmget flags
pub const IPC_CREAT: u32 = 0o1000;
pub const IPC_EXCL: u32 = 0o2000;

// shmat flags
pub const SHM_RDONLY: u32 = 0o10000;

/// Set in `IpcPerm::mode` once a segment is marked for destruction.
pub const SHM_DEST: u16 = 0o1000;

/// A `shmget` request, decoded from the key, size and flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmGet {
    pub key: Key,
    pub size: u64,
    pub mode: Mode,
    pub create: bool,
    pub exclusive: bool,
    pub private: bool,
}

impl ShmGet {
    pub fn from_flags(key: Key, size: u64, flags: u32) -> Self {
        ShmGet {
            key,
            size,
            mode: Mode::from_bits(flags),
            create: flags & IPC_CREAT != 0,
            exclusive: flags & IPC_EXCL != 0,
            private: key == IPC_PRIVATE,
        }
    }

    /// `shmget(key, size, IPC_CREAT | mode)`.
    pub fn create(key: Key, size: u64, mode: u32) -> Self {
        Self::from_flags(key, size, IPC_CREAT | mode)
    }

    /// `shmget(key, size, IPC_CREAT | IPC_EXCL | mode)`.
    pub fn create_exclusive(key: Key, size: u64, mode: u32) -> Self {
        Self::from_flags(key, size, IPC_CREAT | IPC_EXCL | mode)
    }

    /// `shmget(key, size, mode)` without creation.
    pub fn lookup(key: Key, size: u64, mode: u32) -> Self {
        Self::from_flags(key, size, mode)
    }
}

/// Arguments of `IPC_SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmSet {
    pub uid: u32,
    pub gid: u32,
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct IpcPerm {
    pub key: Key,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    pub mode: u16,
    pub seq: u16,
}

/// Result of `IPC_STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ShmidDs {
    pub perm: IpcPerm,
    /// Requested size in bytes.
    pub segsz: u64,
    pub atime: Timestamp,
    pub dtime: Timestamp,
    pub ctime: Timestamp,
    pub cpid: Pid,
    pub lpid: Pid,
    pub nattch: u64,
}

/// Result of `IPC_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmParams {
    pub shmmax: u64,
    pub shmmin: u64,
    pub shmmni: u32,
    pub shmseg: u32,
    pub shmall: u64,
}

/// Result of `SHM_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmInfo {
    pub used_ids: u32,
    /// Pages allocated to all segments.
    pub shm_tot: u64,
    pub shm_rss: u64,
    pub shm_swp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shmget_flags() {
        let req = ShmGet::from_flags(42, 1000, IPC_CREAT | IPC_EXCL | 0o640);
        assert!(req.create);
        assert!(req.exclusive);
        assert!(!req.private);
        assert_eq!(req.mode.bits(), 0o640);

        let req = ShmGet::lookup(IPC_PRIVATE, 1, 0);
        assert!(req.private);
        assert!(!req.create);
    }
}
