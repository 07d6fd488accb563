//! A single shared memory segment.
//!
//! Lifecycle: `Active` until marked for destruction, then `PendingDestruction`
//! until the last mapping goes away, then `Destroyed`. The creation reference
//! held in [`Refs`] keeps an unattached segment alive; marking drops it, and
//! whichever call takes the count to zero removes the segment from its
//! registry and releases its file range.
//!
//! Lock order: registry before segment.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::auth::{self, Access, Credentials, FileOwner, Kgid, Kuid, Mode, Pid};
use crate::clock::{Clock, Timestamp};
use crate::error::{Error, Result};
use crate::memfile::{FileRange, MemoryFile};
use crate::namespace::NamespaceId;
use crate::refs::Refs;
use crate::registry::Registry;
use crate::types::{IpcPerm, Key, SHM_DEST, ShmGet, ShmId, ShmSet, ShmidDs};

/// Mutable segment metadata, guarded by the segment lock.
#[derive(Debug, Clone)]
pub(crate) struct ShmInner {
    pub(crate) key: Key,
    pub(crate) perms: Mode,
    pub(crate) owner: FileOwner,
    pub(crate) attach_time: Timestamp,
    pub(crate) detach_time: Timestamp,
    pub(crate) change_time: Timestamp,
    pub(crate) creator_pid: Pid,
    pub(crate) last_attach_detach_pid: Pid,
    pub(crate) pending_destruction: bool,
    /// Live mappings, reported as `shm_nattch`.
    pub(crate) attach_count: u64,
    /// Mappings restored from a snapshot that no address space has claimed.
    pub(crate) unclaimed: u64,
    pub(crate) destroyed: bool,
}

pub struct Shm {
    pub(crate) refs: Refs,
    pub(crate) id: ShmId,
    pub(crate) creator: FileOwner,
    pub(crate) size: u64,
    pub(crate) effective_size: u64,
    pub(crate) file_range: FileRange,
    pub(crate) namespace: NamespaceId,
    pub(crate) mf: Arc<dyn MemoryFile>,
    pub(crate) registry: Weak<Registry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) inner: Mutex<ShmInner>,
}

impl Shm {
    pub fn id(&self) -> ShmId {
        self.id
    }

    pub fn key(&self) -> Key {
        self.inner.lock().key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn effective_size(&self) -> u64 {
        self.effective_size
    }

    pub fn file_range(&self) -> FileRange {
        self.file_range
    }

    pub fn creator(&self) -> FileOwner {
        self.creator
    }

    pub fn owner(&self) -> FileOwner {
        self.inner.lock().owner
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().perms
    }

    pub fn attach_count(&self) -> u64 {
        self.inner.lock().attach_count
    }

    pub fn read_refs(&self) -> i64 {
        self.refs.read_refs()
    }

    pub fn is_pending_destruction(&self) -> bool {
        self.inner.lock().pending_destruction
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Validate a `shmget` that found this segment by key.
    pub(crate) fn check_reattach(&self, creds: &Credentials, req: &ShmGet, strict_size: bool) -> Result<()> {
        let inner = self.inner.lock();
        let requested = Access::requested_by(req.mode.bits() as u32);
        if !auth::check_access(creds, inner.owner, self.creator, inner.perms, requested, self.namespace) {
            debug!(id = self.id, key = inner.key, "reattach denied");
            return Err(Error::PermissionDenied);
        }
        if req.size > self.size || (strict_size && req.size != 0 && req.size != self.size) {
            debug!(id = self.id, requested = req.size, size = self.size, "reattach size mismatch");
            return Err(Error::InvalidSize);
        }
        Ok(())
    }

    /// Map the segment into the caller's address space.
    ///
    /// The returned [`Mapping`] holds a reference until it is detached or
    /// dropped.
    pub fn attach(self: &Arc<Self>, creds: &Credentials, pid: Pid, read_only: bool) -> Result<Mapping> {
        let mut inner = self.inner.lock();
        if inner.pending_destruction || inner.destroyed {
            debug!(id = self.id, "attach to segment pending destruction");
            return Err(Error::NotFound);
        }
        let access = if read_only { Access::READ } else { Access::READ_WRITE };
        if !auth::check_access(creds, inner.owner, self.creator, inner.perms, access, self.namespace) {
            return Err(Error::PermissionDenied);
        }

        // The creation reference is still held, so the count is positive.
        self.refs.inc_ref();
        inner.attach_count += 1;
        inner.attach_time = self.clock.now();
        inner.last_attach_detach_pid = pid;
        debug!(id = self.id, pid, nattch = inner.attach_count, "attached");

        Ok(Mapping {
            shm: Arc::clone(self),
            pid,
            read_only,
            live: true,
        })
    }

    fn release_mapping(&self, pid: Pid) {
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.attach_count > 0);
            inner.attach_count = inner.attach_count.saturating_sub(1);
            inner.detach_time = self.clock.now();
            inner.last_attach_detach_pid = pid;
            debug!(id = self.id, pid, nattch = inner.attach_count, "detached");
        }
        self.dec_ref();
    }

    /// Hand out a guard for a mapping that was live when the snapshot was
    /// taken. The reference it stands for was restored with the segment.
    pub fn reclaim_mapping(self: &Arc<Self>, pid: Pid, read_only: bool) -> Result<Mapping> {
        let mut inner = self.inner.lock();
        if inner.unclaimed == 0 {
            return Err(Error::CorruptState(format!(
                "segment {} has no unclaimed restored mapping",
                self.id
            )));
        }
        inner.unclaimed -= 1;
        Ok(Mapping {
            shm: Arc::clone(self),
            pid,
            read_only,
            live: true,
        })
    }

    /// `IPC_RMID`: bar new attaches and destroy once the last mapping is gone.
    pub fn mark_destroyed(&self, creds: &Credentials) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.destroyed {
                return Err(Error::NotFound);
            }
            if !auth::may_administer(creds, inner.owner, self.creator, self.namespace) {
                return Err(Error::PermissionDenied);
            }
        }
        self.mark_destroyed_unchecked();
        Ok(())
    }

    pub(crate) fn mark_destroyed_unchecked(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.dissociate_key(self);
        }

        let drop_creation_ref = {
            let mut inner = self.inner.lock();
            if inner.pending_destruction {
                false
            } else {
                inner.pending_destruction = true;
                info!(id = self.id, nattch = inner.attach_count, "segment marked for destruction");
                true
            }
        };

        if drop_creation_ref {
            self.dec_ref();
        }
    }

    fn dec_ref(&self) {
        if self.refs.dec_ref() {
            self.destroy();
        }
    }

    /// Runs once, on the zero edge of `refs`.
    fn destroy(&self) {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self),
            None => self.inner.lock().destroyed = true,
        }
        self.mf.release(self.file_range);
        info!(id = self.id, start = self.file_range.start, len = self.effective_size, "segment destroyed");
    }

    /// `IPC_STAT`.
    pub fn stat(&self, creds: &Credentials) -> Result<ShmidDs> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::NotFound);
        }
        if !auth::check_access(creds, inner.owner, self.creator, inner.perms, Access::READ, self.namespace) {
            return Err(Error::PermissionDenied);
        }

        let mut mode = inner.perms.bits();
        if inner.pending_destruction {
            mode |= SHM_DEST;
        }
        Ok(ShmidDs {
            perm: IpcPerm {
                key: inner.key,
                uid: inner.owner.uid.0,
                gid: inner.owner.gid.0,
                cuid: self.creator.uid.0,
                cgid: self.creator.gid.0,
                mode,
                seq: 0,
            },
            segsz: self.size,
            atime: inner.attach_time,
            dtime: inner.detach_time,
            ctime: inner.change_time,
            cpid: inner.creator_pid,
            lpid: inner.last_attach_detach_pid,
            nattch: inner.attach_count,
        })
    }

    /// `IPC_SET`: new owner and permission bits in one step.
    pub fn set(&self, creds: &Credentials, ds: &ShmSet) -> Result<()> {
        self.modify(creds, |inner| {
            inner.owner = FileOwner { uid: Kuid(ds.uid), gid: Kgid(ds.gid) };
            inner.perms = ds.mode;
        })
    }

    pub fn set_permissions(&self, creds: &Credentials, mode: Mode) -> Result<()> {
        self.modify(creds, |inner| inner.perms = mode)
    }

    pub fn change_owner(&self, creds: &Credentials, owner: FileOwner) -> Result<()> {
        self.modify(creds, |inner| inner.owner = owner)
    }

    fn modify(&self, creds: &Credentials, f: impl FnOnce(&mut ShmInner)) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::NotFound);
        }
        if !auth::may_administer(creds, inner.owner, self.creator, self.namespace) {
            return Err(Error::PermissionDenied);
        }
        f(&mut inner);
        inner.change_time = self.clock.now();
        debug!(id = self.id, mode = inner.perms.bits(), uid = inner.owner.uid.0, "segment changed");
        Ok(())
    }
}

impl fmt::Debug for Shm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shm")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("effective_size", &self.effective_size)
            .field("file_range", &self.file_range)
            .field("refs", &self.refs.read_refs())
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

/// One process's mapping of a segment.
///
/// Dropping a mapping detaches it on behalf of the process that attached.
pub struct Mapping {
    shm: Arc<Shm>,
    pid: Pid,
    read_only: bool,
    live: bool,
}

impl Mapping {
    pub fn shm(&self) -> &Arc<Shm> {
        &self.shm
    }

    pub fn file_range(&self) -> FileRange {
        self.shm.file_range
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Process that created the mapping.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Detach on behalf of `pid`, which may differ from the attaching process
    /// after a fork.
    pub fn detach(mut self, pid: Pid) {
        self.live = false;
        self.shm.release_mapping(pid);
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.live {
            self.live = false;
            self.shm.release_mapping(self.pid);
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.shm.id)
            .field("pid", &self.pid)
            .field("read_only", &self.read_only)
            .finish()
    }
}
