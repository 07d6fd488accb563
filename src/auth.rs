use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::namespace::NamespaceId;

pub type Pid = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Kuid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Kgid(pub u32);

/// A uid/gid pair, used for both owner and creator of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct FileOwner {
    pub uid: Kuid,
    pub gid: Kgid,
}

/// The nine permission bits of an IPC object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Mode(u16);

impl Mode {
    pub const MASK: u16 = 0o777;

    pub fn from_bits(bits: u32) -> Self {
        Mode((bits as u16) & Self::MASK)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn user(&self) -> Access {
        Access((self.0 >> 6) as u8 & 0o7)
    }

    pub fn group(&self) -> Access {
        Access((self.0 >> 3) as u8 & 0o7)
    }

    pub fn other(&self) -> Access {
        Access(self.0 as u8 & 0o7)
    }
}

/// Requested or granted access, in `rwx` octal layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(0o4);
    pub const WRITE: Access = Access(0o2);
    pub const READ_WRITE: Access = Access(0o6);

    /// Access requested by a `shmget` flag word: any class's bit counts.
    pub fn requested_by(flags: u32) -> Self {
        Access(((flags >> 6) | (flags >> 3) | flags) as u8 & 0o7)
    }

    pub fn contains(&self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Bypass IPC permission checks.
    IpcOwner,
    /// Administer IPC objects owned by others.
    SysAdmin,
}

impl Capability {
    fn bit(self) -> u64 {
        match self {
            Capability::IpcOwner => 1 << 15,
            Capability::SysAdmin => 1 << 21,
        }
    }
}

/// Credentials of the calling task.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub euid: Kuid,
    pub egid: Kgid,
    pub groups: Vec<Kgid>,
    capabilities: u64,
    /// Namespace the capabilities are held in.
    pub namespace: NamespaceId,
}

impl Credentials {
    pub fn new(namespace: NamespaceId, uid: u32, gid: u32) -> Self {
        Credentials {
            euid: Kuid(uid),
            egid: Kgid(gid),
            groups: Vec::new(),
            capabilities: 0,
            namespace,
        }
    }

    /// uid 0 with every capability in `namespace`.
    pub fn root(namespace: NamespaceId) -> Self {
        Credentials::new(namespace, 0, 0)
            .with_capability(Capability::IpcOwner)
            .with_capability(Capability::SysAdmin)
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities |= cap.bit();
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups.extend(groups.into_iter().map(Kgid));
        self
    }

    pub fn owner(&self) -> FileOwner {
        FileOwner { uid: self.euid, gid: self.egid }
    }

    pub fn in_group(&self, gid: Kgid) -> bool {
        self.egid == gid || self.groups.contains(&gid)
    }

    pub fn has_capability_in(&self, cap: Capability, namespace: NamespaceId) -> bool {
        self.namespace == namespace && self.capabilities & cap.bit() != 0
    }
}

/// Whether `creds` is granted `requested` on an object with the given owner,
/// creator and mode inside `namespace`.
pub(crate) fn check_access(
    creds: &Credentials,
    owner: FileOwner,
    creator: FileOwner,
    mode: Mode,
    requested: Access,
    namespace: NamespaceId,
) -> bool {
    let granted = if creds.euid == owner.uid || creds.euid == creator.uid {
        mode.user()
    } else if creds.in_group(owner.gid) || creds.in_group(creator.gid) {
        mode.group()
    } else {
        mode.other()
    };
    granted.contains(requested) || creds.has_capability_in(Capability::IpcOwner, namespace)
}

/// Whether `creds` may change or remove an object it does not necessarily own.
pub(crate) fn may_administer(
    creds: &Credentials,
    owner: FileOwner,
    creator: FileOwner,
    namespace: NamespaceId,
) -> bool {
    creds.euid == owner.uid
        || creds.euid == creator.uid
        || creds.has_capability_in(Capability::SysAdmin, namespace)
}
