//! System V shared memory for a user-space kernel.
//!
//! Each IPC namespace owns a [`Registry`] of [`Shm`] segments. Segments are
//! reference counted: the creation reference plus one per live [`Mapping`].
//! [`snapshot::save`] and [`snapshot::load`] checkpoint and restore a
//! registry together with all its segments.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod memfile;
pub mod namespace;
pub mod refs;
pub mod registry;
pub mod shm;
pub mod snapshot;
pub mod types;

pub use auth::{Credentials, FileOwner, Mode, Pid};
pub use config::Config;
pub use error::{Error, Result};
pub use memfile::{FileRange, HeapMemoryFile, MemoryFile, MemoryFileId};
pub use namespace::{NamespaceId, Namespaces};
pub use registry::Registry;
pub use shm::{Mapping, Shm};
pub use snapshot::RestoreContext;
pub use types::{Key, ShmGet, ShmId, IPC_PRIVATE};
