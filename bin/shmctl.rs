use std::path::{Path, PathBuf};
use std::sync::Arc;

use shmns::clock::{Clock, SystemClock};
use shmns::memfile::HeapState;
use shmns::snapshot::{self, RestoreContext};
use shmns::{Config, Credentials, HeapMemoryFile, MemoryFileId, Namespaces, ShmGet, IPC_PRIVATE};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MEMORY_FILE_BYTES: u64 = 1 << 28;

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_args();
    let path = std::env::var_os("SHMCTL_SNAPSHOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shm.snapshot"));

    if let Err(e) = run(config, &path) {
        error!(error = %e, "checkpoint round trip failed");
        std::process::exit(1);
    }
}

/// Populate a namespace, checkpoint it to `path`, and restore it.
fn run(config: Config, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mf = Arc::new(HeapMemoryFile::new(MemoryFileId(1), MEMORY_FILE_BYTES));
    let namespaces = Namespaces::new(config.clone(), mf.clone(), Arc::clone(&clock));

    let registry = namespaces.create();
    let root = Credentials::root(registry.namespace());

    let shared = registry.find_or_create(&root, 1, &ShmGet::create(0x5eed, 1000, 0o600))?;
    let mapping = shared.attach(&root, 1, false)?;
    let scratch = registry.find_or_create(&root, 1, &ShmGet::create(IPC_PRIVATE, 3 * config.page_size(), 0o600))?;
    let draining = registry.find_or_create(&root, 2, &ShmGet::create(0x7a11, 1, 0o644))?;
    let reader = draining.attach(&root, 2, true)?;
    registry.mark_destroyed(&root, draining.id())?;
    info!(info = ?registry.shm_info(), "namespace populated");

    let bytes = snapshot::save(&registry)?;
    let heap = bincode::encode_to_vec(mf.save_state(), bincode::config::standard())?;
    std::fs::write(path, &bytes)?;
    let heap_path = path.with_extension("mf");
    std::fs::write(&heap_path, &heap)?;
    info!(path = %path.display(), bytes = bytes.len(), "checkpoint written");

    let data = std::fs::read(path)?;
    let (state, _): (HeapState, usize) =
        bincode::decode_from_slice(&std::fs::read(&heap_path)?, bincode::config::standard())?;
    let restored_mf = Arc::new(HeapMemoryFile::from_state(state));
    let ctx = RestoreContext::new(config.clone(), restored_mf.clone(), Arc::clone(&clock))
        .with_attached(shared.id(), 1)
        .with_attached(draining.id(), 1);
    let restored = snapshot::load(&data, &ctx)?;
    let restored_namespaces = Namespaces::new(config, restored_mf.clone(), clock);
    restored_namespaces.insert_restored(Arc::clone(&restored))?;
    info!(info = ?restored.shm_info(), "checkpoint restored");

    let restored_mapping = restored.find_by_id(shared.id())?.reclaim_mapping(1, false)?;
    let restored_reader = restored.find_by_id(draining.id())?.reclaim_mapping(2, true)?;
    restored_reader.detach(2);
    restored_mapping.detach(1);
    restored.mark_destroyed(&Credentials::root(restored.namespace()), scratch.id())?;
    info!(
        info = ?restored.shm_info(),
        usage = restored_mf.usage(),
        "restored namespace after detaching"
    );

    restored_namespaces.destroy(restored.namespace())?;
    info!(usage = restored_mf.usage(), "restored namespace destroyed");

    reader.detach(2);
    mapping.detach(1);
    namespaces.destroy(registry.namespace())?;
    Ok(())
}
