//! Periodic snapshots of a store's state to disk.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::Store;

/// A store whose internal state can be serialized and restored.
pub trait PersistentStore: Store {
    fn write(&self, writer: &mut dyn io::Write) -> Result<(), StoreError>;
    fn read_from(&self, reader: &mut dyn io::Read) -> Result<usize, StoreError>;
}

impl PersistentStore for crate::store::MemoryStore {
    fn write(&self, writer: &mut dyn io::Write) -> Result<(), StoreError> {
        crate::store::MemoryStore::write(self, writer)
    }

    fn read_from(&self, reader: &mut dyn io::Read) -> Result<usize, StoreError> {
        crate::store::MemoryStore::read_from(self, reader)
    }
}

/// Handle to a background snapshot loop started by [`persist_every`].
pub struct Persister {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Persister {
    /// Stops the snapshot loop. No further snapshots are written once this
    /// returns.
    pub fn stop(mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.stop_tx.take();
    }
}

/// Snapshots `store` to `path` every `interval` until stopped.
///
/// Each snapshot is written to a temporary file in the target's directory
/// and renamed over the target, so readers only ever observe complete
/// snapshots. Write failures are logged and the loop continues.
pub fn persist_every(
    store: Arc<dyn PersistentStore + Send + Sync>,
    interval: Duration,
    path: impl Into<PathBuf>,
) -> Persister {
    let path = path.into();
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("tracehub-persister".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match snapshot(store.as_ref(), &path) {
                    Ok(()) => debug!(path = %path.display(), "wrote store snapshot"),
                    Err(err) => warn!(path = %path.display(), error = %err, "snapshot failed"),
                },
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .ok();

    Persister {
        stop_tx: Some(stop_tx),
        handle,
    }
}

fn snapshot(store: &(dyn PersistentStore + Send + Sync), path: &Path) -> Result<(), StoreError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut file = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    store.write(&mut file)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| StoreError::Io(err.error))?;
    Ok(())
}
