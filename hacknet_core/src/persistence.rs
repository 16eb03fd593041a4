//! World persistence.
//!
//! The tick driver calls [`Persistence::sync`] with a batch of snapshots at
//! a fixed interval and once more on shutdown. Snapshots hold simulated time
//! and the systems (filesystems, accounts); live processes are never stored.

use crate::error::PersistError;
use crate::lock;
use crate::system::VirtualSystem;

use hacknet_env::WorldId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Persistent state of one World.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub id: WorldId,
    pub name: String,
    pub time: f64,
    pub systems: Vec<VirtualSystem>,
}

/// Storage backend for World snapshots.
pub trait Persistence: Send + Sync {
    /// Writes every snapshot in one batch.
    fn sync(&self, snapshots: &[WorldSnapshot]) -> Result<(), PersistError>;

    /// Loads the last synced snapshot of `world`, if any.
    fn load(&self, world: WorldId) -> Result<Option<WorldSnapshot>, PersistError>;
}

fn world_key(world: WorldId) -> String {
    format!("world/{}", world.0)
}

/// Sled-based persistent store.
///
/// Snapshots are stored as JSON under `world/<id>`.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let db = sled::open(path).map_err(|e| PersistError::StorageError(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store, deleted on drop
    pub fn temporary() -> Result<Self, PersistError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| PersistError::StorageError(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Ids of every stored World.
    pub fn worlds(&self) -> Result<Vec<WorldId>, PersistError> {
        let mut ids = Vec::new();
        for result in self.db.scan_prefix("world/") {
            let (key, _) = result.map_err(|e| PersistError::StorageError(format!("Iteration failed: {}", e)))?;
            let id = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.strip_prefix("world/"))
                .and_then(|n| n.parse().ok());
            if let Some(id) = id {
                ids.push(WorldId(id));
            }
        }
        Ok(ids)
    }
}

impl Persistence for SledStore {
    fn sync(&self, snapshots: &[WorldSnapshot]) -> Result<(), PersistError> {
        let mut batch = sled::Batch::default();
        for snapshot in snapshots {
            let value = serde_json::to_vec(snapshot)?;
            batch.insert(world_key(snapshot.id).as_bytes(), value);
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| PersistError::StorageError(format!("Batch failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| PersistError::StorageError(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn load(&self, world: WorldId) -> Result<Option<WorldSnapshot>, PersistError> {
        let value = self
            .db
            .get(world_key(world))
            .map_err(|e| PersistError::StorageError(format!("Read failed: {}", e)))?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// In-memory store for tests, with injectable failures.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<BTreeMap<WorldId, WorldSnapshot>>,
    syncs: AtomicUsize,
    failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` syncs fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful syncs.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl Persistence for MemoryStore {
    fn sync(&self, snapshots: &[WorldSnapshot]) -> Result<(), PersistError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::StorageError("injected failure".to_string()));
        }

        let mut stored = lock(&self.snapshots);
        for snapshot in snapshots {
            stored.insert(snapshot.id, snapshot.clone());
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, world: WorldId) -> Result<Option<WorldSnapshot>, PersistError> {
        Ok(lock(&self.snapshots).get(&world).cloned())
    }
}
