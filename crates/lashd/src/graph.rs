//! Graph patch snapshot adapter.
//!
//! The external graph manager (JACK's patchbay in a real deployment) owns
//! the actual port registry and its version counter; this module is a
//! query/cache facade over it. The daemon snapshots a client's patches at
//! save time and reapplies them at restore once the relaunched client shows
//! up with fresh port IDs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

/// A recorded connection between two ports in the audio graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub src_client: Uuid,
    pub src_port: String,
    pub dst_client: Uuid,
    pub dst_port: String,
}

impl Patch {
    pub fn involves(&self, client: Uuid) -> bool {
        self.src_client == client || self.dst_client == client
    }
}

impl std::fmt::Display for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_client, self.src_port, self.dst_client, self.dst_port
        )
    }
}

/// Seam to the external graph manager. Not authoritative here: the manager
/// owns port state and versioning, we only query and replay.
pub trait GraphManager: Send + Sync {
    /// All patches touching the given client, or `None` if the client is
    /// unknown to the graph.
    fn client_patches(&self, client: Uuid) -> Option<Vec<Patch>>;

    /// Ask the manager to establish one connection.
    fn connect(&self, patch: &Patch) -> anyhow::Result<()>;

    /// Monotonic graph version counter.
    fn graph_version(&self) -> u64;
}

/// In-memory graph manager backing tests and standalone runs.
#[derive(Default)]
pub struct InMemoryGraph {
    patches: RwLock<Vec<Patch>>,
    version: AtomicU64,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a patch as if the graph manager reported it.
    pub fn add_patch(&self, patch: Patch) {
        self.patches.write().expect("graph lock poisoned").push(patch);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop everything a client owned (the client went away).
    pub fn clear_client(&self, client: Uuid) {
        let mut patches = self.patches.write().expect("graph lock poisoned");
        let before = patches.len();
        patches.retain(|p| !p.involves(client));
        if patches.len() != before {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl GraphManager for InMemoryGraph {
    fn client_patches(&self, client: Uuid) -> Option<Vec<Patch>> {
        let patches: Vec<Patch> = self
            .patches
            .read()
            .expect("graph lock poisoned")
            .iter()
            .filter(|p| p.involves(client))
            .cloned()
            .collect();
        if patches.is_empty() {
            None
        } else {
            Some(patches)
        }
    }

    fn connect(&self, patch: &Patch) -> anyhow::Result<()> {
        self.add_patch(patch.clone());
        Ok(())
    }

    fn graph_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// Cache facade used when saving and restoring projects.
pub struct PatchSnapshot {
    manager: Arc<dyn GraphManager>,
    cache: RwLock<HashMap<Uuid, Vec<Patch>>>,
}

impl PatchSnapshot {
    pub fn new(manager: Arc<dyn GraphManager>) -> Self {
        Self {
            manager,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current patches for a client. A live answer from the manager
    /// refreshes the cache; when the manager no longer knows the client
    /// (it disconnected), the last snapshot is returned instead.
    pub fn get_client_patches(&self, client: Uuid) -> Option<Vec<Patch>> {
        if let Some(patches) = self.manager.client_patches(client) {
            trace!("snapshot refresh for {client}: {} patches", patches.len());
            self.cache
                .write()
                .expect("snapshot lock poisoned")
                .insert(client, patches.clone());
            return Some(patches);
        }
        self.cache
            .read()
            .expect("snapshot lock poisoned")
            .get(&client)
            .cloned()
    }

    /// Forget a client, returning the patches that were cached for it.
    pub fn remove_client(&self, client: Uuid) -> Vec<Patch> {
        let removed = self
            .cache
            .write()
            .expect("snapshot lock poisoned")
            .remove(&client)
            .unwrap_or_default();
        if !removed.is_empty() {
            debug!("removed {} cached patches for {client}", removed.len());
        }
        removed
    }

    /// Replay saved patches through the manager. Returns how many applied.
    pub fn reapply(&self, patches: &[Patch]) -> usize {
        let mut applied = 0;
        for patch in patches {
            match self.manager.connect(patch) {
                Ok(()) => applied += 1,
                Err(e) => debug!("failed to reapply patch {patch}: {e}"),
            }
        }
        applied
    }

    pub fn graph_version(&self) -> u64 {
        self.manager.graph_version()
    }
}
