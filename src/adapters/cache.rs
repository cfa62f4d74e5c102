//! Bounded adapter cache.
//!
//! Maps adapter ids to resident handles, at most `max_loaded` at a time. Each
//! entry carries a reference count raised by [`AdapterCache::ensure_loaded`]
//! and lowered when the returned [`AdapterLease`] drops. Eviction picks the
//! least-recently-used entry whose count is zero; an adapter in use by an
//! in-flight batch is never chosen.
//!
//! Residency bookkeeping sits behind a short synchronous lock. Loads are
//! additionally serialised by an async lock so two callers racing on the same
//! id attach it once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::inference::{Engine, EngineError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("adapter {adapter_id} not found at {}", path.display())]
    NotFound { adapter_id: String, path: PathBuf },

    #[error("invalid adapter id {0:?}")]
    InvalidId(String),

    #[error("all {max_loaded} resident adapters are referenced by in-flight batches")]
    AllPinned { max_loaded: usize },

    #[error("failed to load adapter {adapter_id}: {source}")]
    Load {
        adapter_id: String,
        source: EngineError,
    },
}

/// A resident adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    pub adapter_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Resident { refcount: usize },
    /// Chosen as a victim; detaching from the engine.
    Evicting,
}

#[derive(Debug)]
struct Entry {
    handle: Arc<AdapterHandle>,
    state: Residency,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Residents {
    entries: HashMap<String, Entry>,
    /// Logical clock for recency.
    clock: u64,
}

impl Residents {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Residency snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterStats {
    pub max_loaded: usize,
    pub resident: usize,
    pub referenced: usize,
    /// Least recently used first.
    pub lru_order: Vec<String>,
}

pub struct AdapterCache {
    root: PathBuf,
    max_loaded: usize,
    engine: Arc<dyn Engine>,
    residents: Mutex<Residents>,
    load_lock: tokio::sync::Mutex<()>,
}

impl AdapterCache {
    pub fn new(root: impl Into<PathBuf>, max_loaded: usize, engine: Arc<dyn Engine>) -> Self {
        Self {
            root: root.into(),
            max_loaded: max_loaded.max(1),
            engine,
            residents: Mutex::new(Residents::default()),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn residents(&self) -> MutexGuard<'_, Residents> {
        self.residents.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate `adapter_id` under the root. Existence check only.
    pub async fn resolve_path(&self, adapter_id: &str) -> Result<PathBuf, AdapterError> {
        if adapter_id.is_empty()
            || adapter_id == "."
            || adapter_id == ".."
            || adapter_id.contains(['/', '\\', '\0'])
        {
            return Err(AdapterError::InvalidId(adapter_id.to_string()));
        }

        let path = self.root.join(adapter_id);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(path),
            Ok(false) => Err(AdapterError::NotFound {
                adapter_id: adapter_id.to_string(),
                path,
            }),
            Err(e) => {
                warn!(adapter_id, "Adapter path check failed: {e}");
                Err(AdapterError::NotFound {
                    adapter_id: adapter_id.to_string(),
                    path,
                })
            }
        }
    }

    /// Make `adapter_id` resident and take a reference on it.
    ///
    /// The reference is held until the returned lease drops.
    pub async fn ensure_loaded(
        self: &Arc<Self>,
        adapter_id: &str,
    ) -> Result<AdapterLease, AdapterError> {
        if let Some(lease) = self.try_acquire(adapter_id) {
            return Ok(lease);
        }

        let _load = self.load_lock.lock().await;

        // Another caller may have loaded it while we waited.
        if let Some(lease) = self.try_acquire(adapter_id) {
            return Ok(lease);
        }

        let path = self.resolve_path(adapter_id).await?;

        if let Some(victim) = self.begin_eviction()? {
            if let Err(e) = self.engine.detach_adapter(&victim).await {
                warn!(adapter_id = %victim, "Detach during eviction failed: {e}");
            }
            self.residents().entries.remove(&victim);
            info!(evicted = %victim, incoming = adapter_id, "Adapter evicted");
        }

        self.engine
            .attach_adapter(adapter_id, &path)
            .await
            .map_err(|source| AdapterError::Load {
                adapter_id: adapter_id.to_string(),
                source,
            })?;

        let handle = Arc::new(AdapterHandle {
            adapter_id: adapter_id.to_string(),
            path,
        });
        {
            let mut residents = self.residents();
            let last_used = residents.tick();
            residents.entries.insert(
                adapter_id.to_string(),
                Entry {
                    handle: Arc::clone(&handle),
                    state: Residency::Resident { refcount: 1 },
                    last_used,
                },
            );
        }

        info!(adapter_id, path = %handle.path.display(), "Adapter loaded");
        Ok(AdapterLease {
            cache: Arc::clone(self),
            handle,
        })
    }

    /// Promote and reference an already-resident adapter.
    fn try_acquire(self: &Arc<Self>, adapter_id: &str) -> Option<AdapterLease> {
        let mut residents = self.residents();
        let now = residents.tick();
        let entry = residents.entries.get_mut(adapter_id)?;
        match &mut entry.state {
            Residency::Resident { refcount } => {
                *refcount += 1;
                entry.last_used = now;
                debug!(adapter_id, refcount = *refcount, "Adapter cache hit");
                Some(AdapterLease {
                    cache: Arc::clone(self),
                    handle: Arc::clone(&entry.handle),
                })
            }
            Residency::Evicting => None,
        }
    }

    /// Pick and mark a victim if the cache is full.
    fn begin_eviction(&self) -> Result<Option<String>, AdapterError> {
        let mut residents = self.residents();
        if residents.entries.len() < self.max_loaded {
            return Ok(None);
        }

        let victim = residents
            .entries
            .iter()
            .filter(|(_, e)| e.state == Residency::Resident { refcount: 0 })
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| id.clone())
            .ok_or(AdapterError::AllPinned {
                max_loaded: self.max_loaded,
            })?;

        if let Some(entry) = residents.entries.get_mut(&victim) {
            entry.state = Residency::Evicting;
        }
        Ok(Some(victim))
    }

    /// Drop one reference on `adapter_id`.
    pub fn release(&self, adapter_id: &str) {
        let mut residents = self.residents();
        match residents.entries.get_mut(adapter_id).map(|e| &mut e.state) {
            Some(Residency::Resident { refcount }) if *refcount > 0 => {
                *refcount -= 1;
                debug!(adapter_id, refcount = *refcount, "Adapter reference released");
            }
            _ => warn!(adapter_id, "Release of unreferenced adapter ignored"),
        }
    }

    /// Detach every unreferenced adapter from the engine.
    pub async fn unload_idle(&self) -> usize {
        let _load = self.load_lock.lock().await;
        let idle: Vec<String> = {
            let mut residents = self.residents();
            let ids: Vec<String> = residents
                .entries
                .iter()
                .filter(|(_, e)| e.state == Residency::Resident { refcount: 0 })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(entry) = residents.entries.get_mut(id) {
                    entry.state = Residency::Evicting;
                }
            }
            ids
        };

        for id in &idle {
            if let Err(e) = self.engine.detach_adapter(id).await {
                warn!(adapter_id = %id, "Detach failed: {e}");
            }
            self.residents().entries.remove(id);
        }
        idle.len()
    }

    pub fn is_resident(&self, adapter_id: &str) -> bool {
        self.residents().entries.contains_key(adapter_id)
    }

    pub fn refcount(&self, adapter_id: &str) -> Option<usize> {
        match self.residents().entries.get(adapter_id)?.state {
            Residency::Resident { refcount } => Some(refcount),
            Residency::Evicting => Some(0),
        }
    }

    pub fn len(&self) -> usize {
        self.residents().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_loaded(&self) -> usize {
        self.max_loaded
    }

    pub fn stats(&self) -> AdapterStats {
        let residents = self.residents();
        let mut order: Vec<(&String, u64)> = residents
            .entries
            .iter()
            .map(|(id, e)| (id, e.last_used))
            .collect();
        order.sort_by_key(|(_, t)| *t);

        AdapterStats {
            max_loaded: self.max_loaded,
            resident: residents.entries.len(),
            referenced: residents
                .entries
                .values()
                .filter(|e| matches!(e.state, Residency::Resident { refcount } if refcount > 0))
                .count(),
            lru_order: order.into_iter().map(|(id, _)| id.clone()).collect(),
        }
    }
}

/// A counted reference on a resident adapter. Dropping it releases the reference.
#[derive(Debug)]
pub struct AdapterLease {
    cache: Arc<AdapterCache>,
    handle: Arc<AdapterHandle>,
}

impl AdapterLease {
    pub fn adapter_id(&self) -> &str {
        &self.handle.adapter_id
    }

    pub fn handle(&self) -> &AdapterHandle {
        &self.handle
    }
}

impl Drop for AdapterLease {
    fn drop(&mut self) {
        self.cache.release(&self.handle.adapter_id);
    }
}

impl std::fmt::Debug for AdapterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCache")
            .field("root", &self.root)
            .field("max_loaded", &self.max_loaded)
            .finish_non_exhaustive()
    }
}
