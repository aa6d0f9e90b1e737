//! The cache manager.
//!
//! [`BasicCache`] coordinates restore → placement → inventory update. It
//! implements [`Placement`], the narrow capability the background workers
//! receive; nothing ever hands a worker the manager itself. Naming and
//! volume preferences are injected policies ([`policy`]), and space is
//! freed through the [`planner::DeletionPlanner`].

pub mod planner;
pub mod policy;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pdrcache_core::{AipId, IdError, ObjectMetadata};

use crate::inventory::{
    CacheObject, InventoryError, InventoryMutator, InventoryReader as _, VolumeStatus,
};
use crate::restore::{RestoreError, Restorer};
use crate::volume::{VolumeError, VolumeHandle, VolumeRegistry};
use crate::workers::cacher::{CacheQueue, QueueError};

pub use planner::DeletionPlanner;
pub use policy::{
    roles, DefaultNaming, DefaultPreferences, NamingPolicy, PreferencePolicy,
};

/// Errors surfaced by cache-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("object does not exist in long-term storage: {id}")]
    NotFound { id: String },
    #[error("{id} names a whole dataset; use cache_dataset")]
    NotAFile { id: String },
    #[error("no volume can accommodate {needed} bytes")]
    NoVolumeAvailable { needed: i64 },
    #[error("volume {volume} cannot free {needed} bytes ({available} purgeable)")]
    InsufficientSpace {
        volume: String,
        needed: i64,
        available: i64,
    },
    #[error("all copies of {id} are on metadata-only volumes")]
    MetadataOnly { id: String },
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Restore(RestoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn map_restore(err: RestoreError, id: &str) -> CacheError {
    match err {
        RestoreError::NotFound { .. } => CacheError::NotFound { id: id.to_string() },
        other => CacheError::Restore(other),
    }
}

/// The cache-manager capability background workers receive.
#[async_trait]
pub trait Placement: Send + Sync {
    /// Ensures at least one live copy of `id` exists and returns its
    /// descriptor. An existing copy short-circuits unless `recache`.
    async fn cache(&self, id: &str, recache: bool, prefs: u32)
        -> Result<CacheObject, CacheError>;

    /// Caches every file of a dataset; returns the names written by this
    /// call.
    async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> Result<BTreeSet<String>, CacheError>;

    /// Whether any live copy of `id` exists.
    async fn is_cached(&self, id: &str) -> Result<bool, CacheError>;

    /// Removes all live copies of `id`.
    async fn uncache(&self, id: &str) -> Result<(), CacheError>;
}

/// Coordinates restoration, placement, and inventory updates.
pub struct BasicCache {
    inventory: Arc<dyn InventoryMutator>,
    volumes: Arc<VolumeRegistry>,
    restorer: Arc<dyn Restorer>,
    queue: Arc<CacheQueue>,
    naming: Arc<dyn NamingPolicy>,
    preferences: Arc<dyn PreferencePolicy>,
    planner: DeletionPlanner,
    restore_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BasicCache {
    #[must_use]
    pub fn new(
        inventory: Arc<dyn InventoryMutator>,
        volumes: Arc<VolumeRegistry>,
        restorer: Arc<dyn Restorer>,
        queue: Arc<CacheQueue>,
    ) -> Self {
        Self {
            planner: DeletionPlanner::new(inventory.clone()),
            inventory,
            volumes,
            restorer,
            queue,
            naming: Arc::new(DefaultNaming),
            preferences: Arc::new(DefaultPreferences::default()),
            restore_locks: DashMap::new(),
        }
    }

    /// Replaces the naming policy.
    #[must_use]
    pub fn with_naming(mut self, naming: Arc<dyn NamingPolicy>) -> Self {
        self.naming = naming;
        self
    }

    /// Replaces the preference policy.
    #[must_use]
    pub fn with_preferences(mut self, preferences: Arc<dyn PreferencePolicy>) -> Self {
        self.preferences = preferences;
        self
    }

    /// The persistent request queue the cacher worker drains.
    #[must_use]
    pub fn queue(&self) -> Arc<CacheQueue> {
        self.queue.clone()
    }

    /// Default volume preferences for an object, per the injected policy.
    #[must_use]
    pub fn default_preferences_for(&self, id: &AipId, size: Option<i64>) -> u32 {
        self.preferences.preferences_for(id, size)
    }

    /// Opens the cached bytes of `id`, caching it first when missing.
    ///
    /// Copies on metadata-only volumes are never streamed; when no
    /// readable copy exists a fresh one is placed first.
    ///
    /// # Errors
    ///
    /// Everything `cache` can raise, plus volume errors opening the bytes.
    pub async fn get_object(
        &self,
        id: &str,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, CacheObject), CacheError> {
        let canonical = AipId::parse(id)?.to_string();
        let rows = self.inventory.find_object(&canonical, None)?;
        let readable = rows.iter().find(|row| {
            self.volumes
                .get(&row.volume)
                .is_some_and(|h| h.status >= VolumeStatus::ForGet)
        });

        let object = match readable {
            Some(row) => row.clone(),
            // Copies exist but none is readable: place a fresh copy
            // rather than stream from a fenced volume.
            None => self.cache_internal(id, !rows.is_empty(), 0, None).await?,
        };

        let handle = self
            .volumes
            .get(&object.volume)
            .ok_or_else(|| VolumeError::Unavailable {
                volume: object.volume.clone(),
            })?;
        if handle.status < VolumeStatus::ForGet {
            return Err(CacheError::MetadataOnly { id: canonical });
        }
        let reader = handle.volume.open(&object.name).await?;
        Ok((reader, object))
    }

    /// Non-blocking caching heuristic.
    ///
    /// Enqueues the whole dataset when none of it is cached, just the
    /// named file when it alone is missing, and nothing otherwise.
    ///
    /// # Errors
    ///
    /// Fails on inventory or queue trouble; never on a cache miss.
    pub fn optimally_cache(&self, id: &str, _prefs: u32) -> Result<(), CacheError> {
        let parsed = AipId::parse(id)?;
        let summary = self.inventory.summarize_dataset(&parsed.dsid)?;

        if summary.filecount == 0 {
            let dataset_id = AipId::dataset(parsed.dsid.clone())
                .with_version(parsed.version.as_deref())
                .to_string();
            if !self.queue.is_queued(&dataset_id)? {
                debug!(id = dataset_id, "queueing whole dataset");
                self.queue.queue(&dataset_id, false)?;
            }
        } else if !parsed.is_dataset() {
            let canonical = parsed.to_string();
            if self.inventory.find_object(&canonical, None)?.is_empty()
                && !self.queue.is_queued(&canonical)?
            {
                debug!(id = canonical, "queueing single file");
                self.queue.queue(&canonical, false)?;
            }
        }
        Ok(())
    }

    fn live_copy(&self, canonical: &str) -> Result<Option<CacheObject>, CacheError> {
        Ok(self.inventory.find_object(canonical, None)?.into_iter().next())
    }

    /// Placement candidates for the given preferences: update-capable
    /// volumes with a matching role first, the rest as fallback, each
    /// group in priority order.
    fn candidate_volumes(&self, prefs: u32, target: Option<&str>) -> Vec<VolumeHandle> {
        if let Some(name) = target {
            return self
                .volumes
                .get(name)
                .filter(|h| h.status == VolumeStatus::ForUpdate)
                .into_iter()
                .collect();
        }

        let matches = |h: &VolumeHandle| prefs == 0 || h.roles == 0 || (h.roles & prefs) != 0;
        let all = self.volumes.for_update();
        let mut ordered: Vec<VolumeHandle> = all.iter().filter(|h| matches(h)).cloned().collect();
        ordered.extend(all.iter().filter(|h| !matches(h)).cloned());
        ordered
    }

    async fn cache_internal(
        &self,
        id: &str,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> Result<CacheObject, CacheError> {
        let parsed = AipId::parse(id)?;
        if parsed.is_dataset() {
            return Err(CacheError::NotAFile { id: id.to_string() });
        }
        let canonical = parsed.to_string();

        if !recache {
            if let Some(existing) = self.live_copy(&canonical)? {
                return Ok(existing);
            }
        }

        // Per-id single-flight: late arrivals wait here, then observe the
        // winner's inventory row on the re-check below.
        let lock = self
            .restore_locks
            .entry(canonical.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            match (recache, self.live_copy(&canonical)?) {
                (false, Some(existing)) => Ok(existing),
                _ => self.restore_and_place(&parsed, &canonical, prefs, target).await,
            }
        };
        self.restore_locks
            .remove_if(&canonical, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    async fn restore_and_place(
        &self,
        parsed: &AipId,
        canonical: &str,
        prefs: u32,
        target: Option<&str>,
    ) -> Result<CacheObject, CacheError> {
        let manifest = self
            .restorer
            .dataset_members(&parsed.dsid, parsed.version.as_deref())
            .await
            .map_err(|e| map_restore(e, canonical))?;
        let filepath = parsed.filepath.as_deref().unwrap_or("");
        let size = manifest
            .member(filepath)
            .ok_or_else(|| CacheError::NotFound {
                id: canonical.to_string(),
            })?
            .size;

        let prefs = if prefs == 0 {
            self.preferences
                .preferences_for(parsed, (size >= 0).then_some(size))
        } else {
            prefs
        };
        let name = self.naming.name_for(parsed, prefs);
        let needed = size.max(0);

        let mut volume_retry: Option<VolumeError> = None;
        for handle in self.candidate_volumes(prefs, target) {
            let volume_name = handle.volume.name().to_string();
            let used = self.inventory.get_volume_totals(&volume_name)?.totalsize;
            let free = if handle.capacity < 0 {
                i64::MAX
            } else {
                handle.capacity - used
            };

            if free < needed {
                let victims = match self.planner.plan(&volume_name, needed - free) {
                    Ok(victims) => victims,
                    Err(CacheError::InsufficientSpace { .. }) => continue,
                    Err(e) => return Err(e),
                };
                for victim in victims {
                    self.evict(&victim).await?;
                }
            }

            match self
                .restorer
                .restore_object(parsed, handle.volume.clone(), &name)
                .await
            {
                Ok(restored) => {
                    let object =
                        self.inventory
                            .add_object(canonical, &volume_name, &name, &restored.metadata)?;
                    info!(
                        id = canonical,
                        volume = volume_name,
                        size = restored.size,
                        "object cached"
                    );
                    return Ok(object);
                }
                Err(RestoreError::Volume(e)) if volume_retry.is_none() => {
                    // Transient volume trouble gets one retry on an
                    // alternative volume.
                    warn!(
                        id = canonical,
                        volume = volume_name,
                        error = %e,
                        "restore failed on volume; trying an alternative"
                    );
                    volume_retry = Some(e);
                }
                Err(e) => return Err(map_restore(e, canonical)),
            }
        }

        match volume_retry {
            Some(e) => Err(CacheError::Volume(e)),
            None => Err(CacheError::NoVolumeAvailable { needed }),
        }
    }

    async fn evict(&self, victim: &CacheObject) -> Result<(), CacheError> {
        if let Some(handle) = self.volumes.get(&victim.volume) {
            if let Err(e) = handle.volume.remove(&victim.name).await {
                warn!(id = victim.id, error = %e, "could not remove evicted bytes");
            }
        }
        self.inventory.remove_object(&victim.volume, &victim.name)?;
        info!(
            id = victim.id,
            volume = victim.volume,
            size = victim.size,
            "object evicted"
        );
        Ok(())
    }
}

#[async_trait]
impl Placement for BasicCache {
    async fn cache(
        &self,
        id: &str,
        recache: bool,
        prefs: u32,
    ) -> Result<CacheObject, CacheError> {
        self.cache_internal(id, recache, prefs, None).await
    }

    async fn cache_dataset(
        &self,
        dsid: &str,
        version: Option<&str>,
        recache: bool,
        prefs: u32,
        target: Option<&str>,
    ) -> Result<BTreeSet<String>, CacheError> {
        let manifest = self
            .restorer
            .dataset_members(dsid, version)
            .await
            .map_err(|e| map_restore(e, dsid))?;

        let mut written = BTreeSet::new();
        for member in &manifest.members {
            let file_id = AipId {
                dsid: dsid.to_string(),
                filepath: Some(member.filepath.clone()),
                version: version.map(str::to_string),
            }
            .to_string();

            if !recache && !self.inventory.find_object(&file_id, None)?.is_empty() {
                continue;
            }
            match self.cache_internal(&file_id, recache, prefs, target).await {
                Ok(object) => {
                    written.insert(object.name);
                }
                Err(e) => {
                    // One bad member must not sink the rest of the
                    // dataset.
                    warn!(id = file_id, error = %e, "dataset member failed to cache");
                }
            }
        }
        info!(
            dsid,
            version = version.unwrap_or("latest"),
            restored = written.len(),
            of = manifest.members.len(),
            "dataset caching pass complete"
        );
        Ok(written)
    }

    async fn is_cached(&self, id: &str) -> Result<bool, CacheError> {
        let canonical = AipId::parse(id)?.to_string();
        Ok(!self.inventory.find_object(&canonical, None)?.is_empty())
    }

    async fn uncache(&self, id: &str) -> Result<(), CacheError> {
        let canonical = AipId::parse(id)?.to_string();
        for row in self.inventory.find_object(&canonical, None)? {
            if let Some(handle) = self.volumes.get(&row.volume) {
                if let Err(e) = handle.volume.remove(&row.name).await {
                    warn!(id = canonical, error = %e, "could not remove uncached bytes");
                }
            }
            self.inventory.remove_object(&row.volume, &row.name)?;
        }
        debug!(id = canonical, "uncached");
        Ok(())
    }
}

/// Builds the metadata blob for a manual (non-restored) insertion.
///
/// Administrative tooling and tests; normal caching derives its metadata
/// from the restorer.
#[must_use]
pub fn placement_metadata(size: i64, priority: i64) -> ObjectMetadata {
    let mut meta = ObjectMetadata::new();
    meta.set_size(size);
    meta.set_priority(priority);
    meta
}
