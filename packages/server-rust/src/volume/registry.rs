//! Registry of live cache volumes.
//!
//! Pairs each [`CacheVolume`] handle with the status and role bits the
//! placement and integrity layers filter on. Registration also upserts
//! the volume into the inventory so the two views cannot drift apart.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use pdrcache_core::ObjectMetadata;

use crate::inventory::{InventoryError, InventoryMutator, InventoryReader, VolumeStatus};

use super::CacheVolume;

/// A registered volume together with its placement attributes.
#[derive(Clone)]
pub struct VolumeHandle {
    pub volume: Arc<dyn CacheVolume>,
    pub status: VolumeStatus,
    /// Role bitmask restricting what content this volume may hold.
    pub roles: u32,
    /// Capacity in bytes; -1 when unlimited/unknown.
    pub capacity: i64,
    /// Placement priority among eligible volumes; lower fills first.
    pub priority: i64,
}

impl VolumeHandle {
    /// Whether this volume advertises all of the given role bits, or the
    /// caller asked for none.
    #[must_use]
    pub fn has_roles(&self, wanted: u32) -> bool {
        wanted == 0 || (self.roles & wanted) == wanted
    }
}

/// Name → handle map for every volume the cache may touch.
pub struct VolumeRegistry {
    inventory: Arc<dyn InventoryMutator>,
    entries: RwLock<BTreeMap<String, VolumeHandle>>,
}

impl VolumeRegistry {
    #[must_use]
    pub fn new(inventory: Arc<dyn InventoryMutator>) -> Self {
        Self {
            inventory,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers a volume for use, upserting it into the inventory.
    ///
    /// The metadata `priority` key orders the volume among placement
    /// candidates (default 10). A re-registration replaces the handle and
    /// resets the status to [`VolumeStatus::ForUpdate`].
    ///
    /// # Errors
    ///
    /// Fails when the inventory upsert fails.
    pub fn register(
        &self,
        volume: Arc<dyn CacheVolume>,
        capacity: i64,
        roles: u32,
        metadata: &ObjectMetadata,
    ) -> Result<(), InventoryError> {
        self.inventory
            .register_volume(volume.name(), capacity, metadata)?;
        // Re-registration resets a fenced volume to fully usable, on both
        // sides of the bookkeeping.
        self.inventory
            .set_volume_status(volume.name(), VolumeStatus::ForUpdate)?;
        let info = self.inventory.get_volume_info(volume.name())?;

        let handle = VolumeHandle {
            volume: volume.clone(),
            status: VolumeStatus::ForUpdate,
            roles,
            capacity,
            priority: info.priority,
        };
        self.entries
            .write()
            .insert(volume.name().to_string(), handle);
        Ok(())
    }

    /// Changes a volume's status, in the registry and the inventory.
    ///
    /// # Errors
    ///
    /// Fails when the volume is unknown to either side.
    pub fn set_status(&self, name: &str, status: VolumeStatus) -> Result<(), InventoryError> {
        self.inventory.set_volume_status(name, status)?;
        let mut entries = self.entries.write();
        let handle = entries
            .get_mut(name)
            .ok_or_else(|| InventoryError::VolumeNotFound {
                name: name.to_string(),
            })?;
        handle.status = status;
        Ok(())
    }

    /// Handle for one volume, if registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<VolumeHandle> {
        self.entries.read().get(name).cloned()
    }

    /// All registered volume names, in name order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Volumes whose bytes may be read back (status ≥ `ForGet`).
    #[must_use]
    pub fn for_get(&self) -> Vec<VolumeHandle> {
        self.filter_status(VolumeStatus::ForGet)
    }

    /// Volumes that are valid placement targets (status = `ForUpdate`),
    /// ordered by placement priority (lower first), then name.
    #[must_use]
    pub fn for_update(&self) -> Vec<VolumeHandle> {
        let mut handles = self.filter_status(VolumeStatus::ForUpdate);
        handles.sort_by_key(|h| h.priority);
        handles
    }

    fn filter_status(&self, min: VolumeStatus) -> Vec<VolumeHandle> {
        self.entries
            .read()
            .values()
            .filter(|h| h.status >= min)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::inventory::SqliteInventory;
    use crate::volume::MemoryVolume;
    use pdrcache_core::ManualClock;

    use super::*;

    fn setup() -> VolumeRegistry {
        let clock = Arc::new(ManualClock::new(0));
        let inventory = Arc::new(SqliteInventory::in_memory(clock).unwrap());
        VolumeRegistry::new(inventory)
    }

    fn register(registry: &VolumeRegistry, name: &str, priority: i64) {
        let mut meta = ObjectMetadata::new();
        meta.set_priority(priority);
        registry
            .register(Arc::new(MemoryVolume::new(name)), 1_000, 0, &meta)
            .unwrap();
    }

    #[test]
    fn register_makes_volume_visible_both_sides() {
        let registry = setup();
        register(&registry, "fast", 1);

        let handle = registry.get("fast").unwrap();
        assert_eq!(handle.status, VolumeStatus::ForUpdate);
        assert_eq!(handle.priority, 1);
        assert_eq!(registry.names(), vec!["fast"]);
        assert_eq!(registry.inventory.volume_names().unwrap(), vec!["fast"]);
    }

    #[test]
    fn for_update_orders_by_priority() {
        let registry = setup();
        register(&registry, "slow", 10);
        register(&registry, "fast", 1);

        let order: Vec<String> = registry
            .for_update()
            .iter()
            .map(|h| h.volume.name().to_string())
            .collect();
        assert_eq!(order, vec!["fast", "slow"]);
    }

    #[test]
    fn status_fencing_removes_from_predicates() {
        let registry = setup();
        register(&registry, "old", 10);

        registry.set_status("old", VolumeStatus::ForInfo).unwrap();
        assert!(registry.for_update().is_empty());
        assert!(registry.for_get().is_empty());
        assert!(registry.get("old").is_some());

        registry.set_status("old", VolumeStatus::ForGet).unwrap();
        assert_eq!(registry.for_get().len(), 1);
        assert!(registry.for_update().is_empty());
    }

    #[test]
    fn set_status_unknown_volume_fails() {
        let registry = setup();
        assert!(matches!(
            registry.set_status("ghost", VolumeStatus::ForGet),
            Err(InventoryError::VolumeNotFound { .. })
        ));
    }

    #[test]
    fn role_filtering() {
        let handle = VolumeHandle {
            volume: Arc::new(MemoryVolume::new("v")),
            status: VolumeStatus::ForUpdate,
            roles: 0b0110,
            capacity: -1,
            priority: 10,
        };
        assert!(handle.has_roles(0));
        assert!(handle.has_roles(0b0010));
        assert!(handle.has_roles(0b0110));
        assert!(!handle.has_roles(0b1000));
    }
}
