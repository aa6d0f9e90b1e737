//! Deletion planning.
//!
//! Given a volume and a number of bytes that must be freed, the planner
//! asks the inventory for eviction candidates (worst-first: higher
//! priority number, then oldest, then largest) and checks that the set is
//! actually sufficient. It never deletes anything itself; the cache
//! manager evicts the returned victims only after a successful plan.

use std::sync::Arc;

use crate::inventory::{CacheObject, InventoryMutator, InventoryReader as _};

use super::CacheError;

/// Plans which objects to evict from a volume.
pub struct DeletionPlanner {
    inventory: Arc<dyn InventoryMutator>,
}

impl DeletionPlanner {
    #[must_use]
    pub fn new(inventory: Arc<dyn InventoryMutator>) -> Self {
        Self { inventory }
    }

    /// Selects victims on `volume` whose total size covers
    /// `required_bytes`.
    ///
    /// # Errors
    ///
    /// [`CacheError::InsufficientSpace`] when no sufficient victim set
    /// exists; in that case nothing may be deleted.
    pub fn plan(
        &self,
        volume: &str,
        required_bytes: i64,
    ) -> Result<Vec<CacheObject>, CacheError> {
        if required_bytes <= 0 {
            return Ok(Vec::new());
        }

        let victims = self
            .inventory
            .select_objects_to_purge(volume, required_bytes)?;
        let available: i64 = victims.iter().map(|o| o.size.max(0)).sum();
        if available < required_bytes {
            return Err(CacheError::InsufficientSpace {
                volume: volume.to_string(),
                needed: required_bytes,
                available,
            });
        }
        Ok(victims)
    }
}

#[cfg(test)]
mod tests {
    use pdrcache_core::{ManualClock, ObjectMetadata};

    use crate::inventory::SqliteInventory;

    use super::*;

    fn setup() -> (DeletionPlanner, Arc<SqliteInventory>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let inventory = Arc::new(SqliteInventory::in_memory(clock.clone()).unwrap());
        inventory
            .register_volume("cranberry", 100, &ObjectMetadata::new())
            .unwrap();
        (DeletionPlanner::new(inventory.clone()), inventory, clock)
    }

    fn add(inv: &SqliteInventory, id: &str, size: i64, priority: i64) {
        let mut meta = ObjectMetadata::new();
        meta.set_size(size);
        meta.set_priority(priority);
        inv.add_object(id, "cranberry", id, &meta).unwrap();
    }

    #[test]
    fn plans_least_important_first() {
        let (planner, inv, _) = setup();
        add(&inv, "a/big-low.dat", 80, 10);
        add(&inv, "a/small-high.dat", 20, 5);

        let victims = planner.plan("cranberry", 30).unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, "a/big-low.dat");
    }

    #[test]
    fn accumulates_until_sufficient() {
        let (planner, inv, clock) = setup();
        add(&inv, "a/one.dat", 30, 10);
        clock.advance(10);
        add(&inv, "a/two.dat", 30, 10);
        clock.advance(10);
        add(&inv, "a/three.dat", 30, 10);

        let victims = planner.plan("cranberry", 50).unwrap();
        assert_eq!(victims.len(), 2);
        // Same priority: oldest first.
        assert_eq!(victims[0].id, "a/one.dat");
        assert_eq!(victims[1].id, "a/two.dat");
    }

    #[test]
    fn insufficient_space_is_an_error() {
        let (planner, inv, _) = setup();
        add(&inv, "a/only.dat", 10, 10);

        let err = planner.plan("cranberry", 1_000).unwrap_err();
        assert!(matches!(
            err,
            CacheError::InsufficientSpace {
                needed: 1_000,
                available: 10,
                ..
            }
        ));
    }

    #[test]
    fn zero_requirement_plans_nothing() {
        let (planner, inv, _) = setup();
        add(&inv, "a/x.dat", 10, 10);
        assert!(planner.plan("cranberry", 0).unwrap().is_empty());
    }
}
