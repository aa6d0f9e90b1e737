//! Continuous integrity validation of cached objects.
//!
//! An [`IntegrityMonitor`] pulls batches of objects whose last check has
//! aged past the grace period, runs each through an ordered list of
//! [`ObjectCheck`]s, deletes failures from both the volume and the
//! inventory, and advances the `checked` timestamp of everything that
//! passes. The monitor worker drives this in cycles; the restorer binds a
//! second instance to its head-bag staging area.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt as _;
use tracing::{error, info, warn};

use pdrcache_core::{ClockSource, Sha256Digest, SHA256};

use crate::inventory::{CacheObject, InventoryError, InventoryMutator, InventoryReader as _};
use crate::volume::{CacheVolume, VolumeError};

/// Errors raised by integrity machinery.
///
/// A failed *check* is not an error: checks report failures through
/// [`CheckOutcome`], and the monitor handles them locally by deleting the
/// object. Errors here mean the sweep itself could not proceed.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Result of applying one check to one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The object is intact as far as this check can tell.
    Pass,
    /// The object is corrupt; the reason goes to the log.
    Fail(String),
}

/// One validation applied to a cached object.
///
/// Checks read the stored bytes through the volume and never mutate
/// anything; deletion is the monitor's job.
#[async_trait]
pub trait ObjectCheck: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Applies the check.
    ///
    /// # Errors
    ///
    /// Returns a [`VolumeError`] only for transient I/O trouble; missing
    /// bytes are a [`CheckOutcome::Fail`], not an error.
    async fn check(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> Result<CheckOutcome, VolumeError>;
}

/// Verifies the stored size against the inventory record.
///
/// Cheap first-line check; runs before any full read of the bytes.
pub struct SizeCheck;

#[async_trait]
impl ObjectCheck for SizeCheck {
    fn name(&self) -> &'static str {
        "size"
    }

    async fn check(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> Result<CheckOutcome, VolumeError> {
        if object.size < 0 {
            return Ok(CheckOutcome::Pass);
        }
        match volume.describe(&object.name).await {
            Ok(desc) if desc.size == object.size.unsigned_abs() => Ok(CheckOutcome::Pass),
            Ok(desc) => Ok(CheckOutcome::Fail(format!(
                "stored size {} != recorded size {}",
                desc.size, object.size
            ))),
            Err(VolumeError::NotFound { .. }) => {
                Ok(CheckOutcome::Fail("stored bytes are missing".to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Recomputes the checksum of the stored bytes and compares it with the
/// inventory record.
pub struct ChecksumCheck;

#[async_trait]
impl ObjectCheck for ChecksumCheck {
    fn name(&self) -> &'static str {
        "checksum"
    }

    async fn check(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> Result<CheckOutcome, VolumeError> {
        let Some(expected) = &object.checksum else {
            return Ok(CheckOutcome::Fail("no recorded checksum".to_string()));
        };
        if expected.algorithm != SHA256 {
            // Cannot verify, but absence of evidence is not corruption.
            warn!(
                id = object.id,
                algorithm = expected.algorithm,
                "skipping checksum verification for unsupported algorithm"
            );
            return Ok(CheckOutcome::Pass);
        }

        let mut reader = match volume.open(&object.name).await {
            Ok(reader) => reader,
            Err(VolumeError::NotFound { .. }) => {
                return Ok(CheckOutcome::Fail("stored bytes are missing".to_string()))
            }
            Err(e) => return Err(e),
        };

        let mut digest = Sha256Digest::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf).await.map_err(|source| VolumeError::Io {
                volume: volume.name().to_string(),
                source,
            })?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }

        let (computed, _) = digest.finish();
        if computed.hex == expected.hex {
            Ok(CheckOutcome::Pass)
        } else {
            Ok(CheckOutcome::Fail(format!(
                "checksum {} does not match recorded {}",
                computed.hex, expected.hex
            )))
        }
    }
}

/// Sweeps due objects through a list of checks, deleting failures.
pub struct IntegrityMonitor {
    inventory: Arc<dyn InventoryMutator>,
    volumes: BTreeMap<String, Arc<dyn CacheVolume>>,
    checks: Vec<Arc<dyn ObjectCheck>>,
    clock: Arc<dyn ClockSource>,
}

impl IntegrityMonitor {
    #[must_use]
    pub fn new(inventory: Arc<dyn InventoryMutator>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            inventory,
            volumes: BTreeMap::new(),
            checks: Vec::new(),
            clock,
        }
    }

    /// Adds a volume to the sweep.
    #[must_use]
    pub fn with_volume(mut self, volume: Arc<dyn CacheVolume>) -> Self {
        self.volumes.insert(volume.name().to_string(), volume);
        self
    }

    /// Appends checks; they run in the order given, stopping at the first
    /// failure.
    #[must_use]
    pub fn with_checks(mut self, checks: Vec<Arc<dyn ObjectCheck>>) -> Self {
        self.checks.extend(checks);
        self
    }

    /// Sets the grace period governing which objects count as due.
    pub fn set_check_grace(&self, ms: i64) {
        self.inventory.set_check_grace_period(ms);
    }

    /// Runs one batch: up to `max_objects` due objects across this
    /// monitor's volumes.
    ///
    /// Each failed object is removed from its volume and the inventory,
    /// and its id is appended to `deleted`. Passing objects get their
    /// `checked` timestamp advanced when `update_status` is set. Returns
    /// how many objects were examined.
    ///
    /// # Errors
    ///
    /// Fails only when the inventory cannot be queried; per-object volume
    /// trouble is logged and the batch continues.
    pub async fn find_corrupted_objects(
        &self,
        max_objects: usize,
        deleted: &mut Vec<String>,
        update_status: bool,
    ) -> Result<usize, IntegrityError> {
        let mut examined = 0;

        for (volume_name, volume) in &self.volumes {
            if examined >= max_objects {
                break;
            }
            let due = self
                .inventory
                .select_due_for_check(volume_name, max_objects - examined)?;

            for object in due {
                examined += 1;
                match self.examine(&object, volume.as_ref()).await {
                    Ok(CheckOutcome::Pass) => {
                        if update_status {
                            self.inventory.update_checked(
                                volume_name,
                                &object.name,
                                self.clock.now_ms(),
                            )?;
                        }
                    }
                    Ok(CheckOutcome::Fail(reason)) => {
                        warn!(id = object.id, volume = %volume_name, reason, "integrity check failed; deleting object");
                        if let Err(e) = volume.remove(&object.name).await {
                            error!(id = object.id, error = %e, "failed to remove corrupt object bytes");
                        }
                        self.inventory.remove_object(volume_name, &object.name)?;
                        deleted.push(object.id.clone());
                    }
                    Err(e) => {
                        // Transient volume trouble: neither delete nor
                        // mark checked; the object stays due.
                        error!(id = object.id, error = %e, "integrity check could not run");
                    }
                }
            }
        }

        if examined > 0 {
            info!(examined, deleted = deleted.len(), "integrity batch complete");
        }
        Ok(examined)
    }

    async fn examine(
        &self,
        object: &CacheObject,
        volume: &dyn CacheVolume,
    ) -> Result<CheckOutcome, VolumeError> {
        for check in &self.checks {
            match check.check(object, volume).await? {
                CheckOutcome::Pass => {}
                CheckOutcome::Fail(reason) => {
                    return Ok(CheckOutcome::Fail(format!("{}: {reason}", check.name())))
                }
            }
        }
        Ok(CheckOutcome::Pass)
    }
}
