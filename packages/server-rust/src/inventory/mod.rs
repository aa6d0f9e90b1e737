//! Storage inventory -- the sole persistent state of the cache.
//!
//! Defines the inventory record types and the two capability traits the
//! rest of the system programs against:
//!
//! - [`InventoryReader`]: placement, eviction, and status queries
//! - [`InventoryMutator`]: registration and object lifecycle writes
//!
//! The split keeps the manager/worker dependency graph acyclic: workers
//! and the integrity monitor receive the capability they need, never the
//! cache manager itself. The SQLite implementation lives in [`sqlite`].

pub mod sqlite;

use serde::Serialize;

use pdrcache_core::{Checksum, ObjectMetadata};

pub use sqlite::SqliteInventory;

/// Default eviction priority for new objects; lower is more important.
pub const DEFAULT_PRIORITY: i64 = 10;

/// Errors raised by the inventory layer.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("inventory search failed: {0}")]
    Search(String),
    #[error("bad object metadata for {id}: {reason}")]
    Metadata { id: String, reason: String },
    #[error("volume not registered: {name}")]
    VolumeNotFound { name: String },
    #[error("inventory database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// What a registered volume may be used for.
///
/// Status is strictly increasing in capability: a volume usable for
/// updates is also readable, and a readable volume can serve metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    /// Volume exists but must not be touched.
    NotAvailable,
    /// Object metadata may be served; bytes must not be read back.
    ForInfo,
    /// Bytes may be read back; no new writes.
    ForGet,
    /// Fully usable: readable and a valid placement target.
    ForUpdate,
}

impl VolumeStatus {
    /// Integer form stored in the `volumes.status` column.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::NotAvailable => 0,
            Self::ForInfo => 1,
            Self::ForGet => 2,
            Self::ForUpdate => 3,
        }
    }

    /// Decodes a stored status; unknown values degrade to `NotAvailable`.
    #[must_use]
    pub fn from_i64(raw: i64) -> Self {
        match raw {
            1 => Self::ForInfo,
            2 => Self::ForGet,
            3 => Self::ForUpdate,
            _ => Self::NotAvailable,
        }
    }
}

/// One live copy of a cached object, as recorded in the inventory.
#[derive(Debug, Clone)]
pub struct CacheObject {
    /// AIP identifier (`dsid[/filepath][#version]`).
    pub id: String,
    /// Name of the object within its volume; may differ from `id`.
    pub name: String,
    /// Name of the volume holding this copy.
    pub volume: String,
    /// Size in bytes; -1 when unknown.
    pub size: i64,
    /// Recorded checksum, when one was captured at restore time.
    pub checksum: Option<Checksum>,
    /// Eviction priority; lower is more important.
    pub priority: i64,
    /// Epoch-ms when this copy was added or last refreshed.
    pub since: i64,
    /// Epoch-ms of the last integrity check; 0 if never checked.
    pub checked: i64,
    /// The metadata blob stored verbatim.
    pub metadata: ObjectMetadata,
}

/// Registration record for a volume, as the inventory knows it.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    /// Capacity in bytes; -1 when unlimited/unknown.
    pub capacity: i64,
    /// Placement priority among eligible volumes; lower fills first.
    pub priority: i64,
    pub status: VolumeStatus,
    /// Registration metadata with `capacity` and `priority` folded in.
    pub metadata: ObjectMetadata,
}

/// Aggregate totals over the live rows of one volume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTotals {
    pub filecount: i64,
    pub totalsize: i64,
    /// Epoch-ms of the most recent addition; 0 for an empty volume.
    pub since: i64,
    pub since_date: String,
    /// Epoch-ms of the least recently checked object; 0 if any is unchecked.
    pub checked: i64,
    pub checked_date: String,
}

/// Aggregate view of one dataset's presence in the cache.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    pub dsid: String,
    pub filecount: i64,
    pub totalsize: i64,
    pub since: i64,
    pub since_date: String,
    pub checked: i64,
    pub checked_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ediid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdrid: Option<String>,
}

/// Read-side inventory capability: placement, eviction, and status queries.
pub trait InventoryReader: Send + Sync {
    /// Returns all live copies of `id`, optionally restricted to one volume.
    fn find_object(
        &self,
        id: &str,
        volume: Option<&str>,
    ) -> Result<Vec<CacheObject>, InventoryError>;

    /// Prefix/wildcard id lookup, restricted to volumes at or above
    /// `min_status`. `*` in the pattern matches any run of characters.
    fn select_objects_like_id(
        &self,
        pattern: &str,
        min_status: VolumeStatus,
    ) -> Result<Vec<CacheObject>, InventoryError>;

    /// Registration record for a volume.
    fn get_volume_info(&self, name: &str) -> Result<VolumeInfo, InventoryError>;

    /// Aggregates over the live rows of a volume.
    fn get_volume_totals(&self, name: &str) -> Result<VolumeTotals, InventoryError>;

    /// Names of all registered volumes.
    fn volume_names(&self) -> Result<Vec<String>, InventoryError>;

    /// Aggregate view of one dataset across all volumes.
    fn summarize_dataset(&self, dsid: &str) -> Result<DatasetSummary, InventoryError>;

    /// Per-dataset summaries, across all volumes or restricted to one.
    fn summarize_contents(
        &self,
        volume: Option<&str>,
    ) -> Result<Vec<DatasetSummary>, InventoryError>;

    /// Eviction candidates on `volume`, ordered worst-first
    /// (`priority DESC, since ASC, size DESC`), accumulated until their
    /// total size covers `required_bytes`. Protected rows (volumes below
    /// [`VolumeStatus::ForGet`]; a nonzero refcount younger than the
    /// refcount TTL) are never returned. The result may fall short when
    /// the volume has nothing more to give; sufficiency is the deletion
    /// planner's concern.
    fn select_objects_to_purge(
        &self,
        volume: &str,
        required_bytes: i64,
    ) -> Result<Vec<CacheObject>, InventoryError>;

    /// Up to `max` objects on `volume` whose last check is at least the
    /// check grace period in the past, oldest-checked first.
    fn select_due_for_check(
        &self,
        volume: &str,
        max: usize,
    ) -> Result<Vec<CacheObject>, InventoryError>;
}

/// Write-side inventory capability.
pub trait InventoryMutator: InventoryReader {
    /// Records a live copy of `id` at `(volume, name)`.
    ///
    /// Idempotent at the coordinate: any existing rows there are removed
    /// in the same transaction, then the new row is inserted with
    /// `since = now` and `checked = 0`. Lifted metadata keys populate the
    /// first-class columns; a checksum algorithm named in the metadata is
    /// registered lazily.
    fn add_object(
        &self,
        id: &str,
        volume: &str,
        name: &str,
        metadata: &ObjectMetadata,
    ) -> Result<CacheObject, InventoryError>;

    /// Deletes the row(s) at `(volume, name)`; returns whether any existed.
    ///
    /// # Errors
    ///
    /// Fails with [`InventoryError::VolumeNotFound`] when `volume` is not
    /// registered.
    fn remove_object(&self, volume: &str, name: &str) -> Result<bool, InventoryError>;

    /// Advances the last-check timestamp of the row at `(volume, name)`.
    fn update_checked(&self, volume: &str, name: &str, when: i64) -> Result<(), InventoryError>;

    /// Registers a checksum algorithm; a no-op if already present.
    fn register_algorithm(&self, name: &str) -> Result<(), InventoryError>;

    /// Registers or updates a volume.
    ///
    /// Upserts capacity, priority (from the metadata `priority` key), and
    /// the metadata blob; a newly created volume starts at
    /// [`VolumeStatus::ForUpdate`], and an update preserves the stored
    /// status. In-memory caches are reloaded.
    fn register_volume(
        &self,
        name: &str,
        capacity: i64,
        metadata: &ObjectMetadata,
    ) -> Result<(), InventoryError>;

    /// Changes a volume's status without unregistering it.
    fn set_volume_status(&self, name: &str, status: VolumeStatus)
        -> Result<(), InventoryError>;

    /// Sets the minimum age (ms since last check) before an object becomes
    /// eligible for re-checking.
    fn set_check_grace_period(&self, ms: i64);
}
