//! Bag-archive restorer.
//!
//! [`BagArchive`] is the boundary behind which the real bag-store /
//! object-store drivers live; the cache only ever sees manifests and byte
//! streams. [`BagRestorer`] implements [`Restorer`] over that boundary,
//! verifying each restored stream against the head-bag manifest and
//! keeping fetched manifests in a staging cache of its own, separate from
//! the primary data cache.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use pdrcache_core::{sha256_hex, AipId, ClockSource, ObjectMetadata};

use crate::integrity::{IntegrityMonitor, ObjectCheck};
use crate::inventory::{InventoryMutator, InventoryReader as _};
use crate::volume::{read_all, CacheVolume, VolumeError};

use super::stream::DigestReader;
use super::{DatasetManifest, RestoreError, RestoredObject, Restorer};

/// Long-term storage driver boundary.
///
/// Implementations wrap the actual bag store (filesystem, object store,
/// ...). `Ok(None)` means "definitively absent"; errors mean the archive
/// could not answer.
#[async_trait]
pub trait BagArchive: Send + Sync {
    /// Whether the archive holds the dataset (and, when named, the file).
    async fn exists(
        &self,
        dsid: &str,
        filepath: Option<&str>,
        version: Option<&str>,
    ) -> anyhow::Result<bool>;

    /// Resolves `version` (`None` = latest) and returns the head-bag
    /// manifest JSON for it.
    async fn head_manifest(
        &self,
        dsid: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Option<(String, Vec<u8>)>>;

    /// Opens the bytes of one member file.
    async fn open_file(
        &self,
        dsid: &str,
        filepath: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Option<Box<dyn AsyncRead + Send + Unpin>>>;
}

// ---------------------------------------------------------------------------
// Head-bag staging cache
// ---------------------------------------------------------------------------

/// Manifest staging cache: volume + inventory pair owned by the restorer.
///
/// Cached manifests are inventory objects like any other, so the same
/// integrity machinery that guards the data cache also trims this one.
struct HeadBagCache {
    volume: Arc<dyn CacheVolume>,
    inventory: Arc<dyn InventoryMutator>,
}

impl HeadBagCache {
    fn new(
        volume: Arc<dyn CacheVolume>,
        inventory: Arc<dyn InventoryMutator>,
    ) -> Result<Self, RestoreError> {
        inventory.register_volume(volume.name(), -1, &ObjectMetadata::new())?;
        Ok(Self { volume, inventory })
    }

    fn object_id(dsid: &str, version: &str) -> String {
        format!("{dsid}#{version}")
    }

    fn object_name(dsid: &str, version: &str) -> String {
        format!("{dsid}/{version}.json")
    }

    async fn load(&self, dsid: &str, version: &str) -> Result<Option<Vec<u8>>, RestoreError> {
        let id = Self::object_id(dsid, version);
        let rows = self.inventory.find_object(&id, Some(self.volume.name()))?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        match read_all(self.volume.as_ref(), &row.name).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(VolumeError::NotFound { .. }) => {
                // Inventory said cached but the bytes are gone; drop the
                // stale row and fall back to the archive.
                warn!(dsid, version, "head-bag cache row had no backing file");
                self.inventory.remove_object(self.volume.name(), &row.name)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, dsid: &str, version: &str, bytes: &[u8]) -> Result<(), RestoreError> {
        let name = Self::object_name(dsid, version);
        self.volume
            .save(&name, &mut Cursor::new(bytes.to_vec()))
            .await?;

        let mut meta = ObjectMetadata::new();
        meta.set_size(bytes.len() as i64);
        meta.set_checksum(&pdrcache_core::Checksum::sha256(sha256_hex(bytes)));
        self.inventory
            .add_object(&Self::object_id(dsid, version), self.volume.name(), &name, &meta)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BagRestorer
// ---------------------------------------------------------------------------

/// Removes a partially written object unless disarmed.
///
/// Covers both error returns and caller cancellation: Drop runs either
/// way, and the removal is spawned so it survives the dropped future.
struct PartialWriteGuard {
    target: Option<(Arc<dyn CacheVolume>, String)>,
}

impl PartialWriteGuard {
    fn new(volume: Arc<dyn CacheVolume>, name: &str) -> Self {
        Self {
            target: Some((volume, name.to_string())),
        }
    }

    fn disarm(&mut self) {
        self.target = None;
    }
}

impl Drop for PartialWriteGuard {
    fn drop(&mut self) {
        if let Some((volume, name)) = self.target.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = volume.remove(&name).await;
                });
            }
        }
    }
}

/// [`Restorer`] over a [`BagArchive`], with manifest verification.
pub struct BagRestorer {
    archive: Arc<dyn BagArchive>,
    headbags: HeadBagCache,
}

impl BagRestorer {
    /// Creates a restorer over `archive`, staging head-bag manifests in
    /// the given volume/inventory pair.
    ///
    /// # Errors
    ///
    /// Fails when the staging volume cannot be registered.
    pub fn new(
        archive: Arc<dyn BagArchive>,
        headbag_volume: Arc<dyn CacheVolume>,
        headbag_inventory: Arc<dyn InventoryMutator>,
    ) -> Result<Self, RestoreError> {
        Ok(Self {
            archive,
            headbags: HeadBagCache::new(headbag_volume, headbag_inventory)?,
        })
    }

    /// An [`IntegrityMonitor`] bound to the head-bag staging area.
    #[must_use]
    pub fn integrity_monitor(
        &self,
        checks: Vec<Arc<dyn ObjectCheck>>,
        clock: Arc<dyn ClockSource>,
    ) -> IntegrityMonitor {
        IntegrityMonitor::new(self.headbags.inventory.clone(), clock)
            .with_volume(self.headbags.volume.clone())
            .with_checks(checks)
    }

    async fn manifest_for(
        &self,
        dsid: &str,
        version: Option<&str>,
    ) -> Result<DatasetManifest, RestoreError> {
        // A pinned version can be answered from the staging cache; the
        // latest version must be resolved by the archive every time.
        if let Some(ver) = version {
            if let Some(bytes) = self.headbags.load(dsid, ver).await? {
                return parse_manifest(dsid, &bytes);
            }
        }

        let (resolved, bytes) = self
            .archive
            .head_manifest(dsid, version)
            .await
            .map_err(RestoreError::Archive)?
            .ok_or_else(|| RestoreError::NotFound {
                id: dsid.to_string(),
            })?;
        debug!(dsid, version = %resolved, "fetched head-bag manifest");
        self.headbags.store(dsid, &resolved, &bytes).await?;
        parse_manifest(dsid, &bytes)
    }
}

fn parse_manifest(dsid: &str, bytes: &[u8]) -> Result<DatasetManifest, RestoreError> {
    serde_json::from_slice(bytes).map_err(|e| RestoreError::Manifest {
        dsid: dsid.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Restorer for BagRestorer {
    async fn does_not_exist(&self, id: &AipId) -> Result<bool, RestoreError> {
        let present = self
            .archive
            .exists(&id.dsid, id.filepath.as_deref(), id.version.as_deref())
            .await
            .map_err(RestoreError::Archive)?;
        Ok(!present)
    }

    async fn restore_object(
        &self,
        id: &AipId,
        volume: Arc<dyn CacheVolume>,
        name: &str,
    ) -> Result<RestoredObject, RestoreError> {
        let Some(filepath) = id.filepath.as_deref() else {
            return Err(RestoreError::NotFound { id: id.to_string() });
        };

        let manifest = self.manifest_for(&id.dsid, id.version.as_deref()).await?;
        let member = manifest
            .member(filepath)
            .ok_or_else(|| RestoreError::NotFound { id: id.to_string() })?
            .clone();

        let stream = self
            .archive
            .open_file(&id.dsid, filepath, id.version.as_deref())
            .await
            .map_err(RestoreError::Archive)?
            .ok_or_else(|| RestoreError::NotFound { id: id.to_string() })?;

        let mut guard = PartialWriteGuard::new(volume.clone(), name);
        let mut reader = DigestReader::new(stream);
        let written = volume.save(name, &mut reader).await?;
        let (computed, _) = reader.finish();

        if member.size >= 0 && written != member.size.unsigned_abs() {
            return Err(RestoreError::Truncated {
                id: id.to_string(),
                expected: member.size.unsigned_abs(),
                got: written,
            });
        }
        if let Some(expected) = &member.checksum {
            if expected.algorithm == computed.algorithm && expected.hex != computed.hex {
                return Err(RestoreError::ChecksumMismatch {
                    id: id.to_string(),
                    expected: expected.hex.clone(),
                    actual: computed.hex.clone(),
                });
            }
        }
        guard.disarm();

        let mut metadata = ObjectMetadata::new();
        metadata.set_size(written as i64);
        metadata.set_checksum(&computed);
        if let Some(ediid) = &manifest.ediid {
            metadata.set("ediid", serde_json::Value::from(ediid.clone()));
        }
        if let Some(pdrid) = &manifest.pdrid {
            metadata.set("pdrid", serde_json::Value::from(pdrid.clone()));
        }

        debug!(id = %id, volume = volume.name(), name, written, "restored object");
        Ok(RestoredObject {
            size: written as i64,
            checksum: computed,
            metadata,
        })
    }

    async fn dataset_members(
        &self,
        dsid: &str,
        version: Option<&str>,
    ) -> Result<DatasetManifest, RestoreError> {
        self.manifest_for(dsid, version).await
    }
}

// ---------------------------------------------------------------------------
// In-memory archive for tests
// ---------------------------------------------------------------------------

/// In-memory [`BagArchive`] test double.
///
/// Tracks how often files and manifests are fetched so tests can assert
/// single-flight and cache-hit behavior.
#[derive(Default)]
pub struct MemoryArchive {
    manifests: DashMap<(String, String), Vec<u8>>,
    files: DashMap<(String, String, String), Vec<u8>>,
    latest: DashMap<String, String>,
    file_opens: DashMap<String, u64>,
    manifest_fetches: AtomicU64,
}

impl MemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dataset version, building its manifest from the files.
    ///
    /// The last version added becomes "latest".
    pub fn add_dataset(&self, dsid: &str, version: &str, files: &[(&str, &[u8])]) {
        let members = files
            .iter()
            .map(|(filepath, bytes)| super::DatasetMember {
                filepath: (*filepath).to_string(),
                size: bytes.len() as i64,
                checksum: Some(pdrcache_core::Checksum::sha256(sha256_hex(bytes))),
            })
            .collect();
        let manifest = DatasetManifest {
            dsid: dsid.to_string(),
            version: version.to_string(),
            ediid: Some(format!("ark:/88434/{dsid}")),
            pdrid: None,
            members,
        };

        self.manifests.insert(
            (dsid.to_string(), version.to_string()),
            serde_json::to_vec(&manifest).expect("manifest serializes"),
        );
        for (filepath, bytes) in files {
            self.files.insert(
                (dsid.to_string(), version.to_string(), (*filepath).to_string()),
                bytes.to_vec(),
            );
        }
        self.latest.insert(dsid.to_string(), version.to_string());
    }

    /// Overwrites stored file bytes without touching the manifest, to
    /// simulate archive-side corruption.
    pub fn tamper_file(&self, dsid: &str, version: &str, filepath: &str, bytes: &[u8]) {
        self.files.insert(
            (dsid.to_string(), version.to_string(), filepath.to_string()),
            bytes.to_vec(),
        );
    }

    /// How many times `open_file` ran for this file.
    #[must_use]
    pub fn open_count(&self, dsid: &str, filepath: &str) -> u64 {
        self.file_opens
            .get(&format!("{dsid}/{filepath}"))
            .map_or(0, |c| *c)
    }

    /// How many times a manifest was fetched from the archive.
    #[must_use]
    pub fn manifest_fetch_count(&self) -> u64 {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    fn resolve(&self, dsid: &str, version: Option<&str>) -> Option<String> {
        match version {
            Some(v) => Some(v.to_string()),
            None => self.latest.get(dsid).map(|v| v.value().clone()),
        }
    }
}

#[async_trait]
impl BagArchive for MemoryArchive {
    async fn exists(
        &self,
        dsid: &str,
        filepath: Option<&str>,
        version: Option<&str>,
    ) -> anyhow::Result<bool> {
        let Some(resolved) = self.resolve(dsid, version) else {
            return Ok(false);
        };
        match filepath {
            None => Ok(self
                .manifests
                .contains_key(&(dsid.to_string(), resolved))),
            Some(path) => Ok(self
                .files
                .contains_key(&(dsid.to_string(), resolved, path.to_string()))),
        }
    }

    async fn head_manifest(
        &self,
        dsid: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Option<(String, Vec<u8>)>> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let Some(resolved) = self.resolve(dsid, version) else {
            return Ok(None);
        };
        Ok(self
            .manifests
            .get(&(dsid.to_string(), resolved.clone()))
            .map(|bytes| (resolved, bytes.value().clone())))
    }

    async fn open_file(
        &self,
        dsid: &str,
        filepath: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        *self
            .file_opens
            .entry(format!("{dsid}/{filepath}"))
            .or_insert(0) += 1;
        let Some(resolved) = self.resolve(dsid, version) else {
            return Ok(None);
        };
        Ok(self
            .files
            .get(&(dsid.to_string(), resolved, filepath.to_string()))
            .map(|bytes| {
                Box::new(Cursor::new(bytes.value().clone())) as Box<dyn AsyncRead + Send + Unpin>
            }))
    }
}

#[cfg(test)]
mod tests {
    use pdrcache_core::ManualClock;

    use crate::inventory::SqliteInventory;
    use crate::volume::MemoryVolume;

    use super::*;

    fn fixture() -> (Arc<MemoryArchive>, BagRestorer, Arc<MemoryVolume>) {
        let archive = Arc::new(MemoryArchive::new());
        archive.add_dataset(
            "mds2-2119",
            "1.0.0",
            &[
                ("data/readme.txt", b"hello readme".as_slice()),
                ("data/trial1.json", b"{\"n\": 1}".as_slice()),
            ],
        );

        let clock = Arc::new(ManualClock::new(1_000));
        let headbag_inventory = Arc::new(SqliteInventory::in_memory(clock).unwrap());
        let restorer = BagRestorer::new(
            archive.clone(),
            Arc::new(MemoryVolume::new("headbags")),
            headbag_inventory,
        )
        .unwrap();

        let target = Arc::new(MemoryVolume::new("cranberry"));
        (archive, restorer, target)
    }

    #[tokio::test]
    async fn restore_writes_verified_bytes() {
        let (_, restorer, target) = fixture();
        let id = AipId::parse("mds2-2119/data/readme.txt").unwrap();

        let restored = restorer
            .restore_object(&id, target.clone(), "mds2-2119/data/readme.txt")
            .await
            .unwrap();

        assert_eq!(restored.size, 12);
        assert_eq!(restored.checksum.hex, sha256_hex(b"hello readme"));
        assert_eq!(
            target.contents("mds2-2119/data/readme.txt").unwrap(),
            b"hello readme"
        );
        assert_eq!(restored.metadata.size(), Some(12));
        assert_eq!(restored.metadata.ediid(), Some("ark:/88434/mds2-2119"));
    }

    #[tokio::test]
    async fn restore_unknown_file_is_not_found() {
        let (_, restorer, target) = fixture();
        let id = AipId::parse("mds2-2119/data/nope.txt").unwrap();
        assert!(matches!(
            restorer.restore_object(&id, target, "x").await.unwrap_err(),
            RestoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn corrupted_stream_fails_and_rolls_back() {
        let (archive, restorer, target) = fixture();
        archive.tamper_file("mds2-2119", "1.0.0", "data/readme.txt", b"evil bytes!!");

        let id = AipId::parse("mds2-2119/data/readme.txt").unwrap();
        let err = restorer
            .restore_object(&id, target.clone(), "mds2-2119/data/readme.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::ChecksumMismatch { .. }));

        // The guard's spawned removal needs a tick to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(target.contents("mds2-2119/data/readme.txt").is_none());
    }

    #[tokio::test]
    async fn truncated_stream_fails() {
        let (archive, restorer, target) = fixture();
        archive.tamper_file("mds2-2119", "1.0.0", "data/readme.txt", b"short");

        let id = AipId::parse("mds2-2119/data/readme.txt").unwrap();
        let err = restorer
            .restore_object(&id, target, "mds2-2119/data/readme.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Truncated { .. }));
    }

    #[tokio::test]
    async fn pinned_manifest_served_from_staging_cache() {
        let (archive, restorer, _) = fixture();

        let first = restorer
            .dataset_members("mds2-2119", Some("1.0.0"))
            .await
            .unwrap();
        assert_eq!(first.members.len(), 2);
        assert_eq!(archive.manifest_fetch_count(), 1);

        let second = restorer
            .dataset_members("mds2-2119", Some("1.0.0"))
            .await
            .unwrap();
        assert_eq!(second.members.len(), 2);
        assert_eq!(archive.manifest_fetch_count(), 1, "second read should hit the cache");
    }

    #[tokio::test]
    async fn latest_always_resolved_by_archive() {
        let (archive, restorer, _) = fixture();

        let latest = restorer.dataset_members("mds2-2119", None).await.unwrap();
        assert_eq!(latest.version, "1.0.0");

        archive.add_dataset("mds2-2119", "1.1.0", &[("data/new.txt", b"n".as_slice())]);
        let latest = restorer.dataset_members("mds2-2119", None).await.unwrap();
        assert_eq!(latest.version, "1.1.0");
    }

    #[tokio::test]
    async fn existence_checks() {
        let (_, restorer, _) = fixture();
        let present = AipId::parse("mds2-2119/data/readme.txt").unwrap();
        let absent = AipId::parse("gone-404").unwrap();

        assert!(!restorer.does_not_exist(&present).await.unwrap());
        assert!(restorer.does_not_exist(&absent).await.unwrap());
    }
}
