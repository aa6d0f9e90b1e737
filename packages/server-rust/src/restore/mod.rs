//! Restoration from long-term storage.
//!
//! The [`Restorer`] trait is what the cache manager calls to fill misses;
//! [`bag::BagRestorer`] implements it over the [`bag::BagArchive`] driver
//! boundary, behind which the real bag store / object-store clients live.
//! Dataset membership comes from head-bag manifests, which the restorer
//! caches in its own staging area separate from the primary data cache.

pub mod bag;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use pdrcache_core::{AipId, Checksum, ObjectMetadata};

use crate::inventory::InventoryError;
use crate::volume::{CacheVolume, VolumeError};

pub use bag::{BagArchive, BagRestorer, MemoryArchive};
pub use stream::DigestReader;

/// Errors raised while restoring from the archive.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("no such object in long-term storage: {id}")]
    NotFound { id: String },
    #[error("restore of {id} ended early: expected {expected} bytes, wrote {got}")]
    Truncated { id: String, expected: u64, got: u64 },
    #[error("checksum mismatch restoring {id}: manifest says {expected}, stream was {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("bad manifest for {dsid}: {reason}")]
    Manifest { dsid: String, reason: String },
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("archive failure: {0}")]
    Archive(#[source] anyhow::Error),
}

/// What a successful restore produced.
#[derive(Debug, Clone)]
pub struct RestoredObject {
    /// Bytes written into the target volume.
    pub size: i64,
    /// Digest computed while the bytes streamed through.
    pub checksum: Checksum,
    /// Metadata for the inventory row, lifted keys included.
    pub metadata: ObjectMetadata,
}

/// One file of a dataset, as listed by its head-bag manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMember {
    pub filepath: String,
    /// Size in bytes; -1 when the manifest does not record one.
    #[serde(default = "unknown_size")]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

fn unknown_size() -> i64 {
    -1
}

/// A dataset's head-bag manifest: the authoritative member list for one
/// version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetManifest {
    pub dsid: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ediid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdrid: Option<String>,
    pub members: Vec<DatasetMember>,
}

impl DatasetManifest {
    /// Finds the member record for a file path.
    #[must_use]
    pub fn member(&self, filepath: &str) -> Option<&DatasetMember> {
        self.members.iter().find(|m| m.filepath == filepath)
    }
}

/// Fetches objects out of long-term storage into cache volumes.
///
/// Used as `Arc<dyn Restorer>` by the cache manager.
#[async_trait]
pub trait Restorer: Send + Sync {
    /// Negative existence check against the archive.
    ///
    /// True means the id definitively has no backing and a restore will
    /// never succeed.
    async fn does_not_exist(&self, id: &AipId) -> Result<bool, RestoreError>;

    /// Streams the object named by `id` into `volume` under `name`.
    ///
    /// On any failure (or caller cancellation) the partial write is
    /// removed from the volume; no inventory entry is made here.
    async fn restore_object(
        &self,
        id: &AipId,
        volume: Arc<dyn CacheVolume>,
        name: &str,
    ) -> Result<RestoredObject, RestoreError>;

    /// The member list for one dataset version, from its head-bag
    /// manifest. `version = None` resolves to the latest.
    async fn dataset_members(
        &self,
        dsid: &str,
        version: Option<&str>,
    ) -> Result<DatasetManifest, RestoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_json_round_trip() {
        let manifest = DatasetManifest {
            dsid: "mds2-2119".to_string(),
            version: "1.0.0".to_string(),
            ediid: Some("ark:/88434/mds2-2119".to_string()),
            pdrid: None,
            members: vec![DatasetMember {
                filepath: "data/readme.txt".to_string(),
                size: 12,
                checksum: Some(Checksum::sha256("ff00")),
            }],
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let back: DatasetManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dsid, "mds2-2119");
        assert_eq!(back.member("data/readme.txt").unwrap().size, 12);
        assert!(back.member("data/other.txt").is_none());
    }

    #[test]
    fn manifest_member_defaults() {
        let json = r#"{"dsid":"d","version":"1","members":[{"filepath":"f"}]}"#;
        let manifest: DatasetManifest = serde_json::from_str(json).unwrap();
        let member = manifest.member("f").unwrap();
        assert_eq!(member.size, -1);
        assert!(member.checksum.is_none());
    }
}
