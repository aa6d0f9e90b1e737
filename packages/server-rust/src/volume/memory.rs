//! In-memory [`CacheVolume`] backed by [`DashMap`].
//!
//! Suitable for tests and ephemeral staging areas where the cached bytes
//! fit comfortably in memory.

use std::io::Cursor;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt as _};

use super::{CacheVolume, ObjectDescription, VolumeError};

/// DashMap-backed volume; concurrent readers need no external locking.
pub struct MemoryVolume {
    name: String,
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryVolume {
    /// Creates an empty volume registered under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    /// Places bytes directly, bypassing the streaming path.
    pub fn put(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.entries.insert(name.into(), bytes);
    }

    /// Copies out the stored bytes of `name`, if present.
    #[must_use]
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the volume holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheVolume for MemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, VolumeError> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|source| VolumeError::Io {
                volume: self.name.clone(),
                source,
            })?;
        let written = buf.len() as u64;
        self.entries.insert(name.to_string(), buf);
        Ok(written)
    }

    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, VolumeError> {
        let bytes = self
            .entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| VolumeError::NotFound {
                volume: self.name.clone(),
                name: name.to_string(),
            })?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn exists(&self, name: &str) -> Result<bool, VolumeError> {
        Ok(self.entries.contains_key(name))
    }

    async fn remove(&self, name: &str) -> Result<bool, VolumeError> {
        Ok(self.entries.remove(name).is_some())
    }

    async fn describe(&self, name: &str) -> Result<ObjectDescription, VolumeError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| VolumeError::NotFound {
                volume: self.name.clone(),
                name: name.to_string(),
            })?;
        Ok(ObjectDescription {
            name: name.to_string(),
            size: entry.value().len() as u64,
            modified_ms: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::read_all;
    use super::*;

    #[tokio::test]
    async fn save_open_remove_round_trip() {
        let volume = MemoryVolume::new("mem");
        let data = b"hello volume".to_vec();

        let written = volume
            .save("ds/file.txt", &mut Cursor::new(data.clone()))
            .await
            .unwrap();
        assert_eq!(written, data.len() as u64);
        assert!(volume.exists("ds/file.txt").await.unwrap());

        let back = read_all(&volume, "ds/file.txt").await.unwrap();
        assert_eq!(back, data);

        assert!(volume.remove("ds/file.txt").await.unwrap());
        assert!(!volume.remove("ds/file.txt").await.unwrap());
        assert!(!volume.exists("ds/file.txt").await.unwrap());
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let volume = MemoryVolume::new("mem");
        let err = match volume.open("nope").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, VolumeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn describe_reports_size() {
        let volume = MemoryVolume::new("mem");
        volume.put("a", vec![0u8; 37]);

        let desc = volume.describe("a").await.unwrap();
        assert_eq!(desc.size, 37);
        assert_eq!(desc.name, "a");
    }

    #[tokio::test]
    async fn save_replaces_previous_content() {
        let volume = MemoryVolume::new("mem");
        volume.put("a", b"old".to_vec());
        volume
            .save("a", &mut Cursor::new(b"newer".to_vec()))
            .await
            .unwrap();
        assert_eq!(volume.contents("a").unwrap(), b"newer");
    }
}
