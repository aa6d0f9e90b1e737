//! Directory-rooted [`CacheVolume`].
//!
//! Object names map to paths under the volume root; `/` in a name creates
//! subdirectories. Names that would escape the root (absolute paths,
//! `..` components) are rejected before any I/O happens.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt as _};

use super::{CacheVolume, ObjectDescription, VolumeError};

/// Filesystem-backed volume rooted at a directory.
pub struct FilesystemVolume {
    name: String,
    root: PathBuf,
}

impl FilesystemVolume {
    /// Creates a volume over `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Fails when the root directory cannot be created.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, VolumeError> {
        let name = name.into();
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| VolumeError::Io {
            volume: name.clone(),
            source,
        })?;
        Ok(Self { name, root })
    }

    /// Root directory this volume writes under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let relative = Path::new(name);
        let traversal_safe = !name.is_empty()
            && relative.is_relative()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !traversal_safe {
            return Err(VolumeError::BadName {
                volume: self.name.clone(),
                name: name.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn io_error(&self, source: std::io::Error) -> VolumeError {
        VolumeError::Io {
            volume: self.name.clone(),
            source,
        }
    }
}

#[async_trait]
impl CacheVolume for FilesystemVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, VolumeError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| self.io_error(e))?;
        let written = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        Ok(written)
    }

    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, VolumeError> {
        let path = self.resolve(name)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VolumeError::NotFound {
                volume: self.name.clone(),
                name: name.to_string(),
            }),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, VolumeError> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn remove(&self, name: &str) -> Result<bool, VolumeError> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn describe(&self, name: &str) -> Result<ObjectDescription, VolumeError> {
        let path = self.resolve(name)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VolumeError::NotFound {
                    volume: self.name.clone(),
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok());

        Ok(ObjectDescription {
            name: name.to_string(),
            size: meta.len(),
            modified_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::super::read_all;
    use super::*;

    fn fixture() -> (tempfile::TempDir, FilesystemVolume) {
        let dir = tempfile::tempdir().unwrap();
        let volume = FilesystemVolume::new("disk", dir.path().join("vol")).unwrap();
        (dir, volume)
    }

    #[tokio::test]
    async fn save_creates_subdirectories() {
        let (_dir, volume) = fixture();
        let data = b"nested bytes".to_vec();

        let written = volume
            .save("mds2-2119/data/readme.txt", &mut Cursor::new(data.clone()))
            .await
            .unwrap();
        assert_eq!(written, data.len() as u64);

        let back = read_all(&volume, "mds2-2119/data/readme.txt").await.unwrap();
        assert_eq!(back, data);

        let desc = volume.describe("mds2-2119/data/readme.txt").await.unwrap();
        assert_eq!(desc.size, data.len() as u64);
        assert!(desc.modified_ms.is_some());
    }

    #[tokio::test]
    async fn remove_then_exists_is_false() {
        let (_dir, volume) = fixture();
        volume
            .save("a.txt", &mut Cursor::new(b"x".to_vec()))
            .await
            .unwrap();

        assert!(volume.exists("a.txt").await.unwrap());
        assert!(volume.remove("a.txt").await.unwrap());
        assert!(!volume.exists("a.txt").await.unwrap());
        assert!(!volume.remove("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn traversal_names_rejected() {
        let (_dir, volume) = fixture();
        for bad in ["../escape.txt", "/etc/passwd", "a/../../b", ""] {
            let err = volume.exists(bad).await.unwrap_err();
            assert!(matches!(err, VolumeError::BadName { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let (_dir, volume) = fixture();
        let open_err = match volume.open("missing.txt").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(open_err, VolumeError::NotFound { .. }));
        assert!(matches!(
            volume.describe("missing.txt").await.unwrap_err(),
            VolumeError::NotFound { .. }
        ));
    }
}
