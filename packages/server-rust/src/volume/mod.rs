//! Cache volumes -- the byte stores objects live in.
//!
//! Defines [`CacheVolume`], the abstract byte-store every cache copy is
//! written to, with two implementations:
//!
//! - [`FilesystemVolume`]: a directory-rooted volume for real deployments
//! - [`MemoryVolume`]: a `DashMap`-backed volume for tests and ephemeral use
//!
//! [`registry::VolumeRegistry`] tracks the live handles together with
//! their status and role bits.

pub mod filesystem;
pub mod memory;
pub mod registry;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use filesystem::FilesystemVolume;
pub use memory::MemoryVolume;
pub use registry::{VolumeHandle, VolumeRegistry};

/// Errors raised by cache volume operations.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("object {name} not found in volume {volume}")]
    NotFound { volume: String, name: String },
    #[error("volume {volume} is not available")]
    Unavailable { volume: String },
    #[error("bad object name for volume {volume}: {name}")]
    BadName { volume: String, name: String },
    #[error("I/O failure on volume {volume}: {source}")]
    Io {
        volume: String,
        #[source]
        source: std::io::Error,
    },
}

/// What a volume can say about one stored object without reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    /// Name of the object within the volume.
    pub name: String,
    /// Stored size in bytes.
    pub size: u64,
    /// Last-modified time in epoch-ms, when the store tracks one.
    pub modified_ms: Option<i64>,
}

/// Abstract byte store holding cache copies.
///
/// Object names may contain `/`; implementations treat them as opaque
/// hierarchical keys. Readers may be arbitrary and concurrent; writers
/// serialize per volume at the manager layer.
///
/// Used as `Arc<dyn CacheVolume>`.
#[async_trait]
pub trait CacheVolume: Send + Sync {
    /// Name this volume was registered under.
    fn name(&self) -> &str;

    /// Streams `reader` to completion into the object `name`, replacing
    /// any previous content. Returns the number of bytes written.
    async fn save(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, VolumeError>;

    /// Opens the stored bytes of `name` for reading.
    async fn open(&self, name: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, VolumeError>;

    /// Whether `name` currently exists in this volume.
    async fn exists(&self, name: &str) -> Result<bool, VolumeError>;

    /// Removes `name`; returns whether it existed.
    async fn remove(&self, name: &str) -> Result<bool, VolumeError>;

    /// Size and modification time of `name`.
    async fn describe(&self, name: &str) -> Result<ObjectDescription, VolumeError>;
}

/// Reads an object fully into memory. Test and manifest-sized use only.
pub async fn read_all(
    volume: &dyn CacheVolume,
    name: &str,
) -> Result<Vec<u8>, VolumeError> {
    use tokio::io::AsyncReadExt as _;

    let mut reader = volume.open(name).await?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|source| VolumeError::Io {
            volume: volume.name().to_string(),
            source,
        })?;
    Ok(buf)
}
