//! File-based object backend.
//!
//! Stores one file per object at `{root}/{namespace}/{name}`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::error::BackendError;
use crate::traits::{ObjectBackend, ObjectStatus};

/// Object backend backed by plain files.
///
/// Namespaces map to directories, objects to files inside them. Reads and
/// writes are positional; writing past the end extends the file (holes stay
/// sparse where the filesystem supports it).
pub struct PosixObjectBackend {
    root: PathBuf,
}

impl PosixObjectBackend {
    /// Create a backend rooted at the given directory, creating it if
    /// missing.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, namespace: &str, name: &str) -> Result<PathBuf, BackendError> {
        validate_component(namespace)?;
        validate_component(name)?;
        Ok(self.root.join(namespace).join(name))
    }
}

/// Reject path components that would escape the namespace directory.
fn validate_component(component: &str) -> Result<(), BackendError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\', '\0'])
    {
        return Err(BackendError::InvalidName(component.to_string()));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ObjectBackend for PosixObjectBackend {
    async fn create(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        let path = self.object_path(namespace, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Never truncate: creating an existing object must not corrupt it.
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        debug!(namespace, name, "created object");
        Ok(())
    }

    async fn open(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        let path = self.object_path(namespace, name)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::not_found(namespace, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        let path = self.object_path(namespace, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(namespace, name, "deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::not_found(namespace, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, namespace: &str, name: &str) -> Result<ObjectStatus, BackendError> {
        let path = self.object_path(namespace, name)?;
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::not_found(namespace, name));
            }
            Err(e) => return Err(e.into()),
        };

        let modification_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(ObjectStatus {
            modification_time,
            size: metadata.len(),
        })
    }

    async fn sync(&self, namespace: &str, name: &str) -> Result<(), BackendError> {
        let path = self.object_path(namespace, name)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::not_found(namespace, name));
            }
            Err(e) => return Err(e.into()),
        };
        file.sync_all().await?;
        Ok(())
    }

    async fn read(
        &self,
        namespace: &str,
        name: &str,
        length: u64,
        offset: u64,
    ) -> Result<Bytes, BackendError> {
        let path = self.object_path(namespace, name)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::not_found(namespace, name));
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = BytesMut::with_capacity(length as usize);
        let mut limited = file.take(length);
        loop {
            let n = limited.read_buf(&mut buf).await?;
            if n == 0 || buf.len() as u64 >= length {
                break;
            }
        }
        Ok(buf.freeze())
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<u64, BackendError> {
        let path = self.object_path(namespace, name)?;
        let mut file = match fs::OpenOptions::new().write(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::not_found(namespace, name));
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(data.len() as u64)
    }
}
