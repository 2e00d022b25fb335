use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use super::errors::{Result, TusError};
use super::notify::UploadDelegate;

/// Local copies of the files waiting to be uploaded, addressed by name.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn exists(&self, name: &str) -> bool;

    async fn read(&self, name: &str) -> Result<Bytes>;

    async fn write(&self, name: &str, data: Bytes) -> Result<()>;

    /// Copies `source` into the store under `name`, returning its size.
    async fn import(&self, source: &Path, name: &str) -> Result<u64>;

    /// Returns `false` when the file could not be removed.
    async fn delete(&self, name: &str) -> bool;

    async fn size_of(&self, name: &str) -> Result<u64>;
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if !valid {
        return Err(TusError::ParamError(format!("Invalid file name: {:?}", name)));
    }
    Ok(())
}

/// Files kept in a single directory on disk. Failures that no caller can act
/// on (directory setup, cleanup) go to the injected delegate.
pub struct LocalFileStore {
    root: PathBuf,
    reporter: Arc<dyn UploadDelegate>,
}

impl LocalFileStore {
    /// Creates the directory if needed; an existing directory is fine.
    pub async fn open(root: impl Into<PathBuf>, reporter: Arc<dyn UploadDelegate>) -> Self {
        let root = root.into();
        match tokio::fs::create_dir(&root).await {
            Ok(()) => tracing::debug!(path = %root.display(), "Created file store directory"),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                tracing::error!(path = %root.display(), error = %err, "Failed to create file store directory");
                reporter.on_failure(None, &TusError::IoError(err));
            }
        }

        Self { root, reporter }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn exists(&self, name: &str) -> bool {
        match self.path_of(name) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        let data = tokio::fs::read(self.path_of(name)?).await?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        tokio::fs::write(self.path_of(name)?, data).await?;
        Ok(())
    }

    async fn import(&self, source: &Path, name: &str) -> Result<u64> {
        let size = tokio::fs::copy(source, self.path_of(name)?).await?;
        Ok(size)
    }

    async fn delete(&self, name: &str) -> bool {
        let result = match self.path_of(name) {
            Ok(path) => tokio::fs::remove_file(path).await.map_err(TusError::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(file = name, error = %err, "Failed deleting file from storage");
                self.reporter.on_failure(None, &err);
                false
            }
        }
    }

    async fn size_of(&self, name: &str) -> Result<u64> {
        let metadata = tokio::fs::metadata(self.path_of(name)?).await?;
        if !metadata.is_file() {
            return Err(TusError::ParamError(format!("Not a file: {}", name)));
        }
        Ok(metadata.len())
    }
}

/// In-process store, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryFileStore {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // a poisoned map still holds consistent entries
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn not_found(name: &str) -> TusError {
        TusError::IoError(std::io::Error::new(ErrorKind::NotFound, format!("{} not in store", name)))
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn exists(&self, name: &str) -> bool {
        self.files().contains_key(name)
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        self.files().get(name).cloned().ok_or_else(|| Self::not_found(name))
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        check_name(name)?;
        self.files().insert(name.to_string(), data);
        Ok(())
    }

    async fn import(&self, source: &Path, name: &str) -> Result<u64> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let size = data.len() as u64;
        self.write(name, data).await?;
        Ok(size)
    }

    async fn delete(&self, name: &str) -> bool {
        self.files().remove(name).is_some()
    }

    async fn size_of(&self, name: &str) -> Result<u64> {
        self.files()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Self::not_found(name))
    }
}
