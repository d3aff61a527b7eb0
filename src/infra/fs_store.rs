use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use uuid::Uuid;

use crate::domain::error::{validate_name, Error, Result};
use crate::domain::port::RecordStore;

const EXTENSION: &str = "json";

/// One JSON file per record: `<root>/<namespace>/<key>.json`.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so a reader never sees a half-written record.
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error("create", &root, e))?;
        Ok(Self { root })
    }

    fn directory(&self, namespace: &str) -> Result<PathBuf> {
        validate_name(namespace).map_err(|e| Error::storage(e.to_string()))?;
        Ok(self.root.join(namespace))
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        validate_name(key)?;
        Ok(self.directory(namespace)?.join(format!("{key}.{EXTENSION}")))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::storage(format!("cannot {action} {}: {e}", path.display()))
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(namespace, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn save(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(namespace, key)?;
        let directory = self.directory(namespace)?;
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| io_error("create", &directory, e))?;
        let staging = directory.join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&staging, data).await {
            return Err(io_error("write", &staging, e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_error("replace", &path, e));
        }
        debug!("Saved {}", path.display());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let directory = self.directory(namespace)?;
        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", &directory, e)),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &directory, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(data) => records.push((key, data)),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}
