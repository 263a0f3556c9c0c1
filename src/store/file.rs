//! Directory-backed run store: one JSON file per key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

use super::RunStore;

const EXTENSION: &str = ".json";

/// A [`RunStore`] that keeps each key in its own JSON file.
///
/// Writes go to a temporary file first and are renamed into place, so a crash
/// never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        match tokio::fs::metadata(&dir).await {
            Ok(metadata) if !metadata.is_dir() => return Err(Error::InvalidStoreDir(dir)),
            _ => tokio::fs::create_dir_all(&dir).await?,
        }
        Ok(Self { dir })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn encode(key: &str) -> String {
        let mut name = String::with_capacity(key.len() + EXTENSION.len());
        for c in key.chars() {
            match c {
                '%' => name.push_str("%25"),
                ':' => name.push_str("%3A"),
                '/' => name.push_str("%2F"),
                '\\' => name.push_str("%5C"),
                _ => name.push(c),
            }
        }
        name.push_str(EXTENSION);
        name
    }

    fn decode(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(EXTENSION)?;
        if stem.starts_with('.') {
            return None;
        }
        Some(
            stem.replace("%3A", ":")
                .replace("%2F", "/")
                .replace("%5C", "\\")
                .replace("%25", "%"),
        )
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::encode(key))
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", Self::encode(key), uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Store(format!("failed to commit {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = Self::decode(&file_name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            // A concurrent delete between listing and reading is not an error.
            if let Some(value) = self.get(&key).await? {
                results.push((key, value));
            }
        }
        Ok(results)
    }
}
