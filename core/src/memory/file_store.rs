use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use quarry_protocol::Field;
use quarry_protocol::MemoryEntry;
use quarry_protocol::Row;
use tracing::warn;

use super::MemoryStore;
use super::memory_key;
use crate::error::QuarryErr;
use crate::error::Result;

/// Durable store: one self-describing JSON document per entry under a root
/// directory. Writes go through a temp file and a rename, which gives the
/// required key-level atomicity on POSIX filesystems.
pub struct FileMemoryStore {
    root: PathBuf,
}

impl FileMemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn put(
        &self,
        session_id: &str,
        query_idx: usize,
        attempt: u32,
        schema: Vec<Field>,
        rows: Vec<Row>,
    ) -> Result<String> {
        let key = memory_key(session_id, query_idx, attempt);
        let entry = MemoryEntry {
            key: key.clone(),
            session_id: session_id.to_string(),
            query_idx,
            attempt,
            schema,
            row_count: rows.len() as u64,
            created_at: Utc::now(),
            rows,
        };

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.entry_path(&key);
        let tmp = self.root.join(format!(".{key}.json.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<MemoryEntry> {
        let path = self.entry_path(key);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| QuarryErr::Memory(format!("no entry for key {key}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(&self, session_id: &str) -> Result<Vec<String>> {
        let prefix = format!("{session_id}-");
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(_) => return Ok(keys),
        };
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            if let Some(key) = name.strip_suffix(".json")
                && key.starts_with(&prefix)
            {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn sweep(&self, older_than: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(_) => return Ok(0),
        };
        while let Some(dirent) = dir.next_entry().await? {
            if !dirent.file_name().to_string_lossy().ends_with(".json") {
                continue;
            }
            let Ok(metadata) = dirent.metadata().await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if modified < cutoff {
                if let Err(err) = tokio::fs::remove_file(dirent.path()).await {
                    warn!("failed to sweep {}: {err}", dirent.path().display());
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
