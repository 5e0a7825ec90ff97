use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quarry_protocol::Field;
use quarry_protocol::MemoryEntry;
use quarry_protocol::Row;

use super::MemoryStore;
use super::memory_key;
use crate::error::QuarryErr;
use crate::error::Result;

/// Volatile in-process store. The simplest correct implementation of the
/// memory contract; used by tests and by embedders that do not need
/// durability between sessions.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemoryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
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
        self.lock().insert(key.clone(), entry);
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<MemoryEntry> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| QuarryErr::Memory(format!("no entry for key {key}")))
    }

    async fn list(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .values()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.key.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn sweep(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| QuarryErr::Memory(err.to_string()))?;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at > cutoff);
        Ok(before - entries.len())
    }
}
