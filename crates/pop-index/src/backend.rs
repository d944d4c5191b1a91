use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use pop_types::Result;

/// Key-value persistence seam for the ref table. A single `put` is the unit
/// of crash safety: the table is never left half-written.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries in key order.
    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Flush pending writes. Store deletion only follows a successful flush.
    async fn flush(&self) -> Result<()>;
}

/// In-memory backend used by tests and by nodes that opt out of persistence.
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexBackend for MemoryBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
