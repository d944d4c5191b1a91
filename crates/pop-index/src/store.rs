use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use pop_types::{ContentId, ExchangeError, Result, StoreId};

/// Content-addressed block storage. Blocks are named by the digest of their
/// bytes; the store never holds two blocks under one id.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block. Rejects bytes that do not hash to `id`, so nothing a
    /// peer streams at us can land under a forged name.
    async fn put_block(&self, id: ContentId, data: Vec<u8>) -> Result<()>;

    async fn get_block(&self, id: &ContentId) -> Result<Option<Vec<u8>>>;

    async fn has_block(&self, id: &ContentId) -> Result<bool>;

    async fn delete_block(&self, id: &ContentId) -> Result<()>;

    async fn list_blocks(&self) -> Result<Vec<ContentId>>;

    /// Total bytes held by the store.
    async fn size(&self) -> Result<u64>;
}

/// In-memory block store.
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put_block(&self, id: ContentId, data: Vec<u8>) -> Result<()> {
        if !id.verifies(&data) {
            return Err(ExchangeError::Protocol(format!(
                "block bytes do not hash to {id}"
            )));
        }
        let mut blocks = self.blocks.write().await;
        blocks.insert(id, data);
        Ok(())
    }

    async fn get_block(&self, id: &ContentId) -> Result<Option<Vec<u8>>> {
        let blocks = self.blocks.read().await;
        Ok(blocks.get(id).cloned())
    }

    async fn has_block(&self, id: &ContentId) -> Result<bool> {
        let blocks = self.blocks.read().await;
        Ok(blocks.contains_key(id))
    }

    async fn delete_block(&self, id: &ContentId) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        blocks.remove(id);
        Ok(())
    }

    async fn list_blocks(&self) -> Result<Vec<ContentId>> {
        let blocks = self.blocks.read().await;
        Ok(blocks.keys().copied().collect())
    }

    async fn size(&self) -> Result<u64> {
        let blocks = self.blocks.read().await;
        Ok(blocks.values().map(|b| b.len() as u64).sum())
    }
}

/// Allocates one isolated block store per content root so a failed or
/// partial transfer can be discarded wholesale.
pub struct MultiStore {
    stores: RwLock<HashMap<StoreId, Arc<MemoryBlockStore>>>,
    next_id: AtomicU64,
}

impl MultiStore {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh store and return its id.
    pub async fn next(&self) -> StoreId {
        let id = StoreId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stores = self.stores.write().await;
        stores.insert(id, Arc::new(MemoryBlockStore::new()));
        debug!(store_id = %id, "allocated block store");
        id
    }

    pub async fn get(&self, id: StoreId) -> Result<Arc<MemoryBlockStore>> {
        let stores = self.stores.read().await;
        stores
            .get(&id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("store {id}")))
    }

    pub async fn delete(&self, id: StoreId) -> Result<()> {
        let mut stores = self.stores.write().await;
        stores.remove(&id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<StoreId> {
        let stores = self.stores.read().await;
        stores.keys().copied().collect()
    }

    pub async fn store_size(&self, id: StoreId) -> Result<u64> {
        let store = self.get(id).await?;
        store.size().await
    }
}

impl Default for MultiStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_store_roundtrip() {
        let store = MemoryBlockStore::new();
        let data = b"block data".to_vec();
        let id = ContentId::of_block(&data);

        store.put_block(id, data.clone()).await.unwrap();
        assert!(store.has_block(&id).await.unwrap());
        assert_eq!(store.get_block(&id).await.unwrap(), Some(data));

        store.delete_block(&id).await.unwrap();
        assert!(!store.has_block(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_forged_block_rejected() {
        let store = MemoryBlockStore::new();
        let id = ContentId::of_block(b"the real bytes");
        let res = store.put_block(id, b"different bytes".to_vec()).await;
        assert!(matches!(res, Err(ExchangeError::Protocol(_))));
        assert!(!store.has_block(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_multistore_isolation() {
        let ms = MultiStore::new();
        let s1 = ms.next().await;
        let s2 = ms.next().await;
        assert_ne!(s1, s2);

        let data = b"only in s1".to_vec();
        let id = ContentId::of_block(&data);
        ms.get(s1).await.unwrap().put_block(id, data).await.unwrap();

        assert!(ms.get(s1).await.unwrap().has_block(&id).await.unwrap());
        assert!(!ms.get(s2).await.unwrap().has_block(&id).await.unwrap());

        ms.delete(s1).await.unwrap();
        assert!(ms.get(s1).await.is_err());
    }
}
