use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use pop_types::{cbor, ContentId, ExchangeError, Result, StoreId};

use crate::backend::IndexBackend;
use crate::store::MultiStore;

/// A committed or retrieved content root tracked by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub payload_cid: ContentId,
    pub payload_size: u64,
    pub store_id: StoreId,
    #[serde(default)]
    pub freq: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl DataRef {
    pub fn new(payload_cid: ContentId, payload_size: u64, store_id: StoreId) -> Self {
        Self {
            payload_cid,
            payload_size,
            store_id,
            freq: 0,
            tags: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefEntry {
    data: DataRef,
    seq: u64,
    dropped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Maximum bytes of content to keep before evicting cold refs.
    /// Zero disables eviction.
    pub capacity: u64,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { capacity: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub ref_count: usize,
    pub total_bytes: u64,
}

/// Authoritative local mapping content-root -> store id, size, and frequency
/// counters. All mutation happens under the table write lock; `gc` is bounded
/// to one concurrent run.
pub struct Index {
    backend: Arc<dyn IndexBackend>,
    ms: Arc<MultiStore>,
    refs: RwLock<HashMap<ContentId, RefEntry>>,
    next_seq: AtomicU64,
    gc_guard: Mutex<()>,
    capacity: u64,
}

fn ref_key(root: &ContentId) -> String {
    format!("ref/{}", root.to_hex())
}

impl Index {
    /// Open the index, replaying any persisted entries from the backend.
    pub async fn new(
        backend: Arc<dyn IndexBackend>,
        ms: Arc<MultiStore>,
        options: IndexOptions,
    ) -> Result<Self> {
        let mut refs = HashMap::new();
        let mut max_seq = 0;
        for (key, value) in backend.list().await? {
            if !key.starts_with("ref/") {
                continue;
            }
            let entry: RefEntry = cbor::from_slice(&value)?;
            max_seq = max_seq.max(entry.seq);
            refs.insert(entry.data.payload_cid, entry);
        }
        if !refs.is_empty() {
            info!(refs = refs.len(), "index loaded");
        }
        Ok(Self {
            backend,
            ms,
            refs: RwLock::new(refs),
            next_seq: AtomicU64::new(max_seq + 1),
            gc_guard: Mutex::new(()),
            capacity: options.capacity,
        })
    }

    pub fn multistore(&self) -> &Arc<MultiStore> {
        &self.ms
    }

    async fn persist(&self, entry: &RefEntry) -> Result<()> {
        let bytes = cbor::to_vec(entry)?;
        self.backend
            .put(&ref_key(&entry.data.payload_cid), &bytes)
            .await
    }

    /// Register a new ref. Idempotent for an identical ref; a distinct ref
    /// for the same root is rejected.
    pub async fn set_ref(&self, data: DataRef) -> Result<()> {
        let root = data.payload_cid;
        let entry = {
            let mut refs = self.refs.write().await;
            if let Some(existing) = refs.get(&root) {
                if existing.data == data && !existing.dropped {
                    return Ok(());
                }
                return Err(ExchangeError::AlreadyExists(format!("ref for {root}")));
            }
            let entry = RefEntry {
                data,
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                dropped: false,
            };
            refs.insert(root, entry.clone());
            entry
        };
        self.persist(&entry).await?;
        debug!(root = %root, store_id = %entry.data.store_id, "ref registered");

        if self.capacity > 0 {
            self.evict_over_capacity(root).await?;
        }
        Ok(())
    }

    /// Overwrite the counters of an existing ref, preserving its store id.
    pub async fn update_ref(&self, data: DataRef) -> Result<()> {
        let entry = {
            let mut refs = self.refs.write().await;
            let entry = refs
                .get_mut(&data.payload_cid)
                .ok_or_else(|| ExchangeError::NotFound(format!("ref for {}", data.payload_cid)))?;
            entry.data.payload_size = data.payload_size;
            entry.data.freq = data.freq;
            entry.data.tags = data.tags;
            entry.clone()
        };
        self.persist(&entry).await
    }

    pub async fn peek_ref(&self, root: &ContentId) -> Result<DataRef> {
        let refs = self.refs.read().await;
        refs.get(root)
            .filter(|e| !e.dropped)
            .map(|e| e.data.clone())
            .ok_or_else(|| ExchangeError::NotFound(format!("ref for {root}")))
    }

    pub async fn get_store_id(&self, root: &ContentId) -> Result<StoreId> {
        self.peek_ref(root).await.map(|r| r.store_id)
    }

    /// Record a retrieval hit against the root.
    pub async fn record_hit(&self, root: &ContentId) -> Result<()> {
        let entry = {
            let mut refs = self.refs.write().await;
            let entry = refs
                .get_mut(root)
                .ok_or_else(|| ExchangeError::NotFound(format!("ref for {root}")))?;
            entry.data.freq += 1;
            entry.clone()
        };
        self.persist(&entry).await
    }

    /// Pin a ref so eviction and gc leave it alone.
    pub async fn add_tag(&self, root: &ContentId, tag: impl Into<String>) -> Result<()> {
        let entry = {
            let mut refs = self.refs.write().await;
            let entry = refs
                .get_mut(root)
                .ok_or_else(|| ExchangeError::NotFound(format!("ref for {root}")))?;
            entry.data.tags.insert(tag.into());
            entry.clone()
        };
        self.persist(&entry).await
    }

    pub async fn drop_tag(&self, root: &ContentId, tag: &str) -> Result<()> {
        let entry = {
            let mut refs = self.refs.write().await;
            let entry = refs
                .get_mut(root)
                .ok_or_else(|| ExchangeError::NotFound(format!("ref for {root}")))?;
            entry.data.tags.remove(tag);
            entry.clone()
        };
        self.persist(&entry).await
    }

    /// Mark a ref for the next gc run.
    pub async fn drop_ref(&self, root: &ContentId) -> Result<()> {
        let entry = {
            let mut refs = self.refs.write().await;
            let entry = refs
                .get_mut(root)
                .ok_or_else(|| ExchangeError::NotFound(format!("ref for {root}")))?;
            entry.dropped = true;
            entry.clone()
        };
        self.persist(&entry).await
    }

    /// Live refs ordered by descending frequency, then insertion order.
    pub async fn list_refs(&self) -> Vec<DataRef> {
        let refs = self.refs.read().await;
        let mut entries: Vec<&RefEntry> = refs.values().filter(|e| !e.dropped).collect();
        entries.sort_by(|a, b| b.data.freq.cmp(&a.data.freq).then(a.seq.cmp(&b.seq)));
        entries.iter().map(|e| e.data.clone()).collect()
    }

    pub async fn stats(&self) -> IndexStats {
        let refs = self.refs.read().await;
        let live = refs.values().filter(|e| !e.dropped);
        let mut stats = IndexStats::default();
        for entry in live {
            stats.ref_count += 1;
            stats.total_bytes += entry.data.payload_size;
        }
        stats
    }

    /// Remove refs marked dropped and delete their backing stores. The table
    /// entry is flushed out before the store goes away, so a crash can leave
    /// an orphan store (swept later) but never a dangling ref.
    pub async fn gc(&self) -> Result<usize> {
        let _guard = self.gc_guard.lock().await;

        let victims: Vec<RefEntry> = {
            let mut refs = self.refs.write().await;
            let roots: Vec<ContentId> = refs
                .values()
                .filter(|e| e.dropped && e.data.tags.is_empty())
                .map(|e| e.data.payload_cid)
                .collect();
            roots.iter().filter_map(|r| refs.remove(r)).collect()
        };

        let mut removed = 0;
        for entry in victims {
            if let Err(e) = self.backend.delete(&ref_key(&entry.data.payload_cid)).await {
                // Restore the entry so the table matches the backend again.
                let mut refs = self.refs.write().await;
                refs.insert(entry.data.payload_cid, entry);
                return Err(e);
            }
            self.backend.flush().await?;
            self.ms.delete(entry.data.store_id).await?;
            removed += 1;
            debug!(root = %entry.data.payload_cid, "ref collected");
        }
        if removed > 0 {
            info!(removed, "index gc complete");
        }
        Ok(removed)
    }

    /// Sweep stores with no referencing ref.
    pub async fn clean_block_store(&self) -> Result<usize> {
        let referenced: HashSet<StoreId> = {
            let refs = self.refs.read().await;
            refs.values().map(|e| e.data.store_id).collect()
        };
        let mut swept = 0;
        for id in self.ms.list().await {
            if !referenced.contains(&id) {
                self.ms.delete(id).await?;
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "orphan stores cleaned");
        }
        Ok(swept)
    }

    /// Evict the coldest untagged refs until total content fits under the
    /// capacity watermark. The just-inserted root is never evicted.
    async fn evict_over_capacity(&self, keep: ContentId) -> Result<()> {
        loop {
            let victim = {
                let refs = self.refs.read().await;
                let total: u64 = refs
                    .values()
                    .filter(|e| !e.dropped)
                    .map(|e| e.data.payload_size)
                    .sum();
                if total <= self.capacity {
                    return Ok(());
                }
                refs.values()
                    .filter(|e| {
                        !e.dropped && e.data.tags.is_empty() && e.data.payload_cid != keep
                    })
                    .min_by(|a, b| a.data.freq.cmp(&b.data.freq).then(a.seq.cmp(&b.seq)))
                    .map(|e| e.data.payload_cid)
            };
            let Some(root) = victim else {
                warn!(capacity = self.capacity, "over capacity with nothing evictable");
                return Ok(());
            };
            info!(root = %root, "evicting cold ref over capacity");
            self.drop_ref(&root).await?;
            self.gc().await?;
        }
    }
}
