use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use pop_types::{cbor, Address, ContentId, ExchangeError, Result, TokenAmount};

use crate::chain::Signature;

/// Key-value persistence seam for channel records and message results.
/// Values are CBOR; a single `put` is the unit of atomicity.
#[async_trait]
pub trait PaychBackend: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

pub struct MemoryPaychBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryPaychBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryPaychBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaychBackend for MemoryPaychBackend {
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

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelDirection {
    /// We are the recipient of payments on this channel.
    Inbound,
    /// We fund this channel and pay out on it.
    Outbound,
}

/// Redemption of a voucher on one lane rolled into a voucher on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneMerge {
    pub lane: u64,
    pub nonce: u64,
}

/// A signed off-chain promise of payment on a channel lane. Amounts are
/// cumulative per lane: a later voucher supersedes an earlier one with a
/// strictly greater nonce and a greater-or-equal amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub channel_addr: Address,
    pub lane: u64,
    pub nonce: u64,
    pub amount: TokenAmount,
    #[serde(default)]
    pub merges: Vec<LaneMerge>,
    #[serde(default)]
    pub time_lock_min: i64,
    #[serde(default)]
    pub time_lock_max: i64,
    #[serde(default)]
    pub secret_preimage: Option<Vec<u8>>,
    pub signature: Option<Signature>,
}

impl Voucher {
    pub fn new(channel_addr: Address, lane: u64, nonce: u64, amount: TokenAmount) -> Self {
        Self {
            channel_addr,
            lane,
            nonce,
            amount,
            merges: Vec::new(),
            time_lock_min: 0,
            time_lock_max: 0,
            secret_preimage: None,
            signature: None,
        }
    }

    /// Bytes covered by the signature: the voucher with its signature blanked.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        cbor::to_vec(&unsigned)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherInfo {
    pub voucher: Voucher,
    /// Whether the voucher was submitted for redemption on chain.
    pub submitted: bool,
}

/// Durable record of one payment channel. One record per `(from, to)`
/// direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub from: Address,
    pub to: Address,
    /// Robust on-chain address, absent until the create message confirmed.
    pub channel_addr: Option<Address>,
    pub direction: ChannelDirection,
    /// Confirmed on-chain total funded.
    pub amount: TokenAmount,
    /// Funds committed to an unconfirmed message.
    pub pending_amount: TokenAmount,
    /// Funds redeemable by outstanding vouchers.
    pub available_amount: TokenAmount,
    pub create_msg: Option<ContentId>,
    pub add_funds_msg: Option<ContentId>,
    pub next_lane: u64,
    pub vouchers: Vec<VoucherInfo>,
    /// Set once a settle message confirmed.
    pub settling: bool,
}

impl ChannelInfo {
    /// Highest-nonce voucher on a lane, if any.
    pub fn lane_top(&self, lane: u64) -> Option<&Voucher> {
        self.vouchers
            .iter()
            .map(|vi| &vi.voucher)
            .filter(|v| v.lane == lane)
            .max_by_key(|v| v.nonce)
    }

    /// Sum of the latest voucher amount on every lane.
    pub fn total_redeemable(&self) -> TokenAmount {
        let mut lanes: HashMap<u64, TokenAmount> = HashMap::new();
        for vi in &self.vouchers {
            let top = lanes.entry(vi.voucher.lane).or_default();
            if vi.voucher.amount > *top {
                *top = vi.voucher.amount;
            }
        }
        lanes.values().copied().sum()
    }
}

fn channel_key(id: &str) -> String {
    format!("channel/{id}")
}

fn msg_result_key(mcid: &ContentId) -> String {
    format!("msgres/{}", mcid.to_hex())
}

fn msg_channel_key(mcid: &ContentId) -> String {
    format!("msgchan/{}", mcid.to_hex())
}

/// Durable state of payment channels, vouchers, lanes, and pending on-chain
/// messages. Writes are serialized per channel by the manager; the store
/// offers single-record atomicity.
pub struct PaychStore {
    backend: Arc<dyn PaychBackend>,
    channels: RwLock<HashMap<String, ChannelInfo>>,
    /// Message digest -> channel id, so a waiter outcome can find its channel.
    msg_channels: RwLock<HashMap<ContentId, String>>,
    /// Message digest -> recorded error, if any.
    msg_results: RwLock<HashMap<ContentId, Option<String>>>,
    next_id: AtomicU64,
}

impl PaychStore {
    pub async fn new(backend: Arc<dyn PaychBackend>) -> Result<Self> {
        let mut channels = HashMap::new();
        let mut max_id = 0u64;
        for (_, value) in backend.list("channel/").await? {
            let info: ChannelInfo = cbor::from_slice(&value)?;
            if let Some(n) = info
                .channel_id
                .strip_prefix("paych-")
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_id = max_id.max(n);
            }
            channels.insert(info.channel_id.clone(), info);
        }
        let mut msg_channels = HashMap::new();
        for (key, value) in backend.list("msgchan/").await? {
            if let Some(hex) = key.strip_prefix("msgchan/") {
                if let Ok(mcid) = ContentId::from_hex(hex) {
                    msg_channels.insert(mcid, cbor::from_slice(&value)?);
                }
            }
        }
        let mut msg_results = HashMap::new();
        for (key, value) in backend.list("msgres/").await? {
            if let Some(hex) = key.strip_prefix("msgres/") {
                if let Ok(mcid) = ContentId::from_hex(hex) {
                    msg_results.insert(mcid, cbor::from_slice(&value)?);
                }
            }
        }
        Ok(Self {
            backend,
            channels: RwLock::new(channels),
            msg_channels: RwLock::new(msg_channels),
            msg_results: RwLock::new(msg_results),
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    async fn persist(&self, info: &ChannelInfo) -> Result<()> {
        let bytes = cbor::to_vec(info)?;
        self.backend.put(&channel_key(&info.channel_id), &bytes).await
    }

    /// Create the record for a channel whose create message was just pushed.
    pub async fn create_channel(
        &self,
        from: Address,
        to: Address,
        direction: ChannelDirection,
        create_msg: ContentId,
        amount: TokenAmount,
    ) -> Result<ChannelInfo> {
        let id = format!("paych-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ChannelInfo {
            channel_id: id.clone(),
            from,
            to,
            channel_addr: None,
            direction,
            amount: TokenAmount::ZERO,
            pending_amount: amount,
            available_amount: TokenAmount::ZERO,
            create_msg: Some(create_msg),
            add_funds_msg: None,
            next_lane: 0,
            vouchers: Vec::new(),
            settling: false,
        };
        {
            let mut channels = self.channels.write().await;
            channels.insert(id.clone(), info.clone());
        }
        self.persist(&info).await?;
        self.save_new_message(&id, create_msg).await?;
        debug!(channel_id = %id, from = %from, to = %to, "channel record created");
        Ok(info)
    }

    /// Start tracking a channel some counterparty funded toward us. The
    /// on-chain address is already known, so the record is born confirmed.
    pub async fn track_inbound_channel(
        &self,
        from: Address,
        to: Address,
        channel_addr: Address,
        amount: TokenAmount,
    ) -> Result<ChannelInfo> {
        let id = format!("paych-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ChannelInfo {
            channel_id: id.clone(),
            from,
            to,
            channel_addr: Some(channel_addr),
            direction: ChannelDirection::Inbound,
            amount,
            pending_amount: TokenAmount::ZERO,
            available_amount: TokenAmount::ZERO,
            create_msg: None,
            add_funds_msg: None,
            next_lane: 0,
            vouchers: Vec::new(),
            settling: false,
        };
        {
            let mut channels = self.channels.write().await;
            channels.insert(id.clone(), info.clone());
        }
        self.persist(&info).await?;
        debug!(channel_id = %id, channel_addr = %channel_addr, "inbound channel tracked");
        Ok(info)
    }

    pub async fn by_channel_id(&self, id: &str) -> Result<ChannelInfo> {
        let channels = self.channels.read().await;
        channels
            .get(id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("channel {id}")))
    }

    pub async fn by_channel_addr(&self, addr: &Address) -> Result<ChannelInfo> {
        let channels = self.channels.read().await;
        channels
            .values()
            .find(|c| c.channel_addr.as_ref() == Some(addr))
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("channel at {addr}")))
    }

    pub async fn by_from_to(
        &self,
        from: &Address,
        to: &Address,
        direction: ChannelDirection,
    ) -> Result<ChannelInfo> {
        let channels = self.channels.read().await;
        channels
            .values()
            .find(|c| c.from == *from && c.to == *to && c.direction == direction)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("channel {from} -> {to}")))
    }

    pub async fn by_message_cid(&self, mcid: &ContentId) -> Result<ChannelInfo> {
        let id = {
            let msgs = self.msg_channels.read().await;
            msgs.get(mcid)
                .cloned()
                .ok_or_else(|| ExchangeError::NotFound(format!("message {mcid}")))?
        };
        self.by_channel_id(&id).await
    }

    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let channels = self.channels.read().await;
        channels.values().cloned().collect()
    }

    /// Apply a mutation to a channel record and persist the result.
    pub async fn mutate_channel<F>(&self, id: &str, mutate: F) -> Result<ChannelInfo>
    where
        F: FnOnce(&mut ChannelInfo),
    {
        let info = {
            let mut channels = self.channels.write().await;
            let info = channels
                .get_mut(id)
                .ok_or_else(|| ExchangeError::NotFound(format!("channel {id}")))?;
            mutate(info);
            info.clone()
        };
        self.persist(&info).await?;
        Ok(info)
    }

    pub async fn allocate_lane(&self, id: &str) -> Result<u64> {
        let info = self.mutate_channel(id, |c| c.next_lane += 1).await?;
        Ok(info.next_lane - 1)
    }

    /// Persist a voucher, enforcing lane monotonicity: the voucher must carry
    /// a higher nonce than anything on its lane, and the lane amount never
    /// decreases.
    pub async fn save_voucher(&self, id: &str, voucher: Voucher) -> Result<()> {
        let info = {
            let mut channels = self.channels.write().await;
            let info = channels
                .get_mut(id)
                .ok_or_else(|| ExchangeError::NotFound(format!("channel {id}")))?;
            if let Some(top) = info.lane_top(voucher.lane) {
                if voucher.nonce <= top.nonce && voucher.amount <= top.amount {
                    return Err(ExchangeError::Protocol(format!(
                        "voucher superseded on lane {} (nonce {} <= {})",
                        voucher.lane, voucher.nonce, top.nonce
                    )));
                }
                if voucher.amount < top.amount {
                    return Err(ExchangeError::Protocol(format!(
                        "voucher amount decreases on lane {} ({} < {})",
                        voucher.lane, voucher.amount, top.amount
                    )));
                }
            }
            info.vouchers.push(VoucherInfo {
                voucher,
                submitted: false,
            });
            info.clone()
        };
        self.persist(&info).await
    }

    pub async fn save_new_message(&self, id: &str, mcid: ContentId) -> Result<()> {
        {
            let mut msgs = self.msg_channels.write().await;
            msgs.insert(mcid, id.to_string());
        }
        let bytes = cbor::to_vec(&id.to_string())?;
        self.backend.put(&msg_channel_key(&mcid), &bytes).await
    }

    /// Record the outcome of an on-chain operation keyed by message digest.
    pub async fn save_message_result(&self, mcid: ContentId, err: Option<String>) -> Result<()> {
        {
            let mut results = self.msg_results.write().await;
            results.insert(mcid, err.clone());
        }
        let bytes = cbor::to_vec(&err)?;
        self.backend.put(&msg_result_key(&mcid), &bytes).await
    }

    pub async fn message_result(&self, mcid: &ContentId) -> Option<Option<String>> {
        let results = self.msg_results.read().await;
        results.get(mcid).cloned()
    }

    /// Remove a channel record. Only valid in terminal states: creation never
    /// confirmed, or the channel has settled.
    pub async fn remove_channel(&self, id: &str) -> Result<()> {
        {
            let mut channels = self.channels.write().await;
            let info = channels
                .get(id)
                .ok_or_else(|| ExchangeError::NotFound(format!("channel {id}")))?;
            if info.channel_addr.is_some() && !info.settling {
                return Err(ExchangeError::Fatal(format!(
                    "channel {id} removed outside a terminal state"
                )));
            }
            channels.remove(id);
        }
        self.backend.delete(&channel_key(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    fn amt(u: u128) -> TokenAmount {
        TokenAmount::from_base_units(u)
    }

    async fn new_store() -> PaychStore {
        PaychStore::new(Arc::new(MemoryPaychBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = new_store().await;
        let mcid = ContentId::of_block(b"create-msg");
        let info = store
            .create_channel(addr(1), addr(2), ChannelDirection::Outbound, mcid, amt(100))
            .await
            .unwrap();

        assert_eq!(info.pending_amount, amt(100));
        assert_eq!(info.amount, TokenAmount::ZERO);
        assert_eq!(info.create_msg, Some(mcid));

        let by_id = store.by_channel_id(&info.channel_id).await.unwrap();
        assert_eq!(by_id, info);
        let by_msg = store.by_message_cid(&mcid).await.unwrap();
        assert_eq!(by_msg.channel_id, info.channel_id);
        let by_pair = store
            .by_from_to(&addr(1), &addr(2), ChannelDirection::Outbound)
            .await
            .unwrap();
        assert_eq!(by_pair.channel_id, info.channel_id);
    }

    #[tokio::test]
    async fn test_lane_allocation_monotone() {
        let store = new_store().await;
        let info = store
            .create_channel(
                addr(1),
                addr(2),
                ChannelDirection::Outbound,
                ContentId::of_block(b"m"),
                amt(10),
            )
            .await
            .unwrap();
        assert_eq!(store.allocate_lane(&info.channel_id).await.unwrap(), 0);
        assert_eq!(store.allocate_lane(&info.channel_id).await.unwrap(), 1);
        assert_eq!(store.allocate_lane(&info.channel_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_voucher_monotonicity() {
        let store = new_store().await;
        let ch = Address::from_bytes([9; 32]);
        let info = store
            .create_channel(
                addr(1),
                addr(2),
                ChannelDirection::Outbound,
                ContentId::of_block(b"m"),
                amt(100),
            )
            .await
            .unwrap();
        let id = info.channel_id.clone();

        store
            .save_voucher(&id, Voucher::new(ch, 0, 1, amt(10)))
            .await
            .unwrap();
        store
            .save_voucher(&id, Voucher::new(ch, 0, 2, amt(25)))
            .await
            .unwrap();

        // Stale nonce with no larger amount.
        assert!(store
            .save_voucher(&id, Voucher::new(ch, 0, 2, amt(20)))
            .await
            .is_err());
        // Fresh nonce but the lane amount would decrease.
        assert!(store
            .save_voucher(&id, Voucher::new(ch, 0, 3, amt(5)))
            .await
            .is_err());
        // Other lanes are independent.
        store
            .save_voucher(&id, Voucher::new(ch, 1, 1, amt(5)))
            .await
            .unwrap();

        let info = store.by_channel_id(&id).await.unwrap();
        assert_eq!(info.total_redeemable(), amt(30));
    }

    #[tokio::test]
    async fn test_remove_channel_terminal_only() {
        let store = new_store().await;
        let info = store
            .create_channel(
                addr(1),
                addr(2),
                ChannelDirection::Outbound,
                ContentId::of_block(b"m"),
                amt(10),
            )
            .await
            .unwrap();
        let id = info.channel_id.clone();

        // Unconfirmed creation is terminal enough.
        store.remove_channel(&id).await.unwrap();

        let info = store
            .create_channel(
                addr(3),
                addr(4),
                ChannelDirection::Outbound,
                ContentId::of_block(b"m2"),
                amt(10),
            )
            .await
            .unwrap();
        let id = info.channel_id.clone();
        store
            .mutate_channel(&id, |c| c.channel_addr = Some(addr(9)))
            .await
            .unwrap();
        assert!(store.remove_channel(&id).await.is_err());

        store.mutate_channel(&id, |c| c.settling = true).await.unwrap();
        store.remove_channel(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_from_backend() {
        let backend = Arc::new(MemoryPaychBackend::new());
        let mcid = ContentId::of_block(b"persisted-msg");
        let id;
        {
            let store = PaychStore::new(backend.clone()).await.unwrap();
            let info = store
                .create_channel(addr(1), addr(2), ChannelDirection::Outbound, mcid, amt(7))
                .await
                .unwrap();
            id = info.channel_id.clone();
            store
                .save_message_result(mcid, Some("boom".into()))
                .await
                .unwrap();
        }
        let store = PaychStore::new(backend).await.unwrap();
        assert!(store.by_channel_id(&id).await.is_ok());
        assert_eq!(store.message_result(&mcid).await, Some(Some("boom".into())));
        // Fresh ids never collide with reloaded ones.
        let info2 = store
            .create_channel(
                addr(5),
                addr(6),
                ChannelDirection::Outbound,
                ContentId::of_block(b"m3"),
                amt(1),
            )
            .await
            .unwrap();
        assert_ne!(info2.channel_id, id);
    }
}
