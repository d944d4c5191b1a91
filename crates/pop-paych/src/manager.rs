use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use pop_types::{
    cbor, Address, ContentId, ExchangeError, Result, TokenAmount, MSG_CONFIDENCE,
};

use crate::chain::{method, Chain, CreateChannelParams, ExecReturn, Message, SignedMessage, Wallet};
use crate::funds::{FundsHandle, FundsReq, FundsRes, MergedFundsReq};
use crate::state::{load_channel_state, ChannelState};
use crate::store::{ChannelDirection, ChannelInfo, PaychStore, Voucher};

/// Callback fired exactly once when the waiter for a message records its
/// outcome.
pub type MsgCompleteCb = Box<dyn FnOnce(Option<String>) + Send>;

/// Result of `create_voucher`: either a signed voucher, or the shortfall the
/// caller must top the channel up by.
#[derive(Debug)]
pub struct VoucherCreateResult {
    pub voucher: Option<Voucher>,
    pub shortfall: TokenAmount,
}

/// Holds the channel lock: global read side plus the per-channel mutex.
/// Declared so the per-channel half releases first.
struct ChannelLock {
    _chan: OwnedMutexGuard<()>,
    _global: OwnedRwLockReadGuard<()>,
}

/// Serializes every operation against one `(from, to)` pair and owns its
/// funds-request queue.
struct ChannelAccessor {
    from: Address,
    to: Address,
    chain: Arc<dyn Chain>,
    wallet: Arc<dyn Wallet>,
    store: Arc<PaychStore>,
    global: Arc<RwLock<()>>,
    chan_lock: Arc<Mutex<()>>,
    queue: Mutex<VecDeque<FundsReq>>,
    /// Digest of the one outstanding funding operation, if any.
    msg_in_flight: Mutex<Option<ContentId>>,
    queue_wake: Notify,
    listeners: Arc<Mutex<HashMap<ContentId, Vec<MsgCompleteCb>>>>,
}

impl ChannelAccessor {
    /// Acquire global-read then per-channel; released in reverse.
    async fn lock(&self) -> ChannelLock {
        let global = self.global.clone().read_owned().await;
        let chan = self.chan_lock.clone().lock_owned().await;
        ChannelLock {
            _chan: chan,
            _global: global,
        }
    }

    async fn sign_message(&self, message: Message) -> Result<SignedMessage> {
        let bytes = cbor::to_vec(&message)?;
        let signature = self.wallet.sign(message.from, &bytes).await?;
        Ok(SignedMessage { message, signature })
    }

    /// Long-running queue processor. Woken on enqueue and on message
    /// completion; drains the queue whenever no funding operation is
    /// outstanding.
    async fn run_queue(self: Arc<Self>) {
        loop {
            self.queue_wake.notified().await;
            if let Err(e) = Self::process_queue(&self).await {
                warn!(from = %self.from, to = %self.to, error = %e, "funds queue processing failed");
            }
        }
    }

    /// Drain all currently-active requests into one merged request and
    /// submit a single create or add-funds message for the sum.
    async fn process_queue(this: &Arc<Self>) -> Result<()> {
        let _lk = this.lock().await;

        {
            let in_flight = this.msg_in_flight.lock().await;
            if in_flight.is_some() {
                return Ok(());
            }
        }

        let reqs: Vec<FundsReq> = {
            let mut queue = this.queue.lock().await;
            queue.drain(..).collect()
        };
        if reqs.is_empty() {
            return Ok(());
        }

        let merged = MergedFundsReq::new(reqs);
        // Every constituent was cancelled while queued; nothing to submit.
        if merged.is_cancelled() {
            return Ok(());
        }
        let amount = merged.sum();

        let existing = this
            .store
            .by_from_to(&this.from, &this.to, ChannelDirection::Outbound)
            .await
            .ok();

        match existing {
            Some(info) => match info.channel_addr {
                Some(addr) => Self::submit_add_funds(this, merged, info, addr, amount).await,
                None => {
                    // Creation from an earlier run is still unconfirmed;
                    // re-arm the waiter and keep the requests queued.
                    if let Some(mcid) = info.create_msg {
                        {
                            let mut queue = this.queue.lock().await;
                            for req in merged.reqs {
                                queue.push_front(req);
                            }
                        }
                        let mut in_flight = this.msg_in_flight.lock().await;
                        *in_flight = Some(mcid);
                        let accessor = this.clone();
                        let channel_id = info.channel_id.clone();
                        tokio::spawn(async move {
                            Self::wait_create(
                                &accessor,
                                MergedFundsReq::new(Vec::new()),
                                channel_id,
                                mcid,
                            )
                            .await;
                        });
                    }
                    Ok(())
                }
            },
            None => Self::submit_create(this, merged, amount).await,
        }
    }

    async fn submit_create(
        this: &Arc<Self>,
        mut merged: MergedFundsReq,
        amount: TokenAmount,
    ) -> Result<()> {
        let submit = async {
            let params = cbor::to_vec(&CreateChannelParams {
                from: this.from,
                to: this.to,
            })?;
            let message = Message {
                from: this.from,
                to: Address::init_actor(),
                value: amount,
                method: method::INIT_EXEC,
                params,
                nonce: this.chain.next_nonce(this.from).await?,
            };
            let signed = this.sign_message(message).await?;
            this.chain.mpool_push(signed).await
        };
        let mcid = match submit.await {
            Ok(mcid) => mcid,
            Err(e) => {
                merged.complete(FundsRes {
                    channel_addr: None,
                    mcid: None,
                    err: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        let info = this
            .store
            .create_channel(this.from, this.to, ChannelDirection::Outbound, mcid, amount)
            .await?;
        {
            let mut in_flight = this.msg_in_flight.lock().await;
            *in_flight = Some(mcid);
        }
        info!(channel_id = %info.channel_id, mcid = %mcid, amount = %amount, "channel create submitted");

        let accessor = this.clone();
        let channel_id = info.channel_id;
        tokio::spawn(async move {
            Self::wait_create(&accessor, merged, channel_id, mcid).await;
        });
        Ok(())
    }

    async fn submit_add_funds(
        this: &Arc<Self>,
        mut merged: MergedFundsReq,
        info: ChannelInfo,
        addr: Address,
        amount: TokenAmount,
    ) -> Result<()> {
        let submit = async {
            let message = Message {
                from: this.from,
                to: addr,
                value: amount,
                method: method::SEND,
                params: Vec::new(),
                nonce: this.chain.next_nonce(this.from).await?,
            };
            let signed = this.sign_message(message).await?;
            this.chain.mpool_push(signed).await
        };
        let mcid = match submit.await {
            Ok(mcid) => mcid,
            Err(e) => {
                merged.complete(FundsRes {
                    channel_addr: Some(addr),
                    mcid: None,
                    err: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        this.store
            .mutate_channel(&info.channel_id, |c| {
                c.pending_amount = amount;
                c.add_funds_msg = Some(mcid);
            })
            .await?;
        this.store.save_new_message(&info.channel_id, mcid).await?;
        {
            let mut in_flight = this.msg_in_flight.lock().await;
            *in_flight = Some(mcid);
        }
        info!(channel_id = %info.channel_id, mcid = %mcid, amount = %amount, "add-funds submitted");

        let accessor = this.clone();
        let channel_id = info.channel_id;
        tokio::spawn(async move {
            Self::wait_add_funds(&accessor, merged, channel_id, addr, mcid).await;
        });
        Ok(())
    }

    async fn wait_create(
        this: &Arc<Self>,
        merged: MergedFundsReq,
        channel_id: String,
        mcid: ContentId,
    ) {
        let res = this.wait_create_inner(&channel_id, mcid).await;
        let fres = match res {
            Ok(addr) => FundsRes {
                channel_addr: Some(addr),
                mcid: Some(mcid),
                err: None,
            },
            Err(ref e) => FundsRes {
                channel_addr: None,
                mcid: Some(mcid),
                err: Some(e.to_string()),
            },
        };
        Self::msg_wait_complete(this, mcid, merged, fres).await;
    }

    async fn wait_create_inner(&self, channel_id: &str, mcid: ContentId) -> Result<Address> {
        let lookup = self.chain.state_wait_msg(mcid, MSG_CONFIDENCE).await?;

        if lookup.receipt.exit_code != 0 {
            let _lk = self.lock().await;
            // Creation failed; drop the record entirely.
            if let Err(e) = self.store.remove_channel(channel_id).await {
                warn!(channel_id = %channel_id, error = %e, "failed to remove channel after create failure");
            }
            return Err(ExchangeError::ChainReject {
                mcid,
                exit_code: lookup.receipt.exit_code,
            });
        }

        let ret: ExecReturn = cbor::from_slice(&lookup.receipt.return_data)
            .map_err(|e| ExchangeError::Protocol(format!("create return decode: {e}")))?;

        let _lk = self.lock().await;
        self.store
            .mutate_channel(channel_id, |c| {
                c.channel_addr = Some(ret.robust_address);
                c.amount = c.pending_amount;
                c.available_amount = c.available_amount.saturating_add(c.pending_amount);
                c.pending_amount = TokenAmount::ZERO;
                c.create_msg = None;
            })
            .await?;
        info!(channel_id = %channel_id, channel_addr = %ret.robust_address, "channel created on chain");
        Ok(ret.robust_address)
    }

    async fn wait_add_funds(
        this: &Arc<Self>,
        merged: MergedFundsReq,
        channel_id: String,
        addr: Address,
        mcid: ContentId,
    ) {
        let res = this.wait_add_funds_inner(&channel_id, mcid).await;
        let fres = match res {
            Ok(()) => FundsRes {
                channel_addr: Some(addr),
                mcid: Some(mcid),
                err: None,
            },
            Err(ref e) => FundsRes {
                channel_addr: Some(addr),
                mcid: Some(mcid),
                err: Some(e.to_string()),
            },
        };
        Self::msg_wait_complete(this, mcid, merged, fres).await;
    }

    async fn wait_add_funds_inner(&self, channel_id: &str, mcid: ContentId) -> Result<()> {
        let lookup = self.chain.state_wait_msg(mcid, MSG_CONFIDENCE).await?;

        let _lk = self.lock().await;
        if lookup.receipt.exit_code != 0 {
            // Funds never moved; roll the pending amount back.
            self.store
                .mutate_channel(channel_id, |c| {
                    c.pending_amount = TokenAmount::ZERO;
                    c.add_funds_msg = None;
                })
                .await?;
            return Err(ExchangeError::ChainReject {
                mcid,
                exit_code: lookup.receipt.exit_code,
            });
        }

        self.store
            .mutate_channel(channel_id, |c| {
                c.amount = c.amount.saturating_add(c.pending_amount);
                c.available_amount = c.available_amount.saturating_add(c.pending_amount);
                c.pending_amount = TokenAmount::ZERO;
                c.add_funds_msg = None;
            })
            .await?;
        Ok(())
    }

    /// Waiter cleanup: record the outcome, fire listeners, resolve promises,
    /// then let the queue move on to the next request.
    async fn msg_wait_complete(
        this: &Arc<Self>,
        mcid: ContentId,
        mut merged: MergedFundsReq,
        fres: FundsRes,
    ) {
        {
            let _lk = this.lock().await;

            if let Err(e) = this.store.save_message_result(mcid, fres.err.clone()).await {
                warn!(mcid = %mcid, error = %e, "saving message result failed");
            }

            let callbacks = {
                let mut listeners = this.listeners.lock().await;
                listeners.remove(&mcid).unwrap_or_default()
            };
            for cb in callbacks {
                cb(fres.err.clone());
            }

            {
                let mut in_flight = this.msg_in_flight.lock().await;
                *in_flight = None;
            }
            merged.complete(fres);
        }
        // The queue may have been waiting on this completion.
        this.queue_wake.notify_one();
    }
}

/// Channel lifecycle manager: create, add funds, merge concurrent requests,
/// allocate lanes, sign/save vouchers, settle, and collect.
pub struct PaychMgr {
    chain: Arc<dyn Chain>,
    wallet: Arc<dyn Wallet>,
    store: Arc<PaychStore>,
    global: Arc<RwLock<()>>,
    accessors: RwLock<HashMap<(Address, Address), Arc<ChannelAccessor>>>,
    listeners: Arc<Mutex<HashMap<ContentId, Vec<MsgCompleteCb>>>>,
}

impl PaychMgr {
    pub fn new(chain: Arc<dyn Chain>, wallet: Arc<dyn Wallet>, store: Arc<PaychStore>) -> Self {
        Self {
            chain,
            wallet,
            store,
            global: Arc::new(RwLock::new(())),
            accessors: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<PaychStore> {
        &self.store
    }

    /// Get or create the accessor serializing operations for `(from, to)`.
    /// Adding one mutates the channel index, so it takes the global write
    /// lock.
    async fn accessor(&self, from: Address, to: Address) -> Arc<ChannelAccessor> {
        {
            let accessors = self.accessors.read().await;
            if let Some(acc) = accessors.get(&(from, to)) {
                return acc.clone();
            }
        }
        let _w = self.global.write().await;
        let mut accessors = self.accessors.write().await;
        accessors
            .entry((from, to))
            .or_insert_with(|| {
                let acc = Arc::new(ChannelAccessor {
                    from,
                    to,
                    chain: self.chain.clone(),
                    wallet: self.wallet.clone(),
                    store: self.store.clone(),
                    global: self.global.clone(),
                    chan_lock: Arc::new(Mutex::new(())),
                    queue: Mutex::new(VecDeque::new()),
                    msg_in_flight: Mutex::new(None),
                    queue_wake: Notify::new(),
                    listeners: self.listeners.clone(),
                });
                tokio::spawn(acc.clone().run_queue());
                acc
            })
            .clone()
    }

    /// Accessor for a channel we already track, resolved by its on-chain
    /// address.
    async fn accessor_by_addr(&self, addr: &Address) -> Result<(Arc<ChannelAccessor>, ChannelInfo)> {
        let info = self.store.by_channel_addr(addr).await?;
        let acc = self.accessor(info.from, info.to).await;
        Ok((acc, info))
    }

    /// Enqueue a request to ensure `amount` more funds are available on the
    /// channel from -> to, creating the channel if needed. Concurrent
    /// requests merge into a single on-chain message.
    pub async fn get_or_create_channel(
        &self,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<FundsHandle> {
        let accessor = self.accessor(from, to).await;
        let (req, handle) = FundsReq::new(amount);
        {
            let mut queue = accessor.queue.lock().await;
            queue.push_back(req);
        }
        debug!(from = %from, to = %to, amount = %amount, "funds request queued");
        accessor.queue_wake.notify_one();
        Ok(handle)
    }

    pub async fn allocate_lane(&self, addr: &Address) -> Result<u64> {
        let (accessor, info) = self.accessor_by_addr(addr).await?;
        let _lk = accessor.lock().await;
        self.store.allocate_lane(&info.channel_id).await
    }

    /// Sign a voucher for the cumulative `amount` on `lane`. Returns a
    /// shortfall instead when the channel cannot cover it; the caller tops
    /// up with `get_or_create_channel` and retries.
    pub async fn create_voucher(
        &self,
        addr: &Address,
        amount: TokenAmount,
        lane: u64,
    ) -> Result<VoucherCreateResult> {
        let (accessor, _) = self.accessor_by_addr(addr).await?;
        let _lk = accessor.lock().await;

        let info = self.store.by_channel_addr(addr).await?;
        if amount > info.available_amount {
            let shortfall = amount.saturating_sub(info.available_amount);
            debug!(channel_addr = %addr, shortfall = %shortfall, "voucher shortfall");
            return Ok(VoucherCreateResult {
                voucher: None,
                shortfall,
            });
        }

        let top = info.lane_top(lane);
        let nonce = top.map(|v| v.nonce + 1).unwrap_or(1);
        let prev_amount = top.map(|v| v.amount).unwrap_or(TokenAmount::ZERO);

        let mut voucher = Voucher::new(*addr, lane, nonce, amount);
        let sig = self
            .wallet
            .sign(info.from, &voucher.signing_bytes()?)
            .await?;
        voucher.signature = Some(sig);

        self.store
            .save_voucher(&info.channel_id, voucher.clone())
            .await?;
        let delta = amount.saturating_sub(prev_amount);
        self.store
            .mutate_channel(&info.channel_id, |c| {
                c.available_amount = c.available_amount.saturating_sub(delta);
            })
            .await?;
        debug!(channel_addr = %addr, lane, nonce, amount = %amount, "voucher signed");
        Ok(VoucherCreateResult {
            voucher: Some(voucher),
            shortfall: TokenAmount::ZERO,
        })
    }

    /// Accept an inbound voucher: verify its signature against on-chain
    /// actor state, enforce lane monotonicity and the minimum delta, and
    /// persist it. Returns the delta the voucher is worth over the lane's
    /// previous top.
    pub async fn add_voucher(
        &self,
        addr: &Address,
        voucher: Voucher,
        min_delta: TokenAmount,
    ) -> Result<TokenAmount> {
        let state = load_channel_state(self.chain.clone(), *addr).await?;
        let sig = voucher
            .signature
            .as_ref()
            .ok_or_else(|| ExchangeError::Protocol("voucher missing signature".into()))?;
        let verified = self
            .wallet
            .verify(state.from(), &voucher.signing_bytes()?, sig)
            .await?;
        if !verified {
            return Err(ExchangeError::Unauthorized(format!(
                "invalid voucher signature on {addr}"
            )));
        }

        let actor = self.chain.state_read_actor(*addr).await?;
        let accessor = self.accessor(state.from(), state.to()).await;
        let _lk = accessor.lock().await;

        let info = match self.store.by_channel_addr(addr).await {
            Ok(info) => info,
            Err(_) => {
                self.store
                    .track_inbound_channel(state.from(), state.to(), *addr, actor.balance)
                    .await?
            }
        };

        let prev = info
            .lane_top(voucher.lane)
            .map(|v| v.amount)
            .unwrap_or(TokenAmount::ZERO);
        let delta = voucher.amount.checked_sub(prev).ok_or_else(|| {
            ExchangeError::Protocol(format!(
                "voucher amount decreases on lane {}",
                voucher.lane
            ))
        })?;
        if delta < min_delta {
            return Err(ExchangeError::Protocol(format!(
                "voucher delta {delta} below minimum {min_delta}"
            )));
        }

        let redeemable = info.total_redeemable().saturating_add(delta);
        if redeemable > actor.balance {
            return Err(ExchangeError::Insufficient {
                shortfall: redeemable.saturating_sub(actor.balance),
            });
        }

        self.store
            .save_voucher(&info.channel_id, voucher.clone())
            .await?;
        self.store
            .mutate_channel(&info.channel_id, |c| {
                c.amount = actor.balance;
                c.available_amount = c.total_redeemable();
            })
            .await?;
        debug!(channel_addr = %addr, lane = voucher.lane, delta = %delta, "inbound voucher accepted");
        Ok(delta)
    }

    /// Submit the settle message for the channel.
    pub async fn settle(&self, addr: &Address) -> Result<ContentId> {
        let (accessor, info) = self.accessor_by_addr(addr).await?;
        let local = match info.direction {
            ChannelDirection::Outbound => info.from,
            ChannelDirection::Inbound => info.to,
        };
        let mcid = self
            .submit_simple(&accessor, &info, local, *addr, method::PAYCH_SETTLE)
            .await?;

        let store = self.store.clone();
        let channel_id = info.channel_id.clone();
        let chain = self.chain.clone();
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            let res = chain.state_wait_msg(mcid, MSG_CONFIDENCE).await;
            let err = match res {
                Ok(lookup) if lookup.receipt.exit_code == 0 => {
                    let _ = store
                        .mutate_channel(&channel_id, |c| c.settling = true)
                        .await;
                    None
                }
                Ok(lookup) => Some(format!("settle exit code {}", lookup.receipt.exit_code)),
                Err(e) => Some(e.to_string()),
            };
            finish_simple(&store, &listeners, mcid, err).await;
        });
        Ok(mcid)
    }

    /// Submit the collect message; on confirmation the channel record is
    /// removed.
    pub async fn collect(&self, addr: &Address) -> Result<ContentId> {
        let (accessor, info) = self.accessor_by_addr(addr).await?;
        if !info.settling {
            return Err(ExchangeError::Protocol(format!(
                "channel {addr} not settling"
            )));
        }
        let local = match info.direction {
            ChannelDirection::Outbound => info.from,
            ChannelDirection::Inbound => info.to,
        };
        let mcid = self
            .submit_simple(&accessor, &info, local, *addr, method::PAYCH_COLLECT)
            .await?;

        let store = self.store.clone();
        let channel_id = info.channel_id.clone();
        let chain = self.chain.clone();
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            let res = chain.state_wait_msg(mcid, MSG_CONFIDENCE).await;
            let err = match res {
                Ok(lookup) if lookup.receipt.exit_code == 0 => {
                    if let Err(e) = store.remove_channel(&channel_id).await {
                        warn!(channel_id = %channel_id, error = %e, "removing collected channel failed");
                    }
                    None
                }
                Ok(lookup) => Some(format!("collect exit code {}", lookup.receipt.exit_code)),
                Err(e) => Some(e.to_string()),
            };
            finish_simple(&store, &listeners, mcid, err).await;
        });
        Ok(mcid)
    }

    async fn submit_simple(
        &self,
        accessor: &Arc<ChannelAccessor>,
        info: &ChannelInfo,
        from: Address,
        to: Address,
        m: u64,
    ) -> Result<ContentId> {
        let _lk = accessor.lock().await;
        let message = Message {
            from,
            to,
            value: TokenAmount::ZERO,
            method: m,
            params: Vec::new(),
            nonce: self.chain.next_nonce(from).await?,
        };
        let signed = accessor.sign_message(message).await?;
        let mcid = self.chain.mpool_push(signed).await?;
        self.store.save_new_message(&info.channel_id, mcid).await?;
        Ok(mcid)
    }

    pub async fn channel_info(&self, addr: &Address) -> Result<ChannelInfo> {
        self.store.by_channel_addr(addr).await
    }

    /// Register a callback fired exactly once when the waiter for `mcid`
    /// records its outcome. Fires immediately if the outcome is already
    /// recorded.
    pub async fn on_msg_complete(&self, mcid: ContentId, cb: MsgCompleteCb) {
        if let Some(result) = self.store.message_result(&mcid).await {
            cb(result);
            return;
        }
        let mut listeners = self.listeners.lock().await;
        listeners.entry(mcid).or_default().push(cb);
    }
}

async fn finish_simple(
    store: &Arc<PaychStore>,
    listeners: &Arc<Mutex<HashMap<ContentId, Vec<MsgCompleteCb>>>>,
    mcid: ContentId,
    err: Option<String>,
) {
    if let Err(e) = store.save_message_result(mcid, err.clone()).await {
        warn!(mcid = %mcid, error = %e, "saving message result failed");
    }
    let callbacks = {
        let mut listeners = listeners.lock().await;
        listeners.remove(&mcid).unwrap_or_default()
    };
    for cb in callbacks {
        cb(err.clone());
    }
}
