use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use pop_index::{BlockStore, DataRef};
use pop_paych::{Voucher, Wallet};
use pop_types::{
    ContentId, ExchangeError, Result, Selector, StoreId, TokenAmount, TransferEvent,
    TransferEventKind, TransferVoucher, Transport,
};

use crate::deal::{
    DealParams, DealPayment, DealProposal, DEAL_PAYMENT_VOUCHER_TYPE,
    DEAL_PROPOSAL_VOUCHER_TYPE,
};
use crate::offer::Offer;
use crate::retrieval::Retrieval;
use crate::strategy::{Decision, Strategy};

/// Byte allowance charged for index-only transfers whose size is unknown.
const INDEX_TRANSFER_OVERHEAD: u64 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Querying,
    OfferSelected,
    PaymentChannelReady,
    Transferring,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

/// Caller-visible session state, also streamed on every change.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub funds_spent: TokenAmount,
    pub bytes_received: u64,
    pub error: Option<String>,
}

pub type SessionEvent = SessionState;

/// One retrieval: offer discovery, selection under the configured strategy,
/// voucher-paid transfer, and index bookkeeping.
pub struct Session {
    retrieval: Arc<Retrieval>,
    root: ContentId,
    key: Option<String>,
    strategy: Mutex<Option<Box<dyn Strategy>>>,
    state: Arc<RwLock<SessionState>>,
    events_tx: broadcast::Sender<SessionState>,
    cancelled: Arc<AtomicBool>,
    store_id: Mutex<Option<StoreId>>,
    /// Voucher signed for the current payment request, sent on the channel
    /// once signing completes.
    pending_payment: Mutex<Option<Voucher>>,
}

impl Session {
    pub(crate) fn new(
        retrieval: Arc<Retrieval>,
        root: ContentId,
        key: Option<String>,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            retrieval,
            root,
            key,
            strategy: Mutex::new(Some(strategy)),
            state: Arc::new(RwLock::new(SessionState {
                status: SessionStatus::New,
                funds_spent: TokenAmount::ZERO,
                bytes_received: 0,
                error: None,
            })),
            events_tx,
            cancelled: Arc::new(AtomicBool::new(false)),
            store_id: Mutex::new(None),
            pending_payment: Mutex::new(None),
        }
    }

    pub fn root(&self) -> ContentId {
        self.root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events_tx.subscribe()
    }

    /// Drive the state machine to `Cancelled` at the next event boundary.
    /// In-flight voucher signing completes; no new voucher is issued.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Store the retrieved blocks landed in, once transferring started.
    pub async fn store_id(&self) -> Option<StoreId> {
        *self.store_id.lock().await
    }

    async fn update<F: FnOnce(&mut SessionState)>(&self, f: F) -> SessionState {
        let snapshot = {
            let mut state = self.state.write().await;
            f(&mut state);
            state.clone()
        };
        let _ = self.events_tx.send(snapshot.clone());
        snapshot
    }

    async fn set_status(&self, status: SessionStatus) {
        self.update(|s| s.status = status).await;
    }

    async fn fail(&self, err: impl Into<String>) -> SessionState {
        let err = err.into();
        warn!(root = %self.root, error = %err, "retrieval session failed");
        self.update(|s| {
            s.status = SessionStatus::Failed;
            s.error = Some(err);
        })
        .await
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Discover offers by gossip and select one under the strategy. A cached
    /// offer for the root short-circuits discovery.
    pub async fn discover(&self, window: Duration) -> Result<Offer> {
        if let Some(offer) = self.retrieval.offer_mgr().get_offer(&self.root).await {
            debug!(root = %self.root, "reusing cached offer");
            self.set_status(SessionStatus::OfferSelected).await;
            return Ok(offer);
        }

        self.set_status(SessionStatus::Querying).await;
        let mut strategy = {
            let mut slot = self.strategy.lock().await;
            slot.take()
                .ok_or_else(|| ExchangeError::Fatal("session already discovered".into()))?
        };

        let mut offers = self.retrieval.register_query(self.root).await;
        self.retrieval.publish_query(self.root).await?;

        let window = strategy
            .deadline()
            .map(|d| d.min(window))
            .unwrap_or(window);
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        let selected = loop {
            tokio::select! {
                _ = &mut deadline => break strategy.finish(),
                offer = offers.recv() => match offer {
                    Some(offer) => match strategy.offer(offer) {
                        Decision::Select(offer) => break Some(offer),
                        Decision::Await | Decision::Reject => continue,
                    },
                    None => break strategy.finish(),
                }
            }
        };
        self.retrieval.unregister_query(&self.root).await;

        match selected {
            Some(offer) => {
                info!(root = %self.root, provider = %offer.provider, "offer selected");
                self.set_status(SessionStatus::OfferSelected).await;
                Ok(offer)
            }
            None => {
                self.fail("no acceptable offer").await;
                Err(ExchangeError::NotFound(format!(
                    "no offers for {}",
                    self.root
                )))
            }
        }
    }

    /// Ask one provider directly instead of (or in addition to) gossip.
    pub async fn query_offer(&self, peer: libp2p::PeerId, wait: Duration) -> Result<Offer> {
        self.set_status(SessionStatus::Querying).await;
        let offer = self.retrieval.query_peer(peer, self.root, wait).await?;
        self.set_status(SessionStatus::OfferSelected).await;
        Ok(offer)
    }

    /// Funds needed up front for the transfer the offer describes.
    fn required_funds(offer: &Offer) -> TokenAmount {
        if offer.response.size == 0 {
            return offer
                .response
                .price_per_byte
                .checked_mul(INDEX_TRANSFER_OVERHEAD)
                .unwrap_or(TokenAmount::ZERO)
                .saturating_add(offer.response.unseal_price);
        }
        offer.response.piece_retrieval_price()
    }

    /// Execute the paid transfer from the selected offer and finalize the
    /// index. Returns the terminal session state.
    pub async fn retrieve(&self, offer: Offer) -> Result<SessionState> {
        if self.is_cancelled() {
            self.set_status(SessionStatus::Cancelled).await;
            return Ok(self.state().await);
        }

        // Fund a payment channel toward the provider when the terms are not
        // free.
        let required = Self::required_funds(&offer);
        let mut payment: Option<(pop_types::Address, u64)> = None;
        if !required.is_zero() {
            let local = self.retrieval.wallet().default_address();
            let handle = self
                .retrieval
                .paych()
                .get_or_create_channel(local, offer.response.payment_address, required)
                .await?;
            let res = handle.wait().await?;
            if let Some(err) = res.err {
                self.fail(format!("channel funding failed: {err}")).await;
                return Err(ExchangeError::Transient(err));
            }
            let addr = res
                .channel_addr
                .ok_or_else(|| ExchangeError::Fatal("funded channel has no address".into()))?;
            let lane = self.retrieval.paych().allocate_lane(&addr).await?;
            payment = Some((addr, lane));
            self.set_status(SessionStatus::PaymentChannelReady).await;
        }

        // Fresh store for the incoming blocks, resolvable by the transport.
        let store_id = self.retrieval.index().multistore().next().await;
        {
            let mut slot = self.store_id.lock().await;
            *slot = Some(store_id);
        }
        self.retrieval.set_session_store(self.root, store_id).await;

        let selector = match &self.key {
            Some(key) => Selector::Path(vec![key.clone()]),
            None => Selector::All,
        };
        let proposal = DealProposal {
            payload_cid: self.root,
            selector: selector.clone(),
            params: DealParams {
                price_per_byte: offer.response.price_per_byte,
                payment_interval: offer.response.payment_interval,
                payment_interval_increase: offer.response.payment_interval_increase,
                unseal_price: offer.response.unseal_price,
            },
        };

        let mut events = self.retrieval.transport().subscribe();
        let voucher = TransferVoucher::encode(DEAL_PROPOSAL_VOUCHER_TYPE, &proposal)?;
        let channel = match self
            .retrieval
            .transport()
            .open_pull(offer.provider, voucher, self.root, selector)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(e.to_string()).await;
                return Err(e);
            }
        };
        self.set_status(SessionStatus::Transferring).await;

        let mut pending_voucher = TokenAmount::ZERO;
        let outcome = loop {
            if self.is_cancelled() {
                self.retrieval.clear_session_store(&self.root).await;
                self.set_status(SessionStatus::Cancelled).await;
                return Ok(self.state().await);
            }
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    break Err("transport event stream closed".to_string())
                }
            };
            let TransferEvent { kind, transfer } = event;
            if transfer.channel != channel {
                continue;
            }
            match kind {
                TransferEventKind::Opened => {}
                TransferEventKind::Progress => {
                    self.update(|s| s.bytes_received = transfer.received).await;
                }
                TransferEventKind::PaymentRequested(owed) => {
                    let Some((addr, lane)) = payment else {
                        break Err("payment requested on a free transfer".to_string());
                    };
                    match self.pay(addr, lane, owed).await {
                        Ok(amount) => pending_voucher = amount,
                        Err(e) => break Err(e.to_string()),
                    }
                    if let Err(e) = self.send_payment(channel, addr, lane).await {
                        break Err(e.to_string());
                    }
                }
                TransferEventKind::PaymentAcknowledged => {
                    let spent = pending_voucher;
                    self.update(|s| s.funds_spent = spent).await;
                }
                TransferEventKind::Completed => {
                    self.update(|s| s.bytes_received = transfer.received).await;
                    break Ok(());
                }
                TransferEventKind::Error(e) => break Err(e),
            }
        };

        self.retrieval.clear_session_store(&self.root).await;
        if let Err(e) = outcome {
            return Ok(self.fail(e).await);
        }

        self.finalize(offer, store_id).await
    }

    /// Sign a voucher for the cumulative owed amount, topping the channel up
    /// once on shortfall.
    async fn pay(
        &self,
        addr: pop_types::Address,
        lane: u64,
        owed: TokenAmount,
    ) -> Result<TokenAmount> {
        let paych = self.retrieval.paych();
        let mut result = paych.create_voucher(&addr, owed, lane).await?;
        if result.voucher.is_none() {
            let local = self.retrieval.wallet().default_address();
            let info = paych.channel_info(&addr).await?;
            let handle = paych
                .get_or_create_channel(local, info.to, result.shortfall)
                .await?;
            let res = handle.wait().await?;
            if let Some(err) = res.err {
                return Err(ExchangeError::Transient(err));
            }
            result = paych.create_voucher(&addr, owed, lane).await?;
        }
        match result.voucher {
            Some(v) => {
                let mut vouchers = self.pending_payment.lock().await;
                *vouchers = Some(v.clone());
                Ok(v.amount)
            }
            None => Err(ExchangeError::Insufficient {
                shortfall: result.shortfall,
            }),
        }
    }

    async fn send_payment(
        &self,
        channel: pop_types::TransferChannelId,
        addr: pop_types::Address,
        _lane: u64,
    ) -> Result<()> {
        let voucher = {
            let mut slot = self.pending_payment.lock().await;
            slot.take()
                .ok_or_else(|| ExchangeError::Fatal("no signed voucher pending".into()))?
        };
        let payment = DealPayment {
            channel_addr: addr,
            voucher,
        };
        self.retrieval
            .transport()
            .send_voucher(channel, TransferVoucher::encode(DEAL_PAYMENT_VOUCHER_TYPE, &payment)?)
            .await
    }

    /// Verify the blocks landed and record the ref; cache or clear the offer
    /// depending on whether more keys remain under the root.
    async fn finalize(&self, offer: Offer, store_id: StoreId) -> Result<SessionState> {
        self.set_status(SessionStatus::Finalizing).await;

        let store = self.retrieval.index().multistore().get(store_id).await?;
        let received = store.size().await?;
        if offer.response.size > 0 && received < offer.response.size {
            let state = self
                .fail(format!(
                    "incomplete transfer: {received} of {} bytes",
                    offer.response.size
                ))
                .await;
            return Ok(state);
        }

        let index = self.retrieval.index();
        match index.peek_ref(&self.root).await {
            Ok(mut existing) => {
                existing.freq += 1;
                existing.payload_size = received.max(existing.payload_size);
                index.update_ref(existing).await?;
            }
            Err(_) => {
                index
                    .set_ref(DataRef::new(self.root, received, store_id))
                    .await?;
            }
        }

        if self.key.is_some() {
            self.retrieval
                .offer_mgr()
                .set_offer(self.root, offer)
                .await;
        } else {
            self.retrieval.offer_mgr().remove_offer(&self.root).await;
        }

        info!(root = %self.root, bytes = received, "retrieval complete");
        Ok(self.update(|s| s.status = SessionStatus::Done).await)
    }

    /// Discover under the window, then retrieve: the whole session in one
    /// call.
    pub async fn run(&self, window: Duration) -> Result<SessionState> {
        let offer = self.discover(window).await?;
        self.retrieve(offer).await
    }
}
