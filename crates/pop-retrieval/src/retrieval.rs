use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};

use pop_index::Index;
use pop_paych::{PaychMgr, Wallet};
use pop_types::{
    wire, ContentId, ExchangeError, Net, PullValidator, Region, Result, Selector,
    StoreConfigurer, StoreId, TokenAmount, TransferVoucher, Transport, WireStream,
};

use crate::deal::{
    DealPayment, DealProposal, Query, QueryMessage, QueryResponse, Ask,
    DEAL_PAYMENT_VOUCHER_TYPE, DEAL_PROPOSAL_VOUCHER_TYPE, QUERY_PROTOCOL_ID,
};
use crate::offer::{Offer, OfferMgr};
use crate::session::Session;
use crate::strategy::Strategy;

fn query_topic(region: &Region) -> String {
    format!("/myel/pop/{}/query", region.name)
}

/// Retrieval subsystem: answers offer queries for content we index, and runs
/// client sessions that discover, pay for, and pull remote content.
#[derive(Clone)]
pub struct Retrieval {
    net: Arc<dyn Net>,
    transport: Arc<dyn Transport>,
    index: Arc<Index>,
    paych: Arc<PaychMgr>,
    wallet: Arc<dyn Wallet>,
    regions: Vec<Region>,
    ask: Ask,
    offer_mgr: Arc<OfferMgr>,
    /// Routes pushed query responses to the session waiting on the root.
    pending_queries: Arc<RwLock<HashMap<ContentId, mpsc::UnboundedSender<Offer>>>>,
    /// Root -> local store receiving an inbound retrieval.
    session_stores: Arc<RwLock<HashMap<ContentId, StoreId>>>,
}

impl Retrieval {
    pub fn new(
        net: Arc<dyn Net>,
        index: Arc<Index>,
        transport: Arc<dyn Transport>,
        paych: Arc<PaychMgr>,
        wallet: Arc<dyn Wallet>,
        regions: Vec<Region>,
        ask: Ask,
    ) -> Arc<Self> {
        Arc::new(Self {
            net,
            transport,
            index,
            paych,
            wallet,
            regions,
            ask,
            offer_mgr: Arc::new(OfferMgr::new()),
            pending_queries: Arc::new(RwLock::new(HashMap::new())),
            session_stores: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn offer_mgr(&self) -> &OfferMgr {
        &self.offer_mgr
    }

    pub fn paych(&self) -> &Arc<PaychMgr> {
        &self.paych
    }

    pub(crate) fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }

    /// Register handlers: the query protocol, region gossip, and the deal
    /// voucher validators.
    pub async fn start(&self) -> Result<()> {
        let rt = self.clone();
        self.net
            .set_stream_handler(
                QUERY_PROTOCOL_ID,
                Arc::new(move |peer, stream| {
                    let rt = rt.clone();
                    Box::pin(async move {
                        if let Err(e) = rt.handle_query_stream(peer, stream).await {
                            debug!(peer = %peer, error = %e, "query stream failed");
                        }
                    })
                }),
            )
            .await;

        for region in &self.regions {
            let rt = self.clone();
            let mut sub = self.net.subscribe(&query_topic(region)).await;
            tokio::spawn(async move {
                while let Some(msg) = sub.recv().await {
                    let query: Query = match pop_types::cbor::from_slice(&msg.data) {
                        Ok(q) => q,
                        Err(_) => continue,
                    };
                    if let Err(e) = rt.answer_query(msg.source, query).await {
                        debug!(error = %e, "gossip query went unanswered");
                    }
                }
            });
        }

        self.transport
            .register_validator(DEAL_PROPOSAL_VOUCHER_TYPE, Arc::new(self.clone()))
            .await;
        self.transport
            .register_validator(DEAL_PAYMENT_VOUCHER_TYPE, Arc::new(self.clone()))
            .await;
        self.transport
            .register_configurer(DEAL_PROPOSAL_VOUCHER_TYPE, Arc::new(self.clone()))
            .await;
        Ok(())
    }

    /// Open a client session for `root`.
    pub fn new_session(
        &self,
        root: ContentId,
        key: Option<String>,
        strategy: Box<dyn Strategy>,
    ) -> Session {
        Session::new(Arc::new(self.clone()), root, key, strategy)
    }

    fn make_response(&self, root: ContentId, size: u64) -> QueryResponse {
        QueryResponse {
            payload_cid: root,
            size,
            unseal_price: self.ask.unseal_price,
            price_per_byte: self.ask.price_per_byte,
            payment_interval: self.ask.payment_interval,
            payment_interval_increase: self.ask.payment_interval_increase,
            payment_address: self.wallet.default_address(),
        }
    }

    /// Answer a gossip query by pushing our response back to the source.
    async fn answer_query(&self, source: PeerId, query: Query) -> Result<()> {
        let ours: Vec<u64> = self.regions.iter().map(|r| r.code.0).collect();
        if !query.regions.iter().any(|c| ours.contains(&c.0)) {
            return Ok(());
        }
        let data_ref = match self.index.peek_ref(&query.payload_cid).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        let response = self.make_response(query.payload_cid, data_ref.payload_size);
        let mut stream = self.net.open_stream(source, QUERY_PROTOCOL_ID).await?;
        wire::write_framed(&mut stream, &QueryMessage::Response(response)).await?;
        debug!(peer = %source, root = %query.payload_cid, "answered offer query");
        Ok(())
    }

    /// Inbound query protocol stream: either a direct ask to answer in
    /// place, or a pushed answer to route to the waiting session.
    async fn handle_query_stream(
        &self,
        peer: PeerId,
        mut stream: Box<dyn WireStream>,
    ) -> Result<()> {
        let msg: QueryMessage = wire::read_framed(&mut stream).await?;
        match msg {
            QueryMessage::Query(query) => {
                let data_ref = self
                    .index
                    .peek_ref(&query.payload_cid)
                    .await
                    .map_err(|_| ExchangeError::NotFound(format!("{}", query.payload_cid)))?;
                let response = self.make_response(query.payload_cid, data_ref.payload_size);
                wire::write_framed(&mut stream, &QueryMessage::Response(response)).await
            }
            QueryMessage::Response(response) => {
                let pending = self.pending_queries.read().await;
                if let Some(tx) = pending.get(&response.payload_cid) {
                    let _ = tx.send(Offer {
                        provider: peer,
                        response,
                    });
                }
                Ok(())
            }
        }
    }

    /// Start collecting pushed offers for `root`.
    pub(crate) async fn register_query(&self, root: ContentId) -> mpsc::UnboundedReceiver<Offer> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = self.pending_queries.write().await;
        pending.insert(root, tx);
        rx
    }

    pub(crate) async fn unregister_query(&self, root: &ContentId) {
        let mut pending = self.pending_queries.write().await;
        pending.remove(root);
    }

    /// Publish a gossip query for `root` on every configured region topic.
    pub(crate) async fn publish_query(&self, root: ContentId) -> Result<()> {
        let query = Query {
            payload_cid: root,
            regions: self.regions.iter().map(|r| r.code).collect(),
        };
        let data = pop_types::cbor::to_vec(&query)?;
        for region in &self.regions {
            self.net.publish(&query_topic(region), data.clone()).await?;
        }
        Ok(())
    }

    /// Ask one specific provider for its terms.
    pub async fn query_peer(
        &self,
        peer: PeerId,
        root: ContentId,
        wait: Duration,
    ) -> Result<Offer> {
        let ask = async {
            let mut stream = self.net.open_stream(peer, QUERY_PROTOCOL_ID).await?;
            let query = Query {
                payload_cid: root,
                regions: self.regions.iter().map(|r| r.code).collect(),
            };
            wire::write_framed(&mut stream, &QueryMessage::Query(query)).await?;
            wire::read_framed::<_, QueryMessage>(&mut stream).await
        };
        let msg = timeout(wait, ask)
            .await
            .map_err(|_| ExchangeError::Transient(format!("query to {peer} timed out")))??;
        match msg {
            QueryMessage::Response(response) => Ok(Offer {
                provider: peer,
                response,
            }),
            QueryMessage::Query(_) => Err(ExchangeError::Protocol(
                "expected a query response".into(),
            )),
        }
    }

    pub(crate) async fn set_session_store(&self, root: ContentId, store: StoreId) {
        let mut stores = self.session_stores.write().await;
        stores.insert(root, store);
    }

    pub(crate) async fn clear_session_store(&self, root: &ContentId) {
        let mut stores = self.session_stores.write().await;
        stores.remove(root);
    }
}

#[async_trait]
impl PullValidator for Retrieval {
    /// Provider-side validation of retrieval vouchers: proposals must match
    /// our ask for content we index; payments must verify as channel
    /// vouchers against on-chain state.
    async fn validate_pull(
        &self,
        receiver: PeerId,
        voucher: &TransferVoucher,
        base: ContentId,
        _selector: &Selector,
    ) -> Result<()> {
        match voucher.type_id.as_str() {
            DEAL_PROPOSAL_VOUCHER_TYPE => {
                let proposal: DealProposal = voucher.decode()?;
                if proposal.payload_cid != base {
                    return Err(ExchangeError::Unauthorized("unknown CID".into()));
                }
                self.index
                    .get_store_id(&base)
                    .await
                    .map_err(|_| ExchangeError::Unauthorized("unknown CID".into()))?;
                if proposal.params.price_per_byte < self.ask.price_per_byte
                    || proposal.params.unseal_price < self.ask.unseal_price
                {
                    return Err(ExchangeError::Unauthorized(
                        "deal terms below our ask".into(),
                    ));
                }
                debug!(peer = %receiver, root = %base, "retrieval proposal accepted");
                Ok(())
            }
            DEAL_PAYMENT_VOUCHER_TYPE => {
                let payment: DealPayment = voucher.decode()?;
                let delta = self
                    .paych
                    .add_voucher(&payment.channel_addr, payment.voucher, TokenAmount::ZERO)
                    .await?;
                debug!(peer = %receiver, delta = %delta, "payment voucher redeemed");
                Ok(())
            }
            other => {
                warn!(voucher_type = other, "unexpected retrieval voucher type");
                Err(ExchangeError::Unauthorized(format!(
                    "unexpected voucher type {other}"
                )))
            }
        }
    }
}

#[async_trait]
impl StoreConfigurer for Retrieval {
    /// Resolve the store for a retrieval: an open session's scratch store on
    /// the client side, the indexed store on the serving side.
    async fn store_for(&self, voucher: &TransferVoucher, base: ContentId) -> Option<StoreId> {
        if voucher.type_id != DEAL_PROPOSAL_VOUCHER_TYPE {
            return None;
        }
        {
            let stores = self.session_stores.read().await;
            if let Some(store) = stores.get(&base) {
                return Some(*store);
            }
        }
        self.index.get_store_id(&base).await.ok()
    }
}
