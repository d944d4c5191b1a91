use async_trait::async_trait;
use libp2p::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use pop_index::{Index, IndexBackend, IndexOptions, MultiStore};
use pop_paych::{
    ActorState, Chain, MsgLookup, PaychBackend, PaychMgr, PaychStore, SignedMessage, Wallet,
};
use pop_peers::PeerMgr;
use pop_replication::{PRecord, Replication, Request};
use pop_retrieval::{Retrieval, Session, Strategy};
use pop_types::{Address, ContentId, ExchangeError, Net, Result, StoreId, Transport};

use crate::config::Options;

/// Chain stub used when no RPC endpoint is configured. Every call fails
/// fast; the rest of the exchange keeps working.
struct OfflineChain;

#[async_trait]
impl Chain for OfflineChain {
    async fn mpool_push(&self, _msg: SignedMessage) -> Result<ContentId> {
        Err(ExchangeError::Transient("chain RPC is offline".into()))
    }

    async fn state_wait_msg(&self, _mcid: ContentId, _confidence: u64) -> Result<MsgLookup> {
        Err(ExchangeError::Transient("chain RPC is offline".into()))
    }

    async fn state_read_actor(&self, _addr: Address) -> Result<ActorState> {
        Err(ExchangeError::Transient("chain RPC is offline".into()))
    }

    async fn chain_read_obj(&self, _cid: ContentId) -> Result<Vec<u8>> {
        Err(ExchangeError::Transient("chain RPC is offline".into()))
    }

    async fn next_nonce(&self, _addr: Address) -> Result<u64> {
        Err(ExchangeError::Transient("chain RPC is offline".into()))
    }
}

/// Thin facade binding the index, peer mesh, replication, retrieval, and
/// payment subsystems around the external collaborator handles.
pub struct Exchange {
    net: Arc<dyn Net>,
    index: Arc<Index>,
    replication: Arc<Replication>,
    retrieval: Arc<Retrieval>,
    paych: Arc<PaychMgr>,
    wallet: Arc<dyn Wallet>,
    options: Options,
    chain_online: bool,
}

impl Exchange {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        net: Arc<dyn Net>,
        transport: Arc<dyn Transport>,
        chain: Option<Arc<dyn Chain>>,
        wallet: Arc<dyn Wallet>,
        multistore: Arc<MultiStore>,
        index_backend: Arc<dyn IndexBackend>,
        paych_backend: Arc<dyn PaychBackend>,
        options: Options,
    ) -> Result<Arc<Self>> {
        let regions = options.parsed_regions();
        if regions.is_empty() {
            return Err(ExchangeError::Fatal("no known regions configured".into()));
        }

        let index = Arc::new(
            Index::new(
                index_backend,
                multistore,
                IndexOptions {
                    capacity: options.capacity,
                },
            )
            .await?,
        );

        let chain_online = chain.is_some();
        let chain = chain.unwrap_or_else(|| Arc::new(OfflineChain));
        let paych_store = Arc::new(PaychStore::new(paych_backend).await?);
        let paych = Arc::new(PaychMgr::new(chain, wallet.clone(), paych_store));

        let replication = Replication::new(
            net.clone(),
            index.clone(),
            transport.clone(),
            regions.clone(),
            options.hey_version.clone(),
        );
        replication.start().await?;

        let retrieval = Retrieval::new(
            net.clone(),
            index.clone(),
            transport,
            paych.clone(),
            wallet.clone(),
            regions,
            options.ask,
        );
        retrieval.start().await?;

        info!(
            peer = %net.local_peer(),
            regions = options.regions.len(),
            chain_online,
            "exchange started"
        );
        Ok(Arc::new(Self {
            net,
            index,
            replication,
            retrieval,
            paych,
            wallet,
            options,
            chain_online,
        }))
    }

    pub fn local_peer(&self) -> PeerId {
        self.net.local_peer()
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn replication(&self) -> &Arc<Replication> {
        &self.replication
    }

    pub fn retrieval(&self) -> &Arc<Retrieval> {
        &self.retrieval
    }

    pub fn paych(&self) -> &Arc<PaychMgr> {
        &self.paych
    }

    pub fn peer_mgr(&self) -> &Arc<PeerMgr> {
        self.replication.peer_mgr()
    }

    pub fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_chain_online(&self) -> bool {
        self.chain_online
    }

    /// Register freshly committed content so peers can pull it from us.
    pub async fn put(&self, root: ContentId, size: u64, store_id: StoreId) -> Result<()> {
        self.index
            .set_ref(pop_index::DataRef::new(root, size, store_id))
            .await
    }

    /// Propagate an indexed root to the configured replication factor.
    /// Confirmations stream out as providers finish pulling.
    pub async fn dispatch(&self, root: ContentId) -> Result<mpsc::Receiver<PRecord>> {
        let data_ref = self.index.peek_ref(&root).await?;
        let req = Request {
            payload_cid: root,
            size: data_ref.payload_size,
        };
        Ok(self
            .replication
            .dispatch(req, self.options.dispatch.clone().into()))
    }

    /// Open a retrieval session for a root, optionally scoped to one key
    /// under it.
    pub fn new_session(
        &self,
        root: ContentId,
        key: Option<String>,
        strategy: Box<dyn Strategy>,
    ) -> Session {
        self.retrieval.new_session(root, key, strategy)
    }

    /// Retrieve a root in one shot: discover offers within the configured
    /// gossip window, then run the paid transfer.
    pub async fn get(
        &self,
        root: ContentId,
        key: Option<String>,
        strategy: Box<dyn Strategy>,
    ) -> Result<pop_retrieval::SessionState> {
        let session = self.new_session(root, key, strategy);
        session.run(self.options.gossip_timeout()).await
    }
}
