use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use pop_index::{DataRef, Index};
use pop_peers::{HeyService, PeerEvent, PeerMgr};
use pop_types::{
    ContentId, ExchangeError, Net, PullValidator, Region, Result, Selector, StoreConfigurer,
    StoreId, Transfer, TransferEvent, TransferEventKind, TransferVoucher, Transport,
};

use crate::request::{Request, RequestStream, REQUEST_PROTOCOL_ID, REQUEST_VOUCHER_TYPE};

/// Parameters bounding one dispatch operation.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: u32,
    pub max_attempts: u32,
    /// Target replication factor.
    pub rf: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60 * 60),
            backoff_factor: 2,
            max_attempts: 4,
            rf: 7,
        }
    }
}

/// Provider <-> cid mapping recording who confirmed storing what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PRecord {
    pub provider: PeerId,
    pub payload_cid: ContentId,
}

/// Manages the replication scheme: advertises puts to region-matched peers,
/// authorizes and validates the reverse pulls, and tracks whose schemes we
/// participate in.
#[derive(Clone)]
pub struct Replication {
    net: Arc<dyn Net>,
    transport: Arc<dyn Transport>,
    index: Arc<Index>,
    pm: Arc<PeerMgr>,
    hey: HeyService,
    regions: Vec<Region>,
    /// Per-root set of peers authorized to pull without payment.
    pulls: Arc<RwLock<HashMap<ContentId, HashSet<PeerId>>>>,
    /// Peers whose replication scheme we joined.
    schemes: Arc<RwLock<HashSet<PeerId>>>,
}

impl Replication {
    pub fn new(
        net: Arc<dyn Net>,
        index: Arc<Index>,
        transport: Arc<dyn Transport>,
        regions: Vec<Region>,
        hey_version: String,
    ) -> Arc<Self> {
        let pm = Arc::new(PeerMgr::new(net.local_peer()));
        let hey = HeyService::new(net.clone(), pm.clone(), regions.clone(), hey_version);
        Arc::new(Self {
            net,
            transport,
            index,
            pm,
            hey,
            regions,
            pulls: Arc::new(RwLock::new(HashMap::new())),
            schemes: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub fn peer_mgr(&self) -> &Arc<PeerMgr> {
        &self.pm
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Wire up handlers and start listeners: the hey service, the request
    /// protocol, scheme membership, and failed-transfer cleanup.
    pub async fn start(&self) -> Result<()> {
        self.hey.start().await?;

        let repl = self.clone();
        self.net
            .set_stream_handler(
                REQUEST_PROTOCOL_ID,
                Arc::new(move |peer, stream| {
                    let repl = repl.clone();
                    Box::pin(async move {
                        if let Err(e) = repl.handle_request(peer, stream).await {
                            warn!(peer = %peer, error = %e, "inbound dispatch request failed");
                        }
                    })
                }),
            )
            .await;

        self.transport
            .register_validator(REQUEST_VOUCHER_TYPE, Arc::new(self.clone()))
            .await;
        self.transport
            .register_configurer(REQUEST_VOUCHER_TYPE, Arc::new(self.clone()))
            .await;

        // Track whose schemes we belong to as regioned peers come and go.
        let repl = self.clone();
        let mut peer_events = self.pm.subscribe().await;
        tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                match event {
                    PeerEvent::Added { peer, .. } => repl.join_scheme(peer).await,
                    PeerEvent::Removed { peer, .. } => repl.leave_scheme(peer).await,
                }
            }
        });

        // A failed inbound transfer leaves a provisional ref behind; drop it.
        let repl = self.clone();
        let mut events = self.transport.subscribe();
        tokio::spawn(async move {
            let local = repl.net.local_peer();
            loop {
                match events.recv().await {
                    Ok(TransferEvent {
                        kind: TransferEventKind::Error(_),
                        transfer,
                    }) if transfer.recipient == local => {
                        if repl.index.drop_ref(&transfer.base).await.is_ok() {
                            let _ = repl.index.gc().await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    pub async fn join_scheme(&self, peer: PeerId) {
        let mut schemes = self.schemes.write().await;
        schemes.insert(peer);
    }

    pub async fn leave_scheme(&self, peer: PeerId) {
        let mut schemes = self.schemes.write().await;
        schemes.remove(&peer);
    }

    pub async fn in_scheme(&self, peer: &PeerId) -> bool {
        let schemes = self.schemes.read().await;
        schemes.contains(peer)
    }

    /// Open a request stream to `dest`.
    pub async fn new_request_stream(&self, dest: PeerId) -> Result<RequestStream> {
        let stream = self.net.open_stream(dest, REQUEST_PROTOCOL_ID).await?;
        Ok(RequestStream::new(dest, stream))
    }

    /// A peer asked us to store content: allocate a fresh store, register a
    /// provisional ref, and pull the blocks back from the sender.
    async fn handle_request(
        &self,
        peer: PeerId,
        stream: Box<dyn pop_types::WireStream>,
    ) -> Result<()> {
        let mut rs = RequestStream::new(peer, stream);
        let req = rs.read_request().await?;
        debug!(peer = %peer, root = %req.payload_cid, size = req.size, "dispatch request received");

        let store_id = self.index.multistore().next().await;
        self.index
            .set_ref(DataRef::new(req.payload_cid, req.size, store_id))
            .await?;

        let voucher = TransferVoucher::encode(REQUEST_VOUCHER_TYPE, &req)?;
        self.transport
            .open_pull(peer, voucher, req.payload_cid, Selector::All)
            .await?;
        Ok(())
    }

    /// Grant `peer` authorization to pull every link under `root` without
    /// payment. Idempotent. Entries are in-memory only: losing them means
    /// the peer is rejected and retried on a later dispatch attempt.
    pub async fn authorize_pull(&self, root: ContentId, peer: PeerId) {
        let mut pulls = self.pulls.write().await;
        pulls.entry(root).or_default().insert(peer);
    }

    /// Pushes are never first-class; only pulls are accepted.
    pub fn validate_push(
        &self,
        _sender: PeerId,
        _voucher: &TransferVoucher,
        _base: ContentId,
        _selector: &Selector,
    ) -> Result<()> {
        Err(ExchangeError::Unauthorized("no push accepted".into()))
    }

    /// Dispatch the content to the network until `rf` providers confirmed
    /// pulling it, backing off between attempts. Confirmations stream out as
    /// they arrive; the channel closes on quorum or exhaustion.
    pub fn dispatch(&self, req: Request, opt: DispatchOptions) -> mpsc::Receiver<PRecord> {
        let (out_tx, out_rx) = mpsc::channel(opt.rf.max(1));
        let repl = self.clone();
        let mut events = self.transport.subscribe();
        let local = self.net.local_peer();

        tokio::spawn(async move {
            let mut confirmed = 0usize;
            let mut seen: HashSet<PeerId> = HashSet::new();
            let mut attempt: u32 = 0;

            'attempts: loop {
                if attempt > opt.max_attempts {
                    info!(root = %req.payload_cid, confirmed, "dispatch attempts exhausted");
                    return;
                }

                let needed = opt.rf - confirmed;
                let providers = repl.pm.peers(needed, &repl.regions, &seen).await;
                for p in &providers {
                    repl.authorize_pull(req.payload_cid, *p).await;
                    seen.insert(*p);
                }
                if !providers.is_empty() {
                    debug!(root = %req.payload_cid, count = providers.len(), attempt, "sending dispatch requests");
                    repl.send_all_requests(&req, &providers).await;
                }

                let backoff = opt
                    .backoff_min
                    .saturating_mul(opt.backoff_factor.saturating_pow(attempt))
                    .min(opt.backoff_max);
                let deadline = tokio::time::sleep(backoff);
                tokio::pin!(deadline);

                loop {
                    tokio::select! {
                        _ = &mut deadline => {
                            attempt += 1;
                            continue 'attempts;
                        }
                        event = events.recv() => match event {
                            Ok(TransferEvent {
                                kind: TransferEventKind::Completed,
                                transfer: Transfer { base, sender, recipient, .. },
                            }) if base == req.payload_cid && sender == local && recipient != local => {
                                if out_tx
                                    .send(PRecord {
                                        provider: recipient,
                                        payload_cid: base,
                                    })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                                confirmed += 1;
                                if confirmed == opt.rf {
                                    info!(root = %req.payload_cid, rf = opt.rf, "dispatch quorum reached");
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
        out_rx
    }

    /// Fire the request at every provider; a write failure just skips the
    /// peer until a later attempt.
    async fn send_all_requests(&self, req: &Request, providers: &[PeerId]) {
        for peer in providers {
            let mut stream = match self.new_request_stream(*peer).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "request stream failed");
                    continue;
                }
            };
            if let Err(e) = stream.write_request(req).await {
                debug!(peer = %peer, error = %e, "request write failed");
            }
        }
    }
}

#[async_trait]
impl PullValidator for Replication {
    /// A pull is valid iff the voucher is a dispatch request for the same
    /// root and the receiver was authorized for it.
    async fn validate_pull(
        &self,
        receiver: PeerId,
        voucher: &TransferVoucher,
        base: ContentId,
        _selector: &Selector,
    ) -> Result<()> {
        if voucher.type_id != REQUEST_VOUCHER_TYPE {
            return Err(ExchangeError::Unauthorized(format!(
                "unexpected voucher type {}",
                voucher.type_id
            )));
        }
        let req: Request = voucher.decode()?;
        if req.payload_cid != base {
            return Err(ExchangeError::Unauthorized("unknown CID".into()));
        }
        let pulls = self.pulls.read().await;
        let set = pulls
            .get(&base)
            .ok_or_else(|| ExchangeError::Unauthorized("unknown CID".into()))?;
        if !set.contains(&receiver) {
            return Err(ExchangeError::Unauthorized("not authorized".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConfigurer for Replication {
    /// Route a dispatch transfer to the store registered for its root, on
    /// both the serving and the receiving side.
    async fn store_for(&self, voucher: &TransferVoucher, base: ContentId) -> Option<StoreId> {
        if voucher.type_id != REQUEST_VOUCHER_TYPE {
            return None;
        }
        self.index.get_store_id(&base).await.ok()
    }
}
