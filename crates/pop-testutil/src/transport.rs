use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};

use pop_index::{BlockStore, MultiStore};
use pop_types::{
    ContentId, ExchangeError, PullValidator, Result, Selector, StoreConfigurer, TokenAmount,
    Transfer, TransferChannelId, TransferEvent, TransferEventKind, TransferStatus,
    TransferVoucher, Transport,
};

/// Payment behavior scripted on the serving side for a voucher type: request
/// this amount once the blocks have moved, before completing.
#[derive(Debug, Clone)]
pub struct PaymentScript {
    pub total: TokenAmount,
}

struct NodeInner {
    peer: PeerId,
    ms: Arc<MultiStore>,
    validators: RwLock<HashMap<String, Arc<dyn PullValidator>>>,
    configurers: RwLock<HashMap<String, Arc<dyn StoreConfigurer>>>,
    events_tx: broadcast::Sender<TransferEvent>,
    payment_scripts: RwLock<HashMap<String, PaymentScript>>,
    pending_payments: Mutex<HashMap<TransferChannelId, oneshot::Sender<TransferVoucher>>>,
}

impl NodeInner {
    fn emit(&self, event: TransferEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// In-process data-transfer hub: pull channels validate against the serving
/// side's registered validator, then actually move blocks between the two
/// nodes' stores, emitting the event sequence a real transport would.
#[derive(Clone)]
pub struct TransportHub {
    nodes: Arc<Mutex<HashMap<PeerId, Arc<NodeInner>>>>,
    next_channel: Arc<AtomicU64>,
}

impl TransportHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            next_channel: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Attach a node to the hub.
    pub async fn node(&self, peer: PeerId, ms: Arc<MultiStore>) -> Arc<MemTransport> {
        let (events_tx, _) = broadcast::channel(256);
        let inner = Arc::new(NodeInner {
            peer,
            ms,
            validators: RwLock::new(HashMap::new()),
            configurers: RwLock::new(HashMap::new()),
            events_tx,
            payment_scripts: RwLock::new(HashMap::new()),
            pending_payments: Mutex::new(HashMap::new()),
        });
        let mut nodes = self.nodes.lock().await;
        nodes.insert(peer, inner.clone());
        Arc::new(MemTransport {
            hub: self.clone(),
            inner,
        })
    }

    async fn get(&self, peer: &PeerId) -> Result<Arc<NodeInner>> {
        let nodes = self.nodes.lock().await;
        nodes
            .get(peer)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("transport node {peer}")))
    }
}

pub struct MemTransport {
    hub: TransportHub,
    inner: Arc<NodeInner>,
}

impl MemTransport {
    /// Script payment on this (serving) side for pulls opened with the given
    /// voucher type.
    pub async fn set_payment_script(&self, type_id: &str, script: PaymentScript) {
        let mut scripts = self.inner.payment_scripts.write().await;
        scripts.insert(type_id.to_string(), script);
    }
}

fn snapshot(
    channel: TransferChannelId,
    base: ContentId,
    recipient: PeerId,
    sender: PeerId,
    received: u64,
    status: TransferStatus,
) -> Transfer {
    Transfer {
        channel,
        base,
        recipient,
        sender,
        received,
        status,
    }
}

async fn drive_pull(
    channel: TransferChannelId,
    sender: Arc<NodeInner>,
    recipient: Arc<NodeInner>,
    voucher: TransferVoucher,
    base: ContentId,
) {
    let fail = |received: u64, msg: String| {
        let transfer = snapshot(
            channel,
            base,
            recipient.peer,
            sender.peer,
            received,
            TransferStatus::Failed,
        );
        let event = TransferEvent {
            kind: TransferEventKind::Error(msg.clone()),
            transfer,
        };
        sender.emit(event.clone());
        recipient.emit(event);
        warn!(channel = %channel, base = %base, error = %msg, "transfer failed");
    };

    let opened = snapshot(
        channel,
        base,
        recipient.peer,
        sender.peer,
        0,
        TransferStatus::Requested,
    );
    recipient.emit(TransferEvent {
        kind: TransferEventKind::Opened,
        transfer: opened.clone(),
    });
    sender.emit(TransferEvent {
        kind: TransferEventKind::Opened,
        transfer: opened,
    });

    // Resolve the source and destination stores through each side's
    // registered configurer.
    let src = {
        let configurers = sender.configurers.read().await;
        match configurers.get(&voucher.type_id) {
            Some(c) => c.store_for(&voucher, base).await,
            None => None,
        }
    };
    let Some(src) = src else {
        fail(0, format!("no source store for {base}"));
        return;
    };
    let dst = {
        let configurers = recipient.configurers.read().await;
        match configurers.get(&voucher.type_id) {
            Some(c) => c.store_for(&voucher, base).await,
            None => None,
        }
    };
    let Some(dst) = dst else {
        fail(0, format!("no destination store for {base}"));
        return;
    };

    let copy = async {
        let src_store = sender.ms.get(src).await?;
        let dst_store = recipient.ms.get(dst).await?;
        let mut bytes = 0u64;
        for id in src_store.list_blocks().await? {
            if let Some(block) = src_store.get_block(&id).await? {
                bytes += block.len() as u64;
                dst_store.put_block(id, block).await?;
            }
        }
        Ok::<u64, ExchangeError>(bytes)
    };
    let received = match copy.await {
        Ok(bytes) => bytes,
        Err(e) => {
            fail(0, e.to_string());
            return;
        }
    };
    recipient.emit(TransferEvent {
        kind: TransferEventKind::Progress,
        transfer: snapshot(
            channel,
            base,
            recipient.peer,
            sender.peer,
            received,
            TransferStatus::Ongoing,
        ),
    });

    // Scripted paid transfer: request payment, wait for the voucher, have
    // the serving side validate it, acknowledge.
    let script = {
        let scripts = sender.payment_scripts.read().await;
        scripts.get(&voucher.type_id).cloned()
    };
    if let Some(script) = script {
        if !script.total.is_zero() {
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = recipient.pending_payments.lock().await;
                pending.insert(channel, tx);
            }
            recipient.emit(TransferEvent {
                kind: TransferEventKind::PaymentRequested(script.total),
                transfer: snapshot(
                    channel,
                    base,
                    recipient.peer,
                    sender.peer,
                    received,
                    TransferStatus::Ongoing,
                ),
            });

            let payment = match timeout(Duration::from_secs(10), rx).await {
                Ok(Ok(payment)) => payment,
                _ => {
                    fail(received, "payment voucher never arrived".into());
                    return;
                }
            };
            let validator = {
                let validators = sender.validators.read().await;
                validators.get(&payment.type_id).cloned()
            };
            if let Some(validator) = validator {
                if let Err(e) = validator
                    .validate_pull(recipient.peer, &payment, base, &Selector::All)
                    .await
                {
                    fail(received, format!("payment rejected: {e}"));
                    return;
                }
            }
            recipient.emit(TransferEvent {
                kind: TransferEventKind::PaymentAcknowledged,
                transfer: snapshot(
                    channel,
                    base,
                    recipient.peer,
                    sender.peer,
                    received,
                    TransferStatus::Ongoing,
                ),
            });
        }
    }

    let done = snapshot(
        channel,
        base,
        recipient.peer,
        sender.peer,
        received,
        TransferStatus::Completed,
    );
    debug!(channel = %channel, base = %base, received, "transfer completed");
    recipient.emit(TransferEvent {
        kind: TransferEventKind::Completed,
        transfer: done.clone(),
    });
    sender.emit(TransferEvent {
        kind: TransferEventKind::Completed,
        transfer: done,
    });
}

#[async_trait]
impl Transport for MemTransport {
    async fn open_pull(
        &self,
        from: PeerId,
        voucher: TransferVoucher,
        base: ContentId,
        selector: Selector,
    ) -> Result<TransferChannelId> {
        let sender = self.hub.get(&from).await?;
        let recipient = self.inner.clone();

        let validator = {
            let validators = sender.validators.read().await;
            validators.get(&voucher.type_id).cloned().ok_or_else(|| {
                ExchangeError::Protocol(format!("no validator for {}", voucher.type_id))
            })?
        };
        validator
            .validate_pull(recipient.peer, &voucher, base, &selector)
            .await?;

        let channel = TransferChannelId(self.hub.next_channel.fetch_add(1, Ordering::SeqCst));
        tokio::spawn(drive_pull(channel, sender, recipient, voucher, base));
        Ok(channel)
    }

    async fn send_voucher(
        &self,
        channel: TransferChannelId,
        voucher: TransferVoucher,
    ) -> Result<()> {
        let tx = {
            let mut pending = self.inner.pending_payments.lock().await;
            pending.remove(&channel)
        };
        let tx = tx.ok_or_else(|| {
            ExchangeError::NotFound(format!("no payment expected on {channel}"))
        })?;
        tx.send(voucher)
            .map_err(|_| ExchangeError::Transient(format!("channel {channel} gone")))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events_tx.subscribe()
    }

    async fn register_validator(&self, type_id: &str, validator: Arc<dyn PullValidator>) {
        let mut validators = self.inner.validators.write().await;
        validators.insert(type_id.to_string(), validator);
    }

    async fn register_configurer(&self, type_id: &str, configurer: Arc<dyn StoreConfigurer>) {
        let mut configurers = self.inner.configurers.write().await;
        configurers.insert(type_id.to_string(), configurer);
    }
}
