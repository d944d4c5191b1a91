use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use pop_types::{
    ConnEvent, ExchangeError, GossipMessage, Net, Result, StreamHandler, WireStream,
};

struct HostInner {
    peer: PeerId,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    conn_tx: broadcast::Sender<ConnEvent>,
    connected: RwLock<HashSet<PeerId>>,
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>>>,
}

/// Registry of in-process hosts wired together like a mock network.
#[derive(Clone)]
pub struct MemHub {
    hosts: Arc<Mutex<HashMap<PeerId, Arc<HostInner>>>>,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a new host on the hub with a fresh peer id.
    pub async fn host(&self) -> Arc<MemNet> {
        let peer = PeerId::random();
        let (conn_tx, _) = broadcast::channel(64);
        let inner = Arc::new(HostInner {
            peer,
            handlers: RwLock::new(HashMap::new()),
            conn_tx,
            connected: RwLock::new(HashSet::new()),
            topics: RwLock::new(HashMap::new()),
        });
        let mut hosts = self.hosts.lock().await;
        hosts.insert(peer, inner.clone());
        Arc::new(MemNet {
            hub: self.clone(),
            inner,
        })
    }

    async fn get(&self, peer: &PeerId) -> Result<Arc<HostInner>> {
        let hosts = self.hosts.lock().await;
        hosts
            .get(peer)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("host {peer}")))
    }

    /// Connect two hosts, firing connection events on both sides.
    pub async fn connect(&self, a: &PeerId, b: &PeerId) -> Result<()> {
        let ha = self.get(a).await?;
        let hb = self.get(b).await?;
        {
            let mut conns = ha.connected.write().await;
            if !conns.insert(*b) {
                return Ok(());
            }
        }
        {
            let mut conns = hb.connected.write().await;
            conns.insert(*a);
        }
        let _ = ha.conn_tx.send(ConnEvent::Connected(*b));
        let _ = hb.conn_tx.send(ConnEvent::Connected(*a));
        Ok(())
    }

    pub async fn disconnect(&self, a: &PeerId, b: &PeerId) -> Result<()> {
        let ha = self.get(a).await?;
        let hb = self.get(b).await?;
        {
            let mut conns = ha.connected.write().await;
            if !conns.remove(b) {
                return Ok(());
            }
        }
        {
            let mut conns = hb.connected.write().await;
            conns.remove(a);
        }
        let _ = ha.conn_tx.send(ConnEvent::Disconnected(*b));
        let _ = hb.conn_tx.send(ConnEvent::Disconnected(*a));
        Ok(())
    }

    /// Connect every pair of hosts on the hub.
    pub async fn connect_all(&self) -> Result<()> {
        let peers: Vec<PeerId> = {
            let hosts = self.hosts.lock().await;
            hosts.keys().copied().collect()
        };
        for (i, a) in peers.iter().enumerate() {
            for b in peers.iter().skip(i + 1) {
                self.connect(a, b).await?;
            }
        }
        Ok(())
    }
}

/// One host's view of the hub.
pub struct MemNet {
    hub: MemHub,
    inner: Arc<HostInner>,
}

#[async_trait]
impl Net for MemNet {
    fn local_peer(&self) -> PeerId {
        self.inner.peer
    }

    async fn open_stream(&self, to: PeerId, protocol: &str) -> Result<Box<dyn WireStream>> {
        {
            let conns = self.inner.connected.read().await;
            if !conns.contains(&to) {
                return Err(ExchangeError::Transient(format!("not connected to {to}")));
            }
        }
        let remote = self.hub.get(&to).await?;
        let handler = {
            let handlers = remote.handlers.read().await;
            handlers.get(protocol).cloned().ok_or_else(|| {
                ExchangeError::Protocol(format!("{to} does not speak {protocol}"))
            })?
        };
        let (local, remote_end) = tokio::io::duplex(64 * 1024);
        let from = self.inner.peer;
        tokio::spawn(async move {
            handler(from, Box::new(remote_end)).await;
        });
        Ok(Box::new(local))
    }

    async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        let mut handlers = self.inner.handlers.write().await;
        handlers.insert(protocol.to_string(), handler);
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let conns = self.inner.connected.read().await;
        conns.iter().copied().collect()
    }

    fn conn_events(&self) -> broadcast::Receiver<ConnEvent> {
        self.inner.conn_tx.subscribe()
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let hosts: Vec<Arc<HostInner>> = {
            let hosts = self.hub.hosts.lock().await;
            hosts.values().cloned().collect()
        };
        let msg = GossipMessage {
            source: self.inner.peer,
            data,
        };
        for host in hosts {
            if host.peer == self.inner.peer {
                continue;
            }
            let mut topics = host.topics.write().await;
            if let Some(subs) = topics.get_mut(topic) {
                subs.retain(|tx| tx.send(msg.clone()).is_ok());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<GossipMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.inner.topics.write().await;
        topics.entry(topic.to_string()).or_default().push(tx);
        rx
    }
}
