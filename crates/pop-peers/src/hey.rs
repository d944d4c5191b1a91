use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use pop_types::{wire, ConnEvent, ExchangeError, Net, Region, Result, WireStream};

use crate::manager::PeerMgr;

/// Protocol id for the single-shot region handshake.
pub const HEY_PROTOCOL_ID: &str = "/myel/pop/hey/1.0";

/// Default handshake version. A peer announcing anything else is demoted.
pub const HEY_VERSION: &str = "1.0";

const HEY_TIMEOUT: Duration = Duration::from_secs(10);

/// The handshake payload: each side announces the regions it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hey {
    pub regions: Vec<Region>,
    pub version: String,
}

/// Runs the hey exchange on every new connection and feeds the peer manager.
#[derive(Clone)]
pub struct HeyService {
    net: Arc<dyn Net>,
    pm: Arc<PeerMgr>,
    regions: Vec<Region>,
    version: String,
}

impl HeyService {
    pub fn new(
        net: Arc<dyn Net>,
        pm: Arc<PeerMgr>,
        regions: Vec<Region>,
        version: String,
    ) -> Self {
        Self {
            net,
            pm,
            regions,
            version,
        }
    }

    fn local_hey(&self) -> Hey {
        Hey {
            regions: self.regions.clone(),
            version: self.version.clone(),
        }
    }

    /// Register the inbound handler and start reacting to connection events.
    pub async fn start(&self) -> Result<()> {
        let svc = self.clone();
        self.net
            .set_stream_handler(
                HEY_PROTOCOL_ID,
                Arc::new(move |peer, stream| {
                    let svc = svc.clone();
                    Box::pin(async move {
                        if let Err(e) = svc.handle_inbound(peer, stream).await {
                            warn!(peer = %peer, error = %e, "inbound hey failed");
                        }
                    })
                }),
            )
            .await;

        let svc = self.clone();
        let mut events = self.net.conn_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ConnEvent::Connected(peer) => {
                        let svc = svc.clone();
                        tokio::spawn(async move {
                            if let Err(e) = svc.say_hey(peer).await {
                                warn!(peer = %peer, error = %e, "hey failed, peer demoted");
                            }
                        });
                    }
                    ConnEvent::Disconnected(peer) => {
                        svc.pm.remove_peer(&peer).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Initiate a hey with a freshly connected peer.
    async fn say_hey(&self, peer: PeerId) -> Result<()> {
        let started = Instant::now();
        let hey = timeout(HEY_TIMEOUT, async {
            let mut stream = self.net.open_stream(peer, HEY_PROTOCOL_ID).await?;
            wire::write_framed(&mut stream, &self.local_hey()).await?;
            wire::read_framed::<_, Hey>(&mut stream).await
        })
        .await
        .map_err(|_| ExchangeError::Transient(format!("hey timeout with {peer}")))??;

        self.check_version(&hey)?;
        let latency = started.elapsed().as_millis() as u64;
        debug!(peer = %peer, latency_ms = latency, "hey completed");
        self.pm.add_peer(peer, hey.regions, Some(latency)).await;
        Ok(())
    }

    /// Respond to a peer's hey on an inbound stream.
    async fn handle_inbound(&self, peer: PeerId, mut stream: Box<dyn WireStream>) -> Result<()> {
        let hey = timeout(HEY_TIMEOUT, wire::read_framed::<_, Hey>(&mut stream))
            .await
            .map_err(|_| ExchangeError::Transient(format!("hey timeout with {peer}")))??;
        self.check_version(&hey)?;
        wire::write_framed(&mut stream, &self.local_hey()).await?;
        self.pm.add_peer(peer, hey.regions, None).await;
        Ok(())
    }

    fn check_version(&self, hey: &Hey) -> Result<()> {
        if hey.version != self.version {
            return Err(ExchangeError::Protocol(format!(
                "hey version mismatch: {} != {}",
                hey.version, self.version
            )));
        }
        Ok(())
    }
}
