use libp2p::PeerId;
use std::collections::HashMap;
use tokio::sync::RwLock;

use pop_types::ContentId;

use crate::deal::QueryResponse;

/// A provider's advertised terms for serving a given root.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub provider: PeerId,
    pub response: QueryResponse,
}

/// Caches the selected offer per logical root so follow-up keys in the same
/// transaction skip rediscovery.
pub struct OfferMgr {
    offers: RwLock<HashMap<ContentId, Offer>>,
}

impl OfferMgr {
    pub fn new() -> Self {
        Self {
            offers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_offer(&self, root: &ContentId) -> Option<Offer> {
        let offers = self.offers.read().await;
        offers.get(root).cloned()
    }

    pub async fn set_offer(&self, root: ContentId, offer: Offer) {
        let mut offers = self.offers.write().await;
        offers.insert(root, offer);
    }

    pub async fn remove_offer(&self, root: &ContentId) {
        let mut offers = self.offers.write().await;
        offers.remove(root);
    }
}

impl Default for OfferMgr {
    fn default() -> Self {
        Self::new()
    }
}
