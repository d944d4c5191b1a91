use std::time::Duration;

use pop_types::TokenAmount;

use crate::offer::Offer;

/// What to do with an incoming offer.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Keep collecting.
    Await,
    /// Stop and retrieve from this offer.
    Select(Offer),
    /// Drop the offer and keep collecting.
    Reject,
}

/// Pluggable offer selection. The session feeds offers in arrival order and
/// calls `finish` when the discovery window closes.
pub trait Strategy: Send {
    fn offer(&mut self, offer: Offer) -> Decision;

    /// Best candidate so far, if the strategy holds one back.
    fn finish(&mut self) -> Option<Offer> {
        None
    }

    /// Extra collection window the strategy wants past the first offer.
    fn deadline(&self) -> Option<Duration> {
        None
    }
}

/// Take the first valid offer.
pub struct SelectFirst;

impl Strategy for SelectFirst {
    fn offer(&mut self, offer: Offer) -> Decision {
        Decision::Select(offer)
    }
}

/// Take the cheapest of the first `k` offers within the window `d`.
pub struct SelectCheapest {
    k: usize,
    d: Duration,
    seen: usize,
    best: Option<Offer>,
}

impl SelectCheapest {
    pub fn new(k: usize, d: Duration) -> Self {
        Self {
            k,
            d,
            seen: 0,
            best: None,
        }
    }

    fn price(offer: &Offer) -> TokenAmount {
        offer.response.piece_retrieval_price()
    }
}

impl Strategy for SelectCheapest {
    fn offer(&mut self, offer: Offer) -> Decision {
        self.seen += 1;
        let better = match &self.best {
            Some(best) => Self::price(&offer) < Self::price(best),
            None => true,
        };
        if better {
            self.best = Some(offer);
        }
        if self.seen >= self.k {
            if let Some(best) = self.best.take() {
                return Decision::Select(best);
            }
        }
        Decision::Await
    }

    fn finish(&mut self) -> Option<Offer> {
        self.best.take()
    }

    fn deadline(&self) -> Option<Duration> {
        Some(self.d)
    }
}

/// Take the first offer whose price per byte is within the cap.
pub struct SelectFirstLowerThan {
    max_price_per_byte: TokenAmount,
}

impl SelectFirstLowerThan {
    pub fn new(max_price_per_byte: TokenAmount) -> Self {
        Self { max_price_per_byte }
    }
}

impl Strategy for SelectFirstLowerThan {
    fn offer(&mut self, offer: Offer) -> Decision {
        if offer.response.price_per_byte <= self.max_price_per_byte {
            Decision::Select(offer)
        } else {
            Decision::Reject
        }
    }
}
