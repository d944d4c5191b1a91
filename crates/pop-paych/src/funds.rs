//! Funds requests queued against a channel and their merging. Concurrent
//! requests between the same pair collapse into one on-chain message; the
//! merge owns its children and a child signals cancellation through a shared
//! flag rather than a back-pointer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use pop_types::{Address, ContentId, ExchangeError, Result, TokenAmount};

/// Outcome delivered to every active constituent of a funds request.
#[derive(Debug, Clone)]
pub struct FundsRes {
    pub channel_addr: Option<Address>,
    pub mcid: Option<ContentId>,
    pub err: Option<String>,
}

/// A single request to create a channel or add funds to one.
pub(crate) struct FundsReq {
    pub amount: TokenAmount,
    active: Arc<AtomicBool>,
    promise: Option<oneshot::Sender<FundsRes>>,
}

impl FundsReq {
    pub fn new(amount: TokenAmount) -> (Self, FundsHandle) {
        let (tx, rx) = oneshot::channel();
        let active = Arc::new(AtomicBool::new(true));
        let req = Self {
            amount,
            active: active.clone(),
            promise: Some(tx),
        };
        (req, FundsHandle { rx, active })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolve the caller's promise. Inactive requests are skipped; their
    /// handle observes the drop instead.
    pub fn complete(&mut self, res: FundsRes) {
        if !self.is_active() {
            return;
        }
        if let Some(tx) = self.promise.take() {
            let _ = tx.send(res);
        }
    }
}

/// Aggregates the currently-active requests into a single on-chain
/// operation.
pub(crate) struct MergedFundsReq {
    pub reqs: Vec<FundsReq>,
}

impl MergedFundsReq {
    pub fn new(reqs: Vec<FundsReq>) -> Self {
        Self { reqs }
    }

    /// Sum over the still-active constituents.
    pub fn sum(&self) -> TokenAmount {
        self.reqs
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.amount)
            .sum()
    }

    /// True when every child was cancelled before submission.
    pub fn is_cancelled(&self) -> bool {
        !self.reqs.iter().any(|r| r.is_active())
    }

    pub fn complete(&mut self, res: FundsRes) {
        for req in &mut self.reqs {
            req.complete(res.clone());
        }
    }
}

/// Caller-side handle on a queued funds request.
pub struct FundsHandle {
    rx: oneshot::Receiver<FundsRes>,
    active: Arc<AtomicBool>,
}

impl FundsHandle {
    /// Mark the request inactive. A message already submitted on chain is
    /// not retracted; the request simply stops caring about the outcome.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Await the outcome of the merged on-chain operation.
    pub async fn wait(self) -> Result<FundsRes> {
        self.rx
            .await
            .map_err(|_| ExchangeError::Transient("funds request cancelled".into()))
    }
}
