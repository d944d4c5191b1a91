use std::sync::Arc;
use std::time::Duration;

use pop_paych::{
    load_channel_state, ChannelDirection, ChannelState, MemoryPaychBackend, PaychMgr, PaychStore,
    Voucher, Wallet,
};
use pop_testutil::{MemChain, TestWallet};
use pop_types::{Address, ExchangeError, TokenAmount};

fn amt(u: u128) -> TokenAmount {
    TokenAmount::from_base_units(u)
}

async fn new_mgr(chain: Arc<MemChain>, wallet: Arc<TestWallet>) -> PaychMgr {
    let store = Arc::new(
        PaychStore::new(Arc::new(MemoryPaychBackend::new()))
            .await
            .unwrap(),
    );
    PaychMgr::new(chain, wallet, store)
}

macro_rules! wait_until {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ok, "condition never satisfied");
    }};
}

/// Three concurrent funds requests collapse into one create message whose
/// value is the sum, and every promise resolves with the same address.
#[tokio::test]
async fn test_concurrent_requests_merge_into_one_message() {
    let chain = MemChain::manual();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let h1 = mgr.get_or_create_channel(from, to, amt(5)).await.unwrap();
    let h2 = mgr.get_or_create_channel(from, to, amt(7)).await.unwrap();
    let h3 = mgr.get_or_create_channel(from, to, amt(3)).await.unwrap();

    wait_until!(chain.pending_messages().await.len() == 1);
    let msgs = chain.pending_messages().await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].message.value, amt(15));
    assert_eq!(msgs[0].message.to, Address::init_actor());

    chain.execute_pending().await;

    let r1 = h1.wait().await.unwrap();
    let r2 = h2.wait().await.unwrap();
    let r3 = h3.wait().await.unwrap();
    assert!(r1.err.is_none());
    assert!(r1.channel_addr.is_some());
    assert_eq!(r1.channel_addr, r2.channel_addr);
    assert_eq!(r2.channel_addr, r3.channel_addr);

    // Exactly one message ever hit the pool.
    assert!(chain.pending_messages().await.is_empty());
}

/// Cancelling every constituent before processing cancels the merge; nothing
/// is submitted.
#[tokio::test]
async fn test_all_cancelled_submits_nothing() {
    let chain = MemChain::manual();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let h1 = mgr.get_or_create_channel(from, to, amt(5)).await.unwrap();
    let h2 = mgr.get_or_create_channel(from, to, amt(7)).await.unwrap();
    h1.cancel();
    h2.cancel();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(chain.pending_messages().await.is_empty());
    assert!(h1.wait().await.is_err());
    assert!(h2.wait().await.is_err());
}

/// Voucher lifecycle on a funded channel: increasing amounts are accepted, a
/// superseded amount is rejected, and channel funds always cover the
/// redeemable total.
#[tokio::test]
async fn test_voucher_monotonicity_and_accounting() {
    let chain = MemChain::new();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let handle = mgr.get_or_create_channel(from, to, amt(200)).await.unwrap();
    let res = handle.wait().await.unwrap();
    assert!(res.err.is_none());
    let addr = res.channel_addr.unwrap();

    let lane = mgr.allocate_lane(&addr).await.unwrap();
    assert_eq!(lane, 0);

    for amount in [10u128, 25, 60] {
        let out = mgr.create_voucher(&addr, amt(amount), lane).await.unwrap();
        let voucher = out.voucher.expect("voucher signed");
        assert_eq!(voucher.amount, amt(amount));
        assert!(out.shortfall.is_zero());
    }

    // 50 is already superseded by 60 on this lane.
    let err = mgr.create_voucher(&addr, amt(50), lane).await;
    assert!(matches!(err, Err(ExchangeError::Protocol(_))));

    let info = mgr.channel_info(&addr).await.unwrap();
    assert_eq!(info.amount, amt(200));
    assert_eq!(info.total_redeemable(), amt(60));
    assert!(info.amount >= info.total_redeemable());
    // Vouchers within the lane are strictly increasing in (nonce, amount).
    let mut lane_vouchers: Vec<&Voucher> = info
        .vouchers
        .iter()
        .map(|vi| &vi.voucher)
        .filter(|v| v.lane == lane)
        .collect();
    lane_vouchers.sort_by_key(|v| v.nonce);
    for pair in lane_vouchers.windows(2) {
        assert!(pair[0].nonce < pair[1].nonce);
        assert!(pair[0].amount <= pair[1].amount);
    }
}

/// A voucher past the available funds returns a shortfall; topping up via
/// add-funds makes the same voucher signable.
#[tokio::test]
async fn test_shortfall_and_top_up() {
    let chain = MemChain::new();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let res = mgr
        .get_or_create_channel(from, to, amt(100))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let addr = res.channel_addr.unwrap();
    let lane = mgr.allocate_lane(&addr).await.unwrap();

    for amount in [10u128, 25, 60] {
        mgr.create_voucher(&addr, amt(amount), lane).await.unwrap();
    }
    // Available is down to 40; 110 cannot be covered.
    let out = mgr.create_voucher(&addr, amt(110), lane).await.unwrap();
    assert!(out.voucher.is_none());
    assert_eq!(out.shortfall, amt(70));

    let res = mgr
        .get_or_create_channel(from, to, amt(100))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(res.err.is_none());
    assert_eq!(res.channel_addr, Some(addr));
    assert_eq!(chain.actor_balance(&addr).await, Some(amt(200)));

    let out = mgr.create_voucher(&addr, amt(110), lane).await.unwrap();
    assert!(out.voucher.is_some());

    let info = mgr.channel_info(&addr).await.unwrap();
    assert_eq!(info.amount, amt(200));
    assert_eq!(info.total_redeemable(), amt(110));
}

/// A create message confirmed with a non-zero exit code removes the channel
/// record and fails the promises.
#[tokio::test]
async fn test_create_failure_removes_channel() {
    let chain = MemChain::new();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    chain.fail_next_message(7).await;
    let res = mgr
        .get_or_create_channel(from, to, amt(50))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(res.err.is_some());
    assert!(res.channel_addr.is_none());

    wait_until!(mgr
        .store()
        .by_from_to(&from, &to, ChannelDirection::Outbound)
        .await
        .is_err());

    // The pair recovers: a later request creates a fresh channel.
    let res = mgr
        .get_or_create_channel(from, to, amt(50))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(res.err.is_none());
    assert!(res.channel_addr.is_some());
}

/// A failed add-funds rolls the pending amount back without touching the
/// confirmed amount.
#[tokio::test]
async fn test_add_funds_failure_rolls_back() {
    let chain = MemChain::new();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let res = mgr
        .get_or_create_channel(from, to, amt(100))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let addr = res.channel_addr.unwrap();

    chain.fail_next_message(1).await;
    let res = mgr
        .get_or_create_channel(from, to, amt(40))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(res.err.is_some());

    let info = mgr.channel_info(&addr).await.unwrap();
    assert_eq!(info.amount, amt(100));
    assert_eq!(info.pending_amount, TokenAmount::ZERO);
    assert!(info.add_funds_msg.is_none());
}

/// Inbound voucher acceptance: signature verified against on-chain actor
/// state, monotone lanes, minimum delta, and balance coverage.
#[tokio::test]
async fn test_add_voucher_inbound() {
    let chain = MemChain::new();
    let client = Address::from_bytes([1; 32]);
    let provider_wallet = TestWallet::new(9);
    let mgr = new_mgr(chain.clone(), provider_wallet.clone()).await;
    let provider = provider_wallet.default_address();

    let addr = chain.install_channel_actor(client, provider, amt(100)).await;

    let sign = |voucher: &Voucher| {
        let mut v = voucher.clone();
        v.signature = Some(TestWallet::signature_for(
            &client,
            &voucher.signing_bytes().unwrap(),
        ));
        v
    };

    let v1 = sign(&Voucher::new(addr, 0, 1, amt(10)));
    assert_eq!(mgr.add_voucher(&addr, v1, TokenAmount::ZERO).await.unwrap(), amt(10));

    // Forged signer.
    let mut forged = Voucher::new(addr, 0, 2, amt(20));
    forged.signature = Some(TestWallet::signature_for(
        &provider,
        &forged.signing_bytes().unwrap(),
    ));
    assert!(matches!(
        mgr.add_voucher(&addr, forged, TokenAmount::ZERO).await,
        Err(ExchangeError::Unauthorized(_))
    ));

    // Delta below the agreed minimum.
    let v2 = sign(&Voucher::new(addr, 0, 2, amt(15)));
    assert!(matches!(
        mgr.add_voucher(&addr, v2, amt(10)).await,
        Err(ExchangeError::Protocol(_))
    ));

    // Redeemable total past the channel balance.
    let v3 = sign(&Voucher::new(addr, 0, 3, amt(150)));
    assert!(matches!(
        mgr.add_voucher(&addr, v3, TokenAmount::ZERO).await,
        Err(ExchangeError::Insufficient { .. })
    ));

    let info = mgr.channel_info(&addr).await.unwrap();
    assert_eq!(info.direction, ChannelDirection::Inbound);
    assert_eq!(info.total_redeemable(), amt(10));
}

#[tokio::test]
async fn test_settle_then_collect_removes_channel() {
    let chain = MemChain::new();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let res = mgr
        .get_or_create_channel(from, to, amt(30))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let addr = res.channel_addr.unwrap();

    // Collect before settle is refused.
    assert!(mgr.collect(&addr).await.is_err());

    mgr.settle(&addr).await.unwrap();
    wait_until!(mgr
        .channel_info(&addr)
        .await
        .map(|i| i.settling)
        .unwrap_or(false));

    mgr.collect(&addr).await.unwrap();
    wait_until!(mgr.channel_info(&addr).await.is_err());
}

/// Message completion callbacks fire exactly once, including for outcomes
/// recorded before subscription.
#[tokio::test]
async fn test_on_msg_complete() {
    let chain = MemChain::manual();
    let wallet = TestWallet::new(1);
    let mgr = new_mgr(chain.clone(), wallet.clone()).await;
    let from = wallet.default_address();
    let to = Address::from_bytes([2; 32]);

    let handle = mgr.get_or_create_channel(from, to, amt(5)).await.unwrap();
    wait_until!(chain.pending_messages().await.len() == 1);
    let mcid = chain.pending_messages().await[0].cid().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    mgr.on_msg_complete(
        mcid,
        Box::new(move |err| {
            let _ = tx.send(err);
        }),
    )
    .await;

    chain.execute_pending().await;
    handle.wait().await.unwrap();
    assert_eq!(rx.await.unwrap(), None);

    // Late subscription sees the recorded outcome immediately.
    let (tx, rx) = tokio::sync::oneshot::channel();
    mgr.on_msg_complete(
        mcid,
        Box::new(move |err| {
            let _ = tx.send(err);
        }),
    )
    .await;
    assert_eq!(rx.await.unwrap(), None);
}

/// The versioned decoder surfaces the actor state and lazily materialized
/// lane states.
#[tokio::test]
async fn test_load_channel_state() {
    let chain = MemChain::new();
    let client = Address::from_bytes([1; 32]);
    let provider = Address::from_bytes([2; 32]);
    let addr = chain.install_channel_actor(client, provider, amt(500)).await;
    chain
        .set_lane_states(&addr, &[(amt(10), 3), (amt(40), 7)])
        .await;

    let state = load_channel_state(chain.clone(), addr).await.unwrap();
    assert_eq!(state.from(), client);
    assert_eq!(state.to(), provider);
    assert_eq!(state.lane_count().await.unwrap(), 2);

    let mut lanes = Vec::new();
    state
        .for_each_lane_state(&mut |idx, lane| {
            lanes.push((idx, lane.redeemed(), lane.nonce()));
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(lanes, vec![(0, amt(10), 3), (1, amt(40), 7)]);
}

/// An unknown actor code is a chain-read error, not a panic or a guess.
#[tokio::test]
async fn test_unknown_actor_code_rejected() {
    use pop_paych::chain::ActorState;
    let chain = MemChain::new();
    let actor = ActorState {
        code: "paych/v99".to_string(),
        balance: TokenAmount::ZERO,
        state: Vec::new(),
        nonce: 0,
    };
    let res = pop_paych::state::decode_channel_state(&actor, chain);
    assert!(matches!(res, Err(ExchangeError::ChainRead(_))));
}
