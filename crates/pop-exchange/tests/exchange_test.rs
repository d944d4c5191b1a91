use std::sync::Arc;
use std::time::Duration;

use pop_exchange::{Exchange, Options};
use pop_index::{BlockStore, MemoryBackend, MultiStore};
use pop_paych::MemoryPaychBackend;
use pop_retrieval::{SelectFirst, SessionStatus, DEAL_PROPOSAL_VOUCHER_TYPE};
use pop_testutil::{MemChain, MemHub, MemNet, MemTransport, PaymentScript, TestWallet, TransportHub};
use pop_types::{ContentId, Net, TokenAmount};

struct TestExchange {
    exch: Arc<Exchange>,
    net: Arc<MemNet>,
    transport: Arc<MemTransport>,
    ms: Arc<MultiStore>,
}

async fn new_exchange(
    hub: &Arc<MemHub>,
    thub: &Arc<TransportHub>,
    chain: Option<Arc<MemChain>>,
    seed: u8,
    options: Options,
) -> TestExchange {
    let net = hub.host().await;
    let ms = Arc::new(MultiStore::new());
    let transport = thub.node(net.local_peer(), ms.clone()).await;
    let wallet = TestWallet::new(seed);
    let exch = Exchange::new(
        net.clone(),
        transport.clone(),
        chain.map(|c| c as Arc<dyn pop_paych::Chain>),
        wallet,
        ms.clone(),
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryPaychBackend::new()),
        options,
    )
    .await
    .unwrap();
    TestExchange {
        exch,
        net,
        transport,
        ms,
    }
}

fn fast_options(ask_ppb: u128) -> Options {
    let mut options = Options::default();
    options.dispatch.replication_factor = 1;
    options.dispatch.backoff_min_ms = 50;
    options.dispatch.max_attempts = 4;
    options.ask.price_per_byte = TokenAmount::from_base_units(ask_ppb);
    options
}

/// Content whose chunks are all distinct, so block counts match byte
/// counts in the content-addressed stores.
fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

async fn commit_content(node: &TestExchange, data: &[u8]) -> ContentId {
    let store_id = node.ms.next().await;
    let store = node.ms.get(store_id).await.unwrap();
    let root = ContentId::of_block(data);
    for chunk in data.chunks(512) {
        store
            .put_block(ContentId::of_block(chunk), chunk.to_vec())
            .await
            .unwrap();
    }
    node.exch
        .put(root, data.len() as u64, store_id)
        .await
        .unwrap();
    root
}

async fn wait_for_peers(node: &TestExchange, n: usize) {
    for _ in 0..200 {
        if node.exch.peer_mgr().peer_count().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("peers never joined");
}

/// The full loop: a producer commits and dispatches content to a cache, and
/// a consumer later discovers, pays for, and retrieves it from that cache.
#[tokio::test]
async fn test_commit_dispatch_retrieve() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let chain = MemChain::new();

    let producer = new_exchange(&hub, &thub, Some(chain.clone()), 1, fast_options(0)).await;
    let cache = new_exchange(&hub, &thub, Some(chain.clone()), 2, fast_options(1)).await;
    hub.connect(&producer.net.local_peer(), &cache.net.local_peer())
        .await
        .unwrap();
    wait_for_peers(&producer, 1).await;

    let data = patterned(2000, 5);
    let root = commit_content(&producer, &data).await;

    let mut res = producer.exch.dispatch(root).await.unwrap();
    let rec = res.recv().await.expect("a cache confirmed");
    assert_eq!(rec.provider, cache.net.local_peer());
    assert!(res.recv().await.is_none());
    assert!(cache.exch.index().peek_ref(&root).await.is_ok());

    // The cache charges one unit per byte.
    let total = TokenAmount::from_base_units(data.len() as u128);
    cache
        .transport
        .set_payment_script(DEAL_PROPOSAL_VOUCHER_TYPE, PaymentScript { total })
        .await;

    // Late-joining consumer, connected to the cache only.
    let consumer = new_exchange(&hub, &thub, Some(chain.clone()), 3, fast_options(0)).await;
    hub.connect(&consumer.net.local_peer(), &cache.net.local_peer())
        .await
        .unwrap();

    let session = consumer
        .exch
        .new_session(root, None, Box::new(SelectFirst));
    let state = session.run(Duration::from_secs(2)).await.unwrap();
    assert_eq!(state.status, SessionStatus::Done);
    assert_eq!(state.bytes_received, data.len() as u64);
    assert_eq!(state.funds_spent, total);

    // Consumer indexes what it retrieved; the cache redeemed the voucher.
    assert!(consumer.exch.index().peek_ref(&root).await.is_ok());
    let cache_channels = cache.exch.paych().store().list_channels().await;
    assert_eq!(cache_channels.len(), 1);
    assert_eq!(cache_channels[0].total_redeemable(), total);
}

/// Without a chain endpoint the exchange still replicates and serves free
/// retrievals.
#[tokio::test]
async fn test_offline_chain_free_path() {
    let hub = MemHub::new();
    let thub = TransportHub::new();

    let producer = new_exchange(&hub, &thub, None, 1, fast_options(0)).await;
    let cache = new_exchange(&hub, &thub, None, 2, fast_options(0)).await;
    assert!(!producer.exch.is_chain_online());

    hub.connect(&producer.net.local_peer(), &cache.net.local_peer())
        .await
        .unwrap();
    wait_for_peers(&producer, 1).await;

    let data = patterned(600, 9);
    let root = commit_content(&producer, &data).await;
    let mut res = producer.exch.dispatch(root).await.unwrap();
    assert!(res.recv().await.is_some());

    let consumer = new_exchange(&hub, &thub, None, 3, fast_options(0)).await;
    hub.connect(&consumer.net.local_peer(), &cache.net.local_peer())
        .await
        .unwrap();

    let session = consumer
        .exch
        .new_session(root, None, Box::new(SelectFirst));
    let state = session.run(Duration::from_secs(2)).await.unwrap();
    assert_eq!(state.status, SessionStatus::Done);
    assert_eq!(state.funds_spent, TokenAmount::ZERO);
}

/// Dispatching an unknown root is an index miss, not a hang.
#[tokio::test]
async fn test_dispatch_unknown_root() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let node = new_exchange(&hub, &thub, None, 1, fast_options(0)).await;
    assert!(node
        .exch
        .dispatch(ContentId::of_block(b"never committed"))
        .await
        .is_err());
}
