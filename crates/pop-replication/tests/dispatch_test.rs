use std::sync::Arc;
use std::time::Duration;

use pop_index::{BlockStore, DataRef, Index, IndexOptions, MemoryBackend, MultiStore};
use pop_peers::HEY_VERSION;
use pop_replication::{DispatchOptions, Replication, Request, REQUEST_VOUCHER_TYPE};
use pop_testutil::{MemHub, MemNet, TransportHub};
use pop_types::region::CUSTOM_REGION;
use pop_types::{ContentId, Net, Region, Selector, TransferVoucher, Transport};

struct TestNode {
    net: Arc<MemNet>,
    transport: Arc<pop_testutil::transport::MemTransport>,
    index: Arc<Index>,
    repl: Arc<Replication>,
}

async fn new_node(
    hub: &Arc<MemHub>,
    thub: &Arc<TransportHub>,
    regions: Vec<Region>,
) -> TestNode {
    let net = hub.host().await;
    let ms = Arc::new(MultiStore::new());
    let index = Arc::new(
        Index::new(Arc::new(MemoryBackend::new()), ms.clone(), IndexOptions::default())
            .await
            .unwrap(),
    );
    let transport = thub.node(net.local_peer(), ms).await;
    let repl = Replication::new(
        net.clone(),
        index.clone(),
        transport.clone(),
        regions,
        HEY_VERSION.to_string(),
    );
    repl.start().await.unwrap();
    TestNode {
        net,
        transport,
        index,
        repl,
    }
}

fn test_region() -> Vec<Region> {
    vec![Region::new("TestRegion", CUSTOM_REGION)]
}

fn fast_opts(rf: usize) -> DispatchOptions {
    DispatchOptions {
        backoff_min: Duration::from_millis(50),
        backoff_max: Duration::from_secs(2),
        backoff_factor: 2,
        max_attempts: 4,
        rf,
    }
}

/// Content whose chunks are all distinct, so block counts match byte
/// counts in the content-addressed stores.
fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

/// Chunk some content into a fresh store and register its ref.
async fn put_content(node: &TestNode, data: &[u8]) -> Request {
    let store_id = node.index.multistore().next().await;
    let store = node.index.multistore().get(store_id).await.unwrap();
    let root = ContentId::of_block(data);
    for chunk in data.chunks(1024) {
        store
            .put_block(ContentId::of_block(chunk), chunk.to_vec())
            .await
            .unwrap();
    }
    node.index
        .set_ref(DataRef::new(root, data.len() as u64, store_id))
        .await
        .unwrap();
    Request {
        payload_cid: root,
        size: data.len() as u64,
    }
}

async fn wait_for_peers(node: &TestNode, n: usize) {
    for _ in 0..200 {
        if node.repl.peer_mgr().peer_count().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("peers never joined the manager");
}

/// A dispatch with rf=1 lands the content on the one connected peer and
/// yields a single record for it.
#[tokio::test]
async fn test_dispatch_single_peer() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let b = new_node(&hub, &thub, test_region()).await;
    hub.connect(&a.net.local_peer(), &b.net.local_peer())
        .await
        .unwrap();
    wait_for_peers(&a, 1).await;

    let data = patterned(4096, 7);
    let req = put_content(&a, &data).await;

    let mut res = a.repl.dispatch(req, fast_opts(1));
    let rec = res.recv().await.expect("one record");
    assert_eq!(rec.provider, b.net.local_peer());
    assert_eq!(rec.payload_cid, req.payload_cid);
    assert!(res.recv().await.is_none());

    // The provider holds a ref and the actual blocks now.
    let store_id = b.index.get_store_id(&req.payload_cid).await.unwrap();
    let store = b.index.multistore().get(store_id).await.unwrap();
    assert_eq!(store.size().await.unwrap(), data.len() as u64);
}

/// With enough providers, dispatch reaches the full replication factor with
/// distinct peers.
#[tokio::test]
async fn test_dispatch_reaches_quorum() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let mut providers = Vec::new();
    for _ in 0..7 {
        providers.push(new_node(&hub, &thub, test_region()).await);
    }
    hub.connect_all().await.unwrap();
    wait_for_peers(&a, 7).await;

    let data = patterned(8192, 3);
    let req = put_content(&a, &data).await;

    let mut res = a.repl.dispatch(req, fast_opts(7));
    let mut recs = Vec::new();
    while let Some(rec) = res.recv().await {
        recs.push(rec);
    }
    assert_eq!(recs.len(), 7);
    let mut peers: Vec<_> = recs.iter().map(|r| r.provider).collect();
    peers.sort();
    peers.dedup();
    assert_eq!(peers.len(), 7);
    assert!(recs.iter().all(|r| r.payload_cid == req.payload_cid));
}

/// Scarcity is not an error: with only two providers online and rf=3 the
/// stream closes after the attempts with two records.
#[tokio::test]
async fn test_dispatch_with_too_few_peers() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let _b = new_node(&hub, &thub, test_region()).await;
    let _c = new_node(&hub, &thub, test_region()).await;
    hub.connect_all().await.unwrap();
    wait_for_peers(&a, 2).await;

    let req = put_content(&a, &patterned(2048, 1)).await;
    let mut opts = fast_opts(3);
    opts.backoff_min = Duration::from_millis(20);
    opts.max_attempts = 2;

    let mut res = a.repl.dispatch(req, opts);
    let mut recs = Vec::new();
    while let Some(rec) = res.recv().await {
        recs.push(rec);
    }
    assert_eq!(recs.len(), 2);
}

/// Content never lands on peers outside the configured regions.
#[tokio::test]
async fn test_dispatch_region_filtering() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let asia = vec![Region::from_name("Asia").unwrap()];
    let africa = vec![Region::from_name("Africa").unwrap()];

    let a = new_node(&hub, &thub, asia).await;
    let mut african = Vec::new();
    for _ in 0..3 {
        african.push(new_node(&hub, &thub, africa.clone()).await);
    }
    hub.connect_all().await.unwrap();
    // All peers complete the hey, but none matches our regions.
    for _ in 0..100 {
        if a.repl.peer_mgr().peer_count().await == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let req = put_content(&a, &patterned(1024, 9)).await;
    let mut opts = fast_opts(7);
    opts.backoff_min = Duration::from_millis(10);
    opts.max_attempts = 2;

    let mut res = a.repl.dispatch(req, opts);
    assert!(res.recv().await.is_none());
    for node in &african {
        assert!(node.index.peek_ref(&req.payload_cid).await.is_err());
    }
}

/// Pull validation: never-authorized receivers are rejected; authorization
/// flips the same pull to accepted.
#[tokio::test]
async fn test_pull_authorization() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let b = new_node(&hub, &thub, test_region()).await;
    hub.connect_all().await.unwrap();

    let data = patterned(2048, 5);
    let req = put_content(&a, &data).await;
    let voucher = TransferVoucher::encode(REQUEST_VOUCHER_TYPE, &req).unwrap();

    // Receiving side needs a store for the root either way.
    let store_id = b.index.multistore().next().await;
    b.index
        .set_ref(DataRef::new(req.payload_cid, req.size, store_id))
        .await
        .unwrap();

    let denied = b
        .transport
        .open_pull(
            a.net.local_peer(),
            voucher.clone(),
            req.payload_cid,
            Selector::All,
        )
        .await;
    assert!(denied.is_err());

    a.repl
        .authorize_pull(req.payload_cid, b.net.local_peer())
        .await;
    b.transport
        .open_pull(a.net.local_peer(), voucher, req.payload_cid, Selector::All)
        .await
        .unwrap();

    for _ in 0..200 {
        let store = b.index.multistore().get(store_id).await.unwrap();
        if store.size().await.unwrap() == data.len() as u64 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("authorized pull never completed");
}

/// An unknown root is rejected outright.
#[tokio::test]
async fn test_pull_unknown_cid_rejected() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let b = new_node(&hub, &thub, test_region()).await;
    hub.connect_all().await.unwrap();

    let req = Request {
        payload_cid: ContentId::of_block(b"never dispatched"),
        size: 64,
    };
    let voucher = TransferVoucher::encode(REQUEST_VOUCHER_TYPE, &req).unwrap();
    let res = b
        .transport
        .open_pull(a.net.local_peer(), voucher, req.payload_cid, Selector::All)
        .await;
    assert!(res.is_err());
}

/// Pushes are never accepted, whatever the voucher says.
#[tokio::test]
async fn test_push_always_rejected() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let b = new_node(&hub, &thub, test_region()).await;

    let req = Request {
        payload_cid: ContentId::of_block(b"pushed content"),
        size: 64,
    };
    a.repl
        .authorize_pull(req.payload_cid, b.net.local_peer())
        .await;
    let voucher = TransferVoucher::encode(REQUEST_VOUCHER_TYPE, &req).unwrap();
    assert!(a
        .repl
        .validate_push(b.net.local_peer(), &voucher, req.payload_cid, &Selector::All)
        .is_err());
}

/// A failed inbound transfer drops the provisional ref on the receiver.
#[tokio::test]
async fn test_failed_transfer_drops_provisional_ref() {
    let hub = MemHub::new();
    let thub = TransportHub::new();
    let a = new_node(&hub, &thub, test_region()).await;
    let b = new_node(&hub, &thub, test_region()).await;
    hub.connect_all().await.unwrap();
    wait_for_peers(&a, 1).await;

    // Dispatch a root the sender has no blocks for: the pull opens and then
    // fails on the serving side.
    let root = ContentId::of_block(b"phantom content");
    let req = Request {
        payload_cid: root,
        size: 512,
    };
    let mut opts = fast_opts(1);
    opts.max_attempts = 1;
    opts.backoff_min = Duration::from_millis(20);

    let mut res = a.repl.dispatch(req, opts);
    assert!(res.recv().await.is_none());

    for _ in 0..200 {
        if b.index.peek_ref(&root).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("provisional ref survived a failed transfer");
}
