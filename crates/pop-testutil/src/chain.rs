use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use pop_paych::chain::{
    method, ActorState, Chain, CreateChannelParams, ExecReturn, MsgLookup, MsgReceipt, Signature,
    SignedMessage, Wallet, PAYCH_ACTOR_CODE_V1,
};
use pop_paych::state::{encode_lanes_v1, encode_state_v1};
use pop_types::{cbor, Address, ContentId, ExchangeError, Result, TokenAmount};

struct ActorRecord {
    balance: TokenAmount,
    from: Address,
    to: Address,
    settling_at: i64,
    to_send: TokenAmount,
    lanes_cid: ContentId,
    nonce: u64,
}

struct ChainInner {
    nonces: HashMap<Address, u64>,
    pending: VecDeque<(ContentId, SignedMessage)>,
    results: HashMap<ContentId, MsgLookup>,
    actors: HashMap<Address, ActorRecord>,
    objects: HashMap<ContentId, Vec<u8>>,
    addr_seq: u64,
    fail_next: Option<i64>,
}

/// Scripted chain RPC. In auto mode every pushed message confirms
/// immediately; in manual mode messages queue until `execute_pending`, which
/// lets a test observe exactly what was submitted.
pub struct MemChain {
    inner: Mutex<ChainInner>,
    notify: Notify,
    auto: AtomicBool,
}

impl MemChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ChainInner {
                nonces: HashMap::new(),
                pending: VecDeque::new(),
                results: HashMap::new(),
                actors: HashMap::new(),
                objects: HashMap::new(),
                addr_seq: 0,
                fail_next: None,
            }),
            notify: Notify::new(),
            auto: AtomicBool::new(true),
        })
    }

    pub fn manual() -> Arc<Self> {
        let chain = Self::new();
        chain.auto.store(false, Ordering::SeqCst);
        chain
    }

    /// Make the next executed message fail with the given exit code.
    pub async fn fail_next_message(&self, exit_code: i64) {
        let mut inner = self.inner.lock().await;
        inner.fail_next = Some(exit_code);
    }

    pub async fn pending_messages(&self) -> Vec<SignedMessage> {
        let inner = self.inner.lock().await;
        inner.pending.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Execute everything queued in manual mode.
    pub async fn execute_pending(&self) {
        let mut inner = self.inner.lock().await;
        while let Some((mcid, msg)) = inner.pending.pop_front() {
            Self::execute(&mut inner, mcid, &msg);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Install a confirmed channel actor directly, for inbound-side tests.
    pub async fn install_channel_actor(
        &self,
        from: Address,
        to: Address,
        balance: TokenAmount,
    ) -> Address {
        let mut inner = self.inner.lock().await;
        inner.addr_seq += 1;
        let addr = Self::channel_address(inner.addr_seq);
        let lanes = encode_lanes_v1(&[]).expect("encode empty lanes");
        let lanes_cid = ContentId::of_block(&lanes);
        inner.objects.insert(lanes_cid, lanes);
        inner.actors.insert(
            addr,
            ActorRecord {
                balance,
                from,
                to,
                settling_at: 0,
                to_send: TokenAmount::ZERO,
                lanes_cid,
                nonce: 0,
            },
        );
        addr
    }

    /// Overwrite the lane-state array of a channel actor.
    pub async fn set_lane_states(&self, addr: &Address, lanes: &[(TokenAmount, u64)]) {
        let mut inner = self.inner.lock().await;
        let bytes = encode_lanes_v1(lanes).expect("encode lanes");
        let cid = ContentId::of_block(&bytes);
        inner.objects.insert(cid, bytes);
        if let Some(actor) = inner.actors.get_mut(addr) {
            actor.lanes_cid = cid;
        }
    }

    pub async fn actor_balance(&self, addr: &Address) -> Option<TokenAmount> {
        let inner = self.inner.lock().await;
        inner.actors.get(addr).map(|a| a.balance)
    }

    fn channel_address(seq: u64) -> Address {
        let mut seed = b"paych-actor-".to_vec();
        seed.extend_from_slice(&seq.to_be_bytes());
        Address::from_bytes(*blake3::hash(&seed).as_bytes())
    }

    fn execute(inner: &mut ChainInner, mcid: ContentId, smsg: &SignedMessage) {
        if let Some(code) = inner.fail_next.take() {
            inner.results.insert(
                mcid,
                MsgLookup {
                    receipt: MsgReceipt {
                        exit_code: code,
                        return_data: Vec::new(),
                    },
                },
            );
            return;
        }

        let msg = &smsg.message;
        let receipt = if msg.to == Address::init_actor() && msg.method == method::INIT_EXEC {
            match cbor::from_slice::<CreateChannelParams>(&msg.params) {
                Ok(params) => {
                    inner.addr_seq += 1;
                    let addr = Self::channel_address(inner.addr_seq);
                    let lanes = encode_lanes_v1(&[]).expect("encode empty lanes");
                    let lanes_cid = ContentId::of_block(&lanes);
                    inner.objects.insert(lanes_cid, lanes);
                    inner.actors.insert(
                        addr,
                        ActorRecord {
                            balance: msg.value,
                            from: params.from,
                            to: params.to,
                            settling_at: 0,
                            to_send: TokenAmount::ZERO,
                            lanes_cid,
                            nonce: 0,
                        },
                    );
                    debug!(channel_addr = %addr, value = %msg.value, "channel actor constructed");
                    let ret = ExecReturn {
                        id_address: addr,
                        robust_address: addr,
                    };
                    MsgReceipt {
                        exit_code: 0,
                        return_data: cbor::to_vec(&ret).expect("encode exec return"),
                    }
                }
                Err(_) => MsgReceipt {
                    exit_code: 1,
                    return_data: Vec::new(),
                },
            }
        } else if let Some(actor) = inner.actors.get_mut(&msg.to) {
            match msg.method {
                method::SEND => {
                    actor.balance = actor.balance.saturating_add(msg.value);
                    MsgReceipt {
                        exit_code: 0,
                        return_data: Vec::new(),
                    }
                }
                method::PAYCH_SETTLE => {
                    actor.settling_at = 1;
                    MsgReceipt {
                        exit_code: 0,
                        return_data: Vec::new(),
                    }
                }
                method::PAYCH_COLLECT => {
                    actor.to_send = TokenAmount::ZERO;
                    actor.balance = TokenAmount::ZERO;
                    MsgReceipt {
                        exit_code: 0,
                        return_data: Vec::new(),
                    }
                }
                _ => MsgReceipt {
                    exit_code: 1,
                    return_data: Vec::new(),
                },
            }
        } else {
            MsgReceipt {
                exit_code: 1,
                return_data: Vec::new(),
            }
        };

        inner.results.insert(mcid, MsgLookup { receipt });
    }
}

#[async_trait]
impl Chain for MemChain {
    async fn mpool_push(&self, msg: SignedMessage) -> Result<ContentId> {
        let mcid = msg.cid()?;
        let mut inner = self.inner.lock().await;
        let from = msg.message.from;
        let next = inner.nonces.entry(from).or_insert(0);
        *next = msg.message.nonce + 1;
        if self.auto.load(Ordering::SeqCst) {
            Self::execute(&mut inner, mcid, &msg);
        } else {
            inner.pending.push_back((mcid, msg));
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(mcid)
    }

    async fn state_wait_msg(&self, mcid: ContentId, _confidence: u64) -> Result<MsgLookup> {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().await;
                if let Some(lookup) = inner.results.get(&mcid) {
                    return Ok(lookup.clone());
                }
            }
            notified.await;
        }
    }

    async fn state_read_actor(&self, addr: Address) -> Result<ActorState> {
        let inner = self.inner.lock().await;
        let actor = inner
            .actors
            .get(&addr)
            .ok_or_else(|| ExchangeError::ChainRead(format!("no actor at {addr}")))?;
        let state = encode_state_v1(
            actor.from,
            actor.to,
            actor.settling_at,
            actor.to_send,
            actor.lanes_cid,
        )?;
        Ok(ActorState {
            code: PAYCH_ACTOR_CODE_V1.to_string(),
            balance: actor.balance,
            state,
            nonce: actor.nonce,
        })
    }

    async fn chain_read_obj(&self, cid: ContentId) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&cid)
            .cloned()
            .ok_or_else(|| ExchangeError::ChainRead(format!("no object {cid}")))
    }

    async fn next_nonce(&self, addr: Address) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.nonces.get(&addr).copied().unwrap_or(0))
    }
}

/// Deterministic wallet: a signature is the keyed digest of the signer and
/// payload, so verification really fails for the wrong signer or payload.
pub struct TestWallet {
    addr: Address,
}

impl TestWallet {
    pub fn new(seed: u8) -> Arc<Self> {
        Arc::new(Self {
            addr: Address::from_bytes([seed; 32]),
        })
    }

    pub fn signature_for(signer: &Address, data: &[u8]) -> Signature {
        let mut buf = signer.as_bytes().to_vec();
        buf.extend_from_slice(data);
        Signature(blake3::hash(&buf).as_bytes().to_vec())
    }
}

#[async_trait]
impl Wallet for TestWallet {
    fn default_address(&self) -> Address {
        self.addr
    }

    async fn sign(&self, from: Address, data: &[u8]) -> Result<Signature> {
        Ok(Self::signature_for(&from, data))
    }

    async fn verify(&self, signer: Address, data: &[u8], sig: &Signature) -> Result<bool> {
        Ok(*sig == Self::signature_for(&signer, data))
    }
}
