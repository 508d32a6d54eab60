//! In-process data center for integration tests.
//!
//! Speaks the server side of the handshake with a fixed RSA key and the
//! server side of the encrypted envelope protocol. Request payloads are
//! small text commands:
//!
//! | payload      | answer                                                |
//! |--------------|-------------------------------------------------------|
//! | `echo:<x>`   | rpc_result `<x>`                                      |
//! | `migrate:N`  | rpc_result `here:N` on DC N, `USER_MIGRATE_N` elsewhere |
//! | `moved:N`    | always `USER_MIGRATE_N`                               |
//! | `push:<x>`   | updates `<x>`, then rpc_result `pushed`               |
//! | `batch`      | container of updates `u1` and rpc_result `batched`    |
//! | `fail`       | rpc_error 400 `BAD_REQUEST`                           |
//! | `revoke`     | rpc_error 401, and the server forgets the key          |
//! | `salt`       | bad_server_salt until the rotated salt is used        |
//! | `drop-once`  | closes the socket the first time, then `survived`     |
//! | `garble`     | a frame under a key the client never saw              |
//! | `silent`     | nothing                                               |
//! | `vanish`     | stops listening, then closes the socket               |

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use num_bigint::BigUint;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use dc_session::authorizer::dh;
use dc_session::crypto::{self, AuthKey, Direction, TempKey};
use dc_session::wire::frame::{read_frame, write_frame};
use dc_session::wire::messages::{
    BadServerSalt, ClientDhInnerData, ContainedMessage, DhGenAnswer, DhGenKind, InitConnection, MsgContainer,
    PqInnerData, ReqDhParams, ReqPqMulti, ResPq, RpcErrorReply, RpcResult, ServerDhInnerData, ServerDhParams,
    ServerDhParamsOk, ServerMessage, SetClientDhParams, TlObject, Updates,
};
use dc_session::wire::{self, InnerMessage};
use dc_session::{DcId, Endpoint, ServerKeyConfig, SessionConfig};

pub const MODULUS: &str = concat!(
    "b58addc2041013e29e3eb2d878fd057b7b005e1f17afb4741056f151b7b5cda2",
    "f952e6aeb162adeddd9f379acaad3988589fa5e10002a06c2f6adfb9b73f6688",
    "8ccce4557dcff0180050029df5422b4550ca7399b8eae65bb83421f57a99b6f0",
    "9e5ed6146e0a41cf911276f178ed2af6fc37f883fadbda172414cf851406506f",
    "63b741b58cf1293c8f0a6ed8ce74180e21dd1a9adf99059de35dd6429f2c7e5f",
    "5a71cb21e19cc5984dfe286c791874f63ab3887ca1a15487eec2ca4bcdbd8415",
    "d8551b629f9cc9a84a14a45d7d339ebbafd778ae21a40f768ca182d4c1bfcf17",
    "523719cdbaf4b510f7352ea0eee61252ac2fe0bb95c33a9e3fc0b4ef0c6d730f",
);

const PRIVATE_EXPONENT: &str = concat!(
    "168baf6ca7ea833db29f60c0a78decbf601034a031e5dd4848bb336f0d9ca374",
    "28f895b37e4e1e019b7369896cc04493dd45be690a024980060784cf60a59c0b",
    "3b493ad62f30c2c5884c6776cc7db23802879201b6485de16827f94bae3526d6",
    "0d2503fb378b488f099a3c7152ae4996b0ce16abf55c96622755fa4bb1a7f317",
    "1c1fc350a3327de96554edee3d564fcab74fa8c51f7195bf45053775a348dc13",
    "4f838c111f0981fafeca26335ac883fc4d11349072656f84da8aea2a1529f89a",
    "f1974b907b3d7bf40648fef2ffc327aa12eb901e77bcc68ebc2a72684f3df18d",
    "d826d72ffdd3493884712868122819782e012f0c8a46a1e43239ead20e722039",
);

pub const FINGERPRINT: u64 = 0xb0f3db4135217ccd;

/// RFC 3526 group 14.
const PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// 1229739323 * 1402015859
const PQ: u64 = 0x17ED48941A08F981;

const GENERATOR: u32 = 3;

/// Salt the server switches to for the `salt` command.
pub const ROTATED_SALT: u64 = 0x5a17_5a17_5a17_5a17;

/// Client config with fast timeouts and the test server key.
pub fn config(endpoints: Vec<Endpoint>) -> SessionConfig {
    SessionConfig {
        endpoints,
        server_keys: vec![ServerKeyConfig {
            modulus_hex: MODULUS.to_string(),
            exponent: 65537,
        }],
        request_timeout_ms: 20_000,
        sweep_interval_ms: 50,
        handshake_step_timeout_ms: 20_000,
        connect_timeout_ms: 2_000,
        reconnect_base_delay_ms: 20,
        reconnect_max_attempts: 3,
        max_dh_retries: 3,
        primality_rounds: 4,
        ..SessionConfig::default()
    }
}

/// An address nothing listens on.
pub fn dead_endpoint(dc: DcId) -> Endpoint {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    Endpoint::new(dc, "127.0.0.1", port)
}

#[derive(Default)]
struct ServerState {
    keys: DashMap<u64, AuthKey>,
    handshakes: AtomicUsize,
    handshake_done_at: Mutex<Option<std::time::Instant>>,
    requests: Mutex<Vec<Bytes>>,
    dropped_once: AtomicBool,
    next_message_id: AtomicU64,
    vanish: tokio::sync::Notify,
}

/// Options for a [`MockDc`].
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Pause before answering `req_pq_multi`
    pub handshake_delay: Duration,
    /// Answer this many `dh_gen_retry` before `dh_gen_ok`
    pub dh_retries: u32,
}

pub struct MockDc {
    pub dc: DcId,
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl MockDc {
    pub async fn start(dc: DcId) -> Self {
        Self::start_with(dc, MockOptions::default()).await
    }

    pub async fn start_with(dc: DcId, options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock dc");
        let addr = listener.local_addr().expect("mock dc addr");
        let state = Arc::new(ServerState {
            next_message_id: AtomicU64::new(1 << 32),
            ..ServerState::default()
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                    // Dropping the listener refuses every later connect
                    _ = accept_state.vanish.notified() => break,
                };
                let state = Arc::clone(&accept_state);
                let options = options.clone();
                tokio::spawn(async move {
                    let _ = serve(dc, state, options, stream).await;
                });
            }
        });

        Self { dc, addr, state, task }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.dc, "127.0.0.1", self.addr.port())
    }

    /// Completed handshakes.
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn handshake_done_at(&self) -> Option<std::time::Instant> {
        *self.state.handshake_done_at.lock().unwrap()
    }

    /// Request payloads received, in order.
    pub fn requests(&self) -> Vec<Bytes> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn knows_key(&self, key_id: u64) -> bool {
        self.state.keys.contains_key(&key_id)
    }
}

impl Drop for MockDc {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("prime")
}

fn now_secs() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}

/// Per-connection handshake progress.
struct Exchange {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: Option<[u8; 32]>,
    secret: Option<BigUint>,
    attempt: u32,
}

async fn serve(dc: DcId, state: Arc<ServerState>, options: MockOptions, mut stream: TcpStream) -> anyhow::Result<()> {
    let mut exchange: Option<Exchange> = None;
    while let Some(frame) = read_frame(&mut stream).await? {
        if wire::peek_auth_key_id(&frame)? == 0 {
            let request = wire::decode_plain(&frame)?;
            let answer = handshake_step(dc, &state, &options, &mut exchange, &request.body).await?;
            let id = state.next_message_id.fetch_add(4, Ordering::SeqCst);
            write_frame(&mut stream, &wire::encode_plain(id, &answer)).await?;
        } else if !serve_envelope(dc, &state, &mut stream, &frame).await? {
            return Ok(());
        }
    }
    Ok(())
}

async fn handshake_step(
    dc: DcId,
    state: &ServerState,
    options: &MockOptions,
    exchange: &mut Option<Exchange>,
    body: &[u8],
) -> anyhow::Result<Bytes> {
    let constructor = u32::from_le_bytes(body[..4].try_into()?);

    if constructor == ReqPqMulti::CONSTRUCTOR {
        let req = ReqPqMulti::from_bytes(body)?;
        tokio::time::sleep(options.handshake_delay).await;
        let server_nonce = random_array();
        *exchange = Some(Exchange {
            nonce: req.nonce,
            server_nonce,
            new_nonce: None,
            secret: None,
            attempt: 0,
        });
        return Ok(ResPq {
            nonce: req.nonce,
            server_nonce,
            pq: PQ.to_be_bytes().to_vec(),
            fingerprints: vec![0x0123_4567_89ab_cdef, FINGERPRINT],
        }
        .to_bytes());
    }

    let ex = exchange.as_mut().ok_or_else(|| anyhow::anyhow!("handshake out of order"))?;
    let p = prime();

    if constructor == ReqDhParams::CONSTRUCTOR {
        let req = ReqDhParams::from_bytes(body)?;
        anyhow::ensure!(req.fingerprint == FINGERPRINT, "wrong fingerprint");

        let n = BigUint::parse_bytes(MODULUS.as_bytes(), 16).expect("modulus");
        let d = BigUint::parse_bytes(PRIVATE_EXPONENT.as_bytes(), 16).expect("exponent");
        let block = crypto::to_be_padded(&BigUint::from_bytes_be(&req.encrypted_data).modpow(&d, &n), 255);
        let inner = PqInnerData::from_bytes(&block[32..])?;
        anyhow::ensure!(crypto::sha256(&[&inner.to_bytes()]) == block[..32], "bad RSA block digest");
        anyhow::ensure!(inner.nonce == ex.nonce && inner.server_nonce == ex.server_nonce, "nonce");
        let p_val = inner.p.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let q_val = inner.q.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        anyhow::ensure!(p_val.wrapping_mul(q_val) == PQ && p_val < q_val, "bad factors");

        let secret = dh::generate_secret(&p);
        let g_a = dh::public_value(GENERATOR, &secret, &p);
        let answer = ServerDhInnerData {
            nonce: ex.nonce,
            server_nonce: ex.server_nonce,
            g: GENERATOR,
            dh_prime: p.to_bytes_be(),
            g_a: g_a.to_bytes_be(),
            server_time: now_secs(),
        };
        let temp = TempKey::derive(&inner.new_nonce, &ex.server_nonce);
        let encrypted_answer = temp
            .encrypt(Direction::ServerToClient, 0, &answer.to_bytes())
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        ex.new_nonce = Some(inner.new_nonce);
        ex.secret = Some(secret);
        return Ok(ServerDhParams::Ok(ServerDhParamsOk {
            nonce: ex.nonce,
            server_nonce: ex.server_nonce,
            encrypted_answer,
        })
        .to_bytes());
    }

    if constructor == SetClientDhParams::CONSTRUCTOR {
        let req = SetClientDhParams::from_bytes(body)?;
        let new_nonce = ex.new_nonce.ok_or_else(|| anyhow::anyhow!("no new_nonce"))?;
        let secret = ex.secret.clone().ok_or_else(|| anyhow::anyhow!("no secret"))?;

        let temp = TempKey::derive(&new_nonce, &ex.server_nonce);
        let plain = temp
            .decrypt(Direction::ClientToServer, ex.attempt, &req.encrypted_data)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let client = ClientDhInnerData::from_bytes(&plain)?;
        let g_b = BigUint::from_bytes_be(&client.g_b);
        let shared = dh::shared_secret(&g_b, &secret, &p);
        let key = AuthKey::from_bytes(dc, &shared).ok_or_else(|| anyhow::anyhow!("key size"))?;

        let kind = if ex.attempt < options.dh_retries {
            ex.attempt += 1;
            DhGenKind::Retry
        } else {
            DhGenKind::Ok
        };
        let answer = DhGenAnswer {
            kind,
            nonce: ex.nonce,
            server_nonce: ex.server_nonce,
            new_nonce_hash: crypto::new_nonce_hash(&new_nonce, kind.hash_marker(), key.aux_hash()),
        };
        if kind == DhGenKind::Ok {
            state.keys.insert(key.id(), key);
            state.handshakes.fetch_add(1, Ordering::SeqCst);
            *state.handshake_done_at.lock().unwrap() = Some(std::time::Instant::now());
        }
        return Ok(answer.to_bytes());
    }

    anyhow::bail!("unexpected handshake constructor {:#x}", constructor)
}

/// Returns false when the connection should close.
async fn serve_envelope(dc: DcId, state: &ServerState, stream: &mut TcpStream, frame: &[u8]) -> anyhow::Result<bool> {
    let key_id = wire::peek_auth_key_id(frame)?;
    let key = match state.keys.get(&key_id) {
        Some(key) => key.clone(),
        None => return Ok(false),
    };
    let (header, plaintext) = key.open(Direction::ClientToServer, frame)?;
    let inner = InnerMessage::decode(&plaintext)?;

    let payload: Bytes = if inner.body.len() >= 4
        && u32::from_le_bytes(inner.body[..4].try_into()?) == InitConnection::CONSTRUCTOR
    {
        InitConnection::from_bytes(&inner.body)?.query.into()
    } else {
        inner.body.clone()
    };
    state.requests.lock().unwrap().push(payload.clone());

    let req_msg_id = header.message_id;
    let command = String::from_utf8_lossy(&payload).to_string();
    let result = |text: &str| {
        ServerMessage::Result(RpcResult {
            req_msg_id,
            payload: text.as_bytes().to_vec(),
        })
    };
    let error = |code: i32, message: String| {
        ServerMessage::Error(RpcErrorReply {
            req_msg_id,
            code,
            message,
        })
    };

    let replies: Vec<ServerMessage> = if let Some(text) = command.strip_prefix("echo:") {
        vec![result(text)]
    } else if let Some(target) = command.strip_prefix("migrate:") {
        if target == dc.0.to_string() {
            vec![result(&format!("here:{}", target))]
        } else {
            vec![error(303, format!("USER_MIGRATE_{}", target))]
        }
    } else if let Some(target) = command.strip_prefix("moved:") {
        vec![error(303, format!("USER_MIGRATE_{}", target))]
    } else if let Some(text) = command.strip_prefix("push:") {
        vec![
            ServerMessage::Updates(Updates {
                payload: text.as_bytes().to_vec(),
            }),
            result("pushed"),
        ]
    } else if command == "batch" {
        vec![ServerMessage::Container(MsgContainer {
            messages: vec![
                ContainedMessage {
                    msg_id: 1,
                    seqno: 1,
                    body: Updates {
                        payload: b"u1".to_vec(),
                    }
                    .to_bytes()
                    .to_vec(),
                },
                ContainedMessage {
                    msg_id: 2,
                    seqno: 3,
                    body: result("batched").to_bytes().to_vec(),
                },
            ],
        })]
    } else if command == "fail" {
        vec![error(400, "BAD_REQUEST".to_string())]
    } else if command == "revoke" {
        state.keys.remove(&key_id);
        vec![error(401, "AUTH_KEY_UNREGISTERED".to_string())]
    } else if command == "salt" {
        if inner.server_salt == ROTATED_SALT {
            vec![result("salted")]
        } else {
            vec![ServerMessage::BadServerSalt(BadServerSalt {
                bad_msg_id: req_msg_id,
                bad_msg_seqno: header.seq,
                error_code: 48,
                new_server_salt: ROTATED_SALT,
            })]
        }
    } else if command == "drop-once" {
        if !state.dropped_once.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        vec![result("survived")]
    } else if command == "vanish" {
        state.vanish.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        return Ok(false);
    } else if command == "garble" {
        let stranger = AuthKey::from_bytes(dc, &random_array::<256>()).ok_or_else(|| anyhow::anyhow!("key"))?;
        let id = state.next_message_id.fetch_add(4, Ordering::SeqCst);
        let reply = InnerMessage {
            server_salt: inner.server_salt,
            session_id: inner.session_id,
            body: result("never").to_bytes(),
        };
        let frame = stranger.seal(Direction::ServerToClient, id, 1, &reply.encode())?;
        write_frame(stream, &frame).await?;
        return Ok(true);
    } else {
        Vec::new()
    };

    for message in replies {
        let id = state.next_message_id.fetch_add(4, Ordering::SeqCst);
        let reply = InnerMessage {
            server_salt: inner.server_salt,
            session_id: inner.session_id,
            body: message.to_bytes(),
        };
        let frame = key.seal(Direction::ServerToClient, id, 1, &reply.encode())?;
        write_frame(stream, &frame).await?;
    }
    Ok(true)
}
