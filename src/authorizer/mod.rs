//! Key-Exchange Handshake
//!
//! Single responsibility: turn a list of candidate endpoints into a confirmed
//! [`AuthKey`] for one data center.
//!
//! # Steps
//!
//! ```text
//!  client                                        server
//!    │ req_pq_multi(nonce) ───────────────────────► │
//!    │ ◄─────────────── res_pq(server_nonce, pq, fingerprints)
//!    │   factorize pq, pick a known RSA key          │
//!    │ req_DH_params(p, q, RSA(p_q_inner_data)) ───► │
//!    │ ◄────────────── server_DH_params_ok(temp-key encrypted inner data)
//!    │   validate dh_prime, g, g_a; pick b           │
//!    │ set_client_DH_params(temp-key encrypted g_b) ► │
//!    │ ◄──────────────────────── dh_gen_ok | dh_gen_retry | dh_gen_fail
//! ```
//!
//! Any mismatch aborts the whole attempt against that endpoint; the next
//! candidate starts from scratch.

pub mod dh;
pub mod pq;

use std::time::Duration;

use bytes::Bytes;
use dashmap::DashSet;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::crypto::{self, AuthKey, Direction, RsaPublicKey, TempKey};
use crate::error::{AuthError, ConfigError, WireError};
use crate::session::{clock_offset, MessageIdGenerator};
use crate::types::{DcId, Endpoint};
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::messages::{
    ClientDhInnerData, DhGenAnswer, DhGenKind, PqInnerData, ReqDhParams, ReqPqMulti, ResPq,
    ServerDhInnerData, ServerDhParams, SetClientDhParams, TlObject,
};
use crate::wire;

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub auth_key: AuthKey,
    pub server_salt: u64,
    /// Server clock minus local clock, in seconds
    pub time_offset: i64,
    /// The endpoint that completed the handshake, bound to the new key id
    pub endpoint: Endpoint,
}

/// Runs handshakes. Holds the recognised server keys and a cache of DH primes
/// that already passed validation.
#[derive(Debug)]
pub struct Authorizer {
    public_keys: Vec<RsaPublicKey>,
    connect_timeout: Duration,
    step_timeout: Duration,
    max_dh_retries: u32,
    primality_rounds: u32,
    verified_primes: DashSet<Vec<u8>>,
}

impl Authorizer {
    pub fn new(config: &SessionConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            public_keys: config.public_keys()?,
            connect_timeout: config.connect_timeout(),
            step_timeout: config.handshake_step_timeout(),
            max_dh_retries: config.max_dh_retries,
            primality_rounds: config.primality_rounds,
            verified_primes: DashSet::new(),
        })
    }

    /// Run the handshake against the first candidate that completes it.
    ///
    /// Unreachable endpoints and failed attempts fall through to the next
    /// candidate; the last failure is returned once the list is exhausted.
    pub async fn authorize(&self, dc: DcId, candidates: &[Endpoint]) -> Result<Authorization, AuthError> {
        if candidates.is_empty() {
            return Err(AuthError::NoEndpoints(dc));
        }

        let mut last_error = None;
        for endpoint in candidates {
            debug!(dc = %dc, endpoint = %endpoint, "Connecting for handshake");
            let stream = match timeout(self.connect_timeout, TcpStream::connect(endpoint.address())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(dc = %dc, endpoint = %endpoint, error = %e, "Endpoint unreachable");
                    continue;
                }
                Err(_) => {
                    warn!(dc = %dc, endpoint = %endpoint, "Connect timed out");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let mut handshake = Handshake {
                authorizer: self,
                dc,
                stream,
                ids: MessageIdGenerator::default(),
            };
            match handshake.run().await {
                Ok((auth_key, server_salt, time_offset)) => {
                    info!(
                        dc = %dc,
                        endpoint = %endpoint,
                        key_id = auth_key.id(),
                        time_offset = time_offset,
                        "Handshake complete"
                    );
                    return Ok(Authorization {
                        endpoint: endpoint.clone().with_auth_key_id(auth_key.id()),
                        auth_key,
                        server_salt,
                        time_offset,
                    });
                }
                Err(e) => {
                    warn!(dc = %dc, endpoint = %endpoint, error = %e, "Handshake failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(AuthError::UnreachableEndpoint {
            tried: candidates.len(),
        }))
    }

    fn find_key(&self, fingerprints: &[u64]) -> Option<&RsaPublicKey> {
        fingerprints
            .iter()
            .find_map(|fp| self.public_keys.iter().find(|k| k.fingerprint() == *fp))
    }

    async fn validate_group(&self, g: u32, p: &BigUint) -> Result<(), AuthError> {
        dh::check_generator(g, p)?;

        let encoded = p.to_bytes_be();
        if self.verified_primes.contains(&encoded) {
            return Ok(());
        }
        let candidate = p.clone();
        let rounds = self.primality_rounds;
        tokio::task::spawn_blocking(move || dh::check_safe_prime(&candidate, rounds))
            .await
            .map_err(|e| AuthError::Io(format!("prime check aborted: {}", e)))??;
        self.verified_primes.insert(encoded);
        Ok(())
    }
}

fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// One attempt against one connected endpoint.
struct Handshake<'a> {
    authorizer: &'a Authorizer,
    dc: DcId,
    stream: TcpStream,
    ids: MessageIdGenerator,
}

impl Handshake<'_> {
    /// Send one plain message and wait for the plain answer.
    async fn exchange(&mut self, step: &'static str, body: &[u8]) -> Result<Bytes, AuthError> {
        let frame = wire::encode_plain(self.ids.next(), body);
        let stream = &mut self.stream;
        let answer = timeout(self.authorizer.step_timeout, async move {
            write_frame(stream, &frame).await?;
            read_frame(stream).await
        })
        .await
        .map_err(|_| AuthError::HandshakeTimeout(step))?
        .map_err(|e| AuthError::Io(e.to_string()))?
        .ok_or_else(|| AuthError::Io(format!("connection closed during {}", step)))?;

        debug!(dc = %self.dc, step = step, len = answer.len(), "Handshake answer received");
        Ok(wire::decode_plain(&answer)?.body)
    }

    async fn run(&mut self) -> Result<(AuthKey, u64, i64), AuthError> {
        let authorizer = self.authorizer;

        // Step 1: nonce and server challenge
        let nonce: [u8; 16] = random_array();
        let answer = self.exchange("req_pq_multi", &ReqPqMulti { nonce }.to_bytes()).await?;
        let res_pq = ResPq::from_bytes(&answer)?;
        if res_pq.nonce != nonce {
            return Err(AuthError::NonceMismatch("res_pq"));
        }
        let server_nonce = res_pq.server_nonce;

        // Step 2: pick a server key we recognise
        let public_key = authorizer
            .find_key(&res_pq.fingerprints)
            .ok_or(AuthError::UnknownServerKey)?;

        // Step 3: split the challenge
        if res_pq.pq.len() > 8 {
            return Err(WireError::InvalidLength(res_pq.pq.len()).into());
        }
        let pq = res_pq.pq.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let (p, q) = pq::factorize(pq).ok_or(AuthError::FactorizationFailed(pq))?;
        debug!(dc = %self.dc, "Server challenge factorized");

        // Step 4: send our secret nonce, RSA-encrypted
        let new_nonce: [u8; 32] = random_array();
        let inner = PqInnerData {
            pq: res_pq.pq.clone(),
            p: minimal_be(p),
            q: minimal_be(q),
            nonce,
            server_nonce,
            new_nonce,
        };
        let request = ReqDhParams {
            nonce,
            server_nonce,
            p: minimal_be(p),
            q: minimal_be(q),
            fingerprint: public_key.fingerprint(),
            encrypted_data: public_key.encrypt(&inner.to_bytes())?,
        };
        let answer = self.exchange("req_DH_params", &request.to_bytes()).await?;

        // Step 5: validate the server's DH parameters
        let params = match ServerDhParams::from_bytes(&answer)? {
            ServerDhParams::Ok(ok) => ok,
            ServerDhParams::Fail(fail) => {
                if fail.nonce != nonce || fail.server_nonce != server_nonce {
                    return Err(AuthError::NonceMismatch("server_DH_params_fail"));
                }
                return Err(AuthError::Rejected("server_DH_params_fail"));
            }
        };
        if params.nonce != nonce || params.server_nonce != server_nonce {
            return Err(AuthError::NonceMismatch("server_DH_params_ok"));
        }

        let temp_key = TempKey::derive(&new_nonce, &server_nonce);
        let decrypted = temp_key.decrypt(Direction::ServerToClient, 0, &params.encrypted_answer)?;
        let server_dh = ServerDhInnerData::from_bytes(&decrypted)?;
        if server_dh.nonce != nonce || server_dh.server_nonce != server_nonce {
            return Err(AuthError::NonceMismatch("server_DH_inner_data"));
        }

        let dh_prime = BigUint::from_bytes_be(&server_dh.dh_prime);
        let g_a = BigUint::from_bytes_be(&server_dh.g_a);
        authorizer.validate_group(server_dh.g, &dh_prime).await?;
        dh::check_group_element(&g_a, &dh_prime, "g_a")?;

        let time_offset = clock_offset(server_dh.server_time);
        self.ids.set_time_offset(time_offset);

        // Step 6: our half of the exchange, retried on dh_gen_retry
        let mut retry_id = 0u64;
        for attempt in 0..=authorizer.max_dh_retries {
            let (b, g_b) = loop {
                let b = dh::generate_secret(&dh_prime);
                let g_b = dh::public_value(server_dh.g, &b, &dh_prime);
                if dh::check_group_element(&g_b, &dh_prime, "g_b").is_ok() {
                    break (b, g_b);
                }
            };

            let client_dh = ClientDhInnerData {
                nonce,
                server_nonce,
                retry_id,
                g_b: g_b.to_bytes_be(),
            };
            let request = SetClientDhParams {
                nonce,
                server_nonce,
                encrypted_data: temp_key.encrypt(Direction::ClientToServer, attempt, &client_dh.to_bytes())?,
            };
            let answer = self.exchange("set_client_DH_params", &request.to_bytes()).await?;
            let verdict = DhGenAnswer::from_bytes(&answer)?;
            if verdict.nonce != nonce || verdict.server_nonce != server_nonce {
                return Err(AuthError::NonceMismatch("dh_gen"));
            }

            let shared = dh::shared_secret(&g_a, &b, &dh_prime);
            let auth_key = AuthKey::from_bytes(self.dc, &shared)
                .ok_or_else(|| AuthError::InvalidDhParameters("shared secret has the wrong size".into()))?;
            let expected = crypto::new_nonce_hash(&new_nonce, verdict.kind.hash_marker(), auth_key.aux_hash());
            if verdict.new_nonce_hash != expected {
                return Err(AuthError::NonceMismatch("new_nonce_hash"));
            }

            match verdict.kind {
                DhGenKind::Ok => {
                    let salt = crypto::initial_server_salt(&new_nonce, &server_nonce);
                    return Ok((auth_key, salt, time_offset));
                }
                DhGenKind::Retry => {
                    debug!(dc = %self.dc, attempt = attempt, "Server asked for a new DH secret");
                    retry_id = auth_key.aux_hash();
                }
                DhGenKind::Fail => return Err(AuthError::Rejected("dh_gen_fail")),
            }
        }

        Err(AuthError::Rejected("too many dh_gen_retry answers"))
    }
}

/// Big-endian bytes without leading zeros.
fn minimal_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}
