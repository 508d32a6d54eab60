//! API Client
//!
//! Single responsibility: the caller-facing surface of the session layer.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       ApiClient                        │
//! │  - call() / send() against the primary data center     │
//! │  - falls back to other authenticated data centers      │
//! │  - registers notification handlers                     │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!               ┌────────────┼────────────┐
//!               ▼            ▼            ▼
//!          Transport    RpcCorrelator  SessionStore
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let client = ApiClient::new(SessionConfig::load("session.toml")?)?;
//! client.on_update(|dc, payload| println!("update from {}: {} bytes", dc, payload.len()));
//!
//! match client.call(request_bytes).await {
//!     Outcome::Success(reply) => handle(reply),
//!     Outcome::Error(e) => warn!(error = %e, "call failed"),
//!     Outcome::Timeout => warn!("call timed out"),
//! }
//! ```
//!
//! Every call resolves exactly once, with a reply, an error, or a timeout
//! no later than the request deadline plus one sweep interval.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::authorizer::Authorizer;
use crate::config::SessionConfig;
use crate::correlator::{Outcome, ReplyHandle, RpcCorrelator};
use crate::crypto::AuthKey;
use crate::error::{RpcError, SessionError, TransportError};
use crate::keystore::{KeyStore, MemoryKeyStore};
use crate::notify::Notifier;
use crate::session::SessionStore;
use crate::transport::Transport;
use crate::types::{DcId, RequestId};

pub struct ApiClient {
    config: Arc<SessionConfig>,
    sessions: Arc<SessionStore>,
    correlator: Arc<RpcCorrelator>,
    notifier: Arc<Notifier>,
    keystore: Arc<dyn KeyStore>,
    transport: Arc<Transport>,
    sweeper: JoinHandle<()>,
}

impl ApiClient {
    /// Client with in-memory credential storage.
    ///
    /// Must be called from within a Tokio runtime. No connection is made
    /// until the first call.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_key_store(config, Arc::new(MemoryKeyStore::new()))
    }

    /// Client whose auth keys are loaded from and saved to `keystore`.
    pub fn with_key_store(config: SessionConfig, keystore: Arc<dyn KeyStore>) -> Result<Self, SessionError> {
        config.validate()?;
        let config = Arc::new(config);

        let sessions = Arc::new(SessionStore::new(&config.endpoints)?);
        for dc in sessions.known_dcs() {
            match keystore.load_key(dc) {
                Ok(Some(bytes)) => match AuthKey::from_bytes(dc, &bytes) {
                    Some(key) => sessions.put_auth_key(key),
                    None => warn!(dc = %dc, len = bytes.len(), "Ignoring stored auth key of wrong size"),
                },
                Ok(None) => {}
                Err(e) => warn!(dc = %dc, error = %e, "Failed to load stored auth key"),
            }
        }

        let authorizer = Arc::new(Authorizer::new(&config)?);
        let correlator = Arc::new(RpcCorrelator::new());
        let notifier = Arc::new(Notifier::new());
        let transport = Transport::spawn(
            Arc::clone(&config),
            Arc::clone(&sessions),
            Arc::clone(&correlator),
            Arc::clone(&notifier),
            authorizer,
            Arc::clone(&keystore),
        );
        let sweeper = spawn_sweeper(Arc::clone(&correlator), &config);

        info!(
            primary = %sessions.primary_dc(),
            known = sessions.known_dcs().len(),
            authenticated = sessions.authenticated_dcs().len(),
            "Client ready"
        );

        Ok(Self {
            config,
            sessions,
            correlator,
            notifier,
            keystore,
            transport,
            sweeper,
        })
    }

    /// Send a request and return a handle that resolves to its outcome.
    ///
    /// Waits for the primary data center's handshake if it has no key yet.
    /// If the primary cannot be reached, other authenticated data centers
    /// are tried in order.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<ReplyHandle, RpcError> {
        let payload = payload.into();
        let deadline = Instant::now() + self.config.request_timeout();
        let primary = self.sessions.primary_dc();

        let mut last_error = match self.send_to(primary, &payload, deadline).await? {
            Ok(handle) => return Ok(handle),
            Err(e) => e,
        };

        for dc in self.sessions.authenticated_dcs() {
            if dc == primary {
                continue;
            }
            info!(primary = %primary, fallback = %dc, error = %last_error, "Primary unavailable, falling back");
            last_error = match self.send_to(dc, &payload, deadline).await? {
                Ok(handle) => return Ok(handle),
                Err(e) => e,
            };
        }

        Err(RpcError::Transport(last_error))
    }

    /// Outer error ends the attempt; inner error means "try elsewhere".
    async fn send_to(
        &self,
        dc: DcId,
        payload: &Bytes,
        deadline: Instant,
    ) -> Result<Result<ReplyHandle, TransportError>, RpcError> {
        match timeout_at(deadline, self.transport.send(dc, payload.clone(), deadline)).await {
            Ok(Ok(handle)) => Ok(Ok(handle)),
            Ok(Err(e)) if is_unreachable(&e) => Ok(Err(e)),
            Ok(Err(e)) => Err(RpcError::Transport(e)),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Send a request and wait for its outcome.
    pub async fn call(&self, payload: impl Into<Bytes>) -> Outcome {
        match self.send(payload).await {
            Ok(handle) => handle.await,
            Err(RpcError::Timeout) => Outcome::Timeout,
            Err(e) => Outcome::Error(e),
        }
    }

    /// Cancel an outstanding call by the id from [`ReplyHandle::call_id`].
    pub fn cancel(&self, call_id: RequestId) -> bool {
        self.correlator.cancel(call_id)
    }

    pub fn on_update<F>(&self, handler: F)
    where
        F: Fn(DcId, Bytes) + Send + Sync + 'static,
    {
        self.notifier.set_on_update(Arc::new(handler));
    }

    pub fn on_auth_cancelled<F>(&self, handler: F)
    where
        F: Fn(DcId) + Send + Sync + 'static,
    {
        self.notifier.set_on_auth_cancelled(Arc::new(handler));
    }

    pub fn on_updates_invalidated<F>(&self, handler: F)
    where
        F: Fn(DcId) + Send + Sync + 'static,
    {
        self.notifier.set_on_updates_invalidated(Arc::new(handler));
    }

    /// Run the handshake for `dc` now instead of on first use.
    pub async fn authorize(&self, dc: DcId) -> Result<(), TransportError> {
        self.transport.ensure_authenticated(dc).await
    }

    /// Read access to the per-data-center state.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Forget the auth key of `dc`, in memory and in the key store.
    pub fn reset(&self, dc: DcId) {
        self.sessions.reset(dc);
        if let Err(e) = self.keystore.remove_key(dc) {
            warn!(dc = %dc, error = %e, "Failed to remove stored auth key");
        }
        self.transport.drop_connection(dc);
    }

    /// Forget every auth key.
    pub fn reset_all(&self) {
        for dc in self.sessions.known_dcs() {
            if let Err(e) = self.keystore.remove_key(dc) {
                warn!(dc = %dc, error = %e, "Failed to remove stored auth key");
            }
            self.transport.drop_connection(dc);
        }
        self.sessions.reset_all();
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_connected(&self, dc: DcId) -> bool {
        self.transport.is_connected(dc)
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.transport.shutdown();
        debug!("Client dropped");
    }
}

/// Failures after which another data center may still succeed.
fn is_unreachable(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::NotAuthenticated(_) | TransportError::ConnectionLost(_) | TransportError::Io(_)
    )
}

/// Periodic deadline sweep, independent of traffic.
fn spawn_sweeper(correlator: Arc<RpcCorrelator>, config: &SessionConfig) -> JoinHandle<()> {
    let period = config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = correlator.on_timeout_sweep(Instant::now());
            if expired > 0 {
                debug!(expired = expired, "Expired requests resolved");
            }
        }
    })
}
