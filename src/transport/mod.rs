//! Encrypted Transport
//!
//! Single responsibility: get request bytes to a data center and route what
//! comes back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Transport                         │
//! │  send(dc, payload) ─► ensure_authenticated ─► connection │
//! │                       (one handshake per dc)   (per dc)  │
//! └──────────────────────────────────────────────────────────┘
//!        │ envelopes                      ▲ events
//!        ▼                                │
//!   receive loop (one per connection) ────┘
//!     ├── rpc_result / rpc_error ─► RpcCorrelator
//!     ├── updates ────────────────► Notifier
//!     └── redirect, bad salt, EOF ─► supervisor (resend / reconnect)
//! ```
//!
//! The receive loop never awaits anything but the socket. Work that needs
//! to wait (reconnecting, re-sending to another data center) is handed to
//! the supervisor task over a channel.

mod connection;
mod dispatch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::authorizer::{Authorization, Authorizer};
use crate::config::SessionConfig;
use crate::correlator::{Outcome, PendingRequest, ReplyHandle, RpcCorrelator};
use crate::error::{AuthError, RpcError, TransportError};
use crate::keystore::KeyStore;
use crate::notify::Notifier;
use crate::session::SessionStore;
use crate::types::DcId;

use connection::{Connection, Delivery};

type SharedHandshake = Shared<BoxFuture<'static, Result<(), AuthError>>>;

/// Work the receive loops hand to the supervisor.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// A connection died; its pending requests need a new one.
    ConnectionLost { dc: DcId, connection_id: u64 },
    /// Send a taken request again, to `dc`.
    Resend { request: PendingRequest, dc: DcId },
}

pub struct Transport {
    config: Arc<SessionConfig>,
    sessions: Arc<SessionStore>,
    correlator: Arc<RpcCorrelator>,
    notifier: Arc<Notifier>,
    authorizer: Arc<Authorizer>,
    keystore: Arc<dyn KeyStore>,
    connections: DashMap<DcId, Arc<Connection>>,
    connecting: DashMap<DcId, Arc<tokio::sync::Mutex<()>>>,
    handshakes: DashMap<DcId, SharedHandshake>,
    events: mpsc::UnboundedSender<TransportEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    next_connection_id: AtomicU64,
}

impl Transport {
    /// Build the transport and start its supervisor. Requires a Tokio runtime.
    pub fn spawn(
        config: Arc<SessionConfig>,
        sessions: Arc<SessionStore>,
        correlator: Arc<RpcCorrelator>,
        notifier: Arc<Notifier>,
        authorizer: Arc<Authorizer>,
        keystore: Arc<dyn KeyStore>,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            config,
            sessions,
            correlator,
            notifier,
            authorizer,
            keystore,
            connections: DashMap::new(),
            connecting: DashMap::new(),
            handshakes: DashMap::new(),
            events,
            supervisor: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
        });

        let handle = tokio::spawn(Arc::clone(&transport).supervise(rx));
        match transport.supervisor.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        transport
    }

    /// Send `payload` to `dc` and register it with the correlator.
    ///
    /// Waits for the data center's handshake and connection first.
    pub async fn send(self: &Arc<Self>, dc: DcId, payload: Bytes, deadline: Instant) -> Result<ReplyHandle, TransportError> {
        let conn = self.connection(dc).await?;

        let mut handle = None;
        let (_, delivery) = conn
            .transmit(&self.sessions, &self.config.app, &payload, |request_id| {
                handle = Some(self.correlator.register(request_id, dc, payload.clone(), deadline));
            })
            .await?;
        if delivery == Delivery::WriteFailed {
            self.connection_lost(dc, conn.id());
        }
        handle.ok_or(TransportError::NotAuthenticated(dc))
    }

    /// Make sure `dc` has an auth key, running (or joining) its handshake.
    pub async fn ensure_authenticated(self: &Arc<Self>, dc: DcId) -> Result<(), TransportError> {
        let handshake = match self.handshakes.entry(dc) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                if self.sessions.is_authenticated(dc) {
                    return Ok(());
                }
                entry.insert(self.start_handshake(dc)).clone()
            }
        };

        debug!(dc = %dc, "Waiting for handshake");
        handshake.await.map_err(|e| {
            warn!(dc = %dc, error = %e, "Queued send failed, handshake did not complete");
            TransportError::NotAuthenticated(dc)
        })
    }

    /// Run one handshake as its own task so it completes even if every
    /// waiter gives up.
    fn start_handshake(self: &Arc<Self>, dc: DcId) -> SharedHandshake {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let candidates = this.sessions.available_endpoints(dc);
            info!(dc = %dc, candidates = candidates.len(), "Starting handshake");
            let result = this.authorizer.authorize(dc, &candidates).await;
            if let Ok(authorization) = &result {
                this.install_authorization(dc, authorization);
            }
            this.handshakes.remove(&dc);
            result.map(|_| ())
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(AuthError::Io(format!("handshake task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    fn install_authorization(&self, dc: DcId, authorization: &Authorization) {
        self.sessions.update_endpoints(std::slice::from_ref(&authorization.endpoint));
        self.sessions.put_auth_key(authorization.auth_key.clone());
        self.sessions.set_server_salt(dc, authorization.server_salt);
        self.sessions.set_time_offset(dc, authorization.time_offset);

        if let Err(e) = self.keystore.save_key(dc, authorization.auth_key.as_bytes()) {
            warn!(dc = %dc, error = %e, "Failed to persist auth key");
        }

        // Anything still in flight on a socket bound to the old key moves over
        if let Some(old) = self.connections.get(&dc).map(|c| c.id()) {
            self.connection_lost(dc, old);
        }
    }

    /// Current connection to `dc`, connecting if needed.
    async fn connection(self: &Arc<Self>, dc: DcId) -> Result<Arc<Connection>, TransportError> {
        self.ensure_authenticated(dc).await?;
        if let Some(conn) = self.current_connection(dc) {
            return Ok(conn);
        }

        let gate = self.connecting.entry(dc).or_default().clone();
        let _guard = gate.lock().await;
        if let Some(conn) = self.current_connection(dc) {
            return Ok(conn);
        }

        let conn = self.connect(dc).await?;
        self.connections.insert(dc, Arc::clone(&conn));
        Ok(conn)
    }

    /// Existing connection, if it still matches the current auth key.
    fn current_connection(&self, dc: DcId) -> Option<Arc<Connection>> {
        let conn = self.connections.get(&dc)?.clone();
        (Some(conn.auth_key_id()) == self.sessions.auth_key_id(dc)).then_some(conn)
    }

    async fn connect(self: &Arc<Self>, dc: DcId) -> Result<Arc<Connection>, TransportError> {
        let auth_key = self
            .sessions
            .get_auth_key(dc)
            .ok_or(TransportError::NotAuthenticated(dc))?;

        // Endpoints that completed this key's handshake first
        let mut endpoints = self.sessions.available_endpoints(dc);
        endpoints.sort_by_key(|e| e.auth_key_id() != Some(auth_key.id()));

        for endpoint in endpoints {
            let stream = match timeout(self.config.connect_timeout(), TcpStream::connect(endpoint.address())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(dc = %dc, endpoint = %endpoint, error = %e, "Connect failed");
                    continue;
                }
                Err(_) => {
                    warn!(dc = %dc, endpoint = %endpoint, "Connect timed out");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(Connection::new(id, dc, endpoint.clone(), Arc::clone(&auth_key), writer));
            let loop_task = tokio::spawn(dispatch::receive_loop(
                Arc::clone(self),
                dc,
                id,
                Arc::clone(&auth_key),
                reader,
            ));
            conn.attach_reader(loop_task);

            info!(dc = %dc, endpoint = %conn.endpoint(), connection = id, "Connected");
            return Ok(conn);
        }

        Err(TransportError::ConnectionLost(dc))
    }

    fn connection_lost(&self, dc: DcId, connection_id: u64) {
        let _ = self.events.send(TransportEvent::ConnectionLost { dc, connection_id });
    }

    fn resend_later(&self, request: PendingRequest, dc: DcId) {
        // Only fails after shutdown
        if let Err(mpsc::error::SendError(TransportEvent::Resend { request, .. })) =
            self.events.send(TransportEvent::Resend { request, dc })
        {
            request.complete(Outcome::Error(RpcError::Transport(TransportError::ConnectionLost(dc))));
        }
    }

    /// Drop the connection to `dc`, if any. Pending requests on it are
    /// resent over a new one.
    pub fn drop_connection(&self, dc: DcId) {
        if let Some(id) = self.connections.get(&dc).map(|c| c.id()) {
            self.connection_lost(dc, id);
        }
    }

    pub fn is_connected(&self, dc: DcId) -> bool {
        self.connections.contains_key(&dc)
    }

    /// Stop every task and fail whatever is still pending.
    pub fn shutdown(&self) {
        let supervisor = match self.supervisor.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = supervisor {
            handle.abort();
        }
        self.connections.clear();
        let failed = self.correlator.fail_all(Outcome::Error(RpcError::Cancelled));
        if failed > 0 {
            info!(failed = failed, "Transport shut down with pending requests");
        }
    }

    // ── Supervisor ─────────────────────────────────────────────

    async fn supervise(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        debug!("Transport supervisor started");
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::ConnectionLost { dc, connection_id } => {
                    tokio::spawn(Arc::clone(&self).recover(dc, connection_id));
                }
                TransportEvent::Resend { request, dc } => {
                    tokio::spawn(Arc::clone(&self).resend(request, dc));
                }
            }
        }
        debug!("Transport supervisor stopped");
    }

    /// Reconnect after a lost connection and move its pending requests over.
    ///
    /// The requests stay registered while reconnecting, so the sweeper and
    /// `cancel` still reach them. Only the ones still waiting once a
    /// connection is back are re-sent.
    async fn recover(self: Arc<Self>, dc: DcId, connection_id: u64) {
        if self
            .connections
            .remove_if(&dc, |_, conn| conn.id() == connection_id)
            .is_none()
        {
            // Already replaced or recovered
            return;
        }
        info!(dc = %dc, connection = connection_id, "Connection lost");

        let stranded = self.correlator.ids_for_dc(dc);
        let mut delay = self.config.reconnect_base_delay();
        for attempt in 1..=self.config.reconnect_max_attempts {
            if !stranded.iter().any(|id| self.correlator.contains(*id)) {
                // Nothing waiting; the next send reconnects on demand
                debug!(dc = %dc, "No requests left to recover");
                return;
            }
            match self.connection(dc).await {
                Ok(_) => {
                    let pending: Vec<PendingRequest> =
                        stranded.iter().filter_map(|id| self.correlator.take(*id)).collect();
                    info!(dc = %dc, attempt = attempt, requests = pending.len(), "Reconnected");
                    for mut request in pending {
                        if request.resends() >= 1 {
                            request.complete(Outcome::Error(RpcError::Transport(TransportError::ConnectionLost(dc))));
                            continue;
                        }
                        request.record_resend();
                        tokio::spawn(Arc::clone(&self).resend(request, dc));
                    }
                    return;
                }
                Err(e) => {
                    warn!(dc = %dc, attempt = attempt, error = %e, delay_ms = delay.as_millis() as u64, "Reconnect failed");
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }

        let failed: Vec<PendingRequest> = stranded.iter().filter_map(|id| self.correlator.take(*id)).collect();
        error!(dc = %dc, requests = failed.len(), "Giving up on reconnection");
        for request in failed {
            request.complete(Outcome::Error(RpcError::Transport(TransportError::ConnectionLost(dc))));
        }
    }

    /// Send a taken request again, keeping its handle and deadline.
    async fn resend(self: Arc<Self>, request: PendingRequest, dc: DcId) {
        if !request.is_awaited() {
            debug!(call_id = request.call_id(), "Caller gone, not resending");
            return;
        }
        let deadline = request.deadline();
        let payload = request.payload().clone();

        let conn = match timeout_at(deadline, self.connection(dc)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                request.complete(Outcome::Error(RpcError::Transport(e)));
                return;
            }
            Err(_) => {
                request.complete(Outcome::Timeout);
                return;
            }
        };

        if !request.is_awaited() {
            debug!(call_id = request.call_id(), dc = %dc, "Cancelled while waiting for a connection");
            return;
        }

        let mut slot = Some(request);
        let result = conn
            .transmit(&self.sessions, &self.config.app, &payload, |request_id| {
                if let Some(request) = slot.take() {
                    self.correlator.reregister(request, request_id, dc);
                }
            })
            .await;

        match result {
            Ok((_, Delivery::WriteFailed)) => self.connection_lost(dc, conn.id()),
            Ok(_) => {}
            Err(e) => {
                if let Some(request) = slot.take() {
                    request.complete(Outcome::Error(RpcError::Transport(e)));
                }
            }
        }
    }
}
