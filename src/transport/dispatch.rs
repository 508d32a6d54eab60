//! Receive side of a connection.
//!
//! Frames are handled one at a time in arrival order, which is what gives
//! update handlers their per-connection ordering.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::correlator::Outcome;
use crate::crypto::{AuthKey, Direction};
use crate::error::{RpcError, TransportError};
use crate::types::DcId;
use crate::wire::frame::read_frame;
use crate::wire::messages::{BadServerSalt, RpcErrorReply, ServerMessage};
use crate::wire::{self, InnerMessage};

use super::Transport;

/// Error code the server uses to point a request at another data center.
pub(crate) const SEE_OTHER: i32 = 303;
/// Error code for a revoked authorization.
pub(crate) const UNAUTHORIZED: i32 = 401;

const MIGRATE_MARKER: &str = "_MIGRATE_";

/// Data center named by a redirect error, e.g. `USER_MIGRATE_4`.
pub(crate) fn moved_dc(code: i32, message: &str) -> Option<DcId> {
    if code != SEE_OTHER {
        return None;
    }
    let (_, dc) = message.rsplit_once(MIGRATE_MARKER)?;
    dc.parse::<u32>().ok().map(DcId)
}

pub(super) async fn receive_loop(
    transport: Arc<Transport>,
    dc: DcId,
    connection_id: u64,
    auth_key: Arc<AuthKey>,
    mut reader: OwnedReadHalf,
) {
    debug!(dc = %dc, connection = connection_id, "Receive loop started");
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let flow = transport.handle_frame(dc, connection_id, &auth_key, &frame);
                transport.correlator.on_timeout_sweep(Instant::now());
                if flow.is_break() {
                    return;
                }
            }
            Ok(None) => {
                info!(dc = %dc, connection = connection_id, "Server closed connection");
                break;
            }
            Err(e) => {
                warn!(dc = %dc, connection = connection_id, error = %e, "Receive failed");
                break;
            }
        }
    }
    transport.connection_lost(dc, connection_id);
}

impl Transport {
    fn handle_frame(&self, dc: DcId, connection_id: u64, auth_key: &Arc<AuthKey>, frame: &[u8]) -> ControlFlow<()> {
        let key_id = match wire::peek_auth_key_id(frame) {
            Ok(id) => id,
            Err(e) => {
                warn!(dc = %dc, error = %e, "Dropping malformed frame");
                return ControlFlow::Continue(());
            }
        };

        let key = if key_id == auth_key.id() {
            Some(Arc::clone(auth_key))
        } else {
            self.sessions
                .dc_for_key_id(key_id)
                .and_then(|owner| self.sessions.get_auth_key(owner))
        };
        let key = match key {
            Some(key) => key,
            None => {
                warn!(dc = %dc, key_id = key_id, "Frame for unknown auth key");
                self.invalidate(dc, connection_id);
                return ControlFlow::Break(());
            }
        };

        let plaintext = match key.open(Direction::ServerToClient, frame) {
            Ok((_, plaintext)) => plaintext,
            Err(e) => {
                warn!(dc = %key.dc(), error = %e, "Dropping undecryptable frame");
                self.invalidate(key.dc(), connection_id);
                return ControlFlow::Break(());
            }
        };

        let inner = match InnerMessage::decode(&plaintext) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(dc = %key.dc(), error = %e, "Dropping malformed envelope content");
                return ControlFlow::Continue(());
            }
        };

        let current_session = self.sessions.protocol_state(key.dc()).map(|s| s.session_id);
        if current_session != Some(inner.session_id) {
            debug!(dc = %key.dc(), session_id = inner.session_id, "Dropping message for a previous session");
            return ControlFlow::Continue(());
        }

        self.dispatch(key.dc(), &inner.body);
        ControlFlow::Continue(())
    }

    fn dispatch(&self, dc: DcId, body: &[u8]) {
        let message = match ServerMessage::from_bytes(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(dc = %dc, error = %e, "Dropping undecodable message");
                return;
            }
        };

        match message {
            ServerMessage::Result(result) => {
                self.correlator
                    .resolve(result.req_msg_id, Outcome::Success(result.payload.into()));
            }
            ServerMessage::Error(reply) => self.handle_rpc_error(dc, reply),
            ServerMessage::Container(container) => {
                for message in container.messages {
                    self.dispatch(dc, &message.body);
                }
            }
            ServerMessage::Updates(updates) => {
                self.notifier.update(dc, updates.payload.into());
            }
            ServerMessage::BadServerSalt(bad) => self.handle_bad_salt(dc, bad),
        }
    }

    fn handle_rpc_error(&self, dc: DcId, reply: RpcErrorReply) {
        if let Some(target) = moved_dc(reply.code, &reply.message) {
            self.redirect(dc, reply.req_msg_id, target);
            return;
        }

        if reply.code == UNAUTHORIZED {
            warn!(dc = %dc, message = %reply.message, "Authorization revoked by server");
            self.sessions.reset(dc);
            if let Err(e) = self.keystore.remove_key(dc) {
                warn!(dc = %dc, error = %e, "Failed to remove stored auth key");
            }
            self.notifier.auth_cancelled(dc);
        }

        self.correlator.resolve(
            reply.req_msg_id,
            Outcome::Error(RpcError::ServerError {
                code: reply.code,
                message: reply.message,
            }),
        );
    }

    fn redirect(&self, dc: DcId, request_id: u64, target: DcId) {
        let Some(mut request) = self.correlator.take(request_id) else {
            warn!(dc = %dc, request_id = request_id, "Redirect for unknown request");
            return;
        };

        if request.redirects() >= 1 {
            info!(call_id = request.call_id(), target = %target, "Second redirect, giving up");
            request.complete(Outcome::Error(RpcError::Moved(target)));
            return;
        }
        if let Err(e) = self.sessions.set_primary_dc(target) {
            warn!(target = %target, error = %e, "Redirect to unusable data center");
            request.complete(Outcome::Error(RpcError::Moved(target)));
            return;
        }

        info!(call_id = request.call_id(), from = %dc, to = %target, "Request redirected");
        request.record_redirect();
        self.resend_later(request, target);
    }

    fn handle_bad_salt(&self, dc: DcId, bad: BadServerSalt) {
        self.sessions.set_server_salt(dc, bad.new_server_salt);
        debug!(dc = %dc, request_id = bad.bad_msg_id, "Server salt rotated");

        let Some(mut request) = self.correlator.take(bad.bad_msg_id) else {
            return;
        };
        if request.salt_retries() >= 1 {
            request.complete(Outcome::Error(RpcError::ServerError {
                code: bad.error_code,
                message: "BAD_SERVER_SALT".to_string(),
            }));
            return;
        }
        request.record_salt_retry();
        self.resend_later(request, dc);
    }

    /// The data center's session can no longer be trusted: drop it and
    /// everything waiting on it.
    fn invalidate(&self, dc: DcId, connection_id: u64) {
        warn!(dc = %dc, "Session invalidated");
        self.sessions.reset(dc);
        self.connections.remove_if(&dc, |_, conn| conn.id() == connection_id);
        for request in self.correlator.take_for_dc(dc) {
            request.complete(Outcome::Error(RpcError::Transport(TransportError::DecryptionFailed(dc))));
        }
        self.notifier.updates_invalidated(dc);
    }
}
