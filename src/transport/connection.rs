//! One live, encrypted connection to a data center.
//!
//! The write half is shared behind an async mutex; message ids are allocated
//! while that mutex is held so envelopes leave in id order. The read half is
//! owned by a spawned receive loop (see `dispatch`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AppInfo;
use crate::crypto::{AuthKey, Direction};
use crate::error::{TransportError, WireError};
use crate::session::SessionStore;
use crate::types::{DcId, Endpoint, RequestId};
use crate::wire::frame::{write_frame, MAX_FRAME_LEN};
use crate::wire::messages::{InitConnection, TlObject};
use crate::wire::InnerMessage;

pub(crate) struct Connection {
    id: u64,
    dc: DcId,
    endpoint: Endpoint,
    auth_key: Arc<AuthKey>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    initialized: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// What happened to the bytes after the request id was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Written,
    /// The id was allocated and registered, but the socket failed.
    WriteFailed,
}

impl Connection {
    pub(crate) fn new(id: u64, dc: DcId, endpoint: Endpoint, auth_key: Arc<AuthKey>, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            dc,
            endpoint,
            auth_key,
            writer: tokio::sync::Mutex::new(writer),
            initialized: AtomicBool::new(false),
            reader: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn auth_key_id(&self) -> u64 {
        self.auth_key.id()
    }

    pub(crate) fn attach_reader(&self, handle: JoinHandle<()>) {
        match self.reader.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    fn too_large(&self, len: usize) -> TransportError {
        warn!(dc = %self.dc, connection = self.id, len = len, "Request exceeds the frame limit");
        TransportError::Wire(WireError::FrameTooLarge(len))
    }

    /// Encrypt and write `payload` as one content message.
    ///
    /// `on_allocated` runs with the new request id after the envelope is
    /// sealed and before any byte is written, so a reply can never overtake
    /// its registration. Errors are only returned before that point.
    pub(crate) async fn transmit<F>(
        &self,
        sessions: &SessionStore,
        app: &AppInfo,
        payload: &Bytes,
        on_allocated: F,
    ) -> Result<(RequestId, Delivery), TransportError>
    where
        F: FnOnce(RequestId),
    {
        if InnerMessage::sealed_len(payload.len()) > MAX_FRAME_LEN {
            return Err(self.too_large(InnerMessage::sealed_len(payload.len())));
        }

        let mut writer = self.writer.lock().await;

        let first = !self.initialized.load(Ordering::Acquire);
        let body = if first {
            InitConnection {
                api_id: app.api_id,
                device_model: app.device_model.clone(),
                system_version: app.system_version.clone(),
                app_version: app.app_version.clone(),
                lang_code: app.lang_code.clone(),
                query: payload.to_vec(),
            }
            .to_bytes()
        } else {
            payload.clone()
        };
        // Nothing is allocated or registered for a frame that cannot be sent
        let sealed_len = InnerMessage::sealed_len(body.len());
        if sealed_len > MAX_FRAME_LEN {
            return Err(self.too_large(sealed_len));
        }

        let outgoing = sessions.prepare_outgoing(self.dc)?;
        if outgoing.auth_key.id() != self.auth_key.id() {
            // Key was replaced under us; this socket belongs to the old one
            return Err(TransportError::ConnectionLost(self.dc));
        }
        self.initialized.store(true, Ordering::Release);

        let inner = InnerMessage {
            server_salt: outgoing.server_salt,
            session_id: outgoing.session_id,
            body,
        };
        let frame = outgoing.auth_key.seal(
            Direction::ClientToServer,
            outgoing.message_id,
            outgoing.seq,
            &inner.encode(),
        )?;

        on_allocated(outgoing.message_id);

        match write_frame(&mut *writer, &frame).await {
            Ok(()) => {
                debug!(
                    dc = %self.dc,
                    request_id = outgoing.message_id,
                    seq = outgoing.seq,
                    init = first,
                    "Envelope sent"
                );
                Ok((outgoing.message_id, Delivery::Written))
            }
            Err(e) => {
                warn!(dc = %self.dc, connection = self.id, error = %e, "Write failed");
                Ok((outgoing.message_id, Delivery::WriteFailed))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let handle = match self.reader.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        debug!(dc = %self.dc, connection = self.id, "Connection dropped");
    }
}
