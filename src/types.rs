//! Core identifiers shared across the session layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one data center (cluster/region) of the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DcId(pub u32);

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc{}", self.0)
    }
}

impl From<u32> for DcId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of one outgoing request on the wire.
///
/// This is the message id of the envelope that carried the request, so it is
/// unique per data center and strictly increasing.
pub type RequestId = u64;

/// One reachable node of a data center.
///
/// Immutable once constructed; callers only ever receive copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    dc: DcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_key_id: Option<u64>,
}

impl Endpoint {
    pub fn new(dc: DcId, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            dc,
            auth_key_id: None,
        }
    }

    /// Same endpoint, bound to a specific auth key id.
    pub fn with_auth_key_id(mut self, auth_key_id: u64) -> Self {
        self.auth_key_id = Some(auth_key_id);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    pub fn auth_key_id(&self) -> Option<u64> {
        self.auth_key_id
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.dc, self.host, self.port)
    }
}
