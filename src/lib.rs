//! dc-session - Authenticated multi-data-center session layer
//!
//! Runs the key-exchange handshake against a data center, keeps per-DC
//! session state, and correlates encrypted RPC requests with their replies.
//!
//! ## Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `wire`        | Binary codec: primitives, frames, envelopes, messages   |
//! | `crypto`      | Auth keys, envelope encryption, handshake primitives    |
//! | `authorizer`  | PQ / Diffie-Hellman handshake                           |
//! | `session`     | Per-DC auth keys, endpoints, counters                   |
//! | `correlator`  | Pending requests and exactly-once outcomes              |
//! | `transport`   | Connections, receive loops, reconnection, redirects     |
//! | `client`      | Caller-facing `ApiClient`                               |
//!
//! ## Usage
//!
//! ```ignore
//! use dc_session::{ApiClient, Outcome, SessionConfig};
//!
//! let client = ApiClient::new(SessionConfig::load("session.toml")?)?;
//! if let Outcome::Success(reply) = client.call(request).await {
//!     // ...
//! }
//! ```

pub mod authorizer;
pub mod client;
pub mod config;
pub mod correlator;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod logging;
pub mod notify;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

pub use authorizer::{Authorization, Authorizer};
pub use client::ApiClient;
pub use config::{AppInfo, ServerKeyConfig, SessionConfig};
pub use correlator::{Outcome, PendingRequest, ReplyHandle, RpcCorrelator};
pub use crypto::AuthKey;
pub use error::{AuthError, ConfigError, RpcError, SessionError, TransportError, WireError};
pub use keystore::{KeyStore, MemoryKeyStore};
pub use session::{ProtocolState, SessionStore};
pub use types::{DcId, Endpoint, RequestId};
