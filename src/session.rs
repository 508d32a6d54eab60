//! Per-Data-Center Session State
//!
//! Single responsibility: hold what we know about each data center.
//!
//! # Layout
//!
//! ```text
//! SessionStore
//!   ├── primary: DcId
//!   └── states: DcId → DcState
//!         ├── auth_key        (None until a handshake confirms one)
//!         ├── endpoints       (known nodes, never empty for the primary)
//!         ├── server_salt / session_id
//!         └── message ids + sequence counter
//! ```
//!
//! Each entry is locked independently; no operation holds more than one entry
//! at a time and none of them block on I/O.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::crypto::AuthKey;
use crate::error::{ConfigError, SessionError, TransportError};
use crate::types::{DcId, Endpoint};

/// Strictly increasing message ids derived from the corrected wall clock.
///
/// Ids are `(seconds << 32) | fraction`, with the two low bits cleared for
/// client-originated messages. If the clock stalls or jumps backwards the
/// previous id plus four is used instead.
#[derive(Debug, Clone, Default)]
pub struct MessageIdGenerator {
    last: u64,
    time_offset: i64,
}

impl MessageIdGenerator {
    pub fn new(time_offset: i64) -> Self {
        Self {
            last: 0,
            time_offset,
        }
    }

    pub fn set_time_offset(&mut self, offset_secs: i64) {
        self.time_offset = offset_secs;
    }

    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn next(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = (now.as_secs() as i64 + self.time_offset).max(0) as u64;
        let fraction = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
        let mut id = (secs << 32) | (fraction & !3);
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        id
    }
}

/// Seconds between the server clock and ours.
pub fn clock_offset(server_time: i32) -> i64 {
    let local = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    server_time as i64 - local
}

fn random_session_id() -> u64 {
    OsRng.next_u64()
}

/// Mutable protocol state of one data center.
#[derive(Debug)]
struct DcState {
    auth_key: Option<Arc<AuthKey>>,
    endpoints: Vec<Endpoint>,
    server_salt: u64,
    session_id: u64,
    content_messages: u32,
    ids: MessageIdGenerator,
}

impl DcState {
    fn new() -> Self {
        Self {
            auth_key: None,
            endpoints: Vec::new(),
            server_salt: 0,
            session_id: random_session_id(),
            content_messages: 0,
            ids: MessageIdGenerator::default(),
        }
    }

    fn add_endpoint(&mut self, endpoint: &Endpoint) -> bool {
        let known = self
            .endpoints
            .iter()
            .any(|e| e.host() == endpoint.host() && e.port() == endpoint.port());
        if !known {
            self.endpoints.push(endpoint.clone());
        }
        !known
    }

    fn clear_auth(&mut self) {
        self.auth_key = None;
        self.server_salt = 0;
        self.content_messages = 0;
        self.session_id = random_session_id();
    }

    fn next_seq(&mut self, content_related: bool) -> u32 {
        if content_related {
            let seq = self.content_messages.wrapping_mul(2).wrapping_add(1);
            self.content_messages = self.content_messages.wrapping_add(1);
            seq
        } else {
            self.content_messages.wrapping_mul(2)
        }
    }
}

/// Everything needed to seal one outgoing envelope, taken atomically.
#[derive(Debug, Clone)]
pub struct OutgoingContext {
    pub auth_key: Arc<AuthKey>,
    pub message_id: u64,
    pub seq: u32,
    pub server_salt: u64,
    pub session_id: u64,
}

/// Read-only snapshot of one data center's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolState {
    pub authenticated: bool,
    pub auth_key_id: Option<u64>,
    pub server_salt: u64,
    pub session_id: u64,
    pub time_offset: i64,
}

/// Arena of per-data-center state, indexed by [`DcId`].
#[derive(Debug)]
pub struct SessionStore {
    states: DashMap<DcId, DcState>,
    primary: AtomicU32,
}

impl SessionStore {
    /// Build from seed endpoints; the first one's data center becomes primary.
    pub fn new(seed: &[Endpoint]) -> Result<Self, ConfigError> {
        let first = seed
            .first()
            .ok_or_else(|| ConfigError::Invalid("at least one seed endpoint is required".into()))?;

        let store = Self {
            states: DashMap::new(),
            primary: AtomicU32::new(first.dc().0),
        };
        store.update_endpoints(seed);
        Ok(store)
    }

    pub fn get_auth_key(&self, dc: DcId) -> Option<Arc<AuthKey>> {
        self.states.get(&dc).and_then(|s| s.auth_key.clone())
    }

    /// Store a confirmed key; the data center becomes authenticated.
    ///
    /// A new key starts a new session: fresh session id and counters.
    pub fn put_auth_key(&self, key: AuthKey) {
        let dc = key.dc();
        let key_id = key.id();
        let mut state = self.states.entry(dc).or_insert_with(DcState::new);
        state.clear_auth();
        state.auth_key = Some(Arc::new(key));
        info!(dc = %dc, key_id = key_id, "Auth key stored");
    }

    pub fn is_authenticated(&self, dc: DcId) -> bool {
        self.states
            .get(&dc)
            .map(|s| s.auth_key.is_some())
            .unwrap_or(false)
    }

    /// Key id of the data center's current auth key.
    pub fn auth_key_id(&self, dc: DcId) -> Option<u64> {
        self.states
            .get(&dc)
            .and_then(|s| s.auth_key.as_ref().map(|k| k.id()))
    }

    /// Data center owning the given key id, if any.
    pub fn dc_for_key_id(&self, key_id: u64) -> Option<DcId> {
        self.states.iter().find_map(|entry| {
            entry
                .auth_key
                .as_ref()
                .filter(|k| k.id() == key_id)
                .map(|_| *entry.key())
        })
    }

    pub fn primary_dc(&self) -> DcId {
        DcId(self.primary.load(Ordering::Acquire))
    }

    /// Switch the primary data center. It must have at least one known endpoint.
    pub fn set_primary_dc(&self, dc: DcId) -> Result<(), SessionError> {
        let has_endpoints = self
            .states
            .get(&dc)
            .map(|s| !s.endpoints.is_empty())
            .unwrap_or(false);
        if !has_endpoints {
            return Err(SessionError::UnknownDc(dc));
        }
        let previous = self.primary.swap(dc.0, Ordering::AcqRel);
        if previous != dc.0 {
            info!(from = %DcId(previous), to = %dc, "Primary data center changed");
        }
        Ok(())
    }

    /// Snapshot of the known endpoints of `dc`.
    pub fn available_endpoints(&self, dc: DcId) -> Vec<Endpoint> {
        self.states
            .get(&dc)
            .map(|s| s.endpoints.clone())
            .unwrap_or_default()
    }

    /// Merge server-announced endpoints into the per-DC sets.
    pub fn update_endpoints(&self, endpoints: &[Endpoint]) {
        for endpoint in endpoints {
            let mut state = self.states.entry(endpoint.dc()).or_insert_with(DcState::new);
            if state.add_endpoint(endpoint) {
                debug!(endpoint = %endpoint, "Endpoint added");
            }
        }
    }

    /// Every data center with at least one known endpoint.
    pub fn known_dcs(&self) -> Vec<DcId> {
        let mut dcs: Vec<DcId> = self
            .states
            .iter()
            .filter(|e| !e.endpoints.is_empty())
            .map(|e| *e.key())
            .collect();
        dcs.sort();
        dcs
    }

    pub fn authenticated_dcs(&self) -> Vec<DcId> {
        let mut dcs: Vec<DcId> = self
            .states
            .iter()
            .filter(|e| e.auth_key.is_some())
            .map(|e| *e.key())
            .collect();
        dcs.sort();
        dcs
    }

    /// Forget the auth key of one data center. Endpoints are kept.
    pub fn reset(&self, dc: DcId) {
        if let Some(mut state) = self.states.get_mut(&dc) {
            state.clear_auth();
            info!(dc = %dc, "Session reset");
        }
    }

    /// Forget every auth key and start fresh sessions everywhere.
    pub fn reset_all(&self) {
        for mut state in self.states.iter_mut() {
            state.clear_auth();
        }
        info!("All sessions reset");
    }

    pub fn set_server_salt(&self, dc: DcId, salt: u64) {
        if let Some(mut state) = self.states.get_mut(&dc) {
            state.server_salt = salt;
        }
    }

    pub fn set_time_offset(&self, dc: DcId, offset_secs: i64) {
        if let Some(mut state) = self.states.get_mut(&dc) {
            state.ids.set_time_offset(offset_secs);
        }
    }

    pub fn next_message_id(&self, dc: DcId) -> Option<u64> {
        self.states.get_mut(&dc).map(|mut s| s.ids.next())
    }

    pub fn next_seq_no(&self, dc: DcId, content_related: bool) -> Option<u32> {
        self.states.get_mut(&dc).map(|mut s| s.next_seq(content_related))
    }

    pub fn protocol_state(&self, dc: DcId) -> Option<ProtocolState> {
        self.states.get(&dc).map(|s| ProtocolState {
            authenticated: s.auth_key.is_some(),
            auth_key_id: s.auth_key.as_ref().map(|k| k.id()),
            server_salt: s.server_salt,
            session_id: s.session_id,
            time_offset: s.ids.time_offset(),
        })
    }

    /// Allocate ids for one content-related message under a single lock.
    pub fn prepare_outgoing(&self, dc: DcId) -> Result<OutgoingContext, TransportError> {
        let mut state = self
            .states
            .get_mut(&dc)
            .ok_or(TransportError::UnknownDc(dc))?;
        let auth_key = state
            .auth_key
            .clone()
            .ok_or(TransportError::NotAuthenticated(dc))?;
        let message_id = state.ids.next();
        let seq = state.next_seq(true);
        Ok(OutgoingContext {
            auth_key,
            message_id,
            seq,
            server_salt: state.server_salt,
            session_id: state.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AUTH_KEY_LEN;

    fn store() -> SessionStore {
        SessionStore::new(&[
            Endpoint::new(DcId(2), "10.0.0.2", 443),
            Endpoint::new(DcId(4), "10.0.0.4", 443),
        ])
        .unwrap()
    }

    fn key(dc: u32, fill: u8) -> AuthKey {
        AuthKey::from_bytes(DcId(dc), &[fill; AUTH_KEY_LEN]).unwrap()
    }

    #[test]
    fn test_message_ids_strictly_increase() {
        let mut ids = MessageIdGenerator::default();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = ids.next();
            assert!(id > last);
            assert_eq!(id % 4, 0);
            last = id;
        }
    }

    #[test]
    fn test_message_ids_survive_clock_going_backwards() {
        let mut ids = MessageIdGenerator::new(0);
        let first = ids.next();
        ids.set_time_offset(-3600);
        let second = ids.next();
        assert_eq!(second, first + 4);
    }

    #[test]
    fn test_time_offset_shifts_seconds() {
        let mut ids = MessageIdGenerator::new(1_000);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let secs = ids.next() >> 32;
        assert!(secs >= now + 999 && secs <= now + 1_001);
    }

    #[test]
    fn test_primary_is_first_seed() {
        let store = store();
        assert_eq!(store.primary_dc(), DcId(2));
        assert_eq!(store.known_dcs(), vec![DcId(2), DcId(4)]);
    }

    #[test]
    fn test_empty_seed_is_rejected() {
        assert!(SessionStore::new(&[]).is_err());
    }

    #[test]
    fn test_set_primary_requires_endpoints() {
        let store = store();
        assert!(matches!(
            store.set_primary_dc(DcId(9)),
            Err(SessionError::UnknownDc(DcId(9)))
        ));
        store.set_primary_dc(DcId(4)).unwrap();
        assert_eq!(store.primary_dc(), DcId(4));
    }

    #[test]
    fn test_put_auth_key_authenticates() {
        let store = store();
        assert!(!store.is_authenticated(DcId(2)));
        assert!(matches!(
            store.prepare_outgoing(DcId(2)),
            Err(TransportError::NotAuthenticated(DcId(2)))
        ));

        let key = key(2, 7);
        let id = key.id();
        store.put_auth_key(key);
        assert!(store.is_authenticated(DcId(2)));
        assert_eq!(store.auth_key_id(DcId(2)), Some(id));
        assert_eq!(store.dc_for_key_id(id), Some(DcId(2)));
        assert_eq!(store.get_auth_key(DcId(2)).unwrap().as_bytes(), &[7u8; AUTH_KEY_LEN][..]);
        assert_eq!(store.authenticated_dcs(), vec![DcId(2)]);
    }

    #[test]
    fn test_reset_clears_only_one_dc() {
        let store = store();
        store.put_auth_key(key(2, 1));
        store.put_auth_key(key(4, 2));
        let before = store.protocol_state(DcId(2)).unwrap().session_id;

        store.reset(DcId(2));
        assert!(!store.is_authenticated(DcId(2)));
        assert!(store.is_authenticated(DcId(4)));
        assert_ne!(store.protocol_state(DcId(2)).unwrap().session_id, before);
        assert_eq!(store.available_endpoints(DcId(2)).len(), 1);

        store.reset_all();
        assert!(store.authenticated_dcs().is_empty());
    }

    #[test]
    fn test_outgoing_sequence_numbers() {
        let store = store();
        store.put_auth_key(key(2, 3));
        store.set_server_salt(DcId(2), 0xfeed);

        let a = store.prepare_outgoing(DcId(2)).unwrap();
        let b = store.prepare_outgoing(DcId(2)).unwrap();
        assert_eq!((a.seq, b.seq), (1, 3));
        assert!(b.message_id > a.message_id);
        assert_eq!(a.server_salt, 0xfeed);
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(store.next_seq_no(DcId(2), false), Some(4));
    }

    #[test]
    fn test_sequence_numbers_wrap_instead_of_overflowing() {
        let mut state = DcState::new();
        state.content_messages = u32::MAX;
        assert_eq!(state.next_seq(true), u32::MAX);
        assert_eq!(state.content_messages, 0);
        assert_eq!(state.next_seq(true), 1);
        assert_eq!(state.next_seq(false), 2);
    }

    #[test]
    fn test_update_endpoints_merges_without_duplicates() {
        let store = store();
        store.update_endpoints(&[
            Endpoint::new(DcId(2), "10.0.0.2", 443),
            Endpoint::new(DcId(2), "10.0.1.2", 443),
            Endpoint::new(DcId(5), "10.0.0.5", 80),
        ]);
        assert_eq!(store.available_endpoints(DcId(2)).len(), 2);
        assert_eq!(store.available_endpoints(DcId(5)).len(), 1);
        assert!(store.available_endpoints(DcId(7)).is_empty());
    }
}
