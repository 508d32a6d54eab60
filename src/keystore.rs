//! Credential persistence.
//!
//! The session layer only needs a tiny key-value contract to survive restarts:
//! raw auth key bytes per data center. Callers back it with whatever storage
//! they have; [`MemoryKeyStore`] is the default.

use std::io;

use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::types::DcId;

/// Injected storage for auth keys.
pub trait KeyStore: Send + Sync {
    fn load_key(&self, dc: DcId) -> io::Result<Option<Zeroizing<Vec<u8>>>>;

    fn save_key(&self, dc: DcId, key: &[u8]) -> io::Result<()>;

    fn remove_key(&self, dc: DcId) -> io::Result<()>;
}

/// Keys held in process memory only.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: DashMap<DcId, Zeroizing<Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_key(&self, dc: DcId) -> io::Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.keys.get(&dc).map(|k| k.clone()))
    }

    fn save_key(&self, dc: DcId, key: &[u8]) -> io::Result<()> {
        self.keys.insert(dc, Zeroizing::new(key.to_vec()));
        Ok(())
    }

    fn remove_key(&self, dc: DcId) -> io::Result<()> {
        self.keys.remove(&dc);
        Ok(())
    }
}
