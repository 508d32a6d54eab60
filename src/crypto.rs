//! Cryptographic primitives for the session layer.
//!
//! # Algorithms
//!
//! - **Hash**: SHA-256 for every derivation (key ids, fingerprints, nonce hashes)
//! - **Envelope encryption**: ChaCha20-Poly1305, keyed per direction from the
//!   auth key, with the envelope header as associated data
//! - **Handshake encryption**: raw RSA for the client's first secret, then a
//!   temporary ChaCha20-Poly1305 key derived from both nonces
//!
//! Secrets live in [`Zeroizing`] buffers and never appear in `Debug` output.

use std::fmt;

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{AuthError, TransportError, WireError};
use crate::types::DcId;
use crate::wire::{self, EnvelopeHeader, Writer};

// =============================================================================
// Constants
// =============================================================================

/// Auth key length (2048-bit DH shared secret)
pub const AUTH_KEY_LEN: usize = 256;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Smallest accepted RSA modulus
pub const MIN_RSA_MODULUS_BITS: u64 = 2048;

/// Size of the RSA plaintext block (hash + data + padding)
const RSA_BLOCK_LEN: usize = 255;

// =============================================================================
// Hashing
// =============================================================================

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(out)
}

/// Big-endian encoding of `value`, left-padded with zeros to `len` bytes.
pub fn to_be_padded(value: &BigUint, len: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= len {
        return raw;
    }
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

// =============================================================================
// Directions
// =============================================================================

/// Which side produced a ciphertext. Each direction uses its own key stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    const fn tag(self) -> u8 {
        match self {
            Self::ClientToServer => 0,
            Self::ServerToClient => 1,
        }
    }
}

// =============================================================================
// Auth key
// =============================================================================

/// Long-lived shared secret of one data center.
#[derive(Clone)]
pub struct AuthKey {
    dc: DcId,
    bytes: Zeroizing<[u8; AUTH_KEY_LEN]>,
    id: u64,
    aux_hash: u64,
}

impl AuthKey {
    /// Wrap raw key material. Returns `None` unless exactly [`AUTH_KEY_LEN`] bytes.
    pub fn from_bytes(dc: DcId, data: &[u8]) -> Option<Self> {
        if data.len() != AUTH_KEY_LEN {
            return None;
        }
        let mut bytes = Zeroizing::new([0u8; AUTH_KEY_LEN]);
        bytes.copy_from_slice(data);
        let digest = sha256(&[data]);
        Some(Self {
            dc,
            bytes,
            id: le_u64(&digest[24..32]),
            aux_hash: le_u64(&digest[..8]),
        })
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    /// Key id carried in every envelope header.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn aux_hash(&self) -> u64 {
        self.aux_hash
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    fn cipher(&self, direction: Direction) -> ChaCha20Poly1305 {
        let key = Zeroizing::new(sha256(&[&[direction.tag()], self.as_bytes()]));
        ChaCha20Poly1305::new(Key::from_slice(key.as_slice()))
    }

    /// Encrypt `plaintext` into a complete envelope.
    pub fn seal(
        &self,
        direction: Direction,
        message_id: u64,
        seq: u32,
        plaintext: &[u8],
    ) -> Result<Bytes, TransportError> {
        let header = EnvelopeHeader {
            auth_key_id: self.id,
            message_id,
            seq,
            len: u32::try_from(plaintext.len())
                .map_err(|_| WireError::FrameTooLarge(plaintext.len()))?,
        };
        let aad = header.to_bytes();
        let sealed = self
            .cipher(direction)
            .encrypt(
                Nonce::from_slice(&envelope_nonce(message_id, seq)),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| WireError::FrameTooLarge(plaintext.len()))?;
        Ok(wire::encode_envelope(&header, &sealed))
    }

    /// Authenticate and decrypt a complete envelope.
    pub fn open(
        &self,
        direction: Direction,
        frame: &[u8],
    ) -> Result<(EnvelopeHeader, Zeroizing<Vec<u8>>), TransportError> {
        let envelope = wire::decode_envelope(frame)?;
        let header = envelope.header;
        if header.auth_key_id != self.id {
            return Err(TransportError::DecryptionFailed(self.dc));
        }
        let aad = header.to_bytes();
        let plaintext = self
            .cipher(direction)
            .decrypt(
                Nonce::from_slice(&envelope_nonce(header.message_id, header.seq)),
                Payload {
                    msg: envelope.sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| TransportError::DecryptionFailed(self.dc))?;
        Ok((header, Zeroizing::new(plaintext)))
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKey")
            .field("dc", &self.dc)
            .field("id", &format_args!("{:#018x}", self.id))
            .finish_non_exhaustive()
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.dc == other.dc && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for AuthKey {}

fn envelope_nonce(message_id: u64, seq: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&message_id.to_le_bytes());
    nonce[8..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Expected `new_nonce_hash` of a `dh_gen_*` answer.
pub fn new_nonce_hash(new_nonce: &[u8; 32], marker: u8, aux_hash: u64) -> [u8; 16] {
    let digest = sha256(&[new_nonce, &[marker], &aux_hash.to_le_bytes()]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[16..]);
    out
}

/// Initial server salt agreed by the handshake.
pub fn initial_server_salt(new_nonce: &[u8; 32], server_nonce: &[u8; 16]) -> u64 {
    let mut salt = [0u8; 8];
    for (i, byte) in salt.iter_mut().enumerate() {
        *byte = new_nonce[i] ^ server_nonce[i];
    }
    u64::from_le_bytes(salt)
}

// =============================================================================
// Temporary handshake key
// =============================================================================

/// Symmetric key protecting the DH exchange, derived from both nonces.
pub struct TempKey {
    key: Zeroizing<[u8; 32]>,
    server_nonce: [u8; 16],
    new_nonce: Zeroizing<[u8; 32]>,
}

impl TempKey {
    pub fn derive(new_nonce: &[u8; 32], server_nonce: &[u8; 16]) -> Self {
        Self {
            key: Zeroizing::new(sha256(&[new_nonce, server_nonce])),
            server_nonce: *server_nonce,
            new_nonce: Zeroizing::new(*new_nonce),
        }
    }

    fn nonce(&self, direction: Direction, counter: u32) -> [u8; NONCE_LEN] {
        let digest = sha256(&[
            &self.server_nonce,
            self.new_nonce.as_slice(),
            &[direction.tag()],
            &counter.to_le_bytes(),
        ]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        nonce
    }

    pub fn encrypt(&self, direction: Direction, counter: u32, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()))
            .encrypt(Nonce::from_slice(&self.nonce(direction, counter)), plaintext)
            .map_err(|_| AuthError::InvalidDhParameters("payload too large to encrypt".into()))
    }

    pub fn decrypt(&self, direction: Direction, counter: u32, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()))
            .decrypt(Nonce::from_slice(&self.nonce(direction, counter)), ciphertext)
            .map_err(|_| AuthError::DecryptionFailed)
    }
}

// =============================================================================
// RSA
// =============================================================================

/// A server public key used to encrypt the first handshake secret.
#[derive(Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    n: BigUint,
    e: BigUint,
    fingerprint: u64,
}

impl RsaPublicKey {
    /// Build from a big-endian modulus. Returns `None` for moduli shorter
    /// than [`MIN_RSA_MODULUS_BITS`].
    pub fn from_be_bytes(modulus: &[u8], exponent: u32) -> Option<Self> {
        let n = BigUint::from_bytes_be(modulus);
        if n.bits() < MIN_RSA_MODULUS_BITS || exponent < 3 {
            return None;
        }
        let e = BigUint::from(exponent);

        let mut w = Writer::new();
        w.bytes(&n.to_bytes_be()).bytes(&e.to_bytes_be());
        let digest = sha256(&[&w.finish()]);

        Some(Self {
            n,
            e,
            fingerprint: le_u64(&digest[24..32]),
        })
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    fn modulus_len(&self) -> usize {
        ((self.n.bits() + 7) / 8) as usize
    }

    /// Encrypt `data` as `SHA-256(data) ‖ data ‖ random padding`.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        if data.len() > RSA_BLOCK_LEN - 32 {
            return Err(AuthError::InvalidDhParameters(format!(
                "{} bytes do not fit in one RSA block",
                data.len()
            )));
        }
        let mut block = Zeroizing::new(Vec::with_capacity(RSA_BLOCK_LEN));
        block.extend_from_slice(&sha256(&[data]));
        block.extend_from_slice(data);
        let mut padding = vec![0u8; RSA_BLOCK_LEN - block.len()];
        OsRng.fill_bytes(&mut padding);
        block.extend_from_slice(&padding);

        let m = BigUint::from_bytes_be(&block);
        let c = m.modpow(&self.e, &self.n);
        Ok(to_be_padded(&c, self.modulus_len()))
    }
}

impl fmt::Debug for RsaPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaPublicKey")
            .field("bits", &self.n.bits())
            .field("fingerprint", &format_args!("{:#018x}", self.fingerprint))
            .finish()
    }
}
