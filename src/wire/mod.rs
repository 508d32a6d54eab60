//! Wire Codec
//!
//! Single responsibility: encode and decode the binary layouts exchanged with
//! a data center. Pure and stateless; no knowledge of keys or connections.
//!
//! # Layouts
//!
//! All integers are little-endian.
//!
//! ## Plain frame (handshake, before an auth key exists)
//! ```text
//! ┌────────────────┬────────────────┬────────────┬──────────────┐
//! │ auth_key_id=0  │ message_id     │ length     │ body         │
//! │ 8 bytes        │ 8 bytes        │ 4 bytes    │ length bytes │
//! └────────────────┴────────────────┴────────────┴──────────────┘
//! ```
//!
//! ## Encrypted envelope
//! ```text
//! ┌─────────────┬────────────┬─────────┬──────────────┬────────────┬─────────┐
//! │ auth_key_id │ message_id │ seq     │ cipher_len   │ ciphertext │ MAC     │
//! │ 8 bytes     │ 8 bytes    │ 4 bytes │ 4 bytes      │ N bytes    │ 16 B    │
//! └─────────────┴────────────┴─────────┴──────────────┴────────────┴─────────┘
//! ```
//!
//! The first 24 bytes are the envelope header and are authenticated as
//! associated data. The ciphertext decrypts to an [`InnerMessage`].

pub mod frame;
pub mod messages;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Size of the plain frame header.
pub const PLAIN_HEADER_LEN: usize = 20;

/// Size of the encrypted envelope header.
pub const ENVELOPE_HEADER_LEN: usize = 24;

/// Size of the MAC trailer on every encrypted envelope.
pub const MAC_LEN: usize = 16;

/// Salt and session id in front of every [`InnerMessage`] body.
pub const INNER_HEADER_LEN: usize = 16;

/// Largest byte string the 3-byte length prefix can describe.
pub const MAX_BYTES_LEN: usize = (1 << 24) - 1;

/// Constructor of a boxed `Vector` of longs.
const VECTOR_CONSTRUCTOR: u32 = 0x1cb5c415;

// ── Primitive writer ─────────────────────────────────────────

/// Appends TL-style primitives to a growable buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn int128(&mut self, v: &[u8; 16]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn int256(&mut self, v: &[u8; 32]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Length-prefixed byte string, padded to a multiple of 4.
    ///
    /// Callers keep `v` within [`MAX_BYTES_LEN`]; longer input cannot be
    /// described by the prefix.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        debug_assert!(v.len() <= MAX_BYTES_LEN, "byte string of {} bytes", v.len());
        let header = if v.len() < 254 {
            self.buf.put_u8(v.len() as u8);
            1
        } else {
            self.buf.put_u8(0xfe);
            let len = (v.len() as u32).to_le_bytes();
            self.buf.put_slice(&len[..3]);
            4
        };
        self.buf.put_slice(v);
        let padding = (4 - (header + v.len()) % 4) % 4;
        self.buf.put_bytes(0, padding);
        self
    }

    pub fn string(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    pub fn vector_u64(&mut self, items: &[u64]) -> &mut Self {
        self.u32(VECTOR_CONSTRUCTOR);
        self.u32(items.len() as u32);
        for item in items {
            self.u64(*item);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// ── Primitive reader ─────────────────────────────────────────

/// Reads TL-style primitives from a borrowed buffer, never panicking on
/// truncated input.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.len() < needed {
            return Err(WireError::UnexpectedEof {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Next constructor, without consuming it.
    pub fn peek_u32(&self) -> Result<u32, WireError> {
        self.need(4)?;
        let mut peek = self.buf;
        Ok(peek.get_u32_le())
    }

    pub fn int128(&mut self) -> Result<[u8; 16], WireError> {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.raw(16)?);
        Ok(out)
    }

    pub fn int256(&mut self) -> Result<[u8; 32], WireError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.raw(32)?);
        Ok(out)
    }

    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let first = self.raw(1)?[0];
        let (header, len) = if first < 254 {
            (1, first as usize)
        } else if first == 0xfe {
            let b = self.raw(3)?;
            (4, u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize)
        } else {
            return Err(WireError::InvalidLength(first as usize));
        };
        let data = self.raw(len)?.to_vec();
        let padding = (4 - (header + len) % 4) % 4;
        self.raw(padding)?;
        Ok(data)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.bytes()?).map_err(|_| WireError::InvalidString)
    }

    pub fn vector_u64(&mut self) -> Result<Vec<u64>, WireError> {
        self.expect_constructor(VECTOR_CONSTRUCTOR, "Vector")?;
        let count = self.u32()? as usize;
        if count > self.remaining() / 8 {
            return Err(WireError::InvalidLength(count));
        }
        (0..count).map(|_| self.u64()).collect()
    }

    pub fn expect_constructor(&mut self, expected: u32, name: &'static str) -> Result<(), WireError> {
        let found = self.u32()?;
        if found != expected {
            return Err(WireError::UnexpectedConstructor {
                found,
                expected: name,
            });
        }
        Ok(())
    }
}

// ── Plain frames ─────────────────────────────────────────────

/// A decoded plain (unencrypted) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainMessage {
    pub message_id: u64,
    pub body: Bytes,
}

/// Encode a handshake body into a plain frame.
pub fn encode_plain(message_id: u64, body: &[u8]) -> Bytes {
    let mut w = Writer::with_capacity(PLAIN_HEADER_LEN + body.len());
    w.u64(0).u64(message_id).u32(body.len() as u32).raw(body);
    w.finish()
}

/// Decode a plain frame; the auth key id must be zero.
pub fn decode_plain(frame: &[u8]) -> Result<PlainMessage, WireError> {
    let mut r = Reader::new(frame);
    let auth_key_id = r.u64()?;
    if auth_key_id != 0 {
        return Err(WireError::UnexpectedConstructor {
            found: auth_key_id as u32,
            expected: "plain frame",
        });
    }
    let message_id = r.u64()?;
    let len = r.u32()? as usize;
    if len != r.remaining() {
        return Err(WireError::InvalidLength(len));
    }
    Ok(PlainMessage {
        message_id,
        body: Bytes::copy_from_slice(r.rest()),
    })
}

/// Auth key id of any frame; zero marks a plain frame.
pub fn peek_auth_key_id(frame: &[u8]) -> Result<u64, WireError> {
    Reader::new(frame).u64()
}

// ── Encrypted envelopes ──────────────────────────────────────

/// Cleartext header of an encrypted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub auth_key_id: u64,
    pub message_id: u64,
    pub seq: u32,
    /// Ciphertext length, excluding the MAC trailer
    pub len: u32,
}

impl EnvelopeHeader {
    pub fn to_bytes(&self) -> [u8; ENVELOPE_HEADER_LEN] {
        let mut out = [0u8; ENVELOPE_HEADER_LEN];
        out[..8].copy_from_slice(&self.auth_key_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.message_id.to_le_bytes());
        out[16..20].copy_from_slice(&self.seq.to_le_bytes());
        out[20..24].copy_from_slice(&self.len.to_le_bytes());
        out
    }
}

/// Borrowed view of a received envelope.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeRef<'a> {
    pub header: EnvelopeHeader,
    /// Ciphertext followed by the MAC trailer
    pub sealed: &'a [u8],
}

/// Assemble an envelope from its header and sealed (ciphertext + MAC) body.
pub fn encode_envelope(header: &EnvelopeHeader, sealed: &[u8]) -> Bytes {
    let mut w = Writer::with_capacity(ENVELOPE_HEADER_LEN + sealed.len());
    w.raw(&header.to_bytes()).raw(sealed);
    w.finish()
}

/// Split a received envelope into header and sealed body.
pub fn decode_envelope(frame: &[u8]) -> Result<EnvelopeRef<'_>, WireError> {
    let mut r = Reader::new(frame);
    let header = EnvelopeHeader {
        auth_key_id: r.u64()?,
        message_id: r.u64()?,
        seq: r.u32()?,
        len: r.u32()?,
    };
    let sealed = r.rest();
    if sealed.len() != header.len as usize + MAC_LEN {
        return Err(WireError::InvalidLength(sealed.len()));
    }
    Ok(EnvelopeRef { header, sealed })
}

/// Decrypted content of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMessage {
    pub server_salt: u64,
    pub session_id: u64,
    pub body: Bytes,
}

impl InnerMessage {
    /// Size of the sealed envelope carrying a body of `body_len` bytes.
    pub fn sealed_len(body_len: usize) -> usize {
        ENVELOPE_HEADER_LEN + INNER_HEADER_LEN + body_len + MAC_LEN
    }

    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(INNER_HEADER_LEN + self.body.len());
        w.u64(self.server_salt).u64(self.session_id).raw(&self.body);
        w.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        Ok(Self {
            server_salt: r.u64()?,
            session_id: r.u64()?,
            body: Bytes::copy_from_slice(r.rest()),
        })
    }
}
