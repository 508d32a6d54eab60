//! Typed protocol objects.
//!
//! Each object is a 4-byte constructor followed by its fields. Both directions
//! are encodable and decodable so the same definitions serve the client and
//! test servers.

use bytes::Bytes;

use super::{Reader, Writer};
use crate::error::WireError;

/// A constructor-tagged object.
pub trait TlObject: Sized {
    const CONSTRUCTOR: u32;
    const NAME: &'static str;

    fn write_fields(&self, w: &mut Writer);

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Bytes {
        let mut w = Writer::new();
        w.u32(Self::CONSTRUCTOR);
        self.write_fields(&mut w);
        w.finish()
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.expect_constructor(Self::CONSTRUCTOR, Self::NAME)?;
        Self::read_fields(r)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        Self::read(&mut Reader::new(data))
    }
}

macro_rules! tl_object {
    (
        $(#[$meta:meta])*
        $name:ident = $ctor:literal {
            $($field:ident : $ty:ty => $write:ident / $read:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl TlObject for $name {
            const CONSTRUCTOR: u32 = $ctor;
            const NAME: &'static str = stringify!($name);

            fn write_fields(&self, _w: &mut Writer) {
                $(_w.$write(&self.$field);)*
            }

            fn read_fields(_r: &mut Reader<'_>) -> Result<Self, WireError> {
                Ok(Self {
                    $($field: _r.$read()?,)*
                })
            }
        }
    };
}

// Field adapters so the macro can pass every field by reference.
impl Writer {
    fn f_u32(&mut self, v: &u32) {
        self.u32(*v);
    }
    fn f_i32(&mut self, v: &i32) {
        self.i32(*v);
    }
    fn f_u64(&mut self, v: &u64) {
        self.u64(*v);
    }
    fn f_int128(&mut self, v: &[u8; 16]) {
        self.int128(v);
    }
    fn f_int256(&mut self, v: &[u8; 32]) {
        self.int256(v);
    }
    fn f_bytes(&mut self, v: &Vec<u8>) {
        self.bytes(v);
    }
    fn f_string(&mut self, v: &String) {
        self.string(v);
    }
    fn f_vector_u64(&mut self, v: &Vec<u64>) {
        self.vector_u64(v);
    }
}

// ── Handshake ────────────────────────────────────────────────

tl_object! {
    /// Opens a handshake.
    ReqPqMulti = 0xbe7e8ef1 {
        nonce: [u8; 16] => f_int128 / int128,
    }
}

tl_object! {
    /// Server challenge: a product of two primes and its key fingerprints.
    ResPq = 0x05162463 {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        pq: Vec<u8> => f_bytes / bytes,
        fingerprints: Vec<u64> => f_vector_u64 / vector_u64,
    }
}

tl_object! {
    /// Factorized challenge, RSA-encrypted to the server.
    PqInnerData = 0x83c95aec {
        pq: Vec<u8> => f_bytes / bytes,
        p: Vec<u8> => f_bytes / bytes,
        q: Vec<u8> => f_bytes / bytes,
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        new_nonce: [u8; 32] => f_int256 / int256,
    }
}

tl_object! {
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        p: Vec<u8> => f_bytes / bytes,
        q: Vec<u8> => f_bytes / bytes,
        fingerprint: u64 => f_u64 / u64,
        encrypted_data: Vec<u8> => f_bytes / bytes,
    }
}

tl_object! {
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        new_nonce_hash: [u8; 16] => f_int128 / int128,
    }
}

tl_object! {
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        encrypted_answer: Vec<u8> => f_bytes / bytes,
    }
}

/// Answer to [`ReqDhParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerDhParams {
    Ok(ServerDhParamsOk),
    Fail(ServerDhParamsFail),
}

impl ServerDhParams {
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        match r.peek_u32()? {
            ServerDhParamsOk::CONSTRUCTOR => ServerDhParamsOk::read(&mut r).map(Self::Ok),
            ServerDhParamsFail::CONSTRUCTOR => ServerDhParamsFail::read(&mut r).map(Self::Fail),
            found => Err(WireError::UnexpectedConstructor {
                found,
                expected: "ServerDhParams",
            }),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Ok(inner) => inner.to_bytes(),
            Self::Fail(inner) => inner.to_bytes(),
        }
    }
}

tl_object! {
    /// Decrypted content of [`ServerDhParamsOk::encrypted_answer`].
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        g: u32 => f_u32 / u32,
        dh_prime: Vec<u8> => f_bytes / bytes,
        g_a: Vec<u8> => f_bytes / bytes,
        server_time: i32 => f_i32 / i32,
    }
}

tl_object! {
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        retry_id: u64 => f_u64 / u64,
        g_b: Vec<u8> => f_bytes / bytes,
    }
}

tl_object! {
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16] => f_int128 / int128,
        server_nonce: [u8; 16] => f_int128 / int128,
        encrypted_data: Vec<u8> => f_bytes / bytes,
    }
}

/// Final handshake verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGenKind {
    Ok,
    Retry,
    Fail,
}

impl DhGenKind {
    const fn constructor(self) -> u32 {
        match self {
            Self::Ok => 0x3bcbf734,
            Self::Retry => 0x46dc1fb9,
            Self::Fail => 0xa69dae02,
        }
    }

    /// Marker byte mixed into the expected `new_nonce_hash`.
    pub const fn hash_marker(self) -> u8 {
        match self {
            Self::Ok => 1,
            Self::Retry => 2,
            Self::Fail => 3,
        }
    }
}

/// Answer to [`SetClientDhParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGenAnswer {
    pub kind: DhGenKind,
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub new_nonce_hash: [u8; 16],
}

impl DhGenAnswer {
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let found = r.u32()?;
        let kind = [DhGenKind::Ok, DhGenKind::Retry, DhGenKind::Fail]
            .into_iter()
            .find(|k| k.constructor() == found)
            .ok_or(WireError::UnexpectedConstructor {
                found,
                expected: "DhGenAnswer",
            })?;
        Ok(Self {
            kind,
            nonce: r.int128()?,
            server_nonce: r.int128()?,
            new_nonce_hash: r.int128()?,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut w = Writer::new();
        w.u32(self.kind.constructor())
            .int128(&self.nonce)
            .int128(&self.server_nonce)
            .int128(&self.new_nonce_hash);
        w.finish()
    }
}

// ── Session ──────────────────────────────────────────────────

tl_object! {
    /// Wraps the first query sent on a fresh connection.
    InitConnection = 0xc1cd5ea9 {
        api_id: i32 => f_i32 / i32,
        device_model: String => f_string / string,
        system_version: String => f_string / string,
        app_version: String => f_string / string,
        lang_code: String => f_string / string,
        query: Vec<u8> => f_bytes / bytes,
    }
}

tl_object! {
    /// Successful reply to the request with `req_msg_id`.
    RpcResult = 0xf35c6d01 {
        req_msg_id: u64 => f_u64 / u64,
        payload: Vec<u8> => f_bytes / bytes,
    }
}

tl_object! {
    /// Error reply to the request with `req_msg_id`.
    RpcErrorReply = 0x2144ca19 {
        req_msg_id: u64 => f_u64 / u64,
        code: i32 => f_i32 / i32,
        message: String => f_string / string,
    }
}

tl_object! {
    /// Unsolicited server push.
    Updates = 0x74ae4240 {
        payload: Vec<u8> => f_bytes / bytes,
    }
}

tl_object! {
    /// The salt on a message was stale; `new_server_salt` replaces it.
    BadServerSalt = 0xedab447b {
        bad_msg_id: u64 => f_u64 / u64,
        bad_msg_seqno: u32 => f_u32 / u32,
        error_code: i32 => f_i32 / i32,
        new_server_salt: u64 => f_u64 / u64,
    }
}

/// One entry of a [`MsgContainer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainedMessage {
    pub msg_id: u64,
    pub seqno: u32,
    pub body: Vec<u8>,
}

/// Several messages delivered in one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgContainer {
    pub messages: Vec<ContainedMessage>,
}

impl TlObject for MsgContainer {
    const CONSTRUCTOR: u32 = 0x73f1f8dc;
    const NAME: &'static str = "MsgContainer";

    fn write_fields(&self, w: &mut Writer) {
        w.u32(self.messages.len() as u32);
        for m in &self.messages {
            w.u64(m.msg_id).u32(m.seqno).bytes(&m.body);
        }
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = r.u32()? as usize;
        // Each entry takes at least 16 bytes
        if count > r.remaining() / 16 {
            return Err(WireError::InvalidLength(count));
        }
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            messages.push(ContainedMessage {
                msg_id: r.u64()?,
                seqno: r.u32()?,
                body: r.bytes()?,
            });
        }
        Ok(Self { messages })
    }
}

/// Any message a server may send inside an encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Result(RpcResult),
    Error(RpcErrorReply),
    Container(MsgContainer),
    Updates(Updates),
    BadServerSalt(BadServerSalt),
}

impl ServerMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        Ok(match r.peek_u32()? {
            RpcResult::CONSTRUCTOR => Self::Result(RpcResult::read(&mut r)?),
            RpcErrorReply::CONSTRUCTOR => Self::Error(RpcErrorReply::read(&mut r)?),
            MsgContainer::CONSTRUCTOR => Self::Container(MsgContainer::read(&mut r)?),
            Updates::CONSTRUCTOR => Self::Updates(Updates::read(&mut r)?),
            BadServerSalt::CONSTRUCTOR => Self::BadServerSalt(BadServerSalt::read(&mut r)?),
            found => {
                return Err(WireError::UnexpectedConstructor {
                    found,
                    expected: "ServerMessage",
                })
            }
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Result(m) => m.to_bytes(),
            Self::Error(m) => m.to_bytes(),
            Self::Container(m) => m.to_bytes(),
            Self::Updates(m) => m.to_bytes(),
            Self::BadServerSalt(m) => m.to_bytes(),
        }
    }
}
