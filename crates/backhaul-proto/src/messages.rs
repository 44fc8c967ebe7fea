//! Protocol message types

use bytes::Bytes;
use std::fmt;

/// Command byte carried by every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Handshake = 1,
    Request = 2,
    Response = 3,
    Ping = 4,
    ForceOff = 5,
    LocalConnected = 6,
    LocalDisconnect = 7,
    Transfer = 8,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Handshake),
            2 => Ok(Command::Request),
            3 => Ok(Command::Response),
            4 => Ok(Command::Ping),
            5 => Ok(Command::ForceOff),
            6 => Ok(Command::LocalConnected),
            7 => Ok(Command::LocalDisconnect),
            8 => Ok(Command::Transfer),
            other => Err(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Handshake => "HANDSHAKE",
            Command::Request => "REQUEST",
            Command::Response => "RESPONSE",
            Command::Ping => "PING",
            Command::ForceOff => "FORCE_OFF",
            Command::LocalConnected => "LOCAL_CONNECTED",
            Command::LocalDisconnect => "LOCAL_DISCONNECT",
            Command::Transfer => "TRANSFER",
        };
        f.write_str(name)
    }
}

/// Flags sent in the HANDSHAKE header byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeFlags(u8);

impl HandshakeFlags {
    pub const ENCRYPT: u8 = 0b0000_0001;
    pub const KEY_COMPRESSED: u8 = 0b0000_0010;
    pub const COMPRESS_PAYLOAD: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }

    pub fn with_key_compressed(mut self) -> Self {
        self.0 |= Self::KEY_COMPRESSED;
        self
    }

    pub fn with_compress_payload(mut self) -> Self {
        self.0 |= Self::COMPRESS_PAYLOAD;
        self
    }

    pub fn has_encrypt(&self) -> bool {
        self.0 & Self::ENCRYPT != 0
    }

    pub fn has_key_compressed(&self) -> bool {
        self.0 & Self::KEY_COMPRESSED != 0
    }

    pub fn has_compress_payload(&self) -> bool {
        self.0 & Self::COMPRESS_PAYLOAD != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Flags sent in the TRANSFER header byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFlags(u8);

impl TransferFlags {
    pub const COMPRESSED: u8 = 0b0000_0001;
    pub const ENCRYPTED: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_compressed(mut self) -> Self {
        self.0 |= Self::COMPRESSED;
        self
    }

    pub fn with_encrypted(mut self) -> Self {
        self.0 |= Self::ENCRYPTED;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// RESPONSE status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 0,
    Rejected = 1,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            ResponseStatus::Ok
        } else {
            ResponseStatus::Rejected
        }
    }
}

/// One protocol frame
///
/// Built per protocol event and serialized immediately by [`crate::FrameCodec`].
#[derive(Clone, PartialEq, Eq)]
pub struct ProtoMessage {
    pub command: Command,
    pub tunnel_id: i64,
    pub session_id: i64,
    pub header: Bytes,
    pub body: Bytes,
}

impl ProtoMessage {
    pub fn new(command: Command, tunnel_id: i64, session_id: i64) -> Self {
        Self {
            command,
            tunnel_id,
            session_id,
            header: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, header: impl Into<Bytes>) -> Self {
        self.header = header.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn handshake(flags: HandshakeFlags, public_key: impl Into<Bytes>) -> Self {
        Self::new(Command::Handshake, 0, 0)
            .with_header(vec![flags.as_u8()])
            .with_body(public_key)
    }

    pub fn request(body: impl Into<Bytes>) -> Self {
        Self::new(Command::Request, 0, 0).with_body(body)
    }

    pub fn response_ok(tunnel_id: i64, body: impl Into<Bytes>) -> Self {
        Self::new(Command::Response, tunnel_id, 0)
            .with_header(vec![ResponseStatus::Ok as u8])
            .with_body(body)
    }

    pub fn response_rejected(reason: &str) -> Self {
        Self::new(Command::Response, 0, 0)
            .with_header(vec![ResponseStatus::Rejected as u8])
            .with_body(reason.as_bytes().to_vec())
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping, 0, 0)
    }

    pub fn force_off(tunnel_id: i64) -> Self {
        Self::new(Command::ForceOff, tunnel_id, 0)
    }

    pub fn local_connected(tunnel_id: i64, session_id: i64) -> Self {
        Self::new(Command::LocalConnected, tunnel_id, session_id)
    }

    pub fn local_disconnect(tunnel_id: i64, session_id: i64) -> Self {
        Self::new(Command::LocalDisconnect, tunnel_id, session_id)
    }

    pub fn transfer(
        tunnel_id: i64,
        session_id: i64,
        flags: TransferFlags,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(Command::Transfer, tunnel_id, session_id)
            .with_header(vec![flags.as_u8()])
            .with_body(body)
    }

    /// Session-open marker: an empty TRANSFER without flags
    pub fn session_open(tunnel_id: i64, session_id: i64) -> Self {
        Self::new(Command::Transfer, tunnel_id, session_id)
    }

    /// First header byte, or 0 when the header is empty
    pub fn header_byte(&self) -> u8 {
        self.header.first().copied().unwrap_or(0)
    }

    pub fn handshake_flags(&self) -> HandshakeFlags {
        HandshakeFlags::from_u8(self.header_byte())
    }

    pub fn transfer_flags(&self) -> TransferFlags {
        TransferFlags::from_u8(self.header_byte())
    }

    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_u8(self.header_byte())
    }
}

// Bodies may be megabytes of application data; keep logs readable.
impl fmt::Debug for ProtoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtoMessage")
            .field("command", &self.command)
            .field("tunnel_id", &self.tunnel_id)
            .field("session_id", &self.session_id)
            .field("header_len", &self.header.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}
