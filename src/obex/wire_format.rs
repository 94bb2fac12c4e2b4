//! OBEX wire constants: request opcodes, response codes and header ids.
//!
//! Every frame starts with a 3-byte prefix:
//!
//! ```text
//! ┌──────────┬──────────────┐
//! │ Code     │ Length       │
//! │ 1 byte   │ u16 BE       │
//! └──────────┴──────────────┘
//! ```
//!
//! CONNECT frames (and responses to CONNECT) follow it with version, flags
//! and maximum packet length; SETPATH requests follow it with flags and a
//! reserved byte. Headers come after that.

use std::fmt;

use crate::error::{ModemError, Result};

/// Size of the code + length prefix.
pub const PREFIX_SIZE: usize = 3;

/// Extra bytes after the prefix in CONNECT requests and responses.
pub const CONNECT_PREAMBLE_SIZE: usize = 4;

/// Extra bytes after the prefix in SETPATH requests.
pub const SETPATH_PREAMBLE_SIZE: usize = 2;

/// OBEX protocol version sent on CONNECT (1.3).
pub const OBEX_VERSION: u8 = 0x13;

/// Final bit carried by every response code and by final requests.
pub const FINAL_BIT: u8 = 0x80;

/// Largest frame the 16-bit length field can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Connect = 0x80,
    Disconnect = 0x81,
    Put = 0x02,
    PutFinal = 0x82,
    Get = 0x03,
    GetFinal = 0x83,
    SetPath = 0x85,
    Session = 0x87,
    Abort = 0xFF,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x80 => Opcode::Connect,
            0x81 => Opcode::Disconnect,
            0x02 => Opcode::Put,
            0x82 => Opcode::PutFinal,
            0x03 => Opcode::Get,
            0x83 => Opcode::GetFinal,
            0x85 => Opcode::SetPath,
            0x87 => Opcode::Session,
            0xFF => Opcode::Abort,
            other => {
                return Err(ModemError::InvalidFrame(format!(
                    "unknown request opcode 0x{:02X}",
                    other
                )))
            }
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether the frame carries the CONNECT preamble.
    #[inline]
    pub fn has_connect_preamble(self) -> bool {
        self == Opcode::Connect
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Connect => "CONNECT",
            Opcode::Disconnect => "DISCONNECT",
            Opcode::Put => "PUT",
            Opcode::PutFinal => "PUT-FINAL",
            Opcode::Get => "GET",
            Opcode::GetFinal => "GET-FINAL",
            Opcode::SetPath => "SETPATH",
            Opcode::Session => "SESSION",
            Opcode::Abort => "ABORT",
        };
        f.write_str(name)
    }
}

/// Response codes. Decoding tolerates a missing final bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Continue = 0x90,
    Success = 0xA0,
    Created = 0xA1,
    Accepted = 0xA2,
    NonAuthoritative = 0xA3,
    NoContent = 0xA4,
    ResetContent = 0xA5,
    PartialContent = 0xA6,
    MultipleChoices = 0xB0,
    MovedPermanently = 0xB1,
    MovedTemporarily = 0xB2,
    SeeOther = 0xB3,
    NotModified = 0xB4,
    UseProxy = 0xB5,
    BadRequest = 0xC0,
    Unauthorized = 0xC1,
    PaymentRequired = 0xC2,
    Forbidden = 0xC3,
    NotFound = 0xC4,
    MethodNotAllowed = 0xC5,
    NotAcceptable = 0xC6,
    ProxyAuthRequired = 0xC7,
    RequestTimeout = 0xC8,
    Conflict = 0xC9,
    Gone = 0xCA,
    LengthRequired = 0xCB,
    PreconditionFailed = 0xCC,
    EntityTooLarge = 0xCD,
    UriTooLarge = 0xCE,
    UnsupportedMediaType = 0xCF,
    InternalServerError = 0xD0,
    NotImplemented = 0xD1,
    BadGateway = 0xD2,
    ServiceUnavailable = 0xD3,
    GatewayTimeout = 0xD4,
    VersionNotSupported = 0xD5,
    DatabaseFull = 0xE0,
    DatabaseLocked = 0xE1,
}

impl ResponseCode {
    pub fn from_byte(byte: u8) -> Result<Self> {
        use ResponseCode::*;
        Ok(match byte | FINAL_BIT {
            0x90 => Continue,
            0xA0 => Success,
            0xA1 => Created,
            0xA2 => Accepted,
            0xA3 => NonAuthoritative,
            0xA4 => NoContent,
            0xA5 => ResetContent,
            0xA6 => PartialContent,
            0xB0 => MultipleChoices,
            0xB1 => MovedPermanently,
            0xB2 => MovedTemporarily,
            0xB3 => SeeOther,
            0xB4 => NotModified,
            0xB5 => UseProxy,
            0xC0 => BadRequest,
            0xC1 => Unauthorized,
            0xC2 => PaymentRequired,
            0xC3 => Forbidden,
            0xC4 => NotFound,
            0xC5 => MethodNotAllowed,
            0xC6 => NotAcceptable,
            0xC7 => ProxyAuthRequired,
            0xC8 => RequestTimeout,
            0xC9 => Conflict,
            0xCA => Gone,
            0xCB => LengthRequired,
            0xCC => PreconditionFailed,
            0xCD => EntityTooLarge,
            0xCE => UriTooLarge,
            0xCF => UnsupportedMediaType,
            0xD0 => InternalServerError,
            0xD1 => NotImplemented,
            0xD2 => BadGateway,
            0xD3 => ServiceUnavailable,
            0xD4 => GatewayTimeout,
            0xD5 => VersionNotSupported,
            0xE0 => DatabaseFull,
            0xE1 => DatabaseLocked,
            other => {
                return Err(ModemError::InvalidFrame(format!(
                    "unknown response code 0x{:02X}",
                    other
                )))
            }
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// 2xx-class responses.
    pub fn is_success(self) -> bool {
        (0xA0..=0xAF).contains(&self.as_byte())
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.as_byte())
    }
}

/// Header identifiers.
///
/// The two high bits of the id select the encoding:
/// `00` UTF-16BE text, `01` byte sequence, `10` one byte, `11` four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HeaderId {
    Count = 0xC0,
    Name = 0x01,
    Type = 0x42,
    Length = 0xC3,
    Time = 0x44,
    Description = 0x05,
    Target = 0x46,
    Http = 0x47,
    Body = 0x48,
    EndOfBody = 0x49,
    Who = 0x4A,
    ConnectionId = 0xCB,
    AppParameters = 0x4C,
    AuthChallenge = 0x4D,
    AuthResponse = 0x4E,
    CreatorId = 0xCF,
    WanUuid = 0x50,
    ObjectClass = 0x51,
    SessionParameters = 0x52,
    SessionSequenceNumber = 0x93,
}

/// Wire encoding class of a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    /// id + u16 length + UTF-16BE text.
    Unicode,
    /// id + u16 length + bytes.
    Bytes,
    /// id + one byte.
    U8,
    /// id + u32 BE.
    U32,
}

impl HeaderId {
    pub fn from_byte(byte: u8) -> Result<Self> {
        use HeaderId::*;
        Ok(match byte {
            0xC0 => Count,
            0x01 => Name,
            0x42 => Type,
            0xC3 => Length,
            0x44 => Time,
            0x05 => Description,
            0x46 => Target,
            0x47 => Http,
            0x48 => Body,
            0x49 => EndOfBody,
            0x4A => Who,
            0xCB => ConnectionId,
            0x4C => AppParameters,
            0x4D => AuthChallenge,
            0x4E => AuthResponse,
            0xCF => CreatorId,
            0x50 => WanUuid,
            0x51 => ObjectClass,
            0x52 => SessionParameters,
            0x93 => SessionSequenceNumber,
            other => {
                return Err(ModemError::InvalidFrame(format!(
                    "unknown header id 0x{:02X}",
                    other
                )))
            }
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn encoding(self) -> HeaderEncoding {
        match self.as_byte() >> 6 {
            0b00 => HeaderEncoding::Unicode,
            0b01 => HeaderEncoding::Bytes,
            0b10 => HeaderEncoding::U8,
            _ => HeaderEncoding::U32,
        }
    }
}

impl fmt::Display for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Check that the length field of `bytes` matches its actual length.
pub fn validate(bytes: &[u8]) -> bool {
    bytes.len() >= PREFIX_SIZE && usize::from(u16::from_be_bytes([bytes[1], bytes[2]])) == bytes.len()
}

/// Declared total length of the frame starting at `bytes`, if the prefix is complete.
pub fn declared_length(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < PREFIX_SIZE {
        return None;
    }
    Some(usize::from(u16::from_be_bytes([bytes[1], bytes[2]])))
}
