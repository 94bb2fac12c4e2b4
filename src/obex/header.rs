//! OBEX headers as a sum type.
//!
//! Each variant has exactly one wire encoding, chosen by its [`HeaderId`]:
//! - text headers (NAME, DESCRIPTION): length-prefixed UTF-16BE
//! - TYPE: length-prefixed Latin-1
//! - TIME: length-prefixed Latin-1 `yyyyMMdd'T'HHmmss`
//! - byte sequence headers: length-prefixed raw bytes
//! - COUNT, LENGTH, CONNECTION_ID, CREATOR_ID: 4-byte big-endian integer
//! - SESSION_SEQUENCE_NUMBER: one byte
//!
//! Text is written without a terminator; a trailing NUL is tolerated on
//! decode.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;

use super::wire_format::{HeaderEncoding, HeaderId};
use crate::error::{ModemError, Result};

/// Format of TIME headers and folder-listing timestamps.
pub const TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// id + 2-byte length.
const VARIABLE_PREFIX: usize = 3;

/// A decoded OBEX header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObexHeader {
    Count(u32),
    Name(String),
    Type(String),
    Length(u32),
    Time(NaiveDateTime),
    Description(String),
    Target(Bytes),
    Http(Bytes),
    Body(Bytes),
    EndOfBody(Bytes),
    Who(Bytes),
    ConnectionId(u32),
    AppParameters(Bytes),
    AuthChallenge(Bytes),
    AuthResponse(Bytes),
    CreatorId(u32),
    WanUuid(Bytes),
    ObjectClass(Bytes),
    SessionParameters(Bytes),
    SessionSequenceNumber(u8),
}

/// Wire payload of a header, before the id/length prefix is added.
enum Payload<'a> {
    Seq(std::borrow::Cow<'a, [u8]>),
    U8(u8),
    U32(u32),
}

impl ObexHeader {
    pub fn id(&self) -> HeaderId {
        match self {
            ObexHeader::Count(_) => HeaderId::Count,
            ObexHeader::Name(_) => HeaderId::Name,
            ObexHeader::Type(_) => HeaderId::Type,
            ObexHeader::Length(_) => HeaderId::Length,
            ObexHeader::Time(_) => HeaderId::Time,
            ObexHeader::Description(_) => HeaderId::Description,
            ObexHeader::Target(_) => HeaderId::Target,
            ObexHeader::Http(_) => HeaderId::Http,
            ObexHeader::Body(_) => HeaderId::Body,
            ObexHeader::EndOfBody(_) => HeaderId::EndOfBody,
            ObexHeader::Who(_) => HeaderId::Who,
            ObexHeader::ConnectionId(_) => HeaderId::ConnectionId,
            ObexHeader::AppParameters(_) => HeaderId::AppParameters,
            ObexHeader::AuthChallenge(_) => HeaderId::AuthChallenge,
            ObexHeader::AuthResponse(_) => HeaderId::AuthResponse,
            ObexHeader::CreatorId(_) => HeaderId::CreatorId,
            ObexHeader::WanUuid(_) => HeaderId::WanUuid,
            ObexHeader::ObjectClass(_) => HeaderId::ObjectClass,
            ObexHeader::SessionParameters(_) => HeaderId::SessionParameters,
            ObexHeader::SessionSequenceNumber(_) => HeaderId::SessionSequenceNumber,
        }
    }

    fn payload(&self) -> Result<Payload<'_>> {
        use std::borrow::Cow;

        Ok(match self {
            ObexHeader::Count(v)
            | ObexHeader::Length(v)
            | ObexHeader::ConnectionId(v)
            | ObexHeader::CreatorId(v) => Payload::U32(*v),
            ObexHeader::SessionSequenceNumber(v) => Payload::U8(*v),
            ObexHeader::Name(text) | ObexHeader::Description(text) => {
                Payload::Seq(Cow::Owned(encode_utf16be(text)))
            }
            ObexHeader::Type(text) => Payload::Seq(Cow::Owned(encode_latin1(text)?)),
            ObexHeader::Time(time) => {
                Payload::Seq(Cow::Owned(time.format(TIME_FORMAT).to_string().into_bytes()))
            }
            ObexHeader::Target(b)
            | ObexHeader::Http(b)
            | ObexHeader::Body(b)
            | ObexHeader::EndOfBody(b)
            | ObexHeader::Who(b)
            | ObexHeader::AppParameters(b)
            | ObexHeader::AuthChallenge(b)
            | ObexHeader::AuthResponse(b)
            | ObexHeader::WanUuid(b)
            | ObexHeader::ObjectClass(b)
            | ObexHeader::SessionParameters(b) => Payload::Seq(Cow::Borrowed(&b[..])),
        })
    }

    /// Serialized size including the id byte.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(match self.payload()? {
            Payload::U8(_) => 2,
            Payload::U32(_) => 5,
            Payload::Seq(bytes) => VARIABLE_PREFIX + bytes.len(),
        })
    }

    /// Append the wire form of this header to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<()> {
        out.put_u8(self.id().as_byte());
        match self.payload()? {
            Payload::U8(v) => out.put_u8(v),
            Payload::U32(v) => out.put_u32(v),
            Payload::Seq(bytes) => {
                let total = VARIABLE_PREFIX + bytes.len();
                let total = u16::try_from(total).map_err(|_| {
                    ModemError::InvalidArgument(format!(
                        "{} header of {} bytes exceeds the 16-bit length field",
                        self.id(),
                        total
                    ))
                })?;
                out.put_u16(total);
                out.put_slice(&bytes);
            }
        }
        Ok(())
    }

    /// Decode the header at the start of `bytes`.
    ///
    /// Returns the header and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(ObexHeader, usize)> {
        let first = *bytes
            .first()
            .ok_or_else(|| ModemError::InvalidFrame("empty header".to_string()))?;
        let id = HeaderId::from_byte(first)?;

        match id.encoding() {
            HeaderEncoding::U8 => {
                let value = *bytes.get(1).ok_or_else(|| truncated(id))?;
                Ok((ObexHeader::SessionSequenceNumber(value), 2))
            }
            HeaderEncoding::U32 => {
                let raw: [u8; 4] = bytes
                    .get(1..5)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| truncated(id))?;
                let value = u32::from_be_bytes(raw);
                let header = match id {
                    HeaderId::Count => ObexHeader::Count(value),
                    HeaderId::Length => ObexHeader::Length(value),
                    HeaderId::ConnectionId => ObexHeader::ConnectionId(value),
                    _ => ObexHeader::CreatorId(value),
                };
                Ok((header, 5))
            }
            HeaderEncoding::Unicode | HeaderEncoding::Bytes => {
                if bytes.len() < VARIABLE_PREFIX {
                    return Err(truncated(id));
                }
                let total = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
                if total < VARIABLE_PREFIX || total > bytes.len() {
                    return Err(ModemError::InvalidFrame(format!(
                        "{} header declares {} bytes, {} available",
                        id,
                        total,
                        bytes.len()
                    )));
                }
                let payload = &bytes[VARIABLE_PREFIX..total];
                Ok((Self::from_sequence(id, payload)?, total))
            }
        }
    }

    fn from_sequence(id: HeaderId, payload: &[u8]) -> Result<ObexHeader> {
        let blob = || Bytes::copy_from_slice(payload);
        Ok(match id {
            HeaderId::Name => ObexHeader::Name(decode_utf16be(payload)?),
            HeaderId::Description => ObexHeader::Description(decode_utf16be(payload)?),
            HeaderId::Type => ObexHeader::Type(decode_latin1(strip_nul(payload))),
            HeaderId::Time => ObexHeader::Time(parse_time(&decode_latin1(strip_nul(payload)))?),
            HeaderId::Target => ObexHeader::Target(blob()),
            HeaderId::Http => ObexHeader::Http(blob()),
            HeaderId::Body => ObexHeader::Body(blob()),
            HeaderId::EndOfBody => ObexHeader::EndOfBody(blob()),
            HeaderId::Who => ObexHeader::Who(blob()),
            HeaderId::AppParameters => ObexHeader::AppParameters(blob()),
            HeaderId::AuthChallenge => ObexHeader::AuthChallenge(blob()),
            HeaderId::AuthResponse => ObexHeader::AuthResponse(blob()),
            HeaderId::WanUuid => ObexHeader::WanUuid(blob()),
            HeaderId::ObjectClass => ObexHeader::ObjectClass(blob()),
            HeaderId::SessionParameters => ObexHeader::SessionParameters(blob()),
            other => {
                return Err(ModemError::InvalidFrame(format!(
                    "{} is not a length-prefixed header",
                    other
                )))
            }
        })
    }
}

fn truncated(id: HeaderId) -> ModemError {
    ModemError::InvalidFrame(format!("truncated {} header", id))
}

fn strip_nul(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(&[0]).unwrap_or(bytes)
}

/// Encode text as UTF-16BE without terminator.
pub fn encode_utf16be(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

/// Decode UTF-16BE text, dropping a trailing NUL.
pub fn decode_utf16be(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(ModemError::InvalidFrame(format!(
            "odd UTF-16 payload length {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let units = units.strip_suffix(&[0]).unwrap_or(&units);
    String::from_utf16(units).map_err(|e| ModemError::InvalidFrame(format!("invalid UTF-16: {}", e)))
}

/// Encode text as Latin-1. Fails on characters outside U+0000..=U+00FF.
pub fn encode_latin1(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                ModemError::InvalidArgument(format!("'{}' cannot be encoded as Latin-1", c))
            })
        })
        .collect()
}

/// Decode Latin-1 bytes. Every byte maps to the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Parse an OBEX timestamp, accepting an optional UTC `Z` suffix.
pub fn parse_time(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();
    let text = text.strip_suffix('Z').unwrap_or(text);
    NaiveDateTime::parse_from_str(text, TIME_FORMAT)
        .map_err(|e| ModemError::InvalidFrame(format!("invalid timestamp '{}': {}", text, e)))
}
