//! OBEX frame model and codec.
//!
//! A frame is a code, an optional fixed preamble and an ordered set of
//! headers keyed by [`HeaderId`]. The total length is never stored: it is
//! computed on encode and checked against the byte count on decode.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::ObexHeader;
use super::wire_format::{
    validate, HeaderId, Opcode, ResponseCode, CONNECT_PREAMBLE_SIZE, MAX_FRAME_SIZE,
    OBEX_VERSION, PREFIX_SIZE, SETPATH_PREAMBLE_SIZE,
};
use crate::error::{ModemError, Result};

/// SETPATH flags used by the module's filesystem service.
pub mod set_path_flags {
    /// Create the folder if it does not exist.
    pub const CREATE: u8 = 0x00;
    /// Enter an existing folder.
    pub const NO_CREATE: u8 = 0x02;
    /// Move to the parent folder. Sent without a NAME header.
    pub const PARENT: u8 = 0x03;
}

/// First byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCode {
    Request(Opcode),
    Response(ResponseCode),
}

impl FrameCode {
    fn as_byte(self) -> u8 {
        match self {
            FrameCode::Request(op) => op.as_byte(),
            FrameCode::Response(code) => code.as_byte(),
        }
    }
}

/// Fixed fields between the length prefix and the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    None,
    Connect {
        version: u8,
        flags: u8,
        max_packet_length: u16,
    },
    SetPath {
        flags: u8,
        constants: u8,
    },
}

impl Preamble {
    fn len(&self) -> usize {
        match self {
            Preamble::None => 0,
            Preamble::Connect { .. } => CONNECT_PREAMBLE_SIZE,
            Preamble::SetPath { .. } => SETPATH_PREAMBLE_SIZE,
        }
    }
}

/// One OBEX request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObexFrame {
    code: FrameCode,
    preamble: Preamble,
    headers: Vec<ObexHeader>,
}

impl ObexFrame {
    /// Request with the preamble its opcode requires.
    pub fn request(op: Opcode) -> Self {
        let preamble = match op {
            Opcode::Connect => Preamble::Connect {
                version: OBEX_VERSION,
                flags: 0,
                max_packet_length: MAX_FRAME_SIZE as u16,
            },
            Opcode::SetPath => Preamble::SetPath {
                flags: set_path_flags::NO_CREATE,
                constants: 0,
            },
            _ => Preamble::None,
        };
        Self {
            code: FrameCode::Request(op),
            preamble,
            headers: Vec::new(),
        }
    }

    /// CONNECT request advertising `max_packet_length`.
    pub fn connect(max_packet_length: u16) -> Self {
        Self {
            code: FrameCode::Request(Opcode::Connect),
            preamble: Preamble::Connect {
                version: OBEX_VERSION,
                flags: 0,
                max_packet_length,
            },
            headers: Vec::new(),
        }
    }

    /// SETPATH request. `name` is omitted for [`set_path_flags::PARENT`].
    pub fn set_path(flags: u8, name: Option<&str>) -> Self {
        let mut frame = Self {
            code: FrameCode::Request(Opcode::SetPath),
            preamble: Preamble::SetPath {
                flags,
                constants: 0,
            },
            headers: Vec::new(),
        };
        if let Some(name) = name {
            frame.insert(ObexHeader::Name(name.to_string()));
        }
        frame
    }

    /// Response frame without preamble.
    pub fn response(code: ResponseCode) -> Self {
        Self {
            code: FrameCode::Response(code),
            preamble: Preamble::None,
            headers: Vec::new(),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_header(mut self, header: ObexHeader) -> Self {
        self.insert(header);
        self
    }

    /// Builder-style preamble override.
    pub fn with_preamble(mut self, preamble: Preamble) -> Self {
        self.preamble = preamble;
        self
    }

    /// Add a header, replacing any header with the same id in place.
    pub fn insert(&mut self, header: ObexHeader) {
        let id = header.id();
        match self.headers.iter_mut().find(|h| h.id() == id) {
            Some(existing) => *existing = header,
            None => self.headers.push(header),
        }
    }

    /// Add a header in front of all others, replacing any header with the same id.
    pub fn insert_first(&mut self, header: ObexHeader) {
        let id = header.id();
        self.headers.retain(|h| h.id() != id);
        self.headers.insert(0, header);
    }

    pub fn get(&self, id: HeaderId) -> Option<&ObexHeader> {
        self.headers.iter().find(|h| h.id() == id)
    }

    pub fn headers(&self) -> &[ObexHeader] {
        &self.headers
    }

    pub fn code(&self) -> FrameCode {
        self.code
    }

    pub fn preamble(&self) -> Preamble {
        self.preamble
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self.code {
            FrameCode::Request(op) => Some(op),
            FrameCode::Response(_) => None,
        }
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        match self.code {
            FrameCode::Response(code) => Some(code),
            FrameCode::Request(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self.get(HeaderId::Name) {
            Some(ObexHeader::Name(name)) => Some(name),
            _ => None,
        }
    }

    pub fn length(&self) -> Option<u32> {
        match self.get(HeaderId::Length) {
            Some(ObexHeader::Length(len)) => Some(*len),
            _ => None,
        }
    }

    pub fn connection_id(&self) -> Option<u32> {
        match self.get(HeaderId::ConnectionId) {
            Some(ObexHeader::ConnectionId(id)) => Some(*id),
            _ => None,
        }
    }

    /// BODY or END_OF_BODY payload, whichever the frame carries.
    pub fn body(&self) -> Option<&Bytes> {
        self.headers.iter().find_map(|h| match h {
            ObexHeader::Body(b) | ObexHeader::EndOfBody(b) => Some(b),
            _ => None,
        })
    }

    pub fn app_parameters(&self) -> Option<&Bytes> {
        match self.get(HeaderId::AppParameters) {
            Some(ObexHeader::AppParameters(b)) => Some(b),
            _ => None,
        }
    }

    /// Exact serialized size.
    pub fn total_length(&self) -> Result<usize> {
        let mut total = PREFIX_SIZE + self.preamble.len();
        for header in &self.headers {
            total += header.encoded_len()?;
        }
        Ok(total)
    }

    /// Serialize the frame. Fails if it does not fit the 16-bit length field.
    pub fn encode(&self) -> Result<Bytes> {
        let total = self.total_length()?;
        if total > MAX_FRAME_SIZE {
            return Err(ModemError::InvalidArgument(format!(
                "frame of {} bytes exceeds the OBEX maximum of {}",
                total, MAX_FRAME_SIZE
            )));
        }

        let mut out = BytesMut::with_capacity(total);
        out.put_u8(self.code.as_byte());
        out.put_u16(total as u16);
        match self.preamble {
            Preamble::None => {}
            Preamble::Connect {
                version,
                flags,
                max_packet_length,
            } => {
                out.put_u8(version);
                out.put_u8(flags);
                out.put_u16(max_packet_length);
            }
            Preamble::SetPath { flags, constants } => {
                out.put_u8(flags);
                out.put_u8(constants);
            }
        }
        for header in &self.headers {
            header.encode_into(&mut out)?;
        }

        debug_assert_eq!(out.len(), total);
        Ok(out.freeze())
    }

    /// Decode a request frame.
    pub fn decode_request(bytes: &[u8]) -> Result<Self> {
        check_length(bytes)?;
        let op = Opcode::from_byte(bytes[0])?;
        let (preamble, offset) = match op {
            Opcode::Connect => read_connect_preamble(bytes)?,
            Opcode::SetPath => {
                let fields = bytes
                    .get(PREFIX_SIZE..PREFIX_SIZE + SETPATH_PREAMBLE_SIZE)
                    .ok_or_else(|| short_preamble(op))?;
                (
                    Preamble::SetPath {
                        flags: fields[0],
                        constants: fields[1],
                    },
                    PREFIX_SIZE + SETPATH_PREAMBLE_SIZE,
                )
            }
            _ => (Preamble::None, PREFIX_SIZE),
        };

        Ok(Self {
            code: FrameCode::Request(op),
            preamble,
            headers: decode_headers(&bytes[offset..])?,
        })
    }

    /// Decode a response to `request`. Responses to CONNECT carry the
    /// CONNECT preamble.
    pub fn decode_response(bytes: &[u8], request: Opcode) -> Result<Self> {
        check_length(bytes)?;
        let code = ResponseCode::from_byte(bytes[0])?;
        let (preamble, offset) = if request.has_connect_preamble() {
            read_connect_preamble(bytes)?
        } else {
            (Preamble::None, PREFIX_SIZE)
        };

        Ok(Self {
            code: FrameCode::Response(code),
            preamble,
            headers: decode_headers(&bytes[offset..])?,
        })
    }
}

fn check_length(bytes: &[u8]) -> Result<()> {
    if validate(bytes) {
        return Ok(());
    }
    let declared = if bytes.len() >= PREFIX_SIZE {
        format!("{}", u16::from_be_bytes([bytes[1], bytes[2]]))
    } else {
        "no".to_string()
    };
    Err(ModemError::InvalidFrame(format!(
        "length field declares {} bytes, frame has {}",
        declared,
        bytes.len()
    )))
}

fn short_preamble(op: Opcode) -> ModemError {
    ModemError::InvalidFrame(format!("{} frame too short for its preamble", op))
}

fn read_connect_preamble(bytes: &[u8]) -> Result<(Preamble, usize)> {
    let fields = bytes
        .get(PREFIX_SIZE..PREFIX_SIZE + CONNECT_PREAMBLE_SIZE)
        .ok_or_else(|| short_preamble(Opcode::Connect))?;
    Ok((
        Preamble::Connect {
            version: fields[0],
            flags: fields[1],
            max_packet_length: u16::from_be_bytes([fields[2], fields[3]]),
        },
        PREFIX_SIZE + CONNECT_PREAMBLE_SIZE,
    ))
}

fn decode_headers(mut bytes: &[u8]) -> Result<Vec<ObexHeader>> {
    let mut headers: Vec<ObexHeader> = Vec::new();
    while !bytes.is_empty() {
        let (header, used) = ObexHeader::decode(bytes)?;
        let id = header.id();
        match headers.iter_mut().find(|h| h.id() == id) {
            Some(existing) => *existing = header,
            None => headers.push(header),
        }
        bytes = &bytes[used..];
    }
    Ok(headers)
}

/// Uppercase hex rendering for trace logs.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}
