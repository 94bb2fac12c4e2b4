//! OBEX codec and session.
//!
//! - [`wire_format`] - opcodes, response codes, header ids
//! - [`ObexHeader`] - header sum type with one encoding per id
//! - [`ObexFrame`] - frame model, encode/decode and length validation
//! - [`ObexSession`] - mode switching and request/response exchanges

mod frame;
mod handler;
mod header;
mod session;
pub mod wire_format;

pub(crate) use frame::hex;
pub use frame::{set_path_flags, FrameCode, ObexFrame, Preamble};
pub use handler::ObexHandler;
pub use header::{
    decode_latin1, decode_utf16be, encode_latin1, encode_utf16be, parse_time, ObexHeader,
    TIME_FORMAT,
};
pub use session::{ExchangeGuard, ObexSession, FILESYSTEM_TARGET};
pub use wire_format::{validate, HeaderId, Opcode, ResponseCode};
