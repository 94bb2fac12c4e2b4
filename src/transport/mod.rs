//! Transport helpers.
//!
//! The engine runs over any `AsyncRead + AsyncWrite` stream. This module
//! only provides a way to reach a module behind a serial bridge:
//! - TCP (`ser2net`, `socat TCP-LISTEN`)
//! - Unix Domain Sockets (`socat UNIX-LISTEN`)

mod bridge;

pub use bridge::{connect_bridge, BridgeStream};
