//! Link layer - inbound buffering, protocol routing and response correlation.
//!
//! One physical byte stream is time-multiplexed between the AT text protocol
//! and binary OBEX frames:
//! - [`LinkBuffer`] accumulates inbound bytes and lets handlers peek
//! - [`Dispatcher`] owns the link [`Mode`] and routes units to handlers
//! - [`ResponseSlot`] correlates one outstanding request with its response
//! - [`read_loop`] feeds the dispatcher from the inbound half of the link

mod buffer;
mod dispatcher;
mod exchange;
mod reader;

use std::fmt;

pub use buffer::LinkBuffer;
pub use dispatcher::{Consumed, Dispatcher, DrainReport, HandlerId, ProtocolHandler};
pub use exchange::{Delivery, PendingExchange, ResponseSlot};
pub use reader::read_loop;

/// Which protocol currently owns the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Text AT commands and unsolicited result codes.
    At,
    /// Transparent mode carrying OBEX frames.
    Obex,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::At => f.write_str("AT"),
            Mode::Obex => f.write_str("OBEX"),
        }
    }
}
