//! AT command protocol.
//!
//! - [`grammar`] - classification of inbound text into replies and events
//! - [`AtEngine`] - command/response correlation, escape handling, listeners

mod engine;
pub mod grammar;

pub use engine::{AtEngine, AtEvent};
pub use grammar::{AtReply, Terminal};
