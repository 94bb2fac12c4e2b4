//! Link timing and transfer configuration.
//!
//! [`ModemConfig`] carries every timeout, retry budget and size limit used by
//! the AT engine and the OBEX session. Defaults match the module firmware;
//! values can be overridden through [`ModemBuilder`](crate::ModemBuilder) or
//! loaded from JSON.
//!
//! # Example
//!
//! ```ignore
//! use modemlink::ModemConfig;
//!
//! let config = ModemConfig::from_json_str(r#"{ "numeric_errors": true, "at_wait_ms": 500 }"#)?;
//! assert_eq!(config.at_wait().as_millis(), 500);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ModemError, Result};

/// Minimum gap between two AT commands.
pub const DEFAULT_COMMAND_SPACING: Duration = Duration::from_millis(100);

/// Length of one wait attempt for an AT response.
pub const DEFAULT_AT_WAIT: Duration = Duration::from_secs(2);

/// Wait attempts for ordinary AT commands.
pub const DEFAULT_AT_WAIT_ATTEMPTS: u32 = 3;

/// Wait attempts for dial commands (`ATD...`).
pub const DEFAULT_DIAL_WAIT_ATTEMPTS: u32 = 90;

/// Length of one wait attempt after sending the `+++` escape.
pub const DEFAULT_ESCAPE_WAIT: Duration = Duration::from_secs(2);

/// Escape sequence retries.
pub const DEFAULT_ESCAPE_ATTEMPTS: u32 = 5;

/// Length of one wait attempt for an OBEX response.
pub const DEFAULT_OBEX_WAIT: Duration = Duration::from_secs(2);

/// Wait attempts for OBEX responses.
pub const DEFAULT_OBEX_WAIT_ATTEMPTS: u32 = 3;

/// Length of one wait attempt for the delete-all operation.
pub const DEFAULT_DELETE_ALL_WAIT: Duration = Duration::from_secs(30);

/// How long an incomplete inbound unit may sit in the link buffer.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stall timeout while a dial echo is buffered.
pub const DEFAULT_DIAL_STALL_TIMEOUT: Duration = Duration::from_secs(150);

/// Body bytes per PUT frame.
pub const DEFAULT_PUT_CHUNK_SIZE: usize = 512;

/// Maximum OBEX packet length advertised on CONNECT.
pub const DEFAULT_MAX_PACKET_LENGTH: u16 = 0xFFFF;

/// Outbound writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Room left in a PUT frame for the preamble and the body header.
const PUT_FRAME_OVERHEAD: usize = 3 + 3 + 5;

/// Configuration for a modem link.
///
/// All durations are stored in milliseconds so the struct maps directly onto
/// a flat JSON object. Missing fields fall back to the defaults above.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModemConfig {
    /// Negotiate `AT+CMEE=1` (numeric codes) instead of `AT+CMEE=2` (text).
    pub numeric_errors: bool,
    pub command_spacing_ms: u64,
    pub at_wait_ms: u64,
    pub at_wait_attempts: u32,
    pub dial_wait_attempts: u32,
    pub escape_wait_ms: u64,
    pub escape_attempts: u32,
    pub obex_wait_ms: u64,
    pub obex_wait_attempts: u32,
    pub delete_all_wait_ms: u64,
    pub stall_timeout_ms: u64,
    pub dial_stall_timeout_ms: u64,
    pub put_chunk_size: usize,
    pub max_packet_length: u16,
    pub channel_capacity: usize,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            numeric_errors: false,
            command_spacing_ms: DEFAULT_COMMAND_SPACING.as_millis() as u64,
            at_wait_ms: DEFAULT_AT_WAIT.as_millis() as u64,
            at_wait_attempts: DEFAULT_AT_WAIT_ATTEMPTS,
            dial_wait_attempts: DEFAULT_DIAL_WAIT_ATTEMPTS,
            escape_wait_ms: DEFAULT_ESCAPE_WAIT.as_millis() as u64,
            escape_attempts: DEFAULT_ESCAPE_ATTEMPTS,
            obex_wait_ms: DEFAULT_OBEX_WAIT.as_millis() as u64,
            obex_wait_attempts: DEFAULT_OBEX_WAIT_ATTEMPTS,
            delete_all_wait_ms: DEFAULT_DELETE_ALL_WAIT.as_millis() as u64,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT.as_millis() as u64,
            dial_stall_timeout_ms: DEFAULT_DIAL_STALL_TIMEOUT.as_millis() as u64,
            put_chunk_size: DEFAULT_PUT_CHUNK_SIZE,
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ModemConfig {
    /// Parse a configuration from a JSON object.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values that would make the link unusable.
    pub fn validate(&self) -> Result<()> {
        let attempts = [
            ("at_wait_attempts", self.at_wait_attempts),
            ("dial_wait_attempts", self.dial_wait_attempts),
            ("escape_attempts", self.escape_attempts),
            ("obex_wait_attempts", self.obex_wait_attempts),
        ];
        if let Some((name, _)) = attempts.iter().find(|(_, n)| *n == 0) {
            return Err(ModemError::InvalidArgument(format!("{} must be at least 1", name)));
        }

        let max_chunk = usize::from(self.max_packet_length).saturating_sub(PUT_FRAME_OVERHEAD);
        if self.put_chunk_size == 0 || self.put_chunk_size > max_chunk {
            return Err(ModemError::InvalidArgument(format!(
                "put_chunk_size must be between 1 and {}",
                max_chunk
            )));
        }

        if self.channel_capacity == 0 {
            return Err(ModemError::InvalidArgument(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn command_spacing(&self) -> Duration {
        Duration::from_millis(self.command_spacing_ms)
    }

    pub fn at_wait(&self) -> Duration {
        Duration::from_millis(self.at_wait_ms)
    }

    pub fn escape_wait(&self) -> Duration {
        Duration::from_millis(self.escape_wait_ms)
    }

    pub fn obex_wait(&self) -> Duration {
        Duration::from_millis(self.obex_wait_ms)
    }

    pub fn delete_all_wait(&self) -> Duration {
        Duration::from_millis(self.delete_all_wait_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn dial_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_stall_timeout_ms)
    }
}
