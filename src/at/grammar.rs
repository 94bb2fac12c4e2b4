//! Classification of inbound AT text into replies and unsolicited events.
//!
//! The grammar is positional:
//!
//! ```text
//! AT<echo>\r<body>\r\n<terminal>\r\n     command reply
//! \r\nOK\r\n                             bare OK (escape acknowledgement)
//! \r\n<text>\r\n\r\nOK\r\n               echo-less reply with body
//! \r\n<terminal>\r\n                     echo-less reply
//! \r\n<text>\r\n                         unsolicited event
//! \r\n\r\n                               empty line, discarded
//! ```
//!
//! `<terminal>` is one of `OK`, `ERROR`, `NO CARRIER`, `NO DIALTONE`, `BUSY`,
//! `+CME ERROR: <detail>` or `+CMS ERROR: <detail>` and always occupies a
//! whole line. A block that starts like a reply but has not reached its
//! terminal line yet is incomplete, never an event.

use std::fmt;

use regex::bytes::Regex;

use crate::error::{ModemError, Result};
use crate::obex::decode_latin1;

const CRLF: &[u8] = b"\r\n";
const ESCAPE_ACK: &[u8] = b"\r\nOK\r\n";

const REPLY_PATTERN: &str = r"(?s-u)\A((?i:AT)[^\r]*)\r(.*?)\r\n(OK|ERROR|NO CARRIER|NO DIALTONE|BUSY|\+CM[ES] ERROR: [^\r\n]*)\r\n";

/// Final result line of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Ok,
    Error,
    NoCarrier,
    NoDialtone,
    Busy,
    /// Detail text after `+CME ERROR: `.
    Cme(String),
    /// Detail text after `+CMS ERROR: `.
    Cms(String),
}

impl Terminal {
    /// Parse a whole line as a terminal token.
    pub fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "OK" => Terminal::Ok,
            "ERROR" => Terminal::Error,
            "NO CARRIER" => Terminal::NoCarrier,
            "NO DIALTONE" => Terminal::NoDialtone,
            "BUSY" => Terminal::Busy,
            _ => {
                if let Some(detail) = line.strip_prefix("+CME ERROR: ") {
                    Terminal::Cme(detail.trim().to_string())
                } else if let Some(detail) = line.strip_prefix("+CMS ERROR: ") {
                    Terminal::Cms(detail.trim().to_string())
                } else {
                    return None;
                }
            }
        })
    }

    /// `ERROR`, `+CME ERROR` and `+CMS ERROR` fail the command. The call
    /// progress tokens are returned to the caller as text.
    pub fn is_failure(&self) -> bool {
        matches!(self, Terminal::Error | Terminal::Cme(_) | Terminal::Cms(_))
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Ok => f.write_str("OK"),
            Terminal::Error => f.write_str("ERROR"),
            Terminal::NoCarrier => f.write_str("NO CARRIER"),
            Terminal::NoDialtone => f.write_str("NO DIALTONE"),
            Terminal::Busy => f.write_str("BUSY"),
            Terminal::Cme(detail) => write!(f, "+CME ERROR: {}", detail),
            Terminal::Cms(detail) => write!(f, "+CMS ERROR: {}", detail),
        }
    }
}

/// A command reply with the echo removed from its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtReply {
    /// Echoed command, absent for echo-less replies.
    pub echo: Option<String>,
    /// Body text between the echo and the terminal line, trimmed.
    pub text: String,
    pub terminal: Terminal,
}

/// One classified block of AT text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtUnit {
    Reply(AtReply),
    Event(String),
    /// Bytes carrying no information (empty lines, stray bytes).
    Skip,
}

/// Outcome of parsing the front of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    /// A unit and the number of bytes it occupies.
    Complete(AtUnit, usize),
    Incomplete,
}

/// Compiled AT response grammar.
#[derive(Debug, Clone)]
pub struct AtGrammar {
    reply: Regex,
}

impl AtGrammar {
    pub fn new() -> Result<Self> {
        let reply = Regex::new(REPLY_PATTERN)
            .map_err(|e| ModemError::InvalidArgument(format!("AT reply grammar: {}", e)))?;
        Ok(Self { reply })
    }

    /// Whether `pending` starts with `AT` (any case) or `\r\n`.
    ///
    /// A single buffered byte is claimed if it can start either prefix.
    pub fn claims(pending: &[u8]) -> bool {
        match pending {
            [] => false,
            [b'A' | b'a'] | [b'\r'] => true,
            [first, second, ..] => {
                [*first, *second].eq_ignore_ascii_case(b"AT") || [*first, *second] == *CRLF
            }
            _ => false,
        }
    }

    /// Classify the block at the front of `pending`.
    pub fn parse(&self, pending: &[u8]) -> Parse {
        if pending.len() < 2 {
            return if Self::claims(pending) {
                Parse::Incomplete
            } else {
                Parse::Complete(AtUnit::Skip, pending.len())
            };
        }

        if pending[..2].eq_ignore_ascii_case(b"AT") {
            return self.parse_reply(pending);
        }
        if pending.starts_with(CRLF) {
            return parse_line(pending);
        }
        Parse::Complete(AtUnit::Skip, 1)
    }

    fn parse_reply(&self, pending: &[u8]) -> Parse {
        let Some(caps) = self.reply.captures(pending) else {
            return Parse::Incomplete;
        };
        let (Some(whole), Some(echo), Some(body), Some(terminal)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            return Parse::Incomplete;
        };

        let echo = decode_latin1(echo.as_bytes());
        let terminal_line = decode_latin1(terminal.as_bytes());
        let Some(terminal) = Terminal::parse(&terminal_line) else {
            return Parse::Incomplete;
        };
        let text = strip_echo(&decode_latin1(body.as_bytes()), &echo);

        Parse::Complete(
            AtUnit::Reply(AtReply {
                echo: Some(echo),
                text,
                terminal,
            }),
            whole.end(),
        )
    }
}

fn parse_line(pending: &[u8]) -> Parse {
    if pending.starts_with(ESCAPE_ACK) {
        return Parse::Complete(
            AtUnit::Reply(AtReply {
                echo: None,
                text: String::new(),
                terminal: Terminal::Ok,
            }),
            ESCAPE_ACK.len(),
        );
    }
    if pending.starts_with(b"\r\n\r\n") {
        return Parse::Complete(AtUnit::Skip, CRLF.len());
    }

    let Some(end) = find_crlf(&pending[CRLF.len()..]).map(|i| i + CRLF.len()) else {
        return Parse::Incomplete;
    };
    let text = decode_latin1(&pending[CRLF.len()..end]);
    let consumed = end + CRLF.len();
    let rest = &pending[consumed..];

    if rest.starts_with(ESCAPE_ACK) {
        return Parse::Complete(
            AtUnit::Reply(AtReply {
                echo: None,
                text: text.trim().to_string(),
                terminal: Terminal::Ok,
            }),
            consumed + ESCAPE_ACK.len(),
        );
    }
    if !rest.is_empty() && ESCAPE_ACK.starts_with(rest) {
        return Parse::Incomplete;
    }

    match Terminal::parse(text.trim()) {
        Some(terminal) => Parse::Complete(
            AtUnit::Reply(AtReply {
                echo: None,
                text: String::new(),
                terminal,
            }),
            consumed,
        ),
        None => Parse::Complete(AtUnit::Event(text), consumed),
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|w| w == CRLF)
}

/// Remove leading repetitions of the echoed command and trim.
fn strip_echo(body: &str, echo: &str) -> String {
    let mut rest = body.trim_start();
    while let Some(head) = rest.get(..echo.len()) {
        if !head.eq_ignore_ascii_case(echo) {
            break;
        }
        rest = rest[echo.len()..].trim_start();
    }
    rest.trim_end().to_string()
}
