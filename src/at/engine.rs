//! AT command engine.
//!
//! [`AtEngine`] sends one command at a time and waits for the reply that
//! echoes it. Inbound AT text is classified by [`AtHandler`] on the reader
//! task: replies resolve the outstanding request, unsolicited lines go to
//! listeners through an [`EventHub`].
//!
//! # Example
//!
//! ```ignore
//! let identity = modem.at().send("ATI").await?;
//! let id = modem.at().add_listener(|event: &AtEvent| {
//!     tracing::info!("URC: {}", event.text);
//! });
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::grammar::{AtGrammar, AtReply, AtUnit, Parse, Terminal};
use crate::config::ModemConfig;
use crate::error::{AtErrorKind, ModemError, Result};
use crate::events::{EventHub, ListenerId};
use crate::link::{
    Consumed, Delivery, Dispatcher, HandlerId, LinkBuffer, Mode, ProtocolHandler, ResponseSlot,
};
use crate::obex::encode_latin1;
use crate::writer::WriterHandle;

/// Escape sequence that leaves transparent mode.
const ESCAPE_SEQUENCE: &[u8] = b"+++";

/// Command whose `OK` switches the module into OBEX transparent mode.
const OBEX_SWITCH_COMMAND: &str = "AT^SQWE=3";

/// Echo is switched on by the first negotiated command.
const ECHO_ON_COMMAND: &str = "ATE1";

/// An unsolicited line from the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtEvent {
    pub text: String,
}

/// What the outstanding AT request expects back.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AtKey {
    /// A reply echoing this command.
    Command(String),
    /// `ATE1` while echo may still be off: echoed or bare.
    EchoOn(String),
    /// The bare `OK` after `+++`.
    Escape,
}

impl AtKey {
    fn for_command(command: &str) -> Self {
        if command.eq_ignore_ascii_case(ECHO_ON_COMMAND) {
            AtKey::EchoOn(command.to_string())
        } else {
            AtKey::Command(command.to_string())
        }
    }

    /// Whether a reply with `echo` answers this request.
    fn accepts(&self, echo: Option<&str>) -> bool {
        match (self, echo) {
            (AtKey::Escape, None) | (AtKey::EchoOn(_), None) => true,
            (AtKey::Command(command) | AtKey::EchoOn(command), Some(echo)) => {
                echo.eq_ignore_ascii_case(command)
            }
            _ => false,
        }
    }
}

type AtSlot = ResponseSlot<AtKey, AtReply>;

fn is_dial(command: &str) -> bool {
    command.to_ascii_uppercase().contains("ATD")
}

/// Inbound side of the AT protocol.
pub(crate) struct AtHandler {
    grammar: AtGrammar,
    slot: Arc<AtSlot>,
    events: EventHub<AtEvent>,
    dial_stall_timeout: Duration,
}

impl AtHandler {
    fn deliver(&self, reply: AtReply) {
        let echo = reply.echo.clone();
        let terminal = reply.terminal.clone();
        let mut reply = Some(reply);

        let delivery = self.slot.deliver_with(|key| {
            if key.accepts(echo.as_deref()) {
                reply.take()
            } else {
                None
            }
        });

        match (delivery, echo) {
            (Delivery::Delivered, _) => {}
            (_, None) if terminal != Terminal::Ok => {
                // Call progress results such as NO CARRIER arrive on their own.
                self.events.emit(AtEvent {
                    text: terminal.to_string(),
                });
            }
            (Delivery::Unsolicited, echo) => {
                tracing::warn!("Dropping unsolicited AT reply (echo {:?}, {})", echo, terminal);
            }
            (Delivery::Mismatched, echo) => {
                tracing::warn!("Dropping stale AT reply (echo {:?}, {})", echo, terminal);
            }
        }
    }
}

impl ProtocolHandler for AtHandler {
    fn name(&self) -> &'static str {
        "AT"
    }

    fn claims(&self, pending: &[u8]) -> bool {
        AtGrammar::claims(pending)
    }

    fn consume(&self, buffer: &mut LinkBuffer) -> Consumed {
        let (unit, len) = match self.grammar.parse(buffer.peek()) {
            Parse::Incomplete => return Consumed::Incomplete,
            Parse::Complete(unit, len) => (unit, len),
        };
        let raw = buffer.split_to(len);
        tracing::trace!("AT <- {:?}", String::from_utf8_lossy(&raw));

        match unit {
            AtUnit::Skip => Consumed::UNIT,
            AtUnit::Event(text) => {
                tracing::debug!("AT event: {}", text);
                self.events.emit(AtEvent { text });
                Consumed::UNIT
            }
            AtUnit::Reply(reply) => {
                let enters_obex = reply.terminal == Terminal::Ok
                    && reply
                        .echo
                        .as_deref()
                        .map_or(false, |echo| echo.to_ascii_uppercase().contains(OBEX_SWITCH_COMMAND));
                self.deliver(reply);
                Consumed::Unit {
                    switch_to: enters_obex.then_some(Mode::Obex),
                }
            }
        }
    }

    fn stall_timeout(&self, pending: &[u8]) -> Option<Duration> {
        let dial = pending.len() >= 3 && pending[..3].eq_ignore_ascii_case(b"ATD");
        dial.then_some(self.dial_stall_timeout)
    }
}

/// Sends AT commands and correlates their replies.
pub struct AtEngine {
    dispatcher: Arc<Dispatcher>,
    writer: WriterHandle,
    slot: Arc<AtSlot>,
    events: EventHub<AtEvent>,
    handler_id: HandlerId,
    /// Serializes AT exchanges and remembers when the last one ended.
    last_command: Mutex<Option<Instant>>,
    config: ModemConfig,
}

impl AtEngine {
    /// Create the engine and register its handler for AT mode.
    ///
    /// Must be called inside a tokio runtime (spawns the event dispatch task).
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        writer: WriterHandle,
        config: ModemConfig,
    ) -> Result<Self> {
        let slot = Arc::new(AtSlot::new());
        let events = EventHub::new();
        let handler = Arc::new(AtHandler {
            grammar: AtGrammar::new()?,
            slot: slot.clone(),
            events: events.clone(),
            dial_stall_timeout: config.dial_stall_timeout(),
        });
        let handler_id = dispatcher.register(Mode::At, handler);

        Ok(Self {
            dispatcher,
            writer,
            slot,
            events,
            handler_id,
            last_command: Mutex::new(None),
            config,
        })
    }

    /// Send a command and return the reply text with echo and `OK` removed.
    ///
    /// Commands must start with `AT`. Changing the error mode with
    /// `AT+CMEE=` is rejected; it is negotiated once at session start.
    /// Call progress results (`NO CARRIER`, `BUSY`, `NO DIALTONE`) are
    /// returned as text; `ERROR`, `+CME ERROR` and `+CMS ERROR` fail with
    /// [`ModemError::CommandRejected`].
    pub async fn send(&self, command: &str) -> Result<String> {
        if !command.get(..2).map_or(false, |p| p.eq_ignore_ascii_case("AT")) {
            return Err(ModemError::InvalidArgument(format!(
                "AT command must start with AT: {:?}",
                command
            )));
        }
        if command.to_ascii_uppercase().contains("AT+CMEE=") {
            return Err(ModemError::InvalidArgument(
                "AT+CMEE= is negotiated at session start".to_string(),
            ));
        }
        self.send_internal(command).await
    }

    /// Send without the argument checks of [`send`](Self::send).
    pub(crate) async fn send_internal(&self, command: &str) -> Result<String> {
        let mut last = self.last_command.lock().await;
        self.ensure_at_mode()?;

        if is_dial(command) {
            // Fail fast before committing to the long dial budget.
            self.exchange(&mut last, "AT", self.config.at_wait_attempts)
                .await?;
            self.exchange(&mut last, command, self.config.dial_wait_attempts)
                .await
        } else {
            self.exchange(&mut last, command, self.config.at_wait_attempts)
                .await
        }
    }

    /// Enable echo and select the error reporting mode.
    pub async fn negotiate(&self) -> Result<()> {
        self.send_internal("ATE1").await?;
        let cmee = if self.config.numeric_errors {
            "AT+CMEE=1"
        } else {
            "AT+CMEE=2"
        };
        self.send_internal(cmee).await?;
        tracing::debug!("AT session negotiated ({})", cmee);
        Ok(())
    }

    /// Leave transparent mode with the `+++` escape.
    ///
    /// The escape is repeated until the module answers or the attempt budget
    /// runs out. On timeout the link stays in its previous mode.
    pub async fn close_mode(&self) -> Result<()> {
        let mut last = self.last_command.lock().await;
        let previous = self.dispatcher.mode();
        if previous == Mode::At {
            return Err(ModemError::ModeViolation(
                "escape sequence sent while already in AT mode".to_string(),
            ));
        }

        // Whatever the module sends after the escape is AT text.
        self.dispatcher.set_mode(Mode::At);
        let attempts = self.config.escape_attempts.max(1);

        for attempt in 1..=attempts {
            let pending = self.slot.arm(AtKey::Escape);
            if let Err(e) = self.writer.write(Bytes::from_static(ESCAPE_SEQUENCE)).await {
                self.slot.disarm();
                self.dispatcher.set_mode(previous);
                return Err(e);
            }

            match pending.wait(self.config.escape_wait(), 1).await {
                Ok(reply) => {
                    *last = Some(Instant::now());
                    tracing::debug!(
                        "Escape acknowledged ({}) after {} attempt(s)",
                        reply.terminal,
                        attempt
                    );
                    return Ok(());
                }
                Err(ModemError::ProtocolTimeout(_)) => {
                    self.slot.disarm();
                    tracing::debug!("No reply to escape, attempt {}/{}", attempt, attempts);
                }
                Err(e) => {
                    self.slot.disarm();
                    self.dispatcher.set_mode(previous);
                    return Err(e);
                }
            }
        }

        self.dispatcher.set_mode(previous);
        Err(ModemError::ProtocolTimeout(format!(
            "no reply to escape sequence after {} attempts",
            attempts
        )))
    }

    /// Current link mode.
    pub fn mode(&self) -> Mode {
        self.dispatcher.mode()
    }

    /// Register a listener for unsolicited events.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AtEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(listener)
    }

    /// Remove an event listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    fn ensure_at_mode(&self) -> Result<()> {
        match self.dispatcher.mode() {
            Mode::At => Ok(()),
            mode => Err(ModemError::ModeViolation(format!(
                "AT command not allowed in {} mode",
                mode
            ))),
        }
    }

    async fn exchange(
        &self,
        last: &mut Option<Instant>,
        command: &str,
        attempts: u32,
    ) -> Result<String> {
        let mut line = encode_latin1(command)?;
        line.push(b'\r');

        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.config.command_spacing()).await;
        }

        let pending = self.slot.arm(AtKey::for_command(command));
        tracing::trace!("AT -> {}", command);
        let written = self.writer.write(Bytes::from(line)).await;
        if let Err(e) = written {
            self.slot.disarm();
            *last = Some(Instant::now());
            return Err(e);
        }

        let result = pending.wait(self.config.at_wait(), attempts).await;
        *last = Some(Instant::now());

        match result {
            Ok(reply) => self.interpret(reply),
            Err(ModemError::ProtocolTimeout(_)) => {
                self.slot.disarm();
                Err(ModemError::ProtocolTimeout(format!(
                    "no reply to {} within {:?}",
                    command,
                    self.config.at_wait() * attempts.max(1)
                )))
            }
            Err(e) => {
                self.slot.disarm();
                Err(e)
            }
        }
    }

    fn interpret(&self, reply: AtReply) -> Result<String> {
        match reply.terminal {
            Terminal::Ok => Ok(reply.text),
            Terminal::Error => Err(ModemError::CommandRejected {
                kind: AtErrorKind::Error,
                code: None,
                message: if reply.text.is_empty() {
                    "ERROR".to_string()
                } else {
                    reply.text
                },
            }),
            Terminal::Cme(detail) => Err(self.rejected(AtErrorKind::Cme, detail)),
            Terminal::Cms(detail) => Err(self.rejected(AtErrorKind::Cms, detail)),
            progress => {
                if reply.text.is_empty() {
                    Ok(progress.to_string())
                } else {
                    Ok(format!("{}\r\n{}", reply.text, progress))
                }
            }
        }
    }

    fn rejected(&self, kind: AtErrorKind, detail: String) -> ModemError {
        let code = if self.config.numeric_errors {
            detail.trim().parse::<u16>().ok()
        } else {
            None
        };
        ModemError::CommandRejected {
            kind,
            code,
            message: detail,
        }
    }
}

impl Drop for AtEngine {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.handler_id);
    }
}

impl std::fmt::Debug for AtEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtEngine")
            .field("mode", &self.dispatcher.mode())
            .field("numeric_errors", &self.config.numeric_errors)
            .field("listeners", &self.events.listener_count())
            .finish()
    }
}
