//! Routing of inbound bytes to the protocol that owns the current mode.
//!
//! The [`Dispatcher`] is the single coordinator of the link mode. Handlers are
//! registered against a [`Mode`]; only handlers registered for the current
//! mode are asked whether the buffered bytes belong to them. A mode change is
//! one state replacement under the routing lock, so no inbound byte can be
//! routed with a half-applied transition.
//!
//! # Example
//!
//! ```ignore
//! use modemlink::link::{Dispatcher, LinkBuffer, Mode};
//!
//! let dispatcher = Dispatcher::new(Mode::At, Duration::from_secs(5));
//! let at_id = dispatcher.register(Mode::At, at_handler);
//!
//! let mut buffer = LinkBuffer::new();
//! buffer.extend(b"ATI\r\r\nModuleX\r\n\r\nOK\r\n");
//! let report = dispatcher.drain(&mut buffer);
//! assert_eq!(report.units, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{LinkBuffer, Mode};

/// Maximum number of skipped bytes quoted in a warning.
const SKIP_PREVIEW_LEN: usize = 32;

/// Result of asking a handler to consume buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    /// One complete protocol unit was taken off the buffer. The handler may
    /// request a mode switch that takes effect before the next unit is routed.
    Unit { switch_to: Option<Mode> },
    /// The buffered bytes are the start of a unit that is not complete yet.
    Incomplete,
}

impl Consumed {
    /// A unit that leaves the mode unchanged.
    pub const UNIT: Consumed = Consumed::Unit { switch_to: None };
}

/// A protocol that can take units off the inbound link.
///
/// `consume` runs on the reader task while the routing lock is held; it must
/// not block or call back into the [`Dispatcher`].
pub trait ProtocolHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the next buffered bytes belong to this protocol.
    fn claims(&self, pending: &[u8]) -> bool;

    /// Take one complete unit off the buffer, or report that more bytes are needed.
    fn consume(&self, buffer: &mut LinkBuffer) -> Consumed;

    /// Stall timeout for an incomplete unit starting with `pending`, if it
    /// differs from the dispatcher default.
    fn stall_timeout(&self, _pending: &[u8]) -> Option<Duration> {
        None
    }
}

/// Identifies a handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Summary of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Complete units consumed.
    pub units: usize,
    /// Unclaimed bytes discarded.
    pub skipped: usize,
    /// The pass stopped on an incomplete unit.
    pub incomplete: bool,
}

impl DrainReport {
    pub fn progressed(&self) -> bool {
        self.units > 0 || self.skipped > 0
    }
}

struct Registration {
    id: HandlerId,
    mode: Mode,
    handler: Arc<dyn ProtocolHandler>,
}

struct Routing {
    mode: Mode,
    handlers: Vec<Registration>,
}

impl Routing {
    fn claimant(&self, pending: &[u8]) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers
            .iter()
            .filter(|r| r.mode == self.mode)
            .find(|r| r.handler.claims(pending))
            .map(|r| r.handler.clone())
    }
}

/// Routes inbound bytes and owns the link mode.
pub struct Dispatcher {
    routing: Mutex<Routing>,
    stall_timeout: Duration,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher starting in `mode`.
    pub fn new(mode: Mode, stall_timeout: Duration) -> Self {
        Self {
            routing: Mutex::new(Routing {
                mode,
                handlers: Vec::new(),
            }),
            stall_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn routing(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` for `mode`. Handlers are consulted in registration order.
    pub fn register(&self, mode: Mode, handler: Arc<dyn ProtocolHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Registered {} handler for {} mode", handler.name(), mode);
        self.routing().handlers.push(Registration { id, mode, handler });
        id
    }

    /// Remove a registration. Returns `false` if it was not registered.
    pub fn deregister(&self, id: HandlerId) -> bool {
        let mut routing = self.routing();
        let before = routing.handlers.len();
        routing.handlers.retain(|r| r.id != id);
        routing.handlers.len() != before
    }

    /// Current link mode.
    pub fn mode(&self) -> Mode {
        self.routing().mode
    }

    /// Switch the link mode, returning the previous one.
    pub fn set_mode(&self, mode: Mode) -> Mode {
        let mut routing = self.routing();
        let previous = routing.mode;
        if previous != mode {
            tracing::debug!("Link mode {} -> {}", previous, mode);
        }
        routing.mode = mode;
        previous
    }

    /// Stall timeout for an incomplete unit starting with `pending`.
    pub fn stall_timeout(&self, pending: &[u8]) -> Duration {
        self.routing()
            .claimant(pending)
            .and_then(|h| h.stall_timeout(pending))
            .unwrap_or(self.stall_timeout)
    }

    /// Route every complete unit in `buffer` to its handler.
    ///
    /// Stops when the buffer is empty or the claiming handler needs more
    /// bytes. Bytes no handler claims are discarded one at a time, so noise
    /// on the line can never wedge the loop.
    pub fn drain(&self, buffer: &mut LinkBuffer) -> DrainReport {
        let mut report = DrainReport::default();
        let mut skipped = Vec::new();
        let mut routing = self.routing();

        while !buffer.is_empty() {
            let handler = match routing.claimant(buffer.peek()) {
                Some(handler) => handler,
                None => {
                    if skipped.len() < SKIP_PREVIEW_LEN {
                        skipped.push(buffer.peek()[0]);
                    }
                    buffer.advance(1);
                    report.skipped += 1;
                    continue;
                }
            };

            let before = buffer.len();
            match handler.consume(buffer) {
                Consumed::Incomplete => {
                    report.incomplete = true;
                    break;
                }
                Consumed::Unit { switch_to } => {
                    report.units += 1;
                    if let Some(mode) = switch_to {
                        if routing.mode != mode {
                            tracing::debug!("Link mode {} -> {} ({})", routing.mode, mode, handler.name());
                        }
                        routing.mode = mode;
                    }
                    if buffer.len() == before {
                        tracing::warn!("{} handler reported a unit without consuming it", handler.name());
                        buffer.advance(1);
                        report.skipped += 1;
                    }
                }
            }
        }

        if report.skipped > 0 {
            tracing::warn!(
                "Skipped {} unclaimed byte(s) in {} mode: {:02X?}",
                report.skipped,
                routing.mode,
                skipped
            );
        }

        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routing = self.routing();
        f.debug_struct("Dispatcher")
            .field("mode", &routing.mode)
            .field("handlers", &routing.handlers.len())
            .field("stall_timeout", &self.stall_timeout)
            .finish()
    }
}
