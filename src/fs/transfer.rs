//! Progress reporting and cooperative cancellation of multi-part transfers.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::events::EventHub;

/// Kind of transfer reported to progress listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetFile,
    PutFile,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::GetFile => f.write_str("get file"),
            Operation::PutFile => f.write_str("put file"),
        }
    }
}

/// Notification delivered to progress listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Rounded percentage, only sent when it changes.
    Progress { operation: Operation, percent: u8 },
    /// Sent once when the transfer ends.
    Done { operation: Operation, success: bool },
}

#[derive(Debug, Default)]
struct Flags {
    /// Cleared by a cancel; checked between chunks.
    running: bool,
    /// Set while a multi-part exchange is outstanding.
    interruptable: bool,
}

/// Shared cancel state of the current transfer.
#[derive(Debug, Default)]
pub(crate) struct TransferControl {
    flags: Mutex<Flags>,
}

impl TransferControl {
    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a transfer as started. Dropping the guard ends it.
    pub fn begin(&self) -> TransferGuard<'_> {
        let mut flags = self.flags();
        flags.running = true;
        flags.interruptable = false;
        TransferGuard { control: self }
    }

    /// A multi-part exchange is now outstanding and may be aborted.
    pub fn allow_interrupt(&self) {
        let mut flags = self.flags();
        if flags.running {
            flags.interruptable = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags().running
    }

    /// Request cancellation. Returns `false` if nothing can be interrupted.
    pub fn try_cancel(&self) -> bool {
        let mut flags = self.flags();
        if flags.running && flags.interruptable {
            flags.running = false;
            flags.interruptable = false;
            true
        } else {
            false
        }
    }

    /// The last exchange completed; a cancel from now on is a no-op.
    pub fn finish(&self) {
        self.flags().interruptable = false;
    }
}

/// Resets the transfer flags when the transfer ends by any path.
pub(crate) struct TransferGuard<'a> {
    control: &'a TransferControl,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self.control.flags();
        flags.running = false;
        flags.interruptable = false;
    }
}

/// Progress of one transfer.
///
/// Percentages are capped at 99 until [`complete`](Self::complete) so that
/// 100 is only ever reported for a finished transfer, and never decrease.
pub(crate) struct TransferState<'a> {
    hub: Option<&'a EventHub<ProgressEvent>>,
    operation: Operation,
    transferred: u64,
    total: u64,
    last_percent: Option<u8>,
}

impl<'a> TransferState<'a> {
    pub fn new(hub: &'a EventHub<ProgressEvent>, operation: Operation, total: u64) -> Self {
        Self {
            hub: Some(hub),
            operation,
            transferred: 0,
            total,
            last_percent: None,
        }
    }

    /// State that counts bytes without notifying anyone, for listing reads.
    pub fn untracked(operation: Operation) -> Self {
        Self {
            hub: None,
            operation,
            transferred: 0,
            total: 0,
            last_percent: None,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Report the start of the transfer.
    pub fn start(&mut self) {
        self.report(0);
    }

    /// Account for `bytes` more transferred bytes.
    pub fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        if self.total == 0 {
            return;
        }
        let percent = (self.transferred.saturating_mul(100) / self.total).min(99) as u8;
        self.report(percent);
    }

    /// Report 100 percent followed by a successful done notification.
    pub fn complete(mut self) {
        self.report(100);
        self.notify(ProgressEvent::Done {
            operation: self.operation,
            success: true,
        });
    }

    /// Report a failed done notification.
    pub fn fail(self) {
        self.notify(ProgressEvent::Done {
            operation: self.operation,
            success: false,
        });
    }

    fn report(&mut self, percent: u8) {
        if self.last_percent.map_or(true, |last| percent > last) {
            self.last_percent = Some(percent);
            self.notify(ProgressEvent::Progress {
                operation: self.operation,
                percent,
            });
        }
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(hub) = self.hub {
            hub.emit(event);
        }
    }
}
