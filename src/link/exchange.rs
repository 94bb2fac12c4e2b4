//! Single-slot request/response correlation.
//!
//! Each protocol owns one [`ResponseSlot`]. A caller arms it with a key that
//! describes the outstanding request, writes the request, then waits on the
//! returned [`PendingExchange`]. The reader task delivers the parsed response
//! into the slot. Responses that arrive while nothing is armed, or that do not
//! belong to the armed request, are rejected and never reach a later caller.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ModemError, Result};

/// Outcome of offering a response to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The armed caller received the response.
    Delivered,
    /// Nothing was armed.
    Unsolicited,
    /// The response did not match the armed request.
    Mismatched,
}

struct Armed<K, T> {
    key: K,
    tx: oneshot::Sender<T>,
}

/// Holds at most one outstanding request per protocol.
pub struct ResponseSlot<K, T> {
    armed: Mutex<Option<Armed<K, T>>>,
}

impl<K, T> ResponseSlot<K, T> {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(None),
        }
    }

    fn armed(&self) -> MutexGuard<'_, Option<Armed<K, T>>> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the slot for a new request identified by `key`.
    ///
    /// A previously armed request is dropped; its waiter observes
    /// [`ModemError::ConnectionClosed`].
    pub fn arm(&self, key: K) -> PendingExchange<T> {
        let (tx, rx) = oneshot::channel();
        if self.armed().replace(Armed { key, tx }).is_some() {
            tracing::warn!("Response slot re-armed while a request was outstanding");
        }
        PendingExchange { rx }
    }

    /// Drop the armed request, if any.
    pub fn disarm(&self) {
        self.armed().take();
    }

    /// Whether a request is outstanding.
    pub fn is_armed(&self) -> bool {
        self.armed().is_some()
    }

    /// Offer a response built from the armed key.
    ///
    /// `build` sees the key of the outstanding request and returns the value
    /// to hand to its waiter, or `None` if the response belongs elsewhere.
    pub fn deliver_with<F>(&self, build: F) -> Delivery
    where
        F: FnOnce(&K) -> Option<T>,
    {
        let mut armed = self.armed();
        let value = match armed.as_ref() {
            None => return Delivery::Unsolicited,
            Some(pending) => match build(&pending.key) {
                Some(value) => value,
                None => return Delivery::Mismatched,
            },
        };

        match armed.take() {
            Some(pending) => {
                // The waiter may have given up already; the response is still spent.
                let _ = pending.tx.send(value);
                Delivery::Delivered
            }
            None => Delivery::Unsolicited,
        }
    }
}

impl<K, T> Default for ResponseSlot<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of an armed request.
#[derive(Debug)]
pub struct PendingExchange<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> PendingExchange<T> {
    /// Wait up to `attempts` periods of `per_attempt` for the response.
    pub async fn wait(mut self, per_attempt: Duration, attempts: u32) -> Result<T> {
        for attempt in 1..=attempts.max(1) {
            match tokio::time::timeout(per_attempt, &mut self.rx).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(_)) => return Err(ModemError::ConnectionClosed),
                Err(_) => {
                    tracing::trace!("No response after attempt {}/{}", attempt, attempts);
                }
            }
        }

        Err(ModemError::ProtocolTimeout(format!(
            "no response within {:?}",
            per_attempt * attempts.max(1)
        )))
    }
}
