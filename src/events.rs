//! Ordered asynchronous event delivery.
//!
//! An [`EventHub`] decouples event producers on the I/O path from listener
//! callbacks. Events go into an unbounded FIFO channel and a single dispatch
//! task invokes every registered listener in arrival order, so a slow
//! listener delays later events but never blocks response correlation.
//!
//! # Example
//!
//! ```ignore
//! let hub: EventHub<AtEvent> = EventHub::new();
//! let id = hub.add_listener(|event: &AtEvent| println!("{}", event.text));
//! hub.emit(AtEvent { text: "+CREG: 1".into() });
//! hub.remove_listener(id);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E> {
    entries: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Listeners<E> {
    fn entries(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<E>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fan-out point for one kind of event.
///
/// Cloning yields another handle to the same queue and listener set. The
/// dispatch task ends when the last handle is dropped, after delivering what
/// was already queued.
pub struct EventHub<E> {
    tx: mpsc::UnboundedSender<E>,
    listeners: Arc<Listeners<E>>,
}

impl<E: Send + 'static> EventHub<E> {
    /// Create a hub and spawn its dispatch task on the current runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Listeners {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(dispatch_loop(rx, listeners.clone()));

        Self { tx, listeners }
    }
}

impl<E> EventHub<E> {
    /// Register a listener callback.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.listeners.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.entries().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut entries = self.listeners.entries();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.entries().len()
    }

    /// Queue an event for delivery.
    pub fn emit(&self, event: E) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Event dropped: dispatch task has stopped");
        }
    }
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

async fn dispatch_loop<E>(mut rx: mpsc::UnboundedReceiver<E>, listeners: Arc<Listeners<E>>) {
    while let Some(event) = rx.recv().await {
        // Snapshot so listeners may add or remove listeners while running.
        let snapshot: Vec<Listener<E>> = listeners
            .entries()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let hub: EventHub<u32> = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(move |n: &u32| {
            let _ = tx.send(*n);
        });

        for n in 0..100 {
            hub.emit(n);
        }

        for expected in 0..100 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_every_listener_sees_every_event() {
        let hub: EventHub<&'static str> = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_a = tx.clone();
        hub.add_listener(move |e: &&'static str| {
            let _ = tx_a.send(("a", *e));
        });
        hub.add_listener(move |e: &&'static str| {
            let _ = tx.send(("b", *e));
        });

        hub.emit("+CREG: 1");

        assert_eq!(rx.recv().await, Some(("a", "+CREG: 1")));
        assert_eq!(rx.recv().await, Some(("b", "+CREG: 1")));
    }

    #[tokio::test]
    async fn test_removed_listener_not_called() {
        let hub: EventHub<u8> = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let removed_tx = tx.clone();
        let removed = hub.add_listener(move |_: &u8| {
            let _ = removed_tx.send("removed");
        });
        hub.add_listener(move |_: &u8| {
            let _ = tx.send("kept");
        });

        assert!(hub.remove_listener(removed));
        assert!(!hub.remove_listener(removed));
        assert_eq!(hub.listener_count(), 1);

        hub.emit(1);
        assert_eq!(rx.recv().await, Some("kept"));
        let extra = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_clone_shares_listeners() {
        let hub: EventHub<u8> = EventHub::new();
        let other = hub.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(move |n: &u8| {
            let _ = tx.send(*n);
        });

        other.emit(9);
        assert_eq!(rx.recv().await, Some(9));
    }
}
