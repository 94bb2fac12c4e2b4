//! OBEX session over the shared link.
//!
//! [`ObexSession`] moves the link between AT and OBEX mode and runs one
//! request/response exchange at a time. Callers that need several exchanges
//! without interleaving (one chunk of a transfer, or ABORT during one) take
//! the exchange lock explicitly through [`ObexSession::lock_exchange`].
//!
//! ```text
//! AT ──AT\Q3, AT^SQWE=0, AT^SQWE=3──► OBEX ──CONNECT──► connected
//! connected ──DISCONNECT──► OBEX ──+++──► AT ──ATE1──► ready
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use super::frame::{hex, ObexFrame};
use super::handler::{ObexHandler, ObexSlot};
use super::header::ObexHeader;
use super::wire_format::{Opcode, ResponseCode};
use crate::at::AtEngine;
use crate::config::ModemConfig;
use crate::error::{ModemError, Result};
use crate::link::{Dispatcher, HandlerId, Mode};
use crate::writer::WriterHandle;

/// TARGET of the module's flash filesystem service
/// (`6B01CB31-4106-11D4-9A77-0050DA3F471F`).
pub const FILESYSTEM_TARGET: [u8; 16] = [
    0x6B, 0x01, 0xCB, 0x31, 0x41, 0x06, 0x11, 0xD4, 0x9A, 0x77, 0x00, 0x50, 0xDA, 0x3F, 0x47, 0x1F,
];

/// AT commands that put the module into OBEX transparent mode.
const OPEN_SEQUENCE: [&str; 3] = ["AT\\Q3", "AT^SQWE=0", "AT^SQWE=3"];

/// OBEX client session sharing the link with the AT engine.
pub struct ObexSession {
    at: Arc<AtEngine>,
    dispatcher: Arc<Dispatcher>,
    writer: WriterHandle,
    slot: Arc<ObexSlot>,
    handler_id: HandlerId,
    /// CONNECTION_ID assigned by the module on CONNECT.
    connection_id: Mutex<Option<u32>>,
    exchange_lock: AsyncMutex<()>,
    config: ModemConfig,
}

impl ObexSession {
    /// Create the session and register its handler for OBEX mode.
    pub fn new(
        at: Arc<AtEngine>,
        dispatcher: Arc<Dispatcher>,
        writer: WriterHandle,
        config: ModemConfig,
    ) -> Self {
        let slot = Arc::new(ObexSlot::new());
        let handler_id = dispatcher.register(Mode::Obex, Arc::new(ObexHandler::new(slot.clone())));

        Self {
            at,
            dispatcher,
            writer,
            slot,
            handler_id,
            connection_id: Mutex::new(None),
            exchange_lock: AsyncMutex::new(()),
            config,
        }
    }

    /// Whether the link is in OBEX mode.
    pub fn is_open(&self) -> bool {
        self.dispatcher.mode() == Mode::Obex
    }

    /// The AT engine this session switches away from.
    pub fn at(&self) -> &Arc<AtEngine> {
        &self.at
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// Take the exchange lock.
    ///
    /// No other exchange, including ABORT from a concurrent cancel, can run
    /// until the guard is dropped.
    pub async fn lock_exchange(&self) -> ExchangeGuard<'_> {
        ExchangeGuard {
            session: self,
            _guard: self.exchange_lock.lock().await,
        }
    }

    /// Run one exchange and fail unless the response code is in `allowed`.
    pub async fn expect(&self, frame: ObexFrame, allowed: &[ResponseCode]) -> Result<ObexFrame> {
        self.lock_exchange().await.expect(frame, allowed).await
    }

    /// Switch the link to OBEX mode and connect to the filesystem service.
    ///
    /// Does nothing if the link is already in OBEX mode. If CONNECT is
    /// rejected the link is returned to AT mode before the error surfaces.
    pub async fn open(&self) -> Result<()> {
        let guard = self.lock_exchange().await;
        if self.is_open() {
            return Ok(());
        }

        for command in OPEN_SEQUENCE {
            self.at.send(command).await?;
        }
        if !self.is_open() {
            return Err(ModemError::ModeViolation(
                "module did not enter OBEX mode".to_string(),
            ));
        }

        let connect = ObexFrame::connect(self.config.max_packet_length)
            .with_header(ObexHeader::Target(Bytes::from_static(&FILESYSTEM_TARGET)));

        match guard.expect(connect, &[ResponseCode::Success]).await {
            Ok(response) => {
                let id = response.connection_id();
                *self.connection_id() = id;
                tracing::debug!("OBEX session connected (connection id {:?})", id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("OBEX CONNECT failed: {}", e);
                if let Err(rollback) = self.at.close_mode().await {
                    tracing::warn!("Could not leave OBEX mode after failed CONNECT: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Disconnect and return the link to AT mode.
    ///
    /// The escape and `ATE1` are attempted even if DISCONNECT fails; the
    /// first error is returned.
    pub async fn close(&self) -> Result<()> {
        let guard = self.lock_exchange().await;
        if !self.is_open() {
            return Ok(());
        }

        let disconnect = guard
            .expect(ObexFrame::request(Opcode::Disconnect), &[ResponseCode::Success])
            .await;
        *self.connection_id() = None;
        if let Err(e) = &disconnect {
            tracing::warn!("OBEX DISCONNECT failed: {}", e);
        }

        let restore = match self.at.close_mode().await {
            Ok(()) => self.at.send_internal("ATE1").await.map(|_| ()),
            Err(e) => Err(e),
        };
        tracing::debug!("OBEX session closed");

        disconnect.and(restore)
    }

    fn connection_id(&self) -> std::sync::MutexGuard<'_, Option<u32>> {
        self.connection_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn exchange(
        &self,
        mut frame: ObexFrame,
        wait: Duration,
        attempts: u32,
    ) -> Result<ObexFrame> {
        let op = frame.opcode().ok_or_else(|| {
            ModemError::InvalidArgument("only request frames can be sent".to_string())
        })?;
        if !self.is_open() {
            return Err(ModemError::ModeViolation(format!(
                "OBEX {} not allowed in {} mode",
                op,
                self.dispatcher.mode()
            )));
        }

        if op != Opcode::Connect {
            if let Some(id) = *self.connection_id() {
                frame.insert_first(ObexHeader::ConnectionId(id));
            }
        }

        let bytes = frame.encode()?;
        tracing::debug!("OBEX -> {} ({} bytes)", op, bytes.len());
        tracing::trace!("OBEX -> {}", hex(&bytes));

        let pending = self.slot.arm(op);
        if let Err(e) = self.writer.write(bytes).await {
            self.slot.disarm();
            return Err(e);
        }

        match pending.wait(wait, attempts).await {
            Ok(response) => {
                let response = response?;
                if let Some(code) = response.response_code() {
                    tracing::debug!("OBEX <- {} for {}", code, op);
                }
                Ok(response)
            }
            Err(ModemError::ProtocolTimeout(_)) => {
                self.slot.disarm();
                Err(ModemError::ProtocolTimeout(format!(
                    "no response to OBEX {} within {:?}",
                    op,
                    wait * attempts.max(1)
                )))
            }
            Err(e) => {
                self.slot.disarm();
                Err(e)
            }
        }
    }
}

impl Drop for ObexSession {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.handler_id);
    }
}

impl std::fmt::Debug for ObexSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObexSession")
            .field("mode", &self.dispatcher.mode())
            .field("connection_id", &*self.connection_id())
            .finish()
    }
}

/// Exclusive right to exchange frames with the module.
pub struct ExchangeGuard<'a> {
    session: &'a ObexSession,
    _guard: AsyncMutexGuard<'a, ()>,
}

impl ExchangeGuard<'_> {
    /// Send a request and fail unless the response code is in `allowed`.
    pub async fn expect(&self, frame: ObexFrame, allowed: &[ResponseCode]) -> Result<ObexFrame> {
        let config = &self.session.config;
        self.expect_with_budget(frame, allowed, config.obex_wait(), config.obex_wait_attempts)
            .await
    }

    /// [`expect`](Self::expect) with an explicit wait budget.
    pub async fn expect_with_budget(
        &self,
        frame: ObexFrame,
        allowed: &[ResponseCode],
        wait: Duration,
        attempts: u32,
    ) -> Result<ObexFrame> {
        let request = frame.opcode().unwrap_or(Opcode::Abort);
        let response = self.session.exchange(frame, wait, attempts).await?;
        match response.response_code() {
            Some(code) if allowed.contains(&code) => Ok(response),
            Some(code) => Err(ModemError::ObexRejected { request, code }),
            None => Err(ModemError::InvalidFrame(format!(
                "request frame received in reply to {}",
                request
            ))),
        }
    }
}
