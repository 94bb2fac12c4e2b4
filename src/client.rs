//! Modem builder and running link.
//!
//! The [`ModemBuilder`] provides a fluent API for tuning timing and transfer
//! limits. [`ModemBuilder::start`] takes over a byte stream:
//! 1. Split the stream into read and write halves
//! 2. Spawn the writer task on the write half
//! 3. Register the AT engine with a dispatcher in AT mode
//! 4. Spawn the reader task on the read half
//! 5. Negotiate echo and error reporting
//!
//! # Example
//!
//! ```ignore
//! use modemlink::{transport::connect_bridge, ModemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = connect_bridge("127.0.0.1:7000").await?;
//!     let modem = ModemBuilder::new()
//!         .numeric_errors(true)
//!         .start(stream)
//!         .await?;
//!
//!     println!("{}", modem.send("ATI").await?);
//!
//!     let files = modem.file_manager().await?;
//!     for entry in files.file_listing().iter() {
//!         println!("{}", entry);
//!     }
//!     files.close().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::at::AtEngine;
use crate::config::ModemConfig;
use crate::error::Result;
use crate::fs::FileManager;
use crate::link::{read_loop, Dispatcher, Mode};
use crate::obex::ObexSession;
use crate::writer::{spawn_writer_task, WriterHandle};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for configuring and starting a modem link.
#[derive(Debug, Clone, Default)]
pub struct ModemBuilder {
    config: ModemConfig,
}

impl ModemBuilder {
    /// Create a builder with the firmware defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, e.g. one loaded from JSON.
    pub fn from_config(config: ModemConfig) -> Self {
        Self { config }
    }

    /// Report `+CME ERROR` / `+CMS ERROR` as numeric codes.
    ///
    /// Default: false (verbose text)
    pub fn numeric_errors(mut self, numeric: bool) -> Self {
        self.config.numeric_errors = numeric;
        self
    }

    /// Minimum gap between two AT commands.
    ///
    /// Default: 100 ms
    pub fn command_spacing(mut self, spacing: Duration) -> Self {
        self.config.command_spacing_ms = millis(spacing);
        self
    }

    /// Wait per attempt and number of attempts for an AT reply.
    ///
    /// Default: 2 s x 3
    pub fn at_wait(mut self, wait: Duration, attempts: u32) -> Self {
        self.config.at_wait_ms = millis(wait);
        self.config.at_wait_attempts = attempts;
        self
    }

    /// Number of AT wait periods granted to a dial command.
    ///
    /// Default: 90
    pub fn dial_wait_attempts(mut self, attempts: u32) -> Self {
        self.config.dial_wait_attempts = attempts;
        self
    }

    /// Wait per `+++` attempt and number of attempts.
    ///
    /// Default: 2 s x 5
    pub fn escape_wait(mut self, wait: Duration, attempts: u32) -> Self {
        self.config.escape_wait_ms = millis(wait);
        self.config.escape_attempts = attempts;
        self
    }

    /// Wait per attempt and number of attempts for an OBEX response.
    ///
    /// Default: 2 s x 3
    pub fn obex_wait(mut self, wait: Duration, attempts: u32) -> Self {
        self.config.obex_wait_ms = millis(wait);
        self.config.obex_wait_attempts = attempts;
        self
    }

    /// Wait per attempt for the delete-all request.
    ///
    /// Default: 30 s
    pub fn delete_all_wait(mut self, wait: Duration) -> Self {
        self.config.delete_all_wait_ms = millis(wait);
        self
    }

    /// How long an incomplete inbound unit may sit in the buffer.
    ///
    /// Default: 5 s
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout_ms = millis(timeout);
        self
    }

    /// Body bytes per PUT frame.
    ///
    /// Default: 512
    pub fn put_chunk_size(mut self, size: usize) -> Self {
        self.config.put_chunk_size = size;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 64
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// Take over `stream` and negotiate the AT session.
    ///
    /// Must be called inside a tokio runtime. If negotiation fails the
    /// reader task is stopped and the error is returned.
    pub async fn start<S>(self, stream: S) -> Result<Modem>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Modem::start(stream, self.config).await
    }
}

/// A running modem link.
///
/// Use [`send`](Self::send) for AT commands and
/// [`file_manager`](Self::file_manager) for the flash filesystem.
pub struct Modem {
    at: Arc<AtEngine>,
    dispatcher: Arc<Dispatcher>,
    writer: WriterHandle,
    obex: OnceLock<Arc<ObexSession>>,
    config: ModemConfig,
    /// Fires when the reader task ends.
    shutdown_rx: oneshot::Receiver<()>,
    reader_task: JoinHandle<()>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Modem {
    /// Create a new modem builder.
    pub fn builder() -> ModemBuilder {
        ModemBuilder::new()
    }

    async fn start<S>(stream: S, config: ModemConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.channel_capacity);

        let dispatcher = Arc::new(Dispatcher::new(Mode::At, config.stall_timeout()));
        let at = Arc::new(AtEngine::new(
            dispatcher.clone(),
            writer.clone(),
            config.clone(),
        )?);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader_dispatcher = dispatcher.clone();
        let reader_task = tokio::spawn(async move {
            match read_loop(read_half, reader_dispatcher).await {
                Ok(()) => tracing::debug!("Link closed by peer"),
                Err(e) => tracing::error!("Read loop error: {}", e),
            }
            let _ = shutdown_tx.send(());
        });

        if let Err(e) = at.negotiate().await {
            reader_task.abort();
            return Err(e);
        }

        Ok(Self {
            at,
            dispatcher,
            writer,
            obex: OnceLock::new(),
            config,
            shutdown_rx,
            reader_task,
            _writer_task: writer_task,
        })
    }

    /// The AT engine.
    pub fn at(&self) -> &Arc<AtEngine> {
        &self.at
    }

    /// Send an AT command. See [`AtEngine::send`].
    pub async fn send(&self, command: &str) -> Result<String> {
        self.at.send(command).await
    }

    /// Current link mode.
    pub fn mode(&self) -> Mode {
        self.dispatcher.mode()
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// The OBEX session of this link, created on first use.
    pub fn obex_session(&self) -> Arc<ObexSession> {
        self.obex
            .get_or_init(|| {
                Arc::new(ObexSession::new(
                    self.at.clone(),
                    self.dispatcher.clone(),
                    self.writer.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Open the flash filesystem. Switches the link to OBEX mode.
    pub async fn file_manager(&self) -> Result<FileManager> {
        FileManager::open(self.obex_session()).await
    }

    /// Wait until the link closes.
    ///
    /// This consumes the modem and blocks until the peer closes the stream
    /// or the reader fails.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let _ = self.shutdown_rx.await;
        Ok(())
    }

    /// Stop reading from the link.
    pub fn shutdown(&self) {
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for Modem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modem")
            .field("mode", &self.mode())
            .field("obex_session", &self.obex.get().is_some())
            .finish()
    }
}
