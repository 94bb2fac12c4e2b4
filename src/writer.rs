//! Dedicated writer task owning the outbound half of the link.
//!
//! The serial link is a single-writer resource. Every AT command, escape
//! sequence and OBEX frame funnels through one mpsc channel into one task that
//! owns the write half, so bytes from different callers never interleave.
//!
//! ```text
//! AtEngine    ─┐
//! ObexSession ─┼─► mpsc::Sender<OutboundBlock> ─► Writer Task ─► Link
//! FileManager ─┘
//! ```
//!
//! Each block carries a completion channel: [`WriterHandle::write`] resolves
//! only after the bytes were flushed, and a transport failure is reported to
//! the caller that issued the write.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DEFAULT_CHANNEL_CAPACITY;
use crate::error::{ModemError, Result};

/// Maximum blocks to coalesce into a single vectored write.
const MAX_BATCH_SIZE: usize = 16;

/// A block of bytes queued for the link.
#[derive(Debug)]
struct OutboundBlock {
    bytes: Bytes,
    done: Option<oneshot::Sender<std::io::Result<()>>>,
}

impl OutboundBlock {
    fn complete(self, result: &std::io::Result<()>) {
        if let Some(done) = self.done {
            let outcome = match result {
                Ok(()) => Ok(()),
                Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
            };
            let _ = done.send(outcome);
        }
    }
}

/// Handle for queuing bytes on the writer task.
///
/// This is cheaply cloneable and shared by every protocol component.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundBlock>,
}

impl WriterHandle {
    /// Queue `bytes` and wait until they have been flushed to the link.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let block = OutboundBlock {
            bytes,
            done: Some(done_tx),
        };

        self.tx
            .send(block)
            .await
            .map_err(|_| ModemError::ConnectionClosed)?;

        match done_rx.await {
            Ok(result) => result.map_err(ModemError::Io),
            Err(_) => Err(ModemError::ConnectionClosed),
        }
    }
}

/// Spawn the writer task and return a handle for queuing bytes.
///
/// The returned `JoinHandle` completes when every handle has been dropped or
/// the link fails.
pub fn spawn_writer_task<W>(writer: W, channel_capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Spawn the writer task with the default channel capacity.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, DEFAULT_CHANNEL_CAPACITY)
}

/// Receive blocks and write them, coalescing whatever is already queued.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundBlock>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(block) => block,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(block) => batch.push(block),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        for block in batch {
            block.complete(&result);
        }

        if let Err(e) = result {
            tracing::error!("Link write failed: {}", e);
            return Err(ModemError::Io(e));
        }
    }
}

/// Write a batch of blocks with vectored I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundBlock]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|b| b.bytes.len()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build the slice list for whatever follows the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundBlock], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for block in batch {
        let end = offset + block.bytes.len();
        if skip_bytes < end && !block.bytes.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&block.bytes[start..]));
        }
        offset = end;
    }

    slices
}
