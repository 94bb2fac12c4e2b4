//! Reader task driving the dispatcher from the inbound half of the link.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Dispatcher, LinkBuffer};
use crate::error::{ModemError, Result};

/// Size of a single read from the link.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Read from the link until it closes, routing every complete unit.
///
/// An incomplete unit that sits in the buffer past the dispatcher's stall
/// timeout is dropped so a torn response cannot wedge the link.
pub async fn read_loop<R>(mut reader: R, dispatcher: Arc<Dispatcher>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LinkBuffer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let deadline = if buffer.is_empty() {
            None
        } else {
            buffer.stall_deadline(dispatcher.stall_timeout(buffer.peek()))
        };

        let read = match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        let preview = &buffer.peek()[..buffer.len().min(32)];
                        tracing::warn!(
                            "Dropping {} stalled byte(s) in {} mode: {:02X?}",
                            buffer.len(),
                            dispatcher.mode(),
                            preview
                        );
                        buffer.clear();
                        continue;
                    }
                }
            }
            None => reader.read(&mut buf).await,
        };

        let n = match read {
            Ok(0) => return Ok(()), // Link closed
            Ok(n) => n,
            Err(e) => return Err(ModemError::Io(e)),
        };

        tracing::trace!("Link <- {} byte(s)", n);
        buffer.extend(&buf[..n]);
        let report = dispatcher.drain(&mut buffer);
        buffer.note_drained(report.progressed(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Consumed, Mode, ProtocolHandler};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    /// Consumes `\n`-terminated lines.
    struct Lines {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl ProtocolHandler for Lines {
        fn name(&self) -> &'static str {
            "lines"
        }

        fn claims(&self, _pending: &[u8]) -> bool {
            true
        }

        fn consume(&self, buffer: &mut LinkBuffer) -> Consumed {
            match buffer.peek().iter().position(|&b| b == b'\n') {
                Some(end) => {
                    let line = buffer.split_to(end + 1);
                    self.seen.lock().unwrap().push(line.to_vec());
                    Consumed::UNIT
                }
                None => Consumed::Incomplete,
            }
        }
    }

    #[tokio::test]
    async fn test_units_across_reads() {
        let (host, mut module) = tokio::io::duplex(64);
        let dispatcher = Arc::new(Dispatcher::new(Mode::At, Duration::from_secs(5)));
        let lines = Arc::new(Lines {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(Mode::At, lines.clone());
        let task = tokio::spawn(read_loop(host, dispatcher));

        module.write_all(b"one\ntw").await.unwrap();
        module.write_all(b"o\n").await.unwrap();
        drop(module);

        task.await.unwrap().unwrap();
        assert_eq!(
            *lines.seen.lock().unwrap(),
            vec![b"one\n".to_vec(), b"two\n".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_stalled_unit_dropped() {
        let (host, mut module) = tokio::io::duplex(64);
        let dispatcher = Arc::new(Dispatcher::new(Mode::At, Duration::from_millis(50)));
        let lines = Arc::new(Lines {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(Mode::At, lines.clone());
        let task = tokio::spawn(read_loop(host, dispatcher));

        module.write_all(b"torn").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        module.write_all(b"next\n").await.unwrap();
        drop(module);

        task.await.unwrap().unwrap();
        assert_eq!(*lines.seen.lock().unwrap(), vec![b"next\n".to_vec()]);
    }
}
