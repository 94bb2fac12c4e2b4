//! Byte stream to a serial bridge.
//!
//! The module's serial port is usually exposed by `ser2net` or `socat`,
//! either as a TCP port or as a Unix socket. The port itself (baud rate,
//! parity, flow control) is configured on the bridge, never here.
//!
//! # Example
//!
//! ```ignore
//! use modemlink::transport::connect_bridge;
//!
//! let stream = connect_bridge("127.0.0.1:7000").await?;
//! let modem = ModemBuilder::new().start(stream).await?;
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::Result;

/// Connected bridge stream.
#[derive(Debug)]
pub enum BridgeStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

/// Connect to a serial bridge.
///
/// An address containing `/` is a Unix socket path on Unix; anything else is
/// a TCP `host:port`.
pub async fn connect_bridge(addr: &str) -> Result<BridgeStream> {
    #[cfg(unix)]
    {
        if addr.contains('/') {
            let stream = tokio::net::UnixStream::connect(addr).await?;
            tracing::debug!("Connected to serial bridge at {}", addr);
            return Ok(BridgeStream::Unix(stream));
        }
    }

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    tracing::debug!("Connected to serial bridge at {}", addr);
    Ok(BridgeStream::Tcp(stream))
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BridgeStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            BridgeStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
