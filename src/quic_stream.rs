use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional QUIC stream presented as a single duplex byte stream.
pub struct QuicStream {
    send_stream: quinn::SendStream,
    recv_stream: quinn::RecvStream,
}

impl QuicStream {
    pub fn from(send_stream: quinn::SendStream, recv_stream: quinn::RecvStream) -> Self {
        Self {
            send_stream,
            recv_stream,
        }
    }

    /// Stops the receive side and signals the peer that no more data will be
    /// read. Writes are ended by `poll_shutdown`.
    pub fn stop(&mut self) {
        let _ = self.recv_stream.stop(0u32.into());
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv_stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send_stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send_stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send_stream).poll_shutdown(cx)
    }
}
