//! Byte pumps between a local socket and an endpoint stream.
//!
//! One task per direction, the way every peer connection runs one reader
//! and one writer. Half-close is preserved end to end: local EOF becomes
//! STREAM_CLOSE(FIN_WRITE), a remote FIN becomes a local write shutdown,
//! and the relay only returns once both directions are finished or the
//! stream died.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::StreamError;
use crate::stream::{StreamReadHalf, StreamWriteHalf};
use trellis_proto::StreamErrorCode;

/// Local-side read buffer; stays under one sealed record per send.
const COPY_CHUNK: usize = 8 * 1024;

/// Relay a local byte stream against an endpoint stream until both
/// directions complete.
pub async fn relay_stream<S>(local: S, read: StreamReadHalf, write: StreamWriteHalf)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_read, local_write) = tokio::io::split(local);
    let outbound = tokio::spawn(pump_out(local_read, write));
    let inbound = tokio::spawn(pump_in(read, local_write));
    let _ = outbound.await;
    let _ = inbound.await;
}

/// local → mesh. Local EOF half-closes the stream.
async fn pump_out<R>(mut local: tokio::io::ReadHalf<R>, mut write: StreamWriteHalf)
where
    R: AsyncRead,
{
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        match local.read(&mut buf).await {
            Ok(0) => {
                write.close_write().await;
                return;
            }
            Ok(n) => {
                if let Err(e) = write.send(&buf[..n]).await {
                    debug!(error = %e, "outbound pump stopped");
                    if matches!(e, StreamError::Crypto(_)) {
                        write.reset(StreamErrorCode::ExitDisabled).await;
                    }
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "local read failed");
                write.reset(StreamErrorCode::ConnectionRefused).await;
                return;
            }
        }
    }
}

/// mesh → local. A remote FIN shuts down the local write half.
async fn pump_in<W>(mut read: StreamReadHalf, mut local: tokio::io::WriteHalf<W>)
where
    W: AsyncWrite,
{
    loop {
        match read.recv().await {
            Ok(Some(chunk)) => {
                if local.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = local.shutdown().await;
                return;
            }
            Err(e) => {
                debug!(error = %e, "inbound pump stopped");
                return;
            }
        }
    }
}

/// Reassembles length-prefixed datagrams out of the stream byte flow.
///
/// UDP payloads and ICMP echo payloads travel as `u16 length | bytes`
/// records inside the (decrypted) stream; stream chunking does not respect
/// record boundaries, so both ends run one of these.
#[derive(Default)]
pub struct DatagramFramer {
    buf: BytesMut,
}

impl DatagramFramer {
    /// Wrap one datagram for the stream.
    pub fn frame(payload: &[u8]) -> Bytes {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let mut out = BytesMut::with_capacity(2 + payload.len());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out.freeze()
    }

    /// Feed stream bytes in; pull complete datagrams out.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_survive_arbitrary_chunking() {
        let a = DatagramFramer::frame(b"hello");
        let b = DatagramFramer::frame(b"");
        let c = DatagramFramer::frame(&[7u8; 300]);
        let mut wire = Vec::new();
        wire.extend_from_slice(&a);
        wire.extend_from_slice(&b);
        wire.extend_from_slice(&c);

        // Feed one byte at a time.
        let mut framer = DatagramFramer::default();
        let mut out = Vec::new();
        for byte in &wire {
            framer.push(std::slice::from_ref(byte));
            while let Some(datagram) = framer.next() {
                out.push(datagram);
            }
        }
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..], b"hello");
        assert!(out[1].is_empty());
        assert_eq!(out[2].len(), 300);
    }

    #[test]
    fn incomplete_record_stays_buffered() {
        let mut framer = DatagramFramer::default();
        framer.push(&[0, 5, b'a', b'b']);
        assert!(framer.next().is_none());
        framer.push(b"cde");
        assert_eq!(&framer.next().unwrap()[..], b"abcde");
        assert!(framer.next().is_none());
    }
}
