//! Transport abstraction: one dial/listen/frame interface over QUIC,
//! HTTP/2 streaming and WebSocket.
//!
//! The backend set is closed, so everything is a tagged variant with
//! match-forwarding rather than open polymorphism. QUIC links expose native
//! per-stream channels (no head-of-line blocking, fairness delegated to the
//! transport); H2 and WebSocket links expose a single duplex byte channel
//! and the peer-connection writer multiplexes frames onto it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::config::{ListenerSettings, PeerSettings, TransportKind};
use crate::error::{AgentError, TransportError};
use trellis_proto::Frame;

pub mod h2;
pub mod quic;
pub mod tls;
pub mod websocket;

pub use quic::{ChannelRx, ChannelTx, FrameChannel, QuicLink};

/// How many bytes one read off a shared link may return.
const READ_CHUNK: usize = 32 * 1024;

/// A connected, transport-level link to a peer, before the PEER_HELLO
/// exchange.
pub enum Link {
    Quic(QuicLink),
    Shared(SharedLink),
}

impl Link {
    pub fn kind(&self) -> TransportKind {
        match self {
            Link::Quic(_) => TransportKind::Quic,
            Link::Shared(s) => s.kind,
        }
    }

    pub fn remote_addr(&self) -> String {
        match self {
            Link::Quic(q) => q.remote_addr().to_string(),
            Link::Shared(s) => s.remote.clone(),
        }
    }
}

/// H2 or WebSocket link: one reliable byte channel carrying every frame.
pub struct SharedLink {
    pub kind: TransportKind,
    pub remote: String,
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

/// Decodes frames off a shared link.
pub struct FrameReader {
    inner: ByteReader,
    buf: BytesMut,
}

impl FrameReader {
    pub(crate) fn new(inner: ByteReader) -> Self {
        FrameReader { inner, buf: BytesMut::with_capacity(READ_CHUNK) }
    }

    /// Next frame, or `None` on clean end of link.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            match self.inner.next_chunk().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if self.buf.is_empty() => return Ok(None),
                // Link died mid-frame.
                None => return Err(TransportError::Closed),
            }
        }
    }
}

/// Writes frames onto a shared link.
pub struct FrameWriter {
    inner: ByteWriter,
}

impl FrameWriter {
    pub(crate) fn new(inner: ByteWriter) -> Self {
        FrameWriter { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.inner.send(frame.encode()).await
    }

    pub async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// Raw byte source per backend.
pub(crate) enum ByteReader {
    WebSocket(futures::stream::SplitStream<websocket::WsStream>),
    H2 { body: ::h2::RecvStream, flow: ::h2::FlowControl },
}

impl ByteReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self {
            ByteReader::WebSocket(ws) => loop {
                match ws.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Pings are answered by the library; anything else is
                    // noise we skip.
                    Some(Ok(_)) => continue,
                }
            },
            ByteReader::H2 { body, flow } => match body.data().await {
                None => Ok(None),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(data)) => {
                    let _ = flow.release_capacity(data.len());
                    Ok(Some(data))
                }
            },
        }
    }
}

/// Raw byte sink per backend.
pub(crate) enum ByteWriter {
    WebSocket(futures::stream::SplitSink<websocket::WsStream, Message>),
    H2(::h2::SendStream<Bytes>),
}

impl ByteWriter {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        match self {
            ByteWriter::WebSocket(sink) => sink.send(Message::Binary(data)).await.map_err(Into::into),
            ByteWriter::H2(send) => h2::send_all(send, data).await,
        }
    }

    async fn close(&mut self) {
        match self {
            ByteWriter::WebSocket(sink) => {
                let _ = sink.send(Message::Close(None)).await;
            }
            ByteWriter::H2(send) => {
                let _ = send.send_data(Bytes::new(), true);
            }
        }
    }
}

/// Dial one configured peer. The caller owns retries and backoff.
pub async fn dial(peer: &PeerSettings) -> Result<Link, TransportError> {
    match peer.transport {
        TransportKind::Quic => quic::dial(peer).await,
        TransportKind::H2 => h2::dial(peer).await,
        TransportKind::WebSocket => websocket::dial(peer).await,
    }
}

/// Bind one configured listener.
pub async fn bind(listener: &ListenerSettings) -> Result<BoundListener, AgentError> {
    match listener.transport {
        TransportKind::Quic => quic::bind(listener).await,
        TransportKind::H2 | TransportKind::WebSocket => {
            let addr: SocketAddr = listener
                .address
                .parse()
                .expect("validated: listener address parses");
            let tcp = TcpListener::bind(addr)
                .await
                .map_err(|e| AgentError::Bind { addr: listener.address.clone(), source: e })?;
            let acceptor = if listener.plaintext {
                None
            } else {
                let alpn: &[&[u8]] = match listener.transport {
                    TransportKind::H2 => &[tls::ALPN_H2],
                    _ => &[],
                };
                let config = tls::server_config(&listener.tls, alpn)?;
                Some(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
            };
            Ok(BoundListener::Tcp {
                listener: tcp,
                setup: Arc::new(ServerSetup {
                    kind: listener.transport,
                    tls: acceptor,
                    path: listener.path.clone(),
                }),
            })
        }
    }
}

/// Accept-side configuration shared by every connection of one listener.
pub struct ServerSetup {
    pub kind: TransportKind,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
    pub path: String,
}

/// A bound listener, one per configured listen address.
pub enum BoundListener {
    Quic(quinn::Endpoint),
    Tcp { listener: TcpListener, setup: Arc<ServerSetup> },
}

impl BoundListener {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundListener::Quic(ep) => ep.local_addr().ok(),
            BoundListener::Tcp { listener, .. } => listener.local_addr().ok(),
        }
    }

    /// Wait for the next inbound connection attempt. The returned value
    /// still has its transport handshake ahead of it; run
    /// [`IncomingConn::establish`] in its own task so one slow client cannot
    /// stall the accept loop.
    pub async fn accept(&mut self) -> Result<IncomingConn, TransportError> {
        match self {
            BoundListener::Quic(ep) => match ep.accept().await {
                Some(incoming) => Ok(IncomingConn::Quic(incoming)),
                None => Err(TransportError::Closed),
            },
            BoundListener::Tcp { listener, setup } => {
                let (stream, remote) = listener.accept().await?;
                Ok(IncomingConn::Tcp { stream, remote, setup: setup.clone() })
            }
        }
    }
}

/// One accepted connection, pre-handshake.
pub enum IncomingConn {
    Quic(quinn::Incoming),
    Tcp { stream: TcpStream, remote: SocketAddr, setup: Arc<ServerSetup> },
}

impl IncomingConn {
    /// Finish the transport-level handshake and produce a [`Link`].
    pub async fn establish(self) -> Result<Link, TransportError> {
        match self {
            IncomingConn::Quic(incoming) => {
                let conn = incoming.await.map_err(|e| TransportError::Quic(e.to_string()))?;
                Ok(Link::Quic(QuicLink::new(conn)))
            }
            IncomingConn::Tcp { stream, remote, setup } => {
                stream.set_nodelay(true)?;
                let io = match &setup.tls {
                    Some(acceptor) => {
                        tls::TcpOrTls::ServerTls(Box::new(acceptor.accept(stream).await?))
                    }
                    None => tls::TcpOrTls::Plain(stream),
                };
                match setup.kind {
                    TransportKind::H2 => h2::establish_server(io, remote, &setup.path).await,
                    TransportKind::WebSocket => {
                        websocket::establish_server(io, remote, &setup.path).await
                    }
                    TransportKind::Quic => unreachable!("quic never reaches the tcp acceptor"),
                }
            }
        }
    }
}
