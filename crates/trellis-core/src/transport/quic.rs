//! QUIC backend built on quinn.
//!
//! Virtual streams map one-to-one onto native QUIC bidirectional streams:
//! per-stream flow control and fairness come from the transport, so the
//! peer-connection writer never has to schedule between streams here. The
//! first bidirectional stream opened by the dialer is the control channel
//! (stream id 0 frames).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tokio::net::lookup_host;

use crate::config::{ListenerSettings, PeerSettings};
use crate::error::{AgentError, TransportError};
use trellis_proto::Frame;

use super::tls;
use super::{BoundListener, Link};

/// Upper bound for one ordered read off a QUIC stream.
const READ_CHUNK: usize = 32 * 1024;

fn quic_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Quic(e.to_string())
}

/// One QUIC connection to a peer.
#[derive(Clone)]
pub struct QuicLink {
    conn: quinn::Connection,
}

impl QuicLink {
    pub(crate) fn new(conn: quinn::Connection) -> Self {
        QuicLink { conn }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Open a fresh bidirectional channel for one virtual stream (or, first
    /// of all on the dialer side, the control channel).
    pub async fn open_channel(&self) -> Result<FrameChannel, TransportError> {
        let (send, recv) = self.conn.open_bi().await.map_err(quic_err)?;
        Ok(FrameChannel::new(send, recv))
    }

    /// Accept the next channel the peer opened.
    pub async fn accept_channel(&self) -> Result<FrameChannel, TransportError> {
        let (send, recv) = self.conn.accept_bi().await.map_err(quic_err)?;
        Ok(FrameChannel::new(send, recv))
    }

    pub fn close(&self) {
        self.conn.close(0u32.into(), b"teardown");
    }
}

/// One native QUIC stream carrying frames.
pub struct FrameChannel {
    pub tx: ChannelTx,
    pub rx: ChannelRx,
}

impl FrameChannel {
    fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        FrameChannel {
            tx: ChannelTx { send },
            rx: ChannelRx { recv, buf: BytesMut::with_capacity(READ_CHUNK) },
        }
    }
}

pub struct ChannelTx {
    send: quinn::SendStream,
}

impl ChannelTx {
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.send.write_all(&frame.encode()).await.map_err(quic_err)
    }

    /// Signal that no more frames will be written on this channel.
    pub fn finish(&mut self) {
        let _ = self.send.finish();
    }
}

pub struct ChannelRx {
    recv: quinn::RecvStream,
    buf: BytesMut,
}

impl ChannelRx {
    /// Next frame on this channel, or `None` once the peer finished it.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            match self.recv.read_chunk(READ_CHUNK, true).await.map_err(quic_err)? {
                Some(chunk) => self.buf.extend_from_slice(&chunk.bytes),
                None if self.buf.is_empty() => return Ok(None),
                None => return Err(TransportError::Closed),
            }
        }
    }
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    // Liveness is the keepalive protocol's job; QUIC must not race it.
    config.max_idle_timeout(None);
    // Room for the per-peer stream cap plus the control channel.
    config.max_concurrent_bidi_streams(quinn::VarInt::from_u32(1024));
    Arc::new(config)
}

pub(super) async fn dial(peer: &PeerSettings) -> Result<Link, TransportError> {
    let (host, port) = crate::config::host_port(&peer.address)
        .ok_or_else(|| TransportError::Quic(format!("bad peer address {}", peer.address)))?;
    let addr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TransportError::Quic(format!("{} resolved to nothing", host)))?;

    let rustls_config =
        tls::client_config(&peer.tls, &[tls::ALPN_TRELLIS]).map_err(quic_err)?;
    let quic_config = QuicClientConfig::try_from(rustls_config).map_err(quic_err)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_config));
    client_config.transport_config(transport_config());

    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind)?;
    endpoint.set_default_client_config(client_config);

    let server_name = match &peer.tls.server_name {
        Some(name) => name.clone(),
        None => host.to_string(),
    };
    let conn = endpoint
        .connect(addr, &server_name)
        .map_err(quic_err)?
        .await
        .map_err(quic_err)?;
    Ok(Link::Quic(QuicLink::new(conn)))
}

pub(super) async fn bind(listener: &ListenerSettings) -> Result<BoundListener, AgentError> {
    let addr: SocketAddr = listener
        .address
        .parse()
        .expect("validated: listener address parses");

    let rustls_config = tls::server_config(&listener.tls, &[tls::ALPN_TRELLIS])?;
    let quic_config = QuicServerConfig::try_from(rustls_config)
        .map_err(|e| AgentError::Tls(e.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    server_config.transport_config(transport_config());

    let endpoint = quinn::Endpoint::server(server_config, addr)
        .map_err(|e| AgentError::Bind { addr: listener.address.clone(), source: e })?;
    Ok(BoundListener::Quic(endpoint))
}
