//! WebSocket backend via tokio-tungstenite.
//!
//! Frames ride inside binary messages; the receive side feeds message bytes
//! into the shared frame decoder, so message boundaries carry no meaning.
//! Dialing optionally goes through an HTTP CONNECT proxy, in which case
//! strict TLS verification is unavailable (validated away in config).

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::WebSocketStream;

use crate::config::{PeerSettings, TransportKind};
use crate::error::TransportError;

use super::tls::{self, TcpOrTls};
use super::{ByteReader, ByteWriter, FrameReader, FrameWriter, Link, SharedLink};

pub(crate) type WsStream = WebSocketStream<TcpOrTls>;

fn ws_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::WebSocket(e.to_string())
}

pub(super) async fn dial(peer: &PeerSettings) -> Result<Link, TransportError> {
    let (host, port) = crate::config::host_port(&peer.address)
        .ok_or_else(|| TransportError::WebSocket(format!("bad peer address {}", peer.address)))?;

    let tcp = match &peer.proxy {
        Some(proxy) => connect_via_proxy(proxy, host, port).await?,
        None => TcpStream::connect((host, port)).await?,
    };
    tcp.set_nodelay(true)?;

    let io = if peer.plaintext {
        TcpOrTls::Plain(tcp)
    } else {
        let config = tls::client_config(&peer.tls, &[]).map_err(ws_err)?;
        let connector = TlsConnector::from(Arc::new(config));
        let name = tls::server_name(&peer.tls, host).map_err(ws_err)?;
        TcpOrTls::ClientTls(Box::new(connector.connect(name, tcp).await?))
    };

    // TLS is already layered underneath; the URL only shapes the request.
    let url = format!("ws://{}{}", peer.address, peer.path);
    let (ws, _response) = tokio_tungstenite::client_async(url, io).await?;
    Ok(link_from(ws, peer.address.clone()))
}

pub(super) async fn establish_server(
    io: TcpOrTls,
    remote: SocketAddr,
    path: &str,
) -> Result<Link, TransportError> {
    let expected = path.to_string();
    let check_path = move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut reject = ErrorResponse::new(None);
            *reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            Err(reject)
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(io, check_path).await?;
    Ok(link_from(ws, remote.to_string()))
}

fn link_from(ws: WsStream, remote: String) -> Link {
    let (sink, stream) = ws.split();
    Link::Shared(SharedLink {
        kind: TransportKind::WebSocket,
        remote,
        reader: FrameReader::new(ByteReader::WebSocket(stream)),
        writer: FrameWriter::new(ByteWriter::WebSocket(sink)),
    })
}

/// Open a tunnel through an HTTP CONNECT proxy.
async fn connect_via_proxy(
    proxy: &str,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    let (proxy_host, proxy_port) = crate::config::host_port(proxy)
        .ok_or_else(|| TransportError::WebSocket(format!("bad proxy address {}", proxy)))?;
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n",
    );
    stream.write_all(connect.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 4096 {
            return Err(TransportError::WebSocket("oversized proxy response".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::WebSocket("proxy closed during CONNECT".into()));
        }
        response.push(byte[0]);
    }
    let status_line = response.split(|&b| b == b'\r').next().unwrap_or(&[]);
    let status_line = String::from_utf8_lossy(status_line);
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !ok {
        return Err(TransportError::WebSocket(format!(
            "proxy refused CONNECT: {}",
            status_line.trim()
        )));
    }
    Ok(stream)
}
