//! HTTP/2 backend.
//!
//! One long-lived POST request per peer link: the request body carries
//! frames dialer-to-acceptor, the response body carries them back. The h2
//! connection task is spawned here and any additional request on the same
//! connection is refused.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use h2::client;
use h2::server;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{PeerSettings, TransportKind};
use crate::error::TransportError;

use super::tls::{self, TcpOrTls};
use super::{ByteReader, ByteWriter, FrameReader, FrameWriter, Link, SharedLink};

fn h2_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::H2(e.to_string())
}

/// Write a whole buffer, waiting for window capacity as h2 grants it.
pub(super) async fn send_all(
    send: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
) -> Result<(), TransportError> {
    while !data.is_empty() {
        send.reserve_capacity(data.len());
        let granted = futures::future::poll_fn(|cx| send.poll_capacity(cx))
            .await
            .ok_or(TransportError::Closed)?;
        let granted = granted.map_err(h2_err)?;
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        send.send_data(chunk, false).map_err(h2_err)?;
    }
    Ok(())
}

pub(super) async fn dial(peer: &PeerSettings) -> Result<Link, TransportError> {
    let (host, port) = crate::config::host_port(&peer.address)
        .ok_or_else(|| TransportError::H2(format!("bad peer address {}", peer.address)))?;
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;

    let io = if peer.plaintext {
        TcpOrTls::Plain(tcp)
    } else {
        let config = tls::client_config(&peer.tls, &[tls::ALPN_H2]).map_err(h2_err)?;
        let connector = TlsConnector::from(Arc::new(config));
        let name = tls::server_name(&peer.tls, host).map_err(h2_err)?;
        TcpOrTls::ClientTls(Box::new(connector.connect(name, tcp).await?))
    };

    let (send_request, connection) = client::handshake(io).await.map_err(h2_err)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "h2 connection task ended");
        }
    });
    let mut send_request = send_request.ready().await.map_err(h2_err)?;

    let scheme = if peer.plaintext { "http" } else { "https" };
    let uri = format!("{}://{}{}", scheme, peer.address, peer.path);
    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .body(())
        .map_err(h2_err)?;
    let (response, send_stream) = send_request.send_request(request, false).map_err(h2_err)?;
    let response = response.await.map_err(h2_err)?;
    if response.status() != http::StatusCode::OK {
        return Err(TransportError::H2(format!(
            "peer answered {} on {}",
            response.status(),
            peer.path
        )));
    }
    let mut body = response.into_body();
    let flow = body.flow_control().clone();

    Ok(Link::Shared(SharedLink {
        kind: TransportKind::H2,
        remote: peer.address.clone(),
        reader: FrameReader::new(ByteReader::H2 { body, flow }),
        writer: FrameWriter::new(ByteWriter::H2(send_stream)),
    }))
}

pub(super) async fn establish_server(
    io: TcpOrTls,
    remote: SocketAddr,
    path: &str,
) -> Result<Link, TransportError> {
    let mut conn = server::handshake(io).await.map_err(h2_err)?;
    let (request, mut respond) = match conn.accept().await {
        Some(result) => result.map_err(h2_err)?,
        None => return Err(TransportError::Closed),
    };

    if request.method() != http::Method::POST || request.uri().path() != path {
        let reply = http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .body(())
            .expect("static response");
        let _ = respond.send_response(reply, true);
        return Err(TransportError::H2(format!(
            "{} requested {} {}",
            remote,
            request.method(),
            request.uri().path()
        )));
    }

    let mut body = request.into_body();
    let flow = body.flow_control().clone();
    let reply = http::Response::builder()
        .status(http::StatusCode::OK)
        .body(())
        .expect("static response");
    let send_stream = respond.send_response(reply, false).map_err(h2_err)?;

    // Keep the connection driven; a peer link is exactly one request, so
    // anything further is refused.
    tokio::spawn(async move {
        while let Some(next) = conn.accept().await {
            match next {
                Ok((_, mut extra)) => {
                    let reply = http::Response::builder()
                        .status(http::StatusCode::CONFLICT)
                        .body(())
                        .expect("static response");
                    let _ = extra.send_response(reply, true);
                }
                Err(e) => {
                    debug!(error = %e, "h2 server connection ended");
                    break;
                }
            }
        }
    });

    Ok(Link::Shared(SharedLink {
        kind: TransportKind::H2,
        remote: remote.to_string(),
        reader: FrameReader::new(ByteReader::H2 { body, flow }),
        writer: FrameWriter::new(ByteWriter::H2(send_stream)),
    }))
}
