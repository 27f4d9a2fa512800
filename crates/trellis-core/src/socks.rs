//! SOCKS5 ingress: greeting, authentication, CONNECT and UDP ASSOCIATE.
//!
//! Each client connection resolves a route (domain table first for names,
//! longest-prefix match otherwise), opens a stream through the mesh and
//! relays until either side closes. Stream-open failures map onto SOCKS5
//! reply codes; when this agent is itself the exit for the destination the
//! mesh is skipped entirely.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agent::EngineCtx;
use crate::relay::{relay_stream, DatagramFramer};
use crate::route::RouteMatch;
use crate::stream::{open_endpoint_stream, OpenedStream};
use crate::exit;
use trellis_proto::{BoundAddr, StreamErrorCode, TargetAddr, TargetHost, TargetProto};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Accept loop. Owns the listener for the lifetime of the agent.
pub async fn run(ctx: Arc<EngineCtx>, listener: TcpListener) {
    let permits = Arc::new(Semaphore::new(ctx.settings.socks5.max_connections));
    let mut shutdown = ctx.shutdown.subscribe();
    info!(
        address = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "socks5 ingress listening"
    );
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, client)) => {
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        debug!(%client, "socks5 connection limit reached");
                        continue;
                    };
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_client(ctx, stream, client).await {
                            debug!(%client, error = %e, "socks5 session ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "socks5 accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn handle_client(
    ctx: Arc<EngineCtx>,
    mut stream: TcpStream,
    client: SocketAddr,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    greet(&ctx, &mut stream).await?;

    let (command, target) = read_request(&mut stream).await?;
    match command {
        CMD_CONNECT => connect(&ctx, stream, client, target).await,
        CMD_UDP_ASSOCIATE => udp_associate(&ctx, stream, client).await,
        _ => {
            reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, None).await?;
            Ok(())
        }
    }
}

/// Method negotiation and, when configured, username/password
/// subnegotiation against the stored bcrypt hashes.
async fn greet<S>(ctx: &EngineCtx, stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(bad_proto("not socks5"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let want = if ctx.settings.socks5.auth.enabled { AUTH_USERPASS } else { AUTH_NONE };
    if !methods.contains(&want) {
        stream.write_all(&[SOCKS_VERSION, AUTH_UNACCEPTABLE]).await?;
        return Err(bad_proto("no acceptable auth method"));
    }
    stream.write_all(&[SOCKS_VERSION, want]).await?;

    if want == AUTH_USERPASS {
        // RFC 1929 subnegotiation.
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != 0x01 {
            return Err(bad_proto("bad auth subnegotiation version"));
        }
        let mut uname = vec![0u8; head[1] as usize];
        stream.read_exact(&mut uname).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut passwd = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut passwd).await?;

        let name = String::from_utf8_lossy(&uname);
        let ok = ctx
            .settings
            .socks5
            .auth
            .users
            .iter()
            .find(|u| u.name == name)
            .map(|u| bcrypt::verify(&passwd, &u.bcrypt_hash).unwrap_or(false))
            .unwrap_or(false);
        if !ok {
            stream.write_all(&[0x01, 0x01]).await?;
            return Err(bad_proto("authentication failed"));
        }
        stream.write_all(&[0x01, 0x00]).await?;
    }
    Ok(())
}

/// Parse the request line into `(command, target)`.
async fn read_request<S>(stream: &mut S) -> std::io::Result<(u8, TargetAddr)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(bad_proto("not socks5"));
    }
    let command = head[1];

    let host = match head[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetHost::V4(addr.into())
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetHost::V6(addr.into())
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| bad_proto("bad domain"))?;
            TargetHost::Domain(name)
        }
        _ => {
            let _ = reply(stream, REP_ADDRESS_NOT_SUPPORTED, None).await;
            return Err(bad_proto("unknown address type"));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((command, TargetAddr::tcp(host, u16::from_be_bytes(port))))
}

/// Route resolution for one target: domain table first for names with a
/// local-resolution fallback into the CIDR tables.
///
/// Returns the match plus the target to put on the wire (the resolved IP
/// when the name had no domain route).
pub(crate) async fn resolve_route(
    ctx: &EngineCtx,
    target: &TargetAddr,
) -> Result<(RouteMatch, TargetAddr), StreamErrorCode> {
    match &target.host {
        TargetHost::Domain(name) => {
            if let Some(found) = ctx.routes.lookup_domain(name) {
                return Ok((found, target.clone()));
            }
            // No domain route: resolve here and fall back to LPM.
            let resolved = lookup_host((name.as_str(), target.port))
                .await
                .map_err(|_| StreamErrorCode::DnsError)?
                .next()
                .ok_or(StreamErrorCode::DnsError)?;
            let found = ctx
                .routes
                .lookup_ip(resolved.ip())
                .ok_or(StreamErrorCode::NoRoute)?;
            let target = TargetAddr {
                host: resolved.ip().into(),
                port: target.port,
                proto: target.proto,
            };
            Ok((found, target))
        }
        host => {
            let ip = host.as_ip().expect("non-domain host is an address");
            let found = ctx.routes.lookup_ip(ip).ok_or(StreamErrorCode::NoRoute)?;
            Ok((found, target.clone()))
        }
    }
}

async fn connect(
    ctx: &Arc<EngineCtx>,
    mut stream: TcpStream,
    client: SocketAddr,
    target: TargetAddr,
) -> std::io::Result<()> {
    let (route, wire_target) = match resolve_route(ctx, &target).await {
        Ok(found) => found,
        Err(code) => {
            debug!(%client, target = %target, code = %code, "no route for connect");
            reply(&mut stream, code.socks_reply(), None).await?;
            return Ok(());
        }
    };

    // This agent advertises the destination itself: dial directly.
    if route.exit == ctx.local_id {
        return connect_local(ctx, stream, client, wire_target).await;
    }

    match open_endpoint_stream(ctx, &route, wire_target.clone()).await {
        Ok(OpenedStream { bound, read, write }) => {
            info!(
                %client,
                target = %wire_target,
                exit = %route.exit.short(),
                "connect established"
            );
            reply(&mut stream, REP_SUCCESS, Some(&bound)).await?;
            relay_stream(stream, read, write).await;
            Ok(())
        }
        Err(code) => {
            debug!(%client, target = %wire_target, code = %code, "connect failed");
            reply(&mut stream, code.socks_reply(), None).await?;
            Ok(())
        }
    }
}

/// Local-exit shortcut: no mesh hop, no E2E layer, one socket to another.
async fn connect_local(
    ctx: &Arc<EngineCtx>,
    mut stream: TcpStream,
    client: SocketAddr,
    target: TargetAddr,
) -> std::io::Result<()> {
    match exit::dial_authorized(ctx, &target).await {
        Ok(mut upstream) => {
            let bound = upstream
                .local_addr()
                .map(BoundAddr::from_socket)
                .unwrap_or(BoundAddr { host: TargetHost::V4(Ipv4Addr::UNSPECIFIED), port: 0 });
            info!(%client, target = %target, "connect established via local exit");
            reply(&mut stream, REP_SUCCESS, Some(&bound)).await?;
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            Ok(())
        }
        Err(code) => {
            reply(&mut stream, code.socks_reply(), None).await?;
            Ok(())
        }
    }
}

/// One UDP flow through the mesh, keyed by client source and destination.
struct UdpFlow {
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
}

async fn udp_associate(
    ctx: &Arc<EngineCtx>,
    mut stream: TcpStream,
    client: SocketAddr,
) -> std::io::Result<()> {
    // Bind the relay socket next to the TCP listener address.
    let bind_ip = stream
        .local_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let socket = Arc::new(UdpSocket::bind((bind_ip, 0)).await?);
    let bound = socket.local_addr()?;
    reply(&mut stream, REP_SUCCESS, Some(&BoundAddr::from_socket(bound))).await?;
    info!(%client, relay = %bound, "udp associate established");

    let relay = tokio::spawn(udp_relay(ctx.clone(), socket, client));

    // The association lives exactly as long as the TCP control connection.
    let mut sink = [0u8; 64];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    relay.abort();
    debug!(%client, "udp associate closed");
    Ok(())
}

async fn udp_relay(ctx: Arc<EngineCtx>, socket: Arc<UdpSocket>, client: SocketAddr) {
    let mut flows: HashMap<(SocketAddr, TargetHost, u16), UdpFlow> = HashMap::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(_) => return,
        };
        // Only the associating client feeds this relay.
        if from.ip() != client.ip() {
            continue;
        }
        let Some((target, payload)) = parse_udp_request(&buf[..n]) else {
            continue;
        };

        let key = (from, target.host.clone(), target.port);
        let mut flow_gone = false;
        if let Some(flow) = flows.get(&key) {
            if flow.tx.send(payload.to_vec()).await.is_ok() {
                continue;
            }
            flow_gone = true;
        }
        if flow_gone {
            flows.remove(&key);
        }

        let Ok((route, wire_target)) = resolve_route(&ctx, &target).await else {
            continue;
        };
        if route.exit == ctx.local_id {
            // Local exit: relay straight onto a connected socket.
            match exit::udp_flow_local(&ctx, &wire_target, socket.clone(), from).await {
                Ok(tx) => {
                    let _ = tx.send(payload.to_vec()).await;
                    flows.insert(key, UdpFlow { tx });
                }
                Err(code) => debug!(target = %target, code = %code, "local udp flow refused"),
            }
            continue;
        }
        match open_udp_flow(&ctx, route, wire_target, socket.clone(), from, target.clone()).await {
            Ok(tx) => {
                let _ = tx.send(payload.to_vec()).await;
                flows.insert(key, UdpFlow { tx });
            }
            Err(code) => debug!(target = %target, code = %code, "udp flow refused"),
        }
    }
}

/// Open one UDP stream through the mesh and wire both pump directions.
async fn open_udp_flow(
    ctx: &Arc<EngineCtx>,
    route: RouteMatch,
    wire_target: TargetAddr,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    reply_target: TargetAddr,
) -> Result<tokio::sync::mpsc::Sender<Vec<u8>>, StreamErrorCode> {
    let udp_target = TargetAddr {
        host: wire_target.host,
        port: wire_target.port,
        proto: TargetProto::Udp,
    };
    let opened = open_endpoint_stream(ctx, &route, udp_target).await?;
    let OpenedStream { mut read, mut write, .. } = opened;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
    // client → mesh
    tokio::spawn(async move {
        while let Some(datagram) = rx.recv().await {
            if write.send(&DatagramFramer::frame(&datagram)).await.is_err() {
                return;
            }
        }
        write.close_write().await;
    });
    // mesh → client
    tokio::spawn(async move {
        let mut framer = DatagramFramer::default();
        loop {
            match read.recv().await {
                Ok(Some(chunk)) => {
                    framer.push(&chunk);
                    while let Some(datagram) = framer.next() {
                        let packet = udp_reply_packet(&reply_target, &datagram);
                        if socket.send_to(&packet, client).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    });
    Ok(tx)
}

/// Parse one RFC 1928 UDP request header. Fragmented datagrams are dropped.
fn parse_udp_request(packet: &[u8]) -> Option<(TargetAddr, &[u8])> {
    if packet.len() < 4 || packet[0] != 0 || packet[1] != 0 {
        return None;
    }
    if packet[2] != 0 {
        // FRAG unsupported.
        return None;
    }
    let (host, rest) = match packet[3] {
        0x01 => {
            let bytes: [u8; 4] = packet.get(4..8)?.try_into().ok()?;
            (TargetHost::V4(bytes.into()), &packet[8..])
        }
        0x04 => {
            let bytes: [u8; 16] = packet.get(4..20)?.try_into().ok()?;
            (TargetHost::V6(bytes.into()), &packet[20..])
        }
        0x03 => {
            let len = *packet.get(4)? as usize;
            let name = packet.get(5..5 + len)?;
            let name = std::str::from_utf8(name).ok()?;
            (TargetHost::Domain(name.to_string()), &packet[5 + len..])
        }
        _ => return None,
    };
    if rest.len() < 2 {
        return None;
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Some((TargetAddr::udp(host, port), &rest[2..]))
}

/// Wrap a reply payload in the SOCKS5 UDP header naming its source.
pub(crate) fn udp_reply_packet(target: &TargetAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 22);
    out.extend_from_slice(&[0, 0, 0]);
    match &target.host {
        TargetHost::V4(a) => {
            out.push(0x01);
            out.extend_from_slice(&a.octets());
        }
        TargetHost::V6(a) => {
            out.push(0x04);
            out.extend_from_slice(&a.octets());
        }
        TargetHost::Domain(d) => {
            out.push(0x03);
            out.push(d.len() as u8);
            out.extend_from_slice(d.as_bytes());
        }
    }
    out.extend_from_slice(&target.port.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

async fn reply<S>(stream: &mut S, code: u8, bound: Option<&BoundAddr>) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[SOCKS_VERSION, code, 0x00]);
    match bound.map(|b| (&b.host, b.port)) {
        Some((TargetHost::V4(a), port)) => {
            out.push(0x01);
            out.extend_from_slice(&a.octets());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Some((TargetHost::V6(a), port)) => {
            out.push(0x04);
            out.extend_from_slice(&a.octets());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Some((TargetHost::Domain(d), port)) => {
            out.push(0x03);
            out.push(d.len() as u8);
            out.extend_from_slice(d.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
        None => {
            out.push(0x01);
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&out).await
}


fn bad_proto(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_request_parsing_v4() {
        let mut packet = vec![0, 0, 0, 0x01, 10, 0, 0, 1];
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(b"query");
        let (target, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(target.port, 53);
        assert_eq!(target.proto, TargetProto::Udp);
        assert_eq!(target.host, TargetHost::V4("10.0.0.1".parse().unwrap()));
        assert_eq!(payload, b"query");
    }

    #[test]
    fn udp_request_parsing_domain() {
        let mut packet = vec![0, 0, 0, 0x03, 8];
        packet.extend_from_slice(b"dns.corp");
        packet.extend_from_slice(&5353u16.to_be_bytes());
        packet.extend_from_slice(b"x");
        let (target, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(target.host, TargetHost::Domain("dns.corp".into()));
        assert_eq!(target.port, 5353);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn fragmented_udp_is_dropped() {
        let packet = [0, 0, 1, 0x01, 10, 0, 0, 1, 0, 53, 1];
        assert!(parse_udp_request(&packet).is_none());
    }

    #[test]
    fn udp_reply_roundtrips_through_parser() {
        let target = TargetAddr::udp(TargetHost::V4("192.0.2.7".parse().unwrap()), 4000);
        let packet = udp_reply_packet(&target, b"pong");
        let (parsed, payload) = parse_udp_request(&packet).unwrap();
        assert_eq!(parsed.host, target.host);
        assert_eq!(parsed.port, target.port);
        assert_eq!(payload, b"pong");
    }

    #[test]
    fn truncated_udp_headers_are_rejected() {
        assert!(parse_udp_request(&[]).is_none());
        assert!(parse_udp_request(&[0, 0, 0, 0x01, 10, 0]).is_none());
        assert!(parse_udp_request(&[0, 0, 0, 0x03, 10, b'a']).is_none());
        assert!(parse_udp_request(&[0, 0, 0, 0x09, 1, 2, 3, 4, 0, 1]).is_none());
    }
}
