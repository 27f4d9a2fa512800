//! Exit handler: the agent that opens real sockets.
//!
//! A STREAM_OPEN whose path is empty lands here. The target must be
//! authorized against what this exit advertises (CIDRs for addresses,
//! domain patterns for names; a domain route is authorization by itself).
//! TCP targets get a dial with timeout, UDP targets a connected relay
//! socket, ICMP echo targets an unprivileged ping socket. Nagle is off on
//! every socket this module touches; keystroke traffic hates it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::agent::EngineCtx;
use crate::peer::{PeerHandle, StreamTx};
use crate::relay::{relay_stream, DatagramFramer};
use crate::stream::{exit_endpoint, open_err_frame, StreamReadHalf, StreamWriteHalf};
use trellis_proto::{
    BoundAddr, Frame, FrameFlags, FramePayload, StreamErrorCode, StreamOpen, StreamOpenAck,
    TargetAddr, TargetHost, TargetProto,
};

/// Entry point from the stream manager. The caller reserved one stream
/// slot for `peer`; every early return below must release it.
pub async fn handle_exit_open(ctx: Arc<EngineCtx>, peer: PeerHandle, stream_id: u64, open: StreamOpen) {
    let Ok(tx) = peer.reply_handle(stream_id).await else {
        ctx.streams.release(&peer.id());
        return;
    };

    let outcome = match open.target.proto {
        TargetProto::Tcp => exit_tcp(&ctx, &peer, stream_id, &open, &tx).await,
        TargetProto::Udp => exit_udp(&ctx, &peer, stream_id, &open, &tx).await,
        TargetProto::IcmpEcho => exit_icmp(&ctx, &peer, stream_id, &open, &tx).await,
    };

    if let Err((code, message)) = outcome {
        debug!(
            peer = %peer.id().short(),
            target = %open.target,
            code = %code,
            "refusing exit stream"
        );
        let _ = tx
            .send(open_err_frame(stream_id, open.request_id, code, message))
            .await;
        ctx.streams.release(&peer.id());
        peer.unregister_stream(stream_id);
    }
}

type ExitResult = Result<(), (StreamErrorCode, &'static str)>;

async fn exit_tcp(
    ctx: &Arc<EngineCtx>,
    peer: &PeerHandle,
    stream_id: u64,
    open: &StreamOpen,
    tx: &StreamTx,
) -> ExitResult {
    let upstream = dial_authorized(ctx, &open.target)
        .await
        .map_err(|code| (code, "dial failed"))?;
    let bound = upstream
        .peer_addr()
        .map(BoundAddr::from_socket)
        .unwrap_or(BoundAddr { host: TargetHost::V4(Ipv4Addr::UNSPECIFIED), port: 0 });

    let (read, write, public) = exit_endpoint(ctx, peer, stream_id, tx.clone(), &open.ephemeral_pub);
    send_ack(tx, stream_id, open.request_id, bound, public).await;
    info!(
        peer = %peer.id().short(),
        target = %open.target,
        "exit stream established"
    );

    tokio::spawn(relay_stream(upstream, read, write));
    Ok(())
}

async fn exit_udp(
    ctx: &Arc<EngineCtx>,
    peer: &PeerHandle,
    stream_id: u64,
    open: &StreamOpen,
    tx: &StreamTx,
) -> ExitResult {
    let ip = authorize(ctx, &open.target)
        .await
        .map_err(|code| (code, "target not authorized"))?;
    let bind: SocketAddr = if ip.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|_| (StreamErrorCode::NetworkUnreachable, "udp bind failed"))?;
    socket
        .connect((ip, open.target.port))
        .await
        .map_err(|_| (StreamErrorCode::HostUnreachable, "udp connect failed"))?;
    let bound = socket
        .local_addr()
        .map(BoundAddr::from_socket)
        .unwrap_or(BoundAddr { host: TargetHost::V4(Ipv4Addr::UNSPECIFIED), port: 0 });

    let (read, write, public) = exit_endpoint(ctx, peer, stream_id, tx.clone(), &open.ephemeral_pub);
    send_ack(tx, stream_id, open.request_id, bound, public).await;
    info!(peer = %peer.id().short(), target = %open.target, "udp exit relay established");

    let socket = Arc::new(socket);
    tokio::spawn(udp_pump_out(read, socket.clone()));
    tokio::spawn(udp_pump_in(write, socket));
    Ok(())
}

/// stream → destination socket.
async fn udp_pump_out(mut read: StreamReadHalf, socket: Arc<UdpSocket>) {
    let mut framer = DatagramFramer::default();
    loop {
        match read.recv().await {
            Ok(Some(chunk)) => {
                framer.push(&chunk);
                while let Some(datagram) = framer.next() {
                    if socket.send(&datagram).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

/// destination socket → stream.
async fn udp_pump_in(mut write: StreamWriteHalf, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if write.send(&DatagramFramer::frame(&buf[..n])).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                write.close_write().await;
                return;
            }
        }
    }
}

async fn exit_icmp(
    ctx: &Arc<EngineCtx>,
    peer: &PeerHandle,
    stream_id: u64,
    open: &StreamOpen,
    tx: &StreamTx,
) -> ExitResult {
    let ip = authorize(ctx, &open.target)
        .await
        .map_err(|code| (code, "target not authorized"))?;
    let socket = icmp_socket(ip).map_err(|_| (StreamErrorCode::NetworkUnreachable, "icmp socket"))?;
    let bound = BoundAddr { host: ip.into(), port: 0 };

    let (read, write, public) = exit_endpoint(ctx, peer, stream_id, tx.clone(), &open.ephemeral_pub);
    send_ack(tx, stream_id, open.request_id, bound, public).await;
    info!(peer = %peer.id().short(), target = %ip, "icmp echo stream established");

    let socket = Arc::new(socket);
    tokio::spawn(icmp_pump_out(read, socket.clone(), ip.is_ipv4()));
    tokio::spawn(icmp_pump_in(write, socket, ip.is_ipv4()));
    Ok(())
}

/// stream records → echo requests.
async fn icmp_pump_out(mut read: StreamReadHalf, socket: Arc<UdpSocket>, v4: bool) {
    let mut framer = DatagramFramer::default();
    let mut sequence: u16 = 0;
    loop {
        match read.recv().await {
            Ok(Some(chunk)) => {
                framer.push(&chunk);
                while let Some(payload) = framer.next() {
                    let packet = echo_request(v4, sequence, &payload);
                    sequence = sequence.wrapping_add(1);
                    if socket.send(&packet).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

/// echo replies → stream records.
async fn icmp_pump_in(mut write: StreamWriteHalf, socket: Arc<UdpSocket>, v4: bool) {
    let reply_type: u8 = if v4 { 0 } else { 129 };
    let mut buf = vec![0u8; 65_536];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) if n >= 8 && buf[0] == reply_type => {
                let payload = &buf[8..n];
                if write.send(&DatagramFramer::frame(payload)).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(_) => {
                write.close_write().await;
                return;
            }
        }
    }
}

async fn send_ack(tx: &StreamTx, stream_id: u64, request_id: u64, bound: BoundAddr, public: [u8; 32]) {
    let ack = Frame {
        stream_id,
        flags: FrameFlags::empty(),
        payload: FramePayload::StreamOpenAck(StreamOpenAck {
            request_id,
            bound,
            ephemeral_pub: public,
        }),
    };
    let _ = tx.send(ack).await;
}

/// Resolve (if needed) and authorize a target against the advertised route
/// set. Returns the address to dial.
async fn authorize(ctx: &EngineCtx, target: &TargetAddr) -> Result<IpAddr, StreamErrorCode> {
    if !ctx.settings.exit.enabled {
        return Err(StreamErrorCode::ExitDisabled);
    }
    let cidrs = ctx.settings.exit_cidrs();
    match &target.host {
        TargetHost::Domain(name) => {
            let by_pattern = domain_matches(&ctx.settings.exit.domain_patterns, name);
            let resolved = lookup_host((name.as_str(), target.port))
                .await
                .map_err(|_| StreamErrorCode::DnsError)?
                .next()
                .ok_or(StreamErrorCode::DnsError)?
                .ip();
            if by_pattern || cidrs.iter().any(|net| net.contains(&resolved)) {
                Ok(resolved)
            } else {
                Err(StreamErrorCode::ExitDisabled)
            }
        }
        host => {
            let ip = host.as_ip().expect("non-domain host is an address");
            if cidrs.iter().any(|net| net.contains(&ip)) {
                Ok(ip)
            } else {
                Err(StreamErrorCode::ExitDisabled)
            }
        }
    }
}

/// Dial a TCP target after authorization, with the configured timeout and
/// Nagle disabled.
pub async fn dial_authorized(ctx: &EngineCtx, target: &TargetAddr) -> Result<TcpStream, StreamErrorCode> {
    let ip = authorize(ctx, target).await?;
    let deadline = Duration::from_secs(ctx.settings.exit.dial_timeout);
    let stream = match timeout(deadline, TcpStream::connect((ip, target.port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(map_dial_error(&e)),
        Err(_) => return Err(StreamErrorCode::ConnectionTimeout),
    };
    stream.set_nodelay(true).map_err(|e| map_dial_error(&e))?;
    Ok(stream)
}

/// Local UDP flow for the ingress's local-exit shortcut: datagrams go
/// straight between the client-facing relay socket and a connected socket.
pub async fn udp_flow_local(
    ctx: &EngineCtx,
    target: &TargetAddr,
    reply_socket: Arc<UdpSocket>,
    client: SocketAddr,
) -> Result<tokio::sync::mpsc::Sender<Vec<u8>>, StreamErrorCode> {
    let ip = authorize(ctx, target).await?;
    let bind: SocketAddr = if ip.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|_| StreamErrorCode::NetworkUnreachable)?;
    socket
        .connect((ip, target.port))
        .await
        .map_err(|_| StreamErrorCode::HostUnreachable)?;
    let socket = Arc::new(socket);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
    let out_socket = socket.clone();
    tokio::spawn(async move {
        while let Some(datagram) = rx.recv().await {
            if out_socket.send(&datagram).await.is_err() {
                return;
            }
        }
    });
    let reply_target = target.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        while let Ok(n) = socket.recv(&mut buf).await {
            let packet = crate::socks::udp_reply_packet(&reply_target, &buf[..n]);
            if reply_socket.send_to(&packet, client).await.is_err() {
                return;
            }
        }
    });
    Ok(tx)
}

fn map_dial_error(e: &io::Error) -> StreamErrorCode {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => StreamErrorCode::ConnectionRefused,
        io::ErrorKind::TimedOut => StreamErrorCode::ConnectionTimeout,
        io::ErrorKind::HostUnreachable => StreamErrorCode::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => StreamErrorCode::NetworkUnreachable,
        _ => StreamErrorCode::HostUnreachable,
    }
}

/// Single-label wildcard and exact matching for advertised patterns.
fn domain_matches(patterns: &[String], name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => name
                .split_once('.')
                .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
            None => name == pattern,
        }
    })
}

/// Unprivileged ICMP echo socket, connected to the target.
fn icmp_socket(ip: IpAddr) -> io::Result<UdpSocket> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(true)?;
    socket.connect(&SocketAddr::new(ip, 0).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Build one echo request; the kernel rewrites the identifier on ping
/// sockets, v6 checksums are kernel-computed as well.
fn echo_request(v4: bool, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(if v4 { 8 } else { 128 });
    packet.push(0);
    packet.extend_from_slice(&[0, 0]); // checksum
    packet.extend_from_slice(&[0, 0]); // identifier
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);
    if v4 {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_pattern_matching() {
        let patterns = vec!["api.corp.local".to_string(), "*.example.com".to_string()];
        assert!(domain_matches(&patterns, "api.corp.local"));
        assert!(domain_matches(&patterns, "API.CORP.LOCAL."));
        assert!(domain_matches(&patterns, "a.example.com"));
        assert!(!domain_matches(&patterns, "example.com"));
        assert!(!domain_matches(&patterns, "a.b.example.com"));
        assert!(!domain_matches(&patterns, "other.corp.local"));
    }

    #[test]
    fn dial_error_mapping() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(map_dial_error(&refused), StreamErrorCode::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(map_dial_error(&timed_out), StreamErrorCode::ConnectionTimeout);
        let host = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(map_dial_error(&host), StreamErrorCode::HostUnreachable);
        let net = io::Error::from(io::ErrorKind::NetworkUnreachable);
        assert_eq!(map_dial_error(&net), StreamErrorCode::NetworkUnreachable);
        let other = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(map_dial_error(&other), StreamErrorCode::HostUnreachable);
    }

    #[test]
    fn echo_request_checksum_verifies() {
        let packet = echo_request(true, 7, b"ping-payload");
        assert_eq!(packet[0], 8);
        assert_eq!(&packet[6..8], &7u16.to_be_bytes());
        // Recomputing over the whole packet (checksum included) yields zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn v6_echo_leaves_checksum_to_kernel() {
        let packet = echo_request(false, 1, b"x");
        assert_eq!(packet[0], 128);
        assert_eq!(&packet[2..4], &[0, 0]);
    }
}
