//! End-to-end mesh scenarios: several in-process agents wired over real
//! sockets on loopback, driven through the SOCKS5 ingress.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::sleep;

use trellis_core::agent::Agent;
use trellis_core::config::{
    ListenerSettings, PeerSettings, Settings, TlsClientSettings, TlsServerSettings, TransportKind,
};
use trellis_core::identity::Identity;

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

fn fresh_data_dir(tag: &str) -> String {
    let n = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "trellis-mesh-{}-{}-{}",
        tag,
        std::process::id(),
        n
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir.to_string_lossy().into_owned()
}

fn base_settings(tag: &str) -> Settings {
    let mut settings = Settings::default();
    settings.agent.data_dir = fresh_data_dir(tag);
    settings
}

fn listener(kind: TransportKind) -> ListenerSettings {
    ListenerSettings {
        transport: kind,
        address: "127.0.0.1:0".into(),
        tls: TlsServerSettings::default(),
        path: "/trellis".into(),
        // TLS still covers the QUIC case; TCP transports stay plaintext so
        // the tests exercise the frame layer, not certificates.
        plaintext: kind != TransportKind::Quic,
    }
}

fn peer_of(kind: TransportKind, addr: SocketAddr) -> PeerSettings {
    PeerSettings {
        expected_agent_id: None,
        transport: kind,
        address: addr.to_string(),
        path: "/trellis".into(),
        tls: TlsClientSettings::default(),
        proxy: None,
        plaintext: kind != TransportKind::Quic,
    }
}

async fn start_agent(settings: Settings) -> Agent {
    let identity = Identity::load_or_create(&settings.agent.data_dir).expect("identity");
    Agent::start(settings, identity).await.expect("agent start")
}

/// Exit agent with one listener.
async fn start_exit(kind: TransportKind, cidrs: &[&str], domains: &[&str]) -> (Agent, SocketAddr) {
    let mut settings = base_settings("exit");
    settings.listeners.push(listener(kind));
    settings.exit.enabled = true;
    settings.exit.cidr_routes = cidrs.iter().map(|s| s.to_string()).collect();
    settings.exit.domain_patterns = domains.iter().map(|s| s.to_string()).collect();
    let agent = start_agent(settings).await;
    let addr = agent.listen_addrs()[0];
    (agent, addr)
}

/// Ingress agent dialing one peer.
async fn start_ingress(kind: TransportKind, upstream: SocketAddr) -> (Agent, SocketAddr) {
    let mut settings = base_settings("ingress");
    settings.socks5.enabled = true;
    settings.socks5.address = "127.0.0.1:0".into();
    settings.peers.push(peer_of(kind, upstream));
    let agent = start_agent(settings).await;
    let socks = agent.socks_addr().expect("socks bound");
    (agent, socks)
}

/// Poll until `probe` holds or give up loudly.
async fn eventually<F: Fn() -> bool>(what: &str, probe: F) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for_route(agent: &Agent, ip: &str) {
    let ip: std::net::IpAddr = ip.parse().unwrap();
    eventually("route propagation", || agent.ctx().routes.lookup_ip(ip).is_some()).await;
}

/// Plain TCP echo server.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Reads the whole request (until client FIN), then answers and closes.
async fn spawn_request_then_reply(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                if socket.read_to_end(&mut request).await.is_ok() {
                    let _ = socket.write_all(reply).await;
                }
            });
        }
    });
    addr
}

/// Minimal SOCKS5 client: no-auth CONNECT. Returns the stream and the
/// server's reply code.
async fn socks_connect(socks: SocketAddr, host: SocksHost<'_>, port: u16) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(socks).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    match host {
        SocksHost::V4(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        SocksHost::Domain(name) => {
            request.push(0x03);
            request.push(name.len() as u8);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    let code = head[1];
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            len[0] as usize
        }
        other => panic!("unexpected bound addr type {}", other),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.unwrap();
    (stream, code)
}

enum SocksHost<'a> {
    V4(std::net::Ipv4Addr),
    Domain(&'a str),
}

fn v4(addr: SocketAddr) -> SocksHost<'static> {
    match addr {
        SocketAddr::V4(a) => SocksHost::V4(*a.ip()),
        SocketAddr::V6(_) => panic!("expected v4"),
    }
}

async fn echo_roundtrip(socks: SocketAddr, echo: SocketAddr, bytes: usize) {
    let (mut stream, code) = socks_connect(socks, v4(echo), echo.port()).await;
    assert_eq!(code, 0x00, "connect should succeed");

    let payload: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    stream.write_all(&payload).await.unwrap();
    let mut back = vec![0u8; payload.len()];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(back, payload, "echoed bytes must match in order");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_hop_connect_over_websocket() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::WebSocket, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    // Bigger than one 16 KB frame each way, so chunking and sealing both
    // run more than once.
    tokio::time::timeout(Duration::from_secs(30), echo_roundtrip(socks, echo, 50_000))
        .await
        .expect("roundtrip finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_hop_connect_over_h2() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::H2, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::H2, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    tokio::time::timeout(Duration::from_secs(30), echo_roundtrip(socks, echo, 50_000))
        .await
        .expect("roundtrip finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_hop_connect_over_quic() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::Quic, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::Quic, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    tokio::time::timeout(Duration::from_secs(30), echo_roundtrip(socks, echo, 50_000))
        .await
        .expect("roundtrip finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn domain_route_resolves_at_the_exit() {
    let echo = spawn_echo().await;
    // The exit advertises the name; resolution happens on the exit side.
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &[], &["localhost"]).await;
    let (ingress, socks) = start_ingress(TransportKind::WebSocket, exit_addr).await;
    eventually("domain route propagation", || {
        ingress.ctx().routes.lookup_domain("localhost").is_some()
    })
    .await;

    let (mut stream, code) =
        socks_connect(socks, SocksHost::Domain("localhost"), echo.port()).await;
    assert_eq!(code, 0x00);
    stream.write_all(b"name-routed").await.unwrap();
    let mut back = [0u8; 11];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"name-routed");
}

#[tokio::test(flavor = "multi_thread")]
async fn three_hop_chain_forwards_through_transit() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;

    // Transit: listener plus a dial towards the exit, no ingress, no exit.
    let mut transit_settings = base_settings("transit");
    transit_settings.listeners.push(listener(TransportKind::WebSocket));
    transit_settings.peers.push(peer_of(TransportKind::WebSocket, exit_addr));
    let transit = start_agent(transit_settings).await;
    let transit_addr = transit.listen_addrs()[0];

    let (ingress, socks) = start_ingress(TransportKind::WebSocket, transit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    // Two hops away: metric is two and the path runs through the transit.
    let found = ingress
        .ctx()
        .routes
        .lookup_ip("127.0.0.1".parse().unwrap())
        .unwrap();
    assert_eq!(found.next_hop, transit.agent_id());
    assert_eq!(found.path.len(), 2);

    tokio::time::timeout(Duration::from_secs(30), echo_roundtrip(socks, echo, 40_000))
        .await
        .expect("roundtrip finished");

    // The transit actually carried the stream.
    eventually("forward pair cleanup", || transit.ctx().forward.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ttl_exhaustion_maps_to_socks_ttl_reply() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;

    let mut transit_settings = base_settings("transit");
    transit_settings.listeners.push(listener(TransportKind::WebSocket));
    transit_settings.peers.push(peer_of(TransportKind::WebSocket, exit_addr));
    let transit = start_agent(transit_settings).await;
    let transit_addr = transit.listen_addrs()[0];

    // The ingress stamps ttl = 1; the transit must refuse to forward.
    let mut settings = base_settings("ingress");
    settings.socks5.enabled = true;
    settings.socks5.address = "127.0.0.1:0".into();
    settings.routing.max_hops = 1;
    settings.peers.push(peer_of(TransportKind::WebSocket, transit_addr));
    let ingress = start_agent(settings).await;
    let socks = ingress.socks_addr().unwrap();
    wait_for_route(&ingress, "127.0.0.1").await;

    let (_stream, code) = socks_connect(socks, v4(echo), echo.port()).await;
    assert_eq!(code, 0x06, "ttl exceeded maps to TTL-expired reply");
}

#[tokio::test(flavor = "multi_thread")]
async fn flood_triangle_settles_without_looping() {
    let (exit, exit_addr) = start_exit(TransportKind::WebSocket, &["192.168.0.0/16"], &[]).await;

    let mut a_settings = base_settings("a");
    a_settings.listeners.push(listener(TransportKind::WebSocket));
    a_settings.peers.push(peer_of(TransportKind::WebSocket, exit_addr));
    let a = start_agent(a_settings).await;
    let a_addr = a.listen_addrs()[0];

    let mut b_settings = base_settings("b");
    b_settings.peers.push(peer_of(TransportKind::WebSocket, exit_addr));
    b_settings.peers.push(peer_of(TransportKind::WebSocket, a_addr));
    let b = start_agent(b_settings).await;

    for agent in [&a, &b] {
        eventually("triangle route", || {
            agent
                .ctx()
                .routes
                .lookup_ip("192.168.1.1".parse().unwrap())
                .is_some()
        })
        .await;
        let found = agent
            .ctx()
            .routes
            .lookup_ip("192.168.1.1".parse().unwrap())
            .unwrap();
        assert_eq!(found.exit, exit.agent_id());
        // Direct or one bounce; seen_by stops anything further.
        assert!(found.path.len() <= 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn half_close_delivers_request_then_response() {
    let server = spawn_request_then_reply(b"RESPONSE").await;
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::WebSocket, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    let (mut stream, code) = socks_connect(socks, v4(server), server.port()).await;
    assert_eq!(code, 0x00);

    stream.write_all(b"GET please").await.unwrap();
    // Half-close: the server only answers once it has seen our FIN.
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), stream.read_to_end(&mut response))
        .await
        .expect("response within deadline")
        .unwrap();
    assert_eq!(response, b"RESPONSE");
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_associate_relays_datagrams() {
    // UDP echo target.
    let udp_echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_echo_addr = udp_echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, from)) = udp_echo.recv_from(&mut buf).await {
            let _ = udp_echo.send_to(&buf[..n], from).await;
        }
    });

    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::WebSocket, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    // UDP ASSOCIATE handshake on the control connection.
    let mut control = TcpStream::connect(socks).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    control.read_exact(&mut method).await.unwrap();
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut head = [0u8; 4];
    control.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x00);
    assert_eq!(head[3], 0x01);
    let mut bound = [0u8; 6];
    control.read_exact(&mut bound).await.unwrap();
    let relay_addr = SocketAddr::from((
        std::net::Ipv4Addr::new(bound[0], bound[1], bound[2], bound[3]),
        u16::from_be_bytes([bound[4], bound[5]]),
    ));

    // Send one SOCKS-wrapped datagram and expect the echo back.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = vec![0, 0, 0, 0x01];
    match udp_echo_addr {
        SocketAddr::V4(a) => packet.extend_from_slice(&a.ip().octets()),
        _ => unreachable!(),
    }
    packet.extend_from_slice(&udp_echo_addr.port().to_be_bytes());
    packet.extend_from_slice(b"ping-datagram");
    client.send_to(&packet, relay_addr).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(15), client.recv_from(&mut buf))
        .await
        .expect("datagram reply within deadline")
        .unwrap();
    // Strip the reply header: RSV2 FRAG ATYP ADDR(4) PORT(2).
    assert!(n > 10);
    assert_eq!(&buf[10..n], b"ping-datagram");
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_limit_refuses_excess_opens() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;

    let mut settings = base_settings("ingress");
    settings.socks5.enabled = true;
    settings.socks5.address = "127.0.0.1:0".into();
    settings.limits.max_streams_per_peer = 1;
    settings.peers.push(peer_of(TransportKind::WebSocket, exit_addr));
    let ingress = start_agent(settings).await;
    let socks = ingress.socks_addr().unwrap();
    wait_for_route(&ingress, "127.0.0.1").await;

    let (mut held, code) = socks_connect(socks, v4(echo), echo.port()).await;
    assert_eq!(code, 0x00);
    held.write_all(b"keepalive").await.unwrap();

    // The second open hits the per-peer cap; the first stream is untouched.
    let (_refused, code) = socks_connect(socks, v4(echo), echo.port()).await;
    assert_eq!(code, 0x01);

    let mut back = [0u8; 9];
    held.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"keepalive");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_concurrent_streams_share_one_link() {
    let echo = spawn_echo().await;
    let (_exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::WebSocket, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    // Both transfers ride the same shared link; the round-robin writer
    // must let them finish together rather than starving one.
    let first = tokio::spawn(echo_roundtrip(socks, echo, 200_000));
    let second = tokio::spawn(echo_roundtrip(socks, echo, 200_000));
    tokio::time::timeout(Duration::from_secs(30), async {
        first.await.unwrap();
        second.await.unwrap();
    })
    .await
    .expect("both streams finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn dialer_reconnects_after_peer_restart() {
    let echo = spawn_echo().await;
    let (exit, exit_addr) = start_exit(TransportKind::WebSocket, &["127.0.0.0/8"], &[]).await;
    let (ingress, socks) = start_ingress(TransportKind::WebSocket, exit_addr).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    // Take the exit down; routes through it are purged with the peer, not
    // left to expiry.
    exit.shutdown().await;
    eventually("route purge on teardown", || {
        ingress
            .ctx()
            .routes
            .lookup_ip("127.0.0.1".parse().unwrap())
            .is_none()
    })
    .await;
    eventually("peer teardown", || ingress.ctx().peers.is_empty()).await;

    // A replacement exit on the same address; the dialer's backoff loop
    // finds it and routes come back with the fresh advertisement.
    let mut settings = base_settings("exit2");
    settings.listeners.push(ListenerSettings {
        transport: TransportKind::WebSocket,
        address: exit_addr.to_string(),
        tls: TlsServerSettings::default(),
        path: "/trellis".into(),
        plaintext: true,
    });
    settings.exit.enabled = true;
    settings.exit.cidr_routes = vec!["127.0.0.0/8".into()];
    let _exit2 = start_agent(settings).await;

    eventually("reconnect", || !ingress.ctx().peers.is_empty()).await;
    wait_for_route(&ingress, "127.0.0.1").await;

    tokio::time::timeout(Duration::from_secs(30), echo_roundtrip(socks, echo, 10_000))
        .await
        .expect("roundtrip after reconnect");
}
