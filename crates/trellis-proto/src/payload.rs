use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AgentId, DecodeError, FrameType, StreamErrorCode};

/// Host part of a dial target or bound address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetHost {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl TargetHost {
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            TargetHost::V4(a) => Some(IpAddr::V4(*a)),
            TargetHost::V6(a) => Some(IpAddr::V6(*a)),
            TargetHost::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for TargetHost {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(a) => TargetHost::V4(a),
            IpAddr::V6(a) => TargetHost::V6(a),
        }
    }
}

impl fmt::Display for TargetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetHost::V4(a) => a.fmt(f),
            TargetHost::V6(a) => a.fmt(f),
            TargetHost::Domain(d) => f.write_str(d),
        }
    }
}

/// Which kind of socket the exit opens for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetProto {
    Tcp,
    Udp,
    IcmpEcho,
}

/// Dial target carried in STREAM_OPEN.
///
/// The wire byte folds the protocol into the address type: `0x01`/`0x03`/
/// `0x04` are TCP IPv4/domain/IPv6 exactly as in SOCKS5; `0x10` marks the
/// UDP variants and `0x20` the ICMP echo variants. ICMP targets carry
/// port 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: TargetHost,
    pub port: u16,
    pub proto: TargetProto,
}

impl TargetAddr {
    pub fn tcp(host: TargetHost, port: u16) -> Self {
        TargetAddr { host, port, proto: TargetProto::Tcp }
    }

    pub fn udp(host: TargetHost, port: u16) -> Self {
        TargetAddr { host, port, proto: TargetProto::Udp }
    }

    fn addr_type_byte(&self) -> u8 {
        let base = match self.host {
            TargetHost::V4(_) => 0x01,
            TargetHost::Domain(_) => 0x03,
            TargetHost::V6(_) => 0x04,
        };
        let proto = match self.proto {
            TargetProto::Tcp => 0x00,
            TargetProto::Udp => 0x10,
            TargetProto::IcmpEcho => 0x20,
        };
        base | proto
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            TargetProto::Tcp => "tcp",
            TargetProto::Udp => "udp",
            TargetProto::IcmpEcho => "icmp",
        };
        match &self.host {
            TargetHost::V6(a) => write!(f, "{}://[{}]:{}", proto, a, self.port),
            host => write!(f, "{}://{}:{}", proto, host, self.port),
        }
    }
}

/// Address/port pair reported back in STREAM_OPEN_ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAddr {
    pub host: TargetHost,
    pub port: u16,
}

impl BoundAddr {
    pub fn from_socket(addr: std::net::SocketAddr) -> Self {
        BoundAddr { host: addr.ip().into(), port: addr.port() }
    }
}

/// PEER_HELLO and PEER_HELLO_ACK share one shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub version: u16,
    pub agent_id: AgentId,
    /// Sender's unix time in seconds; the acceptor rejects skew over five
    /// minutes.
    pub timestamp: i64,
    pub capabilities: Vec<String>,
}

/// STREAM_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    pub request_id: u64,
    pub target: TargetAddr,
    pub ttl: u8,
    /// Hops after the receiving peer, ending at the exit. Empty means the
    /// receiver is the exit.
    pub path: Vec<AgentId>,
    pub ephemeral_pub: [u8; 32],
}

/// STREAM_OPEN_ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenAck {
    pub request_id: u64,
    pub bound: BoundAddr,
    pub ephemeral_pub: [u8; 32],
}

/// STREAM_OPEN_ERR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenErr {
    pub request_id: u64,
    pub code: StreamErrorCode,
    pub message: String,
}

/// One advertised route inside ROUTE_ADVERTISE / ROUTE_WITHDRAW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Cidr { prefix: IpAddr, prefix_len: u8 },
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRoute {
    pub target: RouteTarget,
    pub metric: u16,
}

/// ROUTE_ADVERTISE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAdvertise {
    pub origin: AgentId,
    pub sequence: u64,
    pub routes: Vec<AdvertisedRoute>,
    pub path: Vec<AgentId>,
    pub seen_by: Vec<AgentId>,
}

/// ROUTE_WITHDRAW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteWithdraw {
    pub origin: AgentId,
    pub sequence: u64,
    pub routes: Vec<AdvertisedRoute>,
    pub seen_by: Vec<AgentId>,
}

/// Decoded payload, one variant per frame type.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    PeerHello(PeerHello),
    PeerHelloAck(PeerHello),
    StreamOpen(StreamOpen),
    StreamOpenAck(StreamOpenAck),
    StreamOpenErr(StreamOpenErr),
    StreamData(Bytes),
    StreamClose,
    StreamReset { code: StreamErrorCode },
    RouteAdvertise(RouteAdvertise),
    RouteWithdraw(RouteWithdraw),
    Keepalive { timestamp: i64 },
    KeepaliveAck { timestamp: i64 },
}

impl FramePayload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::PeerHello(_) => FrameType::PeerHello,
            FramePayload::PeerHelloAck(_) => FrameType::PeerHelloAck,
            FramePayload::StreamOpen(_) => FrameType::StreamOpen,
            FramePayload::StreamOpenAck(_) => FrameType::StreamOpenAck,
            FramePayload::StreamOpenErr(_) => FrameType::StreamOpenErr,
            FramePayload::StreamData(_) => FrameType::StreamData,
            FramePayload::StreamClose => FrameType::StreamClose,
            FramePayload::StreamReset { .. } => FrameType::StreamReset,
            FramePayload::RouteAdvertise(_) => FrameType::RouteAdvertise,
            FramePayload::RouteWithdraw(_) => FrameType::RouteWithdraw,
            FramePayload::Keepalive { .. } => FrameType::Keepalive,
            FramePayload::KeepaliveAck { .. } => FrameType::KeepaliveAck,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            FramePayload::PeerHello(h) | FramePayload::PeerHelloAck(h) => {
                buf.put_u16(h.version);
                buf.put_slice(h.agent_id.as_bytes());
                buf.put_i64(h.timestamp);
                buf.put_u8(h.capabilities.len() as u8);
                for cap in &h.capabilities {
                    put_lp(buf, cap);
                }
            }
            FramePayload::StreamOpen(open) => {
                buf.put_u64(open.request_id);
                put_target(buf, &open.target);
                buf.put_u8(open.ttl);
                buf.put_u8(open.path.len() as u8);
                for hop in &open.path {
                    buf.put_slice(hop.as_bytes());
                }
                buf.put_slice(&open.ephemeral_pub);
            }
            FramePayload::StreamOpenAck(ack) => {
                buf.put_u64(ack.request_id);
                put_host(buf, &ack.bound.host);
                buf.put_u16(ack.bound.port);
                buf.put_slice(&ack.ephemeral_pub);
            }
            FramePayload::StreamOpenErr(err) => {
                buf.put_u64(err.request_id);
                buf.put_u16(err.code.to_u16());
                put_lp(buf, &err.message);
            }
            FramePayload::StreamData(data) => buf.put_slice(data),
            FramePayload::StreamClose => {}
            FramePayload::StreamReset { code } => buf.put_u16(code.to_u16()),
            FramePayload::RouteAdvertise(adv) => {
                buf.put_slice(adv.origin.as_bytes());
                buf.put_u64(adv.sequence);
                buf.put_u8(adv.routes.len() as u8);
                for route in &adv.routes {
                    put_route(buf, route);
                }
                buf.put_u8(adv.path.len() as u8);
                for hop in &adv.path {
                    buf.put_slice(hop.as_bytes());
                }
                buf.put_u8(adv.seen_by.len() as u8);
                for seen in &adv.seen_by {
                    buf.put_slice(seen.as_bytes());
                }
            }
            FramePayload::RouteWithdraw(wd) => {
                buf.put_slice(wd.origin.as_bytes());
                buf.put_u64(wd.sequence);
                buf.put_u8(wd.routes.len() as u8);
                for route in &wd.routes {
                    put_route(buf, route);
                }
                buf.put_u8(wd.seen_by.len() as u8);
                for seen in &wd.seen_by {
                    buf.put_slice(seen.as_bytes());
                }
            }
            FramePayload::Keepalive { timestamp } | FramePayload::KeepaliveAck { timestamp } => {
                buf.put_i64(*timestamp);
            }
        }
    }

    pub fn decode(frame_type: FrameType, body: Bytes) -> Result<Self, DecodeError> {
        let mut rd = Reader::new(&body, frame_type);
        let payload = match frame_type {
            FrameType::PeerHello => FramePayload::PeerHello(decode_hello(&mut rd)?),
            FrameType::PeerHelloAck => FramePayload::PeerHelloAck(decode_hello(&mut rd)?),
            FrameType::StreamOpen => {
                let request_id = rd.u64()?;
                let addr_type = rd.u8()?;
                let (host, proto) = read_target(&mut rd, addr_type, request_id)?;
                let port = rd.u16()?;
                let ttl = rd.u8()?;
                let path_len = rd.u8()? as usize;
                let mut path = Vec::with_capacity(path_len);
                for _ in 0..path_len {
                    path.push(rd.agent_id()?);
                }
                let ephemeral_pub = rd.array::<32>()?;
                FramePayload::StreamOpen(StreamOpen {
                    request_id,
                    target: TargetAddr { host, port, proto },
                    ttl,
                    path,
                    ephemeral_pub,
                })
            }
            FrameType::StreamOpenAck => {
                let request_id = rd.u64()?;
                let addr_type = rd.u8()?;
                let host = read_host(&mut rd, addr_type & 0x0f)?;
                let port = rd.u16()?;
                let ephemeral_pub = rd.array::<32>()?;
                FramePayload::StreamOpenAck(StreamOpenAck {
                    request_id,
                    bound: BoundAddr { host, port },
                    ephemeral_pub,
                })
            }
            FrameType::StreamOpenErr => FramePayload::StreamOpenErr(StreamOpenErr {
                request_id: rd.u64()?,
                code: StreamErrorCode::from_u16(rd.u16()?),
                message: rd.lp_string()?,
            }),
            FrameType::StreamData => return Ok(FramePayload::StreamData(body)),
            FrameType::StreamClose => FramePayload::StreamClose,
            FrameType::StreamReset => {
                FramePayload::StreamReset { code: StreamErrorCode::from_u16(rd.u16()?) }
            }
            FrameType::RouteAdvertise => {
                let origin = rd.agent_id()?;
                let sequence = rd.u64()?;
                let routes = read_routes(&mut rd)?;
                let path_len = rd.u8()? as usize;
                let mut path = Vec::with_capacity(path_len);
                for _ in 0..path_len {
                    path.push(rd.agent_id()?);
                }
                let seen_count = rd.u8()? as usize;
                let mut seen_by = Vec::with_capacity(seen_count);
                for _ in 0..seen_count {
                    seen_by.push(rd.agent_id()?);
                }
                FramePayload::RouteAdvertise(RouteAdvertise {
                    origin,
                    sequence,
                    routes,
                    path,
                    seen_by,
                })
            }
            FrameType::RouteWithdraw => {
                let origin = rd.agent_id()?;
                let sequence = rd.u64()?;
                let routes = read_routes(&mut rd)?;
                let seen_count = rd.u8()? as usize;
                let mut seen_by = Vec::with_capacity(seen_count);
                for _ in 0..seen_count {
                    seen_by.push(rd.agent_id()?);
                }
                FramePayload::RouteWithdraw(RouteWithdraw { origin, sequence, routes, seen_by })
            }
            FrameType::Keepalive => FramePayload::Keepalive { timestamp: rd.i64()? },
            FrameType::KeepaliveAck => FramePayload::KeepaliveAck { timestamp: rd.i64()? },
        };
        Ok(payload)
    }
}

fn decode_hello(rd: &mut Reader<'_>) -> Result<PeerHello, DecodeError> {
    let version = rd.u16()?;
    let agent_id = rd.agent_id()?;
    let timestamp = rd.i64()?;
    let cap_count = rd.u8()? as usize;
    let mut capabilities = Vec::with_capacity(cap_count);
    for _ in 0..cap_count {
        capabilities.push(rd.lp_string()?);
    }
    Ok(PeerHello { version, agent_id, timestamp, capabilities })
}

fn read_routes(rd: &mut Reader<'_>) -> Result<Vec<AdvertisedRoute>, DecodeError> {
    let count = rd.u8()? as usize;
    let mut routes = Vec::with_capacity(count);
    for _ in 0..count {
        let af = rd.u8()?;
        let prefix_len = rd.u8()?;
        let target = match af {
            0x01 => RouteTarget::Cidr {
                prefix: IpAddr::V4(Ipv4Addr::from(rd.array::<4>()?)),
                prefix_len,
            },
            0x04 => RouteTarget::Cidr {
                prefix: IpAddr::V6(Ipv6Addr::from(rd.array::<16>()?)),
                prefix_len,
            },
            0x03 => RouteTarget::Domain(rd.lp_string()?),
            _ => return Err(rd.truncated()),
        };
        let metric = rd.u16()?;
        routes.push(AdvertisedRoute { target, metric });
    }
    Ok(routes)
}

fn put_route(buf: &mut BytesMut, route: &AdvertisedRoute) {
    match &route.target {
        RouteTarget::Cidr { prefix: IpAddr::V4(a), prefix_len } => {
            buf.put_u8(0x01);
            buf.put_u8(*prefix_len);
            buf.put_slice(&a.octets());
        }
        RouteTarget::Cidr { prefix: IpAddr::V6(a), prefix_len } => {
            buf.put_u8(0x04);
            buf.put_u8(*prefix_len);
            buf.put_slice(&a.octets());
        }
        RouteTarget::Domain(pattern) => {
            buf.put_u8(0x03);
            buf.put_u8(0);
            put_lp(buf, pattern);
        }
    }
    buf.put_u16(route.metric);
}

fn put_target(buf: &mut BytesMut, target: &TargetAddr) {
    buf.put_u8(target.addr_type_byte());
    match &target.host {
        TargetHost::V4(a) => buf.put_slice(&a.octets()),
        TargetHost::V6(a) => buf.put_slice(&a.octets()),
        TargetHost::Domain(d) => put_lp(buf, d),
    }
    buf.put_u16(target.port);
}

fn put_host(buf: &mut BytesMut, host: &TargetHost) {
    match host {
        TargetHost::V4(a) => {
            buf.put_u8(0x01);
            buf.put_slice(&a.octets());
        }
        TargetHost::Domain(d) => {
            buf.put_u8(0x03);
            put_lp(buf, d);
        }
        TargetHost::V6(a) => {
            buf.put_u8(0x04);
            buf.put_slice(&a.octets());
        }
    }
}

fn read_target(
    rd: &mut Reader<'_>,
    addr_type: u8,
    request_id: u64,
) -> Result<(TargetHost, TargetProto), DecodeError> {
    let proto = match addr_type & 0xf0 {
        0x00 => TargetProto::Tcp,
        0x10 => TargetProto::Udp,
        0x20 => TargetProto::IcmpEcho,
        _ => return Err(unsupported(request_id, addr_type)),
    };
    // Echo streams address a host, never a name to resolve remotely.
    if proto == TargetProto::IcmpEcho && addr_type & 0x0f == 0x03 {
        return Err(unsupported(request_id, addr_type));
    }
    match read_host(rd, addr_type & 0x0f) {
        Ok(host) => Ok((host, proto)),
        Err(DecodeError::UnsupportedTarget { .. }) => Err(unsupported(request_id, addr_type)),
        Err(e) => Err(e),
    }
}

fn read_host(rd: &mut Reader<'_>, base: u8) -> Result<TargetHost, DecodeError> {
    match base {
        0x01 => Ok(TargetHost::V4(Ipv4Addr::from(rd.array::<4>()?))),
        0x03 => Ok(TargetHost::Domain(rd.lp_string()?)),
        0x04 => Ok(TargetHost::V6(Ipv6Addr::from(rd.array::<16>()?))),
        other => Err(unsupported(0, other)),
    }
}

fn unsupported(request_id: u64, addr_type: u8) -> DecodeError {
    DecodeError::UnsupportedTarget { stream_id: 0, request_id, addr_type }
}

fn put_lp(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

/// Bounds-checked reader over a payload body.
struct Reader<'a> {
    buf: &'a [u8],
    frame_type: FrameType,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], frame_type: FrameType) -> Self {
        Reader { buf, frame_type }
    }

    fn truncated(&self) -> DecodeError {
        DecodeError::Truncated { frame_type: self.frame_type.as_u8() }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(self.truncated());
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn agent_id(&mut self) -> Result<AgentId, DecodeError> {
        Ok(AgentId::from_bytes(self.array::<16>()?))
    }

    fn lp_string(&mut self) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DecodeError::BadString { frame_type: self.frame_type.as_u8() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Frame, FrameFlags, PROTOCOL_VERSION};
    use bytes::BytesMut;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    fn id(b: u8) -> AgentId {
        AgentId::from_bytes([b; 16])
    }

    #[test]
    fn hello_roundtrip() {
        let frame = Frame::control(FramePayload::PeerHello(PeerHello {
            version: PROTOCOL_VERSION,
            agent_id: id(7),
            timestamp: 1_700_000_000,
            capabilities: vec!["exit".into(), "socks5".into()],
        }));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn hello_wire_layout() {
        let frame = Frame::control(FramePayload::PeerHello(PeerHello {
            version: 1,
            agent_id: id(0xaa),
            timestamp: 2,
            capabilities: vec!["x".into()],
        }));
        let wire = frame.encode();
        let body = &wire[14..];
        assert_eq!(&body[..2], &[0, 1]); // version
        assert_eq!(&body[2..18], &[0xaa; 16]); // agent id
        assert_eq!(&body[18..26], &[0, 0, 0, 0, 0, 0, 0, 2]); // timestamp
        assert_eq!(body[26], 1); // cap count
        assert_eq!(&body[27..], &[1, b'x']); // LP capability
    }

    #[test]
    fn stream_open_roundtrip_with_path() {
        let frame = Frame {
            stream_id: 3,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamOpen(StreamOpen {
                request_id: 42,
                target: TargetAddr::tcp(TargetHost::Domain("api.corp.local".into()), 443),
                ttl: 16,
                path: vec![id(1), id(2)],
                ephemeral_pub: [9; 32],
            }),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn stream_open_udp_addr_type() {
        let open = StreamOpen {
            request_id: 1,
            target: TargetAddr::udp(TargetHost::V4(Ipv4Addr::new(10, 0, 0, 1)), 53),
            ttl: 8,
            path: vec![],
            ephemeral_pub: [0; 32],
        };
        let frame =
            Frame { stream_id: 5, flags: FrameFlags::empty(), payload: FramePayload::StreamOpen(open) };
        let wire = frame.encode();
        assert_eq!(wire[14 + 8], 0x11); // request_id then addr_type
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn stream_open_unknown_addr_type_is_recoverable() {
        let frame = Frame {
            stream_id: 5,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamOpen(StreamOpen {
                request_id: 0xfeed,
                target: TargetAddr::tcp(TargetHost::V4(Ipv4Addr::LOCALHOST), 80),
                ttl: 1,
                path: vec![],
                ephemeral_pub: [0; 32],
            }),
        };
        let mut wire = BytesMut::from(&frame.encode()[..]);
        wire[14 + 8] = 0x42; // unknown proto bits
        let err = Frame::decode(&mut wire).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnsupportedTarget { stream_id: 5, request_id: 0xfeed, addr_type: 0x42 }
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn icmp_to_domain_is_rejected() {
        let frame = Frame {
            stream_id: 5,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamOpen(StreamOpen {
                request_id: 9,
                target: TargetAddr::tcp(TargetHost::Domain("h.example".into()), 0),
                ttl: 1,
                path: vec![],
                ephemeral_pub: [0; 32],
            }),
        };
        let mut wire = BytesMut::from(&frame.encode()[..]);
        wire[14 + 8] = 0x23;
        assert_eq!(
            Frame::decode(&mut wire).unwrap_err(),
            DecodeError::UnsupportedTarget { stream_id: 5, request_id: 9, addr_type: 0x23 }
        );
    }

    #[test]
    fn open_ack_roundtrip() {
        let frame = Frame {
            stream_id: 3,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamOpenAck(StreamOpenAck {
                request_id: 42,
                bound: BoundAddr { host: TargetHost::V6(Ipv6Addr::LOCALHOST), port: 8080 },
                ephemeral_pub: [3; 32],
            }),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn open_err_roundtrip() {
        let frame = Frame {
            stream_id: 3,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamOpenErr(StreamOpenErr {
                request_id: 42,
                code: StreamErrorCode::TtlExceeded,
                message: "path too long".into(),
            }),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn advertise_roundtrip_mixed_routes() {
        let frame = Frame::control(FramePayload::RouteAdvertise(RouteAdvertise {
            origin: id(0xc),
            sequence: 7,
            routes: vec![
                AdvertisedRoute {
                    target: RouteTarget::Cidr {
                        prefix: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)),
                        prefix_len: 16,
                    },
                    metric: 0,
                },
                AdvertisedRoute {
                    target: RouteTarget::Cidr {
                        prefix: "fd00::".parse().unwrap(),
                        prefix_len: 8,
                    },
                    metric: 2,
                },
                AdvertisedRoute {
                    target: RouteTarget::Domain("*.corp.local".into()),
                    metric: 0,
                },
            ],
            path: vec![id(0xc)],
            seen_by: vec![id(0xc), id(0xb)],
        }));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn withdraw_roundtrip() {
        let frame = Frame::control(FramePayload::RouteWithdraw(RouteWithdraw {
            origin: id(0xc),
            sequence: 8,
            routes: vec![AdvertisedRoute {
                target: RouteTarget::Cidr {
                    prefix: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
                    prefix_len: 8,
                },
                metric: 0,
            }],
            seen_by: vec![id(0xc)],
        }));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn keepalive_roundtrip() {
        let frame = Frame::control(FramePayload::Keepalive { timestamp: -5 });
        assert_eq!(roundtrip(frame.clone()), frame);
        let frame = Frame::control(FramePayload::KeepaliveAck { timestamp: i64::MAX });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn reset_roundtrip() {
        let frame = Frame::reset(77, StreamErrorCode::ExitDisabled);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let frame = Frame::control(FramePayload::Keepalive { timestamp: 0 });
        let wire = frame.encode();
        // Rewrite the length to 4 and chop the body mid-field.
        let mut bad = BytesMut::from(&wire[..14 + 4]);
        bad[2..6].copy_from_slice(&4u32.to_be_bytes());
        let err = Frame::decode(&mut bad).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { frame_type: 0x22 });
        assert!(err.is_fatal());
    }
}
