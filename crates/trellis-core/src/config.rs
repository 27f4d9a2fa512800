//! Validated, in-memory settings tree.
//!
//! The agent never runs on a partially valid configuration: [`Settings::validate`]
//! is called once at startup and any failure aborts the process. File parsing
//! (TOML in the `trellis` binary) is a thin serde layer over these types.

use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use trellis_proto::AgentId;

use crate::error::AgentError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub listeners: Vec<ListenerSettings>,
    #[serde(default)]
    pub peers: Vec<PeerSettings>,
    #[serde(default)]
    pub socks5: Socks5Settings,
    #[serde(default)]
    pub exit: ExitSettings,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub connections: ConnectionSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub management: ManagementSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSettings {
    /// Pinned AgentId in hex; normally absent and loaded from the data dir.
    pub id: Option<String>,
    pub data_dir: String,
    pub display_name: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            id: None,
            data_dir: ".".into(),
            display_name: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Which transport a listener or peer link speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    H2,
    #[serde(rename = "websocket", alias = "ws")]
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Quic => f.write_str("quic"),
            TransportKind::H2 => f.write_str("h2"),
            TransportKind::WebSocket => f.write_str("websocket"),
        }
    }
}

fn default_path() -> String {
    "/trellis".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerSettings {
    pub transport: TransportKind,
    pub address: String,
    #[serde(default)]
    pub tls: TlsServerSettings,
    /// URL path for H2 and WebSocket listeners.
    #[serde(default = "default_path")]
    pub path: String,
    /// Accept unencrypted TCP for H2/WebSocket. Useful behind a terminating
    /// reverse proxy; never applies to QUIC.
    #[serde(default)]
    pub plaintext: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerSettings {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Require and verify client certificates against `ca_file`.
    #[serde(default)]
    pub verify_client: bool,
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSettings {
    /// AgentId this peer must present in its PEER_HELLO, in hex.
    pub expected_agent_id: Option<String>,
    pub transport: TransportKind,
    /// host:port of the remote listener.
    pub address: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub tls: TlsClientSettings,
    /// HTTP CONNECT proxy for WebSocket links, as host:port.
    pub proxy: Option<String>,
    /// Dial unencrypted TCP for H2/WebSocket links.
    #[serde(default)]
    pub plaintext: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsClientSettings {
    /// Verify the server certificate chain. Off by default: the E2E layer is
    /// the authoritative security boundary and listeners run on ephemeral
    /// self-signed certificates unless provisioned.
    #[serde(default)]
    pub verify: bool,
    pub ca_file: Option<String>,
    /// Server name for SNI and verification; defaults to the dialed host.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socks5Settings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_socks_addr")]
    pub address: String,
    #[serde(default)]
    pub auth: SocksAuthSettings,
    #[serde(default = "default_socks_max_connections")]
    pub max_connections: usize,
}

impl Default for Socks5Settings {
    fn default() -> Self {
        Socks5Settings {
            enabled: false,
            address: default_socks_addr(),
            auth: SocksAuthSettings::default(),
            max_connections: default_socks_max_connections(),
        }
    }
}

fn default_socks_addr() -> String {
    "127.0.0.1:1080".into()
}

fn default_socks_max_connections() -> usize {
    512
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocksAuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub users: Vec<SocksUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocksUser {
    pub name: String,
    pub bcrypt_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitSettings {
    #[serde(default)]
    pub enabled: bool,
    /// CIDRs this agent advertises and is willing to dial into.
    #[serde(default)]
    pub cidr_routes: Vec<String>,
    /// Exact domains or `*.suffix` single-label wildcards.
    #[serde(default)]
    pub domain_patterns: Vec<String>,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        ExitSettings {
            enabled: false,
            cidr_routes: Vec::new(),
            domain_patterns: Vec::new(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

fn default_dial_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSettings {
    /// Seconds between local route advertisements.
    #[serde(default = "default_advertise_interval")]
    pub advertise_interval: u64,
    /// Seconds a learned route lives without a refresh.
    #[serde(default = "default_route_ttl")]
    pub route_ttl: u64,
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        RoutingSettings {
            advertise_interval: default_advertise_interval(),
            route_ttl: default_route_ttl(),
            max_hops: default_max_hops(),
        }
    }
}

fn default_advertise_interval() -> u64 {
    120
}

fn default_route_ttl() -> u64 {
    300
}

fn default_max_hops() -> u8 {
    16
}

impl RoutingSettings {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval)
    }

    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Seconds without traffic before a keepalive probe is sent.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u64,
    /// Seconds without any received frame before a peer is declared dead.
    #[serde(default = "default_conn_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            idle_threshold: default_idle_threshold(),
            timeout: default_conn_timeout(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

fn default_idle_threshold() -> u64 {
    30
}

fn default_conn_timeout() -> u64 {
    90
}

impl ConnectionSettings {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectSettings {
    /// Seconds before the first retry.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fractional jitter applied to each delay, e.g. 0.2 for plus or minus
    /// twenty percent.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Give up after this many consecutive failures; 0 means never.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        ReconnectSettings {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_retries: 0,
        }
    }
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitSettings {
    #[serde(default = "default_streams_per_peer")]
    pub max_streams_per_peer: usize,
    #[serde(default = "default_streams_total")]
    pub max_streams_total: usize,
    #[serde(default = "default_pending_opens")]
    pub max_pending_opens: usize,
    /// Seconds to wait for STREAM_OPEN_ACK before synthesizing an error.
    #[serde(default = "default_open_timeout")]
    pub stream_open_timeout: u64,
    /// Per-direction buffered bytes per stream.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds without data in either direction before a stream is reset.
    #[serde(default = "default_idle_stream_timeout")]
    pub idle_stream_timeout: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        LimitSettings {
            max_streams_per_peer: default_streams_per_peer(),
            max_streams_total: default_streams_total(),
            max_pending_opens: default_pending_opens(),
            stream_open_timeout: default_open_timeout(),
            buffer_size: default_buffer_size(),
            idle_stream_timeout: default_idle_stream_timeout(),
        }
    }
}

fn default_streams_per_peer() -> usize {
    1000
}

fn default_streams_total() -> usize {
    10_000
}

fn default_pending_opens() -> usize {
    100
}

fn default_open_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    256 * 1024
}

fn default_idle_stream_timeout() -> u64 {
    300
}

impl LimitSettings {
    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_open_timeout)
    }

    pub fn idle_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_stream_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagementSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mgmt_addr")]
    pub address: String,
}

impl Default for ManagementSettings {
    fn default() -> Self {
        ManagementSettings { enabled: false, address: default_mgmt_addr() }
    }
}

fn default_mgmt_addr() -> String {
    "127.0.0.1:7070".into()
}

impl Settings {
    /// Reject anything the agent cannot run with. Called once at startup;
    /// the process exits on error rather than running partially configured.
    pub fn validate(&self) -> Result<(), AgentError> {
        if let Some(id) = &self.agent.id {
            id.parse::<AgentId>()
                .map_err(|e| AgentError::Config(format!("agent.id: {}", e)))?;
        }
        for (i, l) in self.listeners.iter().enumerate() {
            l.address
                .parse::<SocketAddr>()
                .map_err(|e| AgentError::Config(format!("listeners[{}].address: {}", i, e)))?;
            if l.plaintext && l.transport == TransportKind::Quic {
                return Err(AgentError::Config(format!(
                    "listeners[{}]: quic cannot be plaintext",
                    i
                )));
            }
            if !l.path.starts_with('/') {
                return Err(AgentError::Config(format!(
                    "listeners[{}].path must start with '/'",
                    i
                )));
            }
            if l.tls.verify_client && l.tls.ca_file.is_none() {
                return Err(AgentError::Config(format!(
                    "listeners[{}].tls: verify_client requires ca_file",
                    i
                )));
            }
            if l.tls.cert_file.is_some() != l.tls.key_file.is_some() {
                return Err(AgentError::Config(format!(
                    "listeners[{}].tls: cert_file and key_file go together",
                    i
                )));
            }
        }
        for (i, p) in self.peers.iter().enumerate() {
            host_port(&p.address)
                .ok_or_else(|| AgentError::Config(format!("peers[{}].address: expected host:port", i)))?;
            if let Some(id) = &p.expected_agent_id {
                id.parse::<AgentId>()
                    .map_err(|e| AgentError::Config(format!("peers[{}].expected_agent_id: {}", i, e)))?;
            }
            if let Some(proxy) = &p.proxy {
                if p.transport != TransportKind::WebSocket {
                    return Err(AgentError::Config(format!(
                        "peers[{}]: proxy is only supported for websocket links",
                        i
                    )));
                }
                host_port(proxy)
                    .ok_or_else(|| AgentError::Config(format!("peers[{}].proxy: expected host:port", i)))?;
                if p.tls.verify {
                    return Err(AgentError::Config(format!(
                        "peers[{}]: strict verification is not available through an HTTP proxy",
                        i
                    )));
                }
            }
            if p.tls.verify && p.tls.ca_file.is_none() {
                return Err(AgentError::Config(format!(
                    "peers[{}].tls: verify requires ca_file",
                    i
                )));
            }
        }
        if self.socks5.enabled {
            self.socks5
                .address
                .parse::<SocketAddr>()
                .map_err(|e| AgentError::Config(format!("socks5.address: {}", e)))?;
            if self.socks5.auth.enabled {
                if self.socks5.auth.users.is_empty() {
                    return Err(AgentError::Config(
                        "socks5.auth: enabled with no users".into(),
                    ));
                }
                for u in &self.socks5.auth.users {
                    if !u.bcrypt_hash.starts_with("$2") {
                        return Err(AgentError::Config(format!(
                            "socks5.auth.users[{}]: not a bcrypt hash",
                            u.name
                        )));
                    }
                }
            }
        }
        if self.exit.enabled {
            for cidr in &self.exit.cidr_routes {
                cidr.parse::<IpNet>()
                    .map_err(|e| AgentError::Config(format!("exit.cidr_routes[{}]: {}", cidr, e)))?;
            }
            for pattern in &self.exit.domain_patterns {
                validate_domain_pattern(pattern)?;
            }
            if self.exit.cidr_routes.is_empty() && self.exit.domain_patterns.is_empty() {
                return Err(AgentError::Config(
                    "exit.enabled with nothing to advertise".into(),
                ));
            }
        }
        if self.routing.max_hops == 0 {
            return Err(AgentError::Config("routing.max_hops must be at least 1".into()));
        }
        if self.connections.idle_threshold >= self.connections.timeout {
            return Err(AgentError::Config(
                "connections.idle_threshold must be below connections.timeout".into(),
            ));
        }
        let r = &self.connections.reconnect;
        if r.initial_delay <= 0.0 || r.max_delay < r.initial_delay || r.multiplier < 1.0 {
            return Err(AgentError::Config("connections.reconnect: bad backoff curve".into()));
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return Err(AgentError::Config(
                "connections.reconnect.jitter must be in [0, 1)".into(),
            ));
        }
        if self.limits.max_streams_per_peer == 0 || self.limits.max_streams_total == 0 {
            return Err(AgentError::Config("limits: stream caps must be nonzero".into()));
        }
        if self.management.enabled {
            self.management
                .address
                .parse::<SocketAddr>()
                .map_err(|e| AgentError::Config(format!("management.address: {}", e)))?;
        }
        Ok(())
    }

    /// Exit CIDRs, parsed. Call after `validate`.
    pub fn exit_cidrs(&self) -> Vec<IpNet> {
        self.exit
            .cidr_routes
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

fn validate_domain_pattern(pattern: &str) -> Result<(), AgentError> {
    let name = pattern.strip_prefix("*.").unwrap_or(pattern);
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(AgentError::Config(format!(
            "exit.domain_patterns[{}]: not a domain or *.suffix pattern",
            pattern
        )))
    }
}

/// Split host:port, tolerating bracketed IPv6 literals.
pub(crate) fn host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let s = Settings::default();
        assert_eq!(s.routing.advertise_interval, 120);
        assert_eq!(s.routing.route_ttl, 300);
        assert_eq!(s.routing.max_hops, 16);
        assert_eq!(s.connections.idle_threshold, 30);
        assert_eq!(s.connections.timeout, 90);
        assert_eq!(s.connections.reconnect.initial_delay, 1.0);
        assert_eq!(s.connections.reconnect.max_delay, 60.0);
        assert_eq!(s.connections.reconnect.multiplier, 2.0);
        assert_eq!(s.connections.reconnect.jitter, 0.2);
        assert_eq!(s.limits.max_streams_per_peer, 1000);
        assert_eq!(s.limits.max_streams_total, 10_000);
        assert_eq!(s.limits.max_pending_opens, 100);
        assert_eq!(s.limits.stream_open_timeout, 30);
        assert_eq!(s.limits.buffer_size, 256 * 1024);
        assert_eq!(s.limits.idle_stream_timeout, 300);
        s.validate().unwrap();
    }

    #[test]
    fn rejects_bad_cidr() {
        let mut s = Settings::default();
        s.exit.enabled = true;
        s.exit.cidr_routes = vec!["10.0.0.0/33".into()];
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_exit_with_nothing_to_advertise() {
        let mut s = Settings::default();
        s.exit.enabled = true;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_auth_without_users() {
        let mut s = Settings::default();
        s.socks5.enabled = true;
        s.socks5.auth.enabled = true;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_proxy_on_quic() {
        let mut s = Settings::default();
        s.peers.push(PeerSettings {
            expected_agent_id: None,
            transport: TransportKind::Quic,
            address: "relay.example:4433".into(),
            path: default_path(),
            tls: TlsClientSettings::default(),
            proxy: Some("proxy.example:3128".into()),
            plaintext: false,
        });
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_idle_threshold_at_or_over_timeout() {
        let mut s = Settings::default();
        s.connections.idle_threshold = 90;
        assert!(s.validate().is_err());
    }

    #[test]
    fn domain_pattern_validation() {
        assert!(validate_domain_pattern("example.com").is_ok());
        assert!(validate_domain_pattern("*.example.com").is_ok());
        assert!(validate_domain_pattern("*.").is_err());
        assert!(validate_domain_pattern("bad..but-chars-ok").is_ok());
        assert!(validate_domain_pattern("spaces bad").is_err());
    }

    #[test]
    fn host_port_split() {
        assert_eq!(host_port("example.com:443"), Some(("example.com", 443)));
        assert_eq!(host_port("[::1]:80"), Some(("::1", 80)));
        assert_eq!(host_port("no-port"), None);
        assert_eq!(host_port(":443"), None);
    }
}
