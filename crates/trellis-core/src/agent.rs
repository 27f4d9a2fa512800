//! Agent orchestrator: construction order, wiring, lifecycle, timers.
//!
//! Startup follows a fixed order: identity, validated settings, route
//! table and flood state, transport listeners, SOCKS5 ingress, then dialer
//! scheduling for configured peers. Everything shares one [`EngineCtx`];
//! components receive it explicitly at call sites and nothing lives in a
//! global.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{PeerSettings, Settings};
use crate::error::AgentError;
use crate::flood::Flood;
use crate::forward::ForwardTable;
use crate::identity::Identity;
use crate::peer::{self, PeerRegistry};
use crate::route::RouteTable;
use crate::stream::StreamTable;
use crate::transport::{self, BoundListener};
use crate::{flood, mono_ms, socks};
use trellis_proto::AgentId;

/// Everything the engine's components share. One instance per agent
/// process, created by [`Agent::start`] and passed around explicitly.
pub struct EngineCtx {
    pub local_id: AgentId,
    pub settings: Settings,
    pub peers: PeerRegistry,
    pub routes: RouteTable,
    pub flood: Flood,
    pub streams: StreamTable,
    pub forward: ForwardTable,
    pub shutdown: watch::Sender<bool>,
}

/// One running agent.
pub struct Agent {
    ctx: Arc<EngineCtx>,
    listen_addrs: Vec<SocketAddr>,
    socks_addr: Option<SocketAddr>,
}

impl Agent {
    /// Validate, wire and start every component in the fixed startup
    /// order, then return the running agent.
    pub async fn start(settings: Settings, identity: Identity) -> Result<Agent, AgentError> {
        settings.validate()?;
        let (shutdown, _) = watch::channel(false);
        let limits = settings.limits.clone();
        let ctx = Arc::new(EngineCtx {
            local_id: identity.agent_id,
            settings,
            peers: PeerRegistry::default(),
            routes: RouteTable::default(),
            flood: Flood::default(),
            streams: StreamTable::new(limits),
            forward: ForwardTable::default(),
            shutdown,
        });
        info!(agent = %ctx.local_id.short(), "starting agent");

        // Exit routes are visible locally before any peer shows up.
        flood::advertise_local(&ctx).await;

        let mut listen_addrs = Vec::new();
        for listener_cfg in ctx.settings.listeners.clone() {
            let bound = transport::bind(&listener_cfg).await?;
            if let Some(addr) = bound.local_addr() {
                listen_addrs.push(addr);
            }
            info!(
                transport = %listener_cfg.transport,
                address = %listener_cfg.address,
                "listener up"
            );
            tokio::spawn(accept_loop(ctx.clone(), bound));
        }

        let mut socks_addr = None;
        if ctx.settings.socks5.enabled {
            let addr: SocketAddr = ctx
                .settings
                .socks5
                .address
                .parse()
                .expect("validated: socks5 address parses");
            let listener = TcpListener::bind(addr).await.map_err(|e| AgentError::Bind {
                addr: ctx.settings.socks5.address.clone(),
                source: e,
            })?;
            socks_addr = listener.local_addr().ok();
            tokio::spawn(socks::run(ctx.clone(), listener));
        }

        for peer_cfg in ctx.settings.peers.clone() {
            tokio::spawn(dialer_loop(ctx.clone(), peer_cfg));
        }

        tokio::spawn(run_timers(ctx.clone()));

        Ok(Agent { ctx, listen_addrs, socks_addr })
    }

    pub fn ctx(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    pub fn agent_id(&self) -> AgentId {
        self.ctx.local_id
    }

    /// Actual transport listener addresses (useful with port 0).
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Actual SOCKS5 address, when the ingress is enabled.
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_addr
    }

    /// Re-advertise local routes immediately (management surface and
    /// config-change hook).
    pub async fn trigger_advertise(&self) {
        flood::advertise_local(&self.ctx).await;
    }

    /// Orderly shutdown: stop accepting, reset active streams, close peer
    /// connections.
    pub async fn shutdown(&self) {
        info!(agent = %self.ctx.local_id.short(), "shutting down");
        let _ = self.ctx.shutdown.send(true);
        for peer in self.ctx.peers.all() {
            peer.kill();
        }
        // Give teardown tasks a beat to flush STREAM_RESETs.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    pub fn peers_view(&self) -> Vec<PeerView> {
        self.ctx
            .peers
            .all()
            .into_iter()
            .map(|p| PeerView {
                id: p.id().to_string(),
                transport: p.kind.to_string(),
                address: p.remote_addr.clone(),
                initiator: p.initiator,
                rtt_ms: p.rtt_ms(),
                idle_ms: mono_ms().saturating_sub(p.last_activity_ms()),
                capabilities: p.capabilities.clone(),
            })
            .collect()
    }

    pub fn routes_view(&self) -> Vec<RouteView> {
        let now = mono_ms();
        self.ctx
            .routes
            .snapshot()
            .into_iter()
            .map(|(target, entry)| RouteView {
                target,
                exit: entry.origin.to_string(),
                next_hop: entry.next_hop.to_string(),
                metric: entry.metric,
                sequence: entry.sequence,
                expires_in_secs: entry.expires_at_ms.saturating_sub(now) / 1000,
            })
            .collect()
    }

    pub fn health_view(&self) -> HealthView {
        HealthView {
            agent_id: self.ctx.local_id.to_string(),
            peers: self.ctx.peers.len(),
            endpoint_streams: self.ctx.streams.total(),
            forward_pairs: self.ctx.forward.len(),
        }
    }
}

/// Read-only management projections.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerView {
    pub id: String,
    pub transport: String,
    pub address: String,
    pub initiator: bool,
    pub rtt_ms: u64,
    pub idle_ms: u64,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteView {
    pub target: String,
    pub exit: String,
    pub next_hop: String,
    pub metric: u16,
    pub sequence: u64,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthView {
    pub agent_id: String,
    pub peers: usize,
    pub endpoint_streams: usize,
    pub forward_pairs: usize,
}

/// Accept transport connections and run each through handshake and the
/// peer loop in its own task.
async fn accept_loop(ctx: Arc<EngineCtx>, mut bound: BoundListener) {
    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        tokio::select! {
            incoming = bound.accept() => match incoming {
                Ok(incoming) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let link = match incoming.establish().await {
                            Ok(link) => link,
                            Err(e) => {
                                debug!(error = %e, "inbound connection failed to establish");
                                return;
                            }
                        };
                        match peer::handshake_acceptor(&ctx, link).await {
                            Ok(established) => peer::run_peer(ctx, established).await,
                            Err(e) => debug!(error = %e, "inbound handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "listener accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Dial one configured peer forever, with exponential backoff between
/// attempts. A completed handshake resets the backoff; the acceptor side
/// never dials.
async fn dialer_loop(ctx: Arc<EngineCtx>, cfg: PeerSettings) {
    let expected: Option<AgentId> = cfg
        .expected_agent_id
        .as_deref()
        .map(|s| s.parse().expect("validated: pinned agent id parses"));
    let reconnect = ctx.settings.connections.reconnect.clone();
    let mut shutdown = ctx.shutdown.subscribe();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }
        let session = async {
            let link = transport::dial(&cfg).await?;
            peer::handshake_initiator(&ctx, link, expected).await
        }
        .await;

        match session {
            Ok(established) => {
                failures = 0;
                peer::run_peer(ctx.clone(), established).await;
                info!(address = %cfg.address, "peer session ended, scheduling reconnect");
            }
            Err(e) => {
                failures += 1;
                warn!(
                    address = %cfg.address,
                    transport = %cfg.transport,
                    attempt = failures,
                    error = %e,
                    "dial failed"
                );
                if reconnect.max_retries > 0 && failures >= reconnect.max_retries {
                    warn!(address = %cfg.address, "giving up on peer after max retries");
                    return;
                }
            }
        }

        let delay = peer::reconnect_delay(&reconnect, failures.saturating_sub(1));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// The orchestrator's periodic work: flood advertisement, route expiry,
/// idle-stream reaping and stale forward entries.
async fn run_timers(ctx: Arc<EngineCtx>) {
    let mut advertise = tokio::time::interval(ctx.settings.routing.advertise_interval());
    let mut expiry = tokio::time::interval(Duration::from_secs(30));
    let mut stale_forward = tokio::time::interval(Duration::from_secs(300));
    advertise.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    stale_forward.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = advertise.tick() => flood::advertise_local(&ctx).await,
            _ = expiry.tick() => {
                let expired = ctx.routes.expire();
                if expired > 0 {
                    debug!(expired, "dropped expired routes");
                }
                ctx.streams.reap_idle(&ctx).await;
            }
            _ = stale_forward.tick() => {
                ctx.forward.reap_stale(&ctx, 300_000).await;
            }
            _ = shutdown.changed() => return,
        }
    }
}
