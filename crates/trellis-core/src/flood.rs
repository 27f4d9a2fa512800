//! Flooded route advertisement and withdrawal.
//!
//! Exit agents advertise their configured prefixes and domain patterns on a
//! timer (and immediately on demand). Propagation is a classic flood with
//! `seen_by` loop prevention and per-origin sequence freshness: every agent
//! processes one advertisement exactly once, stale sequences are dropped,
//! and metrics grow by one per hop until `max_hops` cuts the flood off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::agent::EngineCtx;
use crate::peer::PeerHandle;
use crate::route::RouteEntry;
use crate::mono_ms;
use trellis_proto::{
    AdvertisedRoute, AgentId, Frame, FramePayload, RouteAdvertise, RouteTarget, RouteWithdraw,
};

/// Flood state: our own sequence, per-origin freshness, and the last set we
/// advertised (for withdraw diffing).
pub struct Flood {
    sequence: AtomicU64,
    last_seen: Mutex<HashMap<AgentId, u64>>,
    advertised: Mutex<Vec<AdvertisedRoute>>,
}

impl Default for Flood {
    fn default() -> Self {
        Flood {
            sequence: AtomicU64::new(1),
            last_seen: Mutex::new(HashMap::new()),
            advertised: Mutex::new(Vec::new()),
        }
    }
}

impl Flood {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Accept a message from `origin` with `sequence` if it is fresh.
    fn accept(&self, origin: AgentId, sequence: u64) -> bool {
        let mut last_seen = self.last_seen.lock();
        match last_seen.get(&origin) {
            Some(last) if sequence <= *last => false,
            _ => {
                last_seen.insert(origin, sequence);
                true
            }
        }
    }

}

/// The set this agent currently offers as an exit.
fn local_routes(ctx: &EngineCtx) -> Vec<AdvertisedRoute> {
    let mut routes = Vec::new();
    if !ctx.settings.exit.enabled {
        return routes;
    }
    for net in ctx.settings.exit_cidrs() {
        routes.push(AdvertisedRoute {
            target: RouteTarget::Cidr { prefix: net.network(), prefix_len: net.prefix_len() },
            metric: 0,
        });
    }
    for pattern in &ctx.settings.exit.domain_patterns {
        routes.push(AdvertisedRoute { target: RouteTarget::Domain(pattern.clone()), metric: 0 });
    }
    routes
}

fn install_local(ctx: &EngineCtx, routes: &[AdvertisedRoute], sequence: u64) {
    let ttl = ctx.settings.routing.route_ttl().as_millis() as u64;
    for route in routes {
        let entry = RouteEntry {
            origin: ctx.local_id,
            next_hop: ctx.local_id,
            path: Vec::new(),
            metric: 0,
            sequence,
            expires_at_ms: mono_ms() + ttl,
        };
        match &route.target {
            RouteTarget::Cidr { prefix, prefix_len } => {
                if let Ok(net) = IpNet::new(*prefix, *prefix_len) {
                    ctx.routes.insert_cidr(net, entry);
                }
            }
            RouteTarget::Domain(pattern) => ctx.routes.insert_domain(pattern, entry),
        }
    }
}

/// Advertise our exit routes to every connected peer; called on the
/// interval timer and by `trigger_advertise`. Emits eager withdrawals for
/// anything dropped from the advertised set since last time (expiry remains
/// the authoritative cleanup on the far side).
pub async fn advertise_local(ctx: &Arc<EngineCtx>) {
    let routes = local_routes(ctx);
    let withdrawn: Vec<AdvertisedRoute> = {
        let mut advertised = ctx.flood.advertised.lock();
        let gone = advertised
            .iter()
            .filter(|old| !routes.iter().any(|r| r.target == old.target))
            .cloned()
            .collect();
        *advertised = routes.clone();
        gone
    };

    if !withdrawn.is_empty() {
        let withdraw = RouteWithdraw {
            origin: ctx.local_id,
            sequence: ctx.flood.next_sequence(),
            routes: withdrawn,
            seen_by: vec![ctx.local_id],
        };
        info!(count = withdraw.routes.len(), "withdrawing dropped local routes");
        let frame = Frame::control(FramePayload::RouteWithdraw(withdraw));
        for peer in ctx.peers.all() {
            let _ = peer.send_control(frame.clone()).await;
        }
    }

    if routes.is_empty() {
        return;
    }
    let sequence = ctx.flood.next_sequence();
    install_local(ctx, &routes, sequence);
    let advertise = RouteAdvertise {
        origin: ctx.local_id,
        sequence,
        routes,
        path: vec![ctx.local_id],
        seen_by: vec![ctx.local_id],
    };
    let frame = Frame::control(FramePayload::RouteAdvertise(advertise));
    for peer in ctx.peers.all() {
        let _ = peer.send_control(frame.clone()).await;
    }
}

/// Send our current advertisement to exactly one (fresh) peer.
pub async fn advertise_to_peer(ctx: &Arc<EngineCtx>, peer: &PeerHandle) {
    let routes = local_routes(ctx);
    if routes.is_empty() {
        return;
    }
    let sequence = ctx.flood.next_sequence();
    install_local(ctx, &routes, sequence);
    *ctx.flood.advertised.lock() = routes.clone();
    let advertise = RouteAdvertise {
        origin: ctx.local_id,
        sequence,
        routes,
        path: vec![ctx.local_id],
        seen_by: vec![ctx.local_id],
    };
    let _ = peer
        .send_control(Frame::control(FramePayload::RouteAdvertise(advertise)))
        .await;
}

/// Receiver algorithm for ROUTE_ADVERTISE.
pub async fn handle_advertise(ctx: &Arc<EngineCtx>, from: &PeerHandle, adv: RouteAdvertise) {
    // Loop prevention, then freshness.
    if adv.origin == ctx.local_id || adv.seen_by.contains(&ctx.local_id) {
        return;
    }
    if !ctx.flood.accept(adv.origin, adv.sequence) {
        debug!(origin = %adv.origin.short(), sequence = adv.sequence, "stale advertisement");
        return;
    }

    // Install every carried route with us one hop further out.
    let ttl = ctx.settings.routing.route_ttl().as_millis() as u64;
    let path = adv.path.clone();
    for route in &adv.routes {
        let entry = RouteEntry {
            origin: adv.origin,
            next_hop: from.id(),
            path: path.clone(),
            metric: route.metric.saturating_add(1),
            sequence: adv.sequence,
            expires_at_ms: mono_ms() + ttl,
        };
        match &route.target {
            RouteTarget::Cidr { prefix, prefix_len } => {
                if let Ok(net) = IpNet::new(*prefix, *prefix_len) {
                    ctx.routes.insert_cidr(net, entry);
                }
            }
            RouteTarget::Domain(pattern) => ctx.routes.insert_domain(pattern, entry),
        }
    }
    debug!(
        origin = %adv.origin.short(),
        via = %from.id().short(),
        routes = adv.routes.len(),
        sequence = adv.sequence,
        "installed flooded routes"
    );

    // Forward once, with ourselves stamped in, to peers that have not seen
    // it. Routes pushed past max_hops stop here.
    let max_hops = ctx.settings.routing.max_hops as u16;
    let forwarded_routes: Vec<AdvertisedRoute> = adv
        .routes
        .iter()
        .filter(|r| r.metric.saturating_add(1) <= max_hops)
        .map(|r| AdvertisedRoute { target: r.target.clone(), metric: r.metric.saturating_add(1) })
        .collect();
    if forwarded_routes.is_empty() {
        return;
    }
    if adv.seen_by.len() >= u8::MAX as usize || adv.path.len() >= u8::MAX as usize {
        return;
    }

    let mut seen_by = adv.seen_by.clone();
    seen_by.push(ctx.local_id);
    let mut path = vec![ctx.local_id];
    path.extend_from_slice(&adv.path);

    let forwarded = RouteAdvertise {
        origin: adv.origin,
        sequence: adv.sequence,
        routes: forwarded_routes,
        path,
        seen_by: seen_by.clone(),
    };
    let frame = Frame::control(FramePayload::RouteAdvertise(forwarded));
    for peer in ctx.peers.all() {
        if peer.id() == from.id() || seen_by.contains(&peer.id()) {
            continue;
        }
        let _ = peer.send_control(frame.clone()).await;
    }
}

/// Receiver algorithm for ROUTE_WITHDRAW: symmetric to advertise.
pub async fn handle_withdraw(ctx: &Arc<EngineCtx>, from: &PeerHandle, withdraw: RouteWithdraw) {
    if withdraw.origin == ctx.local_id || withdraw.seen_by.contains(&ctx.local_id) {
        return;
    }
    if !ctx.flood.accept(withdraw.origin, withdraw.sequence) {
        return;
    }

    let mut removed = 0;
    for route in &withdraw.routes {
        let gone = match &route.target {
            RouteTarget::Cidr { prefix, prefix_len } => match IpNet::new(*prefix, *prefix_len) {
                Ok(net) => ctx.routes.remove_cidr(&withdraw.origin, net),
                Err(_) => false,
            },
            RouteTarget::Domain(pattern) => ctx.routes.remove_domain(&withdraw.origin, pattern),
        };
        if gone {
            removed += 1;
        }
    }
    if removed > 0 {
        info!(
            origin = %withdraw.origin.short(),
            removed,
            "withdrew flooded routes"
        );
    }

    if withdraw.seen_by.len() >= u8::MAX as usize {
        return;
    }
    let mut seen_by = withdraw.seen_by.clone();
    seen_by.push(ctx.local_id);
    let forwarded = RouteWithdraw {
        origin: withdraw.origin,
        sequence: withdraw.sequence,
        routes: withdraw.routes.clone(),
        seen_by: seen_by.clone(),
    };
    let frame = Frame::control(FramePayload::RouteWithdraw(forwarded));
    for peer in ctx.peers.all() {
        if peer.id() == from.id() || seen_by.contains(&peer.id()) {
            continue;
        }
        let _ = peer.send_control(frame.clone()).await;
    }
}
