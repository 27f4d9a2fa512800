//! Transit forward table: `(incoming peer, stream) ↔ (outgoing peer, stream)`.
//!
//! Both directions of a pair live and die together under one lock, so the
//! symmetry invariant holds at every instant: if a leg is present, so is
//! its reverse. Closing or resetting one leg takes the whole pair down.
//! Exit-side streams are not in here; they live in the stream table with
//! their local socket.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::agent::EngineCtx;
use crate::mono_ms;
use crate::peer::{PeerHandle, StreamTx};
use trellis_proto::{AgentId, Frame, StreamErrorCode};

/// The opposite side of a forwarded stream, as seen from one leg.
pub struct ForwardLeg {
    pub peer: PeerHandle,
    pub stream_id: u64,
    pub tx: StreamTx,
}

struct Leg {
    peer: PeerHandle,
    stream_id: u64,
    tx: StreamTx,
}

struct Pair {
    a: Leg,
    b: Leg,
    /// FIN_WRITE observed travelling a→b.
    fin_ab: bool,
    /// FIN_WRITE observed travelling b→a.
    fin_ba: bool,
    last_activity_ms: u64,
}

#[derive(Default)]
struct Maps {
    by_leg: HashMap<(AgentId, u64), u64>,
    pairs: HashMap<u64, Pair>,
    next_id: u64,
}

#[derive(Default)]
pub struct ForwardTable {
    maps: Mutex<Maps>,
}

impl ForwardTable {
    pub fn len(&self) -> usize {
        self.maps.lock().pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.lock().pairs.is_empty()
    }

    /// Create both directions of a transit pair in one step.
    pub fn insert_pair(
        &self,
        in_peer: &PeerHandle,
        in_stream: u64,
        in_tx: StreamTx,
        out_peer: &PeerHandle,
        out_stream: u64,
        out_tx: StreamTx,
    ) {
        let mut maps = self.maps.lock();
        let id = maps.next_id;
        maps.next_id += 1;
        maps.by_leg.insert((in_peer.id(), in_stream), id);
        maps.by_leg.insert((out_peer.id(), out_stream), id);
        maps.pairs.insert(
            id,
            Pair {
                a: Leg { peer: in_peer.clone(), stream_id: in_stream, tx: in_tx },
                b: Leg { peer: out_peer.clone(), stream_id: out_stream, tx: out_tx },
                fin_ab: false,
                fin_ba: false,
                last_activity_ms: mono_ms(),
            },
        );
    }

    /// The opposite leg for a frame that arrived on `(peer, stream_id)`.
    pub fn lookup(&self, peer: &AgentId, stream_id: u64) -> Option<ForwardLeg> {
        let maps = self.maps.lock();
        let id = maps.by_leg.get(&(*peer, stream_id))?;
        let pair = maps.pairs.get(id)?;
        let other = if pair.a.peer.id() == *peer && pair.a.stream_id == stream_id {
            &pair.b
        } else {
            &pair.a
        };
        Some(ForwardLeg {
            peer: other.peer.clone(),
            stream_id: other.stream_id,
            tx: other.tx.clone(),
        })
    }

    pub fn touch(&self, peer: &AgentId, stream_id: u64) {
        let mut maps = self.maps.lock();
        if let Some(id) = maps.by_leg.get(&(*peer, stream_id)).copied() {
            if let Some(pair) = maps.pairs.get_mut(&id) {
                pair.last_activity_ms = mono_ms();
            }
        }
    }

    /// Record a FIN_WRITE that travelled from `(peer, stream_id)` towards
    /// the paired leg. Returns true once both directions have finished.
    pub fn mark_fin(&self, peer: &AgentId, stream_id: u64) -> bool {
        let mut maps = self.maps.lock();
        let Some(id) = maps.by_leg.get(&(*peer, stream_id)).copied() else {
            return false;
        };
        let Some(pair) = maps.pairs.get_mut(&id) else {
            return false;
        };
        if pair.a.peer.id() == *peer && pair.a.stream_id == stream_id {
            pair.fin_ab = true;
        } else {
            pair.fin_ba = true;
        }
        pair.fin_ab && pair.fin_ba
    }

    /// Drop a pair and release its resources. Sends nothing; callers that
    /// need to notify a leg do so before removal.
    pub fn remove_pair(&self, ctx: &EngineCtx, peer: &AgentId, stream_id: u64) {
        let pair = {
            let mut maps = self.maps.lock();
            let Some(id) = maps.by_leg.remove(&(*peer, stream_id)) else {
                return;
            };
            let Some(pair) = maps.pairs.remove(&id) else {
                return;
            };
            let other = if pair.a.peer.id() == *peer && pair.a.stream_id == stream_id {
                (pair.b.peer.id(), pair.b.stream_id)
            } else {
                (pair.a.peer.id(), pair.a.stream_id)
            };
            maps.by_leg.remove(&other);
            pair
        };
        release_pair(ctx, &pair);
    }

    /// Tear down every pair with a leg on `peer`: the opposite leg gets a
    /// STREAM_RESET and the pair is removed.
    pub async fn purge_peer(&self, ctx: &EngineCtx, peer: &AgentId) {
        let victims: Vec<Pair> = {
            let mut maps = self.maps.lock();
            let ids: Vec<u64> = maps
                .pairs
                .iter()
                .filter(|(_, p)| p.a.peer.id() == *peer || p.b.peer.id() == *peer)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let pair = maps.pairs.remove(&id)?;
                    maps.by_leg.remove(&(pair.a.peer.id(), pair.a.stream_id));
                    maps.by_leg.remove(&(pair.b.peer.id(), pair.b.stream_id));
                    Some(pair)
                })
                .collect()
        };
        for pair in victims {
            let other = if pair.a.peer.id() == *peer { &pair.b } else { &pair.a };
            let _ = other
                .tx
                .send(Frame::reset(other.stream_id, StreamErrorCode::NoRoute))
                .await;
            release_pair(ctx, &pair);
        }
    }

    /// Reset pairs that have carried nothing for the stale window. Runs
    /// from the orchestrator's periodic scan.
    pub async fn reap_stale(&self, ctx: &EngineCtx, max_idle_ms: u64) {
        let cutoff = mono_ms().saturating_sub(max_idle_ms);
        let victims: Vec<Pair> = {
            let mut maps = self.maps.lock();
            let ids: Vec<u64> = maps
                .pairs
                .iter()
                .filter(|(_, p)| p.last_activity_ms < cutoff)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let pair = maps.pairs.remove(&id)?;
                    maps.by_leg.remove(&(pair.a.peer.id(), pair.a.stream_id));
                    maps.by_leg.remove(&(pair.b.peer.id(), pair.b.stream_id));
                    Some(pair)
                })
                .collect()
        };
        for pair in victims {
            debug!(
                in_peer = %pair.a.peer.id().short(),
                out_peer = %pair.b.peer.id().short(),
                "reaping stale forward pair"
            );
            for leg in [&pair.a, &pair.b] {
                let _ = leg
                    .tx
                    .send(Frame::reset(leg.stream_id, StreamErrorCode::ConnectionTimeout))
                    .await;
            }
            release_pair(ctx, &pair);
        }
    }
}

fn release_pair(ctx: &EngineCtx, pair: &Pair) {
    for leg in [&pair.a, &pair.b] {
        ctx.streams.release(&leg.peer.id());
        leg.peer.unregister_stream(leg.stream_id);
    }
}
