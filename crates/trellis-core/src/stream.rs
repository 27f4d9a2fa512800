//! Virtual streams: state machine, endpoint plumbing and resource limits.
//!
//! Streams are referenced everywhere by `(peer, stream_id)` handles; the
//! table here owns endpoint state (ingress and exit ends), while transit
//! hops live in the forward table. Half-close mirrors TCP: FIN_WRITE closes
//! one direction, the stream is released once both directions are done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::agent::EngineCtx;
use crate::config::LimitSettings;
use crate::crypto::{OpenHalf, SealHalf, Side, StreamKeys, MAX_PLAINTEXT};
use crate::error::StreamError;
use crate::peer::{PeerHandle, StreamTx};
use crate::route::RouteMatch;
use crate::{exit, mono_ms};
use trellis_proto::{
    BoundAddr, Frame, FrameFlags, FramePayload, StreamErrorCode, StreamOpen, StreamOpenAck,
    StreamOpenErr, TargetAddr, AgentId, MAX_PAYLOAD_LEN,
};

/// Events delivered to an endpoint's read half.
#[derive(Debug)]
pub enum StreamEvent {
    /// One sealed record (or raw bytes before decryption).
    Data(Bytes),
    /// Remote finished writing.
    Fin,
    Reset(StreamErrorCode),
}

struct StreamEntry {
    event_tx: mpsc::Sender<StreamEvent>,
    tx: StreamTx,
    local_fin: bool,
    remote_fin: bool,
    last_data_ms: u64,
}

struct PendingOpen {
    reply: oneshot::Sender<Result<StreamOpenAck, StreamOpenErr>>,
    peer: AgentId,
    stream_id: u64,
}

/// Endpoint-stream registry plus the resource accounting shared with the
/// forward table.
pub struct StreamTable {
    limits: LimitSettings,
    entries: Mutex<HashMap<(AgentId, u64), StreamEntry>>,
    per_peer: Mutex<HashMap<AgentId, usize>>,
    total: AtomicUsize,
    pending: Mutex<HashMap<u64, PendingOpen>>,
    next_request_id: AtomicU64,
}

impl StreamTable {
    pub fn new(limits: LimitSettings) -> Self {
        StreamTable {
            limits,
            entries: Mutex::new(HashMap::new()),
            per_peer: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Claim one stream slot against the per-peer and global caps.
    pub fn try_reserve(&self, peer: &AgentId) -> bool {
        let mut per_peer = self.per_peer.lock();
        let count = per_peer.entry(*peer).or_insert(0);
        if *count >= self.limits.max_streams_per_peer {
            return false;
        }
        if self.total.load(Ordering::Relaxed) >= self.limits.max_streams_total {
            return false;
        }
        *count += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn release(&self, peer: &AgentId) {
        let mut per_peer = self.per_peer.lock();
        if let Some(count) = per_peer.get_mut(peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_peer.remove(peer);
            }
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn register_entry(
        &self,
        peer: AgentId,
        stream_id: u64,
        event_tx: mpsc::Sender<StreamEvent>,
        tx: StreamTx,
    ) {
        self.entries.lock().insert(
            (peer, stream_id),
            StreamEntry {
                event_tx,
                tx,
                local_fin: false,
                remote_fin: false,
                last_data_ms: mono_ms(),
            },
        );
    }

    fn remove_entry(&self, peer: &AgentId, stream_id: u64) -> bool {
        let removed = self.entries.lock().remove(&(*peer, stream_id)).is_some();
        if removed {
            self.release(peer);
        }
        removed
    }

    /// Record that our write half closed; returns true when the remote side
    /// is also done and the entry was released.
    fn local_fin(&self, peer: &AgentId, stream_id: u64) -> bool {
        let done = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&(*peer, stream_id)) {
                Some(entry) => {
                    entry.local_fin = true;
                    entry.remote_fin
                }
                None => return true,
            }
        };
        if done {
            self.remove_entry(peer, stream_id);
        }
        done
    }

    fn insert_pending(&self, request_id: u64, pending: PendingOpen) -> bool {
        let mut map = self.pending.lock();
        if map.len() >= self.limits.max_pending_opens {
            return false;
        }
        map.insert(request_id, pending);
        true
    }

    fn take_pending(&self, request_id: u64, peer: &AgentId, stream_id: u64) -> Option<PendingOpen> {
        let mut map = self.pending.lock();
        match map.get(&request_id) {
            Some(p) if p.peer == *peer && p.stream_id == stream_id => map.remove(&request_id),
            _ => None,
        }
    }

    fn drop_pending(&self, request_id: u64) {
        self.pending.lock().remove(&request_id);
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Tear down every endpoint stream and pending open riding `peer`.
    pub async fn fail_peer(&self, _ctx: &EngineCtx, peer: &PeerHandle) {
        let id = peer.id();
        let victims: Vec<_> = {
            let mut entries = self.entries.lock();
            let keys: Vec<_> = entries.keys().filter(|(p, _)| *p == id).copied().collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.event_tx)))
                .collect()
        };
        for ((peer_id, stream_id), event_tx) in victims {
            self.release(&peer_id);
            peer.unregister_stream(stream_id);
            let _ = event_tx.send(StreamEvent::Reset(StreamErrorCode::NoRoute)).await;
        }

        let failed: Vec<_> = {
            let mut pending = self.pending.lock();
            let keys: Vec<_> = pending
                .iter()
                .filter(|(_, p)| p.peer == id)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter().filter_map(|k| pending.remove(&k)).collect()
        };
        for pending in failed {
            let _ = pending.reply.send(Err(StreamOpenErr {
                request_id: 0,
                code: StreamErrorCode::NoRoute,
                message: "peer disconnected".into(),
            }));
        }
    }

    /// Reset endpoint streams that have moved no data in either direction
    /// for the idle timeout. Runs from the orchestrator's periodic scan.
    pub async fn reap_idle(&self, ctx: &EngineCtx) {
        let cutoff = mono_ms().saturating_sub(ctx.settings.limits.idle_stream_timeout().as_millis() as u64);
        let victims: Vec<_> = {
            let mut entries = self.entries.lock();
            let keys: Vec<_> = entries
                .iter()
                .filter(|(_, e)| e.last_data_ms < cutoff)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };
        for ((peer_id, stream_id), entry) in victims {
            debug!(peer = %peer_id.short(), stream = stream_id, "resetting idle stream");
            self.release(&peer_id);
            let _ = entry
                .tx
                .send(Frame::reset(stream_id, StreamErrorCode::ConnectionTimeout))
                .await;
            let _ = entry
                .event_tx
                .send(StreamEvent::Reset(StreamErrorCode::ConnectionTimeout))
                .await;
            if let Some(peer) = ctx.peers.get(&peer_id) {
                peer.unregister_stream(stream_id);
            }
        }
    }
}

pub fn open_err_frame(stream_id: u64, request_id: u64, code: StreamErrorCode, message: &str) -> Frame {
    Frame {
        stream_id,
        flags: FrameFlags::empty(),
        payload: FramePayload::StreamOpenErr(StreamOpenErr {
            request_id,
            code,
            message: message.into(),
        }),
    }
}

fn event_channel_depth(buffer_size: usize) -> usize {
    (buffer_size / MAX_PAYLOAD_LEN).max(1)
}

/// An opened endpoint stream with its E2E session in place.
pub struct OpenedStream {
    pub bound: BoundAddr,
    pub read: StreamReadHalf,
    pub write: StreamWriteHalf,
}

/// Open a stream through the mesh from this (ingress) agent.
///
/// Sends STREAM_OPEN along the route's path, waits for the ACK or ERR
/// within the configured open timeout, and derives the E2E session from the
/// exchanged ephemeral keys.
pub async fn open_endpoint_stream(
    ctx: &Arc<EngineCtx>,
    route: &RouteMatch,
    target: TargetAddr,
) -> Result<OpenedStream, StreamErrorCode> {
    let Some(peer) = ctx.peers.get(&route.next_hop) else {
        return Err(StreamErrorCode::NoRoute);
    };
    if !ctx.streams.try_reserve(&peer.id()) {
        return Err(StreamErrorCode::ResourceLimit);
    }

    let request_id = ctx.streams.next_request_id();
    let stream_id = peer.alloc_stream_id();
    let Ok(tx) = peer.register_stream(stream_id).await else {
        ctx.streams.release(&peer.id());
        return Err(StreamErrorCode::NoRoute);
    };

    let (event_tx, event_rx) = mpsc::channel(event_channel_depth(ctx.settings.limits.buffer_size));
    ctx.streams.register_entry(peer.id(), stream_id, event_tx, tx.clone());

    let (reply_tx, reply_rx) = oneshot::channel();
    let pending = PendingOpen { reply: reply_tx, peer: peer.id(), stream_id };
    if !ctx.streams.insert_pending(request_id, pending) {
        ctx.streams.remove_entry(&peer.id(), stream_id);
        peer.unregister_stream(stream_id);
        return Err(StreamErrorCode::ResourceLimit);
    }

    let keys = StreamKeys::generate();
    let open = StreamOpen {
        request_id,
        target,
        ttl: ctx.settings.routing.max_hops,
        // The next hop is implicit in where we send; the frame carries the
        // hops after it.
        path: route.path.get(1..).unwrap_or_default().to_vec(),
        ephemeral_pub: keys.public_bytes(),
    };
    let frame = Frame {
        stream_id,
        flags: FrameFlags::empty(),
        payload: FramePayload::StreamOpen(open),
    };
    if tx.send(frame).await.is_err() {
        ctx.streams.drop_pending(request_id);
        ctx.streams.remove_entry(&peer.id(), stream_id);
        peer.unregister_stream(stream_id);
        return Err(StreamErrorCode::NoRoute);
    }

    let reply = match timeout(ctx.settings.limits.stream_open_timeout(), reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => {
            // Peer torn down while we waited; table state went with it.
            return Err(StreamErrorCode::NoRoute);
        }
        Err(_) => {
            // Synthesize the error locally and abandon the half-open stream.
            ctx.streams.drop_pending(request_id);
            ctx.streams.remove_entry(&peer.id(), stream_id);
            let _ = tx
                .send(Frame::reset(stream_id, StreamErrorCode::ConnectionTimeout))
                .await;
            peer.unregister_stream(stream_id);
            return Err(StreamErrorCode::ConnectionTimeout);
        }
    };

    match reply {
        Ok(ack) => {
            let session = keys.into_session(&ack.ephemeral_pub, Side::Ingress);
            let (seal, open_half) = session.split();
            Ok(OpenedStream {
                bound: ack.bound,
                read: StreamReadHalf {
                    ctx: ctx.clone(),
                    peer: peer.clone(),
                    stream_id,
                    tx: tx.clone(),
                    rx: event_rx,
                    open: open_half,
                    finished: false,
                },
                write: StreamWriteHalf {
                    ctx: ctx.clone(),
                    peer,
                    stream_id,
                    tx,
                    seal,
                    closed: false,
                },
            })
        }
        Err(err) => {
            ctx.streams.remove_entry(&peer.id(), stream_id);
            peer.unregister_stream(stream_id);
            Err(err.code)
        }
    }
}

/// Build the endpoint halves on the exit side, after the dial succeeded and
/// before the ACK goes out.
pub fn exit_endpoint(
    ctx: &Arc<EngineCtx>,
    peer: &PeerHandle,
    stream_id: u64,
    tx: StreamTx,
    remote_public: &[u8; 32],
) -> (StreamReadHalf, StreamWriteHalf, [u8; 32]) {
    let keys = StreamKeys::generate();
    let public = keys.public_bytes();
    let session = keys.into_session(remote_public, Side::Exit);
    let (seal, open_half) = session.split();

    let (event_tx, event_rx) = mpsc::channel(event_channel_depth(ctx.settings.limits.buffer_size));
    ctx.streams.register_entry(peer.id(), stream_id, event_tx, tx.clone());

    (
        StreamReadHalf {
            ctx: ctx.clone(),
            peer: peer.clone(),
            stream_id,
            tx: tx.clone(),
            rx: event_rx,
            open: open_half,
            finished: false,
        },
        StreamWriteHalf {
            ctx: ctx.clone(),
            peer: peer.clone(),
            stream_id,
            tx,
            seal,
            closed: false,
        },
        public,
    )
}

/// Receiving half of an endpoint stream.
pub struct StreamReadHalf {
    ctx: Arc<EngineCtx>,
    peer: PeerHandle,
    stream_id: u64,
    tx: StreamTx,
    rx: mpsc::Receiver<StreamEvent>,
    open: OpenHalf,
    finished: bool,
}

impl StreamReadHalf {
    /// Next decrypted chunk; `None` once the remote half-closed.
    ///
    /// A record that fails authentication or replay checks aborts the whole
    /// stream with STREAM_RESET before the error is surfaced.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.rx.recv().await {
                None => return Err(StreamError::Closed),
                Some(StreamEvent::Data(record)) => match self.open.open(&record) {
                    Ok(plaintext) => return Ok(Some(Bytes::from(plaintext))),
                    Err(e) => {
                        self.finished = true;
                        let _ = self
                            .tx
                            .send(Frame::reset(self.stream_id, StreamErrorCode::ExitDisabled))
                            .await;
                        self.ctx.streams.remove_entry(&self.peer.id(), self.stream_id);
                        self.peer.unregister_stream(self.stream_id);
                        return Err(StreamError::Crypto(e));
                    }
                },
                Some(StreamEvent::Fin) => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(StreamEvent::Reset(code)) => return Err(StreamError::Reset(code)),
            }
        }
    }
}

/// Sending half of an endpoint stream.
pub struct StreamWriteHalf {
    ctx: Arc<EngineCtx>,
    peer: PeerHandle,
    stream_id: u64,
    tx: StreamTx,
    seal: SealHalf,
    closed: bool,
}

impl StreamWriteHalf {
    /// Seal and send, chunked to the record size.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        for chunk in data.chunks(MAX_PLAINTEXT) {
            let record = self.seal.seal(chunk).map_err(StreamError::Crypto)?;
            self.tx.send(Frame::data(self.stream_id, record.into())).await?;
        }
        Ok(())
    }

    /// Half-close: signal we are done writing while reads continue.
    pub async fn close_write(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .tx
            .send(Frame::close(self.stream_id, FrameFlags::FIN_WRITE))
            .await;
        if self.ctx.streams.local_fin(&self.peer.id(), self.stream_id) {
            self.peer.unregister_stream(self.stream_id);
        }
    }

    /// Abort the stream both ways.
    pub async fn reset(&mut self, code: StreamErrorCode) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Frame::reset(self.stream_id, code)).await;
        self.ctx.streams.remove_entry(&self.peer.id(), self.stream_id);
        self.peer.unregister_stream(self.stream_id);
    }
}

/// STREAM_OPEN arriving from a peer: exit here, or forward along the path.
pub async fn handle_open(ctx: &Arc<EngineCtx>, peer: &PeerHandle, stream_id: u64, open: StreamOpen) {
    if open.path.is_empty() {
        // We are the exit.
        if !ctx.settings.exit.enabled {
            let frame = open_err_frame(
                stream_id,
                open.request_id,
                StreamErrorCode::ExitDisabled,
                "exit not enabled on this agent",
            );
            let _ = peer.send_control(frame).await;
            return;
        }
        if !ctx.streams.try_reserve(&peer.id()) {
            let frame = open_err_frame(
                stream_id,
                open.request_id,
                StreamErrorCode::ResourceLimit,
                "stream limit reached",
            );
            let _ = peer.send_control(frame).await;
            return;
        }
        // The dial can take seconds; never block frame dispatch on it.
        let ctx = ctx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            exit::handle_exit_open(ctx, peer, stream_id, open).await;
        });
        return;
    }

    // Transit hop.
    if open.ttl <= 1 {
        let frame = open_err_frame(
            stream_id,
            open.request_id,
            StreamErrorCode::TtlExceeded,
            "path exceeded ttl",
        );
        let _ = peer.send_control(frame).await;
        return;
    }
    let next_hop = open.path[0];
    let Some(next_peer) = ctx.peers.get(&next_hop) else {
        let frame = open_err_frame(
            stream_id,
            open.request_id,
            StreamErrorCode::NoRoute,
            "next hop not connected",
        );
        let _ = peer.send_control(frame).await;
        return;
    };
    if next_peer.id() == peer.id() {
        let frame = open_err_frame(
            stream_id,
            open.request_id,
            StreamErrorCode::NoRoute,
            "path loops back",
        );
        let _ = peer.send_control(frame).await;
        return;
    }

    if !ctx.streams.try_reserve(&peer.id()) {
        let frame = open_err_frame(
            stream_id,
            open.request_id,
            StreamErrorCode::ResourceLimit,
            "stream limit reached",
        );
        let _ = peer.send_control(frame).await;
        return;
    }
    if !ctx.streams.try_reserve(&next_peer.id()) {
        ctx.streams.release(&peer.id());
        let frame = open_err_frame(
            stream_id,
            open.request_id,
            StreamErrorCode::ResourceLimit,
            "stream limit reached",
        );
        let _ = peer.send_control(frame).await;
        return;
    }

    let out_id = next_peer.alloc_stream_id();
    let (in_tx, out_tx) = match (peer.reply_handle(stream_id).await, next_peer.register_stream(out_id).await)
    {
        (Ok(in_tx), Ok(out_tx)) => (in_tx, out_tx),
        _ => {
            ctx.streams.release(&peer.id());
            ctx.streams.release(&next_peer.id());
            let frame = open_err_frame(
                stream_id,
                open.request_id,
                StreamErrorCode::NoRoute,
                "next hop unavailable",
            );
            let _ = peer.send_control(frame).await;
            return;
        }
    };

    ctx.forward
        .insert_pair(peer, stream_id, in_tx, &next_peer, out_id, out_tx.clone());

    let forwarded = StreamOpen {
        request_id: open.request_id,
        target: open.target,
        ttl: open.ttl - 1,
        path: open.path[1..].to_vec(),
        ephemeral_pub: open.ephemeral_pub,
    };
    let frame = Frame {
        stream_id: out_id,
        flags: FrameFlags::empty(),
        payload: FramePayload::StreamOpen(forwarded),
    };
    if out_tx.send(frame).await.is_err() {
        ctx.forward.remove_pair(ctx, &peer.id(), stream_id);
        let frame = open_err_frame(
            stream_id,
            open.request_id,
            StreamErrorCode::NoRoute,
            "next hop send failed",
        );
        let _ = peer.send_control(frame).await;
    }
}

/// STREAM_OPEN_ACK / STREAM_OPEN_ERR arriving from a peer.
pub async fn handle_open_reply(ctx: &Arc<EngineCtx>, peer: &PeerHandle, frame: Frame) {
    let (request_id, failed) = match &frame.payload {
        FramePayload::StreamOpenAck(ack) => (ack.request_id, false),
        FramePayload::StreamOpenErr(err) => (err.request_id, true),
        _ => return,
    };

    // Originator side: a pending open waits on this request.
    if let Some(pending) = ctx.streams.take_pending(request_id, &peer.id(), frame.stream_id) {
        let result = match frame.payload {
            FramePayload::StreamOpenAck(ack) => Ok(ack),
            FramePayload::StreamOpenErr(err) => Err(err),
            _ => unreachable!(),
        };
        if failed {
            ctx.streams.remove_entry(&peer.id(), frame.stream_id);
            peer.unregister_stream(frame.stream_id);
        }
        let _ = pending.reply.send(result);
        return;
    }

    // Transit: mirror the reply to the paired leg, payload untouched.
    if let Some(leg) = ctx.forward.lookup(&peer.id(), frame.stream_id) {
        let mirrored = Frame {
            stream_id: leg.stream_id,
            flags: frame.flags,
            payload: frame.payload,
        };
        let delivered = leg.tx.send(mirrored).await.is_ok();
        if failed || !delivered {
            ctx.forward.remove_pair(ctx, &peer.id(), frame.stream_id);
        }
        return;
    }

    debug!(
        peer = %peer.id().short(),
        stream = frame.stream_id,
        request = request_id,
        "open reply for unknown stream"
    );
    if !failed {
        let _ = peer
            .send_control(Frame::reset(frame.stream_id, StreamErrorCode::NoRoute))
            .await;
    }
}

/// STREAM_DATA / STREAM_CLOSE / STREAM_RESET arriving from a peer.
pub async fn handle_stream_frame(ctx: &Arc<EngineCtx>, peer: &PeerHandle, frame: Frame) {
    // Transit leg?
    if let Some(leg) = ctx.forward.lookup(&peer.id(), frame.stream_id) {
        forward_frame(ctx, peer, frame, leg).await;
        return;
    }

    // Endpoint stream?
    let entry_info = {
        let mut entries = ctx.streams.entries.lock();
        entries.get_mut(&(peer.id(), frame.stream_id)).map(|entry| {
            entry.last_data_ms = mono_ms();
            entry.event_tx.clone()
        })
    };
    let Some(event_tx) = entry_info else {
        if !matches!(frame.payload, FramePayload::StreamReset { .. }) {
            let _ = peer
                .send_control(Frame::reset(frame.stream_id, StreamErrorCode::NoRoute))
                .await;
        }
        return;
    };

    match frame.payload {
        FramePayload::StreamData(bytes) => {
            // Zero-length data frames are legal no-ops; activity already
            // counted.
            if !bytes.is_empty() {
                let _ = event_tx.send(StreamEvent::Data(bytes)).await;
            }
        }
        FramePayload::StreamClose => {
            let full_close = frame.flags.contains(FrameFlags::FIN_WRITE | FrameFlags::FIN_READ);
            let release = {
                let mut entries = ctx.streams.entries.lock();
                match entries.get_mut(&(peer.id(), frame.stream_id)) {
                    Some(entry) if frame.flags.contains(FrameFlags::FIN_WRITE) => {
                        entry.remote_fin = true;
                        full_close || entry.local_fin
                    }
                    _ => false,
                }
            };
            if frame.flags.contains(FrameFlags::FIN_WRITE) {
                let _ = event_tx.send(StreamEvent::Fin).await;
            }
            if release {
                ctx.streams.remove_entry(&peer.id(), frame.stream_id);
                peer.unregister_stream(frame.stream_id);
            }
        }
        FramePayload::StreamReset { code } => {
            ctx.streams.remove_entry(&peer.id(), frame.stream_id);
            peer.unregister_stream(frame.stream_id);
            let _ = event_tx.send(StreamEvent::Reset(code)).await;
        }
        _ => {}
    }
}

/// Forward one stream frame across a transit pair.
async fn forward_frame(
    ctx: &Arc<EngineCtx>,
    peer: &PeerHandle,
    frame: Frame,
    leg: crate::forward::ForwardLeg,
) {
    ctx.forward.touch(&peer.id(), frame.stream_id);
    let is_reset = matches!(frame.payload, FramePayload::StreamReset { .. });
    let fin_write = frame.flags.contains(FrameFlags::FIN_WRITE);
    let full_close = frame.flags.contains(FrameFlags::FIN_WRITE | FrameFlags::FIN_READ);

    let mirrored = Frame {
        stream_id: leg.stream_id,
        flags: frame.flags,
        payload: frame.payload,
    };
    let delivered = leg.tx.send(mirrored).await.is_ok();

    if is_reset || !delivered {
        ctx.forward.remove_pair(ctx, &peer.id(), frame.stream_id);
        if !delivered && !is_reset {
            // The outgoing side is gone; tell the incoming side.
            if let Some(reply) = peer.lookup_stream(frame.stream_id) {
                let _ = reply
                    .send(Frame::reset(frame.stream_id, StreamErrorCode::NoRoute))
                    .await;
            }
        }
        return;
    }

    if fin_write {
        let both_done = full_close || ctx.forward.mark_fin(&peer.id(), frame.stream_id);
        if both_done {
            ctx.forward.remove_pair(ctx, &peer.id(), frame.stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LimitSettings {
        LimitSettings {
            max_streams_per_peer: 2,
            max_streams_total: 3,
            max_pending_opens: 1,
            ..LimitSettings::default()
        }
    }

    fn id(b: u8) -> AgentId {
        AgentId::from_bytes([b; 16])
    }

    #[test]
    fn per_peer_cap_is_enforced() {
        let table = StreamTable::new(limits());
        let a = id(1);
        assert!(table.try_reserve(&a));
        assert!(table.try_reserve(&a));
        assert!(!table.try_reserve(&a));
        table.release(&a);
        assert!(table.try_reserve(&a));
    }

    #[test]
    fn global_cap_is_enforced_across_peers() {
        let table = StreamTable::new(limits());
        assert!(table.try_reserve(&id(1)));
        assert!(table.try_reserve(&id(2)));
        assert!(table.try_reserve(&id(3)));
        assert!(!table.try_reserve(&id(4)));
        table.release(&id(2));
        assert!(table.try_reserve(&id(4)));
    }

    #[test]
    fn pending_cap_is_enforced() {
        let table = StreamTable::new(limits());
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(table.insert_pending(1, PendingOpen { reply: tx1, peer: id(1), stream_id: 1 }));
        assert!(!table.insert_pending(2, PendingOpen { reply: tx2, peer: id(1), stream_id: 3 }));
        assert!(table.take_pending(1, &id(1), 1).is_some());
    }

    #[test]
    fn pending_take_requires_matching_origin() {
        let table = StreamTable::new(limits());
        let (tx, _rx) = oneshot::channel();
        table.insert_pending(7, PendingOpen { reply: tx, peer: id(1), stream_id: 9 });
        // Wrong peer or stream does not claim the pending open.
        assert!(table.take_pending(7, &id(2), 9).is_none());
        assert!(table.take_pending(7, &id(1), 11).is_none());
        assert!(table.take_pending(7, &id(1), 9).is_some());
    }
}
