//! Peer connections: handshake, keepalive, frame dispatch and the writer
//! fairness scheduler.
//!
//! One [`PeerHandle`] exists per (local, remote) pair; reconnection builds a
//! fresh one with a fresh stream-id space. On shared links (H2, WebSocket) a
//! single writer task drains per-stream queues round-robin, one frame per
//! ready stream per sweep, with control frames always first. On QUIC every
//! stream has its own native channel and fairness is the transport's
//! problem.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::agent::EngineCtx;
use crate::config::TransportKind;
use crate::error::{StreamError, TransportError};
use crate::transport::{ChannelRx, ChannelTx, FrameChannel, FrameReader, FrameWriter, Link, QuicLink};
use crate::{flood, mono_ms, stream, unix_millis, unix_secs};
use trellis_proto::{
    AgentId, DecodeError, Frame, FramePayload, PeerHello, StreamErrorCode, PROTOCOL_VERSION,
};

/// Transport-establishment to PEER_HELLO_ACK deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Clock skew tolerated in PEER_HELLO timestamps.
const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Frames buffered per stream queue; with 16 KB frames this bounds the
/// per-stream write buffer at the configured 256 KB.
const STREAM_QUEUE_DEPTH: usize = 16;

/// Control/priority queue depth.
const CONTROL_QUEUE_DEPTH: usize = 64;

/// Outgoing handle for one stream on one peer connection.
#[derive(Clone)]
pub enum StreamTx {
    /// Queue drained by the round-robin writer of a shared link.
    Shared(SharedStreamTx),
    /// Feed of a dedicated QUIC channel writer task.
    Channel(mpsc::Sender<Frame>),
}

#[derive(Clone)]
pub struct SharedStreamTx {
    tx: mpsc::Sender<Frame>,
    ready: Arc<Notify>,
}

impl StreamTx {
    /// Queue one frame for this stream. Blocks when the per-stream write
    /// buffer is full; errors once the stream or connection is gone.
    pub async fn send(&self, frame: Frame) -> Result<(), StreamError> {
        match self {
            StreamTx::Shared(shared) => {
                shared.tx.send(frame).await.map_err(|_| StreamError::Closed)?;
                shared.ready.notify_one();
                Ok(())
            }
            StreamTx::Channel(tx) => tx.send(frame).await.map_err(|_| StreamError::Closed),
        }
    }
}

/// Shared-state view of one peer connection.
pub struct PeerShared {
    pub id: AgentId,
    pub kind: TransportKind,
    pub capabilities: Vec<String>,
    /// Whether we dialed this connection (odd stream ids) or accepted it
    /// (even stream ids).
    pub initiator: bool,
    pub remote_addr: String,
    control_tx: mpsc::Sender<Frame>,
    link: LinkHandle,
    next_stream_id: AtomicU64,
    txs: Mutex<HashMap<u64, StreamTx>>,
    last_activity_ms: AtomicU64,
    last_send_ms: AtomicU64,
    rtt_ms: AtomicU64,
    /// Flips to true exactly once; every task of this connection watches it.
    dead: watch::Sender<bool>,
    /// Sink quic channel-reader tasks feed frames into.
    event_tx: mpsc::Sender<LinkEvent>,
}

enum LinkHandle {
    Quic(QuicLink),
    Shared { cmd_tx: mpsc::UnboundedSender<WriterCmd>, ready: Arc<Notify> },
}

#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerShared>,
}

impl std::ops::Deref for PeerHandle {
    type Target = PeerShared;

    fn deref(&self) -> &PeerShared {
        &self.inner
    }
}

impl PeerHandle {
    pub fn id(&self) -> AgentId {
        self.inner.id
    }

    pub fn is_dead(&self) -> bool {
        *self.inner.dead.borrow()
    }

    /// Ask the owner task to tear this connection down.
    pub fn kill(&self) {
        self.inner.dead.send_replace(true);
    }

    fn subscribe_dead(&self) -> watch::Receiver<bool> {
        self.inner.dead.subscribe()
    }

    pub fn rtt_ms(&self) -> u64 {
        self.inner.rtt_ms.load(Ordering::Relaxed)
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.inner.last_activity_ms.load(Ordering::Relaxed)
    }

    fn touch_recv(&self) {
        self.inner.last_activity_ms.store(mono_ms(), Ordering::Relaxed);
    }

    /// Allocate the next outgoing stream id (odd for the dialer, even for
    /// the acceptor, step two).
    pub fn alloc_stream_id(&self) -> u64 {
        self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Send a frame on the priority path: control frames, and one-shot
    /// stream replies that have no queue of their own.
    pub async fn send_control(&self, frame: Frame) -> Result<(), StreamError> {
        if self.is_dead() {
            return Err(StreamError::Closed);
        }
        self.inner.control_tx.send(frame).await.map_err(|_| StreamError::Closed)?;
        if let LinkHandle::Shared { ready, .. } = &self.inner.link {
            ready.notify_one();
        }
        Ok(())
    }

    /// Create the outgoing handle for a locally-initiated stream.
    ///
    /// On QUIC this opens a fresh native channel and spawns its pump tasks;
    /// on shared links it registers a queue with the fairness writer.
    pub async fn register_stream(&self, stream_id: u64) -> Result<StreamTx, StreamError> {
        if self.is_dead() {
            return Err(StreamError::Closed);
        }
        let tx = match &self.inner.link {
            LinkHandle::Quic(link) => {
                let channel = link.open_channel().await.map_err(|_| StreamError::Closed)?;
                let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
                tokio::spawn(channel_writer(channel.tx, rx));
                tokio::spawn(channel_reader(channel.rx, self.inner.event_tx.clone()));
                StreamTx::Channel(tx)
            }
            LinkHandle::Shared { cmd_tx, ready } => {
                let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
                cmd_tx
                    .send(WriterCmd::Register { stream_id, rx })
                    .map_err(|_| StreamError::Closed)?;
                StreamTx::Shared(SharedStreamTx { tx, ready: ready.clone() })
            }
        };
        self.inner.txs.lock().insert(stream_id, tx.clone());
        Ok(tx)
    }

    /// Outgoing handle for a remotely-initiated stream: the registered one
    /// if the accept path created it already (QUIC), otherwise a fresh
    /// queue (shared links).
    pub async fn reply_handle(&self, stream_id: u64) -> Result<StreamTx, StreamError> {
        if let Some(tx) = self.inner.txs.lock().get(&stream_id) {
            return Ok(tx.clone());
        }
        self.register_stream(stream_id).await
    }

    pub fn lookup_stream(&self, stream_id: u64) -> Option<StreamTx> {
        self.inner.txs.lock().get(&stream_id).cloned()
    }

    /// Drop the outgoing handle of a finished stream. Queues drain before
    /// the writer forgets them.
    pub fn unregister_stream(&self, stream_id: u64) {
        self.inner.txs.lock().remove(&stream_id);
    }

    pub(crate) fn register_incoming(&self, stream_id: u64, tx: StreamTx) {
        self.inner.txs.lock().insert(stream_id, tx);
    }

    pub(crate) fn event_sender(&self) -> mpsc::Sender<LinkEvent> {
        self.inner.event_tx.clone()
    }
}

/// All live peer connections, keyed by remote AgentId.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<AgentId, PeerHandle>>,
}

impl PeerRegistry {
    pub fn get(&self, id: &AgentId) -> Option<PeerHandle> {
        self.peers.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<PeerHandle> {
        self.peers.lock().values().cloned().collect()
    }

    /// Insert a fresh connection, killing any previous instance for the
    /// same remote.
    pub fn insert(&self, handle: PeerHandle) {
        let old = self.peers.lock().insert(handle.id(), handle);
        if let Some(old) = old {
            warn!(peer = %old.id().short(), "replacing existing connection to peer");
            old.kill();
        }
    }

    /// Remove `handle` if it is still the registered instance.
    pub fn remove(&self, handle: &PeerHandle) {
        let mut peers = self.peers.lock();
        if let Some(current) = peers.get(&handle.id()) {
            if Arc::ptr_eq(&current.inner, &handle.inner) {
                peers.remove(&handle.id());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

/// Events flowing from link readers into a peer's dispatch loop.
pub(crate) enum LinkEvent {
    Frame(Frame),
    /// Decode failure; recoverable ones are answered, fatal ones kill the
    /// connection.
    Bad(DecodeError),
    /// The underlying link is gone.
    Closed,
}

fn local_hello(ctx: &EngineCtx) -> PeerHello {
    let mut capabilities = Vec::new();
    if ctx.settings.exit.enabled {
        capabilities.push("exit".to_string());
    }
    if ctx.settings.socks5.enabled {
        capabilities.push("ingress".to_string());
    }
    PeerHello {
        version: PROTOCOL_VERSION,
        agent_id: ctx.local_id,
        timestamp: unix_secs(),
        capabilities,
    }
}

fn validate_hello(
    ctx: &EngineCtx,
    hello: &PeerHello,
    expected: Option<AgentId>,
) -> Result<(), TransportError> {
    if hello.version != PROTOCOL_VERSION {
        return Err(TransportError::Handshake(format!(
            "unsupported protocol version {}",
            hello.version
        )));
    }
    if (hello.timestamp - unix_secs()).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(TransportError::Handshake("clock skew exceeds five minutes".into()));
    }
    if hello.agent_id == ctx.local_id {
        return Err(TransportError::Handshake("peer presented our own agent id".into()));
    }
    if let Some(expected) = expected {
        if hello.agent_id != expected {
            return Err(TransportError::Handshake(format!(
                "peer is {} but configuration pins {}",
                hello.agent_id.short(),
                expected.short()
            )));
        }
    }
    Ok(())
}

/// Connection halves after a completed handshake, ready for `run_peer`.
pub struct EstablishedPeer {
    link: EstablishedLink,
    hello: PeerHello,
    initiator: bool,
    remote_addr: String,
}

enum EstablishedLink {
    Quic { link: QuicLink, control: FrameChannel },
    Shared { kind: TransportKind, reader: FrameReader, writer: FrameWriter },
}

/// Run the PEER_HELLO exchange as the dialer.
pub async fn handshake_initiator(
    ctx: &EngineCtx,
    link: Link,
    expected: Option<AgentId>,
) -> Result<EstablishedPeer, TransportError> {
    timeout(HANDSHAKE_TIMEOUT, async {
        let remote_addr = link.remote_addr();
        let hello = Frame::control(FramePayload::PeerHello(local_hello(ctx)));
        match link {
            Link::Quic(qlink) => {
                let mut control = qlink.open_channel().await?;
                control.tx.send(&hello).await?;
                let reply = control.rx.recv().await?.ok_or(TransportError::Closed)?;
                let FramePayload::PeerHelloAck(ack) = reply.payload else {
                    return Err(TransportError::Handshake("expected PEER_HELLO_ACK".into()));
                };
                validate_hello(ctx, &ack, expected)?;
                Ok(EstablishedPeer {
                    link: EstablishedLink::Quic { link: qlink, control },
                    hello: ack,
                    initiator: true,
                    remote_addr,
                })
            }
            Link::Shared(mut shared) => {
                shared.writer.send(&hello).await?;
                let reply = shared.reader.recv().await?.ok_or(TransportError::Closed)?;
                let FramePayload::PeerHelloAck(ack) = reply.payload else {
                    return Err(TransportError::Handshake("expected PEER_HELLO_ACK".into()));
                };
                validate_hello(ctx, &ack, expected)?;
                Ok(EstablishedPeer {
                    link: EstablishedLink::Shared {
                        kind: shared.kind,
                        reader: shared.reader,
                        writer: shared.writer,
                    },
                    hello: ack,
                    initiator: true,
                    remote_addr,
                })
            }
        }
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

/// Run the PEER_HELLO exchange as the acceptor.
pub async fn handshake_acceptor(ctx: &EngineCtx, link: Link) -> Result<EstablishedPeer, TransportError> {
    timeout(HANDSHAKE_TIMEOUT, async {
        let remote_addr = link.remote_addr();
        match link {
            Link::Quic(qlink) => {
                let mut control = qlink.accept_channel().await?;
                let frame = control.rx.recv().await?.ok_or(TransportError::Closed)?;
                let FramePayload::PeerHello(hello) = frame.payload else {
                    return Err(TransportError::Handshake("expected PEER_HELLO".into()));
                };
                validate_hello(ctx, &hello, None)?;
                let ack = Frame::control(FramePayload::PeerHelloAck(local_hello(ctx)));
                control.tx.send(&ack).await?;
                Ok(EstablishedPeer {
                    link: EstablishedLink::Quic { link: qlink, control },
                    hello,
                    initiator: false,
                    remote_addr,
                })
            }
            Link::Shared(mut shared) => {
                let frame = shared.reader.recv().await?.ok_or(TransportError::Closed)?;
                let FramePayload::PeerHello(hello) = frame.payload else {
                    return Err(TransportError::Handshake("expected PEER_HELLO".into()));
                };
                validate_hello(ctx, &hello, None)?;
                let ack = Frame::control(FramePayload::PeerHelloAck(local_hello(ctx)));
                shared.writer.send(&ack).await?;
                Ok(EstablishedPeer {
                    link: EstablishedLink::Shared {
                        kind: shared.kind,
                        reader: shared.reader,
                        writer: shared.writer,
                    },
                    hello,
                    initiator: false,
                    remote_addr,
                })
            }
        }
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

/// Drive one established peer connection until it dies. Registers the
/// handle, floods it our local routes, dispatches frames, and tears
/// everything down on exit.
pub async fn run_peer(ctx: Arc<EngineCtx>, established: EstablishedPeer) {
    let EstablishedPeer { link, hello, initiator, remote_addr } = established;
    let (event_tx, mut event_rx) = mpsc::channel::<LinkEvent>(CONTROL_QUEUE_DEPTH);
    let (control_tx, control_rx) = mpsc::channel::<Frame>(CONTROL_QUEUE_DEPTH);

    let now = mono_ms();
    let (link_handle, kind) = match &link {
        EstablishedLink::Quic { .. } => (None, TransportKind::Quic),
        EstablishedLink::Shared { kind, .. } => {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let ready = Arc::new(Notify::new());
            (Some((cmd_tx, cmd_rx, ready)), *kind)
        }
    };

    let inner = Arc::new(PeerShared {
        id: hello.agent_id,
        kind,
        capabilities: hello.capabilities.clone(),
        initiator,
        remote_addr: remote_addr.clone(),
        control_tx,
        link: match (&link, &link_handle) {
            (EstablishedLink::Quic { link, .. }, _) => LinkHandle::Quic(link.clone()),
            (_, Some((cmd_tx, _, ready))) => {
                LinkHandle::Shared { cmd_tx: cmd_tx.clone(), ready: ready.clone() }
            }
            _ => unreachable!(),
        },
        next_stream_id: AtomicU64::new(if initiator { 1 } else { 2 }),
        txs: Mutex::new(HashMap::new()),
        last_activity_ms: AtomicU64::new(now),
        last_send_ms: AtomicU64::new(now),
        rtt_ms: AtomicU64::new(0),
        dead: watch::channel(false).0,
        event_tx: event_tx.clone(),
    });
    let peer = PeerHandle { inner };

    // Spawn the link pumps.
    match link {
        EstablishedLink::Quic { link, control } => {
            tokio::spawn(channel_writer_tracked(control.tx, control_rx, peer.clone()));
            tokio::spawn(channel_reader(control.rx, event_tx.clone()));
            tokio::spawn(quic_accept_loop(link, peer.clone()));
        }
        EstablishedLink::Shared { reader, writer, .. } => {
            let (_, cmd_rx, ready) = link_handle.expect("shared link has writer state");
            tokio::spawn(shared_writer(writer, control_rx, cmd_rx, ready, peer.clone()));
            tokio::spawn(shared_reader(reader, event_tx.clone()));
        }
    }

    let keepalive = tokio::spawn(keepalive_loop(ctx.clone(), peer.clone()));

    ctx.peers.insert(peer.clone());
    info!(
        peer = %peer.id().short(),
        transport = %peer.kind,
        addr = %remote_addr,
        initiator,
        "peer connected"
    );

    // A fresh peer learns our exit routes right away rather than waiting
    // out the advertise interval.
    flood::advertise_to_peer(&ctx, &peer).await;

    let mut shutdown = ctx.shutdown.subscribe();
    let mut dead_rx = peer.subscribe_dead();
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(LinkEvent::Frame(frame)) => {
                    peer.touch_recv();
                    if let Err(violation) = handle_frame(&ctx, &peer, frame).await {
                        warn!(peer = %peer.id().short(), error = %violation, "protocol violation");
                        break;
                    }
                }
                Some(LinkEvent::Bad(e)) if !e.is_fatal() => {
                    peer.touch_recv();
                    if let DecodeError::UnsupportedTarget { stream_id, request_id, .. } = e {
                        let _ = peer
                            .send_control(stream::open_err_frame(
                                stream_id,
                                request_id,
                                StreamErrorCode::NoRoute,
                                "unsupported address type",
                            ))
                            .await;
                    }
                }
                Some(LinkEvent::Bad(e)) => {
                    warn!(peer = %peer.id().short(), error = %e, "protocol violation");
                    break;
                }
                Some(LinkEvent::Closed) | None => break,
            },
            _ = dead_rx.changed() => break,
            _ = shutdown.changed() => break,
        }
        if peer.is_dead() {
            break;
        }
    }

    keepalive.abort();
    teardown_peer(&ctx, &peer).await;
}

/// Mark the peer dead, purge routing and stream state, reset everything
/// that referenced it. Safe to run once per instance.
async fn teardown_peer(ctx: &EngineCtx, peer: &PeerHandle) {
    peer.inner.dead.send_replace(true);
    ctx.peers.remove(peer);
    if let LinkHandle::Quic(link) = &peer.inner.link {
        link.close();
    }
    let purged_routes = ctx.routes.purge_next_hop(&peer.id());
    ctx.streams.fail_peer(ctx, peer).await;
    ctx.forward.purge_peer(ctx, &peer.id()).await;
    peer.inner.txs.lock().clear();
    info!(
        peer = %peer.id().short(),
        purged_routes,
        "peer disconnected"
    );
}

/// Route one inbound frame to the component that owns it. `Err` means a
/// protocol violation that kills the connection.
async fn handle_frame(
    ctx: &Arc<EngineCtx>,
    peer: &PeerHandle,
    frame: Frame,
) -> Result<(), &'static str> {
    match frame.payload {
        FramePayload::PeerHello(_) | FramePayload::PeerHelloAck(_) => {
            Err("handshake frame after handshake")
        }
        FramePayload::Keepalive { timestamp } => {
            let _ = peer
                .send_control(Frame::control(FramePayload::KeepaliveAck { timestamp }))
                .await;
            Ok(())
        }
        FramePayload::KeepaliveAck { timestamp } => {
            let rtt = (unix_millis() - timestamp).max(0) as u64;
            peer.inner.rtt_ms.store(rtt, Ordering::Relaxed);
            Ok(())
        }
        FramePayload::RouteAdvertise(adv) => {
            flood::handle_advertise(ctx, peer, adv).await;
            Ok(())
        }
        FramePayload::RouteWithdraw(withdraw) => {
            flood::handle_withdraw(ctx, peer, withdraw).await;
            Ok(())
        }
        FramePayload::StreamOpen(open) => {
            stream::handle_open(ctx, peer, frame.stream_id, open).await;
            Ok(())
        }
        FramePayload::StreamOpenAck(_) | FramePayload::StreamOpenErr(_) => {
            stream::handle_open_reply(ctx, peer, frame).await;
            Ok(())
        }
        FramePayload::StreamData(_) | FramePayload::StreamClose | FramePayload::StreamReset { .. } => {
            stream::handle_stream_frame(ctx, peer, frame).await;
            Ok(())
        }
    }
}

/// Periodic keepalive probe and dead-peer detection.
async fn keepalive_loop(ctx: Arc<EngineCtx>, peer: PeerHandle) {
    let idle_after = ctx.settings.connections.idle_threshold().as_millis() as u64;
    let dead_after = ctx.settings.connections.timeout().as_millis() as u64;
    let mut tick = tokio::time::interval(Duration::from_secs(10));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if peer.is_dead() {
            return;
        }
        let now = mono_ms();
        let last_recv = peer.inner.last_activity_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last_recv) > dead_after {
            warn!(peer = %peer.id().short(), "no frames within timeout, declaring dead");
            peer.kill();
            return;
        }
        let last_send = peer.inner.last_send_ms.load(Ordering::Relaxed);
        let idle_for = now.saturating_sub(last_recv.max(last_send));
        if idle_for > idle_after {
            let probe = Frame::control(FramePayload::Keepalive { timestamp: unix_millis() });
            if peer.send_control(probe).await.is_err() {
                return;
            }
        }
    }
}

/// Commands into the shared-link writer.
enum WriterCmd {
    Register { stream_id: u64, rx: mpsc::Receiver<Frame> },
}

/// Round-robin fairness writer for H2/WebSocket links.
///
/// Control frames drain first and completely. Then one sweep over the
/// per-stream queues in rotation order sends at most one frame per stream
/// with pending data. The sweep repeats while anything flows; when all
/// queues are idle the task parks on the ready Notify.
async fn shared_writer(
    mut writer: FrameWriter,
    mut control_rx: mpsc::Receiver<Frame>,
    mut cmd_rx: mpsc::UnboundedReceiver<WriterCmd>,
    ready: Arc<Notify>,
    peer: PeerHandle,
) {
    let mut queues: VecDeque<(u64, mpsc::Receiver<Frame>)> = VecDeque::new();
    let mut dead_rx = peer.subscribe_dead();

    'run: loop {
        if peer.is_dead() {
            break;
        }
        // Pick up new stream registrations.
        while let Ok(WriterCmd::Register { stream_id, rx }) = cmd_rx.try_recv() {
            queues.push_back((stream_id, rx));
        }

        // Control first, all of it.
        let mut sent_any = false;
        loop {
            match control_rx.try_recv() {
                Ok(frame) => {
                    if writer.send(&frame).await.is_err() {
                        break 'run;
                    }
                    peer.inner.last_send_ms.store(mono_ms(), Ordering::Relaxed);
                    sent_any = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'run,
            }
        }

        // One round-robin sweep: at most one frame per ready stream.
        for _ in 0..queues.len() {
            let (stream_id, mut rx) = queues.pop_front().expect("queue count is loop bound");
            match rx.try_recv() {
                Ok(frame) => {
                    if writer.send(&frame).await.is_err() {
                        break 'run;
                    }
                    peer.inner.last_send_ms.store(mono_ms(), Ordering::Relaxed);
                    sent_any = true;
                    queues.push_back((stream_id, rx));
                }
                Err(mpsc::error::TryRecvError::Empty) => queues.push_back((stream_id, rx)),
                // Stream finished and fully drained.
                Err(mpsc::error::TryRecvError::Disconnected) => {}
            }
        }

        if !sent_any {
            tokio::select! {
                frame = control_rx.recv() => match frame {
                    Some(frame) => {
                        if writer.send(&frame).await.is_err() {
                            break 'run;
                        }
                        peer.inner.last_send_ms.store(mono_ms(), Ordering::Relaxed);
                    }
                    None => break 'run,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(WriterCmd::Register { stream_id, rx }) => {
                        queues.push_back((stream_id, rx));
                    }
                    None => break 'run,
                },
                _ = ready.notified() => {}
                _ = dead_rx.changed() => break 'run,
            }
        }
    }

    writer.close().await;
    peer.kill();
}

/// Feed frames off a shared link into the dispatch loop.
async fn shared_reader(mut reader: FrameReader, event_tx: mpsc::Sender<LinkEvent>) {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => {
                if event_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = event_tx.send(LinkEvent::Closed).await;
                return;
            }
            Err(TransportError::Decode(e)) if !e.is_fatal() => {
                if event_tx.send(LinkEvent::Bad(e)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "link reader stopping");
                let _ = event_tx.send(LinkEvent::Closed).await;
                return;
            }
        }
    }
}

/// Accept native QUIC channels the peer opens for its streams.
async fn quic_accept_loop(link: QuicLink, peer: PeerHandle) {
    loop {
        match link.accept_channel().await {
            Ok(channel) => {
                tokio::spawn(accepted_channel(channel, peer.clone()));
            }
            Err(e) => {
                debug!(peer = %peer.id().short(), error = %e, "quic accept loop ended");
                let _ = peer.event_sender().send(LinkEvent::Closed).await;
                return;
            }
        }
    }
}

/// First frame on an accepted channel names the stream; its writer half is
/// registered before the frame is dispatched so replies have a home.
async fn accepted_channel(channel: FrameChannel, peer: PeerHandle) {
    let FrameChannel { tx, mut rx } = channel;
    let event_tx = peer.event_sender();
    let first = match rx.recv().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(TransportError::Decode(e)) => {
            let _ = event_tx.send(LinkEvent::Bad(e)).await;
            return;
        }
        Err(_) => return,
    };

    let (queue_tx, queue_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
    peer.register_incoming(first.stream_id, StreamTx::Channel(queue_tx));
    tokio::spawn(channel_writer(tx, queue_rx));

    if event_tx.send(LinkEvent::Frame(first)).await.is_err() {
        return;
    }
    forward_channel_frames(rx, event_tx).await;
}

/// Pump one locally-opened channel's inbound frames into dispatch.
async fn channel_reader(rx: ChannelRx, event_tx: mpsc::Sender<LinkEvent>) {
    forward_channel_frames(rx, event_tx).await;
}

async fn forward_channel_frames(mut rx: ChannelRx, event_tx: mpsc::Sender<LinkEvent>) {
    loop {
        match rx.recv().await {
            Ok(Some(frame)) => {
                if event_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(TransportError::Decode(e)) => {
                let _ = event_tx.send(LinkEvent::Bad(e)).await;
                return;
            }
            Err(_) => {
                // Connection-level failure surfaces via the control channel.
                return;
            }
        }
    }
}

/// Drain a stream queue onto its QUIC channel.
async fn channel_writer(mut tx: ChannelTx, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if tx.send(&frame).await.is_err() {
            return;
        }
    }
    tx.finish();
}

/// Like `channel_writer`, but also stamps send activity; used for the
/// control channel where keepalive accounting lives.
async fn channel_writer_tracked(mut tx: ChannelTx, mut rx: mpsc::Receiver<Frame>, peer: PeerHandle) {
    let mut dead_rx = peer.subscribe_dead();
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = dead_rx.changed() => break,
        };
        if tx.send(&frame).await.is_err() {
            peer.kill();
            return;
        }
        peer.inner.last_send_ms.store(mono_ms(), Ordering::Relaxed);
    }
    tx.finish();
}

/// Exponential backoff with jitter for dialer reconnects.
pub fn reconnect_delay(settings: &crate::config::ReconnectSettings, attempt: u32) -> Duration {
    use rand::Rng;
    let base = settings.initial_delay * settings.multiplier.powi(attempt.min(32) as i32);
    let capped = base.min(settings.max_delay);
    let jitter = if settings.jitter > 0.0 {
        rand::thread_rng().gen_range(-settings.jitter..settings.jitter)
    } else {
        0.0
    };
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.05))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectSettings;

    #[test]
    fn backoff_grows_and_caps() {
        let settings = ReconnectSettings {
            initial_delay: 1.0,
            max_delay: 60.0,
            multiplier: 2.0,
            jitter: 0.0,
            max_retries: 0,
        };
        assert_eq!(reconnect_delay(&settings, 0), Duration::from_secs_f64(1.0));
        assert_eq!(reconnect_delay(&settings, 1), Duration::from_secs_f64(2.0));
        assert_eq!(reconnect_delay(&settings, 5), Duration::from_secs_f64(32.0));
        assert_eq!(reconnect_delay(&settings, 6), Duration::from_secs_f64(60.0));
        assert_eq!(reconnect_delay(&settings, 30), Duration::from_secs_f64(60.0));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let settings = ReconnectSettings {
            initial_delay: 1.0,
            max_delay: 60.0,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 0,
        };
        for _ in 0..100 {
            let d = reconnect_delay(&settings, 2).as_secs_f64();
            assert!((3.2..=4.8).contains(&d), "delay {} out of band", d);
        }
    }
}
