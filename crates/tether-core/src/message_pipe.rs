//! Message pipes: pairs of endpoints exchanging whole messages.
//!
//! Each endpoint owns its receive queue and a weak link to its peer. Writers
//! lock only the receiving endpoint, readers only themselves. The one place two
//! endpoint locks overlap is a transfer handing its state to a successor that
//! no peer can reach yet.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tether_types::{
    EndpointSnapshot, EndpointToken, Error, HandleKind, ObjectId, PeerToken, QuotaInfo,
    QuotaOptions, QuotaType, SignalState, Signals,
};
use tracing::{debug, trace};

use crate::context::RequestContext;
use crate::endpoint::{Endpoint, EndpointCore, Life, Visit, sealed, visit};
use crate::handle;
use crate::message::Message;
use crate::quota::QuotaSet;
use crate::runtime::Runtime;
use crate::transport::{RemotePeer, Transport};
use crate::watchers::{Watcher, WatcherId, WatcherSet};

enum PeerLink {
    Local(Weak<PipeEndpoint>),
    Remote(RemotePeer),
    Detached,
}

struct PipeState {
    life: Life<PipeEndpoint>,
    /// Where writes addressed to this endpoint go after it was exported.
    exported: Option<RemotePeer>,
    in_transit: bool,
    queue: VecDeque<Message>,
    queued_bytes: u64,
    peer: PeerLink,
    peer_closed: bool,
    has_written: bool,
    quotas: QuotaSet,
    watchers: WatcherSet,
}

impl PipeState {
    fn new(peer: PeerLink) -> Self {
        Self {
            life: Life::Open,
            exported: None,
            in_transit: false,
            queue: VecDeque::new(),
            queued_bytes: 0,
            peer,
            peer_closed: false,
            has_written: false,
            quotas: QuotaSet::default(),
            watchers: WatcherSet::default(),
        }
    }

    fn moved(next: Weak<PipeEndpoint>) -> Self {
        let mut state = Self::new(PeerLink::Detached);
        state.life = Life::Moved(next);
        state
    }

    fn signal_state(&self) -> SignalState {
        if !self.life.is_open() {
            return SignalState::default();
        }
        let mut satisfied = Signals::empty();
        let mut satisfiable = Signals::PEER_CLOSED | Signals::QUOTA_EXCEEDED;
        if !self.queue.is_empty() {
            satisfied |= Signals::READABLE;
            satisfiable |= Signals::READABLE;
        }
        if self.peer_closed {
            satisfied |= Signals::PEER_CLOSED;
        } else {
            satisfied |= Signals::WRITABLE;
            satisfiable |= Signals::READABLE | Signals::WRITABLE | Signals::PEER_REMOTE;
            if matches!(self.peer, PeerLink::Remote(_)) {
                satisfied |= Signals::PEER_REMOTE;
            }
        }
        if self.quotas.exceeded() {
            satisfied |= Signals::QUOTA_EXCEEDED;
        }
        SignalState::new(satisfied, satisfiable)
    }

    fn notify(&mut self) {
        let state = self.signal_state();
        self.watchers.notify(state);
    }

    fn sync_queue_usage(&mut self) {
        self.quotas
            .set_usage(QuotaType::ReceiveQueueLength, self.queue.len() as u64);
        self.quotas
            .set_usage(QuotaType::ReceiveQueueMemorySize, self.queued_bytes);
    }

    fn adjust_unread(&mut self, delta: i64) {
        let unread = self.quotas.usage(QuotaType::UnreadMessageCount);
        let unread = unread.saturating_add_signed(delta);
        self.quotas.set_usage(QuotaType::UnreadMessageCount, unread);
        self.notify();
    }

    fn local_peer(&self) -> Option<Weak<PipeEndpoint>> {
        match &self.peer {
            PeerLink::Local(peer) => Some(peer.clone()),
            _ => None,
        }
    }

    /// Queues a message written by the peer.
    ///
    /// On failure the message is handed back so the caller can drop it once
    /// this endpoint's lock is released.
    fn enqueue(&mut self, message: Message, from_transport: bool) -> Result<(), (Error, Message)> {
        if !self.life.is_open() {
            return Err((Error::failed_precondition("peer is closed"), message));
        }
        if self.peer_closed {
            let err = if from_transport {
                Error::failed_precondition("remote peer already closed")
            } else {
                Error::invalid_argument("writer closed while writing")
            };
            return Err((err, message));
        }
        self.queued_bytes += message.payload.len() as u64;
        self.queue.push_back(message);
        self.sync_queue_usage();
        self.notify();
        Ok(())
    }

    fn on_peer_closed(&mut self) {
        if self.peer_closed {
            return;
        }
        self.peer_closed = true;
        self.peer = PeerLink::Detached;
        self.quotas.set_usage(QuotaType::UnreadMessageCount, 0);
        self.notify();
    }

    /// Takes over the far side of a fused pipe.
    fn splice(&mut self, peer: Weak<PipeEndpoint>, fused: Fused) {
        if !self.peer_closed {
            self.peer = PeerLink::Local(peer);
        }
        self.peer_closed |= fused.peer_closed;
        if self.peer_closed {
            self.peer = PeerLink::Detached;
            self.quotas.set_usage(QuotaType::UnreadMessageCount, 0);
        }
        // Anything already here arrived through the forwarding link after the
        // interior endpoint was detached, so it is newer than `fused.queue`.
        let mut queue = fused.queue;
        queue.extend(self.queue.drain(..));
        self.queue = queue;
        self.queued_bytes += fused.queued_bytes;
        self.sync_queue_usage();
        self.notify();
    }
}

/// What an interior endpoint hands to the exterior one on fuse.
struct Fused {
    queue: VecDeque<Message>,
    queued_bytes: u64,
    peer_closed: bool,
}

pub(crate) struct PipeEndpoint {
    id: ObjectId,
    /// Shared by the two ends created together; survives transfers.
    pipe: ObjectId,
    runtime: Arc<Runtime>,
    state: Mutex<PipeState>,
}

fn lock_pipe(endpoint: &PipeEndpoint) -> MutexGuard<'_, PipeState> {
    endpoint.state.lock()
}

fn step(state: &PipeState) -> Result<Option<Weak<PipeEndpoint>>, Option<RemotePeer>> {
    match &state.life {
        Life::Open => Ok(None),
        Life::Moved(next) => Ok(Some(next.clone())),
        Life::Closed => Err(state.exported.clone()),
    }
}

fn visit_pipe<R>(
    start: &Weak<PipeEndpoint>,
    f: impl FnOnce(&Arc<PipeEndpoint>, &mut PipeState) -> R,
) -> Visit<R, RemotePeer> {
    visit(start, lock_pipe, step, f)
}

/// Sends `message` to whatever endpoint `target` currently resolves to.
///
/// Returns whether it landed in a local queue.
fn deliver(target: &Weak<PipeEndpoint>, message: Message, from_transport: bool) -> Result<bool, Error> {
    let mut slot = Some(message);
    let outcome = visit_pipe(target, |_, st| match slot.take() {
        Some(message) => st.enqueue(message, from_transport),
        None => Ok(()),
    });
    match outcome {
        Visit::Local(Ok(())) => Ok(true),
        Visit::Local(Err((err, rejected))) => {
            drop(rejected);
            Err(err)
        }
        Visit::Elsewhere(remote) => match slot.take() {
            Some(message) => remote.send(message).map(|()| false),
            None => Ok(false),
        },
        Visit::Gone => Err(Error::failed_precondition("peer is closed")),
    }
}

impl PipeEndpoint {
    fn new(runtime: &Arc<Runtime>, pipe: ObjectId, state: PipeState) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            id: runtime.next_object_id(),
            pipe,
            runtime: runtime.clone(),
            state: Mutex::new(state),
        });
        runtime.register_endpoint(endpoint.clone());
        endpoint
    }

    fn close(&self) -> Result<(), Error> {
        let (peer, queue) = {
            let mut st = self.state.lock();
            st.life.check()?;
            if st.in_transit {
                return Err(Error::invalid_argument("handle is being transferred"));
            }
            st.life = Life::Closed;
            st.watchers.notify_closed();
            st.queued_bytes = 0;
            (
                std::mem::replace(&mut st.peer, PeerLink::Detached),
                std::mem::take(&mut st.queue),
            )
        };

        match peer {
            PeerLink::Local(peer) => {
                if let Visit::Elsewhere(remote) = visit_pipe(&peer, |_, st| st.on_peer_closed()) {
                    remote.close();
                }
            }
            PeerLink::Remote(remote) => {
                self.runtime.mark_closed(remote.token);
                remote.close();
            }
            PeerLink::Detached => {}
        }
        debug!(pipe = %self.pipe, endpoint = %self.id, discarded = queue.len(), "message pipe endpoint closed");
        drop(queue);
        Ok(())
    }

    fn begin_transit(&self) -> Result<(), Error> {
        let mut st = self.state.lock();
        st.life.check()?;
        if st.in_transit {
            return Err(Error::busy("handle is already being transferred"));
        }
        st.in_transit = true;
        Ok(())
    }

    fn cancel_transit(&self) {
        self.state.lock().in_transit = false;
    }

    /// Moves this endpoint's state into a fresh object and leaves a forward behind.
    fn complete_transit(&self) -> Arc<Self> {
        let successor = Self::new(&self.runtime, self.pipe, PipeState::new(PeerLink::Detached));
        let (peer, remote) = {
            let mut st = self.state.lock();
            let mut moved = std::mem::replace(&mut *st, PipeState::moved(Arc::downgrade(&successor)));
            moved.watchers.notify_closed();
            moved.in_transit = false;
            let peer = moved.local_peer();
            let remote = match &moved.peer {
                PeerLink::Remote(remote) => Some(remote.token),
                _ => None,
            };
            *successor.state.lock() = moved;
            (peer, remote)
        };
        if let Some(token) = remote {
            self.runtime.rebind(token, Arc::downgrade(&successor));
        }
        if let Some(peer) = peer {
            let me: *const Self = self;
            let next = Arc::downgrade(&successor);
            visit_pipe(&peer, |_, st| {
                if let PeerLink::Local(link) = &st.peer
                    && std::ptr::eq(link.as_ptr(), me)
                {
                    st.peer = PeerLink::Local(next);
                }
            });
        }
        trace!(from = %self.id, to = %successor.id, "message pipe endpoint transferred");
        successor
    }

    /// Validates an interior endpoint for fusing and returns its exterior peer.
    fn fuse_peer(&self) -> Result<Weak<PipeEndpoint>, Error> {
        let st = self.state.lock();
        st.life.check()?;
        if st.in_transit {
            return Err(Error::busy("handle is being transferred"));
        }
        if st.has_written {
            return Err(Error::failed_precondition(
                "cannot fuse an endpoint that has written messages",
            ));
        }
        match &st.peer {
            PeerLink::Local(peer) => Ok(peer.clone()),
            PeerLink::Remote(_) => Err(Error::failed_precondition(
                "cannot fuse an endpoint whose peer is remote",
            )),
            // The peer closed; keep the closure observable on the other side.
            PeerLink::Detached => Ok(Weak::new()),
        }
    }

    /// Detaches an interior endpoint, forwarding late writes to `forward_to`.
    fn fuse_detach(&self, forward_to: &Weak<PipeEndpoint>) -> Result<Fused, Error> {
        let mut st = self.state.lock();
        st.life.check()?;
        if st.has_written {
            return Err(Error::failed_precondition(
                "cannot fuse an endpoint that has written messages",
            ));
        }
        st.life = if forward_to.strong_count() > 0 {
            Life::Moved(forward_to.clone())
        } else {
            Life::Closed
        };
        st.watchers.notify_closed();
        st.peer = PeerLink::Detached;
        let queued_bytes = std::mem::take(&mut st.queued_bytes);
        Ok(Fused {
            queue: std::mem::take(&mut st.queue),
            queued_bytes,
            peer_closed: st.peer_closed,
        })
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        if self.state.get_mut().life.is_open() {
            let _ctx = RequestContext::enter();
            let _ = self.close();
        }
    }
}

impl EndpointCore for PipeEndpoint {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::MessagePipe
    }

    fn add_watcher(&self, watcher: Watcher) -> Result<(), Error> {
        let mut st = self.state.lock();
        st.life.check()?;
        let state = st.signal_state();
        st.watchers.add(watcher, state)
    }

    fn remove_watcher(&self, id: WatcherId) {
        self.state.lock().watchers.remove(id);
    }

    fn snapshot(&self) -> Option<EndpointSnapshot> {
        let st = self.state.lock();
        if !st.life.is_open() {
            return None;
        }
        Some(EndpointSnapshot {
            id: self.id,
            kind: HandleKind::MessagePipe,
            signals_state: st.signal_state().to_snapshot(),
            queued: st.queue.len() as u64,
            peer_remote: matches!(st.peer, PeerLink::Remote(_)),
        })
    }
}

/// One end of a message pipe.
///
/// Clones share the endpoint; dropping the last clone closes it.
#[derive(Clone)]
pub struct MessagePipeEndpoint {
    inner: Arc<PipeEndpoint>,
}

impl fmt::Debug for MessagePipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipeEndpoint")
            .field("id", &self.inner.id)
            .field("pipe", &self.inner.pipe)
            .finish()
    }
}

pub(crate) fn create_pair(runtime: &Arc<Runtime>) -> (MessagePipeEndpoint, MessagePipeEndpoint) {
    let pipe = runtime.next_object_id();
    let a = PipeEndpoint::new(runtime, pipe, PipeState::new(PeerLink::Detached));
    let b = PipeEndpoint::new(runtime, pipe, PipeState::new(PeerLink::Local(Arc::downgrade(&a))));
    a.state.lock().peer = PeerLink::Local(Arc::downgrade(&b));
    debug!(%pipe, a = %a.id, b = %b.id, "message pipe created");
    (
        MessagePipeEndpoint { inner: a },
        MessagePipeEndpoint { inner: b },
    )
}

impl MessagePipeEndpoint {
    /// Queues `message` at the peer.
    ///
    /// Attached handles are moved even if the write later fails; on failure
    /// they are closed.
    pub fn write(&self, message: impl Into<Message>) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        let message = message.into();
        let options = self.inner.runtime.options();
        if message.payload.len() > options.max_message_num_bytes {
            return Err(Error::resource_exhausted("message payload too large"));
        }
        if message.handles.len() > options.max_message_handles {
            return Err(Error::resource_exhausted("too many handles attached"));
        }

        let peer = {
            let mut st = self.inner.state.lock();
            st.life.check()?;
            if st.peer_closed {
                return Err(Error::failed_precondition("peer is closed"));
            }
            st.has_written = true;
            let link = match &st.peer {
                PeerLink::Local(peer) => Ok(peer.clone()),
                PeerLink::Remote(remote) => Err(remote.clone()),
                PeerLink::Detached => return Err(Error::failed_precondition("peer is closed")),
            };
            if link.is_ok() {
                st.adjust_unread(1);
            }
            link
        };

        let message = match handle::attach(message, self.inner.id) {
            Ok(message) => message,
            Err(err) => {
                if peer.is_ok() {
                    self.inner.state.lock().adjust_unread(-1);
                }
                return Err(err);
            }
        };

        match peer {
            Ok(peer) => {
                let delivered = deliver(&peer, message, false);
                if !matches!(delivered, Ok(true)) {
                    self.inner.state.lock().adjust_unread(-1);
                }
                delivered.map(|_| ())
            }
            Err(remote) => remote.send(message),
        }
    }

    /// Dequeues the oldest message.
    pub fn read(&self) -> Result<Message, Error> {
        let _ctx = RequestContext::enter();
        let (message, peer) = {
            let mut st = self.inner.state.lock();
            st.life.check()?;
            let Some(message) = st.queue.pop_front() else {
                return Err(if st.peer_closed {
                    Error::failed_precondition("peer closed and nothing left to read")
                } else {
                    Error::should_wait("no message queued")
                });
            };
            st.queued_bytes -= message.payload.len() as u64;
            st.sync_queue_usage();
            st.notify();
            (message, st.local_peer())
        };
        if let Some(peer) = peer {
            visit_pipe(&peer, |_, st| st.adjust_unread(-1));
        }
        Ok(message)
    }

    /// Size of the next message's payload, without dequeuing it.
    pub fn peek_num_bytes(&self) -> Result<usize, Error> {
        let st = self.inner.state.lock();
        st.life.check()?;
        match st.queue.front() {
            Some(message) => Ok(message.payload.len()),
            None if st.peer_closed => Err(Error::failed_precondition(
                "peer closed and nothing left to read",
            )),
            None => Err(Error::should_wait("no message queued")),
        }
    }

    pub fn queued_messages(&self) -> Result<usize, Error> {
        let st = self.inner.state.lock();
        st.life.check()?;
        Ok(st.queue.len())
    }

    pub fn set_quota(&self, ty: QuotaType, limit: u64, options: &QuotaOptions) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        options.validate()?;
        let mut st = self.inner.state.lock();
        st.life.check()?;
        st.quotas.set_limit(ty, limit);
        st.notify();
        trace!(endpoint = %self.inner.id, ?ty, limit, "quota set");
        Ok(())
    }

    pub fn query_quota(&self, ty: QuotaType) -> Result<QuotaInfo, Error> {
        let st = self.inner.state.lock();
        st.life.check()?;
        Ok(st.quotas.info(ty))
    }

    pub(crate) fn begin_transit(&self) -> Result<(), Error> {
        self.inner.begin_transit()
    }

    pub(crate) fn cancel_transit(&self) {
        self.inner.cancel_transit()
    }

    pub(crate) fn complete_transit(&self) -> Self {
        Self {
            inner: self.inner.complete_transit(),
        }
    }

    pub(crate) fn is_same_endpoint(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn deliver_from_transport(target: &Weak<PipeEndpoint>, message: Message) -> Result<(), Error> {
        deliver(target, message, true).map(|_| ())
    }

    pub(crate) fn remote_peer_closed(target: &Weak<PipeEndpoint>) {
        visit_pipe(target, |_, st| st.on_peer_closed());
    }
}

impl sealed::Sealed for MessagePipeEndpoint {
    fn core(&self) -> Result<Arc<dyn EndpointCore>, Error> {
        self.inner.state.lock().life.check()?;
        Ok(self.inner.clone())
    }
}

impl Endpoint for MessagePipeEndpoint {
    fn id(&self) -> ObjectId {
        self.inner.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::MessagePipe
    }

    fn signal_state(&self) -> Result<SignalState, Error> {
        let st = self.inner.state.lock();
        st.life.check()?;
        Ok(st.signal_state())
    }

    fn close(&self) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        self.inner.close()
    }

    fn set_quota(&self, ty: QuotaType, limit: u64, options: &QuotaOptions) -> Result<(), Error> {
        MessagePipeEndpoint::set_quota(self, ty, limit, options)
    }

    fn query_quota(&self, ty: QuotaType) -> Result<QuotaInfo, Error> {
        MessagePipeEndpoint::query_quota(self, ty)
    }
}

// ── Fusing ─────────────────────────────────────────────────────

/// Splices the peers of `b` and `c` together. Both are consumed either way.
pub(crate) fn fuse(b: MessagePipeEndpoint, c: MessagePipeEndpoint) -> Result<(), Error> {
    let result = fuse_interior(&b, &c);
    if result.is_err() {
        let _ = b.inner.close();
        let _ = c.inner.close();
    }
    result
}

fn fuse_interior(b: &MessagePipeEndpoint, c: &MessagePipeEndpoint) -> Result<(), Error> {
    if b.is_same_endpoint(c) || b.inner.pipe == c.inner.pipe {
        return Err(Error::failed_precondition("cannot fuse a pipe with itself"));
    }
    let a = b.inner.fuse_peer()?;
    let d = c.inner.fuse_peer()?;

    let from_a = b.inner.fuse_detach(&d)?;
    let from_d = match c.inner.fuse_detach(&a) {
        Ok(fused) => fused,
        Err(err) => {
            // `b` is gone already; its peer must learn about it.
            visit_pipe(&a, |_, st| st.on_peer_closed());
            return Err(err);
        }
    };

    visit_pipe(&d, |_, st| st.splice(a.clone(), from_a));
    visit_pipe(&a, |_, st| st.splice(d.clone(), from_d));
    debug!(b = %b.inner.id, c = %c.inner.id, "message pipes fused");
    Ok(())
}

// ── Migration ──────────────────────────────────────────────────

impl MessagePipeEndpoint {
    /// Captures this endpoint into a token and hands its peer over to `transport`.
    pub(crate) fn export(&self, transport: Arc<dyn Transport>) -> Result<EndpointToken, Error> {
        let runtime = self.inner.runtime.clone();
        let token = PeerToken {
            node: runtime.node_id(),
            link: runtime.next_link(),
        };
        let remote = RemotePeer {
            token,
            transport,
        };

        let (peer, queued, peer_closed) = {
            let mut st = self.inner.state.lock();
            st.life.check()?;
            if st.in_transit {
                return Err(Error::busy("handle is being transferred"));
            }
            if matches!(st.peer, PeerLink::Remote(_)) {
                return Err(Error::failed_precondition("peer is already remote"));
            }
            if st.queue.iter().any(|message| !message.handles.is_empty()) {
                return Err(Error::invalid_argument(
                    "queued messages carry handles and cannot be exported",
                ));
            }
            st.life = Life::Closed;
            st.exported = Some(remote.clone());
            st.watchers.notify_closed();
            st.queued_bytes = 0;
            let queued: Vec<Vec<u8>> = st.queue.drain(..).map(|message| message.payload).collect();
            let peer = std::mem::replace(&mut st.peer, PeerLink::Detached);
            (peer, queued, st.peer_closed)
        };

        if let PeerLink::Local(peer) = peer {
            let bound = visit_pipe(&peer, |endpoint, st| {
                st.peer = PeerLink::Remote(remote.clone());
                st.quotas.set_usage(QuotaType::UnreadMessageCount, 0);
                st.notify();
                Arc::downgrade(endpoint)
            });
            if let Visit::Local(endpoint) = bound {
                runtime.bind(token, endpoint);
            }
        }
        debug!(endpoint = %self.inner.id, %token, queued = queued.len(), peer_closed, "message pipe endpoint exported");
        Ok(EndpointToken {
            peer: token,
            peer_closed,
            queued,
        })
    }

    /// Recreates an endpoint exported by another runtime.
    pub(crate) fn import(
        runtime: &Arc<Runtime>,
        token: EndpointToken,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let remote = RemotePeer {
            token: token.peer,
            transport,
        };
        let mut state = PipeState::new(if token.peer_closed {
            PeerLink::Detached
        } else {
            PeerLink::Remote(remote)
        });
        state.peer_closed = token.peer_closed;
        for payload in token.queued {
            state.queued_bytes += payload.len() as u64;
            state.queue.push_back(Message::new(payload));
        }
        state.sync_queue_usage();

        let pipe = runtime.next_object_id();
        let inner = PipeEndpoint::new(runtime, pipe, state);
        if !token.peer_closed {
            runtime.bind(token.peer, Arc::downgrade(&inner));
        }
        debug!(endpoint = %inner.id, token = %token.peer, "message pipe endpoint imported");
        Self { inner }
    }
}
