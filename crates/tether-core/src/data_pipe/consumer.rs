use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tether_types::{EndpointSnapshot, Error, HandleKind, ObjectId, ReadDataFlags, SignalState, Signals};
use tracing::{debug, trace};

use super::Geometry;
use super::producer::{ProducerInner, visit_producer};
use super::ring::Ring;
use crate::context::RequestContext;
use crate::endpoint::{Endpoint, EndpointCore, Life, Visit, sealed, visit};
use crate::runtime::Runtime;
use crate::watchers::{Watcher, WatcherId, WatcherSet};

pub(crate) struct ConsumerState {
    life: Life<ConsumerInner>,
    in_transit: bool,
    read_offset: usize,
    bytes_available: usize,
    /// Bytes granted by an open two-phase read.
    two_phase: Option<usize>,
    new_data: bool,
    peer: Weak<ProducerInner>,
    peer_closed: bool,
    watchers: WatcherSet,
}

impl ConsumerState {
    fn new(peer: Weak<ProducerInner>) -> Self {
        Self {
            life: Life::Open,
            in_transit: false,
            read_offset: 0,
            bytes_available: 0,
            two_phase: None,
            new_data: false,
            peer,
            peer_closed: false,
            watchers: WatcherSet::default(),
        }
    }

    fn moved(next: Weak<ConsumerInner>) -> Self {
        let mut state = Self::new(Weak::new());
        state.life = Life::Moved(next);
        state
    }

    fn signal_state(&self) -> SignalState {
        if !self.life.is_open() {
            return SignalState::default();
        }
        let mut satisfied = Signals::empty();
        let mut satisfiable = Signals::PEER_CLOSED;
        if self.bytes_available > 0 {
            if self.two_phase.is_none() {
                satisfied |= Signals::READABLE;
            }
            if self.new_data {
                satisfied |= Signals::NEW_DATA_READABLE;
            }
            satisfiable |= Signals::READABLE;
        } else if !self.peer_closed {
            satisfiable |= Signals::READABLE;
        }
        if self.new_data || !self.peer_closed {
            satisfiable |= Signals::NEW_DATA_READABLE;
        }
        if self.peer_closed {
            satisfied |= Signals::PEER_CLOSED;
        } else {
            satisfiable |= Signals::PEER_REMOTE;
        }
        SignalState::new(satisfied, satisfiable)
    }

    fn notify(&mut self) {
        let state = self.signal_state();
        self.watchers.notify(state);
    }

    /// Bytes already copied into the ring by the producer.
    pub(crate) fn on_data_written(&mut self, num_bytes: usize) {
        self.bytes_available += num_bytes;
        self.new_data = true;
        trace!(available = self.bytes_available, "data pipe bytes readable");
        self.notify();
    }

    pub(crate) fn on_peer_closed(&mut self) {
        if self.peer_closed {
            return;
        }
        self.peer_closed = true;
        self.notify();
    }

    pub(crate) fn repoint(&mut self, old: *const ProducerInner, next: &Weak<ProducerInner>) {
        if std::ptr::eq(self.peer.as_ptr(), old) {
            self.peer = next.clone();
        }
    }

    fn clear_new_data(&mut self) {
        if std::mem::take(&mut self.new_data) {
            self.notify();
        }
    }
}

pub(crate) struct ConsumerInner {
    id: ObjectId,
    pipe: ObjectId,
    runtime: Arc<Runtime>,
    geometry: Geometry,
    ring: Arc<Ring>,
    state: Mutex<ConsumerState>,
}

fn lock_consumer(inner: &ConsumerInner) -> MutexGuard<'_, ConsumerState> {
    inner.state.lock()
}

fn step(state: &ConsumerState) -> Result<Option<Weak<ConsumerInner>>, Option<()>> {
    match &state.life {
        Life::Open => Ok(None),
        Life::Moved(next) => Ok(Some(next.clone())),
        Life::Closed => Err(None),
    }
}

/// Runs `f` on the live consumer `start` resolves to, if any.
pub(crate) fn visit_consumer(start: &Weak<ConsumerInner>, f: impl FnOnce(&mut ConsumerState)) {
    let _: Visit<(), ()> = visit(start, lock_consumer, step, |_, st| f(st));
}

/// How a read moves data out of the ring.
enum Sink<'a> {
    Copy(&'a mut [u8]),
    Discard(usize),
}

impl Sink<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Copy(out) => out.len(),
            Self::Discard(num_bytes) => *num_bytes,
        }
    }
}

impl ConsumerInner {
    pub(crate) fn new_for(
        runtime: &Arc<Runtime>,
        pipe: ObjectId,
        geometry: Geometry,
        ring: Arc<Ring>,
        producer: Weak<ProducerInner>,
    ) -> Arc<Self> {
        Self::new(runtime, pipe, geometry, ring, ConsumerState::new(producer))
    }

    fn new(
        runtime: &Arc<Runtime>,
        pipe: ObjectId,
        geometry: Geometry,
        ring: Arc<Ring>,
        state: ConsumerState,
    ) -> Arc<Self> {
        let inner = Arc::new(Self {
            id: runtime.next_object_id(),
            pipe,
            runtime: runtime.clone(),
            geometry,
            ring,
            state: Mutex::new(state),
        });
        runtime.register_endpoint(inner.clone());
        inner
    }

    fn close(&self) -> Result<(), Error> {
        let peer = {
            let mut st = self.state.lock();
            st.life.check()?;
            if st.in_transit {
                return Err(Error::invalid_argument("handle is being transferred"));
            }
            st.life = Life::Closed;
            st.two_phase = None;
            st.bytes_available = 0;
            st.watchers.notify_closed();
            std::mem::take(&mut st.peer)
        };
        visit_producer(&peer, |st| st.on_peer_closed());
        debug!(pipe = %self.pipe, endpoint = %self.id, "data pipe consumer closed");
        Ok(())
    }

    fn credit_producer(&self, peer: &Weak<ProducerInner>, num_bytes: usize) {
        if num_bytes > 0 {
            let capacity = self.geometry.capacity;
            visit_producer(peer, |st| st.on_data_read(num_bytes, capacity));
        }
    }

    fn read(&self, mut sink: Sink<'_>, flags: ReadDataFlags) -> Result<usize, Error> {
        let _ctx = RequestContext::enter();
        flags.validate()?;
        let (consumed, peer) = {
            let mut st = self.state.lock();
            st.life.check()?;
            if st.two_phase.is_some() {
                return Err(Error::busy("two-phase read in progress"));
            }
            st.clear_new_data();
            if flags.contains(ReadDataFlags::QUERY) {
                return Ok(st.bytes_available);
            }
            let requested = sink.len();
            if !self.geometry.is_aligned(requested) {
                return Err(Error::invalid_argument(
                    "read size is not a multiple of the element size",
                ));
            }
            if flags.contains(ReadDataFlags::ALL_OR_NONE) && requested > st.bytes_available {
                return Err(if st.peer_closed {
                    Error::failed_precondition("producer is closed")
                } else {
                    Error::out_of_range("not enough data for an all-or-none read")
                });
            }
            let num_bytes = requested.min(st.bytes_available);
            if num_bytes == 0 {
                if st.bytes_available > 0 {
                    return Ok(0);
                }
                return Err(if st.peer_closed {
                    Error::failed_precondition("producer is closed")
                } else {
                    Error::should_wait("data pipe is empty")
                });
            }
            if let Sink::Copy(out) = &mut sink {
                // SAFETY: the `num_bytes` bytes from the read offset are
                // readable data, which only the consumer touches, and we hold
                // its lock.
                unsafe { self.ring.read(st.read_offset, &mut out[..num_bytes]) };
            }
            if flags.contains(ReadDataFlags::PEEK) {
                return Ok(num_bytes);
            }
            st.read_offset = (st.read_offset + num_bytes) % self.geometry.capacity;
            st.bytes_available -= num_bytes;
            st.notify();
            (num_bytes, st.peer.clone())
        };
        self.credit_producer(&peer, consumed);
        Ok(consumed)
    }

    fn end_read(&self, num_bytes: usize) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        let (result, peer) = {
            let mut st = self.state.lock();
            st.life.check()?;
            let Some(granted) = st.two_phase.take() else {
                return Err(Error::failed_precondition("no two-phase read in progress"));
            };
            let result = if num_bytes > granted || !self.geometry.is_aligned(num_bytes) {
                Err(Error::invalid_argument("invalid number of bytes read"))
            } else {
                st.read_offset = (st.read_offset + num_bytes) % self.geometry.capacity;
                st.bytes_available -= num_bytes;
                Ok(num_bytes)
            };
            st.notify();
            (result, st.peer.clone())
        };
        let consumed = result?;
        self.credit_producer(&peer, consumed);
        trace!(endpoint = %self.id, consumed, "two-phase read ended");
        Ok(())
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        if self.state.get_mut().life.is_open() {
            let _ctx = RequestContext::enter();
            let _ = self.close();
        }
    }
}

impl EndpointCore for ConsumerInner {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::DataPipeConsumer
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
            kind: HandleKind::DataPipeConsumer,
            signals_state: st.signal_state().to_snapshot(),
            queued: st.bytes_available as u64,
            peer_remote: false,
        })
    }
}

/// Reading end of a data pipe.
#[derive(Clone)]
pub struct DataPipeConsumer {
    inner: Arc<ConsumerInner>,
}

impl fmt::Debug for DataPipeConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPipeConsumer")
            .field("id", &self.inner.id)
            .field("pipe", &self.inner.pipe)
            .finish()
    }
}

impl DataPipeConsumer {
    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    pub fn element_num_bytes(&self) -> usize {
        self.inner.geometry.element_num_bytes
    }

    /// Reads into `buf` and returns the number of bytes read.
    ///
    /// With `QUERY` nothing is read and the number of readable bytes is
    /// returned; with `DISCARD` up to `buf.len()` bytes are dropped without
    /// being copied; with `PEEK` the bytes stay in the pipe.
    pub fn read(&self, buf: &mut [u8], flags: ReadDataFlags) -> Result<usize, Error> {
        if flags.contains(ReadDataFlags::DISCARD) {
            return self.inner.read(Sink::Discard(buf.len()), flags);
        }
        self.inner.read(Sink::Copy(buf), flags)
    }

    /// Drops up to `num_bytes` readable bytes.
    pub fn discard(&self, num_bytes: usize, flags: ReadDataFlags) -> Result<usize, Error> {
        self.inner
            .read(Sink::Discard(num_bytes), flags | ReadDataFlags::DISCARD)
    }

    /// Number of bytes that can be read right now.
    pub fn query(&self) -> Result<usize, Error> {
        self.inner.read(Sink::Discard(0), ReadDataFlags::QUERY)
    }

    /// Opens a two-phase read over the largest contiguous readable span.
    pub fn begin_read(&self) -> Result<ReadRegion<'_>, Error> {
        let _ctx = RequestContext::enter();
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.life.check()?;
        if st.two_phase.is_some() {
            return Err(Error::busy("two-phase read in progress"));
        }
        st.clear_new_data();
        if st.bytes_available == 0 {
            return Err(if st.peer_closed {
                Error::failed_precondition("producer is closed")
            } else {
                Error::should_wait("data pipe is empty")
            });
        }
        let offset = st.read_offset;
        let granted = st.bytes_available.min(inner.geometry.capacity - offset);
        st.two_phase = Some(granted);
        st.notify();
        drop(st);
        // SAFETY: the span is readable data owned by the consumer, it does not
        // wrap, and `two_phase` keeps the consumer from releasing it to the
        // producer until the region ends.
        let buf = unsafe { inner.ring.span(offset, granted) };
        Ok(ReadRegion {
            consumer: inner,
            buf,
            ended: false,
        })
    }

    pub(crate) fn begin_transit(&self) -> Result<(), Error> {
        let mut st = self.inner.state.lock();
        st.life.check()?;
        if st.in_transit {
            return Err(Error::busy("handle is already being transferred"));
        }
        if st.two_phase.is_some() {
            return Err(Error::busy("two-phase read in progress"));
        }
        st.in_transit = true;
        Ok(())
    }

    pub(crate) fn cancel_transit(&self) {
        self.inner.state.lock().in_transit = false;
    }

    pub(crate) fn complete_transit(&self) -> Self {
        let old = &self.inner;
        let successor = ConsumerInner::new(
            &old.runtime,
            old.pipe,
            old.geometry,
            old.ring.clone(),
            ConsumerState::new(Weak::new()),
        );
        let next = Arc::downgrade(&successor);
        let peer = {
            let mut st = old.state.lock();
            let mut moved = std::mem::replace(&mut *st, ConsumerState::moved(next.clone()));
            moved.watchers.notify_closed();
            moved.in_transit = false;
            let peer = moved.peer.clone();
            *successor.state.lock() = moved;
            peer
        };
        let me: *const ConsumerInner = Arc::as_ptr(old);
        visit_producer(&peer, |st| st.repoint(me, &next));
        trace!(from = %old.id, to = %successor.id, "data pipe consumer transferred");
        Self { inner: successor }
    }
}

impl sealed::Sealed for DataPipeConsumer {
    fn core(&self) -> Result<Arc<dyn EndpointCore>, Error> {
        self.inner.state.lock().life.check()?;
        Ok(self.inner.clone())
    }
}

impl Endpoint for DataPipeConsumer {
    fn id(&self) -> ObjectId {
        self.inner.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::DataPipeConsumer
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
}

/// Direct access to readable bytes during a two-phase read.
///
/// Dropping the region without calling [`end`](Self::end) ends it having
/// consumed nothing.
pub struct ReadRegion<'a> {
    consumer: &'a ConsumerInner,
    buf: &'a [u8],
    ended: bool,
}

impl ReadRegion<'_> {
    /// Releases the first `num_bytes` bytes of the region back to the producer.
    pub fn end(mut self, num_bytes: usize) -> Result<(), Error> {
        self.ended = true;
        self.consumer.end_read(num_bytes)
    }
}

impl Deref for ReadRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf
    }
}

impl Drop for ReadRegion<'_> {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.consumer.end_read(0);
        }
    }
}
