use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tether_types::{
    EndpointSnapshot, Error, HandleKind, ObjectId, SignalState, Signals, WriteDataFlags,
};
use tracing::{debug, trace};

use super::consumer::{ConsumerInner, DataPipeConsumer};
use super::ring::Ring;
use super::Geometry;
use crate::context::RequestContext;
use crate::endpoint::{Endpoint, EndpointCore, Life, Visit, sealed, visit};
use crate::runtime::Runtime;
use crate::watchers::{Watcher, WatcherId, WatcherSet};

pub(crate) struct ProducerState {
    life: Life<ProducerInner>,
    in_transit: bool,
    write_offset: usize,
    available_capacity: usize,
    /// Bytes granted by an open two-phase write.
    two_phase: Option<usize>,
    peer: Weak<ConsumerInner>,
    peer_closed: bool,
    watchers: WatcherSet,
}

impl ProducerState {
    fn new(available_capacity: usize) -> Self {
        Self {
            life: Life::Open,
            in_transit: false,
            write_offset: 0,
            available_capacity,
            two_phase: None,
            peer: Weak::new(),
            peer_closed: false,
            watchers: WatcherSet::default(),
        }
    }

    fn moved(next: Weak<ProducerInner>) -> Self {
        let mut state = Self::new(0);
        state.life = Life::Moved(next);
        state
    }

    fn signal_state(&self) -> SignalState {
        if !self.life.is_open() {
            return SignalState::default();
        }
        let mut satisfied = Signals::empty();
        let mut satisfiable = Signals::PEER_CLOSED;
        if self.peer_closed {
            satisfied |= Signals::PEER_CLOSED;
        } else {
            if self.two_phase.is_none() && self.available_capacity > 0 {
                satisfied |= Signals::WRITABLE;
            }
            satisfiable |= Signals::WRITABLE | Signals::PEER_REMOTE;
        }
        SignalState::new(satisfied, satisfiable)
    }

    fn notify(&mut self) {
        let state = self.signal_state();
        self.watchers.notify(state);
    }

    pub(crate) fn on_data_read(&mut self, num_bytes: usize, capacity: usize) {
        self.available_capacity = (self.available_capacity + num_bytes).min(capacity);
        self.notify();
    }

    pub(crate) fn on_peer_closed(&mut self) {
        if self.peer_closed {
            return;
        }
        self.peer_closed = true;
        self.notify();
    }

    pub(crate) fn repoint(&mut self, old: *const ConsumerInner, next: &Weak<ConsumerInner>) {
        if std::ptr::eq(self.peer.as_ptr(), old) {
            self.peer = next.clone();
        }
    }
}

pub(crate) struct ProducerInner {
    id: ObjectId,
    pipe: ObjectId,
    runtime: Arc<Runtime>,
    geometry: Geometry,
    ring: Arc<Ring>,
    state: Mutex<ProducerState>,
}

fn lock_producer(inner: &ProducerInner) -> MutexGuard<'_, ProducerState> {
    inner.state.lock()
}

fn step(state: &ProducerState) -> Result<Option<Weak<ProducerInner>>, Option<()>> {
    match &state.life {
        Life::Open => Ok(None),
        Life::Moved(next) => Ok(Some(next.clone())),
        Life::Closed => Err(None),
    }
}

/// Runs `f` on the live producer `start` resolves to, if any.
pub(crate) fn visit_producer(start: &Weak<ProducerInner>, f: impl FnOnce(&mut ProducerState)) {
    let _: Visit<(), ()> = visit(start, lock_producer, step, |_, st| f(st));
}

pub(crate) fn new_pair(
    runtime: &Arc<Runtime>,
    pipe: ObjectId,
    geometry: Geometry,
    ring: Arc<Ring>,
) -> (DataPipeProducer, DataPipeConsumer) {
    let producer = ProducerInner::new(
        runtime,
        pipe,
        geometry,
        ring.clone(),
        ProducerState::new(geometry.capacity),
    );
    let consumer = ConsumerInner::new_for(runtime, pipe, geometry, ring, Arc::downgrade(&producer));
    producer.state.lock().peer = Arc::downgrade(&consumer);
    (
        DataPipeProducer { inner: producer },
        DataPipeConsumer::from_inner(consumer),
    )
}

impl ProducerInner {
    fn new(
        runtime: &Arc<Runtime>,
        pipe: ObjectId,
        geometry: Geometry,
        ring: Arc<Ring>,
        state: ProducerState,
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
            st.watchers.notify_closed();
            std::mem::take(&mut st.peer)
        };
        super::consumer::visit_consumer(&peer, |st| st.on_peer_closed());
        debug!(pipe = %self.pipe, endpoint = %self.id, "data pipe producer closed");
        Ok(())
    }

    fn credit_consumer(&self, peer: &Weak<ConsumerInner>, num_bytes: usize) {
        if num_bytes > 0 {
            super::consumer::visit_consumer(peer, |st| st.on_data_written(num_bytes));
        }
    }

    fn end_write(&self, num_bytes: usize) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        let (result, peer) = {
            let mut st = self.state.lock();
            st.life.check()?;
            let Some(granted) = st.two_phase.take() else {
                return Err(Error::failed_precondition("no two-phase write in progress"));
            };
            let result = if num_bytes > granted || !self.geometry.is_aligned(num_bytes) {
                Err(Error::invalid_argument("invalid number of bytes written"))
            } else {
                st.write_offset = (st.write_offset + num_bytes) % self.geometry.capacity;
                st.available_capacity -= num_bytes;
                Ok(num_bytes)
            };
            st.notify();
            (result, st.peer.clone())
        };
        let written = result?;
        self.credit_consumer(&peer, written);
        trace!(endpoint = %self.id, written, "two-phase write ended");
        Ok(())
    }
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        if self.state.get_mut().life.is_open() {
            let _ctx = RequestContext::enter();
            let _ = self.close();
        }
    }
}

impl EndpointCore for ProducerInner {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::DataPipeProducer
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
            kind: HandleKind::DataPipeProducer,
            signals_state: st.signal_state().to_snapshot(),
            queued: (self.geometry.capacity - st.available_capacity) as u64,
            peer_remote: false,
        })
    }
}

/// Writing end of a data pipe.
#[derive(Clone)]
pub struct DataPipeProducer {
    inner: Arc<ProducerInner>,
}

impl fmt::Debug for DataPipeProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPipeProducer")
            .field("id", &self.inner.id)
            .field("pipe", &self.inner.pipe)
            .finish()
    }
}

impl DataPipeProducer {
    pub fn element_num_bytes(&self) -> usize {
        self.inner.geometry.element_num_bytes
    }

    pub fn capacity(&self) -> usize {
        self.inner.geometry.capacity
    }

    /// Copies as many whole elements of `data` as fit and returns how many
    /// bytes were written.
    pub fn write(&self, data: &[u8], flags: WriteDataFlags) -> Result<usize, Error> {
        let _ctx = RequestContext::enter();
        let inner = &self.inner;
        let (written, peer) = {
            let mut st = inner.state.lock();
            st.life.check()?;
            if st.two_phase.is_some() {
                return Err(Error::busy("two-phase write in progress"));
            }
            if st.peer_closed {
                return Err(Error::failed_precondition("consumer is closed"));
            }
            if !inner.geometry.is_aligned(data.len()) {
                return Err(Error::invalid_argument(
                    "write size is not a multiple of the element size",
                ));
            }
            if data.is_empty() {
                return Ok(0);
            }
            if flags.contains(WriteDataFlags::ALL_OR_NONE) && data.len() > st.available_capacity {
                return Err(Error::out_of_range("not enough room for an all-or-none write"));
            }
            let written = data.len().min(st.available_capacity);
            if written == 0 {
                return Err(Error::should_wait("data pipe is full"));
            }
            // SAFETY: the `written` bytes from the write offset are free space,
            // which only the producer touches, and we hold its lock.
            unsafe { inner.ring.write(st.write_offset, &data[..written]) };
            st.write_offset = (st.write_offset + written) % inner.geometry.capacity;
            st.available_capacity -= written;
            st.notify();
            (written, st.peer.clone())
        };
        inner.credit_consumer(&peer, written);
        Ok(written)
    }

    /// Opens a two-phase write over the largest contiguous free span.
    ///
    /// The span may be shorter than the total free space when it would wrap.
    pub fn begin_write(&self) -> Result<WriteRegion<'_>, Error> {
        let _ctx = RequestContext::enter();
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.life.check()?;
        if st.two_phase.is_some() {
            return Err(Error::busy("two-phase write in progress"));
        }
        if st.peer_closed {
            return Err(Error::failed_precondition("consumer is closed"));
        }
        let offset = st.write_offset;
        let granted = (inner.geometry.capacity - offset).min(st.available_capacity);
        if granted == 0 {
            return Err(Error::should_wait("data pipe is full"));
        }
        st.two_phase = Some(granted);
        st.notify();
        drop(st);
        // SAFETY: the span is free space owned by the producer, it does not
        // wrap, and `two_phase` keeps every other producer operation off it
        // until the region ends.
        let buf = unsafe { inner.ring.span_mut(offset, granted) };
        Ok(WriteRegion {
            producer: inner,
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
            return Err(Error::busy("two-phase write in progress"));
        }
        st.in_transit = true;
        Ok(())
    }

    pub(crate) fn cancel_transit(&self) {
        self.inner.state.lock().in_transit = false;
    }

    pub(crate) fn complete_transit(&self) -> Self {
        let old = &self.inner;
        let successor = ProducerInner::new(
            &old.runtime,
            old.pipe,
            old.geometry,
            old.ring.clone(),
            ProducerState::new(0),
        );
        let next = Arc::downgrade(&successor);
        let peer = {
            let mut st = old.state.lock();
            let mut moved = std::mem::replace(&mut *st, ProducerState::moved(next.clone()));
            moved.watchers.notify_closed();
            moved.in_transit = false;
            let peer = moved.peer.clone();
            *successor.state.lock() = moved;
            peer
        };
        let me: *const ProducerInner = Arc::as_ptr(old);
        super::consumer::visit_consumer(&peer, |st| st.repoint(me, &next));
        trace!(from = %old.id, to = %successor.id, "data pipe producer transferred");
        Self { inner: successor }
    }
}

impl sealed::Sealed for DataPipeProducer {
    fn core(&self) -> Result<Arc<dyn EndpointCore>, Error> {
        self.inner.state.lock().life.check()?;
        Ok(self.inner.clone())
    }
}

impl Endpoint for DataPipeProducer {
    fn id(&self) -> ObjectId {
        self.inner.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::DataPipeProducer
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

/// Direct access to free space in the ring during a two-phase write.
///
/// Dropping the region without calling [`end`](Self::end) ends it having
/// written nothing.
pub struct WriteRegion<'a> {
    producer: &'a ProducerInner,
    buf: &'a mut [u8],
    ended: bool,
}

impl WriteRegion<'_> {
    /// Publishes the first `num_bytes` bytes of the region to the consumer.
    ///
    /// An invalid count fails with `InvalidArgument`; the session ends either way.
    pub fn end(mut self, num_bytes: usize) -> Result<(), Error> {
        self.ended = true;
        self.producer.end_write(num_bytes)
    }
}

impl Deref for WriteRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf
    }
}

impl DerefMut for WriteRegion<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf
    }
}

impl Drop for WriteRegion<'_> {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.producer.end_write(0);
        }
    }
}
