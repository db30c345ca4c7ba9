use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tether_types::{
    DataPipeOptions, EndpointToken, Error, ObjectId, PeerToken, RuntimeSnapshot,
    SharedBufferOptions, TrapEvent,
};
use tracing::{debug, trace};
use ulid::Ulid;

use crate::context::RequestContext;
use crate::data_pipe::{self, DataPipeConsumer, DataPipeProducer};
use crate::endpoint::EndpointCore;
use crate::message::Message;
use crate::message_pipe::{self, MessagePipeEndpoint, PipeEndpoint};
use crate::options::RuntimeOptions;
use crate::shared_buffer::{self, Allocator, HeapAllocator, SharedBuffer};
use crate::transport::Transport;
use crate::trap::{Trap, TrapInner};

#[derive(Default)]
struct Registry {
    endpoints: Vec<Weak<dyn EndpointCore>>,
    traps: Vec<Weak<TrapInner>>,
}

/// Where messages arriving for a peer token go.
#[derive(Clone)]
enum Binding {
    Live(Weak<PipeEndpoint>),
    /// The local endpoint closed; the far side may not know yet.
    Closed,
}

/// Owns the id space, limits and remote bindings shared by a set of endpoints
/// and traps.
///
/// Every object is created through a runtime and keeps it alive; the runtime
/// only holds weak references back.
pub struct Runtime {
    options: RuntimeOptions,
    allocator: Arc<dyn Allocator>,
    node_id: u64,
    next_id: AtomicU64,
    next_link: AtomicU64,
    registry: Mutex<Registry>,
    bindings: Mutex<HashMap<PeerToken, Binding>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("node_name", &self.options.node_name)
            .field("node_id", &format_args!("{:x}", self.node_id))
            .finish()
    }
}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Arc<Self> {
        Self::with_allocator(options, Arc::new(HeapAllocator))
    }

    pub fn with_allocator(options: RuntimeOptions, allocator: Arc<dyn Allocator>) -> Arc<Self> {
        // The low bits of a ulid are random.
        let node_id = options.node_id.unwrap_or_else(|| Ulid::new().0 as u64);
        debug!(node = %options.node_name, node_id = %format_args!("{node_id:x}"), "runtime created");
        Arc::new(Self {
            options,
            allocator,
            node_id,
            next_id: AtomicU64::new(1),
            next_link: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            bindings: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub(crate) fn allocator(&self) -> &dyn Allocator {
        self.allocator.as_ref()
    }

    pub(crate) fn node_id(&self) -> u64 {
        self.node_id
    }

    pub(crate) fn next_object_id(&self) -> ObjectId {
        loop {
            // Only a wrapped counter yields 0.
            if let Ok(id) = ObjectId::new(self.next_id.fetch_add(1, Ordering::Relaxed)) {
                return id;
            }
        }
    }

    pub(crate) fn next_link(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_endpoint(&self, endpoint: Arc<dyn EndpointCore>) {
        let mut reg = self.registry.lock();
        reg.endpoints.retain(|w| w.strong_count() > 0);
        reg.endpoints.push(Arc::downgrade(&endpoint));
    }

    pub(crate) fn register_trap(&self, trap: &Arc<TrapInner>) {
        let mut reg = self.registry.lock();
        reg.traps.retain(|w| w.strong_count() > 0);
        reg.traps.push(Arc::downgrade(trap));
    }

    pub(crate) fn bind(&self, token: PeerToken, endpoint: Weak<PipeEndpoint>) {
        self.bindings.lock().insert(token, Binding::Live(endpoint));
    }

    /// Points a live binding at the object an endpoint was moved into.
    pub(crate) fn rebind(&self, token: PeerToken, endpoint: Weak<PipeEndpoint>) {
        if let Some(Binding::Live(live)) = self.bindings.lock().get_mut(&token) {
            *live = endpoint;
        }
    }

    pub(crate) fn mark_closed(&self, token: PeerToken) {
        if let Some(binding) = self.bindings.lock().get_mut(&token) {
            *binding = Binding::Closed;
        }
    }

    // ── Object creation ────────────────────────────────────────

    pub fn create_message_pipe(self: &Arc<Self>) -> (MessagePipeEndpoint, MessagePipeEndpoint) {
        message_pipe::create_pair(self)
    }

    pub fn create_data_pipe(
        self: &Arc<Self>,
        options: &DataPipeOptions,
    ) -> Result<(DataPipeProducer, DataPipeConsumer), Error> {
        data_pipe::create(self, options)
    }

    pub fn create_shared_buffer(
        self: &Arc<Self>,
        num_bytes: u64,
        options: &SharedBufferOptions,
    ) -> Result<SharedBuffer, Error> {
        shared_buffer::create(self, num_bytes, options)
    }

    /// Creates a trap whose events are delivered to `handler`.
    pub fn create_trap(&self, handler: impl FnMut(TrapEvent) + Send + 'static) -> Trap {
        Trap::new(self, handler)
    }

    /// Joins the peers of `b` and `c` into one pipe. `b` and `c` are closed
    /// whether or not this succeeds.
    pub fn fuse_message_pipes(&self, b: MessagePipeEndpoint, c: MessagePipeEndpoint) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        message_pipe::fuse(b, c)
    }

    // ── Remote peers ───────────────────────────────────────────

    /// Moves `endpoint` out of this runtime. Its peer keeps working, now
    /// talking through `transport` to wherever the token is imported.
    pub fn export_endpoint(
        &self,
        endpoint: MessagePipeEndpoint,
        transport: Arc<dyn Transport>,
    ) -> Result<EndpointToken, Error> {
        let _ctx = RequestContext::enter();
        endpoint.export(transport)
    }

    pub fn import_endpoint(
        self: &Arc<Self>,
        token: EndpointToken,
        transport: Arc<dyn Transport>,
    ) -> Result<MessagePipeEndpoint, Error> {
        let _ctx = RequestContext::enter();
        if self.bindings.lock().contains_key(&token.peer) {
            return Err(Error::already_exists("token is already imported"));
        }
        Ok(MessagePipeEndpoint::import(self, token, transport))
    }

    /// Feeds a message that arrived from the transport to the endpoint bound to `peer`.
    pub fn deliver_remote(&self, peer: PeerToken, message: Message) -> Result<(), Error> {
        let _ctx = RequestContext::enter_from_transport();
        let binding = self.bindings.lock().get(&peer).cloned();
        match binding {
            Some(Binding::Live(target)) => {
                MessagePipeEndpoint::deliver_from_transport(&target, message)
            }
            Some(Binding::Closed) => {
                Err(Error::failed_precondition("endpoint bound to peer is closed"))
            }
            None => Err(Error::not_found("no endpoint bound to peer")),
        }
    }

    /// Marks the endpoint bound to `peer` as peer-closed.
    pub fn remote_peer_closed(&self, peer: PeerToken) {
        let _ctx = RequestContext::enter_from_transport();
        let binding = self.bindings.lock().remove(&peer);
        match binding {
            Some(Binding::Live(target)) => MessagePipeEndpoint::remote_peer_closed(&target),
            Some(Binding::Closed) => trace!(%peer, "both ends of remote link closed"),
            None => debug!(%peer, "peer closed for unbound token"),
        }
    }

    // ── Diagnostics ────────────────────────────────────────────

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let (endpoints, traps) = {
            let mut reg = self.registry.lock();
            reg.endpoints.retain(|w| w.strong_count() > 0);
            reg.traps.retain(|w| w.strong_count() > 0);
            (
                reg.endpoints.iter().filter_map(Weak::upgrade).collect::<Vec<_>>(),
                reg.traps.iter().filter_map(Weak::upgrade).collect::<Vec<_>>(),
            )
        };
        let remote_bindings = self
            .bindings
            .lock()
            .values()
            .filter(|binding| matches!(binding, Binding::Live(_)))
            .count() as u64;
        let mut endpoints: Vec<_> = endpoints.iter().filter_map(|e| e.snapshot()).collect();
        endpoints.sort_by_key(|e| e.id);
        let mut traps: Vec<_> = traps.iter().map(|t| t.snapshot()).collect();
        traps.sort_by_key(|t| t.id);
        RuntimeSnapshot {
            node_name: self.options.node_name.clone(),
            endpoints,
            traps,
            remote_bindings,
        }
    }
}
