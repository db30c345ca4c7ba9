//! Shared buffers: handles to one block of memory with per-handle access modes.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tether_types::{
    AccessMode, DuplicateBufferOptions, EndpointSnapshot, Error, HandleKind, ObjectId,
    SharedBufferInfo, SharedBufferOptions, SignalState,
};
use tracing::{debug, trace};

use crate::context::RequestContext;
use crate::endpoint::{Endpoint, EndpointCore, Life, sealed};
use crate::runtime::Runtime;
use crate::watchers::{Watcher, WatcherId};

/// Source of the memory behind shared buffers.
pub trait Allocator: Send + Sync {
    /// Returns `num_bytes` zeroed bytes, or `ResourceExhausted`.
    fn allocate(&self, num_bytes: usize) -> Result<Vec<u8>, Error>;
}

/// Allocates from the process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, num_bytes: usize) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(num_bytes)
            .map_err(|_| Error::resource_exhausted("shared buffer allocation failed"))?;
        bytes.resize(num_bytes, 0);
        Ok(bytes)
    }
}

struct BufferState {
    life: Life<BufferHandle>,
    in_transit: bool,
    access: AccessMode,
}

struct BufferHandle {
    id: ObjectId,
    runtime: Arc<Runtime>,
    memory: Arc<RwLock<Box<[u8]>>>,
    state: Mutex<BufferState>,
}

impl BufferHandle {
    fn new(runtime: &Arc<Runtime>, memory: Arc<RwLock<Box<[u8]>>>, access: AccessMode) -> Arc<Self> {
        let handle = Arc::new(Self {
            id: runtime.next_object_id(),
            runtime: runtime.clone(),
            memory,
            state: Mutex::new(BufferState {
                life: Life::Open,
                in_transit: false,
                access,
            }),
        });
        runtime.register_endpoint(handle.clone());
        handle
    }

    fn size(&self) -> usize {
        self.memory.read().len()
    }
}

impl EndpointCore for BufferHandle {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::SharedBuffer
    }

    fn add_watcher(&self, _watcher: Watcher) -> Result<(), Error> {
        Err(Error::invalid_argument("shared buffers cannot be trapped"))
    }

    fn remove_watcher(&self, _id: WatcherId) {}

    fn snapshot(&self) -> Option<EndpointSnapshot> {
        if !self.state.lock().life.is_open() {
            return None;
        }
        Some(EndpointSnapshot {
            id: self.id,
            kind: HandleKind::SharedBuffer,
            signals_state: SignalState::default().to_snapshot(),
            queued: self.size() as u64,
            peer_remote: false,
        })
    }
}

/// A handle to shared memory.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<BufferHandle>,
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("id", &self.inner.id)
            .field("access", &self.inner.state.lock().access)
            .finish()
    }
}

pub(crate) fn create(
    runtime: &Arc<Runtime>,
    num_bytes: u64,
    options: &SharedBufferOptions,
) -> Result<SharedBuffer, Error> {
    options.validate()?;
    if num_bytes == 0 {
        return Err(Error::invalid_argument("shared buffer size must be non-zero"));
    }
    if num_bytes > runtime.options().max_shared_buffer_num_bytes {
        return Err(Error::resource_exhausted("shared buffer too large"));
    }
    let len = usize::try_from(num_bytes)
        .map_err(|_| Error::resource_exhausted("shared buffer too large"))?;
    let bytes = runtime.allocator().allocate(len)?;
    let memory = Arc::new(RwLock::new(bytes.into_boxed_slice()));
    let inner = BufferHandle::new(runtime, memory, AccessMode::Writable);
    debug!(buffer = %inner.id, num_bytes, "shared buffer created");
    Ok(SharedBuffer { inner })
}

impl SharedBuffer {
    pub fn access_mode(&self) -> Result<AccessMode, Error> {
        let st = self.inner.state.lock();
        st.life.check()?;
        Ok(st.access)
    }

    pub fn info(&self) -> Result<SharedBufferInfo, Error> {
        let access = self.access_mode()?;
        Ok(SharedBufferInfo {
            size: self.inner.size() as u64,
            access,
        })
    }

    /// Creates another handle to the same memory.
    ///
    /// A read-only duplicate narrows a `Writable` source to read-only as well;
    /// a writable duplicate of a `Writable` source leaves both `Unsafe`.
    pub fn duplicate(&self, options: &DuplicateBufferOptions) -> Result<SharedBuffer, Error> {
        let _ctx = RequestContext::enter();
        let access = {
            let mut st = self.inner.state.lock();
            st.life.check()?;
            if st.in_transit {
                return Err(Error::invalid_argument("handle is being transferred"));
            }
            match (options.read_only, st.access) {
                (true, AccessMode::Unsafe) => {
                    return Err(Error::failed_precondition(
                        "cannot make a read-only duplicate of a shared writable buffer",
                    ));
                }
                (false, AccessMode::ReadOnly) => {
                    return Err(Error::failed_precondition(
                        "cannot make a writable duplicate of a read-only buffer",
                    ));
                }
                (true, _) => st.access = AccessMode::ReadOnly,
                (false, _) => st.access = AccessMode::Unsafe,
            }
            st.access
        };
        let inner = BufferHandle::new(&self.inner.runtime, self.inner.memory.clone(), access);
        debug!(from = %self.inner.id, to = %inner.id, ?access, "shared buffer duplicated");
        Ok(SharedBuffer { inner })
    }

    /// Maps `len` bytes starting at `offset`.
    pub fn map(&self, offset: u64, len: u64) -> Result<Mapping, Error> {
        let access = self.access_mode()?;
        let size = self.inner.size() as u64;
        if len == 0 {
            return Err(Error::invalid_argument("mapping length must be non-zero"));
        }
        match offset.checked_add(len) {
            Some(end) if end <= size => {}
            _ => return Err(Error::invalid_argument("mapping exceeds the buffer")),
        }
        trace!(buffer = %self.inner.id, offset, len, "shared buffer mapped");
        Ok(Mapping {
            memory: self.inner.memory.clone(),
            offset: offset as usize,
            len: len as usize,
            writable: access.is_writable(),
        })
    }

    pub(crate) fn begin_transit(&self) -> Result<(), Error> {
        let mut st = self.inner.state.lock();
        st.life.check()?;
        if st.in_transit {
            return Err(Error::busy("handle is already being transferred"));
        }
        st.in_transit = true;
        Ok(())
    }

    pub(crate) fn cancel_transit(&self) {
        self.inner.state.lock().in_transit = false;
    }

    pub(crate) fn complete_transit(&self) -> Self {
        let mut st = self.inner.state.lock();
        let successor = BufferHandle::new(&self.inner.runtime, self.inner.memory.clone(), st.access);
        st.in_transit = false;
        st.life = Life::Moved(Arc::downgrade(&successor));
        trace!(from = %self.inner.id, to = %successor.id, "shared buffer transferred");
        Self { inner: successor }
    }
}

impl sealed::Sealed for SharedBuffer {
    fn core(&self) -> Result<Arc<dyn EndpointCore>, Error> {
        self.inner.state.lock().life.check()?;
        Ok(self.inner.clone())
    }
}

impl Endpoint for SharedBuffer {
    fn id(&self) -> ObjectId {
        self.inner.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::SharedBuffer
    }

    fn signal_state(&self) -> Result<SignalState, Error> {
        self.inner.state.lock().life.check()?;
        Ok(SignalState::default())
    }

    fn close(&self) -> Result<(), Error> {
        let mut st = self.inner.state.lock();
        st.life.check()?;
        if st.in_transit {
            return Err(Error::invalid_argument("handle is being transferred"));
        }
        st.life = Life::Closed;
        debug!(buffer = %self.inner.id, "shared buffer closed");
        Ok(())
    }
}

/// A window onto shared memory. Stays valid after the handle closes.
pub struct Mapping {
    memory: Arc<RwLock<Box<[u8]>>>,
    offset: usize,
    len: usize,
    writable: bool,
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.offset + offset..self.offset + end),
            _ => Err(Error::out_of_range("access outside the mapping")),
        }
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), Error> {
        let range = self.range(offset, out.len())?;
        out.copy_from_slice(&self.memory.read()[range]);
        Ok(())
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::failed_precondition("mapping is read-only"));
        }
        let range = self.range(offset, data.len())?;
        self.memory.write()[range].copy_from_slice(data);
        Ok(())
    }

    /// Copies the whole mapped window out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.memory.read()[self.offset..self.offset + self.len].to_vec()
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}
