use std::sync::{Arc, Weak};

use tether_types::{
    EndpointSnapshot, Error, HandleKind, ObjectId, QuotaInfo, QuotaOptions, QuotaType, SignalState,
};

use crate::watchers::{Watcher, WatcherId};

/// Shared surface of every endpoint type.
pub trait Endpoint: sealed::Sealed {
    fn id(&self) -> ObjectId;

    fn kind(&self) -> HandleKind;

    /// Current signals. Fails with `InvalidArgument` once the handle is closed
    /// or transferred.
    fn signal_state(&self) -> Result<SignalState, Error>;

    /// Closes the endpoint. Every clone of the handle observes the closure.
    fn close(&self) -> Result<(), Error>;

    /// Only message pipes carry quotas.
    fn set_quota(&self, ty: QuotaType, limit: u64, options: &QuotaOptions) -> Result<(), Error> {
        let _ = (ty, limit, options);
        Err(Error::invalid_argument("quotas are only supported on message pipes"))
    }

    fn query_quota(&self, ty: QuotaType) -> Result<QuotaInfo, Error> {
        let _ = ty;
        Err(Error::invalid_argument("quotas are only supported on message pipes"))
    }
}

pub(crate) mod sealed {
    use std::sync::Arc;

    use tether_types::Error;

    use super::EndpointCore;

    pub trait Sealed {
        fn core(&self) -> Result<Arc<dyn EndpointCore>, Error>;
    }
}

/// What traps and the runtime registry need from an endpoint.
pub trait EndpointCore: Send + Sync {
    fn id(&self) -> ObjectId;

    fn kind(&self) -> HandleKind;

    /// Registers `watcher` under the endpoint lock and reports the current
    /// state to it.
    fn add_watcher(&self, watcher: Watcher) -> Result<(), Error>;

    fn remove_watcher(&self, id: WatcherId);

    /// `None` once the endpoint is closed or moved.
    fn snapshot(&self) -> Option<EndpointSnapshot>;
}

/// Lifecycle of one endpoint object.
///
/// `Moved` endpoints forward to the object that took over their state, which is
/// how peers keep reaching an endpoint that was sent in a message or fused.
pub(crate) enum Life<T> {
    Open,
    Closed,
    Moved(Weak<T>),
}

impl<T> Life<T> {
    pub(crate) fn check(&self) -> Result<(), Error> {
        match self {
            Self::Open => Ok(()),
            Self::Closed => Err(Error::invalid_argument("handle is closed")),
            Self::Moved(_) => Err(Error::invalid_argument("handle was transferred")),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Outcome of visiting an object through a possibly forwarded weak link.
pub(crate) enum Visit<R, X> {
    Local(R),
    /// The chain ended at something that is not a live local object; `X`
    /// carries what the caller needs to reach it anyway (a remote peer).
    Elsewhere(X),
    Gone,
}

/// Walks `Moved` forwards starting at `start` and runs `f` on the first live
/// object found, under that object's lock.
///
/// `step` inspects the locked state: `Ok(Some(next))` follows a forward,
/// `Ok(None)` means "run `f` here", `Err(Some(x))` ends the walk with
/// `Elsewhere(x)` and `Err(None)` with `Gone`.
pub(crate) fn visit<T, S, R, X>(
    start: &Weak<T>,
    lock: impl Fn(&T) -> parking_lot::MutexGuard<'_, S>,
    step: impl Fn(&S) -> Result<Option<Weak<T>>, Option<X>>,
    f: impl FnOnce(&Arc<T>, &mut S) -> R,
) -> Visit<R, X> {
    let mut current = start.clone();
    loop {
        let Some(target) = current.upgrade() else {
            return Visit::Gone;
        };
        let mut state = lock(&target);
        match step(&state) {
            Ok(Some(next)) => {
                drop(state);
                current = next;
            }
            Ok(None) => return Visit::Local(f(&target, &mut state)),
            Err(Some(x)) => return Visit::Elsewhere(x),
            Err(None) => return Visit::Gone,
        }
    }
}
