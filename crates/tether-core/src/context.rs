//! Per-thread request scopes.
//!
//! Every public entry point opens a [`RequestContext`]. Trap notifications
//! raised while a scope is open are queued on the current thread and only
//! dispatched once the outermost scope closes, at which point the caller holds
//! no endpoint or trap lock. Each handler runs inside a fresh nested scope, so
//! anything it triggers is dispatched right after it returns instead of
//! re-entering it.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tether_types::{SignalState, TrapEventResult};

use crate::trap::TrapInner;

/// Work queued for dispatch at scope exit.
pub(crate) enum Dispatch {
    Event {
        trap: Arc<TrapInner>,
        cancelled: Arc<AtomicBool>,
        context: u64,
        result: TrapEventResult,
        signals_state: SignalState,
    },
    Cancel {
        trap: Arc<TrapInner>,
        cancelled: Arc<AtomicBool>,
        context: u64,
    },
    ReleaseHandler {
        trap: Arc<TrapInner>,
    },
}

impl Dispatch {
    fn run(self, within_api_call: bool) {
        match self {
            Self::Event {
                trap,
                cancelled,
                context,
                result,
                signals_state,
            } => trap.deliver_event(&cancelled, context, result, signals_state, within_api_call),
            Self::Cancel {
                trap,
                cancelled,
                context,
            } => trap.deliver_cancel(&cancelled, context, within_api_call),
            Self::ReleaseHandler { trap } => trap.release_handler(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Source {
    Api,
    Transport,
}

struct Frame {
    source: Source,
    pending: Vec<Dispatch>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct RequestContext {
    owns_frame: bool,
    _not_send: PhantomData<*const ()>,
}

impl RequestContext {
    /// Opens a scope for a caller's API call.
    pub(crate) fn enter() -> Self {
        Self::open(Source::Api, false)
    }

    /// Opens a scope for work driven by a transport delivery.
    pub(crate) fn enter_from_transport() -> Self {
        Self::open(Source::Transport, false)
    }

    fn open(source: Source, force_new_frame: bool) -> Self {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if frames.is_empty() || force_new_frame {
                frames.push(Frame {
                    source,
                    pending: Vec::new(),
                });
                Self {
                    owns_frame: true,
                    _not_send: PhantomData,
                }
            } else {
                Self {
                    owns_frame: false,
                    _not_send: PhantomData,
                }
            }
        })
    }

    fn take_pending() -> (Vec<Dispatch>, bool) {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            match frames.last_mut() {
                Some(frame) => (
                    std::mem::take(&mut frame.pending),
                    frame.source == Source::Api,
                ),
                None => (Vec::new(), true),
            }
        })
    }
}

/// Pops the owning frame even if a handler unwinds through dispatch.
struct PopFrame;

impl Drop for PopFrame {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.owns_frame {
            return;
        }
        let _pop = PopFrame;
        if !std::thread::panicking() {
            loop {
                let (batch, within_api_call) = Self::take_pending();
                if batch.is_empty() {
                    break;
                }
                for dispatch in batch {
                    let nested = Self::open(Source::Api, true);
                    dispatch.run(within_api_call);
                    drop(nested);
                }
            }
        }
    }
}

/// Queues `dispatch` on the innermost open scope.
///
/// Callers may hold endpoint and trap locks, so nothing runs here.
pub(crate) fn defer(dispatch: Dispatch) {
    let queued = FRAMES.with(|frames| match frames.borrow_mut().last_mut() {
        Some(frame) => {
            frame.pending.push(dispatch);
            true
        }
        None => false,
    });
    if !queued {
        debug_assert!(false, "trap notification raised outside of a request scope");
        tracing::warn!("dropping trap notification raised outside of a request scope");
    }
}
