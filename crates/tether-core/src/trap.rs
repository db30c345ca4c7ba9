//! Traps: edge-triggered, mutually exclusive notifications over many endpoints.
//!
//! A trap owns two locks. `state` guards the trigger table and the armed flag;
//! it is taken under endpoint locks whenever an endpoint reports a new signal
//! state. `handler` guards the user callback; it is only ever taken while
//! dispatching queued events at the end of a request scope, when no endpoint or
//! trap data lock is held. Holding `handler` for the whole callback is what
//! serializes notifications for one trap across threads.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tether_types::{
    ArmError, Error, ObjectId, SignalState, Signals, TrapEvent, TrapEventResult, TrapSnapshot,
    TriggerCondition, TriggerSnapshot,
};
use tracing::{debug, trace};

use crate::context::{Dispatch, RequestContext, defer};
use crate::endpoint::{Endpoint, EndpointCore};
use crate::runtime::Runtime;
use crate::watchers::{WatchOutcome, Watcher, WatcherId};

type Handler = Box<dyn FnMut(TrapEvent) + Send>;

/// Slot in a trap's trigger table plus the generation that was stored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TriggerKey {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

struct Trigger {
    generation: u64,
    context: u64,
    signals: Signals,
    condition: TriggerCondition,
    endpoint: Weak<dyn EndpointCore>,
    endpoint_id: ObjectId,
    last_state: SignalState,
    last_result: Option<TrapEventResult>,
    /// Set once the `Cancelled` event has been handed to the handler.
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct TrapState {
    armed: bool,
    closed: bool,
    next_generation: u64,
    triggers: Slab<Trigger>,
    by_context: HashMap<u64, usize>,
    ready: BTreeSet<usize>,
    /// Slot reported last by a blocked `arm`, so the next attempt starts after it.
    last_blocking: Option<usize>,
}

impl TrapState {
    fn get_mut(&mut self, key: TriggerKey) -> Option<&mut Trigger> {
        self.triggers
            .get_mut(key.slot)
            .filter(|trigger| trigger.generation == key.generation)
    }

    fn remove(&mut self, slot: usize) -> Trigger {
        let trigger = self.triggers.remove(slot);
        self.by_context.remove(&trigger.context);
        self.ready.remove(&slot);
        if self.last_blocking == Some(slot) {
            self.last_blocking = None;
        }
        trigger
    }
}

pub(crate) struct TrapInner {
    id: ObjectId,
    handler: Mutex<Option<Handler>>,
    state: Mutex<TrapState>,
}

impl TrapInner {
    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    /// Called by an endpoint, under its lock, whenever its signals may have changed.
    pub(crate) fn on_state(self: &Arc<Self>, key: TriggerKey, state: SignalState) -> WatchOutcome {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(trigger) = st.get_mut(key) else {
            return WatchOutcome::Drop;
        };

        let result = evaluate(trigger.condition, trigger.signals, state);
        let changed = result != trigger.last_result;
        trigger.last_state = state;
        trigger.last_result = result;
        let context = trigger.context;
        let cancelled = trigger.cancelled.clone();

        match result {
            Some(_) => st.ready.insert(key.slot),
            None => st.ready.remove(&key.slot),
        };

        if let Some(result) = result
            && changed
            && st.armed
            && !st.closed
        {
            st.armed = false;
            trace!(trap = %self.id, context, ?result, "trap fired");
            defer(Dispatch::Event {
                trap: self.clone(),
                cancelled: cancelled.clone(),
                context,
                result,
                signals_state: state,
            });
        }

        if result == Some(TrapEventResult::FailedPrecondition) {
            st.remove(key.slot);
            trace!(trap = %self.id, context, "trigger can never be satisfied, cancelling");
            defer(Dispatch::Cancel {
                trap: self.clone(),
                cancelled,
                context,
            });
            return WatchOutcome::Drop;
        }
        WatchOutcome::Keep
    }

    /// Called by an endpoint that is closing or moving away.
    pub(crate) fn on_endpoint_closed(self: &Arc<Self>, key: TriggerKey) {
        let mut st = self.state.lock();
        if st.get_mut(key).is_none() {
            return;
        }
        let trigger = st.remove(key.slot);
        drop(st);
        defer(Dispatch::Cancel {
            trap: self.clone(),
            cancelled: trigger.cancelled,
            context: trigger.context,
        });
    }

    pub(crate) fn deliver_event(
        &self,
        cancelled: &AtomicBool,
        context: u64,
        result: TrapEventResult,
        signals_state: SignalState,
        within_api_call: bool,
    ) {
        let mut handler = self.handler.lock();
        if cancelled.load(Ordering::Acquire) || self.state.lock().closed {
            return;
        }
        if let Some(handler) = handler.as_mut() {
            handler(TrapEvent {
                context,
                result,
                signals_state,
                within_api_call,
            });
        }
    }

    pub(crate) fn deliver_cancel(&self, cancelled: &AtomicBool, context: u64, within_api_call: bool) {
        let mut handler = self.handler.lock();
        if cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handler) = handler.as_mut() {
            handler(TrapEvent {
                context,
                result: TrapEventResult::Cancelled,
                signals_state: SignalState::default(),
                within_api_call,
            });
        }
    }

    /// Drops the handler once a closed trap has delivered its last event.
    pub(crate) fn release_handler(&self) {
        let handler = self.handler.lock().take();
        drop(handler);
    }

    pub(crate) fn snapshot(&self) -> TrapSnapshot {
        let st = self.state.lock();
        TrapSnapshot {
            id: self.id,
            armed: st.armed,
            closed: st.closed,
            triggers: st
                .triggers
                .iter()
                .map(|(slot, trigger)| TriggerSnapshot {
                    context: trigger.context,
                    endpoint: trigger.endpoint_id,
                    signals: trigger.signals.bits(),
                    ready: st.ready.contains(&slot),
                })
                .collect(),
        }
    }
}

fn evaluate(
    condition: TriggerCondition,
    signals: Signals,
    state: SignalState,
) -> Option<TrapEventResult> {
    match condition {
        TriggerCondition::Satisfied if state.satisfies_any(signals) => Some(TrapEventResult::Ok),
        TriggerCondition::Satisfied if !state.can_satisfy_any(signals) => {
            Some(TrapEventResult::FailedPrecondition)
        }
        TriggerCondition::Satisfied => None,
        TriggerCondition::Unsatisfied if !state.satisfies_all(signals) => {
            Some(TrapEventResult::Ok)
        }
        TriggerCondition::Unsatisfied => None,
    }
}

/// A set of triggers sharing one handler.
///
/// The handler runs with no tether lock held, so it may call back into any
/// API, including this trap's own `arm`, `remove_trigger` and `close`. It is
/// never run concurrently with itself and never re-entered: events raised from
/// inside the handler are delivered after it returns.
///
/// Cloning a `Trap` yields another handle to the same trap.
#[derive(Clone)]
pub struct Trap {
    inner: Arc<TrapInner>,
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trap").field("id", &self.inner.id).finish()
    }
}

impl Trap {
    pub(crate) fn new(runtime: &Runtime, handler: impl FnMut(TrapEvent) + Send + 'static) -> Self {
        let inner = Arc::new(TrapInner {
            id: runtime.next_object_id(),
            handler: Mutex::new(Some(Box::new(handler))),
            state: Mutex::new(TrapState::default()),
        });
        runtime.register_trap(&inner);
        debug!(trap = %inner.id, "trap created");
        Self { inner }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Starts watching `signals` on `endpoint`, reporting events under `context`.
    ///
    /// If the trap is armed and the condition already holds, the trap fires
    /// before this call returns.
    pub fn add_trigger<E: Endpoint + ?Sized>(
        &self,
        endpoint: &E,
        signals: Signals,
        condition: TriggerCondition,
        context: u64,
    ) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        let core = endpoint.core()?;
        if signals.is_empty() {
            return Err(Error::invalid_argument("no signals requested"));
        }
        if !core.kind().supported_signals().intersects(signals) {
            return Err(Error::invalid_argument(
                "endpoint cannot raise any of the requested signals",
            ));
        }

        let key = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(Error::invalid_argument("trap is closed"));
            }
            if st.by_context.contains_key(&context) {
                return Err(Error::already_exists("context already registered"));
            }
            st.next_generation += 1;
            let generation = st.next_generation;
            let slot = st.triggers.insert(Trigger {
                generation,
                context,
                signals,
                condition,
                endpoint: Arc::downgrade(&core),
                endpoint_id: core.id(),
                last_state: SignalState::default(),
                last_result: None,
                cancelled: Arc::new(AtomicBool::new(false)),
            });
            st.by_context.insert(context, slot);
            TriggerKey { slot, generation }
        };

        let watcher = Watcher {
            trap: self.inner.clone(),
            key,
            signals,
            condition,
        };
        let watcher_id = watcher.id();
        if let Err(err) = core.add_watcher(watcher) {
            let mut st = self.inner.state.lock();
            if st.get_mut(key).is_some() {
                st.remove(key.slot);
            }
            return Err(err);
        }

        // A concurrent remove or close may have won the race before the
        // watcher landed; make sure it does not linger on the endpoint.
        if self.inner.state.lock().get_mut(key).is_none() {
            core.remove_watcher(watcher_id);
        }
        trace!(trap = %self.inner.id, context, endpoint = %core.id(), "trigger added");
        Ok(())
    }

    /// Removes the trigger registered under `context`.
    ///
    /// Its `Cancelled` event is delivered before this returns, unless called
    /// from inside a handler, in which case it follows once the handler returns.
    pub fn remove_trigger(&self, context: u64) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        let trigger = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(Error::invalid_argument("trap is closed"));
            }
            let Some(&slot) = st.by_context.get(&context) else {
                return Err(Error::not_found("no trigger for context"));
            };
            st.remove(slot)
        };
        self.detach(trigger);
        trace!(trap = %self.inner.id, context, "trigger removed");
        Ok(())
    }

    fn detach(&self, trigger: Trigger) {
        if let Some(endpoint) = trigger.endpoint.upgrade() {
            endpoint.remove_watcher(WatcherId {
                trap: self.inner.id,
                generation: trigger.generation,
            });
        }
        defer(Dispatch::Cancel {
            trap: self.inner.clone(),
            cancelled: trigger.cancelled,
            context: trigger.context,
        });
    }

    /// Arms the trap, or reports the triggers that are already ready.
    ///
    /// At most `max_ready_events` events are returned; repeated attempts rotate
    /// through the ready set so every ready context eventually surfaces.
    pub fn arm(&self, max_ready_events: usize) -> Result<(), ArmError> {
        let _ctx = RequestContext::enter();
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        if st.closed {
            return Err(ArmError::Closed);
        }
        if st.triggers.is_empty() {
            return Err(ArmError::NoTriggers);
        }
        if st.ready.is_empty() {
            st.armed = true;
            return Ok(());
        }

        let ordered: Vec<usize> = match st.last_blocking {
            Some(last) => st
                .ready
                .range((Bound::Excluded(last), Bound::Unbounded))
                .chain(st.ready.range(..=last))
                .copied()
                .collect(),
            None => st.ready.iter().copied().collect(),
        };
        let events: Vec<TrapEvent> = ordered
            .iter()
            .take(max_ready_events)
            .filter_map(|slot| st.triggers.get(*slot))
            .map(|trigger| TrapEvent {
                context: trigger.context,
                result: trigger.last_result.unwrap_or(TrapEventResult::Ok),
                signals_state: trigger.last_state,
                within_api_call: true,
            })
            .collect();
        if !events.is_empty() {
            st.last_blocking = ordered.get(events.len() - 1).copied();
        }
        Err(ArmError::Blocked {
            events,
            total: st.ready.len(),
        })
    }

    /// Closes the trap: every trigger is cancelled and the handler is dropped
    /// after its last `Cancelled` event.
    pub fn close(&self) -> Result<(), Error> {
        let _ctx = RequestContext::enter();
        let triggers: Vec<Trigger> = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(Error::invalid_argument("trap is closed"));
            }
            st.closed = true;
            st.armed = false;
            st.by_context.clear();
            st.ready.clear();
            st.last_blocking = None;
            st.triggers.drain().collect()
        };
        debug!(trap = %self.inner.id, triggers = triggers.len(), "trap closed");
        for trigger in triggers {
            self.detach(trigger);
        }
        defer(Dispatch::ReleaseHandler {
            trap: self.inner.clone(),
        });
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().armed
    }

    pub fn trigger_count(&self) -> usize {
        self.inner.state.lock().triggers.len()
    }
}
