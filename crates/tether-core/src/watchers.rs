use std::collections::HashMap;
use std::sync::Arc;

use tether_types::{ObjectId, SignalState, Signals, TriggerCondition};

use crate::trap::{TrapInner, TriggerKey};

/// Identifies one trigger across every trap of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId {
    pub(crate) trap: ObjectId,
    pub(crate) generation: u64,
}

/// An endpoint-side reference to a trigger.
pub struct Watcher {
    pub(crate) trap: Arc<TrapInner>,
    pub(crate) key: TriggerKey,
    pub(crate) signals: Signals,
    pub(crate) condition: TriggerCondition,
}

impl Watcher {
    pub(crate) fn id(&self) -> WatcherId {
        WatcherId {
            trap: self.trap.id(),
            generation: self.key.generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchOutcome {
    Keep,
    Drop,
}

/// Triggers watching one endpoint. Lives inside the endpoint's locked state.
#[derive(Default)]
pub(crate) struct WatcherSet {
    watchers: HashMap<WatcherId, Watcher>,
}

impl WatcherSet {
    /// Registers `watcher` and reports `state` to it right away.
    ///
    /// Fails when the trigger asks for signals the endpoint can no longer raise.
    pub(crate) fn add(
        &mut self,
        watcher: Watcher,
        state: SignalState,
    ) -> Result<(), tether_types::Error> {
        if watcher.condition == TriggerCondition::Satisfied
            && !state.can_satisfy_any(watcher.signals)
        {
            return Err(tether_types::Error::invalid_argument(
                "requested signals can never be satisfied",
            ));
        }
        let id = watcher.id();
        if watcher.trap.on_state(watcher.key, state) == WatchOutcome::Keep {
            self.watchers.insert(id, watcher);
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: WatcherId) -> bool {
        self.watchers.remove(&id).is_some()
    }

    pub(crate) fn notify(&mut self, state: SignalState) {
        self.watchers
            .retain(|_, watcher| watcher.trap.on_state(watcher.key, state) == WatchOutcome::Keep);
    }

    /// The endpoint is gone: every trigger gets cancelled.
    pub(crate) fn notify_closed(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.trap.on_endpoint_closed(watcher.key);
        }
    }
}
