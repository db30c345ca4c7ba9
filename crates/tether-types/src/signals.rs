use bitflags::bitflags;
use facet::Facet;
use std::fmt;
use tracing::warn;

bitflags! {
    /// Named boolean conditions an endpoint can raise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Signals: u32 {
        /// At least one message or byte is queued for reading.
        const READABLE = 1 << 0;
        /// The endpoint accepts writes.
        const WRITABLE = 1 << 1;
        /// The other end of the pipe has been closed.
        const PEER_CLOSED = 1 << 2;
        /// Bytes arrived that no read attempt has looked at yet (data pipe consumers only).
        const NEW_DATA_READABLE = 1 << 3;
        /// The other end of the pipe lives in another process.
        const PEER_REMOTE = 1 << 4;
        /// Some quota set on the endpoint is over its limit.
        const QUOTA_EXCEEDED = 1 << 5;
    }
}

/// One observation of an endpoint's signals.
///
/// `satisfied` is always a subset of `satisfiable`: a signal that can never
/// become true again cannot be true right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SignalState {
    satisfied: Signals,
    satisfiable: Signals,
}

impl SignalState {
    /// Builds a state, clamping `satisfied` into `satisfiable`.
    ///
    /// A satisfied signal outside the satisfiable set is a bug in the caller;
    /// debug builds assert on it, release builds log it and drop the stray bits.
    pub fn new(satisfied: Signals, satisfiable: Signals) -> Self {
        debug_assert!(
            satisfiable.contains(satisfied),
            "satisfied signals {satisfied:?} not within satisfiable {satisfiable:?}"
        );
        if !satisfiable.contains(satisfied) {
            warn!(?satisfied, ?satisfiable, "clamped satisfied signals into satisfiable");
        }
        Self {
            satisfied: satisfied & satisfiable,
            satisfiable,
        }
    }

    pub fn satisfied(&self) -> Signals {
        self.satisfied
    }

    pub fn satisfiable(&self) -> Signals {
        self.satisfiable
    }

    pub fn satisfies_any(&self, signals: Signals) -> bool {
        self.satisfied.intersects(signals)
    }

    pub fn satisfies_all(&self, signals: Signals) -> bool {
        self.satisfied.contains(signals)
    }

    pub fn can_satisfy_any(&self, signals: Signals) -> bool {
        self.satisfiable.intersects(signals)
    }

    pub fn is_empty(&self) -> bool {
        self.satisfied.is_empty() && self.satisfiable.is_empty()
    }

    pub fn to_snapshot(self) -> SignalStateSnapshot {
        SignalStateSnapshot {
            satisfied: self.satisfied.bits(),
            satisfiable: self.satisfiable.bits(),
        }
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "satisfied={:#04x} satisfiable={:#04x}",
            self.satisfied.bits(),
            self.satisfiable.bits()
        )
    }
}

/// Serializable form of [`SignalState`] used in diagnostics snapshots.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStateSnapshot {
    pub satisfied: u32,
    pub satisfiable: u32,
}
