use facet::Facet;
use std::fmt;

use crate::{Error, SignalState};

/// When a trigger counts as ready.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Ready when any watched signal is satisfied.
    Satisfied,
    /// Ready when not all watched signals are satisfied.
    Unsatisfied,
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TrapEventResult {
    /// The trigger condition holds.
    Ok,
    /// The watched signals can never be satisfied again.
    FailedPrecondition,
    /// The trigger is gone. Always the last event for a context.
    Cancelled,
}

/// What a trap handler receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapEvent {
    pub context: u64,
    pub result: TrapEventResult,
    pub signals_state: SignalState,
    /// False when the event was raised by a transport delivery rather than
    /// by a caller's own API call.
    pub within_api_call: bool,
}

/// Why arming a trap failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmError {
    /// The trap has no triggers.
    NoTriggers,
    /// The trap was closed.
    Closed,
    /// Some triggers are ready right now. `events` holds at most the number
    /// of events the caller asked for; `total` counts all of them.
    Blocked { events: Vec<TrapEvent>, total: usize },
}

impl ArmError {
    pub fn ready_events(&self) -> &[TrapEvent] {
        match self {
            Self::Blocked { events, .. } => events,
            _ => &[],
        }
    }
}

impl fmt::Display for ArmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTriggers => write!(f, "trap has no triggers"),
            Self::Closed => write!(f, "trap is closed"),
            Self::Blocked { total, .. } => write!(f, "{total} trigger(s) already ready"),
        }
    }
}

impl std::error::Error for ArmError {}

impl From<ArmError> for Error {
    fn from(value: ArmError) -> Self {
        match value {
            ArmError::NoTriggers => Error::not_found("trap has no triggers"),
            ArmError::Closed => Error::invalid_argument("trap is closed"),
            ArmError::Blocked { .. } => Error::failed_precondition("triggers already ready"),
        }
    }
}
