use facet::Facet;

use crate::{HandleKind, ObjectId, SignalStateSnapshot};

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub id: ObjectId,
    pub kind: HandleKind,
    pub signals_state: SignalStateSnapshot,
    /// Queued messages (message pipes) or buffered bytes (data pipes).
    pub queued: u64,
    pub peer_remote: bool,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TrapSnapshot {
    pub id: ObjectId,
    pub armed: bool,
    pub closed: bool,
    pub triggers: Vec<TriggerSnapshot>,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub context: u64,
    pub endpoint: ObjectId,
    pub signals: u32,
    pub ready: bool,
}

/// Point-in-time view of every live object in one runtime.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub node_name: String,
    pub endpoints: Vec<EndpointSnapshot>,
    pub traps: Vec<TrapSnapshot>,
    pub remote_bindings: u64,
}
