//! Plain data shared by the tether runtime and its collaborators.
//!
//! Nothing in here locks or allocates behind the caller's back: these are the
//! signal masks, result kinds, option structs and snapshot records that flow
//! across the public API of `tether-core` and over the wire in `tether-wire`.

use facet::Facet;
use std::fmt;

mod buffer;
mod error;
mod options;
mod quota;
mod signals;
mod snapshot;
mod trap;

pub use buffer::{AccessMode, SharedBufferInfo};
pub use error::{Error, ErrorKind};
pub use options::{
    DataPipeOptions, DuplicateBufferOptions, ReadDataFlags, SharedBufferOptions, WriteDataFlags,
};
pub use quota::{QuotaInfo, QuotaOptions, QuotaType, UNLIMITED};
pub use signals::{SignalState, SignalStateSnapshot, Signals};
pub use snapshot::{EndpointSnapshot, RuntimeSnapshot, TrapSnapshot, TriggerSnapshot};
pub use trap::{ArmError, TrapEvent, TrapEventResult, TriggerCondition};

/// Identifier of a runtime object (endpoint or trap), unique within one runtime.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn new(value: u64) -> Result<Self, Error> {
        if value == 0 {
            return Err(Error::invalid_argument("object id must be non-zero"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum HandleKind {
    MessagePipe,
    DataPipeProducer,
    DataPipeConsumer,
    SharedBuffer,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessagePipe => "message_pipe",
            Self::DataPipeProducer => "data_pipe_producer",
            Self::DataPipeConsumer => "data_pipe_consumer",
            Self::SharedBuffer => "shared_buffer",
        }
    }

    /// Every signal an endpoint of this kind can ever raise.
    pub fn supported_signals(self) -> Signals {
        match self {
            Self::MessagePipe => {
                Signals::READABLE
                    | Signals::WRITABLE
                    | Signals::PEER_CLOSED
                    | Signals::PEER_REMOTE
                    | Signals::QUOTA_EXCEEDED
            }
            Self::DataPipeProducer => {
                Signals::WRITABLE | Signals::PEER_CLOSED | Signals::PEER_REMOTE
            }
            Self::DataPipeConsumer => {
                Signals::READABLE
                    | Signals::NEW_DATA_READABLE
                    | Signals::PEER_CLOSED
                    | Signals::PEER_REMOTE
            }
            Self::SharedBuffer => Signals::empty(),
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names one end of a message pipe whose peer lives behind a transport.
///
/// `node` is the runtime that exported the endpoint, `link` is unique within
/// that runtime.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerToken {
    pub node: u64,
    pub link: u64,
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.node, self.link)
    }
}

/// A message pipe endpoint in transit between processes.
///
/// Carries what the endpoint had already observed so the receiving side starts
/// from the same place: queued payloads in arrival order and whether the peer
/// was already gone.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct EndpointToken {
    pub peer: PeerToken,
    pub peer_closed: bool,
    pub queued: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_are_non_zero() {
        assert!(ObjectId::new(0).is_err());
        assert_eq!(ObjectId::new(5).unwrap().get(), 5);
        assert_eq!(ObjectId::new(5).unwrap().to_string(), "#5");
    }

    #[test]
    fn shared_buffers_raise_nothing() {
        assert!(HandleKind::SharedBuffer.supported_signals().is_empty());
        assert!(
            !HandleKind::DataPipeProducer
                .supported_signals()
                .contains(Signals::READABLE)
        );
        assert!(
            HandleKind::DataPipeConsumer
                .supported_signals()
                .contains(Signals::NEW_DATA_READABLE)
        );
    }
}
