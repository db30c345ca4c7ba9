use std::fmt;
use std::sync::Arc;

use tether_types::{Error, PeerToken};

use crate::message::Message;

/// Carries messages to message pipe peers living in other processes.
///
/// The runtime calls `send` for every write whose peer has migrated away and
/// `peer_closed` when the local end of such a pipe closes. Messages arriving
/// from the other side are fed back through
/// [`Runtime::deliver_remote`](crate::Runtime::deliver_remote).
pub trait Transport: Send + Sync {
    fn send(&self, peer: PeerToken, message: Message) -> Result<(), Error>;

    fn peer_closed(&self, peer: PeerToken);
}

/// The far side of a migrated pipe.
#[derive(Clone)]
pub(crate) struct RemotePeer {
    pub(crate) token: PeerToken,
    pub(crate) transport: Arc<dyn Transport>,
}

impl RemotePeer {
    pub(crate) fn send(&self, message: Message) -> Result<(), Error> {
        self.transport.send(self.token, message)
    }

    pub(crate) fn close(&self) {
        self.transport.peer_closed(self.token);
    }
}

impl fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeer").field("token", &self.token).finish()
    }
}
