use std::sync::Arc;

use tether_types::{Error, HandleKind, ObjectId, QuotaInfo, QuotaOptions, QuotaType, SignalState};
use tracing::trace;

use crate::data_pipe::{DataPipeConsumer, DataPipeProducer};
use crate::endpoint::{Endpoint, EndpointCore, sealed};
use crate::message::Message;
use crate::message_pipe::MessagePipeEndpoint;
use crate::shared_buffer::SharedBuffer;

/// Any endpoint, as carried inside a [`Message`].
#[derive(Debug, Clone)]
pub enum Handle {
    MessagePipe(MessagePipeEndpoint),
    DataPipeProducer(DataPipeProducer),
    DataPipeConsumer(DataPipeConsumer),
    SharedBuffer(SharedBuffer),
}

macro_rules! each_handle {
    ($handle:expr, $inner:ident => $body:expr) => {
        match $handle {
            Handle::MessagePipe($inner) => $body,
            Handle::DataPipeProducer($inner) => $body,
            Handle::DataPipeConsumer($inner) => $body,
            Handle::SharedBuffer($inner) => $body,
        }
    };
}

impl Handle {
    pub fn into_message_pipe(self) -> Result<MessagePipeEndpoint, Error> {
        match self {
            Self::MessagePipe(endpoint) => Ok(endpoint),
            _ => Err(Error::invalid_argument("handle is not a message pipe endpoint")),
        }
    }

    pub fn into_data_pipe_producer(self) -> Result<DataPipeProducer, Error> {
        match self {
            Self::DataPipeProducer(producer) => Ok(producer),
            _ => Err(Error::invalid_argument("handle is not a data pipe producer")),
        }
    }

    pub fn into_data_pipe_consumer(self) -> Result<DataPipeConsumer, Error> {
        match self {
            Self::DataPipeConsumer(consumer) => Ok(consumer),
            _ => Err(Error::invalid_argument("handle is not a data pipe consumer")),
        }
    }

    pub fn into_shared_buffer(self) -> Result<SharedBuffer, Error> {
        match self {
            Self::SharedBuffer(buffer) => Ok(buffer),
            _ => Err(Error::invalid_argument("handle is not a shared buffer")),
        }
    }

    fn begin_transit(&self) -> Result<(), Error> {
        each_handle!(self, h => h.begin_transit())
    }

    fn cancel_transit(&self) {
        each_handle!(self, h => h.cancel_transit())
    }

    fn complete_transit(&self) -> Handle {
        match self {
            Self::MessagePipe(h) => Self::MessagePipe(h.complete_transit()),
            Self::DataPipeProducer(h) => Self::DataPipeProducer(h.complete_transit()),
            Self::DataPipeConsumer(h) => Self::DataPipeConsumer(h.complete_transit()),
            Self::SharedBuffer(h) => Self::SharedBuffer(h.complete_transit()),
        }
    }
}

impl sealed::Sealed for Handle {
    fn core(&self) -> Result<Arc<dyn EndpointCore>, Error> {
        each_handle!(self, h => sealed::Sealed::core(h))
    }
}

impl Endpoint for Handle {
    fn id(&self) -> ObjectId {
        each_handle!(self, h => h.id())
    }

    fn kind(&self) -> HandleKind {
        each_handle!(self, h => h.kind())
    }

    fn signal_state(&self) -> Result<SignalState, Error> {
        each_handle!(self, h => h.signal_state())
    }

    fn close(&self) -> Result<(), Error> {
        each_handle!(self, h => h.close())
    }

    fn set_quota(&self, ty: QuotaType, limit: u64, options: &QuotaOptions) -> Result<(), Error> {
        each_handle!(self, h => h.set_quota(ty, limit, options))
    }

    fn query_quota(&self, ty: QuotaType) -> Result<QuotaInfo, Error> {
        each_handle!(self, h => h.query_quota(ty))
    }
}

impl From<MessagePipeEndpoint> for Handle {
    fn from(endpoint: MessagePipeEndpoint) -> Self {
        Self::MessagePipe(endpoint)
    }
}

impl From<DataPipeProducer> for Handle {
    fn from(producer: DataPipeProducer) -> Self {
        Self::DataPipeProducer(producer)
    }
}

impl From<DataPipeConsumer> for Handle {
    fn from(consumer: DataPipeConsumer) -> Self {
        Self::DataPipeConsumer(consumer)
    }
}

impl From<SharedBuffer> for Handle {
    fn from(buffer: SharedBuffer) -> Self {
        Self::SharedBuffer(buffer)
    }
}

/// Moves every handle attached to `message` into fresh objects.
///
/// Either all handles move or none do: if one cannot be put in transit, the
/// ones already claimed are released and the message is rejected with every
/// handle still usable by the sender.
pub(crate) fn attach(mut message: Message, writer: ObjectId) -> Result<Message, Error> {
    if message.handles.is_empty() {
        return Ok(message);
    }
    if message.handles.iter().any(|h| h.id() == writer) {
        return Err(Error::invalid_argument("an endpoint cannot be sent through itself"));
    }
    for (index, handle) in message.handles.iter().enumerate() {
        if let Err(err) = handle.begin_transit() {
            for claimed in &message.handles[..index] {
                claimed.cancel_transit();
            }
            return Err(err);
        }
    }
    message.handles = message
        .handles
        .iter()
        .map(Handle::complete_transit)
        .collect();
    trace!(handles = message.handles.len(), "handles attached to message");
    Ok(message)
}
