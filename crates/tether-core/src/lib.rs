//! In-process IPC objects with a uniform signal model.
//!
//! A [`Runtime`] hands out message pipes, data pipes and shared buffers. Every
//! endpoint exposes a [`SignalState`](tether_types::SignalState), and a
//! [`Trap`] turns changes of that state into edge-triggered callbacks:
//!
//! - each trigger reports a readiness change at most once per arming,
//! - a trap's handler never runs on two threads at once and is never
//!   re-entered,
//! - every trigger ends with exactly one `Cancelled` event.
//!
//! Notifications raised while a public call holds internal locks are queued
//! and delivered when that call returns.

mod context;
mod data_pipe;
mod endpoint;
mod handle;
mod message;
mod message_pipe;
mod options;
mod quota;
mod runtime;
mod shared_buffer;
mod transport;
mod trap;
mod watchers;

pub use data_pipe::{DataPipeConsumer, DataPipeProducer, ReadRegion, WriteRegion};
pub use endpoint::Endpoint;
pub use handle::Handle;
pub use message::Message;
pub use message_pipe::MessagePipeEndpoint;
pub use options::RuntimeOptions;
pub use runtime::Runtime;
pub use shared_buffer::{Allocator, HeapAllocator, Mapping, SharedBuffer};
pub use transport::Transport;
pub use trap::Trap;
