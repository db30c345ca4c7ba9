//! Data pipes: a byte stream from one producer to one consumer over a ring.
//!
//! The producer tracks its write offset and how much free space it may fill;
//! the consumer tracks its read offset and how many bytes it may read. Each
//! side works under its own lock and credits the other once the bytes have
//! been copied, so the two never touch the same part of the ring.

use std::sync::Arc;

use tether_types::{DataPipeOptions, Error};
use tracing::debug;

use crate::runtime::Runtime;

mod consumer;
mod producer;
mod ring;

pub use consumer::{DataPipeConsumer, ReadRegion};
pub use producer::{DataPipeProducer, WriteRegion};

/// Geometry shared by both ends of one pipe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub(crate) element_num_bytes: usize,
    pub(crate) capacity: usize,
}

impl Geometry {
    fn resolve(options: &DataPipeOptions, runtime: &Runtime) -> Result<Self, Error> {
        options.validate()?;
        let element = options.element_num_bytes as usize;
        let limits = runtime.options();
        let capacity = match options.capacity_num_bytes as usize {
            0 => (limits.default_data_pipe_capacity_bytes / element).max(1) * element,
            requested => requested,
        };
        if capacity > limits.max_data_pipe_capacity_bytes {
            return Err(Error::resource_exhausted("data pipe capacity too large"));
        }
        Ok(Self {
            element_num_bytes: element,
            capacity,
        })
    }

    pub(crate) fn is_aligned(&self, num_bytes: usize) -> bool {
        num_bytes % self.element_num_bytes == 0
    }
}

pub(crate) fn create(
    runtime: &Arc<Runtime>,
    options: &DataPipeOptions,
) -> Result<(DataPipeProducer, DataPipeConsumer), Error> {
    let geometry = Geometry::resolve(options, runtime)?;
    let ring = Arc::new(ring::Ring::new(geometry.capacity));
    let pipe = runtime.next_object_id();
    let (producer, consumer) = producer::new_pair(runtime, pipe, geometry, ring);
    debug!(
        %pipe,
        element_num_bytes = geometry.element_num_bytes,
        capacity = geometry.capacity,
        "data pipe created"
    );
    Ok((producer, consumer))
}
