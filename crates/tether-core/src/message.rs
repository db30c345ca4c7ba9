use std::fmt;

use crate::handle::Handle;

/// A payload plus the handles travelling with it.
///
/// Handles attached to a message are moved: once the message is written, the
/// sender's copies are invalid and the reader owns fresh handles to the same
/// objects.
#[derive(Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub handles: Vec<Handle>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            handles: Vec::new(),
        }
    }

    pub fn with_handles(payload: impl Into<Vec<u8>>, handles: Vec<Handle>) -> Self {
        Self {
            payload: payload.into(),
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload_len", &self.payload.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&[u8]> for Message {
    fn from(payload: &[u8]) -> Self {
        Self::new(payload)
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Self::new(payload.as_bytes())
    }
}
