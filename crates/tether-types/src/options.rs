use bitflags::bitflags;

use crate::Error;

/// Creation options for a data pipe.
///
/// A `capacity_num_bytes` of zero asks for the runtime's default capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPipeOptions {
    pub element_num_bytes: u32,
    pub capacity_num_bytes: u32,
}

impl Default for DataPipeOptions {
    fn default() -> Self {
        Self {
            element_num_bytes: 1,
            capacity_num_bytes: 0,
        }
    }
}

impl DataPipeOptions {
    pub fn new(element_num_bytes: u32, capacity_num_bytes: u32) -> Self {
        Self {
            element_num_bytes,
            capacity_num_bytes,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.element_num_bytes == 0 {
            return Err(Error::invalid_argument("element size must be non-zero"));
        }
        if self.capacity_num_bytes % self.element_num_bytes != 0 {
            return Err(Error::invalid_argument(
                "capacity must be a multiple of the element size",
            ));
        }
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteDataFlags: u32 {
        /// Write everything or nothing.
        const ALL_OR_NONE = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadDataFlags: u32 {
        /// Read exactly the requested amount or nothing.
        const ALL_OR_NONE = 1 << 0;
        /// Drop the bytes instead of copying them out.
        const DISCARD = 1 << 1;
        /// Only report how many bytes are available.
        const QUERY = 1 << 2;
        /// Copy bytes out without consuming them.
        const PEEK = 1 << 3;
    }
}

impl ReadDataFlags {
    pub fn validate(self) -> Result<(), Error> {
        if self.contains(Self::QUERY) && self.intersects(Self::PEEK | Self::DISCARD) {
            return Err(Error::invalid_argument("query cannot be combined with peek or discard"));
        }
        if self.contains(Self::PEEK | Self::DISCARD) {
            return Err(Error::invalid_argument("peek and discard are exclusive"));
        }
        Ok(())
    }
}

/// Creation options for a shared buffer. No flags are defined yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedBufferOptions {
    pub flags: u32,
}

impl SharedBufferOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.flags != 0 {
            return Err(Error::invalid_argument("unsupported shared buffer flags"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplicateBufferOptions {
    pub read_only: bool,
}
