use facet::Facet;

use crate::Error;

/// Limit reported for a quota that was never set.
pub const UNLIMITED: u64 = u64::MAX;

/// Resources a message pipe endpoint can put a limit on.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum QuotaType {
    /// Number of messages queued for reading at the endpoint.
    ReceiveQueueLength,
    /// Total payload bytes queued for reading at the endpoint.
    ReceiveQueueMemorySize,
    /// Messages the endpoint sent that its peer has not read yet.
    UnreadMessageCount,
}

impl QuotaType {
    pub const ALL: [QuotaType; 3] = [
        QuotaType::ReceiveQueueLength,
        QuotaType::ReceiveQueueMemorySize,
        QuotaType::UnreadMessageCount,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::ReceiveQueueLength => 0,
            Self::ReceiveQueueMemorySize => 1,
            Self::UnreadMessageCount => 2,
        }
    }
}

impl TryFrom<u32> for QuotaType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ReceiveQueueLength),
            1 => Ok(Self::ReceiveQueueMemorySize),
            2 => Ok(Self::UnreadMessageCount),
            _ => Err(Error::invalid_argument("unknown quota type")),
        }
    }
}

/// Reserved options for `set_quota`. No flags are defined yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaOptions {
    pub flags: u32,
}

impl QuotaOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.flags != 0 {
            return Err(Error::invalid_argument("unsupported quota option flags"));
        }
        Ok(())
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaInfo {
    pub limit: u64,
    pub usage: u64,
}
