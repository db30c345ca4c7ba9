use facet::Facet;

/// What a shared buffer handle may do with the memory behind it.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum AccessMode {
    /// The only writable handle so far; may still be narrowed to read-only.
    Writable,
    ReadOnly,
    /// One of several writable handles to the same memory.
    Unsafe,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedBufferInfo {
    pub size: u64,
    pub access: AccessMode,
}
