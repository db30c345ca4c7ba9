use std::error::Error as StdError;
use std::fmt;

/// Result kinds returned by every fallible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed call, wrong handle type, closed or moved handle.
    InvalidArgument,
    /// The operation cannot succeed in the current state.
    FailedPrecondition,
    /// An all-or-none transfer cannot be satisfied right now.
    OutOfRange,
    /// A size or count is beyond a configured maximum.
    ResourceExhausted,
    AlreadyExists,
    NotFound,
    /// Nothing to do yet; retry once the relevant signal is raised.
    ShouldWait,
    /// A two-phase session or handle transfer is in progress.
    Busy,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::FailedPrecondition => "failed precondition",
            Self::OutOfRange => "out of range",
            Self::ResourceExhausted => "resource exhausted",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::ShouldWait => "should wait",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    detail: &'static str,
}

impl Error {
    pub const fn new(kind: ErrorKind, detail: &'static str) -> Self {
        Self { kind, detail }
    }

    pub const fn invalid_argument(detail: &'static str) -> Self {
        Self::new(ErrorKind::InvalidArgument, detail)
    }

    pub const fn failed_precondition(detail: &'static str) -> Self {
        Self::new(ErrorKind::FailedPrecondition, detail)
    }

    pub const fn out_of_range(detail: &'static str) -> Self {
        Self::new(ErrorKind::OutOfRange, detail)
    }

    pub const fn resource_exhausted(detail: &'static str) -> Self {
        Self::new(ErrorKind::ResourceExhausted, detail)
    }

    pub const fn already_exists(detail: &'static str) -> Self {
        Self::new(ErrorKind::AlreadyExists, detail)
    }

    pub const fn not_found(detail: &'static str) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub const fn should_wait(detail: &'static str) -> Self {
        Self::new(ErrorKind::ShouldWait, detail)
    }

    pub const fn busy(detail: &'static str) -> Self {
        Self::new(ErrorKind::Busy, detail)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &'static str {
        self.detail
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl StdError for Error {}

impl From<Error> for ErrorKind {
    fn from(value: Error) -> Self {
        value.kind
    }
}
