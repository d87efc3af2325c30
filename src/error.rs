use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// Invalid options or arguments
    Validation(#[error(not(source))] TinyStr),
    /// No file space (or memory) available for the requested allocation
    AllocationFailure(#[error(not(source))] TinyStr),
    /// On-disk structure failed validation (bad signature, unexpected node type or level)
    CorruptStructure(#[error(not(source))] TinyStr),
    /// A filter pipeline stage failed to encode or decode a chunk
    Filter(#[error(not(source))] TinyStr),
    /// A coordinator collective (e.g. barrier) failed
    Coordination(#[error(not(source))] TinyStr),
    Io(io::Error),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(Box::new(msg.into()))
    }

    pub(crate) fn allocation(msg: impl Into<String>) -> Self {
        Self::AllocationFailure(Box::new(msg.into()))
    }

    pub(crate) fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination(Box::new(msg.into()))
    }

    /// Whether the error was raised by a filter pipeline stage
    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Filter(_))
    }

    /// Whether the error signals on-disk structural corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptStructure(_))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            Error::CorruptStructure(_) | Error::Filter(_) => io::ErrorKind::InvalidData,
            Error::Validation(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, value))
    }
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! error_corrupt {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::CorruptStructure(msg.into())
    }}
}

macro_rules! error_filter {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Filter(msg.into())
    }}
}

macro_rules! error_allocation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::AllocationFailure(msg.into())
    }}
}

macro_rules! io_invalid_data {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        let io_error = ::std::io::Error::new(::std::io::ErrorKind::InvalidData, msg);
        crate::Error::Io(io_error)
    }}
}

pub(crate) use error_allocation;
pub(crate) use error_corrupt;
pub(crate) use error_filter;
pub(crate) use error_validation;
pub(crate) use io_invalid_data;
