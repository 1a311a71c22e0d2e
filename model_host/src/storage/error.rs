use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// The specific result type for the storage module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Failures of the append store and its underlying flash medium.
#[derive(Debug)]
pub enum StorageError {
    /// There is no region header in the store.
    NotFormatted,
    /// A write started at an offset that is not a multiple of 8.
    Unaligned { offset: usize },
    /// A write would run past the end of its region.
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// A write targeted bytes that were programmed since the last erase.
    NotErased { offset: usize },
    /// An allocation asked for more than the store can hold.
    StorageFull { requested: usize, available: usize },
    /// The medium reported an error while programming or erasing.
    WriteFailure(io::Error),
    /// The medium reported an error while reading back.
    ReadFailure(io::Error),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFormatted => f.write_str("binstore: not formatted"),
            Self::Unaligned { offset } => {
                write!(f, "binstore: write offset {offset} not 8-aligned")
            }
            Self::OutOfRange { offset, len, size } => write!(
                f,
                "binstore: write of {len} bytes at {offset} out of range for region of {size} bytes"
            ),
            Self::NotErased { offset } => write!(f, "binstore: not erased at {offset}"),
            Self::StorageFull {
                requested,
                available,
            } => write!(
                f,
                "binstore: requested {requested} bytes, only {available} available"
            ),
            Self::WriteFailure(e) => write!(f, "binstore: write failure: {e}"),
            Self::ReadFailure(e) => write!(f, "binstore: read failure: {e}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::WriteFailure(e) | Self::ReadFailure(e) => Some(e),
            _ => None,
        }
    }
}
