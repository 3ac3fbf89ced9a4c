use crate::file::{FileID, PageID};
use lsmdb_datatype::error::Error as DataTypeError;
use std::array::TryFromSliceError;
use std::io::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid state")]
    InvalidState,
    #[error("Invalid format")]
    InvalidFormat,
    #[error("IO Error({0:?})")]
    IOError(ErrorKind),
    #[error("glob error")]
    GlobError,
    #[error("{0}")]
    DataType(#[from] DataTypeError),
    // page store errors
    #[error("file {0} not found")]
    FileNotFound(FileID),
    #[error("page {0} not found")]
    PageNotFound(PageID),
    #[error("page size mismatch on file {0}")]
    PageSizeMismatch(FileID),
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("transaction already active")]
    TransactionAlreadyActive,
    #[error("concurrent modification on page {0}")]
    ConcurrentModification(PageID),
    // configuration errors
    #[error("invalid page size {0}")]
    InvalidPageSize(usize),
    #[error("bloom key depth {depth} exceeds key arity {arity}")]
    InvalidBloomKeyDepth { depth: usize, arity: usize },
    #[error("entry of {len} bytes does not fit into an empty page of {page_size} bytes")]
    EntryTooLarge { len: usize, page_size: usize },
    // contract violations
    #[error("null key is not allowed")]
    NullKey,
    #[error("null value is not allowed")]
    NullValue,
    #[error("empty key is not allowed")]
    EmptyKey,
    #[error("key arity mismatch: expected {expected}, got {actual}")]
    KeyArityMismatch { expected: usize, actual: usize },
    #[error("partial key has {actual} columns but index has only {max}")]
    KeyTooLong { max: usize, actual: usize },
    #[error("duplicate key in unique index {0}")]
    DuplicateKey(String),
    // state conflicts
    #[error("index {0} is already compacting")]
    AlreadyCompacting(String),
    #[error("index {0} is being replaced by compaction, retry the write")]
    IndexFrozen(String),
    // catalog errors
    #[error("index {0} not found")]
    IndexNotFound(String),
    #[error("index {0} already exists")]
    IndexAlreadyExists(String),
    // page store failure with index context
    #[error("{op} on index {index} failed: {source}")]
    IndexOperation {
        index: String,
        op: &'static str,
        source: Box<Error>,
    },
}

impl Error {
    /// Returns true if the error originates from the page store
    /// or from malformed page content, rather than from caller input.
    #[inline]
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Error::IOError(_)
                | Error::InvalidFormat
                | Error::GlobError
                | Error::FileNotFound(_)
                | Error::PageNotFound(_)
                | Error::PageSizeMismatch(_)
                | Error::NoActiveTransaction
                | Error::TransactionAlreadyActive
                | Error::ConcurrentModification(_)
                | Error::IndexOperation { .. }
        ) || matches!(self, Error::DataType(DataTypeError::InvalidFormat))
    }

    /// Returns the innermost error, skipping index context.
    #[inline]
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::IndexOperation { source, .. } => source.root_cause(),
            _ => self,
        }
    }
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(src: std::io::Error) -> Self {
        Error::IOError(src.kind())
    }
}

impl From<std::num::ParseIntError> for Error {
    #[inline]
    fn from(_src: std::num::ParseIntError) -> Error {
        Error::InvalidFormat
    }
}

impl From<glob::GlobError> for Error {
    #[inline]
    fn from(_src: glob::GlobError) -> Self {
        Error::GlobError
    }
}

impl From<glob::PatternError> for Error {
    #[inline]
    fn from(_src: glob::PatternError) -> Self {
        Error::GlobError
    }
}
