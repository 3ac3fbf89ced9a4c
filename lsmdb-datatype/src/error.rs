use crate::value::ValKind;
use std::array::TryFromSliceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Invalid format")]
    InvalidFormat,
    #[error("unknown value type tag {0}")]
    UnknownValKind(u8),
    #[error("value of type {actual:?} cannot be converted to {expected:?}")]
    TypeMismatch { expected: ValKind, actual: ValKind },
    #[error("null value cannot be converted or compared")]
    NullValue,
    #[error("values of type {0:?} and {1:?} are not comparable")]
    NotComparable(ValKind, ValKind),
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::str::Utf8Error> for Error {
    #[inline]
    fn from(_src: std::str::Utf8Error) -> Error {
        Error::InvalidFormat
    }
}
