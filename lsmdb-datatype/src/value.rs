use crate::error::{Error, Result};
use crate::serde::Serde;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::str::FromStr;

/// Type tag of a key column or an index value.
/// The numeric representation is persisted in the first page of
/// every index file, so existing tags must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValKind {
    Bool = 1,
    I32 = 2,
    I64 = 3,
    F64 = 4,
    Str = 5,
    Bytes = 6,
    Rid = 7,
}

impl ValKind {
    /// Returns encoded length of fixed-size types.
    #[inline]
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            ValKind::Bool => Some(1),
            ValKind::I32 => Some(4),
            ValKind::I64 | ValKind::F64 => Some(8),
            ValKind::Rid => Some(RecordID::ENCODED_LEN),
            ValKind::Str | ValKind::Bytes => None,
        }
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        matches!(self, ValKind::I32 | ValKind::I64 | ValKind::F64)
    }
}

impl TryFrom<u8> for ValKind {
    type Error = Error;

    #[inline]
    fn try_from(value: u8) -> Result<Self> {
        let kind = match value {
            1 => ValKind::Bool,
            2 => ValKind::I32,
            3 => ValKind::I64,
            4 => ValKind::F64,
            5 => ValKind::Str,
            6 => ValKind::Bytes,
            7 => ValKind::Rid,
            _ => return Err(Error::UnknownValKind(value)),
        };
        Ok(kind)
    }
}

/// Identifier of a record: bucket number and position inside the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordID {
    pub bucket: i32,
    pub position: i64,
}

impl RecordID {
    pub const ENCODED_LEN: usize = mem::size_of::<i32>() + mem::size_of::<i64>();

    #[inline]
    pub const fn new(bucket: i32, position: i64) -> Self {
        RecordID { bucket, position }
    }
}

impl fmt::Display for RecordID {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.bucket, self.position)
    }
}

impl FromStr for RecordID {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        let body = s.strip_prefix('#').ok_or(Error::InvalidFormat)?;
        let (bucket, position) = body.split_once(':').ok_or(Error::InvalidFormat)?;
        let bucket = bucket.parse::<i32>().map_err(|_| Error::InvalidFormat)?;
        let position = position.parse::<i64>().map_err(|_| Error::InvalidFormat)?;
        Ok(RecordID { bucket, position })
    }
}

/// Typed value used as key column or index value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Val {
    #[default]
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Rid(RecordID),
}

impl Val {
    /// Returns type tag of this value, None for null.
    #[inline]
    pub fn kind(&self) -> Option<ValKind> {
        let kind = match self {
            Val::Null => return None,
            Val::Bool(_) => ValKind::Bool,
            Val::I32(_) => ValKind::I32,
            Val::I64(_) => ValKind::I64,
            Val::F64(_) => ValKind::F64,
            Val::Str(_) => ValKind::Str,
            Val::Bytes(_) => ValKind::Bytes,
            Val::Rid(_) => ValKind::Rid,
        };
        Some(kind)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    #[inline]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Val::I32(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::I64(v) => Some(*v),
            Val::I32(v) => Some(*v as i64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_rid(&self) -> Option<RecordID> {
        match self {
            Val::Rid(rid) => Some(*rid),
            _ => None,
        }
    }

    /// Compare two values.
    /// Numeric values compare across integer and float types,
    /// other types only compare with the same type.
    #[inline]
    pub fn compare(&self, other: &Val) -> Result<Ordering> {
        let res = match (self, other) {
            (Val::Bool(a), Val::Bool(b)) => a.cmp(b),
            (Val::I32(a), Val::I32(b)) => a.cmp(b),
            (Val::I64(a), Val::I64(b)) => a.cmp(b),
            (Val::I32(a), Val::I64(b)) => (*a as i64).cmp(b),
            (Val::I64(a), Val::I32(b)) => a.cmp(&(*b as i64)),
            (Val::F64(a), Val::F64(b)) => a.total_cmp(b),
            (Val::F64(a), Val::I32(b)) => a.total_cmp(&(*b as f64)),
            (Val::F64(a), Val::I64(b)) => a.total_cmp(&(*b as f64)),
            (Val::I32(a), Val::F64(b)) => (*a as f64).total_cmp(b),
            (Val::I64(a), Val::F64(b)) => (*a as f64).total_cmp(b),
            (Val::Str(a), Val::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Val::Bytes(a), Val::Bytes(b)) => a.cmp(b),
            (Val::Rid(a), Val::Rid(b)) => a.cmp(b),
            _ => {
                return match (self.kind(), other.kind()) {
                    (Some(l), Some(r)) => Err(Error::NotComparable(l, r)),
                    _ => Err(Error::NullValue),
                };
            }
        };
        Ok(res)
    }

    /// Convert this value to given type.
    /// Numeric conversion is allowed only if it is lossless.
    #[inline]
    pub fn coerce(&self, kind: ValKind) -> Result<Val> {
        let actual = self.kind().ok_or(Error::NullValue)?;
        if actual == kind {
            return Ok(self.clone());
        }
        let mismatch = Error::TypeMismatch {
            expected: kind,
            actual,
        };
        let res = match (self, kind) {
            (Val::I32(v), ValKind::I64) => Val::I64(*v as i64),
            (Val::I32(v), ValKind::F64) => Val::F64(*v as f64),
            (Val::I64(v), ValKind::I32) => Val::I32(i32::try_from(*v).map_err(|_| mismatch)?),
            (Val::I64(v), ValKind::F64) => {
                let f = *v as f64;
                if f as i64 != *v {
                    return Err(mismatch);
                }
                Val::F64(f)
            }
            (Val::F64(v), ValKind::I32) => {
                if v.fract() != 0.0 || *v < i32::MIN as f64 || *v > i32::MAX as f64 {
                    return Err(mismatch);
                }
                Val::I32(*v as i32)
            }
            (Val::F64(v), ValKind::I64) => {
                // i64::MAX as f64 rounds up to 2^63, which is out of range.
                if v.fract() != 0.0 || *v < i64::MIN as f64 || *v >= i64::MAX as f64 {
                    return Err(mismatch);
                }
                Val::I64(*v as i64)
            }
            _ => return Err(mismatch),
        };
        Ok(res)
    }

    /// Returns length of serialized bytes.
    #[inline]
    pub fn ser_len(&self) -> usize {
        match self {
            Val::Null => 0,
            Val::Bool(_) => 1,
            Val::I32(_) => mem::size_of::<i32>(),
            Val::I64(_) => mem::size_of::<i64>(),
            Val::F64(_) => mem::size_of::<f64>(),
            Val::Str(s) => mem::size_of::<u32>() + s.len(),
            Val::Bytes(b) => mem::size_of::<u32>() + b.len(),
            Val::Rid(_) => RecordID::ENCODED_LEN,
        }
    }

    /// Serialize value into fix-sized byte slice.
    /// The buffer is guaranteed to be big enough.
    /// Null values have no representation and write nothing.
    #[inline]
    pub fn ser(&self, out: &mut [u8], start_idx: usize) -> usize {
        match self {
            Val::Null => start_idx,
            Val::Bool(v) => out.ser_bool(start_idx, *v),
            Val::I32(v) => out.ser_i32(start_idx, *v),
            Val::I64(v) => out.ser_i64(start_idx, *v),
            Val::F64(v) => out.ser_f64(start_idx, *v),
            Val::Str(s) => {
                let idx = out.ser_u32(start_idx, s.len() as u32);
                out.ser_byte_slice(idx, s.as_bytes())
            }
            Val::Bytes(b) => {
                let idx = out.ser_u32(start_idx, b.len() as u32);
                out.ser_byte_slice(idx, b)
            }
            Val::Rid(rid) => {
                let idx = out.ser_i32(start_idx, rid.bucket);
                out.ser_i64(idx, rid.position)
            }
        }
    }

    /// Serialize value into a new byte vector.
    #[inline]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.ser_len()];
        let idx = self.ser(&mut buf, 0);
        debug_assert_eq!(idx, buf.len());
        buf
    }

    /// Deserialize value of given type.
    #[inline]
    pub fn deser(kind: ValKind, input: &[u8], start_idx: usize) -> Result<(usize, Val)> {
        match kind {
            ValKind::Bool => input.deser_bool(start_idx).map(|(i, v)| (i, Val::Bool(v))),
            ValKind::I32 => input.deser_i32(start_idx).map(|(i, v)| (i, Val::I32(v))),
            ValKind::I64 => input.deser_i64(start_idx).map(|(i, v)| (i, Val::I64(v))),
            ValKind::F64 => input.deser_f64(start_idx).map(|(i, v)| (i, Val::F64(v))),
            ValKind::Str => {
                let (idx, len) = input.deser_u32(start_idx)?;
                let (idx, bs) = input.deser_byte_slice(idx, len as usize)?;
                let s = std::str::from_utf8(bs)?;
                Ok((idx, Val::Str(s.to_string())))
            }
            ValKind::Bytes => {
                let (idx, len) = input.deser_u32(start_idx)?;
                let (idx, bs) = input.deser_byte_slice(idx, len as usize)?;
                Ok((idx, Val::Bytes(bs.to_vec())))
            }
            ValKind::Rid => {
                let (idx, bucket) = input.deser_i32(start_idx)?;
                let (idx, position) = input.deser_i64(idx)?;
                Ok((idx, Val::Rid(RecordID { bucket, position })))
            }
        }
    }

    /// Skip a serialized value of given type and return the index after it.
    #[inline]
    pub fn skip(kind: ValKind, input: &[u8], start_idx: usize) -> Result<usize> {
        let end = match kind.fixed_len() {
            Some(len) => start_idx + len,
            None => {
                let (idx, len) = input.deser_u32(start_idx)?;
                idx + len as usize
            }
        };
        if end > input.len() {
            return Err(Error::InvalidFormat);
        }
        Ok(end)
    }
}

impl fmt::Display for Val {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => f.write_str("null"),
            Val::Bool(v) => write!(f, "{}", v),
            Val::I32(v) => write!(f, "{}", v),
            Val::I64(v) => write!(f, "{}", v),
            Val::F64(v) => write!(f, "{}", v),
            Val::Str(s) => write!(f, "{:?}", s),
            Val::Bytes(b) => write!(f, "{:02x?}", b),
            Val::Rid(rid) => write!(f, "{}", rid),
        }
    }
}

impl From<bool> for Val {
    #[inline]
    fn from(value: bool) -> Self {
        Val::Bool(value)
    }
}

impl From<i32> for Val {
    #[inline]
    fn from(value: i32) -> Self {
        Val::I32(value)
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(value: i64) -> Self {
        Val::I64(value)
    }
}

impl From<f64> for Val {
    #[inline]
    fn from(value: f64) -> Self {
        Val::F64(value)
    }
}

impl From<&str> for Val {
    #[inline]
    fn from(value: &str) -> Self {
        Val::Str(value.to_string())
    }
}

impl From<String> for Val {
    #[inline]
    fn from(value: String) -> Self {
        Val::Str(value)
    }
}

impl From<&[u8]> for Val {
    #[inline]
    fn from(value: &[u8]) -> Self {
        Val::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Val {
    #[inline]
    fn from(value: Vec<u8>) -> Self {
        Val::Bytes(value)
    }
}

impl From<RecordID> for Val {
    #[inline]
    fn from(value: RecordID) -> Self {
        Val::Rid(value)
    }
}
