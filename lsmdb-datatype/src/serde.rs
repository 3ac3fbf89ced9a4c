use crate::error::{Error, Result};
use std::mem;

/// Positional encoding on a byte buffer.
///
/// Every method takes the start index and returns the index right after
/// the written or read bytes, so that consecutive fields can be chained.
/// Serialization expects the caller to have reserved enough space.
/// Deserialization checks bounds because its input usually comes from disk.
pub trait Serde {
    /// Serialize a u8 value.
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize;

    /// Serialize a i32 value.
    fn ser_i32(&mut self, idx: usize, val: i32) -> usize;

    /// Serialize a u32 value.
    fn ser_u32(&mut self, idx: usize, val: u32) -> usize;

    /// Serialize a i64 value.
    fn ser_i64(&mut self, idx: usize, val: i64) -> usize;

    /// Serialize a f64 value.
    fn ser_f64(&mut self, idx: usize, val: f64) -> usize;

    /// Serialize bool value.
    #[inline]
    fn ser_bool(&mut self, idx: usize, val: bool) -> usize {
        self.ser_u8(idx, if val { 1 } else { 0 })
    }

    /// Serialize byte slice without length prefix.
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize;

    /// Deserialize a u8 value.
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)>;

    /// Deserialize a i32 value.
    fn deser_i32(&self, idx: usize) -> Result<(usize, i32)>;

    /// Deserialize a u32 value.
    fn deser_u32(&self, idx: usize) -> Result<(usize, u32)>;

    /// Deserialize a i64 value.
    fn deser_i64(&self, idx: usize) -> Result<(usize, i64)>;

    /// Deserialize a f64 value.
    fn deser_f64(&self, idx: usize) -> Result<(usize, f64)>;

    /// Deserialize bool value.
    #[inline]
    fn deser_bool(&self, idx: usize) -> Result<(usize, bool)> {
        self.deser_u8(idx).map(|(i, r)| (i, r != 0))
    }

    /// Deserialize byte slice of given length.
    fn deser_byte_slice(&self, idx: usize, len: usize) -> Result<(usize, &[u8])>;
}

macro_rules! impl_ser_num {
    ($func:ident, $ty:ty) => {
        #[inline]
        fn $func(&mut self, idx: usize, val: $ty) -> usize {
            debug_assert!(idx + mem::size_of::<$ty>() <= self.len());
            self[idx..idx + mem::size_of::<$ty>()].copy_from_slice(&val.to_le_bytes());
            idx + mem::size_of::<$ty>()
        }
    };
}

macro_rules! impl_deser_num {
    ($func:ident, $ty:ty) => {
        #[inline]
        fn $func(&self, idx: usize) -> Result<(usize, $ty)> {
            let end = idx + mem::size_of::<$ty>();
            if end > self.len() {
                return Err(Error::InvalidFormat);
            }
            let val = <$ty>::from_le_bytes(self[idx..end].try_into()?);
            Ok((end, val))
        }
    };
}

impl Serde for [u8] {
    #[inline]
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize {
        debug_assert!(idx < self.len());
        self[idx] = val;
        idx + 1
    }

    impl_ser_num!(ser_i32, i32);
    impl_ser_num!(ser_u32, u32);
    impl_ser_num!(ser_i64, i64);
    impl_ser_num!(ser_f64, f64);

    #[inline]
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize {
        debug_assert!(idx + val.len() <= self.len());
        self[idx..idx + val.len()].copy_from_slice(val);
        idx + val.len()
    }

    #[inline]
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)> {
        match self.get(idx) {
            Some(b) => Ok((idx + 1, *b)),
            None => Err(Error::InvalidFormat),
        }
    }

    impl_deser_num!(deser_i32, i32);
    impl_deser_num!(deser_u32, u32);
    impl_deser_num!(deser_i64, i64);
    impl_deser_num!(deser_f64, f64);

    #[inline]
    fn deser_byte_slice(&self, idx: usize, len: usize) -> Result<(usize, &[u8])> {
        let end = idx.checked_add(len).ok_or(Error::InvalidFormat)?;
        if end > self.len() {
            return Err(Error::InvalidFormat);
        }
        Ok((end, &self[idx..end]))
    }
}
