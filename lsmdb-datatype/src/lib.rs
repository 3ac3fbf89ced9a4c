//! Typed values and binary codec used by the LSM index.
//!
//! Values are encoded positionally into page buffers via the [`serde::Serde`]
//! trait. The codec also provides comparison of serialized keys and the
//! key-prefix hash that feeds per-page bloom filters.
pub mod codec;
pub mod error;
pub mod serde;
pub mod value;

pub use codec::*;
pub use value::*;
