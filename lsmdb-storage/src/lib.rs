pub mod catalog;
pub mod conf;
pub mod error;
pub mod file;
pub mod index;

pub mod prelude {
    pub use crate::catalog::*;
    pub use crate::conf::*;
    pub use crate::error::*;
    pub use crate::file::*;
    pub use crate::index::*;
    pub use lsmdb_datatype::{RecordID, Val, ValKind};
}
