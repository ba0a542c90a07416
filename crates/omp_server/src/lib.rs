//! RPC-style facade over `omp_core`.
//!
//! Every entry point opens its own store connection, runs one use case and
//! translates failures into an [`ErrorKind`].

pub mod api;
mod error;

pub use api::{HistoryFormat, MsbServer};
pub use error::{ApiResult, ErrorKind, OmpError};
