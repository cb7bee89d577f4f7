//! Mosaic shared - error types and constants.
//!
//! This crate holds what both the mosaic core and out-of-tree drivers
//! need to agree on: the error taxonomy, block units, and the capability
//! bit values exposed at the API boundary.

pub mod constants;
pub mod errors;

pub use errors::{MosaicError, MosaicResult};
