//! Shared types for the cartolina tile server: tile coordinates and ranges,
//! byte blobs, artifact formats and file classes, the credit/SRS registry
//! snapshot, the request error taxonomy and the per-request sink.

pub mod error;
pub mod io;
pub mod registry;
pub mod sink;
pub mod types;

pub use error::TileError;
pub use registry::{Credit, RegistryPatch, RegistrySnapshot, SrsDef};
pub use sink::Sink;
pub use types::*;
