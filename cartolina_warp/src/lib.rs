//! Raster machinery for the cartolina tile server: the [`backend`]
//! abstraction over GDAL, the [`farm`] of warper workers with its RSS budget
//! and cancellation plumbing, DEM processing kernels, and the [`vrt`]
//! overview pyramid builder used during surface-DEM preparation.
//!
//! Everything above [`backend::RasterBackend`] is plain Rust; the GDAL
//! implementation is compiled only with the non-default `gdal` feature, so
//! the rest of the workspace builds and tests without a GDAL installation.

pub mod backend;
pub mod dem;
pub mod farm;
pub mod types;
pub mod vrt;

pub use backend::{DatasetInfo, GeoDataset, RasterBackend, WarpParams};
pub use dem::{DemAlgorithm, DemOptions};
pub use farm::{Farm, FarmConfig, Operation, WarpRequest, WarpResponse};
pub use types::{Color, GeoExtent, PixelData, PixelType, RasterBuf, Resampling, Size};
