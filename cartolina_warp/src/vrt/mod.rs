//! VRT overview pyramid: the XML [`model`] and the [`builder`] that runs
//! during surface-DEM preparation.

pub mod builder;
pub mod model;

pub use builder::{LevelInfo, PathMode, VrtBuilder, VrtConfig, VrtPyramid};
pub use model::{OverviewRef, PixelRect, SimpleSource, SourceBandRef, SourceProperties, VrtDataset, VrtMaskBand, VrtRasterBand};
