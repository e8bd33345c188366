//! The raster backend seam. Everything the server needs from GDAL is
//! expressed through [`RasterBackend`] and [`GeoDataset`]; version skew and
//! unsafe warp plumbing stay inside the `gdal` module and never leak into
//! producers.

#[cfg(feature = "gdal")]
pub mod gdal;
pub mod mock;

use crate::dem::{DemAlgorithm, DemOptions};
use crate::types::{GeoExtent, PixelType, RasterBuf, Resampling, Size};
use anyhow::Result;
use cartolina_core::{Blob, Sink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Probe metadata of an opened dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetInfo {
	pub size: Size,
	pub extent: GeoExtent,
	/// SRS definition string (proj4 or WKT) of the dataset.
	pub srs: String,
	pub bands: u8,
	pub pixel_type: PixelType,
	pub nodata: Option<f64>,
	/// True when the dataset carries a separate mask band (as opposed to a
	/// nodata-encoded mask).
	pub has_mask: bool,
}

/// One warp target: extent, destination SRS, size and resampling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WarpParams {
	pub extent: GeoExtent,
	pub dst_srs: String,
	pub size: Size,
	pub resampling: Resampling,
}

/// An opened dataset, owned by exactly one farm worker at a time.
pub trait GeoDataset: Send {
	fn info(&self) -> &DatasetInfo;

	/// Warp into an interleaved pixel buffer. With `expand` the backend
	/// expands colour tables and band counts to RGB(A); without it the
	/// native band layout is kept.
	fn warp_image(&self, params: &WarpParams, expand: bool, sink: &Sink) -> Result<RasterBuf>;

	/// Warp the coverage mask only; single channel, 255 = covered.
	fn warp_mask(&self, params: &WarpParams, sink: &Sink) -> Result<RasterBuf>;

	/// Warp the first band as a Float32 heightfield.
	fn warp_heightfield(&self, params: &WarpParams, sink: &Sink) -> Result<RasterBuf>;

	/// Run `gdaldem`-equivalent processing over the warped window.
	fn dem_processing(
		&self,
		params: &WarpParams,
		alg: DemAlgorithm,
		options: &DemOptions,
		sink: &Sink,
	) -> Result<RasterBuf>;

	/// Rough resident footprint, used for cache accounting and worker
	/// recycling decisions.
	fn estimated_bytes(&self) -> usize;
}

/// Heightcoding configuration: drape a vector dataset over a DEM stack.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeightcodeConfig {
	/// Only heightcode vertices without a Z coordinate when set.
	#[serde(default)]
	pub only_missing_z: bool,
	/// Optional geoid grid applied on top of the DEM heights.
	#[serde(default)]
	pub geoid_grid: Option<String>,
	/// Restrict to the named layers; all layers when empty.
	#[serde(default)]
	pub layers: Vec<String>,
}

/// Factory for datasets plus the handful of whole-dataset operations the
/// preparation pipeline needs.
pub trait RasterBackend: Send + Sync {
	fn name(&self) -> &'static str;

	fn open(&self, path: &Path, open_options: &[String]) -> Result<Box<dyn GeoDataset>>;

	/// Writes `buf` as a tiled GeoTIFF with the given georeferencing and the
	/// predictor picked from the pixel type.
	fn write_geotiff(
		&self,
		path: &Path,
		buf: &RasterBuf,
		extent: &GeoExtent,
		srs: &str,
		nodata: Option<f64>,
	) -> Result<()>;

	/// Heightcodes `vector` against the DEM stack, returning GeoJSON with Z
	/// coordinates on every vertex.
	fn heightcode(
		&self,
		vector: &Path,
		dems: &[PathBuf],
		config: &HeightcodeConfig,
		sink: &Sink,
	) -> Result<Blob>;
}
