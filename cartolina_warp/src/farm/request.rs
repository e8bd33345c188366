//! Request/response model of the warper farm.

use crate::backend::{HeightcodeConfig, WarpParams};
use crate::dem::{DemAlgorithm, DemOptions};
use crate::types::RasterBuf;
use anyhow::Result;
use cartolina_core::Blob;
use std::path::PathBuf;

/// What to run against the opened dataset.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
	/// Warp to the requested extent/size, expanding colour tables and band
	/// counts to RGB(A). DEM-typed datasets yield a Float32 heightfield.
	Image,
	/// Like [`Operation::Image`] but keeps the native band layout.
	ImageNoExpand,
	/// Warp the coverage mask only.
	Mask,
	/// `gdaldem`-equivalent processing.
	DemProcessing { alg: DemAlgorithm, options: DemOptions },
	/// Heightcode the vector dataset (the request's `dataset`) against a DEM
	/// stack; returns GeoJSON.
	Heightcode {
		dems: Vec<PathBuf>,
		config: HeightcodeConfig,
	},
}

/// One unit of work for a farm worker. Requests are unordered; responses are
/// correlated by the id the farm assigns at dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct WarpRequest {
	pub dataset: PathBuf,
	pub open_options: Vec<String>,
	pub params: WarpParams,
	pub operation: Operation,
}

#[derive(Clone, Debug)]
pub enum WarpResponse {
	Raster(RasterBuf),
	Vector(Blob),
}

impl WarpResponse {
	pub fn into_raster(self) -> Result<RasterBuf> {
		match self {
			WarpResponse::Raster(buf) => Ok(buf),
			WarpResponse::Vector(_) => anyhow::bail!("expected a raster response, got a vector one"),
		}
	}

	pub fn into_vector(self) -> Result<Blob> {
		match self {
			WarpResponse::Vector(blob) => Ok(blob),
			WarpResponse::Raster(_) => anyhow::bail!("expected a vector response, got a raster one"),
		}
	}
}
