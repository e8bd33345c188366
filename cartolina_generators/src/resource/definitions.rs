//! Concrete driver definition payloads and their diff functions.
//!
//! Rule of thumb shared by all drivers: changing the backing dataset is
//! incompatible (`Yes`); changing how pixels are synthesised from the same
//! dataset invalidates cached output (`RevisionBump`); presentation-only
//! knobs are `Safe`.

use super::{Changed, Definition};
use cartolina_core::ImageFormat;
use cartolina_warp::dem::{DemAlgorithm, DemOptions};
use cartolina_warp::types::Resampling;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::PathBuf;

fn downcast<'a, T: 'static>(other: &'a dyn Definition) -> Option<&'a T> {
	other.as_any().downcast_ref::<T>()
}

macro_rules! definition_boilerplate {
	() => {
		fn to_json(&self) -> serde_json::Value {
			serde_json::to_value(self).expect("definition serialisation cannot fail")
		}

		fn as_any(&self) -> &dyn Any {
			self
		}
	};
}

/// `tms-raster`: plain warped imagery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TmsRasterDef {
	pub dataset: PathBuf,
	#[serde(default)]
	pub mask: Option<PathBuf>,
	#[serde(default)]
	pub format: Option<ImageFormat>,
	#[serde(default)]
	pub resampling: Option<Resampling>,
	#[serde(default)]
	pub transparent: bool,
}

impl Definition for TmsRasterDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<TmsRasterDef>(other) else {
			return Changed::Yes;
		};
		if self.dataset != other.dataset || self.mask != other.mask {
			return Changed::Yes;
		}
		if self.format != other.format || self.resampling != other.resampling || self.transparent != other.transparent {
			return Changed::RevisionBump;
		}
		Changed::No
	}

	definition_boilerplate!();
}

/// `tms-gdaldem`: DEM processing (hillshade, slope, ...) over a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TmsGdaldemDef {
	pub dataset: PathBuf,
	pub processing: DemAlgorithm,
	#[serde(default)]
	pub options: DemOptions,
	#[serde(default)]
	pub mask: Option<PathBuf>,
	/// Erode the warped mask by one pixel to hide resampled fringes.
	#[serde(default)]
	pub erode_mask: bool,
}

impl Definition for TmsGdaldemDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<TmsGdaldemDef>(other) else {
			return Changed::Yes;
		};
		if self.dataset != other.dataset || self.mask != other.mask {
			return Changed::Yes;
		}
		if self.processing != other.processing || self.options != other.options || self.erode_mask != other.erode_mask {
			return Changed::RevisionBump;
		}
		Changed::No
	}

	definition_boilerplate!();
}

/// `tms-normal-map`: per-pixel surface normals from a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TmsNormalMapDef {
	pub dem: PathBuf,
	#[serde(default)]
	pub landcover: Option<PathBuf>,
	/// Landcover classes rendered as flat (water bodies and the like).
	#[serde(default)]
	pub flat_classes: Vec<u8>,
	#[serde(default = "default_z_factor")]
	pub z_factor: f64,
	#[serde(default)]
	pub invert_relief: bool,
}

fn default_z_factor() -> f64 {
	1.0
}

impl Definition for TmsNormalMapDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<TmsNormalMapDef>(other) else {
			return Changed::Yes;
		};
		if self.dem != other.dem || self.landcover != other.landcover {
			return Changed::Yes;
		}
		if self != other {
			return Changed::RevisionBump;
		}
		Changed::No
	}

	definition_boilerplate!();
}

/// `tms-specular-map`: specular reflectance from orthophoto + landcover.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TmsSpecularDef {
	pub dataset: PathBuf,
	#[serde(default)]
	pub landcover: Option<PathBuf>,
	/// Landcover classes treated as reflective.
	#[serde(default)]
	pub shiny_classes: Vec<u8>,
	#[serde(default = "default_shininess_bits")]
	pub shininess_bits: u8,
}

fn default_shininess_bits() -> u8 {
	4
}

impl Definition for TmsSpecularDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<TmsSpecularDef>(other) else {
			return Changed::Yes;
		};
		if self.dataset != other.dataset || self.landcover != other.landcover {
			return Changed::Yes;
		}
		if self != other {
			return Changed::RevisionBump;
		}
		Changed::No
	}

	definition_boilerplate!();
}

/// `surface-dem`: terrain tileset backed by a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SurfaceDemDef {
	pub dataset: PathBuf,
	#[serde(default)]
	pub mask: Option<PathBuf>,
	/// Enables the antimeridian wrap halo during preparation; the value adds
	/// overlap pixels on top of the kernel base.
	#[serde(default)]
	pub wrapx: Option<u32>,
	#[serde(default)]
	pub geoid_grid: Option<String>,
	#[serde(default)]
	pub nominal_texel_size: Option<f64>,
	#[serde(default)]
	pub merge_bottom_lod: Option<u8>,
	#[serde(default = "default_samples")]
	pub samples_per_side: u32,
	/// Bound-layer id stamped into submeshes as their texture layer.
	#[serde(default)]
	pub texture_layer_id: Option<u16>,
}

fn default_samples() -> u32 {
	10
}

impl Definition for SurfaceDemDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<SurfaceDemDef>(other) else {
			return Changed::Yes;
		};
		if self.dataset != other.dataset || self.mask != other.mask || self.wrapx != other.wrapx {
			return Changed::Yes;
		}
		if self != other {
			return Changed::RevisionBump;
		}
		Changed::No
	}

	fn frozen_credits(&self) -> bool {
		// credits are baked into the published tileset.conf
		true
	}

	definition_boilerplate!();
}

/// `surface-spheroid`: a constant-zero surface over the reference spheroid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SurfaceSpheroidDef {
	#[serde(default)]
	pub geoid_grid: Option<String>,
	#[serde(default = "default_samples")]
	pub samples_per_side: u32,
	/// Bound-layer id stamped into submeshes as their texture layer.
	#[serde(default)]
	pub texture_layer_id: Option<u16>,
}

impl Definition for SurfaceSpheroidDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<SurfaceSpheroidDef>(other) else {
			return Changed::Yes;
		};
		if self != other {
			return Changed::RevisionBump;
		}
		Changed::No
	}

	fn frozen_credits(&self) -> bool {
		true
	}

	definition_boilerplate!();
}

/// `geodata`: heightcoded vector data draped over a DEM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GeodataDef {
	pub dataset: PathBuf,
	pub dem: PathBuf,
	#[serde(default)]
	pub geoid_grid: Option<String>,
	#[serde(default)]
	pub layers: Vec<String>,
	#[serde(default = "default_display_size")]
	pub display_size: u32,
	#[serde(default)]
	pub style: Option<String>,
}

fn default_display_size() -> u32 {
	256
}

impl Definition for GeodataDef {
	fn diff(&self, other: &dyn Definition) -> Changed {
		let Some(other) = downcast::<GeodataDef>(other) else {
			return Changed::Yes;
		};
		if self.dataset != other.dataset || self.dem != other.dem {
			return Changed::Yes;
		}
		let mut restyled = other.clone();
		restyled.style = self.style.clone();
		if *self != restyled {
			return Changed::RevisionBump;
		}
		if self.style != other.style {
			return Changed::Safe;
		}
		Changed::No
	}

	definition_boilerplate!();
}
