//! Synthetic raster backend used by tests and the development server. Mock
//! datasets are closed-form functions over geographic position, so warps
//! stay consistent across levels of detail without any real reprojection.

use super::{DatasetInfo, GeoDataset, HeightcodeConfig, RasterBackend, WarpParams};
use crate::dem::{self, DemAlgorithm, DemOptions};
use crate::types::{GeoExtent, PixelData, PixelType, RasterBuf, Size};
use anyhow::{Result, bail, ensure};
use cartolina_core::{Blob, Sink};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// World extent used by the default mock profiles (spherical mercator).
pub const MOCK_WORLD: GeoExtent = GeoExtent {
	x_min: -20_037_508.342789244,
	y_min: -20_037_508.342789244,
	x_max: 20_037_508.342789244,
	y_max: 20_037_508.342789244,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockKind {
	/// Three-channel gradient imagery.
	Image,
	/// Single-band Float32 heightfield.
	Dem,
}

/// Shape of one synthetic dataset.
#[derive(Clone, Debug)]
pub struct MockProfile {
	pub kind: MockKind,
	pub size: Size,
	pub extent: GeoExtent,
	pub srs: String,
	pub nodata: Option<f64>,
	pub has_mask: bool,
	/// Coverage is dropped in this quadrant (0 = NW … 3 = SE) when set;
	/// exercises empty-tile elimination and masked tiles.
	pub empty_quadrant: Option<u8>,
	/// Height amplitude of the DEM profile.
	pub amplitude: f64,
}

impl MockProfile {
	pub fn image(size: Size) -> MockProfile {
		MockProfile {
			kind: MockKind::Image,
			size,
			extent: MOCK_WORLD,
			srs: String::from("EPSG:3857"),
			nodata: None,
			has_mask: false,
			empty_quadrant: None,
			amplitude: 0.0,
		}
	}

	pub fn dem(size: Size, amplitude: f64) -> MockProfile {
		MockProfile {
			kind: MockKind::Dem,
			size,
			extent: MOCK_WORLD,
			srs: String::from("EPSG:3857"),
			nodata: Some(-32768.0),
			has_mask: false,
			empty_quadrant: None,
			amplitude,
		}
	}

	pub fn with_empty_quadrant(mut self, quadrant: u8) -> MockProfile {
		self.empty_quadrant = Some(quadrant);
		self
	}

	pub fn with_mask_band(mut self) -> MockProfile {
		self.has_mask = true;
		self.nodata = None;
		self
	}
}

/// Backend serving registered profiles; unregistered paths fall back to the
/// default profile so intermediate artifacts (overview VRTs) stay openable.
pub struct MockBackend {
	profiles: RwLock<HashMap<PathBuf, MockProfile>>,
	default: MockProfile,
}

impl MockBackend {
	pub fn new() -> MockBackend {
		MockBackend {
			profiles: RwLock::new(HashMap::new()),
			default: MockProfile::image(Size::new(512, 512)),
		}
	}

	pub fn with_default(default: MockProfile) -> MockBackend {
		MockBackend {
			profiles: RwLock::new(HashMap::new()),
			default,
		}
	}

	pub fn register(&self, path: impl Into<PathBuf>, profile: MockProfile) {
		self.profiles.write().insert(path.into(), profile);
	}
}

impl Default for MockBackend {
	fn default() -> MockBackend {
		MockBackend::new()
	}
}

impl RasterBackend for MockBackend {
	fn name(&self) -> &'static str {
		"mock"
	}

	fn open(&self, path: &Path, _open_options: &[String]) -> Result<Box<dyn GeoDataset>> {
		if path.components().any(|c| c.as_os_str() == "missing") {
			bail!("mock dataset {path:?} does not exist");
		}
		let profile = self
			.profiles
			.read()
			.get(path)
			.cloned()
			.unwrap_or_else(|| self.default.clone());

		let info = DatasetInfo {
			size: profile.size,
			extent: profile.extent,
			srs: profile.srs.clone(),
			bands: match profile.kind {
				MockKind::Image => 3,
				MockKind::Dem => 1,
			},
			pixel_type: match profile.kind {
				MockKind::Image => PixelType::U8,
				MockKind::Dem => PixelType::F32,
			},
			nodata: profile.nodata,
			has_mask: profile.has_mask,
		};
		Ok(Box::new(MockDataset { profile, info }))
	}

	fn write_geotiff(
		&self,
		path: &Path,
		buf: &RasterBuf,
		_extent: &GeoExtent,
		_srs: &str,
		_nodata: Option<f64>,
	) -> Result<()> {
		// Little-endian TIFF magic followed by an opaque payload; enough for
		// existence and size assertions in tests.
		let mut bytes = Vec::with_capacity(16 + buf.data.byte_len());
		bytes.extend_from_slice(b"II*\0");
		bytes.extend_from_slice(&buf.size.width.to_le_bytes());
		bytes.extend_from_slice(&buf.size.height.to_le_bytes());
		bytes.push(buf.channels);
		bytes.push(buf.pixel_type().predictor());
		std::fs::write(path, bytes)?;
		Ok(())
	}

	fn heightcode(&self, vector: &Path, dems: &[PathBuf], config: &HeightcodeConfig, sink: &Sink) -> Result<Blob> {
		sink.check_aborted()?;
		ensure!(!dems.is_empty(), "heightcode needs at least one DEM");

		let dem = self.open(&dems[0], &[])?;
		let extent = dem.info().extent;
		let name = vector.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();

		// Three deterministic probe points across the DEM extent.
		let mut features = Vec::new();
		for (i, t) in [0.25f64, 0.5, 0.75].iter().enumerate() {
			let x = extent.x_min + extent.width() * t;
			let y = extent.y_min + extent.height() * t;
			let z = mock_height(&extent, x, y, self.default.amplitude.max(100.0));
			let z = if config.geoid_grid.is_some() { z + 1.0 } else { z };
			features.push(format!(
				r#"{{"type":"Feature","properties":{{"name":"{name}-{i}"}},"geometry":{{"type":"Point","coordinates":[{x:.3},{y:.3},{z:.3}]}}}}"#
			));
		}
		Ok(Blob::from(format!(
			r#"{{"type":"FeatureCollection","features":[{}]}}"#,
			features.join(",")
		)))
	}
}

struct MockDataset {
	profile: MockProfile,
	info: DatasetInfo,
}

fn mock_height(extent: &GeoExtent, x: f64, y: f64, amplitude: f64) -> f64 {
	let fx = (x - extent.x_min) / extent.width();
	let fy = (y - extent.y_min) / extent.height();
	amplitude * (fx * std::f64::consts::TAU).sin() * (fy * std::f64::consts::TAU).cos()
}

impl MockDataset {
	fn covered(&self, x: f64, y: f64) -> bool {
		let extent = &self.profile.extent;
		if x < extent.x_min || x > extent.x_max || y < extent.y_min || y > extent.y_max {
			return false;
		}
		if let Some(quadrant) = self.profile.empty_quadrant {
			let (cx, cy) = extent.center();
			let east = x >= cx;
			let south = y < cy;
			let q = u8::from(south) * 2 + u8::from(east);
			if q == quadrant {
				return false;
			}
		}
		true
	}

	/// Evaluates the synthetic function over the target grid. The `wrap`
	/// trick of the VRT halo is honoured implicitly: x positions outside the
	/// extent are wrapped into it, mirroring physically duplicated pixels.
	fn sample_grid<T>(&self, params: &WarpParams, sink: &Sink, mut f: impl FnMut(f64, f64, bool) -> T) -> Result<Vec<T>> {
		let mut out = Vec::with_capacity(params.size.pixels());
		let extent = &self.profile.extent;
		for row in 0..params.size.height {
			sink.check_aborted()?;
			for col in 0..params.size.width {
				let mut x = params.extent.x_min
					+ params.extent.width() * (f64::from(col) + 0.5) / f64::from(params.size.width);
				let y = params.extent.y_max
					- params.extent.height() * (f64::from(row) + 0.5) / f64::from(params.size.height);
				// wrap x into the dataset extent
				if x < extent.x_min {
					x += extent.width();
				} else if x > extent.x_max {
					x -= extent.width();
				}
				out.push(f(x, y, self.covered(x, y)));
			}
		}
		Ok(out)
	}
}

impl GeoDataset for MockDataset {
	fn info(&self) -> &DatasetInfo {
		&self.info
	}

	fn warp_image(&self, params: &WarpParams, expand: bool, sink: &Sink) -> Result<RasterBuf> {
		let extent = self.profile.extent;
		match self.profile.kind {
			MockKind::Image => {
				let mut data = Vec::with_capacity(params.size.pixels() * 3);
				self.sample_grid(params, sink, |x, y, covered| {
					let fx = ((x - extent.x_min) / extent.width()).clamp(0.0, 1.0);
					let fy = ((y - extent.y_min) / extent.height()).clamp(0.0, 1.0);
					if covered {
						data.extend_from_slice(&[(fx * 255.0) as u8, (fy * 255.0) as u8, 128]);
					} else {
						data.extend_from_slice(&[0, 0, 0]);
					}
				})?;
				let channels = 3;
				let _ = expand;
				RasterBuf::new(params.size, channels, PixelData::U8(data))
			}
			MockKind::Dem => self.warp_heightfield(params, sink),
		}
	}

	fn warp_mask(&self, params: &WarpParams, sink: &Sink) -> Result<RasterBuf> {
		let data = self.sample_grid(params, sink, |_x, _y, covered| if covered { 255u8 } else { 0 })?;
		RasterBuf::new(params.size, 1, PixelData::U8(data))
	}

	fn warp_heightfield(&self, params: &WarpParams, sink: &Sink) -> Result<RasterBuf> {
		let extent = self.profile.extent;
		let amplitude = self.profile.amplitude;
		let data = self.sample_grid(params, sink, |x, y, covered| {
			if covered {
				mock_height(&extent, x, y, amplitude) as f32
			} else {
				self.profile.nodata.unwrap_or(0.0) as f32
			}
		})?;
		RasterBuf::new(params.size, 1, PixelData::F32(data))
	}

	fn dem_processing(
		&self,
		params: &WarpParams,
		alg: DemAlgorithm,
		options: &DemOptions,
		sink: &Sink,
	) -> Result<RasterBuf> {
		let heights = self.warp_heightfield(params, sink)?;
		let heights = heights.as_f32().unwrap();
		let cell_x = params.extent.width() / f64::from(params.size.width);
		let cell_y = params.extent.height() / f64::from(params.size.height);

		let data = match alg {
			DemAlgorithm::Hillshade => dem::hillshade(heights, &params.size, cell_x, cell_y, options),
			DemAlgorithm::Slope => dem::slope(heights, &params.size, cell_x, cell_y, options),
			DemAlgorithm::Aspect => dem::aspect(heights, &params.size, cell_x, cell_y, options),
			DemAlgorithm::Roughness | DemAlgorithm::Tri => {
				dem::roughness_kernel(heights, &params.size, |neighbours, center| {
					neighbours.iter().map(|n| (n - center).abs()).sum::<f64>() / neighbours.len() as f64
				})
			}
			DemAlgorithm::Tpi => dem::roughness_kernel(heights, &params.size, |neighbours, center| {
				(center - neighbours.iter().sum::<f64>() / neighbours.len() as f64).abs()
			}),
			DemAlgorithm::ColorRelief => {
				// grayscale relief: heights normalised into 0..255
				heights
					.iter()
					.map(|&height| {
						let amplitude = self.profile.amplitude.max(1.0);
						((f64::from(height) / amplitude / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0) as u8
					})
					.collect()
			}
		};
		RasterBuf::new(params.size, 1, PixelData::U8(data))
	}

	fn estimated_bytes(&self) -> usize {
		let bands = usize::from(self.info.bands);
		let sample = if self.info.pixel_type.is_float() { 4 } else { 1 };
		self.info.size.pixels() * bands * sample
	}
}
