//! DEM processing algorithms and the Zevenbergen–Thorne kernel shared by the
//! normal-map producer and the mock backend. The GDAL backend delegates the
//! same algorithm names to `gdaldem`-equivalent processing.

use crate::types::Size;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `gdaldem`-equivalent processing modes accepted by tms-gdaldem resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemAlgorithm {
	Hillshade,
	Slope,
	Aspect,
	ColorRelief,
	Tri,
	Tpi,
	Roughness,
}

impl DemAlgorithm {
	pub fn as_str(&self) -> &'static str {
		match self {
			DemAlgorithm::Hillshade => "hillshade",
			DemAlgorithm::Slope => "slope",
			DemAlgorithm::Aspect => "aspect",
			DemAlgorithm::ColorRelief => "color-relief",
			DemAlgorithm::Tri => "TRI",
			DemAlgorithm::Tpi => "TPI",
			DemAlgorithm::Roughness => "roughness",
		}
	}
}

/// Options forwarded to DEM processing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemOptions {
	pub z_factor: f64,
	pub azimuth: f64,
	pub altitude: f64,
	/// Colour ramp file for color-relief.
	pub color_file: Option<PathBuf>,
}

impl Default for DemOptions {
	fn default() -> DemOptions {
		DemOptions {
			z_factor: 1.0,
			azimuth: 315.0,
			altitude: 45.0,
			color_file: None,
		}
	}
}

/// Per-pixel surface normals from a heightfield using Zevenbergen–Thorne
/// central differences. `cell_x`/`cell_y` are the pixel sizes in the same
/// units as the (z_factor-scaled) heights. Border pixels fall back to
/// one-sided differences.
pub fn zevenbergen_thorne_normals(
	heights: &[f32],
	size: &Size,
	cell_x: f64,
	cell_y: f64,
	z_factor: f64,
) -> Vec<[f32; 3]> {
	let w = size.width as usize;
	let h = size.height as usize;
	debug_assert_eq!(heights.len(), w * h);

	let at = |x: usize, y: usize| -> f64 { f64::from(heights[y * w + x]) * z_factor };

	let mut normals = Vec::with_capacity(w * h);
	for y in 0..h {
		for x in 0..w {
			let (xl, xr) = (x.saturating_sub(1), (x + 1).min(w - 1));
			let (yu, yd) = (y.saturating_sub(1), (y + 1).min(h - 1));

			let dzdx = (at(xr, y) - at(xl, y)) / (cell_x * (xr - xl).max(1) as f64);
			let dzdy = (at(x, yu) - at(x, yd)) / (cell_y * (yd - yu).max(1) as f64);

			let len = (dzdx * dzdx + dzdy * dzdy + 1.0).sqrt();
			normals.push([(-dzdx / len) as f32, (-dzdy / len) as f32, (1.0 / len) as f32]);
		}
	}
	normals
}

/// Hillshade from normals, matching gdaldem's illumination model.
pub fn hillshade(heights: &[f32], size: &Size, cell_x: f64, cell_y: f64, options: &DemOptions) -> Vec<u8> {
	let normals = zevenbergen_thorne_normals(heights, size, cell_x, cell_y, options.z_factor);

	let azimuth = options.azimuth.to_radians();
	let altitude = options.altitude.to_radians();
	let lx = altitude.cos() * azimuth.sin();
	let ly = altitude.cos() * azimuth.cos();
	let lz = altitude.sin();

	normals
		.iter()
		.map(|n| {
			let shade = f64::from(n[0]) * lx + f64::from(n[1]) * ly + f64::from(n[2]) * lz;
			(shade.max(0.0) * 255.0).round() as u8
		})
		.collect()
}

/// Slope in degrees, scaled so 90° maps to 255.
pub fn slope(heights: &[f32], size: &Size, cell_x: f64, cell_y: f64, options: &DemOptions) -> Vec<u8> {
	zevenbergen_thorne_normals(heights, size, cell_x, cell_y, options.z_factor)
		.iter()
		.map(|n| {
			let slope = f64::from(n[2]).clamp(-1.0, 1.0).acos().to_degrees();
			(slope / 90.0 * 255.0).round() as u8
		})
		.collect()
}

/// Aspect as compass degrees mapped onto 0..=255; flat pixels yield 0.
pub fn aspect(heights: &[f32], size: &Size, cell_x: f64, cell_y: f64, options: &DemOptions) -> Vec<u8> {
	zevenbergen_thorne_normals(heights, size, cell_x, cell_y, options.z_factor)
		.iter()
		.map(|n| {
			if n[0].abs() < 1e-9 && n[1].abs() < 1e-9 {
				0
			} else {
				let deg = f64::from(n[0]).atan2(f64::from(n[1])).to_degrees().rem_euclid(360.0);
				(deg / 360.0 * 255.0).round() as u8
			}
		})
		.collect()
}

/// Terrain ruggedness: mean absolute difference to the 8-neighbourhood.
pub fn roughness_kernel(heights: &[f32], size: &Size, reduce: impl Fn(&[f64], f64) -> f64) -> Vec<u8> {
	let w = size.width as usize;
	let h = size.height as usize;
	let mut out = Vec::with_capacity(w * h);

	for y in 0..h {
		for x in 0..w {
			let center = f64::from(heights[y * w + x]);
			let mut neighbours = Vec::with_capacity(8);
			for dy in -1i64..=1 {
				for dx in -1i64..=1 {
					if dx == 0 && dy == 0 {
						continue;
					}
					let nx = (x as i64 + dx).clamp(0, w as i64 - 1) as usize;
					let ny = (y as i64 + dy).clamp(0, h as i64 - 1) as usize;
					neighbours.push(f64::from(heights[ny * w + nx]));
				}
			}
			out.push(reduce(&neighbours, center).clamp(0.0, 255.0).round() as u8);
		}
	}
	out
}
