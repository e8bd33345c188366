//! Geometry and pixel-buffer primitives shared by the backend, the farm and
//! the VRT builder.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Raster dimensions in pixels.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
	pub width: u32,
	pub height: u32,
}

impl Size {
	pub fn new(width: u32, height: u32) -> Size {
		Size { width, height }
	}

	pub fn pixels(&self) -> usize {
		self.width as usize * self.height as usize
	}

	/// Round-to-nearest halving, as used between overview levels.
	pub fn halved(&self) -> Size {
		Size {
			width: (self.width + 1) / 2,
			height: (self.height + 1) / 2,
		}
	}

	pub fn fits_into(&self, other: &Size) -> bool {
		self.width <= other.width && self.height <= other.height
	}
}

impl Debug for Size {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}x{}", self.width, self.height)
	}
}

/// Axis-aligned extent in SRS units (x grows east, y grows north).
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoExtent {
	pub x_min: f64,
	pub y_min: f64,
	pub x_max: f64,
	pub y_max: f64,
}

impl GeoExtent {
	pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> GeoExtent {
		GeoExtent {
			x_min,
			y_min,
			x_max,
			y_max,
		}
	}

	pub fn width(&self) -> f64 {
		self.x_max - self.x_min
	}

	pub fn height(&self) -> f64 {
		self.y_max - self.y_min
	}

	pub fn center(&self) -> (f64, f64) {
		((self.x_min + self.x_max) / 2.0, (self.y_min + self.y_max) / 2.0)
	}

	/// Widens the extent by `amount` SRS units on each x side.
	pub fn grown_x(&self, amount: f64) -> GeoExtent {
		GeoExtent {
			x_min: self.x_min - amount,
			x_max: self.x_max + amount,
			..*self
		}
	}

	/// The sub-extent covering pixel window `(x0, y0)..(x0+w, y0+h)` of a
	/// raster of `size` pixels mapped onto this extent (row 0 at y_max).
	pub fn pixel_window(&self, size: &Size, x0: u32, y0: u32, w: u32, h: u32) -> GeoExtent {
		let px = self.width() / f64::from(size.width);
		let py = self.height() / f64::from(size.height);
		GeoExtent {
			x_min: self.x_min + px * f64::from(x0),
			x_max: self.x_min + px * f64::from(x0 + w),
			y_max: self.y_max - py * f64::from(y0),
			y_min: self.y_max - py * f64::from(y0 + h),
		}
	}

	/// GDAL-style geo transform for a raster of `size` pixels over this
	/// extent (north-up).
	pub fn geo_transform(&self, size: &Size) -> [f64; 6] {
		[
			self.x_min,
			self.width() / f64::from(size.width),
			0.0,
			self.y_max,
			0.0,
			-self.height() / f64::from(size.height),
		]
	}
}

impl Debug for GeoExtent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"GeoExtent[{}, {} .. {}, {}]",
			self.x_min, self.y_min, self.x_max, self.y_max
		)
	}
}

/// Per-band background colour used for empty-tile elimination and gap fill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub Vec<u8>);

impl Color {
	pub fn channels(&self) -> u8 {
		self.0.len() as u8
	}
}

/// Resampling algorithms understood by the warper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
	Nearest,
	Bilinear,
	#[default]
	Cubic,
	CubicSpline,
	Lanczos,
	Average,
}

impl Resampling {
	pub fn as_str(&self) -> &'static str {
		match self {
			Resampling::Nearest => "nearest",
			Resampling::Bilinear => "bilinear",
			Resampling::Cubic => "cubic",
			Resampling::CubicSpline => "cubicspline",
			Resampling::Lanczos => "lanczos",
			Resampling::Average => "average",
		}
	}
}

/// Pixel data types as used in VRT documents and GeoTIFF output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
	U8,
	U16,
	I16,
	U32,
	I32,
	F32,
	F64,
}

impl PixelType {
	/// The GDAL spelling used in VRT `dataType` attributes.
	pub fn gdal_name(&self) -> &'static str {
		match self {
			PixelType::U8 => "Byte",
			PixelType::U16 => "UInt16",
			PixelType::I16 => "Int16",
			PixelType::U32 => "UInt32",
			PixelType::I32 => "Int32",
			PixelType::F32 => "Float32",
			PixelType::F64 => "Float64",
		}
	}

	pub fn is_float(&self) -> bool {
		matches!(self, PixelType::F32 | PixelType::F64)
	}

	/// The next wider type of the same family, used when a separate mask
	/// band forces a nodata value outside the source range.
	pub fn widened(&self) -> PixelType {
		match self {
			PixelType::U8 => PixelType::U16,
			PixelType::U16 | PixelType::I16 => PixelType::U32,
			PixelType::U32 | PixelType::I32 => PixelType::F64,
			PixelType::F32 | PixelType::F64 => PixelType::F64,
		}
	}

	/// `lowest()` of the type, used as the synthetic nodata after widening.
	pub fn lowest(&self) -> f64 {
		match self {
			PixelType::U8 | PixelType::U16 | PixelType::U32 => 0.0,
			PixelType::I16 => f64::from(i16::MIN),
			PixelType::I32 => f64::from(i32::MIN),
			PixelType::F32 => f64::from(f32::MIN),
			PixelType::F64 => f64::MIN,
		}
	}

	/// GeoTIFF predictor: 3 for floating point, 2 for integer samples.
	pub fn predictor(&self) -> u8 {
		if self.is_float() { 3 } else { 2 }
	}
}

/// Pixel payload of a warped buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum PixelData {
	U8(Vec<u8>),
	F32(Vec<f32>),
}

impl PixelData {
	pub fn len(&self) -> usize {
		match self {
			PixelData::U8(v) => v.len(),
			PixelData::F32(v) => v.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn byte_len(&self) -> usize {
		match self {
			PixelData::U8(v) => v.len(),
			PixelData::F32(v) => v.len() * 4,
		}
	}
}

/// A warped raster: interleaved channels, row-major, row 0 on top.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterBuf {
	pub size: Size,
	pub channels: u8,
	pub data: PixelData,
}

impl RasterBuf {
	pub fn new(size: Size, channels: u8, data: PixelData) -> Result<RasterBuf> {
		let expected = size.pixels() * channels as usize;
		ensure!(
			data.len() == expected,
			"raster buffer length mismatch: expected {expected}, got {}",
			data.len()
		);
		Ok(RasterBuf { size, channels, data })
	}

	pub fn pixel_type(&self) -> PixelType {
		match self.data {
			PixelData::U8(_) => PixelType::U8,
			PixelData::F32(_) => PixelType::F32,
		}
	}

	pub fn as_u8(&self) -> Option<&[u8]> {
		match &self.data {
			PixelData::U8(v) => Some(v),
			PixelData::F32(_) => None,
		}
	}

	pub fn as_f32(&self) -> Option<&[f32]> {
		match &self.data {
			PixelData::F32(v) => Some(v),
			PixelData::U8(_) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn halving_rounds_to_nearest() {
		assert_eq!(Size::new(4096, 2048).halved(), Size::new(2048, 1024));
		assert_eq!(Size::new(2047, 1025).halved(), Size::new(1024, 513));
		assert_eq!(Size::new(1, 1).halved(), Size::new(1, 1));
	}

	#[test]
	fn pixel_window_maps_rows_top_down() {
		let extent = GeoExtent::new(0.0, 0.0, 100.0, 50.0);
		let size = Size::new(100, 50);
		let window = extent.pixel_window(&size, 10, 0, 20, 10);
		assert_eq!(window, GeoExtent::new(10.0, 40.0, 30.0, 50.0));
	}

	#[test]
	fn geo_transform_is_north_up() {
		let extent = GeoExtent::new(-20.0, -10.0, 20.0, 10.0);
		let gt = extent.geo_transform(&Size::new(40, 20));
		assert_eq!(gt, [-20.0, 1.0, 0.0, 10.0, 0.0, -1.0]);
	}

	#[test]
	fn widening_and_predictor() {
		assert_eq!(PixelType::U8.widened(), PixelType::U16);
		assert_eq!(PixelType::U16.widened(), PixelType::U32);
		assert_eq!(PixelType::U32.widened(), PixelType::F64);
		assert_eq!(PixelType::F32.predictor(), 3);
		assert_eq!(PixelType::I32.predictor(), 2);
	}

	#[test]
	fn raster_buf_checks_length() {
		assert!(RasterBuf::new(Size::new(2, 2), 3, PixelData::U8(vec![0; 12])).is_ok());
		assert!(RasterBuf::new(Size::new(2, 2), 3, PixelData::U8(vec![0; 11])).is_err());
	}
}
