//! `tms-normal-map`: per-pixel surface normals from a DEM, encoded as
//! lossless WebP in BGR channel order.
//!
//! Normals are computed in the tile's spatial division SRS with
//! Zevenbergen–Thorne differences and converted into the reference frame's
//! physical SRS. For lods deeper than 3 a tile covers a small angular extent
//! and the conversion collapses to one linear transform per tile; shallower
//! tiles convert per pixel.

use super::tms::{Admission, TmsCommon};
use super::{ArtifactKind, Generator, TILE_SIZE, TileArtifact, TileRequest, binary_artifact};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::TmsNormalMapDef;
use crate::resource::{GeneratorKind, Resource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cartolina_core::{ImageFormat, Sink, TileError};
use cartolina_warp::dem::zevenbergen_thorne_normals;
use cartolina_warp::farm::Operation;
use cartolina_warp::types::{GeoExtent, Resampling, Size};
use image::{DynamicImage, RgbImage};
use std::sync::Arc;

const GENERATOR_REVISION: u32 = 1;

/// Beyond this lod the SRS conversion uses one transform per tile.
const LINEAR_TRANSFORM_LOD: u8 = 3;

pub struct TmsNormalMapGenerator {
	common: TmsCommon,
	def: TmsNormalMapDef,
}

#[async_trait]
impl Generator for TmsNormalMapGenerator {
	fn resource(&self) -> &Resource {
		self.common.resource()
	}

	fn generator_revision(&self) -> u32 {
		GENERATOR_REVISION
	}

	async fn prepare(&self, _sink: &Sink) -> Result<()> {
		self.common.probe_dataset(&self.def.dem).await?;
		if let Some(landcover) = &self.def.landcover {
			self.common.probe_dataset(landcover).await?;
		}
		Ok(())
	}

	async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		match request.kind {
			ArtifactKind::Image(_) | ArtifactKind::Normals => {
				if let Admission::Early(artifact) = self.common.admit(request, sink)? {
					return Ok(artifact);
				}

				let heights = self
					.common
					.warp_tile(&self.def.dem, Operation::Image, Resampling::Bilinear, &request.coord, sink)
					.await?;
				let heights = heights.as_f32().context("DEM warp returned a non-float buffer")?.to_vec();

				// landcover drives the flat-pixel mask; nearest keeps classes crisp
				let flat = if let Some(landcover) = &self.def.landcover {
					let classes = self
						.common
						.warp_tile(landcover, Operation::ImageNoExpand, Resampling::Nearest, &request.coord, sink)
						.await?;
					let data = classes.as_u8().context("landcover warp returned a non-byte buffer")?;
					let channels = classes.channels as usize;
					Some(
						data
							.chunks_exact(channels)
							.map(|px| self.def.flat_classes.contains(&px[0]))
							.collect::<Vec<bool>>(),
					)
				} else {
					None
				};
				sink.check_aborted()?;

				let extent = self.common.ctx.frame.tile_extent(&request.coord);
				let image = normal_image(
					&heights,
					&Size::new(TILE_SIZE, TILE_SIZE),
					&extent,
					self.def.z_factor,
					self.def.invert_relief,
					flat.as_deref(),
					request.coord.lod > LINEAR_TRANSFORM_LOD,
				);

				let body = cartolina_image::format::webp::image2blob_bgr(&DynamicImage::ImageRgb8(image))?;
				Ok(binary_artifact(
					body,
					ImageFormat::Webp.content_type(),
					self.common.data_max_age(),
				))
			}
			ArtifactKind::Mask => {
				if let Admission::Early(artifact) = self.common.admit(request, sink)? {
					return Ok(artifact);
				}
				let mask = self.common.warp_mask_image(&self.def.dem, &request.coord, sink).await?;
				super::encode_image(
					&DynamicImage::ImageLuma8(mask),
					ImageFormat::Png,
					self.common.data_max_age(),
				)
			}
			ArtifactKind::Metatile => {
				sink.check_aborted()?;
				self.common.meta2d(&request.coord, None)
			}
			_ => Err(TileError::not_found(format!(
				"artifact '{}' not served by tms-normal-map",
				request.kind.as_str()
			))),
		}
	}

	fn url_template(&self) -> String {
		self.common.url_template("webp", GENERATOR_REVISION)
	}

	fn boundlayer(&self) -> Option<serde_json::Value> {
		Some(self.common.boundlayer("webp", GENERATOR_REVISION))
	}

	fn mapconfig(&self) -> serde_json::Value {
		self.common.mapconfig(&self.boundlayer().unwrap())
	}
}

/// Renders normals into an RGB image (to be swapped to BGR at encode time).
///
/// `per_tile_linear` selects the optimised path: one division-to-physical
/// rotation taken at the tile centre instead of one per pixel.
pub(crate) fn normal_image(
	heights: &[f32],
	size: &Size,
	extent: &GeoExtent,
	z_factor: f64,
	invert_relief: bool,
	flat: Option<&[bool]>,
	per_tile_linear: bool,
) -> RgbImage {
	let cell_x = extent.width() / f64::from(size.width);
	let cell_y = extent.height() / f64::from(size.height);
	let mut normals = zevenbergen_thorne_normals(heights, size, cell_x, cell_y, z_factor);

	if invert_relief {
		for n in &mut normals {
			n[0] = -n[0];
			n[1] = -n[1];
		}
	}

	let center = extent.center();
	let center_rotation = physical_rotation(center.0, center.1);

	let mut image = RgbImage::new(size.width, size.height);
	for (i, n) in normals.iter().enumerate() {
		let x = i as u32 % size.width;
		let y = i as u32 / size.width;

		let n = if flat.is_some_and(|flat| flat[i]) {
			[0.0, 0.0, 1.0]
		} else {
			*n
		};

		let rotation = if per_tile_linear {
			center_rotation
		} else {
			physical_rotation(
				extent.x_min + (f64::from(x) + 0.5) * cell_x,
				extent.y_max - (f64::from(y) + 0.5) * cell_y,
			)
		};
		let physical = rotate(&rotation, &n);

		image.put_pixel(
			x,
			y,
			image::Rgb([
				((physical[0] * 0.5 + 0.5) * 255.0).round() as u8,
				((physical[1] * 0.5 + 0.5) * 255.0).round() as u8,
				((physical[2] * 0.5 + 0.5) * 255.0).round() as u8,
			]),
		);
	}
	image
}

/// ENU-to-geocentric rotation at the given Web-Mercator position. For
/// non-mercator divisions the transform degrades to the identity.
fn physical_rotation(x: f64, y: f64) -> [[f64; 3]; 3] {
	const RADIUS: f64 = 6_378_137.0;
	let lon = x / RADIUS;
	let lat = 2.0 * (y / RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2;

	let (sin_lon, cos_lon) = lon.sin_cos();
	let (sin_lat, cos_lat) = lat.sin_cos();

	// columns: east, north, up in ECEF
	[
		[-sin_lon, -sin_lat * cos_lon, cos_lat * cos_lon],
		[cos_lon, -sin_lat * sin_lon, cos_lat * sin_lon],
		[0.0, cos_lat, sin_lat],
	]
}

fn rotate(m: &[[f64; 3]; 3], v: &[f32; 3]) -> [f64; 3] {
	let v = [f64::from(v[0]), f64::from(v[1]), f64::from(v[2])];
	[
		m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
		m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
		m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
	]
}

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Tms,
		driver: "tms-normal-map",
		needs_ranges: true,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<TmsNormalMapDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<TmsNormalMapDef>()
				.context("tms-normal-map definition of unexpected type")?
				.clone();
			Ok(Arc::new(TmsNormalMapGenerator {
				common: TmsCommon::new(ctx),
				def,
			}))
		},
	}
}
