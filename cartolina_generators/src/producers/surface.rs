//! Behaviour shared by the surface drivers: terrain meshes with skirts,
//! navigation tiles, 3D metatiles, coverage masks and the 2D metatile view.
//!
//! Binary framings (all integers little-endian):
//!
//! - **mesh**: `"CMSH"`, version u8, reserved u8, grid edge u16, texture
//!   layer id u16, extent 4×f64, skirt depth f32, `edge²` f32 heights, then
//!   the skirt ring: `4·(edge-1)` f32 heights (perimeter, clockwise from NW,
//!   each lowered by the skirt depth).
//! - **navtile**: `"CNAV"`, version u8, reserved u8, grid edge u16, height
//!   range as i32 floor(min) / i32 ceil(max), `edge²` u16 heights quantised
//!   into the range.
//! - **metatile**: `"CMTA"`, version u8, order u8 (3), lod u8, reserved u8,
//!   x u32, y u32 of the block origin, then per tile (row-major):
//!   flags u8 (bit 0 geometry, bit 1 navtile), children mask u8,
//!   height range i16/i16, texel size f32, surrogate height f32.

use super::{ArtifactKind, Gate, GeneratorContext, TILE_SIZE, TileArtifact, TileRequest, binary_artifact, check_gate};
use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use byteorder::{LE, WriteBytesExt};
use cartolina_core::{Blob, ImageFormat, Sink, TileCoord, TileError};
use cartolina_index::{TileIndex, TileIndexFlag};
use cartolina_warp::farm::{Operation, WarpRequest};
use cartolina_warp::types::{Resampling, Size};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;

/// Samples per side of a navtile grid.
pub(crate) const NAVTILE_EDGE: u32 = 16;

/// Binary order of the 3D metatile: an 8×8 block of tiles.
pub(crate) const METATILE_ORDER: u8 = 3;

pub(crate) const MESH_CONTENT_TYPE: &str = "application/octet-stream";

/// The embedded common part of both surface drivers.
pub(crate) struct SurfaceCommon {
	pub ctx: GeneratorContext,
	/// Published delivery index; set by `prepare`, required for serving.
	pub index: ArcSwapOption<TileIndex>,
	/// DEM dataset; `None` renders the constant-zero spheroid.
	pub dem: Option<PathBuf>,
	pub samples_per_side: u32,
	pub texture_layer_id: u16,
}

impl SurfaceCommon {
	pub fn new(ctx: GeneratorContext, dem: Option<PathBuf>, samples_per_side: u32, texture_layer_id: u16) -> SurfaceCommon {
		SurfaceCommon {
			ctx,
			index: ArcSwapOption::from(None),
			dem,
			samples_per_side: samples_per_side.clamp(2, 255),
			texture_layer_id,
		}
	}

	pub fn data_max_age(&self) -> i64 {
		self.ctx.resource.file_class_settings.max_age(cartolina_core::FileClass::Data)
	}

	fn index(&self) -> Result<Arc<TileIndex>> {
		self
			.index
			.load_full()
			.ok_or_else(|| TileError::unavailable(self.ctx.resource.id.to_string()))
	}

	/// Terrain gate: invalid and unproductive tiles are both NotFound.
	fn admit(&self, coord: &TileCoord, sink: &Sink) -> Result<Arc<TileIndex>> {
		sink.check_aborted()?;
		let index = self.index()?;
		match check_gate(&self.ctx.frame, &self.ctx.resource, Some(index.as_ref()), coord) {
			Gate::Pass => Ok(index),
			Gate::Invalid | Gate::Unproductive => Err(TileError::not_found(format!(
				"tile {coord} outside {}",
				self.ctx.resource.id
			))),
		}
	}

	/// Samples an `edge × edge` height grid over the tile extent.
	async fn heights(&self, coord: &TileCoord, edge: u32, sink: &Sink) -> Result<Vec<f32>> {
		match &self.dem {
			None => {
				sink.check_aborted()?;
				Ok(vec![0.0; (edge * edge) as usize])
			}
			Some(dem) => {
				let request = WarpRequest {
					dataset: dem.clone(),
					open_options: Vec::new(),
					params: cartolina_warp::backend::WarpParams {
						extent: self.ctx.frame.tile_extent(coord),
						dst_srs: self.ctx.frame.srs.clone(),
						size: Size::new(edge, edge),
						resampling: Resampling::Bilinear,
					},
					operation: Operation::Image,
				};
				let buf = self.ctx.farm.warp(request, sink).await?.into_raster()?;
				Ok(buf.as_f32().context("DEM warp returned a non-float buffer")?.to_vec())
			}
		}
	}

	// -- artifacts -----------------------------------------------------------

	pub async fn mesh(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		let _index = self.admit(&request.coord, sink)?;
		let edge = self.samples_per_side + 1;
		let heights = self.heights(&request.coord, edge, sink).await?;
		sink.check_aborted()?;

		let extent = self.ctx.frame.tile_extent(&request.coord);
		let (min, max) = min_max(&heights);
		// skirts drop below the lowest vertex to hide seams between lods
		let skirt_depth = ((max - min) * 0.1).max(extent.width() as f32 / TILE_SIZE as f32);

		let mut out = Vec::with_capacity(16 + heights.len() * 4);
		out.extend_from_slice(b"CMSH");
		out.push(1);
		out.push(0);
		out.write_u16::<LE>(edge as u16).unwrap();
		out.write_u16::<LE>(self.texture_layer_id).unwrap();
		for v in [extent.x_min, extent.y_min, extent.x_max, extent.y_max] {
			out.write_f64::<LE>(v).unwrap();
		}
		out.write_f32::<LE>(skirt_depth).unwrap();
		for height in &heights {
			out.write_f32::<LE>(*height).unwrap();
		}
		for height in perimeter(&heights, edge as usize) {
			out.write_f32::<LE>(height - skirt_depth).unwrap();
		}

		Ok(binary_artifact(Blob::from(out), MESH_CONTENT_TYPE, self.data_max_age()))
	}

	pub async fn navtile(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		let index = self.admit(&request.coord, sink)?;
		// deep tiles inherit index flags from watertight ancestors; the lod
		// limit still binds
		if request.coord.lod > self.ctx.frame.navtile_lod
			|| !index.get(&request.coord).contains(TileIndexFlag::Navtile)
		{
			return Err(TileError::not_found(format!("no navtile at {}", request.coord)));
		}

		let heights = self.heights(&request.coord, NAVTILE_EDGE, sink).await?;
		sink.check_aborted()?;

		let (min, max) = min_max(&heights);
		let floor = min.floor() as i32;
		let ceil = max.ceil() as i32;
		let span = (ceil - floor).max(1) as f32;

		let mut out = Vec::with_capacity(16 + heights.len() * 2);
		out.extend_from_slice(b"CNAV");
		out.push(1);
		out.push(0);
		out.write_u16::<LE>(NAVTILE_EDGE as u16).unwrap();
		out.write_i32::<LE>(floor).unwrap();
		out.write_i32::<LE>(ceil).unwrap();
		for height in &heights {
			let q = ((height - floor as f32) / span * f32::from(u16::MAX)).clamp(0.0, f32::from(u16::MAX));
			out.write_u16::<LE>(q as u16).unwrap();
		}

		Ok(binary_artifact(Blob::from(out), MESH_CONTENT_TYPE, self.data_max_age()))
	}

	/// 3D metatile: accumulates flags, height ranges, texel sizes, surrogate
	/// heights and children masks for the aligned 8×8 block.
	pub async fn metatile(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		sink.check_aborted()?;
		let index = self.index()?;
		let coord = request.coord;
		let edge = 1u32 << METATILE_ORDER.min(coord.lod);
		if coord.x % edge != 0 || coord.y % edge != 0 {
			return Err(TileError::not_found(format!("misaligned metatile id {coord}")));
		}
		if !self.ctx.frame.node(coord).valid() {
			return Err(TileError::not_found(format!("metatile {coord} outside the valid tree")));
		}

		// one coarse height grid for the whole block, sliced per tile
		let samples = 4u32;
		let block_heights = self
			.block_heights(&coord, edge * samples, sink)
			.await?;

		let mut out = Vec::with_capacity(20 + (edge * edge) as usize * 14);
		out.extend_from_slice(b"CMTA");
		out.push(1);
		out.push(METATILE_ORDER);
		out.push(coord.lod);
		out.push(0);
		out.write_u32::<LE>(coord.x).unwrap();
		out.write_u32::<LE>(coord.y).unwrap();

		for j in 0..edge {
			// natural yield point between metatile subblocks
			sink.check_aborted()?;
			for i in 0..edge {
				let tile = TileCoord::new(coord.lod, coord.x + i, coord.y + j)?;
				let flags = index.get(&tile);
				let node = self.ctx.frame.node(tile);

				let mut tile_flags = 0u8;
				if flags.contains(TileIndexFlag::Mesh) {
					tile_flags |= 0x01;
				}
				if flags.contains(TileIndexFlag::Navtile) {
					tile_flags |= 0x02;
				}

				// slice this tile's samples out of the block grid
				let mut min = f32::MAX;
				let mut max = f32::MIN;
				let mut sum = 0.0f64;
				for sy in 0..samples {
					for sx in 0..samples {
						let gx = i * samples + sx;
						let gy = j * samples + sy;
						let height = block_heights[(gy * edge * samples + gx) as usize];
						min = min.min(height);
						max = max.max(height);
						sum += f64::from(height);
					}
				}
				let surrogate = (sum / f64::from(samples * samples)) as f32;

				let extent = self.ctx.frame.tile_extent(&tile);
				let texel_size = ((extent.width() * extent.height()).sqrt() / f64::from(TILE_SIZE)) as f32;

				out.push(tile_flags);
				out.push(node.children_mask());
				out.write_i16::<LE>(min.floor() as i16).unwrap();
				out.write_i16::<LE>(max.ceil() as i16).unwrap();
				out.write_f32::<LE>(texel_size).unwrap();
				out.write_f32::<LE>(surrogate).unwrap();
			}
		}

		Ok(binary_artifact(Blob::from(out), MESH_CONTENT_TYPE, self.data_max_age()))
	}

	async fn block_heights(&self, coord: &TileCoord, edge: u32, sink: &Sink) -> Result<Vec<f32>> {
		match &self.dem {
			None => Ok(vec![0.0; (edge * edge) as usize]),
			Some(dem) => {
				let block_extent = {
					let nw = self.ctx.frame.tile_extent(coord);
					let block_tiles = f64::from(1u32 << METATILE_ORDER.min(coord.lod));
					cartolina_warp::types::GeoExtent::new(
						nw.x_min,
						nw.y_max - nw.height() * block_tiles,
						nw.x_min + nw.width() * block_tiles,
						nw.y_max,
					)
				};
				let request = WarpRequest {
					dataset: dem.clone(),
					open_options: Vec::new(),
					params: cartolina_warp::backend::WarpParams {
						extent: block_extent,
						dst_srs: self.ctx.frame.srs.clone(),
						size: Size::new(edge, edge),
						resampling: Resampling::Bilinear,
					},
					operation: Operation::Image,
				};
				let buf = self.ctx.farm.warp(request, sink).await?.into_raster()?;
				Ok(buf.as_f32().context("DEM warp returned a non-float buffer")?.to_vec())
			}
		}
	}

	/// Coverage mask of the underlying DEM (full coverage for the spheroid).
	pub async fn mask(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		let _index = self.admit(&request.coord, sink)?;
		let mask = match &self.dem {
			None => image::GrayImage::from_pixel(TILE_SIZE, TILE_SIZE, image::Luma([255])),
			Some(dem) => {
				let request = WarpRequest {
					dataset: dem.clone(),
					open_options: Vec::new(),
					params: cartolina_warp::backend::WarpParams {
						extent: self.ctx.frame.tile_extent(&request.coord),
						dst_srs: self.ctx.frame.srs.clone(),
						size: Size::new(TILE_SIZE, TILE_SIZE),
						resampling: Resampling::Nearest,
					},
					operation: Operation::Mask,
				};
				let buf = self.ctx.farm.warp(request, sink).await?.into_raster()?;
				let data = buf.as_u8().context("mask warp returned a non-byte buffer")?.to_vec();
				image::GrayImage::from_raw(buf.size.width, buf.size.height, data)
					.context("mask buffer size mismatch")?
			}
		};
		super::encode_image(
			&DynamicImage::ImageLuma8(mask),
			ImageFormat::Png,
			self.data_max_age(),
		)
	}

	/// Surface normals of the DEM tile (shares the normal-map pipeline).
	pub async fn normals(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		let _index = self.admit(&request.coord, sink)?;
		let heights = self.heights(&request.coord, TILE_SIZE, sink).await?;
		sink.check_aborted()?;

		let extent = self.ctx.frame.tile_extent(&request.coord);
		let image = super::tms_normalmap::normal_image(
			&heights,
			&Size::new(TILE_SIZE, TILE_SIZE),
			&extent,
			1.0,
			false,
			None,
			request.coord.lod > 3,
		);
		let body = cartolina_image::format::webp::image2blob_bgr(&DynamicImage::ImageRgb8(image))?;
		Ok(binary_artifact(
			body,
			ImageFormat::Webp.content_type(),
			self.data_max_age(),
		))
	}

	/// Dispatches the artifact kinds every surface serves.
	pub async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		match request.kind {
			ArtifactKind::Mesh => self.mesh(request, sink).await,
			ArtifactKind::Navtile => self.navtile(request, sink).await,
			ArtifactKind::Metatile => self.metatile(request, sink).await,
			ArtifactKind::Mask => self.mask(request, sink).await,
			ArtifactKind::Normals => self.normals(request, sink).await,
			ArtifactKind::Image(_) => {
				sink.check_aborted()?;
				let index = self.index()?;
				super::meta2d(
					&self.ctx.frame,
					&self.ctx.resource,
					Some(index.as_ref()),
					&request.coord,
					self.data_max_age(),
				)
			}
			ArtifactKind::Geodata => Err(TileError::not_found("surfaces do not serve geodata")),
		}
	}

	pub fn url_template(&self, generator_revision: u32) -> String {
		format!(
			"{}/{}/{{lod}}-{{x}}-{{y}}.terrain{}",
			self.ctx.resource.id.group,
			self.ctx.resource.id.id,
			self.ctx.url_query(generator_revision)
		)
	}

	pub fn mapconfig(&self, generator_revision: u32) -> serde_json::Value {
		let resource = &self.ctx.resource;
		serde_json::json!({
			"referenceFrame": resource.id.reference_frame,
			"surfaces": {
				(resource.full_id()): {
					"url": self.url_template(generator_revision),
					"lodRange": [resource.lod_range.min, resource.lod_range.max],
					"tileRange": [
						[resource.tile_range.x_min, resource.tile_range.y_min],
						[resource.tile_range.x_max, resource.tile_range.y_max]
					],
					"revision": resource.revision,
					"credits": resource.credits.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
				}
			},
		})
	}
}

/// Perimeter heights clockwise from the NW corner.
fn perimeter(heights: &[f32], edge: usize) -> Vec<f32> {
	let mut ring = Vec::with_capacity(4 * (edge - 1));
	for x in 0..edge - 1 {
		ring.push(heights[x]);
	}
	for y in 0..edge - 1 {
		ring.push(heights[y * edge + (edge - 1)]);
	}
	for x in (1..edge).rev() {
		ring.push(heights[(edge - 1) * edge + x]);
	}
	for y in (1..edge).rev() {
		ring.push(heights[y * edge]);
	}
	ring
}

fn min_max(values: &[f32]) -> (f32, f32) {
	let mut min = f32::MAX;
	let mut max = f32::MIN;
	for &v in values {
		min = min.min(v);
		max = max.max(v);
	}
	if min > max {
		(0.0, 0.0)
	} else {
		(min, max)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn perimeter_walks_the_ring_once() {
		// 3x3 grid: ring must visit 8 cells, the centre never
		let heights: Vec<f32> = (0..9).map(|v| v as f32).collect();
		let ring = perimeter(&heights, 3);
		assert_eq!(ring.len(), 8);
		assert!(!ring.contains(&4.0));
		assert_eq!(ring[0], 0.0);
	}

	#[test]
	fn min_max_handles_empty() {
		assert_eq!(min_max(&[]), (0.0, 0.0));
		assert_eq!(min_max(&[3.0, -1.0, 2.0]), (-1.0, 3.0));
	}
}
