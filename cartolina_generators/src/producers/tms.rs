//! Common TMS bound-layer behaviour plus the `tms-raster` driver.
//!
//! All TMS drivers compose a [`TmsCommon`] value (no inheritance): it owns
//! the gate sequence, the 2D metatile rasterisation and the boundlayer
//! document, while the driver body turns one admitted tile into pixels.

use super::{
	ArtifactKind, Gate, Generator, GeneratorContext, TileArtifact, TileRequest, check_gate, encode_image,
	tile_warp_params, unproductive_image,
};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::TmsRasterDef;
use crate::resource::{GeneratorKind, Resource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cartolina_core::{FileClass, ImageFormat, Sink, TileCoord, TileError};
use cartolina_image::raster::{apply_mask, image_from_channels, mask_is_empty};
use cartolina_warp::farm::{Operation, WarpRequest};
use cartolina_warp::types::Resampling;
use image::{DynamicImage, GrayImage};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Outcome of the gate sequence for one request.
pub(crate) enum Admission {
	Pass,
	/// Early return (debug flavour renders unproductive tiles black).
	Early(TileArtifact),
}

/// The behaviour shared by every TMS driver.
pub(crate) struct TmsCommon {
	pub ctx: GeneratorContext,
}

impl TmsCommon {
	pub fn new(ctx: GeneratorContext) -> TmsCommon {
		TmsCommon { ctx }
	}

	pub fn resource(&self) -> &Resource {
		&self.ctx.resource
	}

	pub fn data_max_age(&self) -> i64 {
		self.ctx.resource.file_class_settings.max_age(FileClass::Data)
	}

	/// Steps 1-4 of the producer sequence: abort, validity, productivity,
	/// range.
	pub fn admit(&self, request: &TileRequest, sink: &Sink) -> Result<Admission> {
		sink.check_aborted()?;
		match check_gate(&self.ctx.frame, &self.ctx.resource, None, &request.coord) {
			Gate::Pass => Ok(Admission::Pass),
			Gate::Invalid => Err(TileError::not_found(format!(
				"tile {} outside {}",
				request.coord,
				self.ctx.resource.id
			))),
			Gate::Unproductive => Ok(Admission::Early(unproductive_image(request, self.data_max_age())?)),
		}
	}

	/// Warps one 256×256 tile of `dataset` through the farm.
	pub async fn warp_tile(
		&self,
		dataset: &Path,
		operation: Operation,
		resampling: Resampling,
		coord: &TileCoord,
		sink: &Sink,
	) -> Result<cartolina_warp::types::RasterBuf> {
		let request = WarpRequest {
			dataset: dataset.to_path_buf(),
			open_options: Vec::new(),
			params: tile_warp_params(&self.ctx.frame, coord, resampling),
			operation,
		};
		self.ctx.farm.warp(request, sink).await?.into_raster()
	}

	/// Warped coverage mask of `dataset` as a grayscale image.
	pub async fn warp_mask_image(&self, dataset: &Path, coord: &TileCoord, sink: &Sink) -> Result<GrayImage> {
		let buf = self
			.warp_tile(dataset, Operation::Mask, Resampling::Nearest, coord, sink)
			.await?;
		let data = buf.as_u8().context("mask warp returned a non-byte buffer")?.to_vec();
		GrayImage::from_raw(buf.size.width, buf.size.height, data).context("mask buffer size mismatch")
	}

	/// 2D metatile for the aligned block containing `coord`.
	pub fn meta2d(&self, coord: &TileCoord, index: Option<&cartolina_index::TileIndex>) -> Result<TileArtifact> {
		super::meta2d(&self.ctx.frame, &self.ctx.resource, index, coord, self.data_max_age())
	}

	pub fn url_template(&self, extension: &str, generator_revision: u32) -> String {
		format!(
			"{}/{}/{{lod}}-{{x}}-{{y}}.{extension}{}",
			self.ctx.resource.id.group,
			self.ctx.resource.id.id,
			self.ctx.url_query(generator_revision)
		)
	}

	/// The boundlayer.json document shared by all TMS drivers.
	pub fn boundlayer(&self, extension: &str, generator_revision: u32) -> serde_json::Value {
		let resource = &self.ctx.resource;
		json!({
			"id": resource.full_id(),
			"type": "raster",
			"url": self.url_template(extension, generator_revision),
			"maskUrl": self.url_template("mask", generator_revision),
			"metaUrl": self.url_template("meta", generator_revision),
			"lodRange": [resource.lod_range.min, resource.lod_range.max],
			"tileRange": [
				[resource.tile_range.x_min, resource.tile_range.y_min],
				[resource.tile_range.x_max, resource.tile_range.y_max]
			],
			"credits": resource.credits.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
		})
	}

	pub fn mapconfig(&self, boundlayer: &serde_json::Value) -> serde_json::Value {
		json!({
			"referenceFrame": self.ctx.resource.id.reference_frame,
			"boundLayers": { (self.ctx.resource.full_id()): boundlayer },
		})
	}

	/// TMS preparation: probe that the dataset opens.
	pub async fn probe_dataset(&self, dataset: &Path) -> Result<()> {
		let backend = self.ctx.backend.clone();
		let dataset = dataset.to_path_buf();
		tokio::task::spawn_blocking(move || backend.open(&dataset, &[]).map(|_| ()))
			.await
			.context("dataset probe task failed")?
	}
}

// -- tms-raster --------------------------------------------------------------

const GENERATOR_REVISION: u32 = 1;

pub struct TmsRasterGenerator {
	common: TmsCommon,
	def: TmsRasterDef,
}

impl TmsRasterGenerator {
	fn format(&self) -> ImageFormat {
		self.def.format.unwrap_or(ImageFormat::Jpeg)
	}
}

#[async_trait]
impl Generator for TmsRasterGenerator {
	fn resource(&self) -> &Resource {
		self.common.resource()
	}

	fn generator_revision(&self) -> u32 {
		GENERATOR_REVISION
	}

	async fn prepare(&self, _sink: &Sink) -> Result<()> {
		self.common.probe_dataset(&self.def.dataset).await
	}

	async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		match request.kind {
			ArtifactKind::Image(format) => {
				if let Admission::Early(artifact) = self.common.admit(request, sink)? {
					return Ok(artifact);
				}
				let resampling = self.def.resampling.unwrap_or_default();
				let buf = self
					.common
					.warp_tile(&self.def.dataset, Operation::Image, resampling, &request.coord, sink)
					.await?;
				sink.check_aborted()?;

				let mut image = image_from_channels(buf.size.width, buf.size.height, buf.channels, buf.as_u8().context("raster warp returned a non-byte buffer")?.to_vec())?;

				if let Some(mask_dataset) = &self.def.mask {
					let mask = self.common.warp_mask_image(mask_dataset, &request.coord, sink).await?;
					if mask_is_empty(&mask) && !request.debug {
						return Err(TileError::EmptyImage.into());
					}
					image = apply_mask(&image, &mask)?;
				}
				if format == ImageFormat::Jpeg && image.color().has_alpha() {
					image = DynamicImage::ImageRgb8(image.to_rgb8());
				}
				encode_image(&image, format, self.common.data_max_age())
			}
			ArtifactKind::Mask => {
				if let Admission::Early(artifact) = self.common.admit(request, sink)? {
					return Ok(artifact);
				}
				let dataset = self.def.mask.as_deref().unwrap_or(&self.def.dataset);
				let mask = self.common.warp_mask_image(dataset, &request.coord, sink).await?;
				if mask_is_empty(&mask) && !request.debug {
					return Err(TileError::EmptyDebugMask.into());
				}
				encode_image(&DynamicImage::ImageLuma8(mask), ImageFormat::Png, self.common.data_max_age())
			}
			ArtifactKind::Metatile => {
				sink.check_aborted()?;
				self.common.meta2d(&request.coord, None)
			}
			_ => Err(TileError::not_found(format!(
				"artifact '{}' not served by tms-raster",
				request.kind.as_str()
			))),
		}
	}

	fn url_template(&self) -> String {
		self.common.url_template(self.format().extension(), GENERATOR_REVISION)
	}

	fn boundlayer(&self) -> Option<serde_json::Value> {
		Some(self.common.boundlayer(self.format().extension(), GENERATOR_REVISION))
	}

	fn mapconfig(&self) -> serde_json::Value {
		self.common.mapconfig(&self.boundlayer().unwrap())
	}
}

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Tms,
		driver: "tms-raster",
		needs_ranges: true,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<TmsRasterDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<TmsRasterDef>()
				.context("tms-raster definition of unexpected type")?
				.clone();
			Ok(Arc::new(TmsRasterGenerator {
				common: TmsCommon::new(ctx),
				def,
			}))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::super::test_support::{mock_context, tms_resource};
	use super::*;
	use cartolina_core::{LodRange, TileRange};

	fn generator() -> (Arc<dyn Generator>, tempfile::TempDir) {
		let mut resource = tms_resource("ortho");
		resource.lod_range = LodRange::new(0, 18).unwrap();
		resource.tile_range = TileRange::new(0, 0, 0, 0).unwrap();
		let (ctx, _backend, dir) = mock_context(resource);
		let generator = (factory().build)(ctx).unwrap();
		(generator, dir)
	}

	fn image_request(lod: u8, x: u32, y: u32) -> TileRequest {
		TileRequest {
			coord: TileCoord::new(lod, x, y).unwrap(),
			kind: ArtifactKind::Image(ImageFormat::Jpeg),
			debug: false,
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn serves_an_image_tile() -> Result<()> {
		let (generator, _dir) = generator();
		let artifact = generator.generate(&image_request(2, 1, 1), &Sink::new()).await?;

		assert_eq!(artifact.content_type, "image/jpeg");
		assert_eq!(ImageFormat::sniff(artifact.body.as_slice())?, ImageFormat::Jpeg);
		assert_eq!(artifact.max_age, 604_800);
		Ok(())
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn out_of_range_tile_is_not_found() {
		let (generator, _dir) = generator();
		// grid-valid but outside the frame's 2^lod range shifted tile range
		let err = generator
			.generate(&image_request(19, 0, 0), &Sink::new())
			.await
			.unwrap_err();
		assert!(matches!(TileError::of(&err), Some(TileError::NotFound(_))));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn metatile_is_a_png_block() -> Result<()> {
		let (generator, _dir) = generator();
		let artifact = generator
			.generate(
				&TileRequest {
					coord: TileCoord::new(2, 0, 0).unwrap(),
					kind: ArtifactKind::Metatile,
					debug: false,
				},
				&Sink::new(),
			)
			.await?;
		assert_eq!(artifact.content_type, "image/png");

		let decoded = cartolina_image::decode(&artifact.body, ImageFormat::Png)?.to_luma8();
		assert_eq!(decoded.dimensions(), (4, 4));
		// all four lod-2 tiles within the configured range are watertight
		assert_eq!(decoded.get_pixel(0, 0).0, [0xc0]);
		assert_eq!(decoded.get_pixel(3, 3).0, [0xc0]);
		Ok(())
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn misaligned_metatile_is_not_found() {
		let (generator, _dir) = generator();
		let err = generator
			.generate(
				&TileRequest {
					coord: TileCoord::new(2, 1, 0).unwrap(),
					kind: ArtifactKind::Metatile,
					debug: false,
				},
				&Sink::new(),
			)
			.await
			.unwrap_err();
		assert!(matches!(TileError::of(&err), Some(TileError::NotFound(_))));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn cancellation_surfaces_as_cancelled() {
		let (generator, _dir) = generator();
		let sink = Sink::new();
		sink.abort();
		let err = generator.generate(&image_request(2, 1, 1), &sink).await.unwrap_err();
		assert!(matches!(TileError::of(&err), Some(TileError::Cancelled)));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn boundlayer_carries_revision_query() {
		let (generator, _dir) = generator();
		let boundlayer = generator.boundlayer().unwrap();
		let url = boundlayer["url"].as_str().unwrap();
		assert!(url.contains("{lod}-{x}-{y}.jpg"));
		assert!(url.contains("?gr=1&r=0"));
	}
}
