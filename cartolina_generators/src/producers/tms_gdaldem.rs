//! `tms-gdaldem`: DEM processing tiles (hillshade, slope, aspect, TRI, TPI,
//! roughness, color-relief) produced by the warper farm.

use super::tms::{Admission, TmsCommon};
use super::{ArtifactKind, Generator, TileArtifact, TileRequest, encode_image};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::TmsGdaldemDef;
use crate::resource::{GeneratorKind, Resource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cartolina_core::{ImageFormat, Sink, TileError};
use cartolina_image::raster::mask_is_empty;
use cartolina_warp::farm::Operation;
use cartolina_warp::types::Resampling;
use image::DynamicImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use std::sync::Arc;

const GENERATOR_REVISION: u32 = 1;

pub struct TmsGdaldemGenerator {
	common: TmsCommon,
	def: TmsGdaldemDef,
}

#[async_trait]
impl Generator for TmsGdaldemGenerator {
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
				let buf = self
					.common
					.warp_tile(
						&self.def.dataset,
						Operation::DemProcessing {
							alg: self.def.processing,
							options: self.def.options.clone(),
						},
						Resampling::Bilinear,
						&request.coord,
						sink,
					)
					.await?;
				sink.check_aborted()?;

				let data = buf.as_u8().context("DEM processing returned a non-byte buffer")?.to_vec();
				let gray = image::GrayImage::from_raw(buf.size.width, buf.size.height, data)
					.context("DEM processing buffer size mismatch")?;
				encode_image(&DynamicImage::ImageLuma8(gray), format, self.common.data_max_age())
			}
			ArtifactKind::Mask => {
				if let Admission::Early(artifact) = self.common.admit(request, sink)? {
					return Ok(artifact);
				}
				let dataset = self.def.mask.as_deref().unwrap_or(&self.def.dataset);
				let mut mask = self.common.warp_mask_image(dataset, &request.coord, sink).await?;
				if self.def.erode_mask {
					// The mask is warped at exactly 256x256 and eroded in
					// place; the outermost ring therefore erodes against the
					// tile border, not against neighbouring coverage. A warp
					// with a one-pixel margin would fix that.
					mask = erode(&mask, Norm::LInf, 1);
				}
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
				"artifact '{}' not served by tms-gdaldem",
				request.kind.as_str()
			))),
		}
	}

	fn url_template(&self) -> String {
		self.common.url_template("png", GENERATOR_REVISION)
	}

	fn boundlayer(&self) -> Option<serde_json::Value> {
		Some(self.common.boundlayer("png", GENERATOR_REVISION))
	}

	fn mapconfig(&self) -> serde_json::Value {
		self.common.mapconfig(&self.boundlayer().unwrap())
	}
}

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Tms,
		driver: "tms-gdaldem",
		needs_ranges: true,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<TmsGdaldemDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<TmsGdaldemDef>()
				.context("tms-gdaldem definition of unexpected type")?
				.clone();
			Ok(Arc::new(TmsGdaldemGenerator {
				common: TmsCommon::new(ctx),
				def,
			}))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::super::test_support::mock_context;
	use super::*;
	use crate::resource::{GeneratorRef, ResourceId};
	use cartolina_core::{LodRange, TileCoord, TileRange};
	use cartolina_warp::backend::mock::MockProfile;
	use cartolina_warp::dem::{DemAlgorithm, DemOptions};
	use cartolina_warp::types::Size;
	use std::path::PathBuf;

	fn generator(processing: DemAlgorithm) -> (Arc<dyn Generator>, tempfile::TempDir) {
		let mut resource = super::super::test_support::tms_resource("relief");
		resource.id = ResourceId::new("webmercator", "g", "relief");
		resource.gen = GeneratorRef::new(GeneratorKind::Tms, "tms-gdaldem");
		resource.lod_range = LodRange::new(0, 12).unwrap();
		resource.tile_range = TileRange::new(0, 0, 0, 0).unwrap();
		resource.definition = Arc::new(TmsGdaldemDef {
			dataset: PathBuf::from("terrain.dem"),
			processing,
			options: DemOptions::default(),
			mask: None,
			erode_mask: true,
		});
		let (ctx, backend, dir) = mock_context(resource);
		backend.register("terrain.dem", MockProfile::dem(Size::new(512, 512), 800.0));
		let generator = (factory().build)(ctx).unwrap();
		(generator, dir)
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn hillshade_tile_is_grayscale_png() -> Result<()> {
		let (generator, _dir) = generator(DemAlgorithm::Hillshade);
		let artifact = generator
			.generate(
				&TileRequest {
					coord: TileCoord::new(3, 4, 4).unwrap(),
					kind: ArtifactKind::Image(ImageFormat::Png),
					debug: false,
				},
				&Sink::new(),
			)
			.await?;

		assert_eq!(artifact.content_type, "image/png");
		let decoded = cartolina_image::decode(&artifact.body, ImageFormat::Png)?;
		assert_eq!(decoded.width(), 256);
		Ok(())
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn mask_is_eroded_but_nonempty() -> Result<()> {
		let (generator, _dir) = generator(DemAlgorithm::Slope);
		let artifact = generator
			.generate(
				&TileRequest {
					coord: TileCoord::new(2, 1, 1).unwrap(),
					kind: ArtifactKind::Mask,
					debug: false,
				},
				&Sink::new(),
			)
			.await?;
		let mask = cartolina_image::decode(&artifact.body, ImageFormat::Png)?.to_luma8();
		assert!(mask.pixels().any(|px| px.0[0] > 0));
		Ok(())
	}
}
