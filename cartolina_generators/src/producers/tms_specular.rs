//! `tms-specular-map`: per-pixel specular reflectance derived from an
//! orthophoto and a landcover classification, quantised to a configured
//! number of shininess bits and encoded as lossless BGR WebP.

use super::tms::{Admission, TmsCommon};
use super::{ArtifactKind, Generator, TileArtifact, TileRequest, binary_artifact};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::TmsSpecularDef;
use crate::resource::{GeneratorKind, Resource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cartolina_core::{ImageFormat, Sink, TileError};
use cartolina_warp::farm::Operation;
use cartolina_warp::types::Resampling;
use image::{DynamicImage, RgbImage};
use std::sync::Arc;

const GENERATOR_REVISION: u32 = 1;

pub struct TmsSpecularGenerator {
	common: TmsCommon,
	def: TmsSpecularDef,
}

impl TmsSpecularGenerator {
	/// Quantisation step for the configured shininess depth.
	fn quantum(&self) -> u8 {
		let levels = 1u16 << self.def.shininess_bits.clamp(1, 8);
		(256 / levels) as u8
	}
}

#[async_trait]
impl Generator for TmsSpecularGenerator {
	fn resource(&self) -> &Resource {
		self.common.resource()
	}

	fn generator_revision(&self) -> u32 {
		GENERATOR_REVISION
	}

	async fn prepare(&self, _sink: &Sink) -> Result<()> {
		self.common.probe_dataset(&self.def.dataset).await?;
		if let Some(landcover) = &self.def.landcover {
			self.common.probe_dataset(landcover).await?;
		}
		Ok(())
	}

	async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		match request.kind {
			ArtifactKind::Image(_) => {
				if let Admission::Early(artifact) = self.common.admit(request, sink)? {
					return Ok(artifact);
				}
				let buf = self
					.common
					.warp_tile(&self.def.dataset, Operation::Image, Resampling::Cubic, &request.coord, sink)
					.await?;
				let pixels = buf.as_u8().context("orthophoto warp returned a non-byte buffer")?;
				let channels = buf.channels as usize;

				let shiny = if let Some(landcover) = &self.def.landcover {
					let classes = self
						.common
						.warp_tile(landcover, Operation::ImageNoExpand, Resampling::Nearest, &request.coord, sink)
						.await?;
					let data = classes.as_u8().context("landcover warp returned a non-byte buffer")?;
					let class_channels = classes.channels as usize;
					Some(
						data
							.chunks_exact(class_channels)
							.map(|px| self.def.shiny_classes.contains(&px[0]))
							.collect::<Vec<bool>>(),
					)
				} else {
					None
				};
				sink.check_aborted()?;

				let quantum = self.quantum().max(1);
				let mut image = RgbImage::new(buf.size.width, buf.size.height);
				for (i, px) in pixels.chunks_exact(channels).enumerate() {
					// Rec.601 luma as the base reflectance estimate
					let luma = (0.299 * f64::from(px[0]) + 0.587 * f64::from(px[1]) + 0.114 * f64::from(px[2])) as u8;
					let reflectance = if shiny.as_ref().is_some_and(|shiny| shiny[i]) {
						255
					} else {
						luma / 3
					};
					let quantised = (reflectance / quantum) * quantum;
					let x = i as u32 % buf.size.width;
					let y = i as u32 / buf.size.width;
					image.put_pixel(x, y, image::Rgb([quantised, quantised, quantised]));
				}

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
				let mask = self.common.warp_mask_image(&self.def.dataset, &request.coord, sink).await?;
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
				"artifact '{}' not served by tms-specular-map",
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

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Tms,
		driver: "tms-specular-map",
		needs_ranges: true,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<TmsSpecularDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<TmsSpecularDef>()
				.context("tms-specular-map definition of unexpected type")?
				.clone();
			Ok(Arc::new(TmsSpecularGenerator {
				common: TmsCommon::new(ctx),
				def,
			}))
		},
	}
}
