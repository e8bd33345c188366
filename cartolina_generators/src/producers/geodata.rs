//! `geodata`: vector data heightcoded against a DEM stack by the warper
//! farm, served as GeoJSON with Z coordinates plus a `freelayer.json`
//! document.

use super::{ArtifactKind, Gate, Generator, GeneratorContext, TileArtifact, TileRequest, check_gate};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::GeodataDef;
use crate::resource::{GeneratorKind, Resource, ResourceId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cartolina_core::{FileClass, Sink, TileError};
use cartolina_warp::backend::{HeightcodeConfig, WarpParams};
use cartolina_warp::farm::{Operation, WarpRequest};
use cartolina_warp::types::{Resampling, Size};
use serde_json::json;
use std::sync::Arc;

const GENERATOR_REVISION: u32 = 1;

pub struct GeodataGenerator {
	ctx: GeneratorContext,
	def: GeodataDef,
}

impl GeodataGenerator {
	fn heightcode_config(&self) -> HeightcodeConfig {
		HeightcodeConfig {
			only_missing_z: false,
			geoid_grid: self.def.geoid_grid.clone(),
			layers: self.def.layers.clone(),
		}
	}
}

#[async_trait]
impl Generator for GeodataGenerator {
	fn resource(&self) -> &Resource {
		&self.ctx.resource
	}

	fn generator_revision(&self) -> u32 {
		GENERATOR_REVISION
	}

	async fn prepare(&self, _sink: &Sink) -> Result<()> {
		let backend = self.ctx.backend.clone();
		let dem = self.def.dem.clone();
		tokio::task::spawn_blocking(move || backend.open(&dem, &[]).map(|_| ()))
			.await
			.context("DEM probe task failed")?
	}

	async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		sink.check_aborted()?;
		match request.kind {
			ArtifactKind::Geodata => {
				// monolithic flavour is addressed as tile 0-0-0; tiled
				// flavour gates like any other producer
				if request.coord.lod > 0 {
					match check_gate(&self.ctx.frame, &self.ctx.resource, None, &request.coord) {
						Gate::Pass => {}
						Gate::Invalid | Gate::Unproductive => {
							return Err(TileError::not_found(format!(
								"tile {} outside {}",
								request.coord, self.ctx.resource.id
							)));
						}
					}
				}

				let warp = WarpRequest {
					dataset: self.def.dataset.clone(),
					open_options: Vec::new(),
					params: WarpParams {
						extent: self.ctx.frame.tile_extent(&request.coord),
						dst_srs: self.ctx.frame.srs.clone(),
						size: Size::new(self.def.display_size, self.def.display_size),
						resampling: Resampling::Bilinear,
					},
					operation: Operation::Heightcode {
						dems: vec![self.def.dem.clone()],
						config: self.heightcode_config(),
					},
				};
				let body = self.ctx.farm.warp(warp, sink).await?.into_vector()?;
				Ok(TileArtifact {
					body,
					content_type: String::from("application/json; charset=utf-8"),
					file_class: FileClass::Data,
					max_age: self.ctx.resource.file_class_settings.max_age(FileClass::Data),
				})
			}
			_ => Err(TileError::not_found(format!(
				"artifact '{}' not served by geodata",
				request.kind.as_str()
			))),
		}
	}

	fn needs_resources(&self) -> Vec<ResourceId> {
		// the DEM is an external dataset, not a resource reference; nothing
		// to wait for
		Vec::new()
	}

	fn url_template(&self) -> String {
		format!(
			"{}/{}/{{lod}}-{{x}}-{{y}}.geo{}",
			self.ctx.resource.id.group,
			self.ctx.resource.id.id,
			self.ctx.url_query(GENERATOR_REVISION)
		)
	}

	fn boundlayer(&self) -> Option<serde_json::Value> {
		None
	}

	/// The free-layer document replaces boundlayer.json for geodata.
	fn mapconfig(&self) -> serde_json::Value {
		let resource = &self.ctx.resource;
		json!({
			"referenceFrame": resource.id.reference_frame,
			"freeLayers": {
				(resource.full_id()): {
					"type": "geodata",
					"url": self.url_template(),
					"displaySize": self.def.display_size,
					"style": self.def.style,
					"credits": resource.credits.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
				}
			},
		})
	}
}

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Geodata,
		driver: "geodata",
		needs_ranges: false,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<GeodataDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<GeodataDef>()
				.context("geodata definition of unexpected type")?
				.clone();
			Ok(Arc::new(GeodataGenerator { ctx, def }))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::super::test_support::{mock_context, tms_resource};
	use super::*;
	use crate::resource::GeneratorRef;
	use cartolina_core::{TileCoord, TileRange};
	use std::path::PathBuf;

	fn generator() -> (Arc<dyn Generator>, tempfile::TempDir) {
		let mut resource = tms_resource("roads");
		resource.gen = GeneratorRef::new(GeneratorKind::Geodata, "geodata");
		resource.tile_range = TileRange::empty();
		resource.definition = Arc::new(GeodataDef {
			dataset: PathBuf::from("roads.shp"),
			dem: PathBuf::from("terrain.dem"),
			geoid_grid: None,
			layers: vec![],
			display_size: 256,
			style: Some(String::from("style.json")),
		});
		let (ctx, _backend, dir) = mock_context(resource);
		let generator = (factory().build)(ctx).unwrap();
		(generator, dir)
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn heightcoded_geojson_roundtrip() -> Result<()> {
		let (generator, _dir) = generator();
		let artifact = generator
			.generate(
				&TileRequest {
					coord: TileCoord::new(0, 0, 0).unwrap(),
					kind: ArtifactKind::Geodata,
					debug: false,
				},
				&Sink::new(),
			)
			.await?;

		assert!(artifact.content_type.starts_with("application/json"));
		let parsed: serde_json::Value = serde_json::from_slice(artifact.body.as_slice())?;
		assert_eq!(parsed["type"], "FeatureCollection");
		// every coordinate triple carries a Z
		let coords = parsed["features"][0]["geometry"]["coordinates"].as_array().unwrap();
		assert_eq!(coords.len(), 3);
		Ok(())
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn freelayer_document_present() {
		let (generator, _dir) = generator();
		let mapconfig = generator.mapconfig();
		let layer = &mapconfig["freeLayers"]["g-roads"];
		assert_eq!(layer["type"], "geodata");
		assert_eq!(layer["style"], "style.json");
	}
}
