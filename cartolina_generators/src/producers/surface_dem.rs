//! `surface-dem`: a terrain tileset backed by a DEM.
//!
//! First use of a resource runs the preparation pipeline: a tiled VRT
//! overview pyramid with mask handling and the optional antimeridian wrap
//! halo, then the delivery tile index and `tileset.conf`, both published via
//! tmp + fsync + rename. A ready resource owns a delivery index covering
//! exactly the tiles flagged as real.

use super::surface::SurfaceCommon;
use super::{Generator, TileArtifact, TileRequest};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::SurfaceDemDef;
use crate::resource::{GeneratorKind, Resource};
use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use cartolina_core::{Sink, TileCoord, io::write_atomic};
use cartolina_index::{TileIndex, TileIndexBuilder, TileIndexFlag, TileIndexFlags};
use cartolina_warp::types::GeoExtent;
use cartolina_warp::vrt::{VrtBuilder, VrtConfig};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const GENERATOR_REVISION: u32 = 1;

/// Explicit index nodes stop this many lods below the range top; deeper
/// tiles inherit from their watertight ancestors.
const INDEX_DEPTH: u8 = 6;

pub struct SurfaceDemGenerator {
	common: SurfaceCommon,
	def: SurfaceDemDef,
}

impl SurfaceDemGenerator {
	fn index_lod_cap(&self) -> u8 {
		let lods = &self.common.ctx.resource.lod_range;
		lods.max.min(lods.min.saturating_add(INDEX_DEPTH))
	}

	/// Builds the in-memory delivery index from the dataset coverage.
	fn build_index(&self, dataset_extent: &GeoExtent) -> Result<TileIndexBuilder> {
		let resource = &self.common.ctx.resource;
		let frame = &self.common.ctx.frame;
		let mut builder = TileIndexBuilder::new();

		for lod in resource.lod_range.min..=self.index_lod_cap() {
			let range = resource.tile_range.at_lod(resource.lod_range.min, lod);
			for y in range.y_min..=range.y_max {
				for x in range.x_min..=range.x_max {
					let coord = TileCoord::new(lod, x, y)?;
					if !coord.is_valid() || !frame.node(coord).productive() {
						continue;
					}
					let extent = frame.tile_extent(&coord);
					if !intersects(&extent, dataset_extent) {
						continue;
					}
					let mut flags: TileIndexFlags = TileIndexFlag::Mesh.into();
					if contains(dataset_extent, &extent) {
						flags |= TileIndexFlag::Watertight;
					}
					if lod <= frame.navtile_lod {
						flags |= TileIndexFlag::Navtile;
					}
					builder.set(coord, flags)?;
				}
			}
		}
		ensure!(!builder.is_empty(), "dataset does not cover any tile of the configured ranges");
		Ok(builder)
	}

	fn tileset_conf(&self) -> serde_json::Value {
		let resource = &self.common.ctx.resource;
		json!({
			"id": resource.full_id(),
			"referenceFrame": resource.id.reference_frame,
			"lodRange": [resource.lod_range.min, resource.lod_range.max],
			"tileRange": [
				[resource.tile_range.x_min, resource.tile_range.y_min],
				[resource.tile_range.x_max, resource.tile_range.y_max]
			],
			"revision": resource.revision,
			"credits": resource.credits.iter().collect::<Vec<_>>(),
			"nominalTexelSize": self.def.nominal_texel_size,
			"mergeBottomLod": self.def.merge_bottom_lod,
			"indexDepth": INDEX_DEPTH,
		})
	}

	/// True when the published state on disk already belongs to this
	/// revision; preparing then only reopens the index (no writes, no
	/// fsync).
	fn already_prepared(&self, dir: &Path) -> bool {
		let conf_path = dir.join("tileset.conf");
		let index_path = dir.join("delivery.index");
		if !conf_path.exists() || !index_path.exists() {
			return false;
		}
		std::fs::read(&conf_path)
			.ok()
			.and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
			.and_then(|conf| conf["revision"].as_u64())
			.is_some_and(|revision| revision == u64::from(self.common.ctx.resource.revision))
	}
}

#[async_trait]
impl Generator for SurfaceDemGenerator {
	fn resource(&self) -> &Resource {
		&self.common.ctx.resource
	}

	fn generator_revision(&self) -> u32 {
		GENERATOR_REVISION
	}

	async fn prepare(&self, sink: &Sink) -> Result<()> {
		let dir = self.common.ctx.storage_path();
		let index_path = dir.join("delivery.index");

		if self.already_prepared(&dir) {
			if self.common.index.load().is_none() {
				self.common.index.store(Some(Arc::new(TileIndex::open(&index_path)?)));
			}
			log::debug!("surface {} already prepared", self.common.ctx.resource.id);
			return Ok(());
		}

		std::fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;
		log::info!("preparing surface {}", self.common.ctx.resource.id);

		// the VRT overview pyramid runs blocking and internally parallel
		let backend = self.common.ctx.backend.clone();
		let dataset = self.def.dataset.clone();
		let target = dir.clone();
		let config = VrtConfig {
			wrapx: self.def.wrapx,
			..VrtConfig::default()
		};
		let build_sink = sink.clone();
		tokio::task::spawn_blocking(move || {
			VrtBuilder::new(backend, config).build(&dataset, &target, &build_sink).map(|_| ())
		})
		.await
		.context("VRT build task failed")??;
		sink.check_aborted()?;

		// probe the dataset extent for coverage flags
		let backend = self.common.ctx.backend.clone();
		let dataset = self.def.dataset.clone();
		let info = tokio::task::spawn_blocking(move || backend.open(&dataset, &[]).map(|ds| ds.info().clone()))
			.await
			.context("dataset probe task failed")??;

		let builder = self.build_index(&info.extent)?;
		write_atomic(&dir.join("tileset.conf"), &serde_json::to_vec_pretty(&self.tileset_conf())?)?;
		builder.save(&index_path)?;

		self.common.index.store(Some(Arc::new(TileIndex::open(&index_path)?)));
		log::info!(
			"surface {} ready: {} indexed tiles",
			self.common.ctx.resource.id,
			builder.len()
		);
		Ok(())
	}

	async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact> {
		self.common.generate(request, sink).await
	}

	fn url_template(&self) -> String {
		self.common.url_template(GENERATOR_REVISION)
	}

	fn mapconfig(&self) -> serde_json::Value {
		self.common.mapconfig(GENERATOR_REVISION)
	}

	fn tile_index(&self) -> Option<Arc<TileIndex>> {
		self.common.index.load_full()
	}
}

fn intersects(a: &GeoExtent, b: &GeoExtent) -> bool {
	a.x_min < b.x_max && b.x_min < a.x_max && a.y_min < b.y_max && b.y_min < a.y_max
}

fn contains(outer: &GeoExtent, inner: &GeoExtent) -> bool {
	inner.x_min >= outer.x_min && inner.x_max <= outer.x_max && inner.y_min >= outer.y_min && inner.y_max <= outer.y_max
}

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Surface,
		driver: "surface-dem",
		needs_ranges: true,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<SurfaceDemDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<SurfaceDemDef>()
				.context("surface-dem definition of unexpected type")?
				.clone();
			let common = SurfaceCommon::new(
				ctx,
				Some(def.dataset.clone()),
				def.samples_per_side,
				def.texture_layer_id.unwrap_or(0),
			);
			Ok(Arc::new(SurfaceDemGenerator { common, def }))
		},
	}
}
