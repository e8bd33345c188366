//! `surface-spheroid`: a constant-zero surface over the reference spheroid.
//! Identical to `surface-dem` at serving time except every height is zero;
//! preparation warps nothing and only materialises the delivery index with
//! `mesh | watertight` everywhere in the productive subtree, plus `navtile`
//! up to the frame's navtile lod.

use super::surface::SurfaceCommon;
use super::{Generator, TileArtifact, TileRequest};
use crate::registry::GeneratorFactory;
use crate::resource::definitions::SurfaceSpheroidDef;
use crate::resource::{GeneratorKind, Resource};
use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use cartolina_core::{Sink, TileCoord, io::write_atomic};
use cartolina_index::{TileIndex, TileIndexBuilder, TileIndexFlag, TileIndexFlags};
use serde_json::json;
use std::sync::Arc;

const GENERATOR_REVISION: u32 = 1;

/// Explicit index nodes stop this many lods below the range top.
const INDEX_DEPTH: u8 = 6;

pub struct SurfaceSpheroidGenerator {
	common: SurfaceCommon,
}

#[async_trait]
impl Generator for SurfaceSpheroidGenerator {
	fn resource(&self) -> &Resource {
		&self.common.ctx.resource
	}

	fn generator_revision(&self) -> u32 {
		GENERATOR_REVISION
	}

	async fn prepare(&self, sink: &Sink) -> Result<()> {
		sink.check_aborted()?;
		let resource = &self.common.ctx.resource;
		let frame = &self.common.ctx.frame;
		let dir = self.common.ctx.storage_path();
		let index_path = dir.join("delivery.index");

		if index_path.exists() {
			if self.common.index.load().is_none() {
				self.common.index.store(Some(Arc::new(TileIndex::open(&index_path)?)));
			}
			return Ok(());
		}

		std::fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;

		let mut builder = TileIndexBuilder::new();
		let cap = resource.lod_range.max.min(resource.lod_range.min.saturating_add(INDEX_DEPTH));
		for lod in resource.lod_range.min..=cap {
			let range = resource.tile_range.at_lod(resource.lod_range.min, lod);
			for y in range.y_min..=range.y_max {
				for x in range.x_min..=range.x_max {
					let coord = TileCoord::new(lod, x, y)?;
					if !coord.is_valid() || !frame.node(coord).productive() {
						continue;
					}
					let mut flags: TileIndexFlags = TileIndexFlag::Mesh | TileIndexFlag::Watertight;
					if lod <= frame.navtile_lod {
						flags |= TileIndexFlag::Navtile;
					}
					builder.set(coord, flags)?;
				}
			}
		}
		ensure!(!builder.is_empty(), "configured ranges contain no productive tile");

		let conf = json!({
			"id": resource.full_id(),
			"referenceFrame": resource.id.reference_frame,
			"lodRange": [resource.lod_range.min, resource.lod_range.max],
			"tileRange": [
				[resource.tile_range.x_min, resource.tile_range.y_min],
				[resource.tile_range.x_max, resource.tile_range.y_max]
			],
			"revision": resource.revision,
			"credits": resource.credits.iter().collect::<Vec<_>>(),
			"indexDepth": INDEX_DEPTH,
		});
		write_atomic(&dir.join("tileset.conf"), &serde_json::to_vec_pretty(&conf)?)?;
		builder.save(&index_path)?;

		self.common.index.store(Some(Arc::new(TileIndex::open(&index_path)?)));
		log::info!("spheroid surface {} ready", resource.id);
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

pub fn factory() -> GeneratorFactory {
	GeneratorFactory {
		kind: GeneratorKind::Surface,
		driver: "surface-spheroid",
		needs_ranges: true,
		parse_definition: |value| Ok(Arc::new(serde_json::from_value::<SurfaceSpheroidDef>(value.clone())?)),
		build: |ctx| {
			let def = ctx
				.resource
				.definition
				.as_any()
				.downcast_ref::<SurfaceSpheroidDef>()
				.context("surface-spheroid definition of unexpected type")?
				.clone();
			let common = SurfaceCommon::new(ctx, None, def.samples_per_side, def.texture_layer_id.unwrap_or(0));
			Ok(Arc::new(SurfaceSpheroidGenerator { common }))
		},
	}
}
