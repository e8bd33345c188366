//! Tile producers: one generator per resource kind, each a function of
//! `(tile id, artifact kind)` to bytes. Producers share the gating sequence
//! (abort check, node validity, productivity, range) and the serialisation
//! helpers; the per-kind bodies live in the sibling modules.

pub mod geodata;
pub mod surface;
pub mod surface_dem;
pub mod surface_spheroid;
pub mod tms;
pub mod tms_gdaldem;
pub mod tms_normalmap;
pub mod tms_specular;

use crate::reference_frame::ReferenceFrame;
use crate::resource::{Resource, ResourceId};
use anyhow::Result;
use async_trait::async_trait;
use cartolina_core::{Blob, FileClass, ImageFormat, RegistrySnapshot, Sink, TileCoord, TileError};
use cartolina_index::TileIndex;
use cartolina_warp::backend::{RasterBackend, WarpParams};
use cartolina_warp::farm::Farm;
use cartolina_warp::types::{Resampling, Size};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;

/// Raster tiles are always 256×256.
pub const TILE_SIZE: u32 = 256;

/// What artifact a request asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
	Image(ImageFormat),
	Mask,
	Metatile,
	Mesh,
	Navtile,
	Normals,
	Geodata,
}

impl ArtifactKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ArtifactKind::Image(_) => "image",
			ArtifactKind::Mask => "mask",
			ArtifactKind::Metatile => "meta",
			ArtifactKind::Mesh => "mesh",
			ArtifactKind::Navtile => "navtile",
			ArtifactKind::Normals => "normals",
			ArtifactKind::Geodata => "geodata",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileRequest {
	pub coord: TileCoord,
	pub kind: ArtifactKind,
	/// Debug flavour: do not optimise empty tiles away, return a black tile
	/// instead.
	pub debug: bool,
}

/// One produced artifact, ready for the HTTP layer.
#[derive(Clone, Debug)]
pub struct TileArtifact {
	pub body: Blob,
	pub content_type: String,
	pub file_class: FileClass,
	/// Seconds; negative means no-cache.
	pub max_age: i64,
}

/// Everything a producer needs at construction time.
#[derive(Clone)]
pub struct GeneratorContext {
	pub resource: Resource,
	pub frame: ReferenceFrame,
	pub farm: Farm,
	pub backend: Arc<dyn RasterBackend>,
	pub registry: Arc<RegistrySnapshot>,
	pub store_root: PathBuf,
}

impl GeneratorContext {
	/// `<root>/<referenceFrame>/<iface>/<group>/<id>/`, where prepared state
	/// lives and survives restarts.
	pub fn storage_path(&self) -> PathBuf {
		self
			.store_root
			.join(&self.resource.id.reference_frame)
			.join(self.resource.gen.kind.interface())
			.join(&self.resource.id.group)
			.join(&self.resource.id.id)
	}

	/// Cache-busting query appended to tile URLs.
	pub fn url_query(&self, generator_revision: u32) -> String {
		format!("?gr={generator_revision}&r={}", self.resource.revision)
	}
}

/// A tile producer bound to one resource revision.
#[async_trait]
pub trait Generator: Send + Sync {
	fn resource(&self) -> &Resource;

	/// Bumped when the producer's own logic changes; appears as `gr=` in
	/// URLs.
	fn generator_revision(&self) -> u32 {
		0
	}

	/// Idempotent; drives preparation until ready. Runs on a background
	/// preparer task, never on a request thread.
	async fn prepare(&self, sink: &Sink) -> Result<()>;

	async fn generate(&self, request: &TileRequest, sink: &Sink) -> Result<TileArtifact>;

	/// Declarative dependency on other resources.
	fn needs_resources(&self) -> Vec<ResourceId> {
		Vec::new()
	}

	/// Tile URL template with `{lod}-{x}-{y}` placeholders and revision query.
	fn url_template(&self) -> String;

	/// `boundlayer.json` document, for bound-layer (tms) resources.
	fn boundlayer(&self) -> Option<serde_json::Value> {
		None
	}

	/// `mapconfig.json` document for this resource.
	fn mapconfig(&self) -> serde_json::Value;

	/// The delivery tile index, for resources that own one.
	fn tile_index(&self) -> Option<Arc<TileIndex>> {
		None
	}
}

// -- shared gating -----------------------------------------------------------

/// Outcome of the common gate sequence (§producers steps 2-4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Gate {
	Pass,
	/// Outside the frame's valid tree or the configured ranges.
	Invalid,
	/// Valid but carrying no data here.
	Unproductive,
}

pub(crate) fn check_gate(
	frame: &ReferenceFrame,
	resource: &Resource,
	index: Option<&TileIndex>,
	coord: &TileCoord,
) -> Gate {
	let node = frame.node(*coord);
	if !node.valid() {
		return Gate::Invalid;
	}
	if !resource.tile_range.is_empty() && !resource.tile_range.admits(&resource.lod_range, coord) {
		return Gate::Invalid;
	}
	let real = index.map_or(true, |index| index.is_real(coord));
	if !(node.productive() && real) {
		return Gate::Unproductive;
	}
	Gate::Pass
}

/// Maps an unproductive gate to the caller policy: a black tile in debug
/// flavour, otherwise the given logical-empty error.
pub(crate) fn unproductive_image(request: &TileRequest, settings_max_age: i64) -> Result<TileArtifact> {
	if request.debug {
		let black = DynamicImage::ImageRgb8(image::RgbImage::new(TILE_SIZE, TILE_SIZE));
		let format = match request.kind {
			ArtifactKind::Image(format) => format,
			_ => ImageFormat::Png,
		};
		return encode_image(&black, format, settings_max_age);
	}
	Err(TileError::EmptyImage.into())
}

/// 2D metatile: a grayscale raster of per-tile flags for the aligned
/// `2^order × 2^order` block (binary order 8, clamped at shallow lods).
/// With a tile index the quad-tree is rasterised (`0x80` mesh, `|0x40`
/// watertight); without one every in-range productive tile counts as
/// watertight geometry.
pub(crate) fn meta2d(
	frame: &ReferenceFrame,
	resource: &Resource,
	index: Option<&TileIndex>,
	coord: &TileCoord,
	max_age: i64,
) -> Result<TileArtifact> {
	let order = coord.lod.min(8);
	let edge = 1u32 << order;
	if coord.x % edge != 0 || coord.y % edge != 0 {
		return Err(TileError::not_found(format!("misaligned metatile id {coord}")));
	}

	let bitmap = if let Some(index) = index {
		let root = coord.at_lod(coord.lod - order);
		index.rasterize(&root, order, &|flags| {
			let mut value = 0u8;
			if flags.contains(cartolina_index::TileIndexFlag::Mesh) {
				value |= 0x80;
				if flags.contains(cartolina_index::TileIndexFlag::Watertight) {
					value |= 0x40;
				}
			}
			value
		})
	} else {
		let mut bitmap = vec![0u8; (edge * edge) as usize];
		for j in 0..edge {
			for i in 0..edge {
				let tile = TileCoord::new(coord.lod, coord.x + i, coord.y + j)?;
				if check_gate(frame, resource, None, &tile) == Gate::Pass {
					bitmap[(j * edge + i) as usize] = 0x80 | 0x40;
				}
			}
		}
		bitmap
	};

	let image = image::GrayImage::from_raw(edge, edge, bitmap)
		.ok_or_else(|| TileError::internal("metatile bitmap size mismatch"))?;
	encode_image(&DynamicImage::ImageLuma8(image), ImageFormat::Png, max_age)
}

// -- shared serialisation ----------------------------------------------------

pub(crate) fn encode_image(image: &DynamicImage, format: ImageFormat, max_age: i64) -> Result<TileArtifact> {
	let body = cartolina_image::encode(image, format)?;
	Ok(TileArtifact {
		body,
		content_type: format.content_type().to_string(),
		file_class: FileClass::Data,
		max_age,
	})
}

pub(crate) fn binary_artifact(body: Blob, content_type: &str, max_age: i64) -> TileArtifact {
	TileArtifact {
		body,
		content_type: content_type.to_string(),
		file_class: FileClass::Data,
		max_age,
	}
}

/// Warp parameters covering one tile at 256×256 in the frame's division SRS.
pub(crate) fn tile_warp_params(frame: &ReferenceFrame, coord: &TileCoord, resampling: Resampling) -> WarpParams {
	WarpParams {
		extent: frame.tile_extent(coord),
		dst_srs: frame.srs.clone(),
		size: Size::new(TILE_SIZE, TILE_SIZE),
		resampling,
	}
}

/// All registered producer factories, in registration order. Called once at
/// startup; pre-main registration is deliberately avoided.
pub fn all_factories() -> Vec<crate::registry::GeneratorFactory> {
	vec![
		tms::factory(),
		tms_gdaldem::factory(),
		tms_normalmap::factory(),
		tms_specular::factory(),
		surface_dem::factory(),
		surface_spheroid::factory(),
		geodata::factory(),
	]
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use crate::resource::{GeneratorKind, GeneratorRef, definitions::TmsRasterDef};
	use cartolina_core::{FileClassSettings, LodRange, RegistryPatch, TileRange};
	use cartolina_warp::backend::mock::MockBackend;
	use cartolina_warp::farm::FarmConfig;
	use std::collections::BTreeSet;

	pub fn mock_context(resource: Resource) -> (GeneratorContext, Arc<MockBackend>, tempfile::TempDir) {
		let backend = Arc::new(MockBackend::new());
		let farm = Farm::new(
			backend.clone(),
			FarmConfig {
				workers: 2,
				..FarmConfig::default()
			},
		);
		let dir = tempfile::tempdir().unwrap();
		let context = GeneratorContext {
			resource,
			frame: ReferenceFrame::builtin().remove("webmercator").unwrap(),
			farm,
			backend: backend.clone(),
			registry: Arc::new(RegistrySnapshot::default()),
			store_root: dir.path().to_path_buf(),
		};
		(context, backend, dir)
	}

	pub fn tms_resource(id: &str) -> Resource {
		Resource {
			id: ResourceId::new("webmercator", "g", id),
			gen: GeneratorRef::new(GeneratorKind::Tms, "tms-raster"),
			revision: 0,
			lod_range: LodRange::new(0, 18).unwrap(),
			tile_range: TileRange::new(0, 0, 0, 0).unwrap(),
			credits: BTreeSet::new(),
			registry: RegistryPatch::default(),
			file_class_settings: FileClassSettings::default(),
			comment: String::new(),
			definition: Arc::new(TmsRasterDef {
				dataset: std::path::PathBuf::from("ortho.tif"),
				..TmsRasterDef::default()
			}),
		}
	}
}
