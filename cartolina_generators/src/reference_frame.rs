//! Reference frames: a named tile grid over a spatial division SRS, with a
//! valid subtree and partial-node logic. Frames are data, not plug-ins; the
//! built-in set can be extended through the shared registry file.

use anyhow::{Result, ensure};
use cartolina_core::TileCoord;
use cartolina_warp::types::GeoExtent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Web-Mercator world half-size in meters.
const MERCATOR_HALF: f64 = 20_037_508.342789244;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceFrame {
	pub id: String,
	#[serde(default)]
	pub description: String,
	/// SRS of the spatial division (tile grid).
	pub srs: String,
	/// Physical SRS normals and meshes are expressed in.
	pub physical_srs: String,
	/// Extent of the single root tile.
	pub extent: GeoExtent,
	/// Deepest lod of the valid tree.
	pub max_lod: u8,
	/// Tiles must intersect this to be productive; defaults to `extent`.
	#[serde(default)]
	pub valid_extent: Option<GeoExtent>,
	/// Navtiles are generated up to this lod.
	#[serde(default = "default_navtile_lod")]
	pub navtile_lod: u8,
}

fn default_navtile_lod() -> u8 {
	10
}

impl ReferenceFrame {
	/// The built-in frame set.
	pub fn builtin() -> BTreeMap<String, ReferenceFrame> {
		let mut frames = BTreeMap::new();
		frames.insert(
			String::from("webmercator"),
			ReferenceFrame {
				id: String::from("webmercator"),
				description: String::from("Web Mercator (EPSG:3857), single-root quad-tree"),
				srs: String::from("EPSG:3857"),
				physical_srs: String::from("EPSG:4978"),
				extent: GeoExtent::new(-MERCATOR_HALF, -MERCATOR_HALF, MERCATOR_HALF, MERCATOR_HALF),
				max_lod: 24,
				valid_extent: None,
				navtile_lod: 10,
			},
		);
		frames
	}

	fn clip_extent(&self) -> GeoExtent {
		self.valid_extent.unwrap_or(self.extent)
	}

	/// Spatial extent of one tile in the division SRS.
	pub fn tile_extent(&self, coord: &TileCoord) -> GeoExtent {
		let tiles = f64::from(1u32 << coord.lod);
		let width = self.extent.width() / tiles;
		let height = self.extent.height() / tiles;
		GeoExtent::new(
			self.extent.x_min + width * f64::from(coord.x),
			self.extent.y_max - height * f64::from(coord.y + 1),
			self.extent.x_min + width * f64::from(coord.x + 1),
			self.extent.y_max - height * f64::from(coord.y),
		)
	}

	pub fn node(&self, coord: TileCoord) -> NodeInfo<'_> {
		NodeInfo { frame: self, coord }
	}
}

/// View of one tile within a reference frame's tree.
#[derive(Clone, Copy, Debug)]
pub struct NodeInfo<'a> {
	frame: &'a ReferenceFrame,
	coord: TileCoord,
}

impl NodeInfo<'_> {
	pub fn coord(&self) -> &TileCoord {
		&self.coord
	}

	pub fn extent(&self) -> GeoExtent {
		self.frame.tile_extent(&self.coord)
	}

	/// The tile exists in the frame's tree at all.
	pub fn valid(&self) -> bool {
		self.coord.is_valid() && self.coord.lod <= self.frame.max_lod
	}

	/// The tile can carry data: valid and intersecting the clip extent.
	pub fn productive(&self) -> bool {
		self.valid() && intersects(&self.extent(), &self.frame.clip_extent())
	}

	/// A partial node intersects the clip extent without being contained.
	pub fn partial(&self) -> bool {
		let clip = self.frame.clip_extent();
		let extent = self.extent();
		self.productive() && !contains(&clip, &extent)
	}

	/// Bitmask of productive children (bit `i` = row-major child `i`).
	pub fn children_mask(&self) -> u8 {
		let mut mask = 0u8;
		for i in 0..4 {
			if self.frame.node(self.coord.child(i)).productive() {
				mask |= 1 << i;
			}
		}
		mask
	}
}

fn intersects(a: &GeoExtent, b: &GeoExtent) -> bool {
	a.x_min < b.x_max && b.x_min < a.x_max && a.y_min < b.y_max && b.y_min < a.y_max
}

fn contains(outer: &GeoExtent, inner: &GeoExtent) -> bool {
	inner.x_min >= outer.x_min && inner.x_max <= outer.x_max && inner.y_min >= outer.y_min && inner.y_max <= outer.y_max
}

/// Resolves frames by name: user-supplied definitions first, then built-ins.
pub fn resolve_frame(name: &str, extra: &BTreeMap<String, ReferenceFrame>) -> Result<ReferenceFrame> {
	if let Some(frame) = extra.get(name) {
		return Ok(frame.clone());
	}
	let builtin = ReferenceFrame::builtin();
	ensure!(builtin.contains_key(name), "unknown reference frame '{name}'");
	Ok(builtin[name].clone())
}
