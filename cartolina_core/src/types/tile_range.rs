//! Integer lod intervals and (x, y) tile rectangles in reference-frame
//! coordinates. A resource's `tile_range` is expressed at `lod_range.min` and
//! is rescaled to deeper lods by doubling.

use crate::TileCoord;
use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Closed interval of levels of detail.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LodRange {
	pub min: u8,
	pub max: u8,
}

impl LodRange {
	pub fn new(min: u8, max: u8) -> Result<LodRange> {
		ensure!(min <= max, "lod range [{min}, {max}] is inverted");
		Ok(LodRange { min, max })
	}

	pub fn contains(&self, lod: u8) -> bool {
		lod >= self.min && lod <= self.max
	}
}

impl Debug for LodRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "LodRange[{}, {}]", self.min, self.max)
	}
}

/// Inclusive rectangle of tile columns/rows, expressed at some anchor lod.
///
/// An empty range (no tiles) is representable; drivers that need no ranges
/// use [`TileRange::empty`].
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
	pub x_min: u32,
	pub y_min: u32,
	pub x_max: u32,
	pub y_max: u32,
}

impl TileRange {
	pub fn new(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Result<TileRange> {
		ensure!(
			x_min <= x_max && y_min <= y_max,
			"tile range [[{x_min}, {y_min}], [{x_max}, {y_max}]] is inverted"
		);
		Ok(TileRange {
			x_min,
			y_min,
			x_max,
			y_max,
		})
	}

	/// The canonical empty range. `contains` is always false on it.
	pub fn empty() -> TileRange {
		TileRange {
			x_min: 1,
			y_min: 1,
			x_max: 0,
			y_max: 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.x_min > self.x_max || self.y_min > self.y_max
	}

	pub fn contains(&self, x: u32, y: u32) -> bool {
		!self.is_empty() && x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
	}

	/// Rescale a range anchored at `from` lod to `to` lod. Going deeper each
	/// tile becomes a 2×2 block; going shallower the range shrinks to the
	/// covering ancestors.
	pub fn at_lod(&self, from: u8, to: u8) -> TileRange {
		if self.is_empty() || from == to {
			return *self;
		}
		if to > from {
			let scale = 1u32 << (to - from);
			TileRange {
				x_min: self.x_min * scale,
				y_min: self.y_min * scale,
				x_max: (self.x_max + 1) * scale - 1,
				y_max: (self.y_max + 1) * scale - 1,
			}
		} else {
			let scale = 1u32 << (from - to);
			TileRange {
				x_min: self.x_min / scale,
				y_min: self.y_min / scale,
				x_max: self.x_max / scale,
				y_max: self.y_max / scale,
			}
		}
	}

	/// Gate of §"range": lod within `lods`, (x, y) within this range shifted
	/// from its anchor at `lods.min` to the request lod.
	pub fn admits(&self, lods: &LodRange, coord: &TileCoord) -> bool {
		lods.contains(coord.lod) && self.at_lod(lods.min, coord.lod).contains(coord.x, coord.y)
	}

	pub fn corners(&self) -> [(u32, u32); 4] {
		[
			(self.x_min, self.y_min),
			(self.x_max, self.y_min),
			(self.x_min, self.y_max),
			(self.x_max, self.y_max),
		]
	}
}

impl Debug for TileRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_empty() {
			write!(f, "TileRange[empty]")
		} else {
			write!(
				f,
				"TileRange[[{}, {}], [{}, {}]]",
				self.x_min, self.y_min, self.x_max, self.y_max
			)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lod_range_contains() {
		let lods = LodRange::new(3, 7).unwrap();
		assert!(!lods.contains(2));
		assert!(lods.contains(3));
		assert!(lods.contains(7));
		assert!(!lods.contains(8));
		assert!(LodRange::new(5, 3).is_err());
	}

	#[test]
	fn empty_range_admits_nothing() {
		let range = TileRange::empty();
		assert!(range.is_empty());
		assert!(!range.contains(0, 0));
		assert_eq!(range.at_lod(0, 5), range);
	}

	#[test]
	fn at_lod_scales_both_ways() {
		let range = TileRange::new(1, 2, 3, 4).unwrap();
		assert_eq!(range.at_lod(5, 7), TileRange::new(4, 8, 15, 19).unwrap());
		assert_eq!(range.at_lod(5, 4), TileRange::new(0, 1, 1, 2).unwrap());
		assert_eq!(range.at_lod(5, 5), range);
	}

	#[test]
	fn admits_shifts_from_anchor() {
		let lods = LodRange::new(4, 6).unwrap();
		let range = TileRange::new(2, 2, 3, 3).unwrap();

		// anchor lod
		assert!(range.admits(&lods, &TileCoord::new(4, 2, 3).unwrap()));
		assert!(!range.admits(&lods, &TileCoord::new(4, 4, 2).unwrap()));

		// two levels deeper the rectangle is 4x wider
		assert!(range.admits(&lods, &TileCoord::new(6, 8, 15).unwrap()));
		assert!(!range.admits(&lods, &TileCoord::new(6, 16, 8).unwrap()));

		// outside the lod interval
		assert!(!range.admits(&lods, &TileCoord::new(3, 1, 1).unwrap()));
		assert!(!range.admits(&lods, &TileCoord::new(7, 16, 16).unwrap()));
	}

	#[test]
	fn corners_cover_extremes() {
		let range = TileRange::new(1, 2, 3, 4).unwrap();
		let corners = range.corners();
		for (x, y) in corners {
			assert!(range.contains(x, y));
		}
		assert_eq!(corners[0], (1, 2));
		assert_eq!(corners[3], (3, 4));
	}
}
