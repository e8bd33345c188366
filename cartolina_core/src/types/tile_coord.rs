//! This module defines [`TileCoord`], the address of one tile in a reference
//! frame's quad-tree: a level of detail plus an (x, y) position. It includes
//! methods for walking the tree (parent, children), rescaling a coordinate to
//! another lod, and parsing the `<lod>-<x>-<y>` form used in tile URLs.
//!
//! # Examples
//!
//! ```
//! use cartolina_core::TileCoord;
//!
//! let coord = TileCoord::new(5, 6, 7).unwrap();
//! assert_eq!(coord.lod, 5);
//! assert_eq!(coord.parent().unwrap(), TileCoord::new(4, 3, 3).unwrap());
//! assert_eq!(coord.to_string(), "5-6-7");
//! ```

use anyhow::{Result, bail, ensure};
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

#[derive(Eq, PartialEq, Clone, Hash, Copy)]
pub struct TileCoord {
	pub lod: u8,
	pub x: u32,
	pub y: u32,
}

impl TileCoord {
	pub fn new(lod: u8, x: u32, y: u32) -> Result<TileCoord> {
		ensure!(lod <= 31, "lod ({lod}) must be <= 31");
		Ok(TileCoord { lod, x, y })
	}

	/// True iff (x, y) lies within the 2^lod × 2^lod grid of this lod.
	pub fn is_valid(&self) -> bool {
		if self.lod > 31 {
			return false;
		}
		let max = 1u32 << self.lod;
		(self.x < max) && (self.y < max)
	}

	pub fn parent(&self) -> Option<TileCoord> {
		if self.lod == 0 {
			return None;
		}
		Some(TileCoord {
			lod: self.lod - 1,
			x: self.x / 2,
			y: self.y / 2,
		})
	}

	/// Child `i` in row-major order: 0 = NW, 1 = NE, 2 = SW, 3 = SE.
	pub fn child(&self, i: u8) -> TileCoord {
		debug_assert!(i < 4);
		TileCoord {
			lod: self.lod + 1,
			x: self.x * 2 + u32::from(i & 1),
			y: self.y * 2 + u32::from(i >> 1),
		}
	}

	pub fn children(&self) -> [TileCoord; 4] {
		[self.child(0), self.child(1), self.child(2), self.child(3)]
	}

	/// Which child slot of its parent this tile occupies (row-major).
	pub fn child_index(&self) -> u8 {
		((self.y & 1) << 1) as u8 | (self.x & 1) as u8
	}

	/// Rescale this coordinate to another lod, truncating towards the
	/// covering ancestor when going up and taking the NW descendant when
	/// going down.
	pub fn at_lod(&self, lod: u8) -> TileCoord {
		if lod > self.lod {
			let scale = 1u32 << (lod - self.lod);
			TileCoord {
				lod,
				x: self.x * scale,
				y: self.y * scale,
			}
		} else if lod < self.lod {
			let scale = 1u32 << (self.lod - lod);
			TileCoord {
				lod,
				x: self.x / scale,
				y: self.y / scale,
			}
		} else {
			*self
		}
	}
}

impl Display for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}-{}", self.lod, self.x, self.y)
	}
}

impl Debug for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_fmt(format_args!("TileCoord({}, [{}, {}])", &self.lod, &self.x, &self.y))
	}
}

impl FromStr for TileCoord {
	type Err = anyhow::Error;

	/// Parses the `<lod>-<x>-<y>` form used in tile file names.
	fn from_str(s: &str) -> Result<TileCoord> {
		let parts: Vec<&str> = s.split('-').collect();
		if parts.len() != 3 {
			bail!("tile id '{s}' is not of the form <lod>-<x>-<y>");
		}
		TileCoord::new(parts[0].parse()?, parts[1].parse()?, parts[2].parse()?)
	}
}

impl PartialOrd for TileCoord {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TileCoord {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self
			.lod
			.cmp(&other.lod)
			.then(self.y.cmp(&other.y))
			.then(self.x.cmp(&other.x))
	}
}
