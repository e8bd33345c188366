//! Memory-mapped reader over the serialised quad-tree.

use crate::flags::byte_to_flags;
use crate::{FORMAT_VERSION, HEADER_LEN, MAGIC, TileIndexFlag, TileIndexFlags};
use anyhow::{Context, Result, bail, ensure};
use cartolina_core::TileCoord;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Read-only view of one published delivery index. The mmap stays valid even
/// if the file is replaced on disk; the next request opens the new file.
pub struct TileIndex {
	map: Mmap,
	root_offset: u32,
	path: PathBuf,
}

impl TileIndex {
	pub fn open(path: &Path) -> Result<TileIndex> {
		let file = File::open(path).with_context(|| format!("opening tile index {path:?}"))?;
		// Safety: the published file is never rewritten in place; revisions
		// are swapped in via rename, so this mapping stays stable.
		let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mmapping tile index {path:?}"))?;

		ensure!(map.len() >= HEADER_LEN, "tile index {path:?} is truncated");
		ensure!(&map[0..4] == MAGIC, "tile index {path:?} has a foreign magic");
		if map[4] != FORMAT_VERSION {
			bail!(
				"tile index {path:?} has format version {}, expected {FORMAT_VERSION}; rebuild the resource",
				map[4]
			);
		}

		let root_offset = u32::from_le_bytes(map[12..16].try_into().unwrap());
		ensure!(
			(HEADER_LEN + root_offset as usize) < map.len().max(HEADER_LEN + 1),
			"tile index {path:?} root offset out of range"
		);

		Ok(TileIndex {
			map,
			root_offset,
			path: path.to_path_buf(),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Flags of one tile, in O(lod). Absent tiles yield the empty set, except
	/// below a watertight leaf: a watertight node covers its whole subtree,
	/// so descendants inherit its flags.
	pub fn get(&self, coord: &TileCoord) -> TileIndexFlags {
		let mut offset = self.root_offset;
		for depth in (0..coord.lod).rev() {
			let ix = (coord.x >> depth) & 1;
			let iy = (coord.y >> depth) & 1;
			match self.child_offset(offset, (iy * 2 + ix) as u8) {
				Some(child) => offset = child,
				None => {
					let flags = self.node_flags(offset);
					if flags.contains(TileIndexFlag::Watertight) {
						return flags;
					}
					return TileIndexFlags::empty();
				}
			}
		}
		self.node_flags(offset)
	}

	/// True iff the tile carries geometry.
	pub fn is_real(&self, coord: &TileCoord) -> bool {
		self.get(coord).contains(TileIndexFlag::Mesh)
	}

	/// Rasterises the descendants of `root` at `root.lod + order` into a
	/// `2^order × 2^order` bitmap, row-major. Each cell receives
	/// `reduce(flags)` where `flags` is the OR over the cell tile's whole
	/// subtree; cells with no subtree stay zero.
	pub fn rasterize(&self, root: &TileCoord, order: u8, reduce: &dyn Fn(TileIndexFlags) -> u8) -> Vec<u8> {
		let edge = 1usize << order;
		let mut bitmap = vec![0u8; edge * edge];

		let mut offset = self.root_offset;
		for depth in (0..root.lod).rev() {
			let ix = (root.x >> depth) & 1;
			let iy = (root.y >> depth) & 1;
			match self.child_offset(offset, (iy * 2 + ix) as u8) {
				Some(child) => offset = child,
				None => {
					// below a watertight leaf the whole window is covered
					let flags = self.node_flags(offset);
					if flags.contains(TileIndexFlag::Watertight) {
						bitmap.fill(reduce(flags));
					}
					return bitmap;
				}
			}
		}
		self.stamp(offset, order, 0, 0, edge, &mut bitmap, reduce);
		bitmap
	}

	/// OR of the flags over the whole subtree of `coord`.
	pub fn subtree_flags(&self, coord: &TileCoord) -> TileIndexFlags {
		match self.descend(coord) {
			Some(offset) => self.subtree_or(offset),
			None => TileIndexFlags::empty(),
		}
	}

	// -- traversal over the raw node section --------------------------------

	fn descend(&self, coord: &TileCoord) -> Option<u32> {
		let mut offset = self.root_offset;
		for depth in (0..coord.lod).rev() {
			let ix = (coord.x >> depth) & 1;
			let iy = (coord.y >> depth) & 1;
			offset = self.child_offset(offset, (iy * 2 + ix) as u8)?;
		}
		Some(offset)
	}

	fn stamp(
		&self,
		offset: u32,
		depth: u8,
		x: usize,
		y: usize,
		edge: usize,
		bitmap: &mut [u8],
		reduce: &dyn Fn(TileIndexFlags) -> u8,
	) {
		if depth == 0 {
			bitmap[y * edge + x] = reduce(self.subtree_or(offset));
			return;
		}
		let half = 1usize << (depth - 1);
		let flags = self.node_flags(offset);
		for i in 0..4u8 {
			let cx = x + usize::from(i & 1) * half;
			let cy = y + usize::from(i >> 1) * half;
			if let Some(child) = self.child_offset(offset, i) {
				self.stamp(child, depth - 1, cx, cy, edge, bitmap, reduce);
			} else if flags.contains(TileIndexFlag::Watertight) {
				// a watertight node covers its whole subtree
				let value = reduce(flags);
				for fy in cy..cy + half {
					for fx in cx..cx + half {
						bitmap[fy * edge + fx] = value;
					}
				}
			}
		}
	}

	fn subtree_or(&self, offset: u32) -> TileIndexFlags {
		let mut flags = self.node_flags(offset);
		for i in 0..4u8 {
			if let Some(child) = self.child_offset(offset, i) {
				flags |= self.subtree_or(child);
			}
		}
		flags
	}

	fn node_flags(&self, offset: u32) -> TileIndexFlags {
		match self.map.get(HEADER_LEN + offset as usize) {
			Some(byte) => byte_to_flags(*byte),
			None => TileIndexFlags::empty(),
		}
	}

	/// Byte offset of child `i` (row-major) of the node at `offset`, if
	/// present.
	fn child_offset(&self, offset: u32, i: u8) -> Option<u32> {
		let base = HEADER_LEN + offset as usize;
		let child_mask = *self.map.get(base + 1)?;
		if child_mask & (1 << i) == 0 {
			return None;
		}
		// position of this child's offset among the present children
		let rank = (child_mask & ((1 << i) - 1)).count_ones() as usize;
		let at = base + 2 + rank * 4;
		let bytes = self.map.get(at..at + 4)?;
		Some(u32::from_le_bytes(bytes.try_into().unwrap()))
	}
}

impl std::fmt::Debug for TileIndex {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TileIndex").field("path", &self.path).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::TileIndexBuilder;
	use rstest::rstest;

	fn saved(builder: &TileIndexBuilder) -> (tempfile::TempDir, TileIndex) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("delivery.index");
		builder.save(&path).unwrap();
		(dir, TileIndex::open(&path).unwrap())
	}

	#[test]
	fn get_roundtrip() -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		builder.set(
			TileCoord::new(4, 5, 9)?,
			TileIndexFlag::Mesh | TileIndexFlag::Watertight,
		)?;
		builder.set(TileCoord::new(4, 5, 10)?, TileIndexFlag::Mesh.into())?;
		builder.set(TileCoord::new(2, 1, 2)?, TileIndexFlag::Navtile.into())?;

		let (_dir, index) = saved(&builder);

		assert_eq!(
			index.get(&TileCoord::new(4, 5, 9)?),
			TileIndexFlag::Mesh | TileIndexFlag::Watertight
		);
		assert!(index.is_real(&TileCoord::new(4, 5, 10)?));
		assert!(!index.is_real(&TileCoord::new(2, 1, 2)?));
		assert_eq!(index.get(&TileCoord::new(4, 6, 9)?), TileIndexFlags::empty());
		assert_eq!(index.get(&TileCoord::new(7, 0, 0)?), TileIndexFlags::empty());
		Ok(())
	}

	#[test]
	fn rejects_foreign_version() -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		builder.set(TileCoord::new(0, 0, 0)?, TileIndexFlag::Mesh.into())?;

		let dir = tempfile::tempdir()?;
		let path = dir.path().join("delivery.index");
		let mut bytes = builder.to_bytes();
		bytes[4] = 99;
		std::fs::write(&path, bytes)?;

		let err = TileIndex::open(&path).unwrap_err();
		assert!(err.to_string().contains("format version"));
		Ok(())
	}

	#[test]
	fn rasterize_stamps_subtree_or() -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		// flags live two levels below the rasterised lod
		builder.set(TileCoord::new(3, 0, 0)?, TileIndexFlag::Mesh.into())?;
		builder.set(
			TileCoord::new(3, 7, 7)?,
			TileIndexFlag::Mesh | TileIndexFlag::Watertight,
		)?;
		let (_dir, index) = saved(&builder);

		let reduce = |flags: TileIndexFlags| -> u8 {
			let mut value = 0;
			if flags.contains(TileIndexFlag::Mesh) {
				value |= 0x80;
			}
			if flags.contains(TileIndexFlag::Watertight) {
				value |= 0x40;
			}
			value
		};

		let bitmap = index.rasterize(&TileCoord::new(1, 1, 1)?, 2, &reduce);
		assert_eq!(bitmap.len(), 16);
		// (3,7,7) maps to cell (3,3) of the lod-3 window rooted at (1,1,1)
		assert_eq!(bitmap[15], 0xc0);
		assert_eq!(bitmap[0], 0x00);

		let bitmap = index.rasterize(&TileCoord::new(0, 0, 0)?, 1, &reduce);
		assert_eq!(bitmap, vec![0x80, 0, 0, 0xc0]);
		Ok(())
	}

	/// The rasterisation of a parent composes exactly from its four
	/// children's rasterisations arranged in quadrants.
	#[rstest]
	#[case(1)]
	#[case(2)]
	#[case(3)]
	fn rasterize_parent_child_consistency(#[case] order: u8) -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		for (lod, x, y) in [(4, 1, 2), (4, 9, 3), (4, 5, 13), (5, 30, 31), (3, 2, 2)] {
			builder.set(TileCoord::new(lod, x, y)?, TileIndexFlag::Mesh.into())?;
		}
		let (_dir, index) = saved(&builder);

		let reduce = |flags: TileIndexFlags| u8::from(flags.contains(TileIndexFlag::Mesh));
		let parent = TileCoord::new(1, 0, 1)?;
		let whole = index.rasterize(&parent, order, &reduce);

		let edge = 1usize << order;
		let half = edge / 2;
		for i in 0..4u8 {
			let part = index.rasterize(&parent.child(i), order - 1, &reduce);
			for y in 0..half {
				for x in 0..half {
					let px = x + usize::from(i & 1) * half;
					let py = y + usize::from(i >> 1) * half;
					assert_eq!(
						whole[py * edge + px],
						part[y * half + x],
						"mismatch at order {order}, child {i}, cell ({x}, {y})"
					);
				}
			}
		}
		Ok(())
	}

	#[test]
	fn watertight_nodes_cover_their_subtree() -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		builder.set(
			TileCoord::new(3, 2, 2)?,
			TileIndexFlag::Mesh | TileIndexFlag::Watertight | TileIndexFlag::Navtile,
		)?;
		builder.set(TileCoord::new(3, 5, 5)?, TileIndexFlag::Mesh.into())?;
		let (_dir, index) = saved(&builder);

		// descendants of the watertight node inherit its flags
		assert!(index.is_real(&TileCoord::new(6, 18, 17)?));
		assert!(index.get(&TileCoord::new(6, 18, 17)?).contains(TileIndexFlag::Navtile));
		// a mesh-only node does not propagate downwards
		assert!(!index.is_real(&TileCoord::new(6, 40, 40)?));

		// rasterising below the watertight leaf fills whole blocks
		let reduce = |flags: TileIndexFlags| u8::from(flags.contains(TileIndexFlag::Mesh));
		let bitmap = index.rasterize(&TileCoord::new(3, 2, 2)?, 2, &reduce);
		assert!(bitmap.iter().all(|&v| v == 1));
		Ok(())
	}

	#[test]
	fn empty_index_answers_empty() {
		let (_dir, index) = saved(&TileIndexBuilder::new());
		assert!(!index.is_real(&TileCoord::new(5, 1, 1).unwrap()));
		assert_eq!(index.subtree_flags(&TileCoord::new(0, 0, 0).unwrap()), TileIndexFlags::empty());
	}
}
