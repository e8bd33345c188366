//! In-memory quad-tree builder and binary serialisation.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! [0..4)   magic "CTIX"
//! [4]      format version (u8)
//! [5]      reserved (u8, zero)
//! [6..8)   reserved (u16, zero)
//! [8..12)  node count (u32)
//! [12..16) root node byte offset, relative to the node section (u32)
//! [16..)   node section
//! ```
//!
//! Each node is `flags: u8, child_mask: u8` followed by one u32 offset per
//! set bit of `child_mask` (children in row-major order NW NE SW SE). Nodes
//! are written post-order so every child offset is known when its parent is
//! emitted; the root therefore sits last and is located via the header.

use crate::flags::flags_to_byte;
use crate::{FORMAT_VERSION, HEADER_LEN, MAGIC, TileIndexFlags};
use anyhow::{Result, ensure};
use byteorder::{LE, WriteBytesExt};
use cartolina_core::{TileCoord, io::write_atomic};
use std::path::Path;

#[derive(Default)]
struct Node {
	flags: TileIndexFlags,
	children: [Option<Box<Node>>; 4],
}

impl Node {
	fn is_empty(&self) -> bool {
		self.flags.is_empty() && self.children.iter().all(|c| c.is_none())
	}
}

/// Builds the quad-tree in memory; [`TileIndexBuilder::save`] publishes it
/// atomically.
#[derive(Default)]
pub struct TileIndexBuilder {
	root: Node,
	count: u32,
}

impl TileIndexBuilder {
	pub fn new() -> TileIndexBuilder {
		TileIndexBuilder::default()
	}

	/// Number of `set` calls that stored a non-empty flag set.
	pub fn len(&self) -> u32 {
		self.count
	}

	pub fn is_empty(&self) -> bool {
		self.count == 0
	}

	/// Sets (replaces) the flags of one tile. Intermediate nodes are created
	/// on demand and carry no flags of their own.
	pub fn set(&mut self, coord: TileCoord, flags: TileIndexFlags) -> Result<()> {
		ensure!(coord.is_valid(), "tile {coord} outside its lod grid");

		let mut node = &mut self.root;
		for depth in (0..coord.lod).rev() {
			let ix = ((coord.x >> depth) & 1) as usize;
			let iy = ((coord.y >> depth) & 1) as usize;
			node = node.children[iy * 2 + ix].get_or_insert_with(Box::default);
		}
		if node.flags.is_empty() && !flags.is_empty() {
			self.count += 1;
		}
		node.flags = flags;
		Ok(())
	}

	/// Serialises the tree into the wire format.
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut nodes: Vec<u8> = Vec::new();
		let root_offset = write_node(&self.root, &mut nodes);

		let mut out = Vec::with_capacity(HEADER_LEN + nodes.len());
		out.extend_from_slice(MAGIC);
		out.push(FORMAT_VERSION);
		out.push(0);
		out.write_u16::<LE>(0).unwrap();
		out.write_u32::<LE>(count_nodes(&self.root)).unwrap();
		out.write_u32::<LE>(root_offset).unwrap();
		out.extend_from_slice(&nodes);
		out
	}

	/// Writes the index to `path` via tmp + fsync + rename.
	pub fn save(&self, path: &Path) -> Result<()> {
		log::debug!("writing tile index with {} flagged tiles to {path:?}", self.count);
		write_atomic(path, &self.to_bytes())
	}
}

/// Emits `node`'s subtree post-order; returns the node's byte offset.
fn write_node(node: &Node, out: &mut Vec<u8>) -> u32 {
	let mut child_offsets: Vec<u32> = Vec::new();
	let mut child_mask = 0u8;
	for (i, child) in node.children.iter().enumerate() {
		if let Some(child) = child {
			if !child.is_empty() {
				child_mask |= 1 << i;
				child_offsets.push(write_node(child, out));
			}
		}
	}

	let offset = out.len() as u32;
	out.push(flags_to_byte(node.flags));
	out.push(child_mask);
	for child_offset in child_offsets {
		out.write_u32::<LE>(child_offset).unwrap();
	}
	offset
}

fn count_nodes(node: &Node) -> u32 {
	1 + node
		.children
		.iter()
		.flatten()
		.filter(|c| !c.is_empty())
		.map(|c| count_nodes(c))
		.sum::<u32>()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::TileIndexFlag;

	#[test]
	fn set_counts_and_replaces() -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		assert!(builder.is_empty());

		builder.set(TileCoord::new(3, 1, 2)?, TileIndexFlag::Mesh.into())?;
		builder.set(TileCoord::new(3, 1, 2)?, TileIndexFlag::Mesh | TileIndexFlag::Navtile)?;
		builder.set(TileCoord::new(0, 0, 0)?, TileIndexFlag::Watertight.into())?;
		assert_eq!(builder.len(), 2);

		assert!(builder.set(TileCoord::new(2, 4, 0)?, TileIndexFlag::Mesh.into()).is_err());
		Ok(())
	}

	#[test]
	fn serialised_header() -> Result<()> {
		let mut builder = TileIndexBuilder::new();
		builder.set(TileCoord::new(1, 0, 1)?, TileIndexFlag::Mesh.into())?;

		let bytes = builder.to_bytes();
		assert_eq!(&bytes[0..4], MAGIC);
		assert_eq!(bytes[4], FORMAT_VERSION);
		// root plus one child
		assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 2);
		Ok(())
	}
}
