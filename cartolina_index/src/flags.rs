//! Per-tile flag bits stored in the delivery index.

use enumset::{EnumSet, EnumSetType};

/// 8-bit flag set attached to every indexed tile. A tile is *real* iff
/// [`TileIndexFlag::Mesh`] is set.
#[derive(EnumSetType, Debug)]
pub enum TileIndexFlag {
	Mesh,
	Watertight,
	Navtile,
	Atlas,
}

pub type TileIndexFlags = EnumSet<TileIndexFlag>;

pub(crate) fn flags_to_byte(flags: TileIndexFlags) -> u8 {
	flags.as_u8()
}

pub(crate) fn byte_to_flags(byte: u8) -> TileIndexFlags {
	TileIndexFlags::from_u8_truncated(byte)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn byte_roundtrip() {
		let flags = TileIndexFlag::Mesh | TileIndexFlag::Navtile;
		assert_eq!(byte_to_flags(flags_to_byte(flags)), flags);
		assert_eq!(byte_to_flags(0), TileIndexFlags::empty());
		// unknown high bits are dropped, not an error
		assert_eq!(byte_to_flags(0xf0 | flags_to_byte(flags)), flags);
	}
}
