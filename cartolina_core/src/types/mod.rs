mod blob;
mod file_class;
mod image_format;
mod tile_coord;
mod tile_range;

pub use blob::Blob;
pub use file_class::{FileClass, FileClassSettings};
pub use image_format::ImageFormat;
pub use tile_coord::TileCoord;
pub use tile_range::{LodRange, TileRange};
