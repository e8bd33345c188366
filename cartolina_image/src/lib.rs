//! Raster tile encoding for the cartolina server.
//!
//! Bridges the [`image`] crate's codecs and the [`Blob`] type handed to the
//! HTTP layer. Encoder settings are deliberately hard-coded: JPEG quality 75,
//! PNG best compression, WebP lossless (normal maps additionally swap to BGR
//! channel order before encoding).

pub mod format;
pub mod raster;

use anyhow::Result;
use cartolina_core::{Blob, ImageFormat};
use image::DynamicImage;

/// Encode `image` in the requested tile format with the server's settings.
pub fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Blob> {
	match format {
		ImageFormat::Jpeg => format::jpeg::image2blob(image),
		ImageFormat::Png => format::png::image2blob(image),
		ImageFormat::Webp => format::webp::image2blob(image),
	}
}

/// Decode a blob of the given format (used by tests and the debug endpoints).
pub fn decode(blob: &Blob, format: ImageFormat) -> Result<DynamicImage> {
	match format {
		ImageFormat::Jpeg => format::jpeg::blob2image(blob),
		ImageFormat::Png => format::png::blob2image(blob),
		ImageFormat::Webp => format::webp::blob2image(blob),
	}
}
