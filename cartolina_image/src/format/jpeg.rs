//! JPEG encoder/decoder utilities for `DynamicImage`.
//!
//! JPEG has no alpha channel; images with alpha are rejected so callers make
//! the drop explicit. Quality is fixed at 75 for every tile the server emits.

use anyhow::{Result, anyhow, bail};
use cartolina_core::Blob;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageEncoder, load_from_memory_with_format};

/// Hard-coded encoder quality for all JPEG tiles.
pub const JPEG_QUALITY: u8 = 75;

pub fn image2blob(image: &DynamicImage) -> Result<Blob> {
	if image.color().has_alpha() {
		bail!("jpeg does not support alpha channels");
	}

	let mut result: Vec<u8> = Vec::new();
	let encoder = JpegEncoder::new_with_quality(&mut result, JPEG_QUALITY);
	encoder.write_image(
		image.as_bytes(),
		image.width(),
		image.height(),
		image.color().into(),
	)?;
	Ok(Blob::from(result))
}

pub fn blob2image(blob: &Blob) -> Result<DynamicImage> {
	load_from_memory_with_format(blob.as_slice(), image::ImageFormat::Jpeg)
		.map_err(|e| anyhow!("failed to decode JPEG image: {e}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raster::tests::gradient_rgb;
	use cartolina_core::ImageFormat;

	#[test]
	fn roundtrip_rgb() -> Result<()> {
		let img = DynamicImage::ImageRgb8(gradient_rgb(64, 64));
		let blob = image2blob(&img)?;
		assert_eq!(ImageFormat::sniff(blob.as_slice())?, ImageFormat::Jpeg);

		let back = blob2image(&blob)?;
		assert_eq!(back.width(), 64);
		assert_eq!(back.height(), 64);
		Ok(())
	}

	#[test]
	fn rejects_alpha() {
		let img = DynamicImage::new_rgba8(4, 4);
		assert_eq!(
			image2blob(&img).unwrap_err().to_string(),
			"jpeg does not support alpha channels"
		);
	}
}
