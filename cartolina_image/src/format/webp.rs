//! WebP encoder/decoder utilities for `DynamicImage`.
//!
//! Tiles use **lossless** WebP via `image::codecs::webp::WebPEncoder`.
//! Normal-map and specular tiles are encoded in BGR channel order, which the
//! decoding clients expect; [`image2blob_bgr`] performs the swap before
//! encoding. Lossy WebP (for plain imagery) goes through libwebp.

use anyhow::{Result, anyhow, bail};
use cartolina_core::Blob;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, load_from_memory_with_format};

/// Lossy quality used when a raster resource asks for lossy WebP imagery.
pub const WEBP_QUALITY: f32 = 90.0;

/// Lossless encode, channels as given.
pub fn image2blob(image: &DynamicImage) -> Result<Blob> {
	if (image.color().channel_count() != 3) && (image.color().channel_count() != 4) {
		bail!("webp only supports RGB or RGBA images");
	}

	let mut result: Vec<u8> = Vec::new();
	let encoder = WebPEncoder::new_lossless(&mut result);
	encoder.encode(
		image.as_bytes(),
		image.width(),
		image.height(),
		image.color().into(),
	)?;
	Ok(Blob::from(result))
}

/// Lossless encode with R and B swapped (BGR order inside an RGB container).
pub fn image2blob_bgr(image: &DynamicImage) -> Result<Blob> {
	let mut rgb = image.to_rgb8();
	for px in rgb.pixels_mut() {
		px.0.swap(0, 2);
	}
	image2blob(&DynamicImage::ImageRgb8(rgb))
}

/// Lossy encode through libwebp.
pub fn image2blob_lossy(image: &DynamicImage) -> Result<Blob> {
	let encoder = webp::Encoder::from_image(image).map_err(|e| anyhow!("{e}"))?;
	Ok(Blob::from(
		encoder
			.encode_simple(false, WEBP_QUALITY)
			.map_err(|e| anyhow!("{e:?}"))?
			.to_vec(),
	))
}

pub fn blob2image(blob: &Blob) -> Result<DynamicImage> {
	load_from_memory_with_format(blob.as_slice(), image::ImageFormat::WebP)
		.map_err(|e| anyhow!("failed to decode WebP image: {e}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raster::tests::gradient_rgb;
	use cartolina_core::ImageFormat;

	#[test]
	fn lossless_roundtrip() -> Result<()> {
		let img = DynamicImage::ImageRgb8(gradient_rgb(16, 16));
		let blob = image2blob(&img)?;
		assert_eq!(ImageFormat::sniff(blob.as_slice())?, ImageFormat::Webp);
		assert_eq!(blob2image(&blob)?.to_rgb8().as_raw(), img.to_rgb8().as_raw());
		Ok(())
	}

	#[test]
	fn bgr_swaps_channels() -> Result<()> {
		let mut img = image::RgbImage::new(2, 1);
		img.put_pixel(0, 0, image::Rgb([10, 20, 30]));
		img.put_pixel(1, 0, image::Rgb([1, 2, 3]));

		let blob = image2blob_bgr(&DynamicImage::ImageRgb8(img))?;
		let back = blob2image(&blob)?.to_rgb8();
		assert_eq!(back.get_pixel(0, 0).0, [30, 20, 10]);
		assert_eq!(back.get_pixel(1, 0).0, [3, 2, 1]);
		Ok(())
	}

	#[test]
	fn rejects_grayscale() {
		let img = DynamicImage::new_luma8(4, 4);
		assert_eq!(
			image2blob(&img).unwrap_err().to_string(),
			"webp only supports RGB or RGBA images"
		);
	}

	#[test]
	fn lossy_produces_webp() -> Result<()> {
		let img = DynamicImage::ImageRgb8(gradient_rgb(32, 32));
		let blob = image2blob_lossy(&img)?;
		assert_eq!(ImageFormat::sniff(blob.as_slice())?, ImageFormat::Webp);
		Ok(())
	}
}
