//! Conversions between raw warp buffers and `DynamicImage`.

use anyhow::{Result, ensure};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

/// Interleaved 8-bit channels from a warp into an image. 1, 3 and 4 channel
/// layouts are supported.
pub fn image_from_channels(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<DynamicImage> {
	let expected = width as usize * height as usize * channels as usize;
	ensure!(
		data.len() == expected,
		"pixel buffer length mismatch: expected {expected}, got {}",
		data.len()
	);

	Ok(match channels {
		1 => DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, data).unwrap()),
		3 => DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).unwrap()),
		4 => DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, data).unwrap()),
		n => anyhow::bail!("unsupported channel count {n}"),
	})
}

/// Applies a single-channel coverage mask as the alpha channel: pixels where
/// the mask is zero become fully transparent.
pub fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> Result<DynamicImage> {
	ensure!(
		image.width() == mask.width() && image.height() == mask.height(),
		"mask size {}x{} does not match image size {}x{}",
		mask.width(),
		mask.height(),
		image.width(),
		image.height()
	);

	let mut rgba = image.to_rgba8();
	for (px, m) in rgba.pixels_mut().zip(mask.pixels()) {
		if m.0[0] == 0 {
			px.0[3] = 0;
		}
	}
	Ok(DynamicImage::ImageRgba8(rgba))
}

/// True iff the mask has no covered pixel at all.
pub fn mask_is_empty(mask: &GrayImage) -> bool {
	mask.pixels().all(|px| px.0[0] == 0)
}

#[cfg(test)]
pub mod tests {
	use super::*;

	/// Deterministic RGB gradient used across the codec tests.
	pub fn gradient_rgb(width: u32, height: u32) -> RgbImage {
		let mut img = RgbImage::new(width, height);
		for (x, y, px) in img.enumerate_pixels_mut() {
			*px = image::Rgb([
				(x * 255 / width.max(1)) as u8,
				(y * 255 / height.max(1)) as u8,
				128,
			]);
		}
		img
	}

	#[test]
	fn channels_roundtrip() -> Result<()> {
		let img = image_from_channels(2, 2, 3, vec![0; 12])?;
		assert_eq!(img.width(), 2);
		assert!(image_from_channels(2, 2, 3, vec![0; 11]).is_err());
		assert!(image_from_channels(2, 2, 2, vec![0; 8]).is_err());
		Ok(())
	}

	#[test]
	fn masking_clears_alpha() -> Result<()> {
		let img = DynamicImage::ImageRgb8(gradient_rgb(2, 2));
		let mut mask = GrayImage::new(2, 2);
		mask.put_pixel(0, 0, image::Luma([255]));

		let masked = apply_mask(&img, &mask)?.to_rgba8();
		assert_eq!(masked.get_pixel(0, 0).0[3], 255);
		assert_eq!(masked.get_pixel(1, 1).0[3], 0);

		assert!(!mask_is_empty(&mask));
		assert!(mask_is_empty(&GrayImage::new(2, 2)));
		Ok(())
	}
}
