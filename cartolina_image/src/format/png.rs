//! PNG encoder/decoder utilities for `DynamicImage`. Compression is fixed to
//! the strongest setting; PNG is the format of masks and debug artifacts
//! where fidelity beats speed.

use anyhow::{Result, anyhow};
use cartolina_core::Blob;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageEncoder, load_from_memory_with_format};

pub fn image2blob(image: &DynamicImage) -> Result<Blob> {
	let mut result: Vec<u8> = Vec::new();
	let encoder = PngEncoder::new_with_quality(&mut result, CompressionType::Best, FilterType::Adaptive);
	encoder.write_image(
		image.as_bytes(),
		image.width(),
		image.height(),
		image.color().into(),
	)?;
	Ok(Blob::from(result))
}

pub fn blob2image(blob: &Blob) -> Result<DynamicImage> {
	load_from_memory_with_format(blob.as_slice(), image::ImageFormat::Png)
		.map_err(|e| anyhow!("failed to decode PNG image: {e}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use cartolina_core::ImageFormat;
	use image::GenericImageView;

	#[test]
	fn roundtrip_is_lossless() -> Result<()> {
		let mut img = image::RgbaImage::new(8, 8);
		for (x, y, px) in img.enumerate_pixels_mut() {
			*px = image::Rgba([(x * 32) as u8, (y * 32) as u8, 128, 255 - (x * 16) as u8]);
		}
		let img = DynamicImage::ImageRgba8(img);

		let blob = image2blob(&img)?;
		assert_eq!(ImageFormat::sniff(blob.as_slice())?, ImageFormat::Png);

		let back = blob2image(&blob)?;
		assert_eq!(back.dimensions(), (8, 8));
		assert_eq!(back.to_rgba8().as_raw(), img.to_rgba8().as_raw());
		Ok(())
	}

	#[test]
	fn grayscale_masks_survive() -> Result<()> {
		let mut mask = image::GrayImage::new(4, 4);
		mask.put_pixel(1, 1, image::Luma([255]));
		let img = DynamicImage::ImageLuma8(mask);

		let back = blob2image(&image2blob(&img)?)?;
		assert_eq!(back.to_luma8().get_pixel(1, 1).0, [255]);
		assert_eq!(back.to_luma8().get_pixel(0, 0).0, [0]);
		Ok(())
	}
}
