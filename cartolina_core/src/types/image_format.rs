//! Raster tile encodings and their HTTP content types.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Encoding of a raster tile body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
	Jpeg,
	Png,
	Webp,
}

impl ImageFormat {
	pub fn from_extension(ext: &str) -> Option<ImageFormat> {
		match ext {
			"jpg" | "jpeg" => Some(ImageFormat::Jpeg),
			"png" => Some(ImageFormat::Png),
			"webp" => Some(ImageFormat::Webp),
			_ => None,
		}
	}

	pub fn extension(&self) -> &'static str {
		match self {
			ImageFormat::Jpeg => "jpg",
			ImageFormat::Png => "png",
			ImageFormat::Webp => "webp",
		}
	}

	pub fn content_type(&self) -> &'static str {
		match self {
			ImageFormat::Jpeg => "image/jpeg",
			ImageFormat::Png => "image/png",
			ImageFormat::Webp => "image/webp",
		}
	}

	/// Sniffs the encoding from the body's magic bytes.
	pub fn sniff(bytes: &[u8]) -> Result<ImageFormat> {
		if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
			return Ok(ImageFormat::Jpeg);
		}
		if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
			return Ok(ImageFormat::Png);
		}
		if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
			return Ok(ImageFormat::Webp);
		}
		bail!("unrecognised image magic bytes");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("jpg", Some(ImageFormat::Jpeg))]
	#[case("jpeg", Some(ImageFormat::Jpeg))]
	#[case("png", Some(ImageFormat::Png))]
	#[case("webp", Some(ImageFormat::Webp))]
	#[case("gif", None)]
	fn extensions(#[case] ext: &str, #[case] expected: Option<ImageFormat>) {
		assert_eq!(ImageFormat::from_extension(ext), expected);
		if let Some(format) = expected {
			assert!(format.extension().starts_with(&ext[0..1]));
		}
	}

	#[test]
	fn sniffing() {
		assert_eq!(
			ImageFormat::sniff(&[0xff, 0xd8, 0xff, 0xe0]).unwrap(),
			ImageFormat::Jpeg
		);
		assert_eq!(
			ImageFormat::sniff(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a]).unwrap(),
			ImageFormat::Png
		);
		assert_eq!(
			ImageFormat::sniff(b"RIFF\x00\x00\x00\x00WEBPVP8L").unwrap(),
			ImageFormat::Webp
		);
		assert!(ImageFormat::sniff(b"GIF89a").is_err());
	}

	#[test]
	fn content_types() {
		assert_eq!(ImageFormat::Jpeg.content_type(), "image/jpeg");
		assert_eq!(ImageFormat::Png.content_type(), "image/png");
		assert_eq!(ImageFormat::Webp.content_type(), "image/webp");
	}
}
