//! In-memory model of a GDAL VRT document and its XML serialisation.
//!
//! The builder keeps every level's model around while the pyramid grows, so
//! cross-linking an `<Overview>` into the parent level is an in-memory append
//! followed by a rewrite; nothing ever parses XML back.

use crate::types::{PixelType, Size};
use anyhow::{Context, Result};
use quick_xml::Writer;
use quick_xml::events::BytesText;
use std::io::Cursor;
use std::path::Path;

/// Pixel-space rectangle used by `SrcRect`/`DstRect` (GDAL uses doubles).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelRect {
	pub x_off: f64,
	pub y_off: f64,
	pub x_size: f64,
	pub y_size: f64,
}

impl PixelRect {
	pub fn new(x_off: f64, y_off: f64, x_size: f64, y_size: f64) -> PixelRect {
		PixelRect {
			x_off,
			y_off,
			x_size,
			y_size,
		}
	}
}

/// Which band of the source file a `SimpleSource` reads.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceBandRef {
	Band(u8),
	/// The mask of the given band, spelled `mask,<band>` in the VRT.
	Mask(u8),
}

impl SourceBandRef {
	fn spelling(&self) -> String {
		match self {
			SourceBandRef::Band(band) => band.to_string(),
			SourceBandRef::Mask(band) => format!("mask,{band}"),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceProperties {
	pub size: Size,
	pub data_type: PixelType,
	pub block: Size,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimpleSource {
	pub filename: String,
	pub relative: bool,
	pub shared: bool,
	pub source_band: SourceBandRef,
	pub src_rect: PixelRect,
	pub dst_rect: PixelRect,
	pub source_properties: Option<SourceProperties>,
}

/// `<Overview>` cross-link appended to a band once the next level exists.
#[derive(Clone, Debug, PartialEq)]
pub struct OverviewRef {
	pub filename: String,
	pub relative: bool,
	pub band: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VrtRasterBand {
	pub band: u8,
	pub data_type: PixelType,
	pub color_interp: Option<String>,
	pub nodata: Option<f64>,
	pub sources: Vec<SimpleSource>,
	pub overviews: Vec<OverviewRef>,
}

impl VrtRasterBand {
	pub fn new(band: u8, data_type: PixelType) -> VrtRasterBand {
		VrtRasterBand {
			band,
			data_type,
			color_interp: None,
			nodata: None,
			sources: Vec::new(),
			overviews: Vec::new(),
		}
	}
}

/// Per-dataset mask band: a sourced Byte band inside `<MaskBand>`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VrtMaskBand {
	pub sources: Vec<SimpleSource>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VrtDataset {
	pub size: Size,
	pub srs: String,
	pub geo_transform: [f64; 6],
	pub bands: Vec<VrtRasterBand>,
	pub mask_band: Option<VrtMaskBand>,
}

impl VrtDataset {
	pub fn new(size: Size, srs: String, geo_transform: [f64; 6]) -> VrtDataset {
		VrtDataset {
			size,
			srs,
			geo_transform,
			bands: Vec::new(),
			mask_band: None,
		}
	}

	/// Appends an overview reference to every band.
	pub fn add_overview(&mut self, filename: &str, relative: bool) {
		for band in &mut self.bands {
			band.overviews.push(OverviewRef {
				filename: filename.to_string(),
				relative,
				band: band.band,
			});
		}
	}

	pub fn to_xml(&self) -> Result<String> {
		let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
		self.write_dataset(&mut writer)?;
		let bytes = writer.into_inner().into_inner();
		Ok(String::from_utf8(bytes).context("VRT serialisation produced invalid UTF-8")?)
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		let xml = self.to_xml()?;
		std::fs::write(path, xml).with_context(|| format!("writing VRT {path:?}"))
	}

	fn write_dataset(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<()> {
		writer
			.create_element("VRTDataset")
			.with_attribute(("rasterXSize", self.size.width.to_string().as_str()))
			.with_attribute(("rasterYSize", self.size.height.to_string().as_str()))
			.write_inner_content(|writer| {
				writer
					.create_element("SRS")
					.write_text_content(BytesText::new(&self.srs))?;

				let gt = self
					.geo_transform
					.iter()
					.map(|v| format!("{v:.16e}"))
					.collect::<Vec<_>>()
					.join(", ");
				writer
					.create_element("GeoTransform")
					.write_text_content(BytesText::new(&gt))?;

				for band in &self.bands {
					write_band(writer, band)?;
				}

				if let Some(mask) = &self.mask_band {
					writer.create_element("MaskBand").write_inner_content(|writer| {
						writer
							.create_element("VRTRasterBand")
							.with_attribute(("dataType", "Byte"))
							.with_attribute(("subClass", "VRTSourcedRasterBand"))
							.write_inner_content(|writer| {
								for source in &mask.sources {
									write_source(writer, source)?;
								}
								Ok(())
							})?;
						Ok(())
					})?;
				}
				Ok(())
			})?;
		Ok(())
	}
}

fn write_band(writer: &mut Writer<Cursor<Vec<u8>>>, band: &VrtRasterBand) -> std::io::Result<()> {
	writer
		.create_element("VRTRasterBand")
		.with_attribute(("dataType", band.data_type.gdal_name()))
		.with_attribute(("band", band.band.to_string().as_str()))
		.write_inner_content(|writer| {
			if let Some(interp) = &band.color_interp {
				writer
					.create_element("ColorInterp")
					.write_text_content(BytesText::new(interp))?;
			}
			if let Some(nodata) = band.nodata {
				writer
					.create_element("NoDataValue")
					.write_text_content(BytesText::new(&nodata.to_string()))?;
			}
			for source in &band.sources {
				write_source(writer, source)?;
			}
			for overview in &band.overviews {
				writer.create_element("Overview").write_inner_content(|writer| {
					writer
						.create_element("SourceFilename")
						.with_attribute(("relativeToVRT", bool_attr(overview.relative)))
						.write_text_content(BytesText::new(&overview.filename))?;
					writer
						.create_element("SourceBand")
						.write_text_content(BytesText::new(&overview.band.to_string()))?;
					Ok(())
				})?;
			}
			Ok(())
		})?;
	Ok(())
}

fn write_source(writer: &mut Writer<Cursor<Vec<u8>>>, source: &SimpleSource) -> std::io::Result<()> {
	writer.create_element("SimpleSource").write_inner_content(|writer| {
		writer
			.create_element("SourceFilename")
			.with_attribute(("relativeToVRT", bool_attr(source.relative)))
			.with_attribute(("shared", bool_attr(source.shared)))
			.write_text_content(BytesText::new(&source.filename))?;
		writer
			.create_element("SourceBand")
			.write_text_content(BytesText::new(&source.source_band.spelling()))?;
		if let Some(props) = &source.source_properties {
			writer
				.create_element("SourceProperties")
				.with_attribute(("RasterXSize", props.size.width.to_string().as_str()))
				.with_attribute(("RasterYSize", props.size.height.to_string().as_str()))
				.with_attribute(("DataType", props.data_type.gdal_name()))
				.with_attribute(("BlockXSize", props.block.width.to_string().as_str()))
				.with_attribute(("BlockYSize", props.block.height.to_string().as_str()))
				.write_empty()?;
		}
		write_rect(writer, "SrcRect", &source.src_rect)?;
		write_rect(writer, "DstRect", &source.dst_rect)?;
		Ok(())
	})?;
	Ok(())
}

fn write_rect(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, rect: &PixelRect) -> std::io::Result<()> {
	writer
		.create_element(name)
		.with_attribute(("xOff", trim_float(rect.x_off).as_str()))
		.with_attribute(("yOff", trim_float(rect.y_off).as_str()))
		.with_attribute(("xSize", trim_float(rect.x_size).as_str()))
		.with_attribute(("ySize", trim_float(rect.y_size).as_str()))
		.write_empty()?;
	Ok(())
}

fn bool_attr(value: bool) -> &'static str {
	if value { "1" } else { "0" }
}

fn trim_float(value: f64) -> String {
	if (value.fract()).abs() < f64::EPSILON {
		format!("{value:.0}")
	} else {
		format!("{value}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_dataset() -> VrtDataset {
		let mut dataset = VrtDataset::new(
			Size::new(512, 256),
			String::from("EPSG:3857"),
			[-100.0, 0.5, 0.0, 50.0, 0.0, -0.5],
		);
		let mut band = VrtRasterBand::new(1, PixelType::U8);
		band.color_interp = Some(String::from("Red"));
		band.sources.push(SimpleSource {
			filename: String::from("tile-0-0.tif"),
			relative: true,
			shared: false,
			source_band: SourceBandRef::Band(1),
			src_rect: PixelRect::new(0.0, 0.0, 256.0, 256.0),
			dst_rect: PixelRect::new(0.0, 0.0, 256.0, 256.0),
			source_properties: Some(SourceProperties {
				size: Size::new(256, 256),
				data_type: PixelType::U8,
				block: Size::new(256, 256),
			}),
		});
		dataset.bands.push(band);
		dataset
	}

	#[test]
	fn serialises_expected_elements() -> Result<()> {
		let xml = sample_dataset().to_xml()?;

		assert!(xml.contains(r#"<VRTDataset rasterXSize="512" rasterYSize="256">"#));
		assert!(xml.contains("<SRS>EPSG:3857</SRS>"));
		assert!(xml.contains("<GeoTransform>"));
		assert!(xml.contains(r#"<VRTRasterBand dataType="Byte" band="1">"#));
		assert!(xml.contains("<ColorInterp>Red</ColorInterp>"));
		assert!(xml.contains(r#"<SourceFilename relativeToVRT="1" shared="0">tile-0-0.tif</SourceFilename>"#));
		assert!(xml.contains("<SourceBand>1</SourceBand>"));
		assert!(xml.contains(r#"<SrcRect xOff="0" yOff="0" xSize="256" ySize="256"/>"#));
		assert!(xml.contains(r#"<SourceProperties RasterXSize="256" RasterYSize="256" DataType="Byte" BlockXSize="256" BlockYSize="256"/>"#));
		Ok(())
	}

	#[test]
	fn overview_crosslink_lands_on_every_band() -> Result<()> {
		let mut dataset = sample_dataset();
		dataset.bands.push(VrtRasterBand::new(2, PixelType::U8));
		dataset.add_overview("../1/ovr.vrt", true);

		let xml = dataset.to_xml()?;
		assert_eq!(xml.matches("<Overview>").count(), 2);
		assert!(xml.contains(r#"<SourceFilename relativeToVRT="1">../1/ovr.vrt</SourceFilename>"#));
		Ok(())
	}

	#[test]
	fn mask_band_uses_sourced_subclass() -> Result<()> {
		let mut dataset = sample_dataset();
		dataset.mask_band = Some(VrtMaskBand {
			sources: vec![SimpleSource {
				filename: String::from("tile-0-0.tif"),
				relative: true,
				shared: false,
				source_band: SourceBandRef::Mask(1),
				src_rect: PixelRect::new(0.0, 0.0, 256.0, 256.0),
				dst_rect: PixelRect::new(0.0, 0.0, 256.0, 256.0),
				source_properties: None,
			}],
		});

		let xml = dataset.to_xml()?;
		assert!(xml.contains("<MaskBand>"));
		assert!(xml.contains(r#"subClass="VRTSourcedRasterBand""#));
		assert!(xml.contains("<SourceBand>mask,1</SourceBand>"));
		Ok(())
	}

	#[test]
	fn save_writes_file() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("ovr.vrt");
		sample_dataset().save(&path)?;
		let text = std::fs::read_to_string(&path)?;
		assert!(text.starts_with("<VRTDataset"));
		Ok(())
	}
}
