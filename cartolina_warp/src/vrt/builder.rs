//! Builds a pyramid of tiled VRT overview datasets on disk.
//!
//! Each level halves the previous one (round to nearest) until both
//! dimensions drop below `min_ovr_size`. With `wrapx` configured, level `i`
//! grows by `3·2^i` pixels per side in x (the worst-case Lanczos kernel
//! footprint at the bottom, doubled at every level up) and tile warps whose
//! extent overhangs the dataset's x range read physically duplicated pixels
//! from the far side, so filter kernels never convolve over nodata at the
//! antimeridian.
//!
//! Any I/O or warp failure aborts the whole build; partial output stays on
//! disk and is recovered by re-running the preparation.

use super::model::{
	PixelRect, SimpleSource, SourceBandRef, SourceProperties, VrtDataset, VrtMaskBand, VrtRasterBand,
};
use crate::backend::{DatasetInfo, GeoDataset, RasterBackend, WarpParams};
use crate::types::{Color, GeoExtent, PixelData, RasterBuf, Resampling, Size};
use anyhow::{Context, Result, bail, ensure};
use cartolina_core::Sink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How `dataset.vrt` refers to the original dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathMode {
	#[default]
	Absolute,
	Relative,
	Symlink,
	Copy,
}

#[derive(Clone, Debug)]
pub struct VrtConfig {
	/// Stop generating levels once both dimensions fall below this.
	pub min_ovr_size: Size,
	pub tile_size: Size,
	/// Enables the x-wrap halo; the value adds to the 3 px kernel base.
	pub wrapx: Option<u32>,
	/// Background colour for empty-tile elimination and gap fill.
	pub background: Option<Color>,
	pub resampling: Resampling,
	pub nodata: Option<f64>,
	pub path_mode: PathMode,
	/// Bound on the per-level tile parallelism.
	pub parallelism: usize,
}

impl Default for VrtConfig {
	fn default() -> VrtConfig {
		VrtConfig {
			min_ovr_size: Size::new(256, 256),
			tile_size: Size::new(1024, 1024),
			wrapx: None,
			background: None,
			resampling: Resampling::default(),
			nodata: None,
			path_mode: PathMode::default(),
			parallelism: num_cpus::get().max(1),
		}
	}
}

/// One built level of the pyramid.
#[derive(Clone, Debug)]
pub struct LevelInfo {
	pub index: usize,
	/// Nominal size, without the wrap halo.
	pub size: Size,
	/// Halo width per x side, in this level's pixels.
	pub halo: u32,
	/// Full raster size including the halo.
	pub raster_size: Size,
	/// Georeferenced extent including the halo.
	pub extent: GeoExtent,
	pub path: PathBuf,
	pub tiles_written: usize,
	pub tiles_total: usize,
}

#[derive(Debug)]
pub struct VrtPyramid {
	pub dataset_vrt: PathBuf,
	pub levels: Vec<LevelInfo>,
}

pub struct VrtBuilder {
	backend: Arc<dyn RasterBackend>,
	config: VrtConfig,
}

/// Record of one non-empty tile, produced by the parallel warp stage.
struct TileRecord {
	filename: String,
	size: Size,
	dst: PixelRect,
}

impl VrtBuilder {
	pub fn new(backend: Arc<dyn RasterBackend>, config: VrtConfig) -> VrtBuilder {
		VrtBuilder { backend, config }
	}

	/// Per-side x halo of level `index`, in that level's pixels.
	pub fn halo_px(&self, index: usize) -> u32 {
		self.config.wrapx.map_or(0, |extra| (3 + extra) << index)
	}

	/// The halving ladder: sizes of every overview level.
	pub fn level_sizes(source: &Size, min_ovr: &Size) -> Vec<Size> {
		let mut sizes = Vec::new();
		let mut size = *source;
		loop {
			size = size.halved();
			sizes.push(size);
			if (size.width < min_ovr.width && size.height < min_ovr.height)
				|| (size.width <= 1 && size.height <= 1)
			{
				return sizes;
			}
		}
	}

	/// Runs the whole build: `dataset.vrt`, every `N/ovr.vrt` level with its
	/// tiles, and the `<Overview>` cross-links.
	pub fn build(&self, source: &Path, target: &Path, sink: &Sink) -> Result<VrtPyramid> {
		std::fs::create_dir_all(target).with_context(|| format!("creating {target:?}"))?;

		let info = {
			let dataset = self.backend.open(source, &[])?;
			dataset.info().clone()
		};
		log::info!(
			"building VRT pyramid for {source:?} ({:?}, {} bands) in {target:?}",
			info.size,
			info.bands
		);

		if self.config.background.is_some() {
			self.write_background(target, &info)?;
		}

		let dataset_vrt_path = target.join("dataset.vrt");
		let mut previous = self.source_vrt(source, target, &info)?;
		previous.save(&dataset_vrt_path)?;
		let mut previous_path = dataset_vrt_path.clone();

		let mut levels = Vec::new();
		for (index, nominal) in Self::level_sizes(&info.size, &self.config.min_ovr_size)
			.into_iter()
			.enumerate()
		{
			sink.check_aborted()?;
			let (level, model) = self
				.build_level(index, nominal, &info, target, &previous_path, sink)
				.with_context(|| format!("building overview level {index}"))?;

			// cross-link the freshly written level into its parent
			let link = if index == 0 {
				format!("{index}/ovr.vrt")
			} else {
				format!("../{index}/ovr.vrt")
			};
			previous.add_overview(&link, true);
			previous.save(&previous_path)?;

			previous = model;
			previous_path = level.path.clone();
			levels.push(level);
		}

		log::info!("VRT pyramid complete: {} levels", levels.len());
		Ok(VrtPyramid {
			dataset_vrt: dataset_vrt_path,
			levels,
		})
	}

	/// `dataset.vrt`: a VRT wrapping the original dataset untouched.
	fn source_vrt(&self, source: &Path, target: &Path, info: &DatasetInfo) -> Result<VrtDataset> {
		let (filename, relative) = match self.config.path_mode {
			PathMode::Absolute => {
				let absolute = std::path::absolute(source).with_context(|| format!("resolving {source:?}"))?;
				(absolute.to_string_lossy().to_string(), false)
			}
			PathMode::Relative => (source.to_string_lossy().to_string(), true),
			PathMode::Symlink => {
				let extension = source.extension().map(|e| e.to_string_lossy().to_string());
				let link_name = match extension {
					Some(ext) => format!("original.{ext}"),
					None => String::from("original"),
				};
				let link = target.join(&link_name);
				if !link.exists() {
					#[cfg(unix)]
					std::os::unix::fs::symlink(std::path::absolute(source)?, &link)
						.with_context(|| format!("symlinking {source:?} as {link:?}"))?;
					#[cfg(not(unix))]
					bail!("symlink path mode is only supported on unix");
				}
				(link_name, true)
			}
			PathMode::Copy => bail!("copy not implemented"),
		};

		let mut vrt = VrtDataset::new(info.size, info.srs.clone(), info.extent.geo_transform(&info.size));
		for band in 1..=info.bands {
			let mut raster_band = VrtRasterBand::new(band, info.pixel_type);
			raster_band.color_interp = Some(color_interp(band, info.bands).to_string());
			raster_band.nodata = info.nodata.or(self.config.nodata);
			raster_band.sources.push(SimpleSource {
				filename: filename.clone(),
				relative,
				shared: true,
				source_band: SourceBandRef::Band(band),
				src_rect: full_rect(&info.size),
				dst_rect: full_rect(&info.size),
				source_properties: Some(SourceProperties {
					size: info.size,
					data_type: info.pixel_type,
					block: self.config.tile_size,
				}),
			});
			vrt.bands.push(raster_band);
		}
		if info.has_mask {
			vrt.mask_band = Some(VrtMaskBand {
				sources: vec![SimpleSource {
					filename,
					relative,
					shared: true,
					source_band: SourceBandRef::Mask(1),
					src_rect: full_rect(&info.size),
					dst_rect: full_rect(&info.size),
					source_properties: None,
				}],
			});
		}
		Ok(vrt)
	}

	fn write_background(&self, target: &Path, info: &DatasetInfo) -> Result<()> {
		let background = self.config.background.as_ref().unwrap();
		ensure!(
			background.channels() == info.bands,
			"background colour has {} channels, dataset has {} bands",
			background.channels(),
			info.bands
		);

		let size = Size::new(16, 16);
		let mut data = Vec::with_capacity(size.pixels() * info.bands as usize);
		for _ in 0..size.pixels() {
			data.extend_from_slice(&background.0);
		}
		let buf = RasterBuf::new(size, info.bands, PixelData::U8(data))?;
		self
			.backend
			.write_geotiff(&target.join("background.tif"), &buf, &info.extent, &info.srs, None)
	}

	fn build_level(
		&self,
		index: usize,
		nominal: Size,
		info: &DatasetInfo,
		target: &Path,
		previous_path: &Path,
		sink: &Sink,
	) -> Result<(LevelInfo, VrtDataset)> {
		let level_dir = target.join(index.to_string());
		std::fs::create_dir_all(&level_dir)?;

		let halo = self.halo_px(index);
		let raster_size = Size::new(nominal.width + 2 * halo, nominal.height);
		let pixel_width = info.extent.width() / f64::from(nominal.width);
		let extent = info.extent.grown_x(f64::from(halo) * pixel_width);

		let tile = self.config.tile_size;
		let cols = raster_size.width.div_ceil(tile.width);
		let rows = raster_size.height.div_ceil(tile.height);
		let tiles_total = (cols * rows) as usize;

		log::debug!(
			"level {index}: {nominal:?} (+{halo} px halo per side), {cols}x{rows} tiles of {tile:?}"
		);

		let next_tile = AtomicUsize::new(0);
		let records: Mutex<Vec<Option<TileRecord>>> = Mutex::new((0..tiles_total).map(|_| None).collect());
		let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);

		// Dynamic scheduling over the tile grid: per-tile cost varies widely
		// between empty and full tiles.
		std::thread::scope(|scope| {
			for _ in 0..self.config.parallelism.min(tiles_total.max(1)) {
				scope.spawn(|| {
					let dataset = match self.backend.open(previous_path, &[]) {
						Ok(dataset) => dataset,
						Err(err) => {
							*failure.lock() = Some(err);
							return;
						}
					};
					loop {
						let at = next_tile.fetch_add(1, Ordering::Relaxed);
						if at >= tiles_total || failure.lock().is_some() || sink.is_aborted() {
							return;
						}
						let (tx, ty) = (at as u32 % cols, at as u32 / cols);
						match self.build_tile(dataset.as_ref(), info, &level_dir, &raster_size, &extent, tx, ty, sink) {
							Ok(record) => records.lock()[at] = record,
							Err(err) => {
								*failure.lock() = Some(err.context(format!("warping tile ({tx}, {ty})")));
								return;
							}
						}
					}
				});
			}
		});

		if let Some(err) = failure.lock().take() {
			return Err(err);
		}
		sink.check_aborted()?;

		let records: Vec<TileRecord> = records.lock().iter_mut().filter_map(Option::take).collect();
		let tiles_written = records.len();

		// assemble the level VRT
		let mut vrt = VrtDataset::new(raster_size, info.srs.clone(), extent.geo_transform(&raster_size));
		for band in 1..=info.bands {
			let mut raster_band = VrtRasterBand::new(band, info.pixel_type);
			raster_band.color_interp = Some(color_interp(band, info.bands).to_string());
			raster_band.nodata = info.nodata.or(self.config.nodata);

			if self.config.background.is_some() {
				raster_band.sources.push(SimpleSource {
					filename: String::from("../background.tif"),
					relative: true,
					shared: true,
					source_band: SourceBandRef::Band(band),
					src_rect: full_rect(&Size::new(16, 16)),
					dst_rect: full_rect(&raster_size),
					source_properties: None,
				});
			}
			for record in &records {
				raster_band.sources.push(SimpleSource {
					filename: record.filename.clone(),
					relative: true,
					shared: false,
					source_band: SourceBandRef::Band(band),
					src_rect: full_rect(&record.size),
					dst_rect: record.dst,
					source_properties: Some(SourceProperties {
						size: record.size,
						data_type: info.pixel_type,
						block: Size::new(record.size.width.min(512), record.size.height.min(512)),
					}),
				});
			}
			vrt.bands.push(raster_band);
		}
		if info.has_mask {
			vrt.mask_band = Some(VrtMaskBand {
				sources: records
					.iter()
					.map(|record| SimpleSource {
						filename: record.filename.clone(),
						relative: true,
						shared: false,
						source_band: SourceBandRef::Mask(1),
						src_rect: full_rect(&record.size),
						dst_rect: record.dst,
						source_properties: None,
					})
					.collect(),
			});
		}

		let path = level_dir.join("ovr.vrt");
		vrt.save(&path)?;

		Ok((
			LevelInfo {
				index,
				size: nominal,
				halo,
				raster_size,
				extent,
				path,
				tiles_written,
				tiles_total,
			},
			vrt,
		))
	}

	/// Warps one tile out of the previous level; returns `None` for an empty
	/// tile, which is not materialised.
	#[allow(clippy::too_many_arguments)]
	fn build_tile(
		&self,
		dataset: &dyn GeoDataset,
		info: &DatasetInfo,
		level_dir: &Path,
		raster_size: &Size,
		level_extent: &GeoExtent,
		tx: u32,
		ty: u32,
		sink: &Sink,
	) -> Result<Option<TileRecord>> {
		let tile = self.config.tile_size;
		let x0 = tx * tile.width;
		let y0 = ty * tile.height;
		let width = tile.width.min(raster_size.width - x0);
		let height = tile.height.min(raster_size.height - y0);
		let size = Size::new(width, height);
		let extent = level_extent.pixel_window(raster_size, x0, y0, width, height);

		let (buf, mask) = self.warp_with_wrap(dataset, &info.extent, &extent, &size, sink)?;

		if self.tile_is_empty(&buf, &mask) {
			return Ok(None);
		}

		let filename = format!("tile-{tx}-{ty}.tif");
		self.backend.write_geotiff(
			&level_dir.join(&filename),
			&buf,
			&extent,
			&info.srs,
			info.nodata.or(self.config.nodata),
		)?;

		Ok(Some(TileRecord {
			filename,
			size,
			dst: PixelRect::new(f64::from(x0), f64::from(y0), f64::from(width), f64::from(height)),
		}))
	}

	/// Warp honouring the x wrap: parts of `extent` overhanging the dataset's
	/// x range are warped from the far side (shifted by one world width) and
	/// stitched back column-wise, duplicating the pixels physically.
	fn warp_with_wrap(
		&self,
		dataset: &dyn GeoDataset,
		world: &GeoExtent,
		extent: &GeoExtent,
		size: &Size,
		sink: &Sink,
	) -> Result<(RasterBuf, RasterBuf)> {
		let pixel = extent.width() / f64::from(size.width);
		let left = if extent.x_min < world.x_min {
			(((world.x_min - extent.x_min) / pixel).round() as u32).min(size.width)
		} else {
			0
		};
		let right = if extent.x_max > world.x_max {
			(((extent.x_max - world.x_max) / pixel).round() as u32).min(size.width - left)
		} else {
			0
		};
		let middle = size.width - left - right;
		ensure!(
			middle > 0 || left > 0 || right > 0,
			"degenerate warp window {size:?}"
		);

		let mut segments: Vec<(GeoExtent, u32)> = Vec::new();
		if left > 0 {
			let segment = GeoExtent::new(
				extent.x_min + world.width(),
				extent.y_min,
				extent.x_min + f64::from(left) * pixel + world.width(),
				extent.y_max,
			);
			segments.push((segment, left));
		}
		if middle > 0 {
			let x_min = extent.x_min + f64::from(left) * pixel;
			segments.push((GeoExtent::new(x_min, extent.y_min, x_min + f64::from(middle) * pixel, extent.y_max), middle));
		}
		if right > 0 {
			let x_min = extent.x_max - f64::from(right) * pixel - world.width();
			segments.push((GeoExtent::new(x_min, extent.y_min, extent.x_max - world.width(), extent.y_max), right));
		}

		let mut images = Vec::with_capacity(segments.len());
		let mut masks = Vec::with_capacity(segments.len());
		for (segment_extent, segment_width) in &segments {
			let params = WarpParams {
				extent: *segment_extent,
				dst_srs: dataset.info().srs.clone(),
				size: Size::new(*segment_width, size.height),
				resampling: self.config.resampling,
			};
			let image = if dataset.info().pixel_type.is_float() {
				dataset.warp_heightfield(&params, sink)?
			} else {
				dataset.warp_image(&params, false, sink)?
			};
			images.push(image);
			masks.push(dataset.warp_mask(&params, sink)?);
		}

		Ok((stitch_columns(&images, size)?, stitch_columns(&masks, size)?))
	}

	fn tile_is_empty(&self, buf: &RasterBuf, mask: &RasterBuf) -> bool {
		if let (Some(background), Some(pixels)) = (&self.config.background, buf.as_u8()) {
			// bit-for-bit comparison against the background colour
			let channels = buf.channels as usize;
			return pixels
				.chunks_exact(channels)
				.all(|px| px == background.0.as_slice());
		}
		mask.as_u8().is_some_and(|m| m.iter().all(|&v| v == 0))
	}
}

/// Concatenates horizontally adjacent warp segments into one buffer.
fn stitch_columns(parts: &[RasterBuf], size: &Size) -> Result<RasterBuf> {
	ensure!(!parts.is_empty(), "nothing to stitch");
	if parts.len() == 1 {
		return Ok(parts[0].clone());
	}

	let channels = parts[0].channels;
	let height = size.height as usize;
	ensure!(
		parts.iter().map(|p| p.size.width).sum::<u32>() == size.width,
		"stitched widths do not add up to {}",
		size.width
	);

	let data = match &parts[0].data {
		PixelData::U8(_) => {
			let mut out = Vec::with_capacity(size.pixels() * channels as usize);
			for y in 0..height {
				for part in parts {
					let row = part.size.width as usize * channels as usize;
					let bytes = part.as_u8().context("mixed pixel types while stitching")?;
					out.extend_from_slice(&bytes[y * row..(y + 1) * row]);
				}
			}
			PixelData::U8(out)
		}
		PixelData::F32(_) => {
			let mut out = Vec::with_capacity(size.pixels() * channels as usize);
			for y in 0..height {
				for part in parts {
					let row = part.size.width as usize * channels as usize;
					let values = part.as_f32().context("mixed pixel types while stitching")?;
					out.extend_from_slice(&values[y * row..(y + 1) * row]);
				}
			}
			PixelData::F32(out)
		}
	};
	RasterBuf::new(*size, channels, data)
}

fn full_rect(size: &Size) -> PixelRect {
	PixelRect::new(0.0, 0.0, f64::from(size.width), f64::from(size.height))
}

fn color_interp(band: u8, bands: u8) -> &'static str {
	if bands == 1 {
		return "Gray";
	}
	match band {
		1 => "Red",
		2 => "Green",
		3 => "Blue",
		_ => "Alpha",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::mock::{MOCK_WORLD, MockBackend, MockProfile};

	fn builder(config: VrtConfig, default: MockProfile) -> VrtBuilder {
		VrtBuilder::new(Arc::new(MockBackend::with_default(default)), config)
	}

	#[test]
	fn halving_ladder_stops_below_min() {
		let sizes = VrtBuilder::level_sizes(&Size::new(4096, 2048), &Size::new(256, 256));
		assert_eq!(
			sizes,
			vec![
				Size::new(2048, 1024),
				Size::new(1024, 512),
				Size::new(512, 256),
				Size::new(256, 128),
				Size::new(128, 64),
			]
		);
	}

	#[test]
	fn halo_doubles_per_level() {
		let config = VrtConfig {
			wrapx: Some(0),
			..VrtConfig::default()
		};
		let builder = builder(config, MockProfile::image(Size::new(4096, 2048)));
		assert_eq!(builder.halo_px(0), 3);
		assert_eq!(builder.halo_px(1), 6);
		assert_eq!(builder.halo_px(2), 12);
		// no wrap, no halo
		let plain = VrtBuilder::new(Arc::new(MockBackend::new()), VrtConfig::default());
		assert_eq!(plain.halo_px(0), 0);
	}

	#[test]
	fn pyramid_with_wrap_halo() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let config = VrtConfig {
			wrapx: Some(0),
			tile_size: Size::new(1024, 1024),
			min_ovr_size: Size::new(256, 256),
			parallelism: 2,
			..VrtConfig::default()
		};
		let builder = builder(config, MockProfile::image(Size::new(4096, 2048)));
		let pyramid = builder.build(Path::new("world.tif"), dir.path(), &Sink::new())?;

		assert_eq!(pyramid.levels.len(), 5);
		assert!(pyramid.dataset_vrt.exists());

		let pixel_width = MOCK_WORLD.width() / 2048.0;
		let level0 = &pyramid.levels[0];
		assert_eq!(level0.size, Size::new(2048, 1024));
		assert_eq!(level0.halo, 3);
		assert_eq!(level0.raster_size, Size::new(2054, 1024));
		assert!((level0.extent.x_min - (MOCK_WORLD.x_min - 3.0 * pixel_width)).abs() < 1e-6);
		assert!((level0.extent.x_max - (MOCK_WORLD.x_max + 3.0 * pixel_width)).abs() < 1e-6);

		// next level's halo doubles
		assert_eq!(pyramid.levels[1].halo, 6);
		assert_eq!(pyramid.levels[1].raster_size, Size::new(1036, 512));

		// every level file exists and the parent links to it
		for level in &pyramid.levels {
			assert!(level.path.exists());
		}
		let root = std::fs::read_to_string(&pyramid.dataset_vrt)?;
		assert!(root.contains("<Overview>"));
		assert!(root.contains("0/ovr.vrt"));
		let level0_xml = std::fs::read_to_string(&pyramid.levels[0].path)?;
		assert!(level0_xml.contains("../1/ovr.vrt"));
		// the deepest level carries no overview link
		let last_xml = std::fs::read_to_string(&pyramid.levels[4].path)?;
		assert!(!last_xml.contains("<Overview>"));
		Ok(())
	}

	#[test]
	fn empty_tiles_are_not_materialised() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let config = VrtConfig {
			tile_size: Size::new(256, 256),
			min_ovr_size: Size::new(512, 512),
			parallelism: 1,
			..VrtConfig::default()
		};
		// coverage missing in the south-east quadrant
		let profile = MockProfile::image(Size::new(1024, 1024)).with_empty_quadrant(3);
		let builder = builder(config, profile);
		let pyramid = builder.build(Path::new("masked.tif"), dir.path(), &Sink::new())?;

		let level0 = &pyramid.levels[0];
		assert_eq!(level0.size, Size::new(512, 512));
		assert_eq!(level0.tiles_total, 4);
		assert_eq!(level0.tiles_written, 3);
		assert!(dir.path().join("0/tile-0-0.tif").exists());
		assert!(!dir.path().join("0/tile-1-1.tif").exists());

		// the eliminated region has no SimpleSource in the level VRT
		let xml = std::fs::read_to_string(&level0.path)?;
		assert_eq!(xml.matches("<SimpleSource>").count(), 9); // 3 tiles x 3 bands
		Ok(())
	}

	#[test]
	fn background_elimination_and_gap_fill() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let config = VrtConfig {
			tile_size: Size::new(512, 512),
			min_ovr_size: Size::new(512, 512),
			background: Some(Color(vec![0, 0, 0])),
			parallelism: 1,
			..VrtConfig::default()
		};
		// the masked quadrant warps to solid black, the background colour
		let profile = MockProfile::image(Size::new(1024, 1024)).with_empty_quadrant(3);
		let builder = builder(config, profile);
		let pyramid = builder.build(Path::new("masked.tif"), dir.path(), &Sink::new())?;

		assert!(dir.path().join("background.tif").exists());
		assert_eq!(pyramid.levels[0].tiles_written, 3);
		let xml = std::fs::read_to_string(&pyramid.levels[0].path)?;
		assert!(xml.contains("../background.tif"));
		Ok(())
	}

	#[test]
	fn wrap_stitching_duplicates_far_side_pixels() -> Result<()> {
		let backend = MockBackend::with_default(MockProfile::image(Size::new(1024, 512)));
		let builder = VrtBuilder::new(
			Arc::new(backend),
			VrtConfig {
				wrapx: Some(0),
				..VrtConfig::default()
			},
		);
		let dataset = builder.backend.open(Path::new("world.tif"), &[])?;
		let sink = Sink::new();

		// 2 px overhang to the left of the world
		let pixel = MOCK_WORLD.width() / 8.0;
		let extent = GeoExtent::new(
			MOCK_WORLD.x_min - 2.0 * pixel,
			MOCK_WORLD.y_min,
			MOCK_WORLD.x_min + 6.0 * pixel,
			MOCK_WORLD.y_max,
		);
		let (buf, _mask) = builder.warp_with_wrap(dataset.as_ref(), &MOCK_WORLD, &extent, &Size::new(8, 4), &sink)?;

		// the overhang columns must equal a direct warp of the far east strip
		let far = WarpParams {
			extent: GeoExtent::new(
				MOCK_WORLD.x_max - 2.0 * pixel,
				MOCK_WORLD.y_min,
				MOCK_WORLD.x_max,
				MOCK_WORLD.y_max,
			),
			dst_srs: String::from("EPSG:3857"),
			size: Size::new(2, 4),
			resampling: Resampling::Cubic,
		};
		let far_buf = dataset.warp_image(&far, false, &sink)?;

		let stitched = buf.as_u8().unwrap();
		let expected = far_buf.as_u8().unwrap();
		for y in 0..4usize {
			for x in 0..2usize {
				let got = &stitched[(y * 8 + x) * 3..][..3];
				let want = &expected[(y * 2 + x) * 3..][..3];
				assert_eq!(got, want, "wrapped column mismatch at ({x}, {y})");
			}
		}
		Ok(())
	}

	#[test]
	fn copy_path_mode_is_unimplemented() {
		let dir = tempfile::tempdir().unwrap();
		let config = VrtConfig {
			path_mode: PathMode::Copy,
			..VrtConfig::default()
		};
		let builder = builder(config, MockProfile::image(Size::new(512, 512)));
		let err = builder.build(Path::new("src.tif"), dir.path(), &Sink::new()).unwrap_err();
		assert!(format!("{err:#}").contains("copy not implemented"));
	}

	#[test]
	fn aborted_sink_stops_the_build() {
		let dir = tempfile::tempdir().unwrap();
		let builder = builder(VrtConfig::default(), MockProfile::image(Size::new(2048, 2048)));
		let sink = Sink::new();
		sink.abort();
		assert!(builder.build(Path::new("src.tif"), dir.path(), &sink).is_err());
	}
}
