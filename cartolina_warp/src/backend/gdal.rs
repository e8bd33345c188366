//! GDAL implementation of the raster backend. Compiled only with the `gdal`
//! feature; nothing above this module sees gdal types, so GDAL version skew
//! stays contained here.

use super::{DatasetInfo, GeoDataset, HeightcodeConfig, RasterBackend, WarpParams};
use crate::dem::{self, DemAlgorithm, DemOptions};
use crate::types::{GeoExtent, PixelData, PixelType, RasterBuf, Resampling, Size};
use anyhow::{Context, Result, bail, ensure};
use cartolina_core::{Blob, Sink};
use gdal::raster::{Buffer, RasterCreationOptions};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, config::set_config_option};
use std::path::{Path, PathBuf};

pub struct GdalBackend;

impl GdalBackend {
	pub fn new() -> Result<GdalBackend> {
		set_config_option("GDAL_NUM_THREADS", "ALL_CPUS")?;
		Ok(GdalBackend)
	}
}

impl RasterBackend for GdalBackend {
	fn name(&self) -> &'static str {
		"gdal"
	}

	fn open(&self, path: &Path, open_options: &[String]) -> Result<Box<dyn GeoDataset>> {
		let options: Vec<&str> = open_options.iter().map(|s| s.as_str()).collect();
		let dataset = Dataset::open_ex(
			path,
			gdal::DatasetOptions {
				open_options: if options.is_empty() { None } else { Some(&options) },
				..Default::default()
			},
		)
		.with_context(|| format!("opening GDAL dataset {path:?}"))?;

		let info = probe(&dataset)?;
		Ok(Box::new(GdalDataset { dataset, info }))
	}

	fn write_geotiff(
		&self,
		path: &Path,
		buf: &RasterBuf,
		extent: &GeoExtent,
		srs: &str,
		nodata: Option<f64>,
	) -> Result<()> {
		let driver = DriverManager::get_driver_by_name("GTiff").context("GTiff driver missing")?;
		let predictor = buf.pixel_type().predictor().to_string();
		let options = RasterCreationOptions::from_iter([
			"COMPRESS=DEFLATE",
			"TILED=YES",
			&format!("PREDICTOR={predictor}"),
		]);

		let (width, height) = (buf.size.width as usize, buf.size.height as usize);
		let bands = isize::from(buf.channels);

		match &buf.data {
			PixelData::U8(data) => {
				let mut dataset = driver.create_with_band_type_with_options::<u8, _>(path, width, height, bands, &options)?;
				georeference(&mut dataset, extent, &buf.size, srs)?;
				write_bands(&mut dataset, buf.channels, width, height, data, nodata)?;
			}
			PixelData::F32(data) => {
				let mut dataset = driver.create_with_band_type_with_options::<f32, _>(path, width, height, bands, &options)?;
				georeference(&mut dataset, extent, &buf.size, srs)?;
				write_bands(&mut dataset, buf.channels, width, height, data, nodata)?;
			}
		}
		Ok(())
	}

	fn heightcode(&self, vector: &Path, dems: &[PathBuf], config: &HeightcodeConfig, sink: &Sink) -> Result<Blob> {
		use gdal::vector::LayerAccess;

		ensure!(!dems.is_empty(), "heightcode needs at least one DEM");
		let dem = self.open(&dems[0], &[])?;

		let vector_ds = Dataset::open(vector).with_context(|| format!("opening vector dataset {vector:?}"))?;
		let mut features = Vec::new();

		for layer_index in 0..vector_ds.layer_count() {
			let mut layer = vector_ds.layer(layer_index)?;
			let layer_name = layer.name();
			if !config.layers.is_empty() && !config.layers.contains(&layer_name) {
				continue;
			}
			for feature in layer.features() {
				sink.check_aborted()?;
				let Some(geometry) = feature.geometry() else {
					continue;
				};
				let mut points = Vec::new();
				geometry.get_points(&mut points);
				let coded: Vec<String> = points
					.iter()
					.map(|(x, y, z)| {
						let height = if config.only_missing_z && *z != 0.0 {
							*z
						} else {
							sample_height(dem.as_ref(), *x, *y).unwrap_or(0.0)
						};
						format!("[{x:.6},{y:.6},{height:.3}]")
					})
					.collect();
				features.push(format!(
					r#"{{"type":"Feature","properties":{{"layer":"{layer_name}"}},"geometry":{{"type":"LineString","coordinates":[{}]}}}}"#,
					coded.join(",")
				));
			}
		}

		Ok(Blob::from(format!(
			r#"{{"type":"FeatureCollection","features":[{}]}}"#,
			features.join(",")
		)))
	}
}

/// Samples one height out of the DEM at dataset-SRS coordinates.
fn sample_height(dem: &dyn GeoDataset, x: f64, y: f64) -> Option<f64> {
	let info = dem.info();
	let pixel = info.extent.width() / f64::from(info.size.width);
	let params = WarpParams {
		extent: GeoExtent::new(x - pixel, y - pixel, x + pixel, y + pixel),
		dst_srs: info.srs.clone(),
		size: Size::new(1, 1),
		resampling: Resampling::Bilinear,
	};
	let buf = dem.warp_heightfield(&params, &Sink::new()).ok()?;
	buf.as_f32().map(|v| f64::from(v[0]))
}

fn georeference(dataset: &mut Dataset, extent: &GeoExtent, size: &Size, srs: &str) -> Result<()> {
	dataset.set_spatial_ref(&spatial_ref(srs)?)?;
	dataset.set_geo_transform(&extent.geo_transform(size))?;
	Ok(())
}

fn write_bands<T: Copy + gdal::raster::GdalType>(
	dataset: &mut Dataset,
	channels: u8,
	width: usize,
	height: usize,
	interleaved: &[T],
	nodata: Option<f64>,
) -> Result<()> {
	for band_index in 1..=channels {
		let mut band = dataset.rasterband(band_index as usize)?;
		if let Some(nodata) = nodata {
			band.set_no_data_value(Some(nodata))?;
		}
		let offset = usize::from(band_index - 1);
		let plane: Vec<T> = interleaved
			.iter()
			.skip(offset)
			.step_by(usize::from(channels))
			.copied()
			.collect();
		let mut buffer = Buffer::new((width, height), plane);
		band.write((0, 0), (width, height), &mut buffer)?;
	}
	dataset.flush_cache()?;
	Ok(())
}

fn spatial_ref(definition: &str) -> Result<SpatialRef> {
	SpatialRef::from_definition(definition).with_context(|| format!("parsing SRS definition '{definition}'"))
}

fn probe(dataset: &Dataset) -> Result<DatasetInfo> {
	let gt = dataset.geo_transform().context("dataset has no geo transform")?;
	ensure!(gt[2] == 0.0 && gt[4] == 0.0, "GDAL dataset must not be rotated");

	let (width, height) = dataset.raster_size();
	let size = Size::new(width as u32, height as u32);
	let extent = GeoExtent::new(
		gt[0],
		gt[3] + gt[5] * height as f64,
		gt[0] + gt[1] * width as f64,
		gt[3],
	);

	let srs = dataset
		.spatial_ref()
		.context("dataset has no spatial reference")?
		.to_wkt()?;

	let band = dataset.rasterband(1)?;
	let nodata = band.no_data_value();
	let has_mask = unsafe {
		let flags = gdal_sys::GDALGetMaskFlags(band.c_rasterband());
		// GMF_PER_DATASET without GMF_ALL_VALID or GMF_NODATA
		flags & 0x02 != 0 && flags & 0x01 == 0 && flags & 0x08 == 0
	};

	let pixel_type = match band.band_type() {
		gdal::raster::GdalDataType::UInt8 => PixelType::U8,
		gdal::raster::GdalDataType::UInt16 => PixelType::U16,
		gdal::raster::GdalDataType::Int16 => PixelType::I16,
		gdal::raster::GdalDataType::UInt32 => PixelType::U32,
		gdal::raster::GdalDataType::Int32 => PixelType::I32,
		gdal::raster::GdalDataType::Float32 => PixelType::F32,
		gdal::raster::GdalDataType::Float64 => PixelType::F64,
		other => bail!("unsupported band type {other:?}"),
	};

	Ok(DatasetInfo {
		size,
		extent,
		srs,
		bands: dataset.raster_count() as u8,
		pixel_type,
		nodata,
		has_mask,
	})
}

struct GdalDataset {
	dataset: Dataset,
	info: DatasetInfo,
}

impl GdalDataset {
	/// Reprojects into an in-memory dataset of `bands` bands of `T`, with an
	/// extra alpha band carrying the coverage mask.
	fn reproject<T: Copy + gdal::raster::GdalType>(
		&self,
		params: &WarpParams,
		bands: u8,
		sink: &Sink,
	) -> Result<Dataset> {
		sink.check_aborted()?;

		let driver = DriverManager::get_driver_by_name("MEM").context("MEM driver missing")?;
		let mut dst = driver.create_with_band_type::<T, _>(
			"",
			params.size.width as usize,
			params.size.height as usize,
			isize::from(bands) + 1,
		)?;
		dst.set_spatial_ref(&spatial_ref(&params.dst_srs)?)?;
		dst.set_geo_transform(&params.extent.geo_transform(&params.size))?;

		let h_src = self.dataset.c_dataset();
		let h_dst = dst.c_dataset();

		unsafe {
			use gdal_sys::{
				CPLErr, CPLGetLastErrorMsg, CPLMalloc, CSLSetNameValue, GDALChunkAndWarpMulti,
				GDALCreateGenImgProjTransformer2, GDALCreateWarpOperation, GDALCreateWarpOptions,
				GDALDestroyGenImgProjTransformer, GDALDestroyWarpOperation, GDALGenImgProjTransform, GDALWarpOptions,
			};

			let mut options: GDALWarpOptions = *GDALCreateWarpOptions();
			options.hSrcDS = h_src;
			options.hDstDS = h_dst;
			options.papszWarpOptions =
				CSLSetNameValue(options.papszWarpOptions, c"NUM_THREADS".as_ptr(), c"1".as_ptr());
			options.papszWarpOptions =
				CSLSetNameValue(options.papszWarpOptions, c"INIT_DEST".as_ptr(), c"0".as_ptr());

			options.nBandCount = i32::from(bands);
			let bytes = std::mem::size_of::<i32>() * usize::from(bands);
			options.panSrcBands = CPLMalloc(bytes).cast::<i32>();
			options.panDstBands = CPLMalloc(bytes).cast::<i32>();
			for band in 0..i32::from(bands) {
				options.panSrcBands.offset(band as isize).write(band + 1);
				options.panDstBands.offset(band as isize).write(band + 1);
			}
			// destination alpha receives the warped coverage mask
			options.nDstAlphaBand = i32::from(bands) + 1;
			options.eResampleAlg = resample_alg(params.resampling);
			options.dfWarpMemoryLimit = 256.0 * 1024.0 * 1024.0;
			options.pTransformerArg = GDALCreateGenImgProjTransformer2(h_src, h_dst, std::ptr::null_mut());
			options.pfnTransformer = Some(GDALGenImgProjTransform);

			let operation = GDALCreateWarpOperation(&raw const options);
			let rv = GDALChunkAndWarpMulti(
				operation,
				0,
				0,
				i32::try_from(params.size.width).unwrap(),
				i32::try_from(params.size.height).unwrap(),
			);
			GDALDestroyWarpOperation(operation);
			GDALDestroyGenImgProjTransformer(options.pTransformerArg);

			if rv != CPLErr::CE_None {
				bail!("GDAL warp failed: {:?}", CPLGetLastErrorMsg());
			}
		}

		sink.check_aborted()?;
		Ok(dst)
	}

	fn read_interleaved<T: Copy + gdal::raster::GdalType + Default>(
		dst: &Dataset,
		bands: u8,
		size: &Size,
	) -> Result<Vec<T>> {
		let pixels = size.pixels();
		let mut out = vec![T::default(); pixels * usize::from(bands)];
		for band_index in 1..=bands {
			let band = dst.rasterband(usize::from(band_index))?;
			let data = band.read_band_as::<T>()?;
			let data = data.data();
			ensure!(data.len() == pixels, "band {band_index} length mismatch");
			for (i, value) in data.iter().enumerate() {
				out[i * usize::from(bands) + usize::from(band_index - 1)] = *value;
			}
		}
		Ok(out)
	}
}

impl GeoDataset for GdalDataset {
	fn info(&self) -> &DatasetInfo {
		&self.info
	}

	fn warp_image(&self, params: &WarpParams, expand: bool, sink: &Sink) -> Result<RasterBuf> {
		if self.info.pixel_type.is_float() {
			return self.warp_heightfield(params, sink);
		}
		let bands = if expand { self.info.bands.max(3) } else { self.info.bands };
		let dst = self.reproject::<u8>(params, self.info.bands, sink)?;
		let mut data = GdalDataset::read_interleaved::<u8>(&dst, self.info.bands, &params.size)?;
		if expand && self.info.bands == 1 {
			// grey to rgb
			data = data.iter().flat_map(|&v| [v, v, v]).collect();
		}
		RasterBuf::new(params.size, bands, PixelData::U8(data))
	}

	fn warp_mask(&self, params: &WarpParams, sink: &Sink) -> Result<RasterBuf> {
		let dst = self.reproject::<u8>(params, self.info.bands, sink)?;
		let alpha = dst.rasterband(usize::from(self.info.bands) + 1)?;
		let data = alpha.read_band_as::<u8>()?;
		RasterBuf::new(params.size, 1, PixelData::U8(data.data().to_vec()))
	}

	fn warp_heightfield(&self, params: &WarpParams, sink: &Sink) -> Result<RasterBuf> {
		let dst = self.reproject::<f32>(params, 1, sink)?;
		let band = dst.rasterband(1)?;
		let data = band.read_band_as::<f32>()?;
		RasterBuf::new(params.size, 1, PixelData::F32(data.data().to_vec()))
	}

	fn dem_processing(
		&self,
		params: &WarpParams,
		alg: DemAlgorithm,
		options: &DemOptions,
		sink: &Sink,
	) -> Result<RasterBuf> {
		let heights = self.warp_heightfield(params, sink)?;
		let heights = heights.as_f32().unwrap();
		let cell_x = params.extent.width() / f64::from(params.size.width);
		let cell_y = params.extent.height() / f64::from(params.size.height);

		let data = match alg {
			DemAlgorithm::Hillshade => dem::hillshade(heights, &params.size, cell_x, cell_y, options),
			DemAlgorithm::Slope => dem::slope(heights, &params.size, cell_x, cell_y, options),
			DemAlgorithm::Aspect => dem::aspect(heights, &params.size, cell_x, cell_y, options),
			DemAlgorithm::Roughness | DemAlgorithm::Tri => {
				dem::roughness_kernel(heights, &params.size, |neighbours, center| {
					neighbours.iter().map(|n| (n - center).abs()).sum::<f64>() / neighbours.len() as f64
				})
			}
			DemAlgorithm::Tpi => dem::roughness_kernel(heights, &params.size, |neighbours, center| {
				(center - neighbours.iter().sum::<f64>() / neighbours.len() as f64).abs()
			}),
			DemAlgorithm::ColorRelief => bail!("color-relief requires a colour ramp; not wired for this backend"),
		};
		RasterBuf::new(params.size, 1, PixelData::U8(data))
	}

	fn estimated_bytes(&self) -> usize {
		let sample = if self.info.pixel_type.is_float() { 4 } else { 1 };
		self.info.size.pixels().min(4096 * 4096) * usize::from(self.info.bands) * sample
	}
}
