//! One farm worker: a dedicated thread owning a bounded LRU of opened
//! datasets, pulling jobs off the shared queue until it is recycled.

use super::request::{Operation, WarpRequest, WarpResponse};
use super::{FarmConfig, Job};
use crate::backend::{GeoDataset, RasterBackend};
use anyhow::{Context, Result};
use cartolina_core::Sink;
use crossbeam_channel::{Receiver, select};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Control messages targeted at one specific worker.
pub(crate) enum Control {
	Exit,
}

/// Shared, lock-free view of one worker for the housekeeping task.
#[derive(Default)]
pub(crate) struct WorkerState {
	pub busy: AtomicBool,
	pub requests: AtomicU64,
	pub cache_bytes: AtomicUsize,
	pub alive: AtomicBool,
}

type CacheKey = (PathBuf, Vec<String>);

/// Per-worker dataset cache; entries are never shared across workers.
struct DatasetCache {
	cache: LruCache<CacheKey, Box<dyn GeoDataset>>,
	state: Arc<WorkerState>,
}

impl DatasetCache {
	fn new(capacity: usize, state: Arc<WorkerState>) -> DatasetCache {
		DatasetCache {
			cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
			state,
		}
	}

	fn get_or_open(&mut self, backend: &dyn RasterBackend, request: &WarpRequest) -> Result<&dyn GeoDataset> {
		let key = (request.dataset.clone(), request.open_options.clone());
		if !self.cache.contains(&key) {
			let dataset = backend
				.open(&request.dataset, &request.open_options)
				.with_context(|| format!("opening dataset {:?}", request.dataset))?;
			self.state.cache_bytes.fetch_add(dataset.estimated_bytes(), Ordering::Relaxed);
			if let Some((_, evicted)) = self.cache.push(key.clone(), dataset) {
				self.state.cache_bytes.fetch_sub(evicted.estimated_bytes(), Ordering::Relaxed);
			}
		}
		Ok(self.cache.get(&key).unwrap().as_ref())
	}
}

pub(crate) fn run_worker(
	id: u32,
	backend: Arc<dyn RasterBackend>,
	config: FarmConfig,
	jobs: Receiver<Job>,
	control: Receiver<Control>,
	state: Arc<WorkerState>,
) {
	let mut cache = DatasetCache::new(config.dataset_cache_size, state.clone());
	log::debug!("warper worker {id} started");

	loop {
		let job = select! {
			recv(control) -> msg => match msg {
				Ok(Control::Exit) | Err(_) => break,
			},
			recv(jobs) -> job => match job {
				Ok(job) => job,
				Err(_) => break,
			},
		};

		log::trace!("warper worker {id} serving request {}", job.id);
		state.busy.store(true, Ordering::Release);
		let result = execute(backend.as_ref(), &mut cache, &job.request, &job.sink);
		state.busy.store(false, Ordering::Release);

		// The caller may have gone away; a dropped receiver is not an error.
		let _ = job.reply.send(result);

		let served = state.requests.fetch_add(1, Ordering::AcqRel) + 1;
		if served >= config.max_requests_per_worker {
			log::info!("warper worker {id} recycled after {served} requests");
			break;
		}
	}

	log::debug!("warper worker {id} exited");
}

fn execute(
	backend: &dyn RasterBackend,
	cache: &mut DatasetCache,
	request: &WarpRequest,
	sink: &Sink,
) -> Result<WarpResponse> {
	sink.check_aborted()?;

	if let Operation::Heightcode { dems, config } = &request.operation {
		let blob = backend.heightcode(&request.dataset, dems, config, sink)?;
		return Ok(WarpResponse::Vector(blob));
	}

	let dataset = cache.get_or_open(backend, request)?;
	let buf = match &request.operation {
		Operation::Image => {
			if dataset.info().pixel_type.is_float() {
				dataset.warp_heightfield(&request.params, sink)?
			} else {
				dataset.warp_image(&request.params, true, sink)?
			}
		}
		Operation::ImageNoExpand => dataset.warp_image(&request.params, false, sink)?,
		Operation::Mask => dataset.warp_mask(&request.params, sink)?,
		Operation::DemProcessing { alg, options } => dataset.dem_processing(&request.params, *alg, options, sink)?,
		Operation::Heightcode { .. } => unreachable!(),
	};
	Ok(WarpResponse::Raster(buf))
}
