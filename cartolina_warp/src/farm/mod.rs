//! The warper farm: a pool of dedicated worker threads executing blocking
//! raster operations under an aggregate RSS budget.
//!
//! Dispatch contract:
//! - requests are unordered; each reply travels over its own oneshot channel,
//!   correlated by the id assigned at dispatch;
//! - the caller's [`Sink`] is carried into the worker, which checks it
//!   between chunks and answers `Cancelled` early;
//! - a housekeeping task runs on a fixed period; when the process RSS
//!   exceeds the configured budget the largest idle worker is recycled, and
//!   every worker is recycled after a configured number of requests;
//! - a dead worker surfaces as `WorkerLost` on its in-flight request; the
//!   farm retries such a request once on a fresh worker before giving up.

mod request;
mod worker;

pub use request::{Operation, WarpRequest, WarpResponse};

use crate::backend::RasterBackend;
use anyhow::{Context, Result};
use cartolina_core::{Sink, TileError};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use worker::{Control, WorkerState, run_worker};

#[derive(Clone, Debug)]
pub struct FarmConfig {
	/// Number of workers; defaults to the hardware concurrency.
	pub workers: usize,
	/// Capacity of each worker's opened-dataset LRU.
	pub dataset_cache_size: usize,
	/// A worker is recycled after serving this many requests.
	pub max_requests_per_worker: u64,
	/// Aggregate RSS budget in bytes; unlimited when `None`.
	pub rss_limit: Option<u64>,
	pub rss_check_period: Duration,
}

impl Default for FarmConfig {
	fn default() -> FarmConfig {
		FarmConfig {
			workers: num_cpus::get().max(1),
			dataset_cache_size: 16,
			max_requests_per_worker: 1024,
			rss_limit: None,
			rss_check_period: Duration::from_secs(10),
		}
	}
}

pub(crate) struct Job {
	pub id: u64,
	pub request: WarpRequest,
	pub sink: Sink,
	pub reply: tokio::sync::oneshot::Sender<Result<WarpResponse>>,
}

struct WorkerSlot {
	id: u32,
	control: Sender<Control>,
	state: Arc<WorkerState>,
	join: Option<std::thread::JoinHandle<()>>,
}

struct FarmInner {
	backend: Arc<dyn RasterBackend>,
	config: FarmConfig,
	jobs_tx: Sender<Job>,
	jobs_rx: Receiver<Job>,
	workers: Mutex<Vec<WorkerSlot>>,
	next_request_id: AtomicU64,
	next_worker_id: AtomicU32,
	shutdown: AtomicBool,
}

/// Thread-safe handle; clones share the same pool.
#[derive(Clone)]
pub struct Farm {
	inner: Arc<FarmInner>,
}

impl Farm {
	pub fn new(backend: Arc<dyn RasterBackend>, config: FarmConfig) -> Farm {
		let (jobs_tx, jobs_rx) = unbounded();
		let inner = Arc::new(FarmInner {
			backend,
			config,
			jobs_tx,
			jobs_rx,
			workers: Mutex::new(Vec::new()),
			next_request_id: AtomicU64::new(1),
			next_worker_id: AtomicU32::new(1),
			shutdown: AtomicBool::new(false),
		});

		for _ in 0..inner.config.workers {
			inner.spawn_worker();
		}
		spawn_housekeeping(&inner);

		log::info!(
			"warper farm started with {} workers (backend: {})",
			inner.config.workers,
			inner.backend.name()
		);
		Farm { inner }
	}

	/// Dispatches one request and awaits its reply. Suspends the calling task
	/// until the worker answers, the sink is cancelled, or the worker dies
	/// (in which case one retry is attempted).
	pub async fn warp(&self, request: WarpRequest, sink: &Sink) -> Result<WarpResponse> {
		match self.dispatch(request.clone(), sink).await {
			Err(err) if matches!(TileError::of(&err), Some(TileError::WorkerLost)) => {
				log::warn!("warper worker lost mid-request; retrying once");
				self.dispatch(request, sink).await
			}
			other => other,
		}
	}

	async fn dispatch(&self, request: WarpRequest, sink: &Sink) -> Result<WarpResponse> {
		anyhow::ensure!(!self.inner.shutdown.load(Ordering::Acquire), "warper farm is shut down");

		let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
		let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
		let job = Job {
			id,
			request,
			sink: sink.clone(),
			reply: reply_tx,
		};
		log::trace!("dispatching warp request {id}");

		self
			.inner
			.jobs_tx
			.send(job)
			.map_err(|_| TileError::Internal(String::from("warper farm queue closed")))?;

		match reply_rx.await {
			Ok(result) => result.with_context(|| format!("warp request {id} failed")),
			// the worker died with the job in hand
			Err(_) => Err(TileError::WorkerLost.into()),
		}
	}

	/// Sum of the per-worker dataset-cache footprints, in bytes.
	pub fn cache_bytes(&self) -> usize {
		let workers = self.inner.workers.lock();
		workers.iter().map(|w| w.state.cache_bytes.load(Ordering::Relaxed)).sum()
	}

	pub fn worker_count(&self) -> usize {
		let workers = self.inner.workers.lock();
		workers.iter().filter(|w| w.state.alive.load(Ordering::Acquire)).count()
	}

	/// Stops accepting requests and asks every worker to exit.
	pub fn shutdown(&self) {
		if self.inner.shutdown.swap(true, Ordering::AcqRel) {
			return;
		}
		log::info!("shutting down warper farm");
		// Take the slots out first; joining must not happen under the lock,
		// exiting workers still touch it while being replaced.
		let mut slots = std::mem::take(&mut *self.inner.workers.lock());
		for slot in &slots {
			let _ = slot.control.send(Control::Exit);
		}
		for slot in &mut slots {
			if let Some(join) = slot.join.take() {
				let _ = join.join();
			}
		}
	}
}

impl FarmInner {
	fn spawn_worker(self: &Arc<Self>) {
		let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
		let (control_tx, control_rx) = unbounded();
		let state = Arc::new(WorkerState::default());
		state.alive.store(true, Ordering::Release);

		let backend = self.backend.clone();
		let config = self.config.clone();
		let jobs = self.jobs_rx.clone();
		let weak: Weak<FarmInner> = Arc::downgrade(self);
		let worker_state = state.clone();

		let join = std::thread::Builder::new()
			.name(format!("warper-{id}"))
			.spawn(move || {
				let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
					run_worker(id, backend, config, jobs, control_rx, worker_state.clone());
				}));
				if result.is_err() {
					log::warn!("warper worker {id} died by panic; in-flight request fails as WorkerLost");
				}
				// replace ourselves unless the farm is going away
				if let Some(inner) = weak.upgrade() {
					if !inner.shutdown.load(Ordering::Acquire) {
						inner.spawn_worker();
					}
				}
				worker_state.alive.store(false, Ordering::Release);
			})
			.expect("spawning a warper worker thread");

		self.workers.lock().push(WorkerSlot {
			id,
			control: control_tx,
			state,
			join: Some(join),
		});
	}

	/// Reaps exited workers and enforces the RSS budget.
	fn housekeeping_tick(self: &Arc<Self>) {
		// Pull dead slots out under the lock, join them outside of it.
		let dead: Vec<WorkerSlot> = {
			let mut workers = self.workers.lock();
			let (dead, live) = std::mem::take(&mut *workers)
				.into_iter()
				.partition(|slot| !slot.state.alive.load(Ordering::Acquire));
			*workers = live;
			dead
		};
		for mut slot in dead {
			log::debug!("reaping warper worker {}", slot.id);
			if let Some(join) = slot.join.take() {
				let _ = join.join();
			}
		}

		if let Some(limit) = self.config.rss_limit {
			let rss = process_rss();
			if rss > limit {
				log::warn!("warper farm RSS {rss} exceeds budget {limit}; recycling the largest idle worker");
				let workers = self.workers.lock();
				let victim = workers
					.iter()
					.filter(|w| !w.state.busy.load(Ordering::Acquire) && w.state.alive.load(Ordering::Acquire))
					.max_by_key(|w| w.state.cache_bytes.load(Ordering::Relaxed));
				if let Some(victim) = victim {
					let _ = victim.control.send(Control::Exit);
				}
			}
		}
	}
}

fn spawn_housekeeping(inner: &Arc<FarmInner>) {
	let weak = Arc::downgrade(inner);
	let period = inner.config.rss_check_period;
	std::thread::Builder::new()
		.name(String::from("warper-housekeeping"))
		.spawn(move || {
			loop {
				std::thread::sleep(period);
				let Some(inner) = weak.upgrade() else {
					break;
				};
				if inner.shutdown.load(Ordering::Acquire) {
					break;
				}
				inner.housekeeping_tick();
			}
		})
		.expect("spawning the warper housekeeping thread");
}

/// Resident set size of this process, in bytes.
fn process_rss() -> u64 {
	use sysinfo::{ProcessesToUpdate, System};

	let Ok(pid) = sysinfo::get_current_pid() else {
		return 0;
	};
	let mut system = System::new();
	system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
	system.process(pid).map_or(0, |process| process.memory())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::mock::{MOCK_WORLD, MockBackend, MockProfile};
	use crate::backend::{GeoDataset, WarpParams};
	use crate::types::{Resampling, Size};
	use std::path::{Path, PathBuf};

	fn test_farm(workers: usize, max_requests: u64) -> Farm {
		let backend = Arc::new(MockBackend::new());
		backend.register("terrain.dem", MockProfile::dem(Size::new(256, 256), 400.0));
		Farm::new(
			backend,
			FarmConfig {
				workers,
				max_requests_per_worker: max_requests,
				rss_check_period: Duration::from_millis(50),
				..FarmConfig::default()
			},
		)
	}

	fn image_request(size: u32) -> WarpRequest {
		WarpRequest {
			dataset: PathBuf::from("ortho.tif"),
			open_options: vec![],
			params: WarpParams {
				extent: MOCK_WORLD,
				dst_srs: String::from("EPSG:3857"),
				size: Size::new(size, size),
				resampling: Resampling::Cubic,
			},
			operation: Operation::Image,
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn warp_roundtrip() -> Result<()> {
		let farm = test_farm(2, 1024);
		let response = farm.warp(image_request(16), &Sink::new()).await?;
		let buf = response.into_raster()?;
		assert_eq!(buf.size, Size::new(16, 16));
		assert_eq!(buf.channels, 3);
		farm.shutdown();
		Ok(())
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn concurrent_requests_all_answered() -> Result<()> {
		let farm = test_farm(4, 1024);
		let mut handles = Vec::new();
		for _ in 0..32 {
			let farm = farm.clone();
			handles.push(tokio::spawn(async move {
				farm.warp(image_request(8), &Sink::new()).await
			}));
		}
		for handle in handles {
			handle.await.unwrap()?.into_raster()?;
		}
		farm.shutdown();
		Ok(())
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn cancelled_sink_short_circuits() {
		let farm = test_farm(1, 1024);
		let sink = Sink::new();
		sink.abort();
		let err = farm.warp(image_request(8), &sink).await.unwrap_err();
		assert!(matches!(TileError::of(&err), Some(TileError::Cancelled)));
		farm.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn workers_recycle_and_farm_keeps_serving() -> Result<()> {
		let farm = test_farm(1, 1);
		for _ in 0..4 {
			farm.warp(image_request(4), &Sink::new()).await?.into_raster()?;
		}
		farm.shutdown();
		Ok(())
	}

	/// A backend whose first open panics: the in-flight request surfaces as
	/// WorkerLost internally and the farm's single retry succeeds.
	struct FlakyBackend {
		fail_once: AtomicBool,
		inner: MockBackend,
	}

	impl RasterBackend for FlakyBackend {
		fn name(&self) -> &'static str {
			"flaky"
		}
		fn open(&self, path: &Path, open_options: &[String]) -> Result<Box<dyn GeoDataset>> {
			if self.fail_once.swap(false, Ordering::AcqRel) {
				panic!("simulated worker crash");
			}
			self.inner.open(path, open_options)
		}
		fn write_geotiff(
			&self,
			path: &Path,
			buf: &crate::types::RasterBuf,
			extent: &crate::types::GeoExtent,
			srs: &str,
			nodata: Option<f64>,
		) -> Result<()> {
			self.inner.write_geotiff(path, buf, extent, srs, nodata)
		}
		fn heightcode(
			&self,
			vector: &Path,
			dems: &[PathBuf],
			config: &crate::backend::HeightcodeConfig,
			sink: &Sink,
		) -> Result<cartolina_core::Blob> {
			self.inner.heightcode(vector, dems, config, sink)
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn worker_crash_is_retried_once() -> Result<()> {
		let backend = Arc::new(FlakyBackend {
			fail_once: AtomicBool::new(true),
			inner: MockBackend::new(),
		});
		let farm = Farm::new(
			backend,
			FarmConfig {
				workers: 2,
				..FarmConfig::default()
			},
		);

		let buf = farm.warp(image_request(4), &Sink::new()).await?.into_raster()?;
		assert_eq!(buf.size, Size::new(4, 4));
		farm.shutdown();
		Ok(())
	}
}
