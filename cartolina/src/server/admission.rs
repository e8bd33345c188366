//! Per-tile admission: at-most-one concurrent build per request
//! fingerprint. Concurrent callers piggy-back onto the in-flight build and
//! receive byte-identical bodies; when the last waiter goes away the build's
//! sink is aborted. There is no on-disk cache at this layer.

use cartolina_core::Sink;
use cartolina_generators::{Generator, ResourceId, TileArtifact, TileRequest};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The per-tile cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
	pub resource: ResourceId,
	/// Interface the request came in on (tms / surface / geodata).
	pub interface: &'static str,
	pub request: TileRequest,
}

type SharedError = Arc<anyhow::Error>;
type BuildFuture = Shared<BoxFuture<'static, Result<TileArtifact, SharedError>>>;

#[derive(Clone)]
struct BuildEntry {
	future: BuildFuture,
	sink: Sink,
	waiters: Arc<AtomicUsize>,
}

type InflightMap = Arc<DashMap<RequestFingerprint, BuildEntry>>;

#[derive(Clone, Default)]
pub struct Admission {
	inflight: InflightMap,
}

impl Admission {
	pub fn new() -> Admission {
		Admission::default()
	}

	/// Number of builds currently in flight.
	pub fn inflight_count(&self) -> usize {
		self.inflight.len()
	}

	/// Joins the in-flight build for `fingerprint` or starts one.
	pub async fn get_or_build(
		&self,
		fingerprint: RequestFingerprint,
		generator: Arc<dyn Generator>,
	) -> Result<TileArtifact, SharedError> {
		let entry = match self.inflight.entry(fingerprint.clone()) {
			Entry::Occupied(occupied) => {
				log::trace!("piggy-backing onto in-flight build for {fingerprint:?}");
				occupied.get().clone()
			}
			Entry::Vacant(vacant) => {
				let sink = Sink::new();
				let build_sink = sink.clone();
				let request = fingerprint.request;
				let future = async move { generator.generate(&request, &build_sink).await.map_err(Arc::new) }
					.boxed()
					.shared();
				let entry = BuildEntry {
					future,
					sink,
					waiters: Arc::new(AtomicUsize::new(0)),
				};
				vacant.insert(entry.clone());
				entry
			}
		};

		let _guard = WaiterGuard::register(&self.inflight, &fingerprint, &entry);
		let result = entry.future.clone().await;
		// completed builds leave the map so later requests rebuild
		self.inflight.remove(&fingerprint);
		result
	}
}

/// Tracks one waiter; when the last waiter drops (including on client
/// disconnect) the build is aborted and the entry evicted.
struct WaiterGuard {
	map: InflightMap,
	fingerprint: RequestFingerprint,
	sink: Sink,
	waiters: Arc<AtomicUsize>,
}

impl WaiterGuard {
	fn register(map: &InflightMap, fingerprint: &RequestFingerprint, entry: &BuildEntry) -> WaiterGuard {
		entry.waiters.fetch_add(1, Ordering::AcqRel);
		WaiterGuard {
			map: map.clone(),
			fingerprint: fingerprint.clone(),
			sink: entry.sink.clone(),
			waiters: entry.waiters.clone(),
		}
	}
}

impl Drop for WaiterGuard {
	fn drop(&mut self) {
		if self.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.sink.abort();
			self.map.remove(&self.fingerprint);
		}
	}
}
