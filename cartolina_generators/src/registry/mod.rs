//! Generator registry: a `(kind, driver)`-keyed factory table, a
//! copy-on-write map of live generators with their per-resource state
//! machines, and the background preparer.
//!
//! Reads (request serving, ctrl queries) are lock-free against the current
//! snapshot; the reconciler builds a new snapshot and swaps it.

mod reconciler;

pub use reconciler::ReloadSummary;

use crate::producers::{Generator, GeneratorContext};
use crate::reference_frame::ReferenceFrame;
use crate::resource::{Definition, GeneratorKind, GeneratorRef, Resource, ResourceId};
use anyhow::{Result, bail};
use arc_swap::ArcSwap;
use cartolina_core::{RegistrySnapshot, Sink};
use cartolina_warp::backend::RasterBackend;
use cartolina_warp::farm::Farm;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One registered producer constructor. Factories are registered explicitly
/// at startup via [`crate::producers::all_factories`]; pre-main registration
/// is deliberately avoided.
pub struct GeneratorFactory {
	pub kind: GeneratorKind,
	pub driver: &'static str,
	/// Whether resources of this driver must carry lod/tile ranges.
	pub needs_ranges: bool,
	pub parse_definition: fn(&serde_json::Value) -> Result<Arc<dyn Definition>>,
	pub build: fn(GeneratorContext) -> Result<Arc<dyn Generator>>,
}

/// Per-resource lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GeneratorState {
	NotReady,
	Preparing,
	Ready,
	Failed(String),
	/// A frozen resource keeps serving its last ready revision; catalogue
	/// changes are rejected.
	Frozen,
}

impl GeneratorState {
	/// Ready and Frozen resources both serve tiles.
	pub fn serving(&self) -> bool {
		matches!(self, GeneratorState::Ready | GeneratorState::Frozen)
	}
}

pub(crate) struct GeneratorEntry {
	pub generator: Arc<dyn Generator>,
	pub state: ArcSwap<GeneratorState>,
	prepare_running: AtomicBool,
}

impl GeneratorEntry {
	fn new(generator: Arc<dyn Generator>) -> Arc<GeneratorEntry> {
		Arc::new(GeneratorEntry {
			generator,
			state: ArcSwap::from_pointee(GeneratorState::NotReady),
			prepare_running: AtomicBool::new(false),
		})
	}

	pub fn state(&self) -> GeneratorState {
		self.state.load().as_ref().clone()
	}
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
	/// Root of the prepared-state store.
	pub store_root: PathBuf,
	/// Kinds whose ready resources reject incompatible catalogue changes.
	pub freeze_types: Vec<GeneratorKind>,
	/// Delete prepared artifacts of removed resources.
	pub purge_removed: bool,
	/// Reference frames defined outside the built-in set.
	pub extra_frames: BTreeMap<String, ReferenceFrame>,
}

impl Default for RegistryConfig {
	fn default() -> RegistryConfig {
		RegistryConfig {
			store_root: PathBuf::from("store"),
			freeze_types: Vec::new(),
			purge_removed: false,
			extra_frames: BTreeMap::new(),
		}
	}
}

/// A row of `list-resources`.
#[derive(Clone, Debug)]
pub struct ResourceInfo {
	pub id: ResourceId,
	pub gen: GeneratorRef,
	pub revision: u32,
	pub state: GeneratorState,
}

type EntryMap = BTreeMap<ResourceId, Arc<GeneratorEntry>>;

pub struct GeneratorRegistry {
	factories: BTreeMap<(GeneratorKind, String), GeneratorFactory>,
	current: ArcSwap<EntryMap>,
	shared_registry: ArcSwap<RegistrySnapshot>,
	pub(crate) farm: Farm,
	pub(crate) backend: Arc<dyn RasterBackend>,
	pub(crate) config: RegistryConfig,
	/// Token (µs since epoch) of the last completed reload.
	last_update: AtomicU64,
}

impl GeneratorRegistry {
	pub fn new(
		farm: Farm,
		backend: Arc<dyn RasterBackend>,
		config: RegistryConfig,
		factories: Vec<GeneratorFactory>,
	) -> Result<GeneratorRegistry> {
		let mut table = BTreeMap::new();
		for factory in factories {
			let key = (factory.kind, factory.driver.to_string());
			if table.insert(key.clone(), factory).is_some() {
				bail!("duplicate generator factory for ({:?}, '{}')", key.0, key.1);
			}
		}
		Ok(GeneratorRegistry {
			factories: table,
			current: ArcSwap::from_pointee(EntryMap::new()),
			shared_registry: ArcSwap::from_pointee(RegistrySnapshot::default()),
			farm,
			backend,
			config,
			last_update: AtomicU64::new(0),
		})
	}

	pub fn factory(&self, gen: &GeneratorRef) -> Option<&GeneratorFactory> {
		self.factories.get(&(gen.kind, gen.driver.clone()))
	}

	pub fn shared_registry(&self) -> Arc<RegistrySnapshot> {
		self.shared_registry.load_full()
	}

	pub(crate) fn swap_shared_registry(&self, snapshot: RegistrySnapshot) {
		self.shared_registry.store(Arc::new(snapshot));
	}

	/// Builds the construction context for one resource.
	pub(crate) fn context_for(&self, resource: Resource) -> Result<GeneratorContext> {
		let frame = crate::reference_frame::resolve_frame(&resource.id.reference_frame, &self.config.extra_frames)?;
		let registry = Arc::new(self.shared_registry.load().patched(&resource.registry));
		Ok(GeneratorContext {
			resource,
			frame,
			farm: self.farm.clone(),
			backend: self.backend.clone(),
			registry,
			store_root: self.config.store_root.clone(),
		})
	}

	pub(crate) fn build_entry(&self, resource: Resource) -> Result<Arc<GeneratorEntry>> {
		let factory = self
			.factory(&resource.gen)
			.ok_or_else(|| anyhow::anyhow!("no factory registered for ({:?}, '{}')", resource.gen.kind, resource.gen.driver))?;
		let generator = (factory.build)(self.context_for(resource)?)?;
		Ok(GeneratorEntry::new(generator))
	}

	/// Kicks off background preparation. Concurrent calls collapse onto the
	/// running task; preparing a ready resource is a no-op.
	pub(crate) fn schedule_prepare(entry: &Arc<GeneratorEntry>) {
		if entry.state().serving() {
			return;
		}
		if entry.prepare_running.swap(true, Ordering::AcqRel) {
			return;
		}
		entry.state.store(Arc::new(GeneratorState::Preparing));

		let entry = entry.clone();
		tokio::spawn(async move {
			let id = entry.generator.resource().id.clone();
			match entry.generator.prepare(&Sink::new()).await {
				Ok(()) => {
					// release-store publishes everything prepare() wrote
					entry.state.store(Arc::new(GeneratorState::Ready));
					log::info!("resource {id} is ready");
				}
				Err(err) => {
					log::warn!("preparing resource {id} failed: {err:#}");
					entry.state.store(Arc::new(GeneratorState::Failed(format!("{err:#}"))));
				}
			}
			entry.prepare_running.store(false, Ordering::Release);
		});
	}

	// -- query surface -------------------------------------------------------

	pub fn has_resource(&self, id: &ResourceId) -> bool {
		self.current.load().contains_key(id)
	}

	pub fn state(&self, id: &ResourceId) -> Option<GeneratorState> {
		self.current.load().get(id).map(|entry| entry.state())
	}

	pub fn is_ready(&self, id: &ResourceId) -> bool {
		self.state(id).is_some_and(|state| state.serving())
	}

	/// The generator for serving; `None` when unknown, `Some(Err)` when not
	/// ready yet.
	pub fn generator(&self, id: &ResourceId) -> Option<Result<Arc<dyn Generator>>> {
		let map = self.current.load();
		let entry = map.get(id)?;
		if entry.state().serving() {
			Some(Ok(entry.generator.clone()))
		} else {
			Some(Err(cartolina_core::TileError::unavailable(id.to_string())))
		}
	}

	pub fn list(&self) -> Vec<ResourceInfo> {
		self
			.current
			.load()
			.iter()
			.map(|(id, entry)| {
				let resource = entry.generator.resource();
				ResourceInfo {
					id: id.clone(),
					gen: resource.gen.clone(),
					revision: resource.revision,
					state: entry.state(),
				}
			})
			.collect()
	}

	pub fn resource_url(&self, id: &ResourceId) -> Option<String> {
		let map = self.current.load();
		map.get(id).map(|entry| entry.generator.url_template())
	}

	pub fn supports_reference_frame(&self, name: &str) -> bool {
		self.config.extra_frames.contains_key(name) || ReferenceFrame::builtin().contains_key(name)
	}

	pub fn update_timestamp(&self) -> u64 {
		self.last_update.load(Ordering::Acquire)
	}

	/// True once a reload with token `>= ts` has completed.
	pub fn updated_since(&self, ts: u64) -> bool {
		self.update_timestamp() >= ts
	}

	pub(crate) fn snapshot(&self) -> Arc<EntryMap> {
		self.current.load_full()
	}

	pub(crate) fn publish(&self, map: EntryMap) -> u64 {
		self.current.store(Arc::new(map));
		let token = now_micros();
		self.last_update.store(token, Ordering::Release);
		token
	}
}

pub(crate) fn now_micros() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_micros() as u64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::producers::all_factories;
	use cartolina_warp::backend::mock::MockBackend;
	use cartolina_warp::farm::FarmConfig;

	fn test_registry() -> GeneratorRegistry {
		let backend = Arc::new(MockBackend::new());
		let farm = Farm::new(
			backend.clone(),
			FarmConfig {
				workers: 1,
				..FarmConfig::default()
			},
		);
		GeneratorRegistry::new(farm, backend, RegistryConfig::default(), all_factories()).unwrap()
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn factories_register_uniquely() {
		let registry = test_registry();
		assert!(registry
			.factory(&GeneratorRef::new(GeneratorKind::Tms, "tms-raster"))
			.is_some());
		assert!(registry
			.factory(&GeneratorRef::new(GeneratorKind::Surface, "surface-dem"))
			.is_some());
		assert!(registry
			.factory(&GeneratorRef::new(GeneratorKind::Tms, "no-such-driver"))
			.is_none());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn duplicate_factory_registration_fails() {
		let backend = Arc::new(MockBackend::new());
		let farm = Farm::new(backend.clone(), FarmConfig {
			workers: 1,
			..FarmConfig::default()
		});
		let mut factories = all_factories();
		factories.push(crate::producers::tms::factory());
		assert!(GeneratorRegistry::new(farm, backend, RegistryConfig::default(), factories).is_err());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn unknown_reference_frame_support() {
		let registry = test_registry();
		assert!(registry.supports_reference_frame("webmercator"));
		assert!(!registry.supports_reference_frame("marsgrid"));
	}
}
