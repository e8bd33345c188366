//! Reconciles a freshly loaded catalogue against the running resource set.
//!
//! For every wanted resource the diff against the current revision decides:
//! added resources are instantiated and prepared; `safe` changes swap the
//! definition without invalidation; `revision-bump` changes increment the
//! revision and re-prepare; incompatible changes replace the resource unless
//! its type is frozen and the old revision is already serving, in which case
//! the change is rejected with a warning. Removed resources stop serving and
//! optionally have their prepared state purged. Per-resource errors leave
//! the old entry in place; they never abort the reload.

use super::{GeneratorRegistry, GeneratorState};
use crate::resource::{Changed, Resource, ResourceId};
use cartolina_core::RegistrySnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counters of one reload, plus the completion token handed to ctrl
/// clients.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReloadSummary {
	pub token: u64,
	pub added: usize,
	pub removed: usize,
	pub replaced: usize,
	pub bumped: usize,
	pub safe_swapped: usize,
	pub kept: usize,
	pub rejected_frozen: usize,
	pub failed: usize,
}

impl GeneratorRegistry {
	/// Applies one catalogue load. `shared_registry` replaces the process
	/// snapshot when given (reloads may change the registry file too).
	pub fn apply(&self, wanted: Vec<Resource>, shared_registry: Option<RegistrySnapshot>) -> ReloadSummary {
		if let Some(snapshot) = shared_registry {
			self.swap_shared_registry(snapshot);
		}

		let current = self.snapshot();
		let mut next: BTreeMap<ResourceId, Arc<super::GeneratorEntry>> = BTreeMap::new();
		let mut summary = ReloadSummary::default();
		let mut wanted_ids: Vec<ResourceId> = Vec::with_capacity(wanted.len());

		for mut resource in wanted {
			let id = resource.id.clone();
			wanted_ids.push(id.clone());

			let Some(factory) = self.factory(&resource.gen) else {
				log::error!(
					"resource {id}: no factory for ({:?}, '{}'); keeping the previous revision if any",
					resource.gen.kind,
					resource.gen.driver
				);
				summary.failed += 1;
				if let Some(old) = current.get(&id) {
					next.insert(id, old.clone());
				}
				continue;
			};

			match current.get(&id) {
				None => {
					match self.build_entry(resource) {
						Ok(entry) => {
							Self::schedule_prepare(&entry);
							next.insert(id, entry);
							summary.added += 1;
						}
						Err(err) => {
							log::error!("resource {id}: instantiation failed: {err:#}");
							summary.failed += 1;
						}
					}
				}
				Some(old) => {
					let old_resource = old.generator.resource();
					match resource.changed(old_resource, factory.needs_ranges) {
						Changed::No => {
							next.insert(id, old.clone());
							summary.kept += 1;
						}
						Changed::Safe => {
							// no invalidation: same revision, prepared state
							// is adopted by the rebuilt generator
							resource.revision = resource.revision.max(old_resource.revision);
							self.replace_entry(&mut next, old, resource, &mut summary.safe_swapped, &mut summary.failed);
						}
						Changed::RevisionBump => {
							resource.revision = resource.revision.max(old_resource.revision + 1);
							log::info!("resource {id}: revision bump to {}", resource.revision);
							self.replace_entry(&mut next, old, resource, &mut summary.bumped, &mut summary.failed);
						}
						Changed::Yes => {
							let frozen = self.config.freeze_types.contains(&resource.gen.kind);
							if frozen && old.state().serving() {
								log::warn!(
									"resource {id}: incompatible change rejected, resource type is frozen; keeping revision {}",
									old_resource.revision
								);
								old.state.store(Arc::new(GeneratorState::Frozen));
								next.insert(id, old.clone());
								summary.rejected_frozen += 1;
							} else {
								resource.revision = resource.revision.max(old_resource.revision);
								self.replace_entry(&mut next, old, resource, &mut summary.replaced, &mut summary.failed);
							}
						}
					}
				}
			}
		}

		// removed: everything current that is no longer wanted
		for (id, entry) in current.iter() {
			if wanted_ids.contains(id) {
				continue;
			}
			summary.removed += 1;
			log::info!("resource {id} removed from the catalogue");
			if self.config.purge_removed {
				match self.context_for(entry.generator.resource().clone()) {
					Ok(ctx) => {
						let dir = ctx.storage_path();
						if dir.exists() {
							if let Err(err) = std::fs::remove_dir_all(&dir) {
								log::warn!("purging {dir:?} failed: {err}");
							} else {
								log::info!("purged prepared state {dir:?}");
							}
						}
					}
					Err(err) => log::warn!("cannot resolve storage of removed resource {id}: {err:#}"),
				}
			}
		}

		summary.token = self.publish(next);
		log::info!(
			"catalogue reload complete (token {}): {} added, {} removed, {} replaced, {} bumped, {} safe, {} kept, {} frozen-rejected, {} failed",
			summary.token,
			summary.added,
			summary.removed,
			summary.replaced,
			summary.bumped,
			summary.safe_swapped,
			summary.kept,
			summary.rejected_frozen,
			summary.failed
		);
		summary
	}

	/// Replace one entry with a rebuilt generator; on failure the old entry
	/// stays and the failure lands on the counter.
	fn replace_entry(
		&self,
		next: &mut BTreeMap<ResourceId, Arc<super::GeneratorEntry>>,
		old: &Arc<super::GeneratorEntry>,
		resource: Resource,
		counter: &mut usize,
		failed: &mut usize,
	) {
		let id = resource.id.clone();
		match self.build_entry(resource) {
			Ok(entry) => {
				Self::schedule_prepare(&entry);
				next.insert(id, entry);
				*counter += 1;
			}
			Err(err) => {
				log::error!("resource {id}: rebuild failed, keeping the previous revision: {err:#}");
				next.insert(id, old.clone());
				*failed += 1;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::producers::all_factories;
	use crate::registry::RegistryConfig;
	use crate::resource::definitions::{TmsGdaldemDef, TmsRasterDef};
	use crate::resource::{GeneratorKind, GeneratorRef};
	use cartolina_core::{FileClassSettings, LodRange, RegistryPatch, TileRange};
	use cartolina_warp::backend::mock::MockBackend;
	use cartolina_warp::dem::{DemAlgorithm, DemOptions};
	use cartolina_warp::farm::{Farm, FarmConfig};
	use std::collections::BTreeSet;
	use std::path::PathBuf;
	use std::time::Duration;

	fn registry(freeze: Vec<GeneratorKind>) -> (GeneratorRegistry, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let backend = Arc::new(MockBackend::new());
		let farm = Farm::new(
			backend.clone(),
			FarmConfig {
				workers: 1,
				..FarmConfig::default()
			},
		);
		let config = RegistryConfig {
			store_root: dir.path().to_path_buf(),
			freeze_types: freeze,
			purge_removed: false,
			extra_frames: BTreeMap::new(),
		};
		(
			GeneratorRegistry::new(farm, backend, config, all_factories()).unwrap(),
			dir,
		)
	}

	fn raster_resource(id: &str) -> Resource {
		Resource {
			id: ResourceId::new("webmercator", "g", id),
			gen: GeneratorRef::new(GeneratorKind::Tms, "tms-raster"),
			revision: 0,
			lod_range: LodRange::new(0, 8).unwrap(),
			tile_range: TileRange::new(0, 0, 0, 0).unwrap(),
			credits: BTreeSet::new(),
			registry: RegistryPatch::default(),
			file_class_settings: FileClassSettings::default(),
			comment: String::new(),
			definition: Arc::new(TmsRasterDef {
				dataset: PathBuf::from("ortho.tif"),
				..TmsRasterDef::default()
			}),
		}
	}

	fn gdaldem_resource(id: &str, processing: DemAlgorithm) -> Resource {
		let mut resource = raster_resource(id);
		resource.gen = GeneratorRef::new(GeneratorKind::Tms, "tms-gdaldem");
		resource.definition = Arc::new(TmsGdaldemDef {
			dataset: PathBuf::from("dem.tif"),
			processing,
			options: DemOptions::default(),
			mask: None,
			erode_mask: false,
		});
		resource
	}

	async fn wait_ready(registry: &GeneratorRegistry, id: &ResourceId) {
		for _ in 0..200 {
			if registry.is_ready(id) {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("resource {id} never became ready (state: {:?})", registry.state(id));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn added_resources_become_ready() {
		let (registry, _dir) = registry(vec![]);
		let summary = registry.apply(vec![raster_resource("a"), raster_resource("b")], None);
		assert_eq!(summary.added, 2);
		assert!(summary.token > 0);

		let id = ResourceId::new("webmercator", "g", "a");
		assert!(registry.has_resource(&id));
		wait_ready(&registry, &id).await;
		assert!(!registry.has_resource(&ResourceId::new("webmercator", "g", "c")));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn revision_bump_increments_exactly_once() {
		let (registry, _dir) = registry(vec![]);
		let id = ResourceId::new("webmercator", "g", "relief");

		registry.apply(vec![gdaldem_resource("relief", DemAlgorithm::Hillshade)], None);
		wait_ready(&registry, &id).await;
		assert_eq!(registry.list()[0].revision, 0);

		let summary = registry.apply(vec![gdaldem_resource("relief", DemAlgorithm::Slope)], None);
		assert_eq!(summary.bumped, 1);
		wait_ready(&registry, &id).await;
		assert_eq!(registry.list()[0].revision, 1);
		assert!(registry.resource_url(&id).unwrap().contains("r=1"));

		// reloading the same catalogue keeps the revision
		let summary = registry.apply(vec![gdaldem_resource("relief", DemAlgorithm::Slope)], None);
		assert_eq!(summary.kept, 1);
		assert_eq!(registry.list()[0].revision, 1);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn freeze_policy_rejects_incompatible_changes() {
		let (registry, _dir) = registry(vec![GeneratorKind::Tms]);
		let id = ResourceId::new("webmercator", "g", "relief");

		registry.apply(vec![gdaldem_resource("relief", DemAlgorithm::Hillshade)], None);
		wait_ready(&registry, &id).await;

		// dataset change is a yes-level diff
		let mut changed = gdaldem_resource("relief", DemAlgorithm::Hillshade);
		changed.definition = Arc::new(TmsGdaldemDef {
			dataset: PathBuf::from("other-dem.tif"),
			processing: DemAlgorithm::Hillshade,
			options: DemOptions::default(),
			mask: None,
			erode_mask: false,
		});
		let before = registry.update_timestamp();
		let summary = registry.apply(vec![changed], None);

		assert_eq!(summary.rejected_frozen, 1);
		assert_eq!(registry.state(&id), Some(GeneratorState::Frozen));
		// the resource still serves and the reload still completed
		assert!(registry.is_ready(&id));
		assert!(registry.updated_since(before));
		assert!(summary.token > before);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn removed_resources_stop_serving() {
		let (registry, _dir) = registry(vec![]);
		let id_a = ResourceId::new("webmercator", "g", "a");

		registry.apply(vec![raster_resource("a"), raster_resource("b")], None);
		wait_ready(&registry, &id_a).await;

		let summary = registry.apply(vec![raster_resource("b")], None);
		assert_eq!(summary.removed, 1);
		assert!(!registry.has_resource(&id_a));
		assert!(registry.has_resource(&ResourceId::new("webmercator", "g", "b")));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn safe_change_keeps_revision() {
		let (registry, _dir) = registry(vec![]);
		let id = ResourceId::new("webmercator", "g", "a");

		registry.apply(vec![raster_resource("a")], None);
		wait_ready(&registry, &id).await;

		let mut commented = raster_resource("a");
		commented.comment = String::from("new comment");
		let summary = registry.apply(vec![commented], None);
		assert_eq!(summary.safe_swapped, 1);
		wait_ready(&registry, &id).await;
		assert_eq!(registry.list()[0].revision, 0);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn update_tokens_are_monotone() {
		let (registry, _dir) = registry(vec![]);
		let first = registry.apply(vec![], None).token;
		let second = registry.apply(vec![], None).token;
		assert!(second >= first);
		assert!(registry.updated_since(first));
		assert!(!registry.updated_since(second + 1_000_000));
	}
}
