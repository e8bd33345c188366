//! Resource-backend poller: re-reads the catalogue on a fixed period and on
//! demand (`update-resources`), feeding the reconciler. Load failures keep
//! the previous resource set and never abort the server.

use anyhow::{Context, Result};
use cartolina_generators::{GeneratorRegistry, loader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct Poller {
	registry: Arc<GeneratorRegistry>,
	catalogue: PathBuf,
	registry_file: Option<PathBuf>,
	/// Serialises polls; an explicit `update-resources` and the periodic
	/// tick collapse instead of racing.
	poll_lock: Mutex<()>,
}

impl Poller {
	pub fn new(registry: Arc<GeneratorRegistry>, catalogue: PathBuf, registry_file: Option<PathBuf>) -> Arc<Poller> {
		Arc::new(Poller {
			registry,
			catalogue,
			registry_file,
			poll_lock: Mutex::new(()),
		})
	}

	/// One full poll: load the registry file and the catalogue, reconcile.
	/// Returns the completion token.
	pub async fn poll_now(&self) -> Result<u64> {
		let _guard = self.poll_lock.lock().await;

		let shared = match &self.registry_file {
			Some(path) => {
				let path = path.clone();
				Some(
					tokio::task::spawn_blocking(move || loader::load_registry_file(&path))
						.await
						.context("registry load task failed")??,
				)
			}
			None => None,
		};

		let registry = self.registry.clone();
		let catalogue = self.catalogue.clone();
		let resources = tokio::task::spawn_blocking(move || loader::load_catalogue(&catalogue, &registry))
			.await
			.context("catalogue load task failed")??;

		let summary = self.registry.apply(resources, shared);
		Ok(summary.token)
	}

	/// The periodic poll loop; runs until the process exits.
	pub async fn run(self: Arc<Self>, period: Duration) {
		let mut ticker = tokio::time::interval(period);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// the first tick fires immediately; the initial load already ran
		ticker.tick().await;
		loop {
			ticker.tick().await;
			match self.poll_now().await {
				Ok(token) => log::debug!("periodic catalogue poll complete (token {token})"),
				Err(err) => log::warn!("catalogue poll failed, keeping the current resource set: {err:#}"),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cartolina_generators::registry::RegistryConfig;
	use cartolina_generators::{ResourceId, producers};
	use cartolina_warp::backend::mock::MockBackend;
	use cartolina_warp::farm::{Farm, FarmConfig};

	fn catalogue_json(id: &str) -> String {
		format!(
			r#"{{
				"group": "g", "id": "{id}", "type": "tms", "driver": "tms-raster",
				"referenceFrames": {{"webmercator": {{"lodRange": [0, 4], "tileRange": [[0, 0], [0, 0]]}}}},
				"definition": {{"dataset": "{id}.tif"}}
			}}"#
		)
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn polling_applies_catalogue_changes() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let catalogue = dir.path().join("resources.json");
		std::fs::write(&catalogue, catalogue_json("a"))?;

		let backend = Arc::new(MockBackend::new());
		let farm = Farm::new(
			backend.clone(),
			FarmConfig {
				workers: 1,
				..FarmConfig::default()
			},
		);
		let registry = Arc::new(
			GeneratorRegistry::new(
				farm,
				backend,
				RegistryConfig {
					store_root: dir.path().join("store"),
					..RegistryConfig::default()
				},
				producers::all_factories(),
			)
			.unwrap(),
		);
		let poller = Poller::new(registry.clone(), catalogue.clone(), None);

		let first = poller.poll_now().await?;
		assert!(registry.has_resource(&ResourceId::new("webmercator", "g", "a")));
		assert!(registry.updated_since(first));

		// swap the catalogue; the next poll reconciles
		std::fs::write(&catalogue, catalogue_json("b"))?;
		let second = poller.poll_now().await?;
		assert!(second >= first);
		assert!(!registry.has_resource(&ResourceId::new("webmercator", "g", "a")));
		assert!(registry.has_resource(&ResourceId::new("webmercator", "g", "b")));

		// a broken catalogue keeps the current set
		std::fs::write(&catalogue, "{ not json")?;
		assert!(poller.poll_now().await.is_err());
		assert!(registry.has_resource(&ResourceId::new("webmercator", "g", "b")));
		Ok(())
	}
}
