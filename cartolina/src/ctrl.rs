//! Control plane: an operator-facing line protocol over a local TCP
//! listener. Each command is one line; each reply is one line.
//!
//! ```text
//! list-resources
//! update-resources                      -> uint64 token (us since epoch)
//! updated-since <ts> [rf group id [bool]]
//! has-resource <rf> <group> <id>
//! is-resource-ready <rf> <group> <id>
//! resource-url <rf> <group> <id>
//! supports-reference-frame <rf>
//! ```

use crate::poller::Poller;
use anyhow::{Context, Result};
use cartolina_generators::{GeneratorRegistry, ResourceId};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub struct CtrlPlane {
	registry: Arc<GeneratorRegistry>,
	poller: Arc<Poller>,
}

impl CtrlPlane {
	pub fn new(registry: Arc<GeneratorRegistry>, poller: Arc<Poller>) -> Arc<CtrlPlane> {
		Arc::new(CtrlPlane { registry, poller })
	}

	/// Executes one command line and renders the reply line.
	pub async fn handle_command(&self, line: &str) -> String {
		let parts: Vec<&str> = line.split_whitespace().collect();
		match parts.as_slice() {
			["list-resources"] => {
				let rows: Vec<String> = self
					.registry
					.list()
					.into_iter()
					.map(|info| {
						format!(
							"{} {} r{} {:?}",
							info.id, info.gen.driver, info.revision, info.state
						)
					})
					.collect();
				if rows.is_empty() {
					String::from("(no resources)")
				} else {
					rows.join(" | ")
				}
			}

			["update-resources"] => match self.poller.poll_now().await {
				Ok(token) => token.to_string(),
				Err(err) => format!("error: {err:#}"),
			},

			["updated-since", ts, rest @ ..] => {
				let Ok(ts) = ts.parse::<u64>() else {
					return String::from("error: timestamp must be a uint64");
				};
				let mut updated = self.registry.updated_since(ts);
				if let [rf, group, id, rest @ ..] = rest {
					let resource = ResourceId::new(rf, group, id);
					updated = updated && self.registry.has_resource(&resource);
					if let [expect_ready] = rest {
						let Ok(expect_ready) = expect_ready.parse::<bool>() else {
							return String::from("error: expected a bool");
						};
						updated = updated && (self.registry.is_ready(&resource) == expect_ready);
					}
				}
				updated.to_string()
			}

			["has-resource", rf, group, id] => self.registry.has_resource(&ResourceId::new(rf, group, id)).to_string(),

			["is-resource-ready", rf, group, id] => {
				self.registry.is_ready(&ResourceId::new(rf, group, id)).to_string()
			}

			["resource-url", rf, group, id] => match self.registry.resource_url(&ResourceId::new(rf, group, id)) {
				Some(url) => url,
				None => String::from("error: no such resource"),
			},

			["supports-reference-frame", rf] => self.registry.supports_reference_frame(rf).to_string(),

			[] => String::new(),
			_ => format!("error: unknown command '{line}'"),
		}
	}

	/// Accept loop; one task per connection, one reply line per command
	/// line.
	pub async fn serve(self: Arc<Self>, listen: &str) -> Result<()> {
		let listener = TcpListener::bind(listen)
			.await
			.with_context(|| format!("binding ctrl listener {listen}"))?;
		log::info!("ctrl listening on {listen}");

		loop {
			let (socket, peer) = listener.accept().await?;
			log::debug!("ctrl connection from {peer}");
			let ctrl = self.clone();
			tokio::spawn(async move {
				let (reader, mut writer) = socket.into_split();
				let mut lines = BufReader::new(reader).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					let mut reply = ctrl.handle_command(line.trim()).await;
					reply.push('\n');
					if writer.write_all(reply.as_bytes()).await.is_err() {
						break;
					}
				}
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cartolina_generators::registry::RegistryConfig;
	use cartolina_generators::producers;
	use cartolina_warp::backend::mock::MockBackend;
	use cartolina_warp::farm::{Farm, FarmConfig};
	use std::time::Duration;

	async fn ctrl_fixture() -> (Arc<CtrlPlane>, Arc<GeneratorRegistry>, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let catalogue = dir.path().join("resources.json");
		std::fs::write(
			&catalogue,
			r#"{"include": "defs/*.json"}"#,
		)
		.unwrap();
		std::fs::create_dir(dir.path().join("defs")).unwrap();
		for id in ["a", "b"] {
			std::fs::write(
				dir.path().join(format!("defs/{id}.json")),
				format!(
					r#"{{
						"group": "g", "id": "{id}", "type": "tms", "driver": "tms-raster",
						"referenceFrames": {{"webmercator": {{"lodRange": [0, 4], "tileRange": [[0, 0], [0, 0]]}}}},
						"definition": {{"dataset": "{id}.tif"}}
					}}"#
				),
			)
			.unwrap();
		}

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
		let poller = Poller::new(registry.clone(), catalogue, None);
		(CtrlPlane::new(registry.clone(), poller), registry, dir)
	}

	async fn wait_ready(registry: &GeneratorRegistry, id: &ResourceId) {
		for _ in 0..200 {
			if registry.is_ready(id) {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("resource {id} never became ready");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn include_glob_catalogue_end_to_end() {
		let (ctrl, registry, _dir) = ctrl_fixture().await;

		let token: u64 = ctrl.handle_command("update-resources").await.parse().unwrap();
		assert!(token > 0);

		assert_eq!(ctrl.handle_command("has-resource webmercator g a").await, "true");
		assert_eq!(ctrl.handle_command("has-resource webmercator g b").await, "true");
		assert_eq!(ctrl.handle_command("has-resource webmercator g c").await, "false");

		wait_ready(&registry, &ResourceId::new("webmercator", "g", "a")).await;
		assert_eq!(ctrl.handle_command("is-resource-ready webmercator g a").await, "true");

		assert_eq!(ctrl.handle_command(&format!("updated-since {token}")).await, "true");
		assert_eq!(
			ctrl.handle_command(&format!("updated-since {}", token + 1_000_000)).await,
			"false"
		);
		assert_eq!(
			ctrl.handle_command(&format!("updated-since {token} webmercator g a true")).await,
			"true"
		);

		let url = ctrl.handle_command("resource-url webmercator g a").await;
		assert!(url.contains("{lod}-{x}-{y}"));
		assert!(url.contains("?gr="));

		assert_eq!(ctrl.handle_command("supports-reference-frame webmercator").await, "true");
		assert_eq!(ctrl.handle_command("supports-reference-frame marsgrid").await, "false");

		let listing = ctrl.handle_command("list-resources").await;
		assert!(listing.contains("webmercator/g/a"));
		assert!(listing.contains("tms-raster"));

		assert!(ctrl.handle_command("bogus command").await.starts_with("error:"));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn line_protocol_over_tcp() -> Result<()> {
		let (ctrl, _registry, _dir) = ctrl_fixture().await;
		ctrl.handle_command("update-resources").await;

		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		drop(listener);
		let serve_ctrl = ctrl.clone();
		let listen = addr.to_string();
		tokio::spawn(async move {
			let _ = serve_ctrl.serve(&listen).await;
		});
		tokio::time::sleep(Duration::from_millis(100)).await;

		let socket = tokio::net::TcpStream::connect(addr).await?;
		let (reader, mut writer) = socket.into_split();
		writer.write_all(b"has-resource webmercator g a\n").await?;
		let mut lines = BufReader::new(reader).lines();
		let reply = lines.next_line().await?.unwrap();
		assert_eq!(reply, "true");
		Ok(())
	}
}
