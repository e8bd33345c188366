//! Server configuration loader.
//!
//! Configuration is a YAML file parsed into the [`Config`] struct tree.
//! Every leaf accepts an environment override whose name is the dotted key
//! with dots replaced by underscores (checked verbatim and in upper case):
//! `gdal.rss_limit` is overridden by `gdal_rss_limit` or `GDAL_RSS_LIMIT`.
//! CLI flags (see `main.rs`) override both.
//!
//! ## YAML shape
//!
//! ```yaml
//! store:
//!   path: /var/lib/cartolina/store
//! http:
//!   listen: 0.0.0.0:3070
//!   thread_count: 8          # optional
//!   client_thread_count: 4   # optional
//!   enable_browser: false
//!   external_url: https://tiles.example.org
//! core:
//!   thread_count: 8          # optional
//! gdal:
//!   process_count: 8         # optional, defaults to hardware concurrency
//!   tmp_root: /tmp/cartolina
//!   rss_limit: 4294967296    # bytes, optional
//!   rss_check_period: 10     # seconds
//! resource_backend:
//!   type: conffile
//!   root: /etc/cartolina/resources.json
//!   registry: /etc/cartolina/registry.json   # optional
//!   update_period: 300
//!   freeze: [surface]
//!   purge_removed: false
//! introspection:
//!   default_fov: 45.0
//! max_age:
//!   data: 604800
//! ctrl:
//!   listen: 127.0.0.1:3071
//! ```

mod env;

pub use env::apply_env_overrides;

use anyhow::{Context, Result};
use cartolina_generators::GeneratorKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
	pub store: StoreConfig,
	pub http: HttpConfig,
	pub core: CoreConfig,
	pub gdal: GdalConfig,
	#[serde(alias = "resource-backend")]
	pub resource_backend: ResourceBackendConfig,
	pub introspection: IntrospectionConfig,
	/// Per-file-class max-age overrides in seconds; negative means no-cache.
	#[serde(alias = "max-age")]
	pub max_age: BTreeMap<String, i64>,
	pub ctrl: CtrlConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
	/// Root of the prepared-state store.
	pub path: PathBuf,
}

impl Default for StoreConfig {
	fn default() -> StoreConfig {
		StoreConfig {
			path: PathBuf::from("store"),
		}
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
	pub listen: String,
	pub thread_count: Option<usize>,
	pub client_thread_count: Option<usize>,
	/// Serve the small built-in listing pages.
	pub enable_browser: bool,
	/// External URL prefix used in generated documents.
	pub external_url: Option<String>,
}

impl Default for HttpConfig {
	fn default() -> HttpConfig {
		HttpConfig {
			listen: String::from("0.0.0.0:3070"),
			thread_count: None,
			client_thread_count: None,
			enable_browser: false,
			external_url: None,
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
	pub thread_count: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct GdalConfig {
	/// Warper worker count; defaults to the hardware concurrency.
	pub process_count: Option<usize>,
	pub tmp_root: Option<PathBuf>,
	/// Aggregate warper RSS budget in bytes.
	pub rss_limit: Option<u64>,
	/// Housekeeping period in seconds.
	pub rss_check_period: u64,
}

impl Default for GdalConfig {
	fn default() -> GdalConfig {
		GdalConfig {
			process_count: None,
			tmp_root: None,
			rss_limit: None,
			rss_check_period: 10,
		}
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceBackendConfig {
	/// Backend type; only `conffile` is implemented.
	#[serde(rename = "type")]
	pub backend_type: String,
	/// Root catalogue file.
	pub root: PathBuf,
	/// Shared credit/SRS registry file.
	pub registry: Option<PathBuf>,
	/// Catalogue poll period in seconds.
	pub update_period: u64,
	/// Resource kinds whose ready resources reject incompatible changes.
	pub freeze: Vec<String>,
	/// Delete prepared artifacts of removed resources.
	pub purge_removed: bool,
}

impl Default for ResourceBackendConfig {
	fn default() -> ResourceBackendConfig {
		ResourceBackendConfig {
			backend_type: String::from("conffile"),
			root: PathBuf::from("resources.json"),
			registry: None,
			update_period: 300,
			freeze: Vec::new(),
			purge_removed: false,
		}
	}
}

impl ResourceBackendConfig {
	pub fn freeze_kinds(&self) -> Result<Vec<GeneratorKind>> {
		self.freeze.iter().map(|name| name.parse()).collect()
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct IntrospectionConfig {
	pub default_fov: f64,
}

impl Default for IntrospectionConfig {
	fn default() -> IntrospectionConfig {
		IntrospectionConfig { default_fov: 45.0 }
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CtrlConfig {
	pub listen: Option<String>,
}

impl Default for CtrlConfig {
	fn default() -> CtrlConfig {
		CtrlConfig {
			listen: Some(String::from("127.0.0.1:3071")),
		}
	}
}

impl Config {
	pub fn from_string(text: &str) -> Result<Config> {
		let mut config: Config = if text.trim().is_empty() {
			Config::default()
		} else {
			serde_yaml_ng::from_str(text).context("parsing configuration")?
		};
		apply_env_overrides(&mut config);
		Ok(config)
	}

	pub fn from_path(path: &Path) -> Result<Config> {
		let text = std::fs::read_to_string(path).with_context(|| format!("reading configuration {path:?}"))?;
		let mut config: Config =
			serde_yaml_ng::from_str(&text).with_context(|| format!("parsing configuration {path:?}"))?;

		// relative paths resolve against the config file location
		if let Some(base) = path.parent() {
			if config.store.path.is_relative() {
				config.store.path = base.join(&config.store.path);
			}
			if config.resource_backend.root.is_relative() {
				config.resource_backend.root = base.join(&config.resource_backend.root);
			}
			if let Some(registry) = &config.resource_backend.registry {
				if registry.is_relative() {
					config.resource_backend.registry = Some(base.join(registry));
				}
			}
		}

		apply_env_overrides(&mut config);
		Ok(config)
	}

	/// File-class settings with the configured overrides applied.
	pub fn file_class_settings(&self) -> Result<cartolina_core::FileClassSettings> {
		let mut overrides = Vec::new();
		for (class, max_age) in &self.max_age {
			let class = match class.as_str() {
				"config" => cartolina_core::FileClass::Config,
				"support" => cartolina_core::FileClass::Support,
				"registry" => cartolina_core::FileClass::Registry,
				"data" => cartolina_core::FileClass::Data,
				"unknown" => cartolina_core::FileClass::Unknown,
				other => anyhow::bail!("unknown file class '{other}' in max_age"),
			};
			overrides.push((class, *max_age));
		}
		Ok(cartolina_core::FileClassSettings::default().with_overrides(&overrides))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let config = Config::from_string("").unwrap();
		assert_eq!(config.http.listen, "0.0.0.0:3070");
		assert_eq!(config.resource_backend.update_period, 300);
		assert_eq!(config.gdal.rss_check_period, 10);
		assert_eq!(config.resource_backend.backend_type, "conffile");
	}

	#[test]
	fn yaml_roundtrip() {
		let config = Config::from_string(
			r#"
http:
  listen: 127.0.0.1:8000
gdal:
  process_count: 4
  rss_limit: 1073741824
resource_backend:
  root: /etc/cartolina/resources.json
  freeze: [surface, tms]
  purge_removed: true
max_age:
  data: 60
"#,
		)
		.unwrap();

		assert_eq!(config.http.listen, "127.0.0.1:8000");
		assert_eq!(config.gdal.process_count, Some(4));
		assert_eq!(config.gdal.rss_limit, Some(1_073_741_824));
		assert!(config.resource_backend.purge_removed);
		assert_eq!(
			config.resource_backend.freeze_kinds().unwrap(),
			vec![
				cartolina_generators::GeneratorKind::Surface,
				cartolina_generators::GeneratorKind::Tms
			]
		);
		assert_eq!(
			config
				.file_class_settings()
				.unwrap()
				.cache_control(cartolina_core::FileClass::Data),
			"max-age=60"
		);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(Config::from_string("no_such_section:\n  x: 1").is_err());
	}

	#[test]
	fn relative_paths_resolve_against_the_config_file() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("cartolina.yml");
		std::fs::write(&path, "store:\n  path: data/store\n")?;
		let config = Config::from_path(&path)?;
		assert_eq!(config.store.path, dir.path().join("data/store"));
		Ok(())
	}
}
