//! Environment overrides: every configuration leaf can be overridden by a
//! variable named after its dotted path with dots replaced by underscores,
//! checked verbatim and in upper case.

use super::Config;
use std::str::FromStr;

fn lookup(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.or_else(|| std::env::var(name.to_uppercase()).ok())
}

fn set<T: FromStr>(target: &mut T, name: &str) {
	if let Some(value) = lookup(name) {
		match value.parse() {
			Ok(parsed) => {
				log::debug!("config override from environment: {name}");
				*target = parsed;
			}
			Err(_) => log::warn!("ignoring unparsable environment override {name}={value}"),
		}
	}
}

fn set_opt<T: FromStr>(target: &mut Option<T>, name: &str) {
	if let Some(value) = lookup(name) {
		match value.parse() {
			Ok(parsed) => *target = Some(parsed),
			Err(_) => log::warn!("ignoring unparsable environment override {name}={value}"),
		}
	}
}

pub fn apply_env_overrides(config: &mut Config) {
	set(&mut config.store.path, "store_path");
	set(&mut config.http.listen, "http_listen");
	set_opt(&mut config.http.thread_count, "http_thread_count");
	set_opt(&mut config.http.client_thread_count, "http_client_thread_count");
	set(&mut config.http.enable_browser, "http_enable_browser");
	set_opt(&mut config.http.external_url, "http_external_url");
	set_opt(&mut config.core.thread_count, "core_thread_count");
	set_opt(&mut config.gdal.process_count, "gdal_process_count");
	set_opt(&mut config.gdal.tmp_root, "gdal_tmp_root");
	set_opt(&mut config.gdal.rss_limit, "gdal_rss_limit");
	set(&mut config.gdal.rss_check_period, "gdal_rss_check_period");
	set(&mut config.resource_backend.backend_type, "resource_backend_type");
	set(&mut config.resource_backend.root, "resource_backend_root");
	set_opt(&mut config.resource_backend.registry, "resource_backend_registry");
	set(&mut config.resource_backend.update_period, "resource_backend_update_period");
	set(&mut config.resource_backend.purge_removed, "resource_backend_purge_removed");
	set(&mut config.introspection.default_fov, "introspection_default_fov");
	if let Some(freeze) = lookup("resource_backend_freeze") {
		config.resource_backend.freeze = freeze
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();
	}
	if let Some(listen) = lookup("ctrl_listen") {
		config.ctrl.listen = if listen.is_empty() { None } else { Some(listen) };
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// Environment mutation: keep everything in one test to avoid races
	// between parallel test threads.
	#[test]
	fn overrides_apply_and_unparsable_values_are_ignored() {
		std::env::set_var("HTTP_LISTEN", "127.0.0.1:9999");
		std::env::set_var("gdal_rss_limit", "2048");
		std::env::set_var("GDAL_RSS_CHECK_PERIOD", "not-a-number");
		std::env::set_var("RESOURCE_BACKEND_FREEZE", "surface, tms");

		let mut config = Config::default();
		apply_env_overrides(&mut config);

		assert_eq!(config.http.listen, "127.0.0.1:9999");
		assert_eq!(config.gdal.rss_limit, Some(2048));
		// unparsable override keeps the default
		assert_eq!(config.gdal.rss_check_period, 10);
		assert_eq!(config.resource_backend.freeze, vec!["surface", "tms"]);

		std::env::remove_var("HTTP_LISTEN");
		std::env::remove_var("gdal_rss_limit");
		std::env::remove_var("GDAL_RSS_CHECK_PERIOD");
		std::env::remove_var("RESOURCE_BACKEND_FREEZE");
	}
}
