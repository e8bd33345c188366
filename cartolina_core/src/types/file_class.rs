//! File classes drive the `Cache-Control: max-age` of every response. Each
//! resource may override the per-class defaults via its `fileClassSettings`.

use serde::{Deserialize, Serialize};

/// Coarse classification of everything the server can hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileClass {
	/// mapConfig.json, boundlayer.json, freelayer.json
	Config,
	/// browser support files
	Support,
	/// registry files (credits, SRS definitions)
	Registry,
	/// tile data: images, masks, meshes, metatiles, navtiles
	Data,
	Unknown,
}

impl FileClass {
	pub const ALL: [FileClass; 5] = [
		FileClass::Config,
		FileClass::Support,
		FileClass::Registry,
		FileClass::Data,
		FileClass::Unknown,
	];
}

/// Per-class `max-age` values in seconds. A negative value means
/// `no-cache` (the class must be revalidated on every request).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileClassSettings {
	pub config: i64,
	pub support: i64,
	pub registry: i64,
	pub data: i64,
	pub unknown: i64,
}

impl Default for FileClassSettings {
	fn default() -> FileClassSettings {
		FileClassSettings {
			config: -1,
			support: 3600,
			registry: 3600,
			data: 604_800,
			unknown: -1,
		}
	}
}

impl FileClassSettings {
	pub fn max_age(&self, class: FileClass) -> i64 {
		match class {
			FileClass::Config => self.config,
			FileClass::Support => self.support,
			FileClass::Registry => self.registry,
			FileClass::Data => self.data,
			FileClass::Unknown => self.unknown,
		}
	}

	/// The `Cache-Control` header value for `class`.
	pub fn cache_control(&self, class: FileClass) -> String {
		let max_age = self.max_age(class);
		if max_age < 0 {
			String::from("no-cache")
		} else {
			format!("max-age={max_age}")
		}
	}

	/// Returns a copy with the given per-class overrides applied.
	pub fn with_overrides(&self, overrides: &[(FileClass, i64)]) -> FileClassSettings {
		let mut settings = *self;
		for (class, max_age) in overrides {
			match class {
				FileClass::Config => settings.config = *max_age,
				FileClass::Support => settings.support = *max_age,
				FileClass::Registry => settings.registry = *max_age,
				FileClass::Data => settings.data = *max_age,
				FileClass::Unknown => settings.unknown = *max_age,
			}
		}
		settings
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let settings = FileClassSettings::default();
		assert_eq!(settings.max_age(FileClass::Data), 604_800);
		assert_eq!(settings.cache_control(FileClass::Data), "max-age=604800");
		assert_eq!(settings.cache_control(FileClass::Config), "no-cache");
	}

	#[test]
	fn overrides() {
		let settings = FileClassSettings::default().with_overrides(&[(FileClass::Data, 60), (FileClass::Config, 10)]);
		assert_eq!(settings.cache_control(FileClass::Data), "max-age=60");
		assert_eq!(settings.cache_control(FileClass::Config), "max-age=10");
		// untouched classes keep their defaults
		assert_eq!(settings.max_age(FileClass::Support), 3600);
	}
}
