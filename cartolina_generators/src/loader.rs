//! Catalogue loader: parses a directory of declarative resource definition
//! files into runtime [`Resource`]s.
//!
//! A catalogue file holds a single resource object, an array of resources,
//! or an `{"include": "<glob>"}` directive whose pattern is resolved
//! relative to the current file. Include expansion is recursive; a visited
//! set of canonical paths guarantees termination on cycles. One input
//! resource fans out to one runtime resource per reference-frame entry.

use crate::registry::GeneratorRegistry;
use crate::resource::{GeneratorKind, GeneratorRef, Resource, ResourceId};
use anyhow::{Context, Result, bail};
use cartolina_core::{Credit, FileClass, FileClassSettings, LodRange, RegistryPatch, RegistrySnapshot, TileError, TileRange};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One resource object as found in a catalogue file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
	group: String,
	id: String,
	#[serde(rename = "type")]
	kind: String,
	driver: String,
	#[serde(default)]
	comment: String,
	#[serde(default)]
	revision: u32,
	#[serde(default)]
	credits: Vec<String>,
	#[serde(default)]
	registry: RegistryPatch,
	#[serde(rename = "referenceFrames")]
	reference_frames: serde_json::Value,
	#[serde(default, rename = "maxAge")]
	max_age: BTreeMap<String, i64>,
	definition: serde_json::Value,
}

/// Loads the catalogue rooted at `path`. Validation failures are hard
/// errors carrying the offending file's path.
pub fn load_catalogue(path: &Path, registry: &GeneratorRegistry) -> Result<Vec<Resource>> {
	let mut visited = BTreeSet::new();
	let mut raw: Vec<(PathBuf, serde_json::Value)> = Vec::new();
	collect_file(path, &mut visited, &mut raw)?;

	let shared = registry.shared_registry();
	let mut resources = Vec::new();
	let mut seen: BTreeSet<ResourceId> = BTreeSet::new();

	for (file, value) in raw {
		let fanned = parse_resource(&file, &value, registry, &shared)
			.with_context(|| format!("in catalogue file {file:?}"))?;
		for resource in fanned {
			if !seen.insert(resource.id.clone()) {
				return Err(
					TileError::FormatError {
						path: file.clone(),
						message: format!("duplicate resource {}", resource.id),
					}
					.into(),
				);
			}
			resources.push(resource);
		}
	}

	log::info!("catalogue {path:?}: {} resources loaded", resources.len());
	Ok(resources)
}

/// Loads the shared credit/SRS registry file (JSON).
pub fn load_registry_file(path: &Path) -> Result<RegistrySnapshot> {
	let bytes = std::fs::read(path).with_context(|| format!("reading registry file {path:?}"))?;
	serde_json::from_slice(&bytes).map_err(|err| {
		TileError::FormatError {
			path: path.to_path_buf(),
			message: err.to_string(),
		}
		.into()
	})
}

fn collect_file(
	path: &Path,
	visited: &mut BTreeSet<PathBuf>,
	out: &mut Vec<(PathBuf, serde_json::Value)>,
) -> Result<()> {
	let canonical = std::fs::canonicalize(path).with_context(|| format!("resolving catalogue file {path:?}"))?;
	if !visited.insert(canonical.clone()) {
		log::debug!("catalogue file {path:?} already visited, skipping");
		return Ok(());
	}

	let bytes = std::fs::read(&canonical).with_context(|| format!("reading catalogue file {path:?}"))?;
	let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
		anyhow::Error::from(TileError::FormatError {
			path: path.to_path_buf(),
			message: err.to_string(),
		})
	})?;

	match value {
		serde_json::Value::Object(ref object) if object.len() == 1 && object.contains_key("include") => {
			let Some(pattern) = object["include"].as_str() else {
				bail!(TileError::FormatError {
					path: path.to_path_buf(),
					message: String::from("'include' must be a glob string"),
				});
			};
			let base = canonical.parent().unwrap_or(Path::new("."));
			let full_pattern = base.join(pattern);
			let mut matches: Vec<PathBuf> = glob::glob(&full_pattern.to_string_lossy())
				.with_context(|| format!("invalid include glob '{pattern}' in {path:?}"))?
				.filter_map(|entry| entry.ok())
				.collect();
			matches.sort();
			for file in matches {
				collect_file(&file, visited, out)?;
			}
		}
		serde_json::Value::Object(_) => out.push((path.to_path_buf(), value)),
		serde_json::Value::Array(items) => {
			for item in items {
				out.push((path.to_path_buf(), item));
			}
		}
		_ => bail!(TileError::FormatError {
			path: path.to_path_buf(),
			message: String::from("catalogue file must hold an object, an array or an include directive"),
		}),
	}
	Ok(())
}

fn parse_resource(
	file: &Path,
	value: &serde_json::Value,
	registry: &GeneratorRegistry,
	shared: &RegistrySnapshot,
) -> Result<Vec<Resource>> {
	let raw: RawResource = serde_json::from_value(value.clone()).map_err(|err| {
		anyhow::Error::from(TileError::FormatError {
			path: file.to_path_buf(),
			message: err.to_string(),
		})
	})?;

	let kind: GeneratorKind = raw.kind.parse()?;
	let gen = GeneratorRef::new(kind, &raw.driver);
	let factory = registry
		.factory(&gen)
		.ok_or_else(|| format_error(file, format!("unknown driver '{}' for type '{}'", raw.driver, raw.kind)))?;

	// credits resolve against the inline registry first, then the shared one
	let mut credits: BTreeSet<Credit> = BTreeSet::new();
	for name in &raw.credits {
		let credit = shared
			.resolve_credit(&raw.registry, name)
			.ok_or_else(|| format_error(file, format!("unresolvable credit '{name}'")))?;
		credits.insert(credit.clone());
	}

	let file_class_settings = parse_max_age(file, &raw.max_age)?;
	let definition = (factory.parse_definition)(&raw.definition)
		.map_err(|err| format_error(file, format!("invalid definition: {err:#}")))?;

	// fan out per reference frame
	let mut resources = Vec::new();
	match &raw.reference_frames {
		serde_json::Value::Object(frames) => {
			if !factory.needs_ranges {
				return Err(format_error(
					file,
					format!("driver '{}' takes a reference frame list, not ranges", raw.driver),
				));
			}
			for (frame, ranges) in frames {
				let ranges: RawRanges = serde_json::from_value(ranges.clone())
					.map_err(|err| format_error(file, format!("invalid ranges for frame '{frame}': {err}")))?;
				let lod_range = LodRange::new(ranges.lod_range[0], ranges.lod_range[1])?;
				let tile_range = TileRange::new(
					ranges.tile_range[0][0],
					ranges.tile_range[0][1],
					ranges.tile_range[1][0],
					ranges.tile_range[1][1],
				)?;
				resources.push(Resource {
					id: ResourceId::new(frame, &raw.group, &raw.id),
					gen: gen.clone(),
					revision: raw.revision,
					lod_range,
					tile_range,
					credits: credits.clone(),
					registry: raw.registry.clone(),
					file_class_settings,
					comment: raw.comment.clone(),
					definition: definition.clone(),
				});
			}
		}
		serde_json::Value::Array(frames) => {
			if factory.needs_ranges {
				return Err(format_error(
					file,
					format!("driver '{}' requires lod/tile ranges per reference frame", raw.driver),
				));
			}
			for frame in frames {
				let Some(frame) = frame.as_str() else {
					return Err(format_error(file, "reference frame list must hold strings".to_string()));
				};
				resources.push(Resource {
					id: ResourceId::new(frame, &raw.group, &raw.id),
					gen: gen.clone(),
					revision: raw.revision,
					lod_range: LodRange::new(0, 31)?,
					tile_range: TileRange::empty(),
					credits: credits.clone(),
					registry: raw.registry.clone(),
					file_class_settings,
					comment: raw.comment.clone(),
					definition: definition.clone(),
				});
			}
		}
		_ => {
			return Err(format_error(
				file,
				"'referenceFrames' must be an object with ranges or a list of names".to_string(),
			));
		}
	}

	if resources.is_empty() {
		return Err(format_error(file, format!("resource {}-{} names no reference frame", raw.group, raw.id)));
	}
	Ok(resources)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawRanges {
	lod_range: [u8; 2],
	tile_range: [[u32; 2]; 2],
}

fn parse_max_age(file: &Path, overrides: &BTreeMap<String, i64>) -> Result<FileClassSettings> {
	let mut parsed = Vec::with_capacity(overrides.len());
	for (class, max_age) in overrides {
		let class = match class.as_str() {
			"config" => FileClass::Config,
			"support" => FileClass::Support,
			"registry" => FileClass::Registry,
			"data" => FileClass::Data,
			"unknown" => FileClass::Unknown,
			other => return Err(format_error(file, format!("unknown file class '{other}' in maxAge"))),
		};
		parsed.push((class, *max_age));
	}
	Ok(FileClassSettings::default().with_overrides(&parsed))
}

fn format_error(file: &Path, message: String) -> anyhow::Error {
	TileError::FormatError {
		path: file.to_path_buf(),
		message,
	}
	.into()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::producers::all_factories;
	use crate::registry::RegistryConfig;
	use cartolina_warp::backend::mock::MockBackend;
	use cartolina_warp::farm::{Farm, FarmConfig};
	use std::sync::Arc;

	fn test_registry() -> GeneratorRegistry {
		let backend = Arc::new(MockBackend::new());
		let farm = Farm::new(
			backend.clone(),
			FarmConfig {
				workers: 1,
				..FarmConfig::default()
			},
		);
		let registry =
			GeneratorRegistry::new(farm, backend, RegistryConfig::default(), all_factories()).unwrap();
		let mut shared = RegistrySnapshot::default();
		shared.credits.insert(
			String::from("osm"),
			Credit {
				id: String::from("osm"),
				numeric_id: 1,
				notice: String::from("{copy} OpenStreetMap contributors"),
			},
		);
		registry.swap_shared_registry(shared);
		registry
	}

	fn raster_json(id: &str) -> String {
		format!(
			r#"{{
				"group": "g", "id": "{id}", "type": "tms", "driver": "tms-raster",
				"credits": ["osm"],
				"referenceFrames": {{
					"webmercator": {{"lodRange": [0, 10], "tileRange": [[0, 0], [0, 0]]}}
				}},
				"definition": {{"dataset": "{id}.tif"}}
			}}"#
		)
	}

	#[test]
	fn include_glob_expansion() -> Result<()> {
		let dir = tempfile::tempdir()?;
		std::fs::create_dir(dir.path().join("defs"))?;
		std::fs::write(dir.path().join("resources.json"), r#"{"include": "defs/*.json"}"#)?;
		std::fs::write(dir.path().join("defs/a.json"), raster_json("a"))?;
		std::fs::write(dir.path().join("defs/b.json"), raster_json("b"))?;

		let registry = test_registry();
		let resources = load_catalogue(&dir.path().join("resources.json"), &registry)?;

		assert_eq!(resources.len(), 2);
		assert_eq!(resources[0].id, ResourceId::new("webmercator", "g", "a"));
		assert_eq!(resources[1].id, ResourceId::new("webmercator", "g", "b"));
		assert!(!resources.iter().any(|r| r.id.id == "c"));
		Ok(())
	}

	#[test]
	fn include_cycles_terminate() -> Result<()> {
		let dir = tempfile::tempdir()?;
		std::fs::write(dir.path().join("a.json"), r#"{"include": "b.json"}"#)?;
		std::fs::write(dir.path().join("b.json"), r#"{"include": "a.json"}"#)?;

		let registry = test_registry();
		let resources = load_catalogue(&dir.path().join("a.json"), &registry)?;
		assert!(resources.is_empty());
		Ok(())
	}

	#[test]
	fn duplicate_resources_fail_the_load() -> Result<()> {
		let dir = tempfile::tempdir()?;
		std::fs::write(
			dir.path().join("resources.json"),
			format!("[{}, {}]", raster_json("a"), raster_json("a")),
		)?;

		let registry = test_registry();
		let err = load_catalogue(&dir.path().join("resources.json"), &registry).unwrap_err();
		assert!(format!("{err:#}").contains("duplicate resource"));
		Ok(())
	}

	#[test]
	fn ranged_driver_rejects_frame_list() -> Result<()> {
		let dir = tempfile::tempdir()?;
		std::fs::write(
			dir.path().join("resources.json"),
			r#"{
				"group": "g", "id": "a", "type": "tms", "driver": "tms-raster",
				"referenceFrames": ["webmercator"],
				"definition": {"dataset": "a.tif"}
			}"#,
		)?;

		let registry = test_registry();
		let err = load_catalogue(&dir.path().join("resources.json"), &registry).unwrap_err();
		assert!(format!("{err:#}").contains("requires lod/tile ranges"));
		Ok(())
	}

	#[test]
	fn unresolvable_credit_is_an_error() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let json = raster_json("a").replace("\"osm\"", "\"nobody\"");
		std::fs::write(dir.path().join("resources.json"), json)?;

		let registry = test_registry();
		let err = load_catalogue(&dir.path().join("resources.json"), &registry).unwrap_err();
		assert!(format!("{err:#}").contains("unresolvable credit 'nobody'"));
		Ok(())
	}

	#[test]
	fn inline_registry_resolves_credits_first() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let json = r#"{
			"group": "g", "id": "a", "type": "tms", "driver": "tms-raster",
			"credits": ["private"],
			"registry": {"credits": {"private": {"id": "private", "numericId": 700, "notice": "private data"}}},
			"referenceFrames": {"webmercator": {"lodRange": [0, 4], "tileRange": [[0, 0], [0, 0]]}},
			"definition": {"dataset": "a.tif"}
		}"#;
		std::fs::write(dir.path().join("resources.json"), json)?;

		let registry = test_registry();
		let resources = load_catalogue(&dir.path().join("resources.json"), &registry)?;
		assert_eq!(resources[0].credits.iter().next().unwrap().numeric_id, 700);
		Ok(())
	}

	#[test]
	fn definition_payload_roundtrips() -> Result<()> {
		let dir = tempfile::tempdir()?;
		std::fs::write(dir.path().join("resources.json"), raster_json("a"))?;

		let registry = test_registry();
		let resources = load_catalogue(&dir.path().join("resources.json"), &registry)?;
		// save ∘ load is the identity on the definition payload
		assert_eq!(
			resources[0].definition.to_json(),
			serde_json::json!({
				"dataset": "a.tif",
				"mask": null,
				"format": null,
				"resampling": null,
				"transparent": false
			})
		);
		let reparsed = (registry
			.factory(&resources[0].gen)
			.unwrap()
			.parse_definition)(&resources[0].definition.to_json())?;
		assert_eq!(reparsed.diff(resources[0].definition.as_ref()), crate::resource::Changed::No);
		Ok(())
	}

	#[test]
	fn registry_file_loads() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("registry.json");
		std::fs::write(
			&path,
			r#"{
				"credits": {"osm": {"id": "osm", "numericId": 1, "notice": "{copy} OSM"}},
				"srs": {"webmercator": {"srsDef": "+proj=webmerc +datum=WGS84"}}
			}"#,
		)?;
		let snapshot = load_registry_file(&path)?;
		assert_eq!(snapshot.credits.len(), 1);
		assert_eq!(snapshot.srs["webmercator"].srs_def, "+proj=webmerc +datum=WGS84");
		Ok(())
	}
}
