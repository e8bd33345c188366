//! The resource model: identifiers, per-revision records and the diff
//! semantics that drive catalogue reconciliation.

pub mod definitions;

use anyhow::{Result, bail};
use cartolina_core::{Credit, FileClassSettings, LodRange, RegistryPatch, TileRange};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

/// Globally unique resource identifier; totally ordered lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
	pub reference_frame: String,
	pub group: String,
	pub id: String,
}

impl ResourceId {
	pub fn new(reference_frame: &str, group: &str, id: &str) -> ResourceId {
		ResourceId {
			reference_frame: reference_frame.to_string(),
			group: group.to_string(),
			id: id.to_string(),
		}
	}

	/// The externally visible name, `<group>-<id>`.
	pub fn full_id(&self) -> String {
		format!("{}-{}", self.group, self.id)
	}
}

impl std::fmt::Display for ResourceId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}/{}", self.reference_frame, self.group, self.id)
	}
}

/// Top-level generator kind; `driver` refines it to a concrete producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
	Tms,
	Surface,
	Geodata,
}

impl GeneratorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			GeneratorKind::Tms => "tms",
			GeneratorKind::Surface => "surface",
			GeneratorKind::Geodata => "geodata",
		}
	}

	/// The interface directory under which prepared state and URLs live.
	pub fn interface(&self) -> &'static str {
		self.as_str()
	}
}

impl std::str::FromStr for GeneratorKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<GeneratorKind> {
		Ok(match s {
			"tms" => GeneratorKind::Tms,
			"surface" => GeneratorKind::Surface,
			"geodata" => GeneratorKind::Geodata,
			other => bail!("unknown generator kind '{other}'"),
		})
	}
}

/// `(kind, driver)` pair selecting exactly one registered factory.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeneratorRef {
	#[serde(rename = "type")]
	pub kind: GeneratorKind,
	pub driver: String,
}

impl GeneratorRef {
	pub fn new(kind: GeneratorKind, driver: &str) -> GeneratorRef {
		GeneratorRef {
			kind,
			driver: driver.to_string(),
		}
	}
}

/// Outcome of diffing a resource (or its definition) against its previous
/// revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Changed {
	/// Nothing changed.
	No,
	/// Only items that do not affect generated bytes changed.
	Safe,
	/// Cached output is invalidated but the resource stays compatible.
	RevisionBump,
	/// Incompatible change; the resource must be replaced and re-prepared.
	Yes,
}

/// Driver-specific definition payload. Each driver brings its own diff.
pub trait Definition: Send + Sync + Debug {
	/// Compares with another definition of (presumably) the same driver.
	/// A different concrete type always yields [`Changed::Yes`].
	fn diff(&self, other: &dyn Definition) -> Changed;

	/// When true, credit changes invalidate the resource instead of being
	/// swapped silently.
	fn frozen_credits(&self) -> bool {
		false
	}

	fn to_json(&self) -> serde_json::Value;

	fn as_any(&self) -> &dyn Any;
}

/// Immutable per-revision resource record.
#[derive(Clone, Debug)]
pub struct Resource {
	pub id: ResourceId,
	pub gen: GeneratorRef,
	/// Monotonically non-decreasing; bumped by the reconciler on
	/// [`Changed::RevisionBump`] diffs.
	pub revision: u32,
	pub lod_range: LodRange,
	/// Anchored at `lod_range.min`; may be [`TileRange::empty`] when the
	/// driver needs no ranges.
	pub tile_range: TileRange,
	pub credits: BTreeSet<Credit>,
	pub registry: RegistryPatch,
	pub file_class_settings: FileClassSettings,
	pub comment: String,
	pub definition: Arc<dyn Definition>,
}

impl Resource {
	pub fn full_id(&self) -> String {
		self.id.full_id()
	}

	/// The diff decision table driving reconciliation.
	pub fn changed(&self, old: &Resource, needs_ranges: bool) -> Changed {
		if self.id != old.id || self.gen != old.gen {
			return Changed::Yes;
		}
		if needs_ranges && (self.lod_range != old.lod_range || self.tile_range != old.tile_range) {
			return Changed::Yes;
		}

		let definition_diff = self.definition.diff(old.definition.as_ref());
		if definition_diff == Changed::Yes {
			return Changed::Yes;
		}

		let credits_changed = self.credits != old.credits;
		if credits_changed && self.definition.frozen_credits() {
			return Changed::Yes;
		}

		if definition_diff == Changed::RevisionBump {
			return Changed::RevisionBump;
		}

		if definition_diff == Changed::Safe
			|| credits_changed
			|| self.registry != old.registry
			|| self.comment != old.comment
		{
			return Changed::Safe;
		}
		Changed::No
	}
}
