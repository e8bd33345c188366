//! The shared projection/credit registry. The reconciler owns the current
//! [`RegistrySnapshot`] and hands it to producers at construction; resources
//! may carry a [`RegistryPatch`] of inline overrides that is consulted before
//! the shared snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One attribution credit, addressable by string id and carrying the numeric
/// id that tile formats embed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Credit {
	pub id: String,
	#[serde(rename = "numericId")]
	pub numeric_id: u16,
	#[serde(default)]
	pub notice: String,
}

/// A spatial reference system definition keyed by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrsDef {
	/// proj4/WKT definition string, passed verbatim to the raster backend.
	#[serde(rename = "srsDef")]
	pub srs_def: String,
	#[serde(default)]
	pub comment: String,
}

/// Immutable registry snapshot shared by all producers of one reload
/// generation. Swapped wholesale on catalogue reload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
	#[serde(default)]
	pub credits: BTreeMap<String, Credit>,
	#[serde(default)]
	pub srs: BTreeMap<String, SrsDef>,
}

/// Inline per-resource overrides, merged over the shared snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryPatch {
	#[serde(default)]
	pub credits: BTreeMap<String, Credit>,
	#[serde(default)]
	pub srs: BTreeMap<String, SrsDef>,
}

impl RegistryPatch {
	pub fn is_empty(&self) -> bool {
		self.credits.is_empty() && self.srs.is_empty()
	}
}

impl RegistrySnapshot {
	/// Resolves a credit: inline patch first, then the shared snapshot.
	pub fn resolve_credit<'a>(&'a self, patch: &'a RegistryPatch, id: &str) -> Option<&'a Credit> {
		patch.credits.get(id).or_else(|| self.credits.get(id))
	}

	pub fn resolve_srs<'a>(&'a self, patch: &'a RegistryPatch, name: &str) -> Option<&'a SrsDef> {
		patch.srs.get(name).or_else(|| self.srs.get(name))
	}

	/// A new snapshot with the patch folded in; used when a resource's inline
	/// registry must become visible in its published artifacts.
	pub fn patched(&self, patch: &RegistryPatch) -> RegistrySnapshot {
		let mut snapshot = self.clone();
		for (k, v) in &patch.credits {
			snapshot.credits.insert(k.clone(), v.clone());
		}
		for (k, v) in &patch.srs {
			snapshot.srs.insert(k.clone(), v.clone());
		}
		snapshot
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn credit(id: &str, numeric_id: u16) -> Credit {
		Credit {
			id: id.to_string(),
			numeric_id,
			notice: format!("{{copy}} {id}"),
		}
	}

	#[test]
	fn inline_patch_wins() {
		let mut snapshot = RegistrySnapshot::default();
		snapshot.credits.insert("osm".into(), credit("osm", 1));

		let mut patch = RegistryPatch::default();
		patch.credits.insert("osm".into(), credit("osm", 99));

		assert_eq!(snapshot.resolve_credit(&patch, "osm").unwrap().numeric_id, 99);
		assert_eq!(
			snapshot.resolve_credit(&RegistryPatch::default(), "osm").unwrap().numeric_id,
			1
		);
		assert!(snapshot.resolve_credit(&patch, "missing").is_none());
	}

	#[test]
	fn patched_folds_both_maps() {
		let mut snapshot = RegistrySnapshot::default();
		snapshot.credits.insert("a".into(), credit("a", 1));

		let mut patch = RegistryPatch::default();
		patch.credits.insert("b".into(), credit("b", 2));
		patch.srs.insert(
			"custom".into(),
			SrsDef {
				srs_def: "+proj=longlat".into(),
				comment: String::new(),
			},
		);

		let merged = snapshot.patched(&patch);
		assert_eq!(merged.credits.len(), 2);
		assert_eq!(merged.srs.len(), 1);
		// source snapshot untouched
		assert_eq!(snapshot.credits.len(), 1);
	}

	#[test]
	fn serde_roundtrip() {
		let mut snapshot = RegistrySnapshot::default();
		snapshot.credits.insert("osm".into(), credit("osm", 1));
		let json = serde_json::to_string(&snapshot).unwrap();
		let back: RegistrySnapshot = serde_json::from_str(&json).unwrap();
		assert_eq!(snapshot, back);
	}
}
