//! Atomic file publication: write to a sibling `.tmp`, fsync, rename over
//! the final path, fsync the parent directory. Readers observe either the
//! old file or the new one, never a mix.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	let tmp = tmp_sibling(path);

	{
		let mut file = File::create(&tmp).with_context(|| format!("creating {tmp:?}"))?;
		file.write_all(bytes)?;
		file.sync_all().with_context(|| format!("fsyncing {tmp:?}"))?;
	}

	fs::rename(&tmp, path).with_context(|| format!("renaming {tmp:?} over {path:?}"))?;

	if let Some(parent) = path.parent() {
		// Persist the rename itself.
		File::open(parent)
			.and_then(|dir| dir.sync_all())
			.with_context(|| format!("fsyncing directory {parent:?}"))?;
	}

	Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".tmp");
	path.with_file_name(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_and_replaces() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("delivery.index");

		write_atomic(&path, b"first")?;
		assert_eq!(fs::read(&path)?, b"first");

		write_atomic(&path, b"second")?;
		assert_eq!(fs::read(&path)?, b"second");

		// no tmp residue
		assert!(!dir.path().join("delivery.index.tmp").exists());
		Ok(())
	}
}
