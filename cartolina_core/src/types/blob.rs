//! This module provides the [`Blob`] struct, a wrapper around [`Vec<u8>`]
//! used for tile bodies and other binary artifacts handed between producers,
//! the admission cache and the HTTP layer.
//!
//! # Examples
//!
//! ```rust
//! use cartolina_core::Blob;
//!
//! let blob = Blob::from("Hello, world!");
//! assert_eq!(blob.len(), 13);
//! assert_eq!(blob.as_str(), "Hello, world!");
//! ```

use std::fmt::Debug;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Blob(Vec<u8>);

impl Blob {
	/// Creates an empty `Blob`.
	pub fn new_empty() -> Blob {
		Blob(Vec::new())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Interprets the bytes as UTF-8, lossily.
	pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
		String::from_utf8_lossy(&self.0)
	}

	pub fn into_vec(self) -> Vec<u8> {
		self.0
	}
}

impl From<Vec<u8>> for Blob {
	fn from(vec: Vec<u8>) -> Blob {
		Blob(vec)
	}
}

impl From<&[u8]> for Blob {
	fn from(slice: &[u8]) -> Blob {
		Blob(slice.to_vec())
	}
}

impl From<&str> for Blob {
	fn from(text: &str) -> Blob {
		Blob(text.as_bytes().to_vec())
	}
}

impl From<String> for Blob {
	fn from(text: String) -> Blob {
		Blob(text.into_bytes())
	}
}

impl Debug for Blob {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Blob({} bytes)", self.0.len())
	}
}
