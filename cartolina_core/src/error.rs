//! The request error taxonomy. Producers and the admission layer return
//! these as tagged values inside `anyhow::Error`; the HTTP boundary downcasts
//! to choose a status code. Nothing here ever aborts the process.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TileError {
	/// Unknown resource, unrecognised filename or tile out of range.
	#[error("not found: {0}")]
	NotFound(String),

	/// Logical "no data here"; the collaborator returns a canonical empty body.
	#[error("empty image")]
	EmptyImage,

	#[error("empty debug mask")]
	EmptyDebugMask,

	/// Catalogue parsing error; keeps the offending file's path.
	#[error("format error in {path}: {message}")]
	FormatError { path: PathBuf, message: String },

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	/// Driver/assert/conversion failure; fatal for the request only.
	#[error("internal error: {0}")]
	Internal(String),

	/// Resource exists but is not ready yet.
	#[error("resource not ready: {0}")]
	Unavailable(String),

	/// The request sink was aborted; no body is produced.
	#[error("request cancelled")]
	Cancelled,

	/// A warper worker died mid-request; the caller may retry once.
	#[error("warper worker lost")]
	WorkerLost,
}

impl TileError {
	/// Extracts the taxonomy error from an `anyhow::Error`, if it carries one.
	pub fn of(err: &anyhow::Error) -> Option<&TileError> {
		err.downcast_ref::<TileError>()
	}

	pub fn not_found(what: impl Into<String>) -> anyhow::Error {
		TileError::NotFound(what.into()).into()
	}

	pub fn internal(what: impl Into<String>) -> anyhow::Error {
		TileError::Internal(what.into()).into()
	}

	pub fn unavailable(what: impl Into<String>) -> anyhow::Error {
		TileError::Unavailable(what.into()).into()
	}
}
