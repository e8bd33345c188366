//! Per-request sink carrying the cancellation flag set by the HTTP layer on
//! client disconnect. Producers call [`Sink::check_aborted`] at every natural
//! yield point; warp requests carry the sink into the farm so workers can
//! abort between chunks.

use crate::TileError;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Debug, Default)]
pub struct Sink {
	aborted: Arc<AtomicBool>,
}

impl Sink {
	pub fn new() -> Sink {
		Sink::default()
	}

	/// Called by the HTTP layer when the client goes away.
	pub fn abort(&self) {
		self.aborted.store(true, Ordering::Release);
	}

	pub fn is_aborted(&self) -> bool {
		self.aborted.load(Ordering::Acquire)
	}

	/// Returns `TileError::Cancelled` once the sink has been aborted.
	pub fn check_aborted(&self) -> Result<()> {
		if self.is_aborted() {
			Err(TileError::Cancelled.into())
		} else {
			Ok(())
		}
	}
}
