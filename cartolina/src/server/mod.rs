//! HTTP server lifecycle and composition.
//!
//! The logic is split into focused modules: `handlers` implement the
//! concrete HTTP handlers and the error-to-status mapping, `admission` owns
//! the per-fingerprint piggy-backing, `wmts` renders the capabilities
//! document. This module owns lifecycle only: building the router, applying
//! the global protection layers, listening, graceful shutdown.

pub mod admission;
pub mod handlers;
pub mod wmts;

pub use admission::{Admission, RequestFingerprint};

use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{BoxError, Router, routing::get};
use cartolina_generators::GeneratorRegistry;
use handlers::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::{
	ServiceBuilder, buffer::BufferLayer, limit::ConcurrencyLimitLayer, load_shed::LoadShedLayer, timeout::TimeoutLayer,
};
use tower_http::catch_panic::CatchPanicLayer;

pub struct TileServer {
	listen: String,
	port: u16,
	state: AppState,
	enable_browser: bool,
	/// One-shot channel to signal graceful shutdown to the serving task.
	exit_signal: Option<oneshot::Sender<()>>,
	join: Option<tokio::task::JoinHandle<()>>,
}

impl TileServer {
	pub fn new(listen: &str, registry: Arc<GeneratorRegistry>, enable_browser: bool) -> TileServer {
		TileServer {
			listen: listen.to_string(),
			port: 0,
			state: AppState {
				registry,
				admission: Admission::new(),
			},
			enable_browser,
			exit_signal: None,
			join: None,
		}
	}

	/// Start listening and serving requests. Idempotent: a running instance
	/// is stopped first.
	pub async fn start(&mut self) -> Result<()> {
		if self.exit_signal.is_some() || self.join.is_some() {
			self.stop().await;
		}
		log::info!("starting HTTP server on {}", self.listen);

		let mut router = Router::new()
			.route("/status", get(|| async { "ready!" }))
			.route("/{rf}/{resource}/{file}", get(handlers::serve));
		if self.enable_browser {
			router = router.route("/resources.json", get(handlers::list_resources));
		}
		let router = router.with_state(self.state.clone());

		// Global backpressure and protection, innermost to outermost:
		// LoadShed -> ConcurrencyLimit -> Buffer -> Timeout -> CatchPanic ->
		// HandleError, so Axum observes an Infallible error type.
		let overload_handler = HandleErrorLayer::new(|_err: BoxError| async move {
			let mut response = (StatusCode::SERVICE_UNAVAILABLE, "Service overloaded, try later").into_response();
			response.headers_mut().insert("Retry-After", "2".parse().unwrap());
			Ok::<_, std::convert::Infallible>(response)
		});
		let protection = ServiceBuilder::new()
			.layer(overload_handler)
			.layer(CatchPanicLayer::new())
			.layer(TimeoutLayer::new(std::time::Duration::from_secs(60)))
			.layer(BufferLayer::new(1024))
			.layer(ConcurrencyLimitLayer::new(256))
			.layer(LoadShedLayer::new());
		let router = router.layer(protection);

		let listener = TcpListener::bind(&self.listen)
			.await
			.with_context(|| format!("binding {}", self.listen))?;
		self.port = listener.local_addr()?.port();

		let (tx, rx) = oneshot::channel::<()>();
		let handle = tokio::spawn(async move {
			if let Err(err) = axum::serve(listener, router.into_make_service())
				.with_graceful_shutdown(async {
					rx.await.ok();
				})
				.await
			{
				log::error!("server task exited with error: {err}");
			}
		});

		self.exit_signal = Some(tx);
		self.join = Some(handle);
		Ok(())
	}

	/// Trigger graceful shutdown and wait for the serving task to finish.
	pub async fn stop(&mut self) {
		if self.exit_signal.is_none() && self.join.is_none() {
			return;
		}
		log::info!("stopping HTTP server");

		if let Some(tx) = self.exit_signal.take() {
			let _ = tx.send(());
		}
		if let Some(handle) = self.join.take() {
			match tokio::time::timeout(std::time::Duration::from_secs(10), handle).await {
				Ok(Err(join_err)) => log::warn!("server task join error: {join_err}"),
				Err(_) => log::warn!("server task did not shut down within timeout; continuing"),
				Ok(Ok(())) => {}
			}
		}
	}

	/// The bound port; with an ephemeral listen address this is the actual
	/// assigned port.
	pub fn port(&self) -> u16 {
		self.port
	}
}
