//! The cartolina tile server binary.

use anyhow::{Context, Result, ensure};
use cartolina::config::Config;
use cartolina::ctrl::CtrlPlane;
use cartolina::poller::Poller;
use cartolina::server::TileServer;
use cartolina_generators::registry::RegistryConfig;
use cartolina_generators::{GeneratorRegistry, producers};
use cartolina_warp::backend::RasterBackend;
use cartolina_warp::farm::{Farm, FarmConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
	name = "cartolina",
	version,
	about = "3D geospatial tile server: map, terrain and metadata tiles generated on the fly"
)]
struct Cli {
	/// Configuration file (YAML).
	#[arg(short, long, value_name = "FILE")]
	config: Option<PathBuf>,

	/// Override http.listen.
	#[arg(long, value_name = "ADDR")]
	listen: Option<String>,

	/// Override resource-backend.root.
	#[arg(long, value_name = "FILE")]
	resources: Option<PathBuf>,

	/// Increase log verbosity (-v: debug, -vv: trace).
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,

	/// Decrease log verbosity (-q: warn, -qq: error).
	#[arg(short, long, action = clap::ArgAction::Count)]
	quiet: u8,
}

fn main() {
	let cli = Cli::parse();

	let level = match i16::from(cli.verbose) - i16::from(cli.quiet) {
		i16::MIN..=-2 => "error",
		-1 => "warn",
		0 => "info",
		1 => "debug",
		_ => "trace",
	};
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

	if let Err(err) = run(cli) {
		log::error!("{err:#}");
		// non-zero on abandonment
		std::process::exit(1);
	}
}

fn run(cli: Cli) -> Result<()> {
	let mut config = match &cli.config {
		Some(path) => Config::from_path(path)?,
		None => Config::from_string("")?,
	};
	if let Some(listen) = cli.listen {
		config.http.listen = listen;
	}
	if let Some(resources) = cli.resources {
		config.resource_backend.root = resources;
	}

	ensure!(
		config.resource_backend.backend_type == "conffile",
		"unsupported resource backend type '{}'",
		config.resource_backend.backend_type
	);

	let runtime = {
		let mut builder = tokio::runtime::Builder::new_multi_thread();
		if let Some(threads) = config.core.thread_count {
			builder.worker_threads(threads.max(1));
		}
		builder.enable_all().build().context("building the core runtime")?
	};

	runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
	if let Some(tmp_root) = &config.gdal.tmp_root {
		std::env::set_var("CPL_TMPDIR", tmp_root);
	}

	let backend = open_backend()?;
	let farm = Farm::new(
		backend.clone(),
		FarmConfig {
			workers: config.gdal.process_count.unwrap_or_else(num_cpus::get).max(1),
			rss_limit: config.gdal.rss_limit,
			rss_check_period: Duration::from_secs(config.gdal.rss_check_period.max(1)),
			..FarmConfig::default()
		},
	);

	let registry = Arc::new(GeneratorRegistry::new(
		farm.clone(),
		backend,
		RegistryConfig {
			store_root: config.store.path.clone(),
			freeze_types: config.resource_backend.freeze_kinds()?,
			purge_removed: config.resource_backend.purge_removed,
			extra_frames: Default::default(),
		},
		producers::all_factories(),
	)?);

	let poller = Poller::new(
		registry.clone(),
		config.resource_backend.root.clone(),
		config.resource_backend.registry.clone(),
	);

	// the initial catalogue must load; later failures keep the current set
	let token = poller
		.poll_now()
		.await
		.context("loading the initial resource catalogue")?;
	log::info!("initial catalogue loaded (token {token})");

	tokio::spawn(
		poller
			.clone()
			.run(Duration::from_secs(config.resource_backend.update_period.max(1))),
	);

	if let Some(listen) = config.ctrl.listen.clone() {
		let ctrl = CtrlPlane::new(registry.clone(), poller.clone());
		tokio::spawn(async move {
			if let Err(err) = ctrl.serve(&listen).await {
				log::error!("ctrl listener failed: {err:#}");
			}
		});
	}

	let mut server = TileServer::new(&config.http.listen, registry, config.http.enable_browser);
	server.start().await?;
	log::info!("serving on {} (port {})", config.http.listen, server.port());

	tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
	log::info!("shutdown signal received");

	server.stop().await;
	farm.shutdown();
	Ok(())
}

fn open_backend() -> Result<Arc<dyn RasterBackend>> {
	#[cfg(feature = "gdal")]
	{
		Ok(Arc::new(cartolina_warp::backend::gdal::GdalBackend::new()?))
	}
	#[cfg(not(feature = "gdal"))]
	{
		log::warn!("built without the 'gdal' feature; serving from the synthetic mock backend");
		Ok(Arc::new(cartolina_warp::backend::mock::MockBackend::new()))
	}
}
