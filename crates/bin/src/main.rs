//! Warden administrative CLI.
//!
//! Every invocation builds a controller from the configuration, reattaches to
//! the workers in the recovery store, runs one command and detaches again, so
//! workers outlive the CLI process. `serve` keeps the controller up and
//! reconciles periodically until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_config::WardenConfig;
use warden_interpreter::{InterpreterRequest, LifecycleController, ShutdownMode, recovery};

/// Warden command line arguments.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Interpreter worker lifecycle controller with crash/restart recovery")]
struct Args {
	/// Configuration file (default: <config dir>/warden/warden.toml)
	#[arg(short, long, value_name = "PATH", global = true)]
	config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// List live workers
	Status,
	/// Print the endpoint serving a request, launching a worker if needed
	Acquire(Target),
	/// Close the worker serving a request
	Close(Target),
	/// Tear down the worker serving a request; the next acquire relaunches it
	Restart(Target),
	/// Close every worker of a setting
	CloseSetting {
		/// Setting id
		setting: String,
	},
	/// Reconcile the registry with the recovery store once
	Reconcile,
	/// Keep the controller running, reconciling periodically, until Ctrl-C
	Serve,
}

#[derive(clap::Args, Debug)]
struct Target {
	/// Setting id
	setting: String,
	/// Requesting user
	#[arg(long)]
	user: Option<String>,
	/// Notebook id
	#[arg(long)]
	note: Option<String>,
}

impl Target {
	fn request(&self) -> InterpreterRequest {
		InterpreterRequest {
			setting_id: self.setting.clone(),
			user: self.user.clone(),
			note_id: self.note.clone(),
		}
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	let config = load_config(args.config.as_deref())?;
	let store = recovery::open(&config.recovery_backend()).context("failed to open recovery store")?;
	let controller = Arc::new(LifecycleController::new(store, config.controller_options()));
	for setting in &config.settings {
		controller.register(setting.clone());
	}

	let report = controller.restore().await.context("failed to restore workers")?;
	for e in &report.errors {
		warn!(error = %e, "Restore step failed");
	}

	let mode = match args.command {
		Command::Serve => config.shutdown_mode(),
		_ => ShutdownMode::Detach,
	};
	let outcome = run(&controller, &config, args.command).await;
	let shutdown = controller.shutdown(mode).await.context("failed to shut down controller");

	outcome?;
	shutdown
}

async fn run(controller: &Arc<LifecycleController>, config: &WardenConfig, command: Command) -> Result<()> {
	match command {
		Command::Status => {
			let workers = controller.snapshot();
			if workers.is_empty() {
				println!("no live workers");
			}
			for w in workers {
				let pid = w.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
				println!("{}\t{}\t{}\tpid={}\t{}\tsince {}", w.key, w.state, w.endpoint, pid, w.transport, w.started_at.to_rfc3339());
			}
		}
		Command::Acquire(target) => {
			let endpoint = controller.acquire(&target.request()).await.with_context(|| format!("failed to acquire worker for '{}'", target.setting))?;
			println!("{endpoint}");
		}
		Command::Close(target) => {
			controller.close(&target.request()).await.with_context(|| format!("failed to close worker for '{}'", target.setting))?;
		}
		Command::Restart(target) => {
			controller.restart(&target.request()).await.with_context(|| format!("failed to restart worker for '{}'", target.setting))?;
		}
		Command::CloseSetting { setting } => {
			controller.close_setting(&setting).await.with_context(|| format!("failed to close setting '{setting}'"))?;
		}
		Command::Reconcile => {
			let report = controller.reconcile().await;
			println!(
				"crashed={} cleared={} repersisted={} stale_removed={} errors={}",
				report.crashed.len(),
				report.cleared.len(),
				report.repersisted.len(),
				report.stale_removed.len(),
				report.errors.len()
			);
		}
		Command::Serve => {
			let shutdown = CancellationToken::new();
			let reconciler = config.reconcile_interval().map(|period| controller.spawn_reconciler(period, shutdown.clone()));

			info!(workers = controller.count(), "Serving; press Ctrl-C to stop");
			tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
			info!("Interrupted, stopping");

			shutdown.cancel();
			if let Some(handle) = reconciler {
				handle.await.context("reconciler task failed")?;
			}
		}
	}
	Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WardenConfig> {
	let mut config = match path {
		Some(path) => WardenConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))?,
		None => match WardenConfig::default_path().filter(|p| p.exists()) {
			Some(path) => WardenConfig::load(&path).with_context(|| format!("failed to load config {}", path.display()))?,
			None => WardenConfig::default(),
		},
	};
	config.apply_env().context("invalid environment override")?;
	Ok(config)
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("warn,warden=debug")
			} else {
				EnvFilter::new("warn,warden=info")
			}
		})
	};

	if let Some(log_dir) = std::env::var("WARDEN_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("warden.{}.log", std::process::id()));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer().with_writer(file).with_ansi(false).with_target(true);

			tracing_subscriber::registry().with(filter()).with(file_layer).init();

			tracing::info!(path = ?log_path, "Warden tracing initialized");
			return;
		}
	}

	// Fallback to stderr so stdout stays machine-readable.
	tracing_subscriber::fmt().with_env_filter(filter()).with_writer(std::io::stderr).init();
}
