//! Local transport that spawns workers as child processes.
//!
//! Each worker gets a free loopback port, runs in its own process group and is
//! considered started once that port accepts connections. Children are not
//! killed when the controller exits, so a restarted controller can reattach.

use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{LaunchOptions, LocalProcessConfig, TransportKind, WorkerTransport, probe};
use crate::key::IsolationKey;
use crate::process::{Endpoint, LaunchedWorker, WorkerId};
use crate::{Error, Result};

const LOOPBACK: &str = "127.0.0.1";

/// Spawns and supervises worker processes on this host.
pub struct LocalProcessTransport {
	/// `None` for a reaper, which only stops recorded workers.
	config: Option<LocalProcessConfig>,
	options: LaunchOptions,
	/// Children spawned by this controller. Reattached workers are only known by pid.
	children: Mutex<HashMap<WorkerId, Child>>,
}

impl LocalProcessTransport {
	/// Creates a transport for one setting's launch parameters.
	pub fn new(config: LocalProcessConfig, options: LaunchOptions) -> Self {
		Self {
			config: Some(config),
			options,
			children: Mutex::new(HashMap::new()),
		}
	}

	/// Creates a transport that cannot launch. It still probes and stops
	/// workers by the pid in their record.
	pub fn reaper(options: LaunchOptions) -> Self {
		Self {
			config: None,
			options,
			children: Mutex::new(HashMap::new()),
		}
	}

	fn command(config: &LocalProcessConfig, key: &IsolationKey, endpoint: &Endpoint) -> Command {
		let port = endpoint.port.to_string();
		let key_str = key.to_string();
		let args = config.args.iter().map(|arg| {
			arg.replace("{host}", &endpoint.host)
				.replace("{port}", &port)
				.replace("{key}", &key_str)
		});

		let mut cmd = Command::new(&config.command);
		cmd.args(args)
			.envs(&config.env)
			.env("WARDEN_WORKER_HOST", &endpoint.host)
			.env("WARDEN_WORKER_PORT", &port)
			.env("WARDEN_ISOLATION_KEY", &key_str)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null());

		#[cfg(unix)]
		cmd.process_group(0);

		if let Some(dir) = &config.working_dir {
			cmd.current_dir(dir);
		}
		cmd
	}

	/// Waits until the worker accepts connections or exits.
	async fn wait_ready(&self, key: &IsolationKey, child: &mut Child, endpoint: &Endpoint) -> Result<()> {
		loop {
			if probe(endpoint, self.options.probe_timeout).await {
				return Ok(());
			}
			match child.try_wait() {
				Ok(Some(status)) => return Err(Error::launch(key, format!("worker exited during startup ({status})"))),
				Ok(None) => {}
				Err(e) => return Err(Error::launch(key, format!("failed to poll worker: {e}"))),
			}
			tokio::time::sleep(self.options.poll_interval).await;
		}
	}

	async fn stop_child(&self, worker: &LaunchedWorker, mut child: Child) {
		#[cfg(unix)]
		if let Some(pid) = worker.pid
			&& super::signal::terminate(pid)
			&& tokio::time::timeout(self.options.terminate_grace, child.wait()).await.is_ok()
		{
			return;
		}

		// Best-effort kill, then wait a bit.
		#[cfg(unix)]
		if let Some(pid) = worker.pid {
			super::signal::kill(pid);
		}
		let _ = child.start_kill();
		let _ = tokio::time::timeout(self.options.terminate_grace, child.wait()).await;
	}

	#[cfg(unix)]
	async fn stop_reattached(&self, pid: u32) {
		use super::signal;

		if !signal::terminate(pid) {
			return;
		}
		let deadline = tokio::time::Instant::now() + self.options.terminate_grace;
		while tokio::time::Instant::now() < deadline {
			if !signal::exists(pid) {
				return;
			}
			tokio::time::sleep(self.options.poll_interval).await;
		}
		signal::kill(pid);
	}

	#[cfg(not(unix))]
	async fn stop_reattached(&self, pid: u32) {
		warn!(pid, "Cannot signal reattached worker on this platform");
	}
}

#[async_trait]
impl WorkerTransport for LocalProcessTransport {
	fn kind(&self) -> TransportKind {
		TransportKind::LocalProcess
	}

	async fn launch(&self, key: &IsolationKey) -> Result<LaunchedWorker> {
		let Some(config) = &self.config else {
			return Err(Error::launch(key, "no worker command configured"));
		};
		let port = reserve_port().map_err(|e| Error::launch(key, format!("no free port: {e}")))?;
		let endpoint = Endpoint::new(LOOPBACK, port);

		debug!(%key, command = %config.command, %endpoint, "Spawning worker process");

		let child = Self::command(config, key, &endpoint)
			.spawn()
			.map_err(|e| Error::launch(key, format!("failed to spawn '{}': {e}", config.command)))?;
		let pid = child.id();
		let mut guard = SpawnGuard::new(child);

		self.wait_ready(key, guard.child(), &endpoint).await?;

		let id = WorkerId::next();
		self.children.lock().insert(id, guard.defuse());
		Ok(LaunchedWorker { id, endpoint, pid })
	}

	async fn terminate(&self, worker: &LaunchedWorker) {
		let child = self.children.lock().remove(&worker.id);
		match (child, worker.pid) {
			(Some(child), _) => self.stop_child(worker, child).await,
			(None, Some(pid)) => self.stop_reattached(pid).await,
			(None, None) => debug!(id = %worker.id, "No process to terminate"),
		}
	}

	async fn is_alive(&self, worker: &LaunchedWorker) -> bool {
		let exited = {
			let mut children = self.children.lock();
			match children.get_mut(&worker.id) {
				Some(child) => !matches!(child.try_wait(), Ok(None)),
				None => false,
			}
		};
		if exited {
			return false;
		}

		#[cfg(unix)]
		if let Some(pid) = worker.pid
			&& !super::signal::exists(pid)
		{
			return false;
		}

		probe(&worker.endpoint, self.options.probe_timeout).await
	}
}

/// Kills a child whose launch did not complete.
struct SpawnGuard {
	child: Option<Child>,
}

impl SpawnGuard {
	fn new(child: Child) -> Self {
		Self { child: Some(child) }
	}

	fn child(&mut self) -> &mut Child {
		self.child.as_mut().unwrap_or_else(|| unreachable!("spawn guard already defused"))
	}

	fn defuse(mut self) -> Child {
		self.child.take().unwrap_or_else(|| unreachable!("spawn guard already defused"))
	}
}

impl Drop for SpawnGuard {
	fn drop(&mut self) {
		let Some(mut child) = self.child.take() else {
			return;
		};
		#[cfg(unix)]
		if let Some(pid) = child.id() {
			super::signal::kill(pid);
		}
		if let Err(e) = child.start_kill() {
			warn!(error = %e, "Failed to kill worker after aborted launch");
		}
	}
}

fn reserve_port() -> std::io::Result<u16> {
	let listener = TcpListener::bind((LOOPBACK, 0))?;
	Ok(listener.local_addr()?.port())
}
