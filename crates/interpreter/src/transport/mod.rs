//! Worker transports.
//!
//! A transport is the capability to launch, probe and terminate workers of one
//! kind. The variant is chosen from a setting's [`TransportConfig`] by
//! [`connect`]; nothing downstream inspects the concrete type.

mod existing;
mod local;
#[cfg(unix)]
mod signal;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

pub use existing::ExistingTransport;
pub use local::LocalProcessTransport;

use crate::key::IsolationKey;
use crate::process::{Endpoint, LaunchedWorker};
use crate::Result;

/// Transport variant, persisted with recovery records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
	/// Child process spawned by the controller.
	LocalProcess,
	/// Externally managed worker at a fixed address.
	Existing,
}

impl fmt::Display for TransportKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::LocalProcess => "local-process",
			Self::Existing => "existing",
		})
	}
}

/// Launch parameters of a local worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProcessConfig {
	/// Program to run.
	pub command: String,
	/// Arguments; `{host}`, `{port}` and `{key}` are substituted.
	#[serde(default)]
	pub args: Vec<String>,
	/// Extra environment variables.
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	/// Working directory of the worker.
	#[serde(default)]
	pub working_dir: Option<PathBuf>,
}

/// Address of an externally managed worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingConfig {
	/// Host name or IP address.
	pub host: String,
	/// TCP port.
	pub port: u16,
}

/// Transport selection for a setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
	/// Spawn one child process per worker.
	LocalProcess(LocalProcessConfig),
	/// Attach to a worker someone else runs.
	Existing(ExistingConfig),
}

impl TransportConfig {
	/// Variant tag of this configuration.
	pub fn kind(&self) -> TransportKind {
		match self {
			Self::LocalProcess(_) => TransportKind::LocalProcess,
			Self::Existing(_) => TransportKind::Existing,
		}
	}
}

/// Timing knobs shared by all transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
	/// Upper bound for one reachability probe.
	pub probe_timeout: Duration,
	/// Delay between readiness probes while a worker starts.
	pub poll_interval: Duration,
	/// How long a worker may take to exit after SIGTERM before SIGKILL.
	pub terminate_grace: Duration,
}

impl Default for LaunchOptions {
	fn default() -> Self {
		Self {
			probe_timeout: Duration::from_secs(1),
			poll_interval: Duration::from_millis(50),
			terminate_grace: Duration::from_secs(2),
		}
	}
}

/// Capability interface of one worker transport.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
	/// Variant tag, stored in recovery records.
	fn kind(&self) -> TransportKind;

	/// Starts a worker for `key` and waits until it is reachable.
	///
	/// Dropping the returned future before it completes must not leak a
	/// running worker.
	async fn launch(&self, key: &IsolationKey) -> Result<LaunchedWorker>;

	/// Stops the worker and releases every resource held for it.
	///
	/// Best effort: a worker that is already gone is not an error.
	async fn terminate(&self, worker: &LaunchedWorker);

	/// Whether the worker still accepts connections.
	async fn is_alive(&self, worker: &LaunchedWorker) -> bool;
}

/// Builds the transport a setting's configuration selects.
pub fn connect(config: &TransportConfig, options: LaunchOptions) -> Arc<dyn WorkerTransport> {
	match config {
		TransportConfig::LocalProcess(cfg) => Arc::new(LocalProcessTransport::new(cfg.clone(), options)),
		TransportConfig::Existing(cfg) => Arc::new(ExistingTransport::new(cfg.clone(), options)),
	}
}

/// Builds a transport that only probes and stops workers of `kind` recorded by
/// an earlier controller. Its launches fail.
pub fn reaper(kind: TransportKind, options: LaunchOptions) -> Arc<dyn WorkerTransport> {
	match kind {
		TransportKind::LocalProcess => Arc::new(LocalProcessTransport::reaper(options)),
		TransportKind::Existing => Arc::new(ExistingTransport::reaper(options)),
	}
}

/// Returns true if `endpoint` accepts a TCP connection within `timeout`.
pub async fn probe(endpoint: &Endpoint, timeout: Duration) -> bool {
	let addr = (endpoint.host.as_str(), endpoint.port);
	matches!(tokio::time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::net::TcpListener;

	use super::*;

	#[test]
	fn transport_config_is_tagged_by_kind() {
		let cfg: TransportConfig = serde_json::from_str(r#"{"kind":"existing","host":"10.0.0.5","port":9000}"#).unwrap();
		assert_eq!(
			cfg,
			TransportConfig::Existing(ExistingConfig {
				host: "10.0.0.5".into(),
				port: 9000
			})
		);
		assert_eq!(cfg.kind(), TransportKind::Existing);

		let cfg: TransportConfig = serde_json::from_str(r#"{"kind":"local-process","command":"python3","args":["-m","worker"]}"#).unwrap();
		assert_eq!(cfg.kind(), TransportKind::LocalProcess);
	}

	#[tokio::test]
	async fn reapers_refuse_to_launch() {
		let key = crate::key::resolve("py", crate::key::SharingPolicy::Shared, None, None).unwrap();
		for kind in [TransportKind::LocalProcess, TransportKind::Existing] {
			let reaper = reaper(kind, LaunchOptions::default());
			assert_eq!(reaper.kind(), kind);
			assert!(matches!(reaper.launch(&key).await, Err(crate::Error::Launch { .. })));
		}
	}

	#[tokio::test]
	async fn probe_detects_listener() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let endpoint = Endpoint::new("127.0.0.1", port);
		assert!(probe(&endpoint, Duration::from_secs(1)).await);

		drop(listener);
		assert!(!probe(&endpoint, Duration::from_millis(200)).await);
	}
}
