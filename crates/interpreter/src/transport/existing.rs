//! Transport for workers that are started and owned outside the controller.

use async_trait::async_trait;
use tracing::debug;

use super::{ExistingConfig, LaunchOptions, TransportKind, WorkerTransport, probe};
use crate::key::IsolationKey;
use crate::process::{Endpoint, LaunchedWorker, WorkerId};
use crate::{Error, Result};

/// Attaches to a worker listening at a fixed address.
///
/// The worker's process is not ours: launching only checks reachability and
/// terminating only drops the handle.
pub struct ExistingTransport {
	/// `None` for a reaper, which only handles recorded workers.
	endpoint: Option<Endpoint>,
	options: LaunchOptions,
}

impl ExistingTransport {
	/// Creates a transport for the configured address.
	pub fn new(config: ExistingConfig, options: LaunchOptions) -> Self {
		Self {
			endpoint: Some(Endpoint::new(config.host, config.port)),
			options,
		}
	}

	/// Creates a transport without an address, for recorded workers only.
	pub fn reaper(options: LaunchOptions) -> Self {
		Self { endpoint: None, options }
	}
}

#[async_trait]
impl WorkerTransport for ExistingTransport {
	fn kind(&self) -> TransportKind {
		TransportKind::Existing
	}

	async fn launch(&self, key: &IsolationKey) -> Result<LaunchedWorker> {
		let Some(endpoint) = &self.endpoint else {
			return Err(Error::launch(key, "no worker address configured"));
		};
		if !probe(endpoint, self.options.probe_timeout).await {
			return Err(Error::launch(key, format!("existing worker at {endpoint} is unreachable")));
		}
		Ok(LaunchedWorker {
			id: WorkerId::next(),
			endpoint: endpoint.clone(),
			pid: None,
		})
	}

	async fn terminate(&self, worker: &LaunchedWorker) {
		debug!(id = %worker.id, endpoint = %worker.endpoint, "Releasing externally managed worker");
	}

	async fn is_alive(&self, worker: &LaunchedWorker) -> bool {
		probe(&worker.endpoint, self.options.probe_timeout).await
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::net::TcpListener;

	use super::*;
	use crate::key::{self, SharingPolicy};

	#[tokio::test]
	async fn launch_requires_reachable_worker() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let options = LaunchOptions {
			probe_timeout: Duration::from_millis(200),
			..LaunchOptions::default()
		};
		let transport = ExistingTransport::new(
			ExistingConfig {
				host: "127.0.0.1".into(),
				port,
			},
			options,
		);
		let key = key::resolve("remote", SharingPolicy::Shared, None, None).unwrap();

		let worker = transport.launch(&key).await.unwrap();
		assert_eq!(worker.endpoint, Endpoint::new("127.0.0.1", port));
		assert_eq!(worker.pid, None);

		transport.terminate(&worker).await;
		assert!(transport.is_alive(&worker).await, "terminate must not stop an unowned worker");

		drop(listener);
		assert!(!transport.is_alive(&worker).await);
		assert!(matches!(transport.launch(&key).await, Err(Error::Launch { .. })));
	}
}
