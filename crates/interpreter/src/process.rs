//! Handle to one out-of-process interpreter worker.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::key::IsolationKey;
use crate::recovery::RecoveryRecord;
use crate::transport::{TransportKind, WorkerTransport};
use crate::Result;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Controller-local identifier of a worker handle.
///
/// Not persisted: a reattached worker receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
	/// Allocates the next id.
	pub fn next() -> Self {
		Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for WorkerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "worker#{}", self.0)
	}
}

/// Network address a worker accepts connections on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
	/// Host name or IP address.
	pub host: String,
	/// TCP port.
	pub port: u16,
}

impl Endpoint {
	/// Creates an endpoint.
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self { host: host.into(), port }
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// What a transport knows about a worker it launched or reattached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedWorker {
	/// Controller-local handle id.
	pub id: WorkerId,
	/// Where the worker accepts connections.
	pub endpoint: Endpoint,
	/// OS process id, when the worker is a process this host can signal.
	pub pid: Option<u32>,
}

/// Lifecycle state of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
	/// Launched or reattached, not yet serving.
	Starting,
	/// Recorded and serving requests.
	Running,
	/// Teardown in progress.
	Closing,
	/// Terminated.
	Closed,
}

impl fmt::Display for ProcessState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Starting => "starting",
			Self::Running => "running",
			Self::Closing => "closing",
			Self::Closed => "closed",
		})
	}
}

/// One live worker, exclusively owned by its registry entry.
pub struct InterpreterProcess {
	key: IsolationKey,
	worker: LaunchedWorker,
	transport: Arc<dyn WorkerTransport>,
	started_at: DateTime<Utc>,
	state: Mutex<ProcessState>,
	terminated: AtomicBool,
}

impl InterpreterProcess {
	/// Launches a new worker for `key` through `transport`.
	pub async fn launch(key: IsolationKey, transport: Arc<dyn WorkerTransport>) -> Result<Self> {
		let worker = transport.launch(&key).await?;
		info!(%key, id = %worker.id, endpoint = %worker.endpoint, pid = ?worker.pid, transport = %transport.kind(), "Launched interpreter worker");
		Ok(Self::new(key, worker, transport, Utc::now()))
	}

	/// Builds a handle for a worker recorded by a previous controller.
	///
	/// Nothing is launched; callers verify [`Self::is_alive`] before serving it.
	pub fn reattach(record: &RecoveryRecord, transport: Arc<dyn WorkerTransport>) -> Self {
		let worker = LaunchedWorker {
			id: WorkerId::next(),
			endpoint: record.endpoint.clone(),
			pid: record.pid,
		};
		Self::new(record.key.clone(), worker, transport, record.recorded_at)
	}

	fn new(key: IsolationKey, worker: LaunchedWorker, transport: Arc<dyn WorkerTransport>, started_at: DateTime<Utc>) -> Self {
		Self {
			key,
			worker,
			transport,
			started_at,
			state: Mutex::new(ProcessState::Starting),
			terminated: AtomicBool::new(false),
		}
	}

	/// Isolation key this worker serves.
	pub fn key(&self) -> &IsolationKey {
		&self.key
	}

	/// Connection endpoint.
	pub fn endpoint(&self) -> &Endpoint {
		&self.worker.endpoint
	}

	/// OS process id, if known.
	pub fn pid(&self) -> Option<u32> {
		self.worker.pid
	}

	/// Controller-local handle id.
	pub fn id(&self) -> WorkerId {
		self.worker.id
	}

	/// When the worker was launched.
	pub fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}

	/// Transport variant that owns the worker.
	pub fn transport_kind(&self) -> TransportKind {
		self.transport.kind()
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ProcessState {
		*self.state.lock()
	}

	pub(crate) fn mark_running(&self) {
		let mut state = self.state.lock();
		if *state == ProcessState::Starting {
			*state = ProcessState::Running;
		}
	}

	/// Moves the handle to [`ProcessState::Closing`]. Returns false if it was
	/// already closing or closed.
	pub(crate) fn begin_close(&self) -> bool {
		let mut state = self.state.lock();
		match *state {
			ProcessState::Starting | ProcessState::Running => {
				*state = ProcessState::Closing;
				true
			}
			ProcessState::Closing | ProcessState::Closed => false,
		}
	}

	/// Whether the worker still answers on its endpoint.
	pub async fn is_alive(&self) -> bool {
		if self.terminated.load(Ordering::Acquire) {
			return false;
		}
		self.transport.is_alive(&self.worker).await
	}

	/// Terminates the worker and releases its resources.
	///
	/// Only the first call reaches the transport; later calls return at once.
	/// Succeeds even if the worker already died.
	pub async fn terminate(&self) {
		if self.terminated.swap(true, Ordering::AcqRel) {
			return;
		}
		self.begin_close();
		debug!(key = %self.key, id = %self.worker.id, pid = ?self.worker.pid, "Terminating interpreter worker");
		self.transport.terminate(&self.worker).await;
		*self.state.lock() = ProcessState::Closed;
	}

	/// Durable projection of this worker.
	pub fn record(&self) -> RecoveryRecord {
		RecoveryRecord {
			setting_id: self.key.setting_id().to_string(),
			key: self.key.clone(),
			transport: self.transport.kind(),
			pid: self.worker.pid,
			endpoint: self.worker.endpoint.clone(),
			recorded_at: self.started_at,
		}
	}
}

impl fmt::Debug for InterpreterProcess {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("InterpreterProcess")
			.field("key", &self.key)
			.field("worker", &self.worker)
			.field("transport", &self.transport.kind())
			.field("state", &self.state())
			.finish()
	}
}
