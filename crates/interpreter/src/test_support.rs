//! In-memory transport and store doubles for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::PersistOp;
use crate::key::IsolationKey;
use crate::process::{Endpoint, LaunchedWorker, WorkerId};
use crate::recovery::{RecoveryRecord, RecoveryStore};
use crate::transport::{TransportKind, WorkerTransport};
use crate::{Error, Result};

/// Transport whose workers are entries in an "alive" set.
pub struct FakeTransport {
	pub launches: AtomicUsize,
	pub terminations: AtomicUsize,
	/// Number of upcoming launches that fail.
	pub fail_launches: AtomicUsize,
	pub launch_delay: Mutex<Duration>,
	/// Notified whenever a launch begins.
	pub launch_started: Notify,
	/// Notified whenever a liveness probe begins.
	pub probe_started: Notify,
	/// When set, probes wait on it before answering.
	probe_gate: Mutex<Option<Arc<Notify>>>,
	/// When set, launches wait for [`Self::release`] before finishing.
	gated: AtomicBool,
	gate: Notify,
	next_port: AtomicU16,
	alive: Mutex<HashSet<Endpoint>>,
}

impl FakeTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			launches: AtomicUsize::new(0),
			terminations: AtomicUsize::new(0),
			fail_launches: AtomicUsize::new(0),
			launch_delay: Mutex::new(Duration::ZERO),
			launch_started: Notify::new(),
			probe_started: Notify::new(),
			probe_gate: Mutex::new(None),
			gated: AtomicBool::new(false),
			gate: Notify::new(),
			next_port: AtomicU16::new(20_000),
			alive: Mutex::new(HashSet::new()),
		})
	}

	pub fn gated() -> Arc<Self> {
		let transport = Self::new();
		transport.gated.store(true, Ordering::SeqCst);
		transport
	}

	/// Makes liveness probes block until the returned notify fires.
	pub fn gate_probes(&self) -> Arc<Notify> {
		let gate = Arc::new(Notify::new());
		*self.probe_gate.lock() = Some(gate.clone());
		gate
	}

	/// Lets one gated launch finish.
	pub fn release(&self) {
		self.gate.notify_one();
	}

	pub fn launches(&self) -> usize {
		self.launches.load(Ordering::SeqCst)
	}

	/// Simulates a worker crash.
	pub fn kill(&self, endpoint: &Endpoint) {
		self.alive.lock().remove(endpoint);
	}

	/// Registers a worker some earlier controller launched.
	pub fn adopt(&self, endpoint: Endpoint) {
		self.alive.lock().insert(endpoint);
	}

	pub fn is_running(&self, endpoint: &Endpoint) -> bool {
		self.alive.lock().contains(endpoint)
	}
}

#[async_trait]
impl WorkerTransport for FakeTransport {
	fn kind(&self) -> TransportKind {
		TransportKind::LocalProcess
	}

	async fn launch(&self, key: &IsolationKey) -> Result<LaunchedWorker> {
		self.launches.fetch_add(1, Ordering::SeqCst);
		self.launch_started.notify_one();

		let delay = *self.launch_delay.lock();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		if self.gated.load(Ordering::SeqCst) {
			self.gate.notified().await;
		}

		let failed = self.fail_launches.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
		if failed {
			return Err(Error::launch(key, "injected launch failure"));
		}

		let endpoint = Endpoint::new("fake", self.next_port.fetch_add(1, Ordering::SeqCst));
		self.alive.lock().insert(endpoint.clone());
		Ok(LaunchedWorker {
			id: WorkerId::next(),
			endpoint,
			pid: None,
		})
	}

	async fn terminate(&self, worker: &LaunchedWorker) {
		self.terminations.fetch_add(1, Ordering::SeqCst);
		self.alive.lock().remove(&worker.endpoint);
	}

	async fn is_alive(&self, worker: &LaunchedWorker) -> bool {
		self.probe_started.notify_one();
		let gate = self.probe_gate.lock().clone();
		if let Some(gate) = gate {
			gate.notified().await;
		}
		self.is_running(&worker.endpoint)
	}
}

/// Volatile store with failure injection and per-key put stalls.
#[derive(Default)]
pub struct MemoryRecoveryStore {
	records: Mutex<BTreeMap<IsolationKey, RecoveryRecord>>,
	pub fail_puts: AtomicUsize,
	/// Number of upcoming puts that write the record, then report failure.
	pub fail_puts_after_write: AtomicUsize,
	pub fail_removes: AtomicUsize,
	stalled: Mutex<Option<(String, Arc<Notify>)>>,
}

impl MemoryRecoveryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Makes puts for `setting_id` block until the returned notify fires.
	pub fn stall_setting(&self, setting_id: &str) -> Arc<Notify> {
		let notify = Arc::new(Notify::new());
		*self.stalled.lock() = Some((setting_id.to_string(), notify.clone()));
		notify
	}

	pub fn keys(&self) -> Vec<IsolationKey> {
		self.records.lock().keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn insert(&self, record: RecoveryRecord) {
		self.records.lock().insert(record.key.clone(), record);
	}
}

fn take_failure(counter: &AtomicUsize) -> bool {
	counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
	fn describe(&self) -> String {
		"memory".into()
	}

	async fn put(&self, record: &RecoveryRecord) -> Result<()> {
		let stall = self
			.stalled
			.lock()
			.as_ref()
			.filter(|(setting, _)| record.key.belongs_to(setting))
			.map(|(_, notify)| notify.clone());
		if let Some(notify) = stall {
			notify.notified().await;
		}
		if take_failure(&self.fail_puts) {
			return Err(Error::persist(PersistOp::Put, &record.key, "injected put failure"));
		}
		if take_failure(&self.fail_puts_after_write) {
			self.insert(record.clone());
			return Err(Error::persist(PersistOp::Put, &record.key, "injected sync failure"));
		}
		self.insert(record.clone());
		Ok(())
	}

	async fn remove(&self, key: &IsolationKey) -> Result<()> {
		if take_failure(&self.fail_removes) {
			return Err(Error::persist(PersistOp::Remove, key, "injected remove failure"));
		}
		self.records.lock().remove(key);
		Ok(())
	}

	async fn list(&self) -> Result<Vec<RecoveryRecord>> {
		Ok(self.records.lock().values().cloned().collect())
	}
}
