//! Process registry.
//!
//! Maps isolation keys to live interpreter workers. Owns creation on miss,
//! reuse on hit, teardown, and restore-time reattachment, and keeps the
//! recovery store in step with what it serves.
//!
//! # Concurrency
//!
//! Every key has at most one pending operation (create or close). The first
//! caller to find a key idle becomes the leader: it registers the operation
//! and spawns the work onto the runtime, so abandoning the call does not
//! cancel it. Every caller, leader included, then waits on the operation's
//! `watch` channel and observes the same outcome. A close that finds a create
//! pending waits for it to settle first, and the reverse. The state lock
//! only guards map updates and is never held across an await, so keys make
//! progress independently.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::key::IsolationKey;
use crate::process::{Endpoint, InterpreterProcess, ProcessState, WorkerId};
use crate::recovery::{RecoveryRecord, RecoveryStore};
use crate::transport::{TransportKind, WorkerTransport};
use crate::{Error, Result};

/// Tunables of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
	/// Maximum time a launch may take before it fails with [`Error::Launch`].
	pub launch_timeout: Duration,
}

impl Default for RegistryOptions {
	fn default() -> Self {
		Self {
			launch_timeout: Duration::from_secs(30),
		}
	}
}

/// What happens to running workers on [`ProcessRegistry::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
	/// Release handles only; workers and their records survive for the next
	/// controller to reattach.
	#[default]
	Detach,
	/// Terminate every worker and remove its record.
	Terminate,
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
	/// Slot the worker serves.
	pub key: IsolationKey,
	/// Controller-local handle id.
	pub id: WorkerId,
	/// Connection endpoint.
	pub endpoint: Endpoint,
	/// OS process id, if known.
	pub pid: Option<u32>,
	/// Lifecycle state.
	pub state: ProcessState,
	/// Transport variant.
	pub transport: TransportKind,
	/// Launch time.
	pub started_at: DateTime<Utc>,
}

/// How [`ProcessRegistry::restore_from`] treats one recovery record.
pub enum RestoreAction {
	/// Serve the recorded worker through this transport if it is still alive.
	Reattach(Arc<dyn WorkerTransport>),
	/// The record can no longer be served. A worker still running is stopped
	/// through this transport before the record is discarded.
	Retire(Arc<dyn WorkerTransport>),
}

/// Outcome of [`ProcessRegistry::restore_from`].
#[derive(Debug, Default)]
pub struct RestoreReport {
	/// Keys reattached to a live worker.
	pub restored: Vec<IsolationKey>,
	/// Keys whose record was discarded, because the worker is gone or can no
	/// longer be served.
	pub dropped: Vec<IsolationKey>,
	/// Dropped keys whose worker was still running and has been stopped.
	pub retired: Vec<IsolationKey>,
	/// Records ignored because the key is already managed.
	pub skipped: usize,
	/// Store failures while discarding records.
	pub errors: Vec<Error>,
}

/// Outcome of [`ProcessRegistry::reconcile`].
#[derive(Debug, Default)]
pub struct ReconcileReport {
	/// Running workers found dead and torn down.
	pub crashed: Vec<IsolationKey>,
	/// Tombstones whose record removal finally succeeded.
	pub cleared: Vec<IsolationKey>,
	/// Running workers whose missing record was written again.
	pub repersisted: Vec<IsolationKey>,
	/// Records no entry owned, deleted from the store.
	pub stale_removed: Vec<IsolationKey>,
	/// Failures encountered along the way.
	pub errors: Vec<Error>,
}

impl ReconcileReport {
	/// True when reconciliation found nothing to fix.
	pub fn is_clean(&self) -> bool {
		self.crashed.is_empty() && self.cleared.is_empty() && self.repersisted.is_empty() && self.stale_removed.is_empty() && self.errors.is_empty()
	}
}

enum Entry {
	Live(Arc<InterpreterProcess>),
	/// Worker terminated, but its record could not be removed yet.
	Tombstone,
}

type CreateRx = watch::Receiver<Option<Result<Endpoint>>>;
type CloseRx = watch::Receiver<Option<Result<()>>>;

#[derive(Clone)]
enum PendingOp {
	Create(CreateRx),
	Close(CloseRx),
	/// Store update that must not interleave with a launch or teardown.
	Maintain(CloseRx),
}

struct RegistryState {
	entries: HashMap<IsolationKey, Entry>,
	pending: HashMap<IsolationKey, PendingOp>,
	shut_down: bool,
}

impl RegistryState {
	fn is_managed(&self, key: &IsolationKey) -> bool {
		self.entries.contains_key(key) || self.pending.contains_key(key)
	}

	fn running(&self, key: &IsolationKey) -> Option<&Arc<InterpreterProcess>> {
		match self.entries.get(key) {
			Some(Entry::Live(process)) if process.state() == ProcessState::Running => Some(process),
			_ => None,
		}
	}
}

enum CreateBegin {
	Serve(Endpoint),
	Join(PendingOp),
	Lead(watch::Sender<Option<Result<Endpoint>>>, CreateRx),
}

enum CloseBegin {
	Absent,
	Join(PendingOp),
	Lead(watch::Sender<Option<Result<()>>>, CloseRx, Option<Arc<InterpreterProcess>>),
}

struct Inner {
	state: Mutex<RegistryState>,
	store: Arc<dyn RecoveryStore>,
	options: RegistryOptions,
}

/// In-memory map from isolation key to live worker.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ProcessRegistry {
	inner: Arc<Inner>,
}

impl ProcessRegistry {
	/// Creates an empty registry that records workers in `store`.
	pub fn new(store: Arc<dyn RecoveryStore>, options: RegistryOptions) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(RegistryState {
					entries: HashMap::new(),
					pending: HashMap::new(),
					shut_down: false,
				}),
				store,
				options,
			}),
		}
	}

	/// The recovery store this registry writes to.
	pub fn store(&self) -> &Arc<dyn RecoveryStore> {
		&self.inner.store
	}

	/// Returns the endpoint of the running worker for `key`, launching one
	/// with `launch` if there is none.
	///
	/// Concurrent calls for one key share a single launch and all observe its
	/// outcome. The record is durable before any caller sees success. A failed
	/// launch leaves no entry behind, so the next call retries.
	pub async fn acquire<F, Fut>(&self, key: IsolationKey, launch: F) -> Result<Endpoint>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<InterpreterProcess>> + Send + 'static,
	{
		let (tx, rx) = loop {
			match self.begin_create(&key)? {
				CreateBegin::Serve(endpoint) => {
					debug!(%key, %endpoint, "Reusing interpreter worker");
					return Ok(endpoint);
				}
				CreateBegin::Join(PendingOp::Create(rx)) => {
					debug!(%key, "Waiting for in-flight launch");
					return settled(rx).await.unwrap_or_else(|| Err(aborted(&key)));
				}
				CreateBegin::Join(PendingOp::Close(rx) | PendingOp::Maintain(rx)) => {
					debug!(%key, "Waiting for teardown before launch");
					settled(rx).await;
				}
				CreateBegin::Lead(tx, rx) => break (tx, rx),
			}
		};

		let inner = Arc::clone(&self.inner);
		let task_key = key.clone();
		let guard = SettleGuard::new(Arc::clone(&inner), key.clone(), tx);
		tokio::spawn(async move {
			match inner.create(&task_key, launch).await {
				Ok(process) => {
					let endpoint = process.endpoint().clone();
					guard.settle(Ok(endpoint), |state| {
						state.entries.insert(task_key, Entry::Live(process));
					});
				}
				Err(e) => guard.settle(Err(e), |_| {}),
			}
		});

		settled(rx).await.unwrap_or_else(|| Err(aborted(&key)))
	}

	fn begin_create(&self, key: &IsolationKey) -> Result<CreateBegin> {
		let mut state = self.inner.state.lock();
		if state.shut_down {
			return Err(Error::ShutDown);
		}
		if let Some(op) = state.pending.get(key) {
			return Ok(CreateBegin::Join(op.clone()));
		}
		if let Some(process) = state.running(key) {
			return Ok(CreateBegin::Serve(process.endpoint().clone()));
		}
		let (tx, rx) = watch::channel(None);
		state.pending.insert(key.clone(), PendingOp::Create(rx.clone()));
		Ok(CreateBegin::Lead(tx, rx))
	}

	/// Tears down the worker for `key`: terminate, remove its record, evict.
	///
	/// Waits for a pending launch of the key to settle first. Removing an
	/// absent key is a no-op.
	pub async fn remove(&self, key: &IsolationKey) -> Result<()> {
		self.close_entry(key, None).await.map(|_| ())
	}

	/// Tears down `key` only while it is still served by worker `id`.
	///
	/// Returns false, touching nothing, if the key is idle or has moved on to
	/// another worker.
	pub async fn remove_worker(&self, key: &IsolationKey, id: WorkerId) -> Result<bool> {
		self.close_entry(key, Some(id)).await
	}

	async fn close_entry(&self, key: &IsolationKey, only: Option<WorkerId>) -> Result<bool> {
		let (tx, rx, process) = loop {
			match self.begin_close(key, only) {
				CloseBegin::Absent => return Ok(false),
				CloseBegin::Join(PendingOp::Create(rx)) => {
					debug!(%key, "Waiting for in-flight launch before teardown");
					settled(rx).await;
				}
				CloseBegin::Join(PendingOp::Maintain(rx)) => {
					settled(rx).await;
				}
				CloseBegin::Join(PendingOp::Close(rx)) if only.is_some() => {
					settled(rx).await;
				}
				CloseBegin::Join(PendingOp::Close(rx)) => return settled(rx).await.unwrap_or(Ok(())).map(|()| true),
				CloseBegin::Lead(tx, rx, process) => break (tx, rx, process),
			}
		};

		let inner = Arc::clone(&self.inner);
		let owned_key = key.clone();
		let guard = SettleGuard::new(Arc::clone(&inner), owned_key.clone(), tx);
		tokio::spawn(async move {
			let result = inner.close(&owned_key, process).await;
			let evict = result.is_ok();
			guard.settle(result, |state| {
				if evict {
					state.entries.remove(&owned_key);
				} else {
					state.entries.insert(owned_key, Entry::Tombstone);
				}
			});
		});

		settled(rx).await.unwrap_or_else(|| Err(aborted(key))).map(|()| true)
	}

	fn begin_close(&self, key: &IsolationKey, only: Option<WorkerId>) -> CloseBegin {
		let mut state = self.inner.state.lock();
		if let Some(op) = state.pending.get(key) {
			return CloseBegin::Join(op.clone());
		}
		let process = match state.entries.get(key) {
			None => return CloseBegin::Absent,
			Some(Entry::Live(process)) if only.is_some_and(|id| id != process.id()) => return CloseBegin::Absent,
			Some(Entry::Tombstone) if only.is_some() => return CloseBegin::Absent,
			Some(Entry::Tombstone) => None,
			Some(Entry::Live(process)) => {
				process.begin_close();
				Some(Arc::clone(process))
			}
		};
		let (tx, rx) = watch::channel(None);
		state.pending.insert(key.clone(), PendingOp::Close(rx.clone()));
		CloseBegin::Lead(tx, rx, process)
	}

	/// Reserves a key nothing manages for a store update.
	fn claim_unmanaged(&self, key: &IsolationKey) -> Option<SettleGuard<()>> {
		let mut state = self.inner.state.lock();
		if state.is_managed(key) {
			return None;
		}
		Some(self.claim(&mut state, key))
	}

	/// Reserves a key for a store update while `process` still serves it.
	fn claim_running(&self, process: &InterpreterProcess) -> Option<SettleGuard<()>> {
		let mut state = self.inner.state.lock();
		if state.pending.contains_key(process.key()) {
			return None;
		}
		let same = state.running(process.key()).is_some_and(|current| current.id() == process.id());
		if !same {
			return None;
		}
		Some(self.claim(&mut state, process.key()))
	}

	fn claim(&self, state: &mut RegistryState, key: &IsolationKey) -> SettleGuard<()> {
		let (tx, rx) = watch::channel(None);
		state.pending.insert(key.clone(), PendingOp::Maintain(rx));
		SettleGuard::new(Arc::clone(&self.inner), key.clone(), tx)
	}

	/// Removes the record of an unmanaged key. False if the key became
	/// managed, in which case the record is left alone.
	async fn remove_unmanaged_record(&self, key: &IsolationKey) -> Result<bool> {
		let Some(guard) = self.claim_unmanaged(key) else {
			return Ok(false);
		};
		let result = self.inner.store.remove(key).await;
		guard.settle(result.clone(), |_| {});
		result.map(|()| true)
	}

	/// Removes every worker of `setting_id`, whatever its policy, and deletes
	/// persisted records of that setting no entry owns.
	pub async fn remove_all(&self, setting_id: &str) -> Result<()> {
		let keys: Vec<IsolationKey> = {
			let state = self.inner.state.lock();
			let keys: HashSet<&IsolationKey> = state.entries.keys().chain(state.pending.keys()).filter(|k| k.belongs_to(setting_id)).collect();
			keys.into_iter().cloned().collect()
		};
		info!(setting = setting_id, workers = keys.len(), "Closing all workers of setting");

		let mut first_err = join_all(keys.iter().map(|key| self.remove(key))).await.into_iter().find_map(Result::err);

		match self.inner.store.list().await {
			Ok(records) => {
				for record in records.into_iter().filter(|r| r.key.belongs_to(setting_id)) {
					match self.remove_unmanaged_record(&record.key).await {
						Ok(true) => debug!(key = %record.key, "Removed orphaned recovery record"),
						Ok(false) => {}
						Err(e) => {
							first_err.get_or_insert(e);
						}
					}
				}
			}
			Err(e) => {
				first_err.get_or_insert(e);
			}
		}

		first_err.map_or(Ok(()), Err)
	}

	/// Reattaches to workers recorded by a previous controller.
	///
	/// `action_for` decides per record whether it is still served. Live workers
	/// of served records become running entries without being relaunched.
	/// Other records are removed from the store, after stopping their worker
	/// if it is still running, so no worker is left without a record.
	pub async fn restore_from<T>(&self, records: Vec<RecoveryRecord>, action_for: T) -> RestoreReport
	where
		T: Fn(&RecoveryRecord) -> RestoreAction,
	{
		let mut report = RestoreReport::default();

		let candidates: Vec<_> = records
			.into_iter()
			.filter_map(|record| {
				if self.is_managed(&record.key) {
					report.skipped += 1;
					return None;
				}
				let action = action_for(&record);
				Some((record, action))
			})
			.collect();

		let checked = join_all(candidates.into_iter().map(|(record, action)| async move {
			let (transport, serve) = match action {
				RestoreAction::Reattach(transport) => (transport, true),
				RestoreAction::Retire(transport) => (transport, false),
			};
			let process = InterpreterProcess::reattach(&record, transport);
			let alive = process.is_alive().await;
			(record, process, alive, serve)
		}))
		.await;

		for (record, process, alive, serve) in checked {
			if alive && serve {
				process.mark_running();
				let inserted = {
					let mut state = self.inner.state.lock();
					if state.shut_down || state.is_managed(&record.key) {
						false
					} else {
						state.entries.insert(record.key.clone(), Entry::Live(Arc::new(process)));
						true
					}
				};
				if inserted {
					info!(key = %record.key, endpoint = %record.endpoint, pid = ?record.pid, "Reattached interpreter worker");
					report.restored.push(record.key);
				} else {
					report.skipped += 1;
				}
				continue;
			}

			let Some(guard) = self.claim_unmanaged(&record.key) else {
				report.skipped += 1;
				continue;
			};
			if alive {
				warn!(key = %record.key, endpoint = %record.endpoint, pid = ?record.pid, "Stopping worker whose record can no longer be served");
				process.terminate().await;
			} else {
				warn!(key = %record.key, endpoint = %record.endpoint, "Dropping recovery record of unreachable worker");
			}
			let result = self.inner.store.remove(&record.key).await;
			guard.settle(result.clone(), |_| {});
			match result {
				Ok(()) => {
					if alive {
						report.retired.push(record.key.clone());
					}
					report.dropped.push(record.key);
				}
				Err(e) => report.errors.push(e),
			}
		}

		report
	}

	/// Brings registry and store back in line.
	///
	/// Tears down running workers that died, retries tombstoned record
	/// removals, rewrites records missing for running workers and deletes
	/// records nothing owns.
	pub async fn reconcile(&self) -> ReconcileReport {
		let mut report = ReconcileReport::default();

		let (live, tombstones): (Vec<Arc<InterpreterProcess>>, Vec<IsolationKey>) = {
			let state = self.inner.state.lock();
			let idle = |key: &IsolationKey| !state.pending.contains_key(key);
			let live = state.entries.iter().filter(|(k, _)| idle(k)).filter_map(|(k, _)| state.running(k).cloned()).collect();
			let tombstones = state
				.entries
				.iter()
				.filter(|(k, e)| idle(k) && matches!(e, Entry::Tombstone))
				.map(|(k, _)| k.clone())
				.collect();
			(live, tombstones)
		};

		let probes = join_all(live.iter().map(|process| async move { (process, process.is_alive().await) })).await;
		for (process, alive) in probes {
			if alive {
				continue;
			}
			match self.remove_worker(process.key(), process.id()).await {
				Ok(true) => {
					warn!(key = %process.key(), endpoint = %process.endpoint(), "Interpreter worker died");
					report.crashed.push(process.key().clone());
				}
				Ok(false) => debug!(key = %process.key(), "Dead worker already replaced"),
				Err(e) => report.errors.push(e),
			}
		}

		for key in tombstones {
			match self.remove(&key).await {
				Ok(()) => report.cleared.push(key),
				Err(e) => report.errors.push(e),
			}
		}

		let records = match self.inner.store.list().await {
			Ok(records) => records,
			Err(e) => {
				report.errors.push(e);
				return report;
			}
		};
		let persisted: HashSet<&IsolationKey> = records.iter().map(|r| &r.key).collect();

		let unrecorded: Vec<Arc<InterpreterProcess>> = {
			let state = self.inner.state.lock();
			state
				.entries
				.keys()
				.filter(|k| !persisted.contains(k) && !state.pending.contains_key(*k))
				.filter_map(|k| state.running(k).cloned())
				.collect()
		};
		for process in unrecorded {
			let Some(guard) = self.claim_running(&process) else {
				continue;
			};
			warn!(key = %process.key(), "Rewriting missing recovery record");
			let result = self.inner.store.put(&process.record()).await;
			guard.settle(result.clone(), |_| {});
			match result {
				Ok(()) => report.repersisted.push(process.key().clone()),
				Err(e) => report.errors.push(e),
			}
		}

		for record in &records {
			match self.remove_unmanaged_record(&record.key).await {
				Ok(true) => {
					warn!(key = %record.key, "Removed recovery record with no worker");
					report.stale_removed.push(record.key.clone());
				}
				Ok(false) => {}
				Err(e) => report.errors.push(e),
			}
		}

		report
	}

	/// Stops serving: waits for pending operations, then detaches from or
	/// terminates every worker. Later acquires fail with [`Error::ShutDown`].
	pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
		let pending: Vec<PendingOp> = {
			let mut state = self.inner.state.lock();
			state.shut_down = true;
			state.pending.values().cloned().collect()
		};
		for op in pending {
			match op {
				PendingOp::Create(rx) => {
					settled(rx).await;
				}
				PendingOp::Close(rx) | PendingOp::Maintain(rx) => {
					settled(rx).await;
				}
			}
		}

		match mode {
			ShutdownMode::Detach => {
				let detached = {
					let mut state = self.inner.state.lock();
					let count = state.entries.len();
					state.entries.clear();
					count
				};
				info!(workers = detached, "Detached from interpreter workers");
				Ok(())
			}
			ShutdownMode::Terminate => {
				let keys: Vec<IsolationKey> = self.inner.state.lock().entries.keys().cloned().collect();
				info!(workers = keys.len(), "Terminating interpreter workers");
				join_all(keys.iter().map(|key| self.remove(key))).await.into_iter().find_map(Result::err).map_or(Ok(()), Err)
			}
		}
	}

	/// Number of running workers.
	pub fn count(&self) -> usize {
		let state = self.inner.state.lock();
		state.entries.keys().filter(|k| state.running(k).is_some()).count()
	}

	/// Endpoint of the running worker for `key`, without launching.
	pub fn endpoint(&self, key: &IsolationKey) -> Option<Endpoint> {
		self.inner.state.lock().running(key).map(|p| p.endpoint().clone())
	}

	/// Current workers, ordered by key.
	pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
		let state = self.inner.state.lock();
		let mut workers: Vec<WorkerSnapshot> = state
			.entries
			.values()
			.filter_map(|entry| match entry {
				Entry::Live(process) => Some(WorkerSnapshot {
					key: process.key().clone(),
					id: process.id(),
					endpoint: process.endpoint().clone(),
					pid: process.pid(),
					state: process.state(),
					transport: process.transport_kind(),
					started_at: process.started_at(),
				}),
				Entry::Tombstone => None,
			})
			.collect();
		workers.sort_by(|a, b| a.key.cmp(&b.key));
		workers
	}

	fn is_managed(&self, key: &IsolationKey) -> bool {
		self.inner.state.lock().is_managed(key)
	}
}

impl Inner {
	async fn create<F, Fut>(&self, key: &IsolationKey, launch: F) -> Result<Arc<InterpreterProcess>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<InterpreterProcess>>,
	{
		let timeout = self.options.launch_timeout;
		let process = match tokio::time::timeout(timeout, launch()).await {
			Ok(Ok(process)) => Arc::new(process),
			Ok(Err(e @ Error::Launch { .. })) => return Err(e),
			Ok(Err(e)) => return Err(Error::launch(key, e)),
			Err(_) => return Err(Error::launch(key, format!("worker not reachable within {timeout:?}"))),
		};

		if let Err(e) = self.store.put(&process.record()).await {
			warn!(%key, error = %e, "Failed to persist recovery record, terminating fresh worker");
			process.terminate().await;
			// The write may have landed before the failure surfaced.
			if let Err(cleanup) = self.store.remove(key).await {
				warn!(%key, error = %cleanup, "Failed to clear recovery record of terminated worker");
			}
			return Err(e);
		}

		process.mark_running();
		info!(%key, endpoint = %process.endpoint(), pid = ?process.pid(), "Interpreter worker running");
		Ok(process)
	}

	async fn close(&self, key: &IsolationKey, process: Option<Arc<InterpreterProcess>>) -> Result<()> {
		if let Some(process) = &process {
			process.terminate().await;
		}
		match self.store.remove(key).await {
			Ok(()) => {
				info!(%key, "Interpreter worker closed");
				Ok(())
			}
			Err(e) => {
				warn!(%key, error = %e, "Worker terminated but its recovery record remains");
				Err(e)
			}
		}
	}
}

/// Publishes an operation's outcome and clears its pending slot.
///
/// If the task running the operation dies first, dropping the guard still
/// frees the key and hands waiters an error.
struct SettleGuard<T> {
	inner: Arc<Inner>,
	key: IsolationKey,
	tx: watch::Sender<Option<Result<T>>>,
	settled: bool,
}

impl<T> SettleGuard<T> {
	fn new(inner: Arc<Inner>, key: IsolationKey, tx: watch::Sender<Option<Result<T>>>) -> Self {
		Self {
			inner,
			key,
			tx,
			settled: false,
		}
	}

	fn settle(mut self, result: Result<T>, apply: impl FnOnce(&mut RegistryState)) {
		{
			let mut state = self.inner.state.lock();
			state.pending.remove(&self.key);
			apply(&mut state);
		}
		self.settled = true;
		let _ = self.tx.send(Some(result));
	}
}

impl<T> Drop for SettleGuard<T> {
	fn drop(&mut self) {
		if self.settled {
			return;
		}
		self.inner.state.lock().pending.remove(&self.key);
		let _ = self.tx.send(Some(Err(aborted(&self.key))));
	}
}

fn aborted(key: &IsolationKey) -> Error {
	Error::launch(key, "operation aborted before completion")
}

/// Waits for an operation's outcome. `None` if it vanished without one.
async fn settled<T: Clone>(mut rx: watch::Receiver<Option<Result<T>>>) -> Option<Result<T>> {
	loop {
		let current = rx.borrow_and_update().clone();
		if current.is_some() {
			return current;
		}
		if rx.changed().await.is_err() {
			return rx.borrow().clone();
		}
	}
}
