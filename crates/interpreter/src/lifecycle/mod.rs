//! Recovery-aware lifecycle controller.
//!
//! Routes requests through the settings catalog to the registry: resolve the
//! isolation key, reuse or launch the worker, and tear workers down on close,
//! restart, reconfiguration or reported crash. On startup, [`restore`] rebuilds
//! the registry from the recovery store without relaunching healthy workers.
//!
//! [`restore`]: LifecycleController::restore

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::key::IsolationKey;
use crate::process::{Endpoint, InterpreterProcess};
use crate::recovery::{RecoveryRecord, RecoveryStore};
use crate::registry::{ProcessRegistry, ReconcileReport, RegistryOptions, RestoreAction, RestoreReport, ShutdownMode, WorkerSnapshot};
use crate::setting::{InterpreterRequest, Setting};
use crate::transport::{self, LaunchOptions, TransportKind, WorkerTransport};
use crate::{Error, Result};

/// Tunables of a [`LifecycleController`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerOptions {
	/// Registry tunables (launch timeout).
	pub registry: RegistryOptions,
	/// Transport timing (probe, readiness polling, terminate grace).
	pub launch: LaunchOptions,
}

struct SettingRuntime {
	setting: Setting,
	transport: Arc<dyn WorkerTransport>,
	/// Shared by acquires, exclusive while the setting's workers are torn down.
	gate: Arc<tokio::sync::RwLock<()>>,
}

impl SettingRuntime {
	fn new(setting: Setting, transport: Arc<dyn WorkerTransport>) -> Self {
		Self {
			setting,
			transport,
			gate: Arc::new(tokio::sync::RwLock::new(())),
		}
	}
}

/// Orchestrates worker lifecycle for every registered setting.
pub struct LifecycleController {
	settings: RwLock<HashMap<String, SettingRuntime>>,
	registry: ProcessRegistry,
	launch_options: LaunchOptions,
}

impl LifecycleController {
	/// Creates a controller with an empty settings catalog.
	pub fn new(store: Arc<dyn RecoveryStore>, options: ControllerOptions) -> Self {
		info!(store = %store.describe(), "Starting interpreter lifecycle controller");
		Self {
			settings: RwLock::new(HashMap::new()),
			registry: ProcessRegistry::new(store, options.registry),
			launch_options: options.launch,
		}
	}

	/// The underlying registry.
	pub fn registry(&self) -> &ProcessRegistry {
		&self.registry
	}

	/// Registers `setting` with the transport its configuration selects.
	///
	/// Returns false, leaving the catalog untouched, if the id is taken; use
	/// [`Self::reconfigure`] to replace a setting.
	pub fn register(&self, setting: Setting) -> bool {
		let transport = transport::connect(&setting.transport, self.launch_options);
		self.register_with(setting, transport)
	}

	/// Registers `setting` with an explicitly supplied transport.
	pub fn register_with(&self, setting: Setting, transport: Arc<dyn WorkerTransport>) -> bool {
		let mut settings = self.settings.write();
		if settings.contains_key(&setting.id) {
			return false;
		}
		debug!(setting = %setting.id, sharing = %setting.sharing, transport = %transport.kind(), "Registered interpreter setting");
		settings.insert(setting.id.clone(), SettingRuntime::new(setting, transport));
		true
	}

	/// Replaces a setting, tearing down all of its workers first.
	///
	/// Acquires for the setting wait until the new value is installed, so no
	/// worker of the old value survives. An unknown id is simply registered.
	/// The new value is installed even if teardown reports an error; the error
	/// is returned.
	pub async fn reconfigure(&self, setting: Setting) -> Result<()> {
		let transport = transport::connect(&setting.transport, self.launch_options);
		self.reconfigure_with(setting, transport).await
	}

	/// [`Self::reconfigure`] with an explicitly supplied transport.
	pub async fn reconfigure_with(&self, setting: Setting, transport: Arc<dyn WorkerTransport>) -> Result<()> {
		let Some(gate) = self.gate(&setting.id) else {
			info!(setting = %setting.id, sharing = %setting.sharing, "Registered interpreter setting");
			self.settings.write().insert(setting.id.clone(), SettingRuntime::new(setting, transport));
			return Ok(());
		};

		let _exclusive = gate.write().await;
		let teardown = self.registry.remove_all(&setting.id).await;
		info!(setting = %setting.id, sharing = %setting.sharing, "Reconfigured interpreter setting");
		self.settings.write().insert(
			setting.id.clone(),
			SettingRuntime {
				setting,
				transport,
				gate: Arc::clone(&gate),
			},
		);
		teardown
	}

	/// Closes every worker of `setting_id` and forgets the setting.
	///
	/// Acquires racing with this call fail with [`Error::UnknownSetting`]
	/// once it completes.
	pub async fn unregister(&self, setting_id: &str) -> Result<()> {
		let gate = self.gate(setting_id).ok_or_else(|| Error::UnknownSetting(setting_id.to_string()))?;
		let _exclusive = gate.write().await;
		let teardown = self.registry.remove_all(setting_id).await;
		self.settings.write().remove(setting_id);
		info!(setting = setting_id, "Unregistered interpreter setting");
		teardown
	}

	fn gate(&self, setting_id: &str) -> Option<Arc<tokio::sync::RwLock<()>>> {
		self.settings.read().get(setting_id).map(|rt| Arc::clone(&rt.gate))
	}

	/// Registered settings, ordered by id.
	pub fn settings(&self) -> Vec<Setting> {
		let mut settings: Vec<Setting> = self.settings.read().values().map(|rt| rt.setting.clone()).collect();
		settings.sort_by(|a, b| a.id.cmp(&b.id));
		settings
	}

	/// Resolves the isolation key `request` maps to.
	pub fn resolve(&self, request: &InterpreterRequest) -> Result<IsolationKey> {
		self.route(request).map(|(key, _)| key)
	}

	fn route(&self, request: &InterpreterRequest) -> Result<(IsolationKey, Arc<dyn WorkerTransport>)> {
		let settings = self.settings.read();
		let runtime = settings.get(&request.setting_id).ok_or_else(|| Error::UnknownSetting(request.setting_id.clone()))?;
		let key = runtime.setting.resolve(request.user.as_deref(), request.note_id.as_deref())?;
		Ok((key, Arc::clone(&runtime.transport)))
	}

	/// Returns the endpoint of the worker serving `request`, launching it on
	/// first use.
	pub async fn acquire(&self, request: &InterpreterRequest) -> Result<Endpoint> {
		let gate = self.gate(&request.setting_id).ok_or_else(|| Error::UnknownSetting(request.setting_id.clone()))?;
		let _serving = gate.read().await;
		let (key, transport) = self.route(request)?;
		let launch_key = key.clone();
		self.registry.acquire(key, move || InterpreterProcess::launch(launch_key, transport)).await
	}

	/// Closes the worker serving `request`. Closing an idle slot is a no-op.
	pub async fn close(&self, request: &InterpreterRequest) -> Result<()> {
		let key = self.resolve(request)?;
		self.registry.remove(&key).await
	}

	/// Restarts the worker serving `request`: the current worker is torn down
	/// and the next acquire of its key launches a fresh one.
	pub async fn restart(&self, request: &InterpreterRequest) -> Result<()> {
		let key = self.resolve(request)?;
		info!(%key, "Restarting interpreter worker");
		self.registry.remove(&key).await
	}

	/// Closes every worker of `setting_id`, whatever the sharing policy.
	///
	/// Also sweeps leftover records of the setting, so it works for ids that
	/// are no longer registered.
	pub async fn close_setting(&self, setting_id: &str) -> Result<()> {
		self.registry.remove_all(setting_id).await
	}

	/// Tears down the worker serving `request` after a caller saw it die.
	pub async fn report_crash(&self, request: &InterpreterRequest) -> Result<()> {
		let key = self.resolve(request)?;
		warn!(%key, "Interpreter worker reported dead");
		self.registry.remove(&key).await
	}

	/// Reattaches to the workers listed in the recovery store.
	///
	/// Records of unregistered settings, or of a setting whose transport
	/// changed kind since the record was written, are discarded after their
	/// worker, if still running, is stopped.
	pub async fn restore(&self) -> Result<RestoreReport> {
		let records = self.registry.store().list().await?;
		info!(records = records.len(), "Restoring interpreter workers");

		let transports: HashMap<String, Arc<dyn WorkerTransport>> = self
			.settings
			.read()
			.iter()
			.map(|(id, rt)| (id.clone(), Arc::clone(&rt.transport)))
			.collect();

		let report = self
			.registry
			.restore_from(records, |record| match transports.get(&record.setting_id) {
				Some(transport) if transport.kind() == record.transport => RestoreAction::Reattach(Arc::clone(transport)),
				Some(transport) => {
					warn!(key = %record.key, recorded = %record.transport, current = %transport.kind(), "Transport changed since record was written");
					RestoreAction::Retire(self.reaper(record.transport, &transports))
				}
				None => {
					warn!(key = %record.key, setting = %record.setting_id, "Recovery record names an unknown setting");
					RestoreAction::Retire(self.reaper(record.transport, &transports))
				}
			})
			.await;

		info!(
			restored = report.restored.len(),
			dropped = report.dropped.len(),
			retired = report.retired.len(),
			skipped = report.skipped,
			"Restore finished"
		);
		Ok(report)
	}

	/// Transport able to stop a recorded worker of `kind`. Any registered
	/// transport of that kind works, since stopping only needs the record.
	fn reaper(&self, kind: TransportKind, transports: &HashMap<String, Arc<dyn WorkerTransport>>) -> Arc<dyn WorkerTransport> {
		match transports.values().find(|t| t.kind() == kind) {
			Some(transport) => Arc::clone(transport),
			None => transport::reaper(kind, self.launch_options),
		}
	}

	/// One reconciliation pass; see [`ProcessRegistry::reconcile`].
	pub async fn reconcile(&self) -> ReconcileReport {
		let report = self.registry.reconcile().await;
		if !report.is_clean() {
			info!(
				crashed = report.crashed.len(),
				cleared = report.cleared.len(),
				repersisted = report.repersisted.len(),
				stale = report.stale_removed.len(),
				errors = report.errors.len(),
				"Reconciled registry with recovery store"
			);
		}
		for e in &report.errors {
			warn!(error = %e, "Reconciliation step failed");
		}
		report
	}

	/// Runs [`Self::reconcile`] every `period` until `cancel` fires.
	pub fn spawn_reconciler(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
		let controller = Arc::clone(self);
		tokio::spawn(async move {
			let mut tick = interval(period);
			tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
			// The first tick completes immediately.
			tick.tick().await;
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tick.tick() => {
						controller.reconcile().await;
					}
				}
			}
			debug!("Reconciler stopped");
		})
	}

	/// Stops serving; see [`ShutdownMode`].
	pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
		info!(?mode, "Shutting down interpreter lifecycle controller");
		self.registry.shutdown(mode).await
	}

	/// Number of running workers.
	pub fn count(&self) -> usize {
		self.registry.count()
	}

	/// Current workers, ordered by key.
	pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
		self.registry.snapshot()
	}

	/// Every persisted recovery record.
	pub async fn records(&self) -> Result<Vec<RecoveryRecord>> {
		self.registry.store().list().await
	}
}
