//! Configuration for the warden interpreter controller.
//!
//! Configuration is a TOML file; every section is optional:
//!
//! ```toml
//! home = "/var/lib/warden"
//! shutdown = "detach"          # or "terminate"
//!
//! [recovery]
//! backend = "filesystem"       # or "none"
//! dir = "recovery"             # relative to `home`
//!
//! [launch]
//! timeout_ms = 30000
//! probe_timeout_ms = 1000
//! terminate_grace_ms = 2000
//! poll_interval_ms = 50
//!
//! [reconcile]
//! interval_secs = 30           # 0 disables periodic reconciliation
//!
//! [[settings]]
//! id = "python"
//! sharing = { mode = "scoped", axis = "user" }
//! transport = { kind = "local-process", command = "python3", args = ["-m", "worker", "--port", "{port}"] }
//!
//! [[settings]]
//! id = "spark"
//! sharing = { mode = "shared" }
//! transport = { kind = "existing", host = "10.0.0.5", port = 9000 }
//! ```
//!
//! After the file, `WARDEN_*` environment variables override individual
//! values; see [`WardenConfig::apply_overrides`].

pub mod error;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use warden_interpreter::{ControllerOptions, LaunchOptions, RecoveryBackend, RegistryOptions, Setting, ShutdownMode};

pub use error::{ConfigError, Result};

/// File name looked up in the platform config directory.
pub const CONFIG_FILE_NAME: &str = "warden.toml";

/// Environment variable overriding [`WardenConfig::home`].
pub const ENV_HOME: &str = "WARDEN_HOME";
/// Environment variable overriding [`RecoveryConfig::backend`].
pub const ENV_RECOVERY_BACKEND: &str = "WARDEN_RECOVERY_BACKEND";
/// Environment variable overriding [`RecoveryConfig::dir`].
pub const ENV_RECOVERY_DIR: &str = "WARDEN_RECOVERY_DIR";
/// Environment variable overriding [`LaunchConfig::timeout_ms`].
pub const ENV_LAUNCH_TIMEOUT_MS: &str = "WARDEN_LAUNCH_TIMEOUT_MS";

/// Parsed controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WardenConfig {
	/// Base directory for relative paths. Defaults to the config file's
	/// directory, else the platform data directory.
	pub home: Option<PathBuf>,
	/// Recovery store selection.
	pub recovery: RecoveryConfig,
	/// Launch and teardown timing.
	pub launch: LaunchConfig,
	/// Periodic reconciliation.
	pub reconcile: ReconcileConfig,
	/// What a long-running controller does with its workers on exit.
	pub shutdown: ShutdownPolicy,
	/// Interpreter settings.
	pub settings: Vec<Setting>,
}

/// `[recovery]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
	/// Store backend.
	pub backend: BackendKind,
	/// Record directory of the filesystem backend.
	pub dir: PathBuf,
}

impl Default for RecoveryConfig {
	fn default() -> Self {
		Self {
			backend: BackendKind::FileSystem,
			dir: PathBuf::from("recovery"),
		}
	}
}

/// Recovery store backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BackendKind {
	/// One record file per worker.
	#[serde(rename = "filesystem")]
	FileSystem,
	/// Recovery disabled.
	#[serde(rename = "none")]
	None,
}

impl BackendKind {
	fn from_name(name: &str) -> Option<Self> {
		match name {
			"filesystem" => Some(Self::FileSystem),
			"none" => Some(Self::None),
			_ => None,
		}
	}
}

/// `[launch]` section, all values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
	/// Launch deadline; expiry fails the acquire.
	pub timeout_ms: u64,
	/// Upper bound for one reachability probe.
	pub probe_timeout_ms: u64,
	/// SIGTERM to SIGKILL grace period.
	pub terminate_grace_ms: u64,
	/// Readiness polling interval.
	pub poll_interval_ms: u64,
}

impl Default for LaunchConfig {
	fn default() -> Self {
		Self {
			timeout_ms: 30_000,
			probe_timeout_ms: 1_000,
			terminate_grace_ms: 2_000,
			poll_interval_ms: 50,
		}
	}
}

/// `[reconcile]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
	/// Seconds between passes; 0 disables the periodic task.
	pub interval_secs: u64,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		Self { interval_secs: 30 }
	}
}

/// Worker handling on controller exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
	/// Leave workers running and recoverable.
	#[default]
	Detach,
	/// Stop every worker.
	Terminate,
}

impl WardenConfig {
	/// Parses a TOML string and validates the settings list.
	pub fn parse(input: &str) -> Result<Self> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Loads configuration from a file.
	///
	/// Without an explicit `home`, the file's directory becomes home.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
			path: path.to_path_buf(),
			error: e,
		})?;
		let mut config = Self::parse(&content)?;
		if config.home.is_none() {
			config.home = path.parent().filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf);
		}
		Ok(config)
	}

	/// Default config file location: `<config dir>/warden/warden.toml`.
	pub fn default_path() -> Option<PathBuf> {
		dirs::config_dir().map(|dir| dir.join("warden").join(CONFIG_FILE_NAME))
	}

	fn validate(&self) -> Result<()> {
		let mut seen = HashSet::new();
		for setting in &self.settings {
			if setting.id.trim().is_empty() {
				return Err(ConfigError::EmptySettingId);
			}
			if !seen.insert(setting.id.as_str()) {
				return Err(ConfigError::DuplicateSetting(setting.id.clone()));
			}
		}
		Ok(())
	}

	/// Applies `WARDEN_*` overrides read through `lookup`.
	pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
		if let Some(home) = lookup(ENV_HOME) {
			self.home = Some(PathBuf::from(home));
		}
		if let Some(value) = lookup(ENV_RECOVERY_BACKEND) {
			self.recovery.backend = BackendKind::from_name(&value).ok_or_else(|| ConfigError::InvalidOverride {
				var: ENV_RECOVERY_BACKEND,
				value: value.clone(),
				reason: "expected 'filesystem' or 'none'".into(),
			})?;
		}
		if let Some(dir) = lookup(ENV_RECOVERY_DIR) {
			self.recovery.dir = PathBuf::from(dir);
		}
		if let Some(value) = lookup(ENV_LAUNCH_TIMEOUT_MS) {
			self.launch.timeout_ms = value.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidOverride {
				var: ENV_LAUNCH_TIMEOUT_MS,
				value: value.clone(),
				reason: e.to_string(),
			})?;
		}
		Ok(())
	}

	/// Applies overrides from the process environment.
	pub fn apply_env(&mut self) -> Result<()> {
		self.apply_overrides(|var| std::env::var(var).ok())
	}

	/// Effective home directory.
	pub fn home(&self) -> PathBuf {
		match &self.home {
			Some(home) => home.clone(),
			None => dirs::data_dir().map(|d| d.join("warden")).unwrap_or_else(|| PathBuf::from(".")),
		}
	}

	/// Recovery directory; relative paths resolve against [`Self::home`].
	pub fn recovery_dir(&self) -> PathBuf {
		if self.recovery.dir.is_absolute() {
			self.recovery.dir.clone()
		} else {
			self.home().join(&self.recovery.dir)
		}
	}

	/// Recovery backend selection for the interpreter crate.
	pub fn recovery_backend(&self) -> RecoveryBackend {
		match self.recovery.backend {
			BackendKind::FileSystem => RecoveryBackend::FileSystem { dir: self.recovery_dir() },
			BackendKind::None => RecoveryBackend::None,
		}
	}

	/// Controller tunables.
	pub fn controller_options(&self) -> ControllerOptions {
		ControllerOptions {
			registry: RegistryOptions {
				launch_timeout: Duration::from_millis(self.launch.timeout_ms),
			},
			launch: LaunchOptions {
				probe_timeout: Duration::from_millis(self.launch.probe_timeout_ms),
				poll_interval: Duration::from_millis(self.launch.poll_interval_ms),
				terminate_grace: Duration::from_millis(self.launch.terminate_grace_ms),
			},
		}
	}

	/// Reconciliation period, or `None` when disabled.
	pub fn reconcile_interval(&self) -> Option<Duration> {
		(self.reconcile.interval_secs > 0).then(|| Duration::from_secs(self.reconcile.interval_secs))
	}

	/// Shutdown mode for long-running controllers.
	pub fn shutdown_mode(&self) -> ShutdownMode {
		match self.shutdown {
			ShutdownPolicy::Detach => ShutdownMode::Detach,
			ShutdownPolicy::Terminate => ShutdownMode::Terminate,
		}
	}
}

#[cfg(test)]
mod tests;
