use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use warden_interpreter::transport::{ExistingConfig, LocalProcessConfig};
use warden_interpreter::{ScopeAxis, SharingPolicy, TransportConfig};

use super::*;

const FULL: &str = r#"
home = "/srv/warden"
shutdown = "terminate"

[recovery]
backend = "filesystem"
dir = "state/recovery"

[launch]
timeout_ms = 5000
probe_timeout_ms = 250

[reconcile]
interval_secs = 0

[[settings]]
id = "python"
sharing = { mode = "scoped", axis = "note" }
transport = { kind = "local-process", command = "python3", args = ["-m", "worker", "{port}"], env = { PYTHONUNBUFFERED = "1" } }

[[settings]]
id = "spark"
transport = { kind = "existing", host = "10.0.0.5", port = 9000 }
"#;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
	let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
	move |name| vars.get(name).cloned()
}

#[test]
fn test_empty_config_uses_defaults() {
	let config = WardenConfig::parse("").unwrap();
	assert_eq!(config, WardenConfig::default());
	assert_eq!(config.recovery.backend, BackendKind::FileSystem);
	assert_eq!(config.recovery.dir, PathBuf::from("recovery"));
	assert_eq!(config.reconcile_interval(), Some(Duration::from_secs(30)));
	assert_eq!(config.shutdown_mode(), ShutdownMode::Detach);
	assert_eq!(config.controller_options(), ControllerOptions::default());
}

#[test]
fn test_parse_full_config() {
	let config = WardenConfig::parse(FULL).unwrap();

	assert_eq!(config.home, Some(PathBuf::from("/srv/warden")));
	assert_eq!(config.recovery_dir(), PathBuf::from("/srv/warden/state/recovery"));
	assert_eq!(config.shutdown_mode(), ShutdownMode::Terminate);
	assert_eq!(config.reconcile_interval(), None);

	let options = config.controller_options();
	assert_eq!(options.registry.launch_timeout, Duration::from_secs(5));
	assert_eq!(options.launch.probe_timeout, Duration::from_millis(250));
	assert_eq!(options.launch.terminate_grace, Duration::from_secs(2));

	assert_eq!(config.settings.len(), 2);
	let python = &config.settings[0];
	assert_eq!(python.sharing, SharingPolicy::Scoped(ScopeAxis::Note));
	assert_eq!(
		python.transport,
		TransportConfig::LocalProcess(LocalProcessConfig {
			command: "python3".into(),
			args: vec!["-m".into(), "worker".into(), "{port}".into()],
			env: [("PYTHONUNBUFFERED".to_string(), "1".to_string())].into(),
			working_dir: None,
		})
	);
	let spark = &config.settings[1];
	assert_eq!(spark.sharing, SharingPolicy::Shared);
	assert_eq!(
		spark.transport,
		TransportConfig::Existing(ExistingConfig {
			host: "10.0.0.5".into(),
			port: 9000,
		})
	);
}

#[test]
fn test_absolute_recovery_dir_ignores_home() {
	let config = WardenConfig::parse("home = \"/srv/warden\"\n[recovery]\ndir = \"/var/lib/warden\"\n").unwrap();
	assert_eq!(config.recovery_dir(), PathBuf::from("/var/lib/warden"));
	assert_eq!(config.recovery_backend(), RecoveryBackend::FileSystem { dir: PathBuf::from("/var/lib/warden") });
}

#[test]
fn test_disabled_recovery() {
	let config = WardenConfig::parse("[recovery]\nbackend = \"none\"\n").unwrap();
	assert_eq!(config.recovery_backend(), RecoveryBackend::None);
}

#[test]
fn test_duplicate_setting_ids_rejected() {
	let input = r#"
[[settings]]
id = "py"
transport = { kind = "existing", host = "a", port = 1 }

[[settings]]
id = "py"
transport = { kind = "existing", host = "b", port = 2 }
"#;
	assert!(matches!(WardenConfig::parse(input), Err(ConfigError::DuplicateSetting(id)) if id == "py"));
}

#[test]
fn test_unknown_fields_and_modes_rejected() {
	assert!(matches!(WardenConfig::parse("colour = \"blue\"\n"), Err(ConfigError::Toml(_))));
	let bad_mode = "[[settings]]\nid = \"py\"\nsharing = { mode = \"per-galaxy\" }\ntransport = { kind = \"existing\", host = \"a\", port = 1 }\n";
	assert!(matches!(WardenConfig::parse(bad_mode), Err(ConfigError::Toml(_))));
}

#[test]
fn test_load_defaults_home_to_config_dir() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join(CONFIG_FILE_NAME);
	std::fs::write(&path, "[launch]\ntimeout_ms = 100\n").unwrap();

	let config = WardenConfig::load(&path).unwrap();
	assert_eq!(config.home(), dir.path());
	assert_eq!(config.recovery_dir(), dir.path().join("recovery"));
	assert_eq!(config.launch.timeout_ms, 100);
}

#[test]
fn test_load_missing_file_reports_path() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("absent.toml");
	match WardenConfig::load(&path) {
		Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
		other => panic!("expected I/O error, got {other:?}"),
	}
}

#[test]
fn test_overrides_replace_file_values() {
	let mut config = WardenConfig::parse(FULL).unwrap();
	config
		.apply_overrides(lookup(&[
			(ENV_HOME, "/tmp/w"),
			(ENV_RECOVERY_BACKEND, "none"),
			(ENV_RECOVERY_DIR, "r"),
			(ENV_LAUNCH_TIMEOUT_MS, "750"),
		]))
		.unwrap();

	assert_eq!(config.home(), PathBuf::from("/tmp/w"));
	assert_eq!(config.recovery_dir(), PathBuf::from("/tmp/w/r"));
	assert_eq!(config.recovery_backend(), RecoveryBackend::None);
	assert_eq!(config.controller_options().registry.launch_timeout, Duration::from_millis(750));
}

#[test]
fn test_invalid_overrides_rejected() {
	let mut config = WardenConfig::default();
	let err = config.apply_overrides(lookup(&[(ENV_LAUNCH_TIMEOUT_MS, "soon")])).unwrap_err();
	assert!(matches!(err, ConfigError::InvalidOverride { var: ENV_LAUNCH_TIMEOUT_MS, .. }));

	let err = config.apply_overrides(lookup(&[(ENV_RECOVERY_BACKEND, "s3")])).unwrap_err();
	assert!(matches!(err, ConfigError::InvalidOverride { var: ENV_RECOVERY_BACKEND, .. }));
}
