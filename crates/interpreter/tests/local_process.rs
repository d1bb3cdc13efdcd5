#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::TcpStream;
use warden_interpreter::recovery::FileSystemRecoveryStore;
use warden_interpreter::transport::LocalProcessConfig;
use warden_interpreter::{
	ControllerOptions, Endpoint, InterpreterRequest, LaunchOptions, LifecycleController, RecoveryStore, Setting, SharingPolicy, ShutdownMode,
	TransportConfig, TransportKind,
};

const WORKER_ENTRY: &str = "worker_process";

/// Body of the worker process: the transport re-runs this test binary with
/// only this test selected and the assigned port in the environment.
#[test]
#[ignore = "runs as a spawned worker"]
fn worker_process() {
	let Some(port) = std::env::var("WARDEN_WORKER_PORT").ok().and_then(|p| p.parse::<u16>().ok()) else {
		return;
	};
	let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
	for stream in listener.incoming() {
		drop(stream);
	}
}

fn worker_setting() -> Setting {
	let exe = std::env::current_exe().unwrap();
	Setting::new(
		"py",
		SharingPolicy::Isolated,
		TransportConfig::LocalProcess(LocalProcessConfig {
			command: exe.to_string_lossy().into_owned(),
			args: [WORKER_ENTRY, "--exact", "--ignored", "--nocapture", "--test-threads=1"].map(String::from).to_vec(),
			env: BTreeMap::new(),
			working_dir: None,
		}),
	)
}

fn controller(dir: &std::path::Path) -> LifecycleController {
	let store: Arc<dyn RecoveryStore> = Arc::new(FileSystemRecoveryStore::open(dir).unwrap());
	let options = ControllerOptions {
		launch: LaunchOptions {
			terminate_grace: Duration::from_millis(300),
			..LaunchOptions::default()
		},
		..ControllerOptions::default()
	};
	let controller = LifecycleController::new(store, options);
	assert!(controller.register(worker_setting()));
	controller
}

async fn accepts(endpoint: &Endpoint) -> bool {
	TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await.is_ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_worker_is_reattached_by_a_fresh_controller() {
	let dir = tempfile::tempdir().unwrap();
	let request = InterpreterRequest::new("py").user("alice").note("n1");

	let first = controller(dir.path());
	let endpoint = first.acquire(&request).await.unwrap();
	assert!(accepts(&endpoint).await);

	let records = first.records().await.unwrap();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].transport, TransportKind::LocalProcess);
	assert_eq!(records[0].endpoint, endpoint);
	assert!(records[0].pid.is_some());

	first.shutdown(ShutdownMode::Detach).await.unwrap();
	drop(first);
	assert!(accepts(&endpoint).await);

	let second = controller(dir.path());
	let report = second.restore().await.unwrap();
	assert_eq!(report.restored.len(), 1);
	assert_eq!(second.acquire(&request).await.unwrap(), endpoint);

	second.close(&request).await.unwrap();
	assert!(second.records().await.unwrap().is_empty());
	assert!(!accepts(&endpoint).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_shutdown_stops_local_workers() {
	let dir = tempfile::tempdir().unwrap();
	let ctl = controller(dir.path());

	let a = ctl.acquire(&InterpreterRequest::new("py").user("alice").note("n1")).await.unwrap();
	let b = ctl.acquire(&InterpreterRequest::new("py").user("bob").note("n2")).await.unwrap();
	assert_ne!(a.port, b.port);

	ctl.shutdown(ShutdownMode::Terminate).await.unwrap();
	assert!(ctl.records().await.unwrap().is_empty());
	assert!(!accepts(&a).await);
	assert!(!accepts(&b).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restore_stops_worker_of_removed_setting() {
	let dir = tempfile::tempdir().unwrap();

	let first = controller(dir.path());
	let endpoint = first.acquire(&InterpreterRequest::new("py").user("alice").note("n1")).await.unwrap();
	first.shutdown(ShutdownMode::Detach).await.unwrap();
	drop(first);
	assert!(accepts(&endpoint).await);

	let store: Arc<dyn RecoveryStore> = Arc::new(FileSystemRecoveryStore::open(dir.path()).unwrap());
	let bare = LifecycleController::new(store, ControllerOptions::default());
	let report = bare.restore().await.unwrap();

	assert_eq!(report.retired.len(), 1);
	assert!(bare.records().await.unwrap().is_empty());
	assert!(!accepts(&endpoint).await);
}
