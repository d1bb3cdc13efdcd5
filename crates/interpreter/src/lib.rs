//! Interpreter worker lifecycle with crash/restart recovery.
//!
//! A notebook controller asks for a worker by `(setting, user, note)`. The
//! setting's [`SharingPolicy`] decides which [`IsolationKey`] the request maps
//! to; the [`ProcessRegistry`] serves the running worker for that key or
//! launches one through the setting's [`WorkerTransport`]. Every running
//! worker has a [`RecoveryRecord`] in a [`RecoveryStore`], written before its
//! endpoint is handed out, so a restarted controller can reattach instead of
//! leaking or duplicating workers.
//!
//! [`LifecycleController`] ties these together and is the entry point for
//! embedders.

pub mod error;
pub mod key;
pub mod lifecycle;
pub mod process;
pub mod recovery;
pub mod registry;
pub mod setting;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use error::{Error, PersistOp, Result};
pub use key::{IsolationKey, ScopeAxis, SharingPolicy};
pub use lifecycle::{ControllerOptions, LifecycleController};
pub use process::{Endpoint, InterpreterProcess, ProcessState, WorkerId};
pub use recovery::{RecoveryBackend, RecoveryRecord, RecoveryStore};
pub use registry::{ProcessRegistry, ReconcileReport, RegistryOptions, RestoreAction, RestoreReport, ShutdownMode, WorkerSnapshot};
pub use setting::{InterpreterRequest, Setting};
pub use transport::{LaunchOptions, TransportConfig, TransportKind, WorkerTransport};
