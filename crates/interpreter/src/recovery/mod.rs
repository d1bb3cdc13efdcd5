//! Durable record of live workers.
//!
//! The store is written on every launch and teardown and read once at
//! controller startup, so a fresh controller can reattach to workers that
//! outlived its predecessor instead of launching duplicates.

mod fs;
mod null;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fs::FileSystemRecoveryStore;
pub use null::NullRecoveryStore;

use crate::key::IsolationKey;
use crate::process::Endpoint;
use crate::transport::TransportKind;
use crate::Result;

/// Durable projection of one running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
	/// Setting the worker belongs to.
	pub setting_id: String,
	/// Slot the worker serves.
	pub key: IsolationKey,
	/// Transport variant that launched it.
	pub transport: TransportKind,
	/// OS process id, when signalable from this host.
	#[serde(default)]
	pub pid: Option<u32>,
	/// Connection endpoint.
	pub endpoint: Endpoint,
	/// Launch time.
	pub recorded_at: DateTime<Utc>,
}

/// Persistence of [`RecoveryRecord`]s, keyed by isolation key.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
	/// Short description for logs (backend and location).
	fn describe(&self) -> String;

	/// Durably writes `record`, replacing any record with the same key.
	///
	/// Returns only after the write is durable.
	async fn put(&self, record: &RecoveryRecord) -> Result<()>;

	/// Durably deletes the record for `key`. Removing an absent key is a no-op.
	async fn remove(&self, key: &IsolationKey) -> Result<()>;

	/// Returns every persisted record, ordered by key.
	async fn list(&self) -> Result<Vec<RecoveryRecord>>;
}

/// Which recovery backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryBackend {
	/// Recovery disabled.
	None,
	/// One record file per worker in `dir`.
	FileSystem {
		/// Directory holding the record files.
		dir: PathBuf,
	},
}

/// Opens the store selected by `backend`.
pub fn open(backend: &RecoveryBackend) -> Result<Arc<dyn RecoveryStore>> {
	Ok(match backend {
		RecoveryBackend::None => Arc::new(NullRecoveryStore),
		RecoveryBackend::FileSystem { dir } => Arc::new(FileSystemRecoveryStore::open(dir)?),
	})
}
