//! Filesystem recovery store: one JSON file per live worker.
//!
//! File presence is authoritative. Writes go through a unique temp file that
//! is synced and renamed over the target, then the directory is synced, so a
//! record either exists completely or not at all.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{RecoveryRecord, RecoveryStore};
use crate::error::PersistOp;
use crate::key::IsolationKey;
use crate::{Error, Result};

const EXTENSION: &str = "recovery";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Recovery store backed by a directory of record files.
#[derive(Debug, Clone)]
pub struct FileSystemRecoveryStore {
	dir: PathBuf,
}

impl FileSystemRecoveryStore {
	/// Opens the store, creating `dir` if needed.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
		let dir = dir.into();
		fs::create_dir_all(&dir).map_err(|e| Error::persist(PersistOp::Open, dir.display(), e))?;
		Ok(Self { dir })
	}

	/// Directory holding the record files.
	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Path of the record file for `key`.
	pub fn path_for(&self, key: &IsolationKey) -> PathBuf {
		self.dir.join(format!("{}.{EXTENSION}", key.file_stem()))
	}
}

#[async_trait]
impl RecoveryStore for FileSystemRecoveryStore {
	fn describe(&self) -> String {
		format!("filesystem:{}", self.dir.display())
	}

	async fn put(&self, record: &RecoveryRecord) -> Result<()> {
		let bytes = serde_json::to_vec_pretty(record).map_err(|e| Error::persist(PersistOp::Put, &record.key, e))?;
		let dir = self.dir.clone();
		let path = self.path_for(&record.key);
		blocking(PersistOp::Put, &record.key, move || write_atomic(&dir, &path, &bytes)).await?;
		debug!(key = %record.key, endpoint = %record.endpoint, "Persisted recovery record");
		Ok(())
	}

	async fn remove(&self, key: &IsolationKey) -> Result<()> {
		let dir = self.dir.clone();
		let path = self.path_for(key);
		blocking(PersistOp::Remove, key, move || match fs::remove_file(&path) {
			Ok(()) => sync_dir(&dir),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		})
		.await?;
		debug!(%key, "Removed recovery record");
		Ok(())
	}

	async fn list(&self) -> Result<Vec<RecoveryRecord>> {
		let dir = self.dir.clone();
		let mut records = blocking(PersistOp::List, self.dir.display(), move || read_records(&dir)).await?;
		records.sort_by(|a, b| a.key.cmp(&b.key));
		Ok(records)
	}
}

async fn blocking<T, F>(op: PersistOp, key: impl std::fmt::Display, f: F) -> Result<T>
where
	F: FnOnce() -> io::Result<T> + Send + 'static,
	T: Send + 'static,
{
	match tokio::task::spawn_blocking(f).await {
		Ok(Ok(value)) => Ok(value),
		Ok(Err(e)) => Err(Error::persist(op, key, e)),
		Err(e) => Err(Error::persist(op, key, format!("blocking task failed: {e}"))),
	}
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
	fs::create_dir_all(dir)?;
	let tmp_path = unique_tmp_path(path);

	let result = (|| -> io::Result<()> {
		let mut file = fs::OpenOptions::new().write(true).create_new(true).open(&tmp_path)?;
		file.write_all(bytes)?;
		file.sync_all()?;
		drop(file);
		fs::rename(&tmp_path, path)?;
		sync_dir(dir)
	})();

	if result.is_err() {
		let _ = fs::remove_file(&tmp_path);
	}
	result
}

fn unique_tmp_path(dest: &Path) -> PathBuf {
	let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
	let file_name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("record");
	dest.with_file_name(format!(".{file_name}.tmp.{}.{counter}", std::process::id()))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
	fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
	Ok(())
}

fn read_records(dir: &Path) -> io::Result<Vec<RecoveryRecord>> {
	let entries = match fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(e),
	};

	let mut records = Vec::new();
	for entry in entries {
		let path = entry?.path();
		let is_record = path.extension().is_some_and(|ext| ext == EXTENSION)
			&& !path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.'));
		if !is_record {
			continue;
		}

		let bytes = match fs::read(&path) {
			Ok(bytes) => bytes,
			// Removed concurrently.
			Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
			Err(e) => return Err(e),
		};
		match serde_json::from_slice::<RecoveryRecord>(&bytes) {
			Ok(record) => records.push(record),
			Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable recovery record"),
		}
	}
	Ok(records)
}
