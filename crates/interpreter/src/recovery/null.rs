use async_trait::async_trait;

use super::{RecoveryRecord, RecoveryStore};
use crate::key::IsolationKey;
use crate::Result;

/// Store used when recovery is disabled: nothing is persisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecoveryStore;

#[async_trait]
impl RecoveryStore for NullRecoveryStore {
	fn describe(&self) -> String {
		"none".into()
	}

	async fn put(&self, _record: &RecoveryRecord) -> Result<()> {
		Ok(())
	}

	async fn remove(&self, _key: &IsolationKey) -> Result<()> {
		Ok(())
	}

	async fn list(&self) -> Result<Vec<RecoveryRecord>> {
		Ok(Vec::new())
	}
}
