//! Interpreter settings and the requests routed through them.

use serde::{Deserialize, Serialize};

use crate::key::{self, IsolationKey, SharingPolicy};
use crate::transport::TransportConfig;
use crate::Result;

/// Named worker configuration: a sharing policy plus launch parameters.
///
/// The policy is fixed for the lifetime of a `Setting` value; changing it goes
/// through [`crate::LifecycleController::reconfigure`], which tears down the
/// setting's workers first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
	/// Setting identifier.
	pub id: String,
	/// How workers are shared between users and notebooks.
	#[serde(default)]
	pub sharing: SharingPolicy,
	/// How workers for this setting are launched and reached.
	pub transport: TransportConfig,
}

impl Setting {
	/// Creates a setting.
	pub fn new(id: impl Into<String>, sharing: SharingPolicy, transport: TransportConfig) -> Self {
		Self {
			id: id.into(),
			sharing,
			transport,
		}
	}

	/// Resolves the isolation key of a request under this setting's policy.
	pub fn resolve(&self, user: Option<&str>, note_id: Option<&str>) -> Result<IsolationKey> {
		key::resolve(&self.id, self.sharing, user, note_id)
	}
}

/// A request for a worker, as handed over by the notebook layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpreterRequest {
	/// Setting the request targets.
	pub setting_id: String,
	/// Requesting user.
	pub user: Option<String>,
	/// Notebook the request originates from.
	pub note_id: Option<String>,
}

impl InterpreterRequest {
	/// Creates a request with no user or note.
	pub fn new(setting_id: impl Into<String>) -> Self {
		Self {
			setting_id: setting_id.into(),
			..Self::default()
		}
	}

	/// Sets the requesting user.
	pub fn user(mut self, user: impl Into<String>) -> Self {
		self.user = Some(user.into());
		self
	}

	/// Sets the originating notebook.
	pub fn note(mut self, note_id: impl Into<String>) -> Self {
		self.note_id = Some(note_id.into());
		self
	}
}
