//! Error taxonomy for worker lifecycle operations.
//!
//! Every error is scoped to a single isolation key; none of them is fatal to the
//! controller itself.

use std::fmt;

/// Recovery store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
	/// Opening the store.
	Open,
	/// Writing a record.
	Put,
	/// Deleting a record.
	Remove,
	/// Enumerating records.
	List,
}

impl fmt::Display for PersistOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Open => "open",
			Self::Put => "put",
			Self::Remove => "remove",
			Self::List => "list",
		})
	}
}

/// Errors produced by the resolver, registry, recovery store and controller.
///
/// The type is `Clone` because one settled launch is reported to every caller
/// that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// The request is missing an axis value the sharing policy requires, or
	/// names an empty setting.
	#[error("invalid scope for setting '{setting}': {reason}")]
	InvalidScope {
		/// Setting the request targeted.
		setting: String,
		/// What was wrong with the request.
		reason: String,
	},
	/// The request names a setting the controller does not know.
	#[error("unknown interpreter setting '{0}'")]
	UnknownSetting(String),
	/// The worker failed to start or to become reachable in time.
	#[error("failed to launch worker for {key}: {reason}")]
	Launch {
		/// Display form of the isolation key.
		key: String,
		/// The failure reason.
		reason: String,
	},
	/// A durable write or delete against the recovery store failed.
	#[error("recovery store {op} failed for {key}: {reason}")]
	RecoveryPersist {
		/// The failed operation.
		op: PersistOp,
		/// Display form of the isolation key (or the store location for `list`).
		key: String,
		/// The failure reason.
		reason: String,
	},
	/// The registry has been shut down and no longer serves requests.
	#[error("interpreter registry is shut down")]
	ShutDown,
}

impl Error {
	/// Whether retrying the same request may succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Launch { .. } | Self::RecoveryPersist { .. })
	}

	pub(crate) fn launch(key: impl fmt::Display, reason: impl fmt::Display) -> Self {
		Self::Launch {
			key: key.to_string(),
			reason: reason.to_string(),
		}
	}

	pub(crate) fn persist(op: PersistOp, key: impl fmt::Display, reason: impl fmt::Display) -> Self {
		Self::RecoveryPersist {
			op,
			key: key.to_string(),
			reason: reason.to_string(),
		}
	}
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
