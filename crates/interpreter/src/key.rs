//! Isolation key resolution.
//!
//! Maps a `(setting, policy, user, note)` request onto the key of the worker
//! slot that serves it. Resolution is pure: the same inputs always produce the
//! same key, and axes the policy ignores never influence the result.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Axis along which a scoped policy dedicates workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeAxis {
	/// One worker per user, shared across that user's notebooks.
	User,
	/// One worker per notebook, shared across users of that notebook.
	Note,
}

/// How workers of one setting are shared between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "axis", rename_all = "snake_case")]
pub enum SharingPolicy {
	/// One worker for every user and notebook.
	#[default]
	Shared,
	/// One worker per distinct value of the given axis.
	Scoped(ScopeAxis),
	/// One worker per distinct `(user, note)` pair.
	Isolated,
}

impl SharingPolicy {
	/// Returns `(per_user, per_note)` isolation for this policy.
	fn axes(self) -> (bool, bool) {
		match self {
			Self::Shared => (false, false),
			Self::Scoped(ScopeAxis::User) => (true, false),
			Self::Scoped(ScopeAxis::Note) => (false, true),
			Self::Isolated => (true, true),
		}
	}
}

impl fmt::Display for SharingPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Shared => f.write_str("shared"),
			Self::Scoped(ScopeAxis::User) => f.write_str("scoped(user)"),
			Self::Scoped(ScopeAxis::Note) => f.write_str("scoped(note)"),
			Self::Isolated => f.write_str("isolated"),
		}
	}
}

/// Identifies the worker slot that serves a request.
///
/// Only the axes demanded by the setting's policy are populated, so two
/// requests that differ in an ignored axis compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IsolationKey {
	setting_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	user: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	note_id: Option<String>,
}

impl IsolationKey {
	/// Setting this key belongs to.
	pub fn setting_id(&self) -> &str {
		&self.setting_id
	}

	/// User component, present for per-user isolation.
	pub fn user(&self) -> Option<&str> {
		self.user.as_deref()
	}

	/// Note component, present for per-note isolation.
	pub fn note_id(&self) -> Option<&str> {
		self.note_id.as_deref()
	}

	/// Whether this key is owned by `setting_id`.
	pub fn belongs_to(&self, setting_id: &str) -> bool {
		self.setting_id == setting_id
	}

	/// Filesystem-safe, injective encoding of the key.
	///
	/// Components are escaped so they never contain `.`, which then separates
	/// them unambiguously.
	pub fn file_stem(&self) -> String {
		let mut stem = escape_component(&self.setting_id);
		if let Some(user) = &self.user {
			stem.push_str(".u-");
			stem.push_str(&escape_component(user));
		}
		if let Some(note) = &self.note_id {
			stem.push_str(".n-");
			stem.push_str(&escape_component(note));
		}
		stem
	}
}

impl fmt::Display for IsolationKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.setting_id)?;
		match (&self.user, &self.note_id) {
			(None, None) => Ok(()),
			(Some(user), None) => write!(f, "[user={user}]"),
			(None, Some(note)) => write!(f, "[note={note}]"),
			(Some(user), Some(note)) => write!(f, "[user={user},note={note}]"),
		}
	}
}

/// Resolves the isolation key for a request.
///
/// `user` and `note_id` are only consulted along the axes `policy` isolates;
/// a missing or blank value on such an axis is an [`Error::InvalidScope`].
pub fn resolve(setting_id: &str, policy: SharingPolicy, user: Option<&str>, note_id: Option<&str>) -> Result<IsolationKey> {
	if setting_id.trim().is_empty() {
		return Err(Error::InvalidScope {
			setting: setting_id.to_string(),
			reason: "setting id is empty".into(),
		});
	}

	let (per_user, per_note) = policy.axes();
	let required = |value: Option<&str>, axis: &str| -> Result<String> {
		match value {
			Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
			_ => Err(Error::InvalidScope {
				setting: setting_id.to_string(),
				reason: format!("{policy} policy requires a {axis}"),
			}),
		}
	};

	let user = per_user.then(|| required(user, "user")).transpose()?;
	let note_id = per_note.then(|| required(note_id, "note id")).transpose()?;

	Ok(IsolationKey {
		setting_id: setting_id.to_string(),
		user,
		note_id,
	})
}

fn escape_component(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for byte in raw.bytes() {
		if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
			out.push(byte as char);
		} else {
			out.push_str(&format!("%{byte:02X}"));
		}
	}
	out
}
