//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error parsing TOML syntax or shape.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// Two `[[settings]]` entries share an id.
	#[error("duplicate interpreter setting id: {0}")]
	DuplicateSetting(String),

	/// A setting has an empty id.
	#[error("interpreter setting with empty id")]
	EmptySettingId,

	/// An environment override could not be applied.
	#[error("invalid value {value:?} for {var}: {reason}")]
	InvalidOverride {
		/// Environment variable name.
		var: &'static str,
		/// Offending value.
		value: String,
		/// What was expected.
		reason: String,
	},
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
