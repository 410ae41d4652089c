// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the telemetry SDK.

use std::path::PathBuf;

use loom_telemetry_core::CoreError;
use thiserror::Error;

/// Telemetry SDK errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
	/// A single serialized event is over the per-event cap.
	#[error("payload of {size} bytes exceeds the {limit} byte limit")]
	PayloadTooLarge { size: usize, limit: usize },

	/// Local storage I/O failed.
	#[error("storage I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON encoding or decoding failed.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// Building an event payload failed.
	#[error(transparent)]
	Core(#[from] CoreError),

	/// HTTP request failed before a response was received.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// The server answered with a non-success status.
	#[error("server error ({status}): {message}")]
	Server { status: u16, message: String },

	/// Write key is missing or was rejected by the server.
	#[error("invalid write key")]
	InvalidWriteKey,

	/// Data plane or control plane URL is missing or invalid.
	#[error("invalid base URL: {0}")]
	InvalidBaseUrl(String),

	/// The client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,

	/// Configuration could not be loaded.
	#[error(transparent)]
	Config(#[from] ConfigError),
}

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Config file could not be read.
	#[error("failed to read {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// TOML parsing error.
	#[error("TOML parse error in {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// Missing required field.
	#[error("missing required field: {0}")]
	MissingField(String),

	/// Invalid value.
	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	/// No platform data directory to store batches in.
	#[error("could not determine data directory")]
	DataDirNotFound,
}
