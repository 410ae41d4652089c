// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for telemetry core operations.

use thiserror::Error;

/// Errors raised while building or encoding telemetry payloads.
#[derive(Debug, Error)]
pub enum CoreError {
	/// JSON encoding or decoding failed.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// An event is missing a field every persisted event must carry.
	#[error("invalid event: {0}")]
	InvalidEvent(String),
}

/// Result type alias for telemetry core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
