// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! JSON helpers shared by the event model and the batch file format.
//!
//! A batch file on disk looks like:
//!
//! ```text
//! {"batch":[<event>,<event>,...],"sentAt":"2025-01-01T00:00:00.000Z"}
//! ```
//!
//! The prefix is written when the file is opened, events are appended with a
//! `,` separator, and the suffix is written when the file is sealed. The
//! `sentAt` value is rewritten right before upload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// A JSON object.
pub type JsonMap = Map<String, Value>;

/// Bytes written at the start of every batch file.
pub const BATCH_PREFIX: &str = "{\"batch\":[";

/// Separator written before every event after the first in a batch.
pub const BATCH_SEPARATOR: &str = ",";

const SENT_AT_MARKER: &str = "\"sentAt\":\"";

/// Returns the bytes that close a batch file.
pub fn batch_suffix(sent_at: &str) -> String {
	format!("],{SENT_AT_MARKER}{sent_at}\"}}")
}

/// Formats a timestamp as ISO-8601 UTC with millisecond precision.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
	timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The current time formatted with [`format_timestamp`].
pub fn iso8601_now() -> String {
	format_timestamp(Utc::now())
}

/// Merges two objects; keys in `high` win over keys in `low`.
pub fn merge_with_priority(high: &JsonMap, low: &JsonMap) -> JsonMap {
	let mut merged = low.clone();
	for (key, value) in high {
		merged.insert(key.clone(), value.clone());
	}
	merged
}

/// Rewrites the trailing `sentAt` value of a sealed batch.
///
/// Returns the batch unchanged if it carries no `sentAt` field.
pub fn update_sent_at(batch: &str, sent_at: &str) -> String {
	let Some(marker) = batch.rfind(SENT_AT_MARKER) else {
		return batch.to_string();
	};
	let value_start = marker + SENT_AT_MARKER.len();
	let Some(value_len) = batch[value_start..].find('"') else {
		return batch.to_string();
	};

	let mut updated = String::with_capacity(batch.len() + sent_at.len());
	updated.push_str(&batch[..value_start]);
	updated.push_str(sent_at);
	updated.push_str(&batch[value_start + value_len..]);
	updated
}

/// Extracts the anonymous id of the first event in a sealed batch.
pub fn extract_anonymous_id(batch: &str) -> Option<String> {
	let value: Value = serde_json::from_str(batch).ok()?;
	value
		.get("batch")?
		.as_array()?
		.iter()
		.find_map(|event| event.get("anonymousId")?.as_str())
		.filter(|id| !id.is_empty())
		.map(str::to_string)
}
