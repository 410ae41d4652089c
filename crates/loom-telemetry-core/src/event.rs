// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The telemetry event model.
//!
//! An [`Event`] is a set of common fields plus one [`EventKind`] carrying the
//! type-specific payload. The kind is flattened into the event on the wire:
//!
//! ```json
//! {
//!   "type": "track",
//!   "event": "Order Completed",
//!   "properties": {"total": 42},
//!   "messageId": "8c0b...",
//!   "originalTimestamp": "2025-01-01T00:00:00.000Z",
//!   "anonymousId": "5f1a...",
//!   "context": {"traits": {"anonymousId": "5f1a..."}},
//!   "integrations": {"All": true},
//!   "channel": "server"
//! }
//! ```
//!
//! Flush requests are not events; they travel through the queue as a separate
//! instruction and can never reach a batch file.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::identity::{merge_external_ids, UserIdentity};
use crate::json::{iso8601_now, merge_with_priority, JsonMap};
use crate::options::EventOptions;

/// Value of the `channel` field for events produced by this SDK.
pub const DEFAULT_CHANNEL: &str = "server";

/// Type-specific payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
	Track {
		event: String,
		#[serde(default)]
		properties: JsonMap,
	},
	Screen {
		#[serde(rename = "event")]
		name: String,
		#[serde(default)]
		properties: JsonMap,
	},
	Group {
		#[serde(rename = "groupId")]
		group_id: String,
		#[serde(default)]
		traits: JsonMap,
	},
	Identify,
	Alias {
		#[serde(rename = "previousId")]
		previous_id: String,
	},
}

impl EventKind {
	/// The wire value of the `type` field.
	pub fn type_name(&self) -> &'static str {
		match self {
			EventKind::Track { .. } => "track",
			EventKind::Screen { .. } => "screen",
			EventKind::Group { .. } => "group",
			EventKind::Identify => "identify",
			EventKind::Alias { .. } => "alias",
		}
	}
}

/// A single telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	#[serde(flatten)]
	pub kind: EventKind,
	pub message_id: String,
	pub original_timestamp: String,
	#[serde(default)]
	pub anonymous_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub user_id: String,
	#[serde(default)]
	pub context: JsonMap,
	#[serde(default)]
	pub integrations: JsonMap,
	#[serde(default)]
	pub channel: String,
	#[serde(skip)]
	pub options: EventOptions,
}

fn default_integrations() -> JsonMap {
	let mut integrations = JsonMap::new();
	integrations.insert("All".to_string(), Value::Bool(true));
	integrations
}

impl Event {
	/// Creates an event with a fresh message id and the current timestamp.
	pub fn new(kind: EventKind) -> Self {
		Self {
			kind,
			message_id: Uuid::new_v4().to_string(),
			original_timestamp: iso8601_now(),
			anonymous_id: String::new(),
			user_id: String::new(),
			context: JsonMap::new(),
			integrations: default_integrations(),
			channel: DEFAULT_CHANNEL.to_string(),
			options: EventOptions::default(),
		}
	}

	pub fn track(name: impl Into<String>, properties: JsonMap) -> Self {
		Self::new(EventKind::Track {
			event: name.into(),
			properties,
		})
	}

	/// Creates a screen event. `name` and a non-empty `category` are added to
	/// the properties unless the caller already set those keys.
	pub fn screen(name: impl Into<String>, category: &str, properties: JsonMap) -> Self {
		let name = name.into();
		let mut defaults = JsonMap::new();
		defaults.insert("name".to_string(), Value::String(name.clone()));
		if !category.is_empty() {
			defaults.insert("category".to_string(), Value::String(category.to_string()));
		}
		Self::new(EventKind::Screen {
			name,
			properties: merge_with_priority(&properties, &defaults),
		})
	}

	pub fn group(group_id: impl Into<String>, traits: JsonMap) -> Self {
		Self::new(EventKind::Group {
			group_id: group_id.into(),
			traits,
		})
	}

	pub fn identify() -> Self {
		Self::new(EventKind::Identify)
	}

	pub fn alias(previous_id: impl Into<String>) -> Self {
		Self::new(EventKind::Alias {
			previous_id: previous_id.into(),
		})
	}

	pub fn with_options(mut self, options: EventOptions) -> Self {
		self.options = options;
		self
	}

	pub fn event_type(&self) -> &'static str {
		self.kind.type_name()
	}

	/// Stamps identity fields and applies the caller's options.
	///
	/// Integrations become `{"All": true}` overlaid with the option's map, the
	/// option's custom context sits under the event's own context, and
	/// `context.traits` / `context.externalId` reflect `identity`.
	pub fn prepare(&mut self, identity: &UserIdentity) {
		self.anonymous_id = identity.anonymous_id.clone();
		self.user_id = identity.user_id.clone();
		if self.channel.is_empty() {
			self.channel = DEFAULT_CHANNEL.to_string();
		}

		self.integrations = merge_with_priority(&self.options.integrations, &default_integrations());
		self.context = merge_with_priority(&self.context, &self.options.custom_context);

		let mut stamped = JsonMap::new();
		stamped.insert(
			"anonymousId".to_string(),
			Value::String(identity.anonymous_id.clone()),
		);
		if !identity.user_id.is_empty() {
			stamped.insert("userId".to_string(), Value::String(identity.user_id.clone()));
		}
		let traits = merge_with_priority(&stamped, &identity.traits);
		self.context.insert("traits".to_string(), Value::Object(traits));

		let external_ids = merge_external_ids(&identity.external_ids, &self.options.external_ids);
		if !external_ids.is_empty() {
			let ids = external_ids
				.iter()
				.map(|e| json!({"id": e.id, "type": e.id_type}))
				.collect();
			self.context.insert("externalId".to_string(), Value::Array(ids));
		}
	}

	/// Merges `values` into `context`; `values` wins on key collision.
	pub fn merge_context(&mut self, values: &JsonMap) {
		self.context = merge_with_priority(values, &self.context);
	}

	/// Checks the fields every persisted event must carry.
	pub fn validate(&self) -> Result<()> {
		if self.message_id.is_empty() {
			return Err(CoreError::InvalidEvent("missing messageId".to_string()));
		}
		if self.original_timestamp.is_empty() {
			return Err(CoreError::InvalidEvent(
				"missing originalTimestamp".to_string(),
			));
		}
		Ok(())
	}

	/// Serializes the event as a single JSON object.
	pub fn to_json(&self) -> Result<String> {
		self.validate()?;
		Ok(serde_json::to_string(self)?)
	}
}
