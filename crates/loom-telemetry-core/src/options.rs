// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-call options attached to an event.

use serde_json::Value;

use crate::identity::ExternalId;
use crate::json::JsonMap;

/// Extra routing and context supplied by the caller for a single event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventOptions {
	/// Per-destination enable flags, merged over `{"All": true}`.
	pub integrations: JsonMap,
	/// Context keys merged under the event's own context.
	pub custom_context: JsonMap,
	/// External ids added to `context.externalId`.
	pub external_ids: Vec<ExternalId>,
}

impl EventOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn integration(mut self, destination: impl Into<String>, enabled: bool) -> Self {
		self.integrations.insert(destination.into(), Value::Bool(enabled));
		self
	}

	pub fn custom_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.custom_context.insert(key.into(), value.into());
		self
	}

	pub fn external_id(mut self, external_id: ExternalId) -> Self {
		self.external_ids.push(external_id);
		self
	}
}
