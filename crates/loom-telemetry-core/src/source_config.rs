// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Remote source configuration as served by the control plane.

use serde::{Deserialize, Serialize};

use crate::json::JsonMap;
use crate::state::StateAction;

/// The `sourceConfig` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
	#[serde(default)]
	pub source: Source,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub write_key: String,
	#[serde(default = "enabled_by_default")]
	pub enabled: bool,
	#[serde(default)]
	pub workspace_id: String,
	#[serde(default)]
	pub destinations: Vec<Destination>,
	#[serde(default)]
	pub updated_at: String,
}

impl Default for Source {
	fn default() -> Self {
		Self {
			id: String::new(),
			name: String::new(),
			write_key: String::new(),
			enabled: true,
			workspace_id: String::new(),
			destinations: Vec::new(),
			updated_at: String::new(),
		}
	}
}

fn enabled_by_default() -> bool {
	true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
	#[serde(rename = "id", default)]
	pub destination_id: String,
	#[serde(rename = "name", default)]
	pub destination_name: String,
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub config: JsonMap,
	#[serde(default)]
	pub destination_definition_id: String,
	#[serde(default)]
	pub updated_at: String,
}

impl SourceConfig {
	pub fn source_id(&self) -> &str {
		&self.source.id
	}

	pub fn is_enabled(&self) -> bool {
		self.source.enabled
	}

	pub fn destinations(&self) -> &[Destination] {
		&self.source.destinations
	}
}

/// Transitions of [`SourceConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfigAction {
	/// Replace the cached configuration with a freshly fetched one.
	Update(SourceConfig),
	/// The data plane rejected the source; stop treating it as enabled.
	DisableSource,
}

impl StateAction<SourceConfig> for SourceConfigAction {
	fn reduce(&self, current: &SourceConfig) -> SourceConfig {
		match self {
			SourceConfigAction::Update(config) => config.clone(),
			SourceConfigAction::DisableSource => {
				let mut next = current.clone();
				next.source.enabled = false;
				next
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_deserialize_control_plane_payload() {
		let payload = json!({
			"source": {
				"id": "src-1",
				"name": "rust-app",
				"writeKey": "wk",
				"enabled": true,
				"workspaceId": "ws-1",
				"updatedAt": "2025-01-01T00:00:00.000Z",
				"destinations": [{
					"id": "dest-1",
					"name": "Amplitude",
					"enabled": true,
					"config": {"apiKey": "x"},
					"destinationDefinitionId": "def-1",
					"unknownField": 1
				}]
			}
		});
		let config: SourceConfig = serde_json::from_value(payload).unwrap();
		assert_eq!(config.source_id(), "src-1");
		assert!(config.is_enabled());
		assert_eq!(config.destinations()[0].destination_name, "Amplitude");
		assert_eq!(config.destinations()[0].config["apiKey"], "x");
	}

	#[test]
	fn test_missing_enabled_defaults_to_true() {
		let config: SourceConfig = serde_json::from_value(json!({"source": {"id": "s"}})).unwrap();
		assert!(config.is_enabled());
	}

	#[test]
	fn test_update_replaces_config() {
		let mut fresh = SourceConfig::default();
		fresh.source.id = "new".to_string();
		let next = SourceConfigAction::Update(fresh.clone()).reduce(&SourceConfig::default());
		assert_eq!(next, fresh);
	}

	#[test]
	fn test_disable_source_keeps_destinations() {
		let mut config = SourceConfig::default();
		config.source.destinations.push(Destination {
			destination_id: "d".to_string(),
			destination_name: "D".to_string(),
			enabled: true,
			config: JsonMap::new(),
			destination_definition_id: String::new(),
			updated_at: String::new(),
		});
		let next = SourceConfigAction::DisableSource.reduce(&config);
		assert!(!next.is_enabled());
		assert_eq!(next.destinations().len(), 1);
	}
}
