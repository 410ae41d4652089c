// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use serde_json::json;

use loom_telemetry_core::{Event, JsonMap};

use crate::network::{SDK_NAME, SDK_VERSION};
use crate::plugin::{Plugin, PluginError, PluginStage};

pub const LIBRARY_INFO_PLUGIN_KEY: &str = "library_info";

/// Adds `context.library` naming this SDK.
pub struct LibraryInfoPlugin {
	library: JsonMap,
}

impl LibraryInfoPlugin {
	pub fn new() -> Self {
		let mut library = JsonMap::new();
		library.insert(
			"library".to_string(),
			json!({ "name": SDK_NAME, "version": SDK_VERSION }),
		);
		Self { library }
	}
}

impl Default for LibraryInfoPlugin {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Plugin for LibraryInfoPlugin {
	fn key(&self) -> &str {
		LIBRARY_INFO_PLUGIN_KEY
	}

	fn stage(&self) -> PluginStage {
		PluginStage::PreProcess
	}

	async fn intercept(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
		event.merge_context(&self.library);
		Ok(Some(event))
	}
}
