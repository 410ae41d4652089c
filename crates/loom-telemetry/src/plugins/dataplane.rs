// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use loom_telemetry_core::Event;

use crate::plugin::{Plugin, PluginContext, PluginError, PluginStage};
use crate::queue::EventQueue;

pub const DATAPLANE_PLUGIN_KEY: &str = "dataplane";

/// Destination plugin handing every processed event to the [`EventQueue`].
///
/// The queue starts on setup and is shut down on teardown.
pub struct DataplanePlugin {
	queue: Arc<EventQueue>,
}

impl DataplanePlugin {
	pub fn new(queue: Arc<EventQueue>) -> Self {
		Self { queue }
	}

	pub fn queue(&self) -> &Arc<EventQueue> {
		&self.queue
	}
}

#[async_trait]
impl Plugin for DataplanePlugin {
	fn key(&self) -> &str {
		DATAPLANE_PLUGIN_KEY
	}

	fn stage(&self) -> PluginStage {
		PluginStage::Destination
	}

	async fn setup(&self, _context: &PluginContext) {
		self.queue.start();
	}

	async fn intercept(&self, event: Event) -> Result<Option<Event>, PluginError> {
		if let Err(e) = self.queue.put(event.clone()) {
			warn!(message_id = %event.message_id, error = %e, "event queue unavailable, event dropped");
		}
		Ok(Some(event))
	}

	async fn flush(&self) {
		if let Err(e) = self.queue.flush() {
			warn!(error = %e, "event queue unavailable, flush ignored");
		}
	}

	async fn teardown(&self) {
		self.queue.shutdown().await;
	}
}
