// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loads, fetches and caches the control plane's source configuration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use loom_telemetry_core::{SourceConfig, SourceConfigAction, State};

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::error::{Result, TelemetryError};
use crate::network::{ErrorStatus, NetworkClient, NetworkError};
use crate::storage::{Storage, StorageKey};

/// Attempts made by [`SourceConfigManager::refresh`] before giving up.
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

pub struct SourceConfigManager {
	client: Arc<dyn NetworkClient>,
	storage: Arc<dyn Storage>,
	state: Arc<State<SourceConfig>>,
	backoff: Mutex<Box<dyn BackoffPolicy>>,
}

impl SourceConfigManager {
	pub fn new(
		client: Arc<dyn NetworkClient>,
		storage: Arc<dyn Storage>,
		state: Arc<State<SourceConfig>>,
	) -> Self {
		Self {
			client,
			storage,
			state,
			backoff: Mutex::new(Box::new(ExponentialBackoff::default())),
		}
	}

	pub fn with_backoff(mut self, backoff: Box<dyn BackoffPolicy>) -> Self {
		self.backoff = Mutex::new(backoff);
		self
	}

	/// Dispatches the cached config, if any. Returns whether one was found.
	pub async fn load_cached(&self) -> bool {
		let payload = self
			.storage
			.read_string(StorageKey::SourceConfigPayload, "")
			.await;
		if payload.is_empty() {
			return false;
		}

		match serde_json::from_str::<SourceConfig>(&payload) {
			Ok(config) => {
				debug!(source_id = config.source_id(), "loaded cached source config");
				self.state.dispatch(SourceConfigAction::Update(config));
				true
			}
			Err(e) => {
				warn!(error = %e, "discarding unreadable cached source config");
				false
			}
		}
	}

	/// Fetches the config, persists it and dispatches it.
	///
	/// Retryable failures are retried with backoff up to
	/// [`MAX_FETCH_ATTEMPTS`] times. A 400 means the write key is unknown and
	/// is not retried.
	pub async fn refresh(&self) -> Result<SourceConfig> {
		self.backoff().reset_backoff();
		let mut attempt = 1;
		let body = loop {
			match self.client.get_data().await {
				Ok(body) => break body,
				Err(e) if e.status == ErrorStatus::BadRequest => {
					error!(error = %e.message, "source config rejected, check the write key");
					return Err(TelemetryError::InvalidWriteKey);
				}
				Err(e) if e.status.is_retryable() && attempt < MAX_FETCH_ATTEMPTS => {
					let delay = self.backoff().next_delay_in_millis();
					warn!(attempt, delay_ms = delay, status = ?e.status, "source config fetch failed, retrying");
					tokio::time::sleep(Duration::from_millis(delay)).await;
					attempt += 1;
				}
				Err(e) => {
					error!(attempt, status = ?e.status, error = %e.message, "giving up on source config fetch");
					return Err(into_telemetry_error(e));
				}
			}
		};

		let config: SourceConfig = serde_json::from_str(&body)?;
		self.storage
			.write(StorageKey::SourceConfigPayload, body.into())
			.await?;
		self.storage
			.write(StorageKey::SourceIsEnabled, config.is_enabled().into())
			.await?;
		self.state.dispatch(SourceConfigAction::Update(config.clone()));
		info!(
			source_id = config.source_id(),
			enabled = config.is_enabled(),
			destinations = config.destinations().len(),
			"source config updated"
		);
		Ok(config)
	}

	fn backoff(&self) -> std::sync::MutexGuard<'_, Box<dyn BackoffPolicy>> {
		self.backoff.lock().unwrap_or_else(|e| e.into_inner())
	}
}

fn into_telemetry_error(e: NetworkError) -> TelemetryError {
	let status = match e.status {
		ErrorStatus::BadRequest => 400,
		ErrorStatus::InvalidWriteKey => 401,
		ErrorStatus::ResourceNotFound => 404,
		ErrorStatus::NetworkTimeout => 408,
		ErrorStatus::PayloadTooLarge => 413,
		ErrorStatus::TooManyRequests => 429,
		ErrorStatus::ServerError => 500,
		ErrorStatus::RetryError | ErrorStatus::GeneralError => 0,
	};
	TelemetryError::Server {
		status,
		message: e.message,
	}
}
