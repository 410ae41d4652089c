// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use loom_telemetry_core::json::{extract_anonymous_id, iso8601_now, update_sent_at};
use loom_telemetry_core::SourceConfigAction;

use super::QueueInner;
use crate::network::ErrorStatus;

enum CycleOutcome {
	/// Every sealed batch was handled.
	Complete,
	/// A retryable failure; back off before the next trigger.
	Retry,
	/// The write key was rejected; no further uploads.
	Stop,
}

pub(super) async fn run_upload_stage(inner: Arc<QueueInner>, mut triggers: mpsc::UnboundedReceiver<()>) {
	let mut anonymous_id_header: Option<String> = None;

	while triggers.recv().await.is_some() {
		// Triggers that piled up while busy are served by this one cycle.
		while triggers.try_recv().is_ok() {}

		match upload_cycle(&inner, &mut anonymous_id_header).await {
			CycleOutcome::Complete => {}
			CycleOutcome::Retry => {
				let delay = inner.backoff().next_delay_in_millis();
				debug!(delay_ms = delay, "upload failed, waiting before next attempt");
				tokio::time::sleep(Duration::from_millis(delay)).await;
			}
			CycleOutcome::Stop => {
				inner.uploads_disabled.store(true, Ordering::SeqCst);
				error!("write key rejected by the data plane, uploads stopped");
				break;
			}
		}
	}

	debug!("upload stage finished");
}

async fn upload_cycle(inner: &QueueInner, anonymous_id_header: &mut Option<String>) -> CycleOutcome {
	if let Err(e) = inner.storage.rollover().await {
		error!(error = %e, "failed to seal open batch before upload");
	}

	let files = match inner.storage.read_file_list().await {
		Ok(files) => files,
		Err(e) => {
			error!(error = %e, "failed to list batch files");
			return CycleOutcome::Complete;
		}
	};

	for path in files {
		let batch = match tokio::fs::read_to_string(&path).await {
			Ok(batch) => batch,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "batch already removed");
				continue;
			}
			Err(e) => {
				error!(path = %path.display(), error = %e, "failed to read batch file");
				continue;
			}
		};

		if let Some(anonymous_id) = extract_anonymous_id(&batch) {
			if anonymous_id_header.as_deref() != Some(anonymous_id.as_str()) {
				inner.client.update_anonymous_id_header(&anonymous_id);
				*anonymous_id_header = Some(anonymous_id);
			}
		}

		let body = update_sent_at(&batch, &iso8601_now());
		match inner.client.send_data(body).await {
			Ok(_) => {
				inner.backoff().reset_backoff();
				remove_batch(inner, &path).await;
				info!(path = %path.display(), "uploaded batch");
			}
			Err(e) if e.status.is_retryable() => {
				warn!(path = %path.display(), status = ?e.status, error = %e.message, "batch upload failed, will retry");
				return CycleOutcome::Retry;
			}
			Err(e) => match e.status {
				ErrorStatus::InvalidWriteKey => {
					remove_batch(inner, &path).await;
					return CycleOutcome::Stop;
				}
				ErrorStatus::ResourceNotFound => {
					warn!(path = %path.display(), "source not found, discarding batch and disabling source");
					remove_batch(inner, &path).await;
					if let Some(source_config) = &inner.source_config {
						source_config.dispatch(SourceConfigAction::DisableSource);
					}
				}
				status => {
					warn!(path = %path.display(), status = ?status, error = %e.message, "batch rejected, discarding");
					remove_batch(inner, &path).await;
				}
			},
		}
	}

	CycleOutcome::Complete
}

async fn remove_batch(inner: &QueueInner, path: &Path) {
	if !inner.storage.remove_file(path).await {
		debug!(path = %path.display(), "batch file was already gone");
	}
}
