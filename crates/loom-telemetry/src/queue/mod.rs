// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The two-stage event queue.
//!
//! ```text
//! put(event) ──┐
//! flush() ─────┼─▶ write stage ──(upload trigger)──▶ upload stage ──▶ NetworkClient
//! frequency ───┘   serialize, append,                 rollover, read sealed files,
//!                  update flush policies               patch sentAt, send, clean up
//! ```
//!
//! Events and flush requests share one ordered channel into the write stage,
//! so a flush is handled only after every event queued before it has been
//! appended. That makes the upload stage's rollover safe.

mod upload;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use loom_telemetry_core::{Event, SourceConfig, State};

use crate::backoff::BackoffPolicy;
use crate::error::{Result, TelemetryError};
use crate::network::NetworkClient;
use crate::policy::FlushPolicies;
use crate::storage::{Storage, StorageKey};

/// An instruction for the write stage.
#[derive(Debug)]
pub enum QueueMessage {
	Event(Box<Event>),
	Flush,
}

pub(crate) struct QueueInner {
	storage: Arc<dyn Storage>,
	client: Arc<dyn NetworkClient>,
	policies: Mutex<FlushPolicies>,
	backoff: Mutex<Box<dyn BackoffPolicy>>,
	source_config: Option<Arc<State<SourceConfig>>>,
	uploads_disabled: AtomicBool,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl QueueInner {
	fn policies(&self) -> MutexGuard<'_, FlushPolicies> {
		lock(&self.policies)
	}

	fn backoff(&self) -> MutexGuard<'_, Box<dyn BackoffPolicy>> {
		lock(&self.backoff)
	}

	/// Serializes and appends one event. Failures are logged and the event dropped.
	async fn persist(&self, event: &Event, last_anonymous_id: &mut String) {
		let payload = match event.to_json() {
			Ok(payload) => payload,
			Err(e) => {
				error!(message_id = %event.message_id, error = %e, "dropping event that failed to serialize");
				return;
			}
		};

		if *last_anonymous_id != event.anonymous_id {
			if let Err(e) = self.storage.rollover().await {
				error!(error = %e, "failed to seal batch on anonymous id change");
			}
			last_anonymous_id.clone_from(&event.anonymous_id);
			if let Err(e) = self
				.storage
				.write(StorageKey::LastEventAnonymousId, event.anonymous_id.as_str().into())
				.await
			{
				warn!(error = %e, "failed to persist last event anonymous id");
			}
		}

		match self.storage.append_event(&payload).await {
			Ok(()) => {
				debug!(message_id = %event.message_id, event_type = event.event_type(), "persisted event");
				self.policies().update_state();
			}
			Err(TelemetryError::PayloadTooLarge { size, limit }) => {
				error!(message_id = %event.message_id, size, limit, "dropping oversized event");
			}
			Err(e) => {
				error!(message_id = %event.message_id, error = %e, "failed to persist event");
			}
		}
	}
}

async fn run_write_stage(
	inner: Arc<QueueInner>,
	mut messages: mpsc::UnboundedReceiver<QueueMessage>,
	upload_trigger: mpsc::UnboundedSender<()>,
) {
	let mut last_anonymous_id = inner
		.storage
		.read_string(StorageKey::LastEventAnonymousId, "")
		.await;

	while let Some(message) = messages.recv().await {
		let flush_requested = match message {
			QueueMessage::Event(event) => {
				inner.persist(&event, &mut last_anonymous_id).await;
				false
			}
			QueueMessage::Flush => true,
		};

		if flush_requested || inner.policies().should_flush() {
			if upload_trigger.send(()).is_err() {
				debug!("upload stage has stopped, batches stay on disk");
			}
			inner.policies().reset();
		}
	}

	debug!("write stage finished");
}

struct RunningQueue {
	messages: mpsc::UnboundedSender<QueueMessage>,
	write_task: JoinHandle<()>,
	upload_task: JoinHandle<()>,
}

impl RunningQueue {
	fn abort(self) {
		self.write_task.abort();
		self.upload_task.abort();
	}
}

/// Durable, ordered event queue for one write key.
pub struct EventQueue {
	inner: Arc<QueueInner>,
	running: Mutex<Option<RunningQueue>>,
}

impl EventQueue {
	pub fn new(
		storage: Arc<dyn Storage>,
		client: Arc<dyn NetworkClient>,
		policies: FlushPolicies,
		backoff: Box<dyn BackoffPolicy>,
	) -> Self {
		Self::build(storage, client, policies, backoff, None)
	}

	/// Like [`EventQueue::new`], dispatching `DisableSource` into `source_config`
	/// when the data plane reports the source as missing.
	pub fn with_source_config(
		storage: Arc<dyn Storage>,
		client: Arc<dyn NetworkClient>,
		policies: FlushPolicies,
		backoff: Box<dyn BackoffPolicy>,
		source_config: Arc<State<SourceConfig>>,
	) -> Self {
		Self::build(storage, client, policies, backoff, Some(source_config))
	}

	fn build(
		storage: Arc<dyn Storage>,
		client: Arc<dyn NetworkClient>,
		policies: FlushPolicies,
		backoff: Box<dyn BackoffPolicy>,
		source_config: Option<Arc<State<SourceConfig>>>,
	) -> Self {
		Self {
			inner: Arc::new(QueueInner {
				storage,
				client,
				policies: Mutex::new(policies),
				backoff: Mutex::new(backoff),
				source_config,
				uploads_disabled: AtomicBool::new(false),
			}),
			running: Mutex::new(None),
		}
	}

	/// Starts both stages and the flush schedule. Does nothing if already running.
	///
	/// Must be called from within a tokio runtime.
	pub fn start(&self) {
		let mut running = lock(&self.running);
		if running
			.as_ref()
			.is_some_and(|r| !r.write_task.is_finished())
		{
			return;
		}
		if let Some(stale) = running.take() {
			stale.abort();
		}

		let (messages, message_rx) = mpsc::unbounded_channel();
		let (upload_tx, upload_rx) = mpsc::unbounded_channel();

		let write_task = tokio::spawn(run_write_stage(Arc::clone(&self.inner), message_rx, upload_tx));
		let upload_task = tokio::spawn(upload::run_upload_stage(Arc::clone(&self.inner), upload_rx));

		let flush_tx = messages.clone();
		self.inner.policies().schedule(Arc::new(move || {
			let _ = flush_tx.send(QueueMessage::Flush);
		}));

		*running = Some(RunningQueue {
			messages,
			write_task,
			upload_task,
		});
		info!("event queue started");
	}

	/// Cancels both stages and the flush schedule.
	///
	/// Events queued but not yet appended are lost.
	pub fn stop(&self) {
		self.inner.policies().cancel_schedule();
		if let Some(running) = lock(&self.running).take() {
			running.abort();
			info!("event queue stopped");
		}
	}

	/// Persists every event already queued, then stops.
	///
	/// Uploads in flight are cancelled; their batches stay on disk.
	pub async fn shutdown(&self) {
		self.inner.policies().cancel_schedule();
		let running = lock(&self.running).take();
		let Some(running) = running else {
			return;
		};

		drop(running.messages);
		if let Err(e) = running.write_task.await {
			if !e.is_cancelled() {
				warn!(error = %e, "write stage ended abnormally");
			}
		}
		running.upload_task.abort();
		info!("event queue shut down");
	}

	pub fn is_running(&self) -> bool {
		lock(&self.running)
			.as_ref()
			.is_some_and(|r| !r.write_task.is_finished())
	}

	/// True once the data plane has rejected the write key.
	pub fn is_upload_disabled(&self) -> bool {
		self.inner.uploads_disabled.load(Ordering::SeqCst)
	}

	/// Queues an event without blocking.
	pub fn put(&self, event: Event) -> Result<()> {
		self.send(QueueMessage::Event(Box::new(event)))
	}

	/// Queues a flush request behind every event already queued.
	pub fn flush(&self) -> Result<()> {
		self.send(QueueMessage::Flush)
	}

	fn send(&self, message: QueueMessage) -> Result<()> {
		let running = lock(&self.running);
		let Some(running) = running.as_ref() else {
			return Err(TelemetryError::ClientShutdown);
		};
		running
			.messages
			.send(message)
			.map_err(|_| TelemetryError::ClientShutdown)
	}
}

impl Drop for EventQueue {
	fn drop(&mut self) {
		self.stop();
	}
}
