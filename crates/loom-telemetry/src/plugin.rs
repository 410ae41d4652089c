// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Staged plugin pipeline.
//!
//! Every event runs through the `PreProcess`, `OnProcess` and `Destination`
//! stages in that order; plugins within a stage run in insertion order. Each
//! plugin owns the event it is handed, so it only sees a sibling's changes
//! through the value that sibling returned. Returning `None` drops the event
//! and no later plugin or stage runs.
//!
//! `After` and `Manual` plugins are registered like the others but are never
//! invoked by [`PluginChain::process`]; the host drives them explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use loom_telemetry_core::{Event, SourceConfig, State, UserIdentity};

/// The stage a plugin runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginStage {
	PreProcess,
	OnProcess,
	Destination,
	After,
	Manual,
}

impl PluginStage {
	pub const ALL: [PluginStage; 5] = [
		PluginStage::PreProcess,
		PluginStage::OnProcess,
		PluginStage::Destination,
		PluginStage::After,
		PluginStage::Manual,
	];

	/// Stages applied by [`PluginChain::process`], in order.
	pub const PROCESSED: [PluginStage; 3] = [
		PluginStage::PreProcess,
		PluginStage::OnProcess,
		PluginStage::Destination,
	];
}

/// A plugin failed while handling an event.
#[derive(Debug, Clone, Error)]
#[error("plugin {key} failed: {message}")]
pub struct PluginError {
	pub key: String,
	pub message: String,
}

impl PluginError {
	pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			message: message.into(),
		}
	}
}

/// Shared state handed to plugins on setup.
#[derive(Clone)]
pub struct PluginContext {
	pub write_key: String,
	pub identity: Arc<State<UserIdentity>>,
	pub source_config: Arc<State<SourceConfig>>,
}

/// An event interceptor.
#[async_trait]
pub trait Plugin: Send + Sync {
	/// Stable registry key used by [`PluginChain::find`] and [`PluginChain::remove`].
	fn key(&self) -> &str;

	fn stage(&self) -> PluginStage;

	async fn setup(&self, _context: &PluginContext) {}

	/// Transforms the event; `Ok(None)` drops it.
	async fn intercept(&self, event: Event) -> Result<Option<Event>, PluginError> {
		Ok(Some(event))
	}

	/// Forces buffered output out. Called by [`PluginChain::flush`].
	async fn flush(&self) {}

	/// Called when the user identity is reset.
	async fn reset(&self) {}

	async fn teardown(&self) {}
}

/// An ordered list of plugins for one stage.
#[derive(Default)]
pub struct PluginInteractor {
	plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginInteractor {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, plugin: Arc<dyn Plugin>) {
		self.write().push(plugin);
	}

	/// Removes every plugin registered under `key` and returns them.
	pub fn remove(&self, key: &str) -> Vec<Arc<dyn Plugin>> {
		let mut plugins = self.write();
		let (removed, kept): (Vec<_>, Vec<_>) = plugins.drain(..).partition(|p| p.key() == key);
		*plugins = kept;
		removed
	}

	pub fn remove_all(&self) -> Vec<Arc<dyn Plugin>> {
		std::mem::take(&mut *self.write())
	}

	pub fn find(&self, key: &str) -> Option<Arc<dyn Plugin>> {
		self.read().iter().find(|p| p.key() == key).cloned()
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.read().is_empty()
	}

	/// Copy of the current list, so callers never hold the lock across `.await`.
	pub fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
		self.read().clone()
	}

	/// Threads `event` through every plugin in order.
	pub async fn execute(&self, event: Event) -> Result<Option<Event>, PluginError> {
		let mut current = event;
		for plugin in self.snapshot() {
			match plugin.intercept(current).await? {
				Some(next) => current = next,
				None => {
					debug!(plugin = plugin.key(), "event dropped by plugin");
					return Ok(None);
				}
			}
		}
		Ok(Some(current))
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Plugin>>> {
		self.plugins.read().unwrap_or_else(|e| e.into_inner())
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Plugin>>> {
		self.plugins.write().unwrap_or_else(|e| e.into_inner())
	}
}

/// All plugins of an analytics instance, grouped by stage.
pub struct PluginChain {
	context: PluginContext,
	stages: [PluginInteractor; 5],
	opted_out: AtomicBool,
}

impl PluginChain {
	pub fn new(context: PluginContext) -> Self {
		Self {
			context,
			stages: Default::default(),
			opted_out: AtomicBool::new(false),
		}
	}

	fn stage(&self, stage: PluginStage) -> &PluginInteractor {
		&self.stages[stage as usize]
	}

	/// Runs the plugin's setup and registers it in its stage.
	pub async fn add(&self, plugin: Arc<dyn Plugin>) {
		plugin.setup(&self.context).await;
		debug!(plugin = plugin.key(), stage = ?plugin.stage(), "added plugin");
		self.stage(plugin.stage()).add(plugin);
	}

	/// Removes the plugins registered under `key`, tearing each down once.
	pub async fn remove(&self, key: &str) -> bool {
		let mut removed = Vec::new();
		for stage in PluginStage::ALL {
			removed.extend(self.stage(stage).remove(key));
		}
		for plugin in &removed {
			plugin.teardown().await;
			debug!(plugin = plugin.key(), "removed plugin");
		}
		!removed.is_empty()
	}

	/// Removes and tears down every plugin.
	pub async fn remove_all(&self) {
		for stage in PluginStage::ALL {
			for plugin in self.stage(stage).remove_all() {
				plugin.teardown().await;
			}
		}
	}

	pub fn find(&self, key: &str) -> Option<Arc<dyn Plugin>> {
		PluginStage::ALL
			.into_iter()
			.find_map(|stage| self.stage(stage).find(key))
	}

	pub fn plugins(&self, stage: PluginStage) -> Vec<Arc<dyn Plugin>> {
		self.stage(stage).snapshot()
	}

	pub fn set_opt_out(&self, opted_out: bool) {
		self.opted_out.store(opted_out, Ordering::SeqCst);
	}

	pub fn is_opted_out(&self) -> bool {
		self.opted_out.load(Ordering::SeqCst)
	}

	/// Runs the event through the processing stages.
	///
	/// Returns the event as it left the last stage, or `None` if it was dropped
	/// or the chain is opted out.
	pub async fn process(&self, event: Event) -> Result<Option<Event>, PluginError> {
		if self.is_opted_out() {
			debug!("opted out, dropping event");
			return Ok(None);
		}

		let mut current = event;
		for stage in PluginStage::PROCESSED {
			match self.stage(stage).execute(current).await? {
				Some(next) => current = next,
				None => return Ok(None),
			}
		}
		Ok(Some(current))
	}

	/// Calls `flush` on every plugin.
	pub async fn flush(&self) {
		for stage in PluginStage::ALL {
			for plugin in self.stage(stage).snapshot() {
				plugin.flush().await;
			}
		}
	}

	/// Calls `reset` on every plugin.
	pub async fn reset(&self) {
		for stage in PluginStage::ALL {
			for plugin in self.stage(stage).snapshot() {
				plugin.reset().await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_telemetry_core::JsonMap;
	use serde_json::json;
	use std::sync::atomic::AtomicUsize;
	use std::sync::Mutex;

	fn context() -> PluginContext {
		PluginContext {
			write_key: "wk".to_string(),
			identity: Arc::new(State::new(UserIdentity::new())),
			source_config: Arc::new(State::new(SourceConfig::default())),
		}
	}

	struct Tagger {
		key: &'static str,
		stage: PluginStage,
		log: Arc<Mutex<Vec<String>>>,
		teardowns: AtomicUsize,
	}

	impl Tagger {
		fn new(key: &'static str, stage: PluginStage, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
			Arc::new(Self {
				key,
				stage,
				log: Arc::clone(log),
				teardowns: AtomicUsize::new(0),
			})
		}
	}

	#[async_trait]
	impl Plugin for Tagger {
		fn key(&self) -> &str {
			self.key
		}

		fn stage(&self) -> PluginStage {
			self.stage
		}

		async fn intercept(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
			self.log.lock().unwrap().push(self.key.to_string());
			event.context.insert(self.key.to_string(), json!(true));
			Ok(Some(event))
		}

		async fn teardown(&self) {
			self.teardowns.fetch_add(1, Ordering::SeqCst);
		}
	}

	struct Dropper;

	#[async_trait]
	impl Plugin for Dropper {
		fn key(&self) -> &str {
			"dropper"
		}

		fn stage(&self) -> PluginStage {
			PluginStage::OnProcess
		}

		async fn intercept(&self, _event: Event) -> Result<Option<Event>, PluginError> {
			Ok(None)
		}
	}

	struct Failing;

	#[async_trait]
	impl Plugin for Failing {
		fn key(&self) -> &str {
			"failing"
		}

		fn stage(&self) -> PluginStage {
			PluginStage::PreProcess
		}

		async fn intercept(&self, _event: Event) -> Result<Option<Event>, PluginError> {
			Err(PluginError::new("failing", "boom"))
		}
	}

	#[tokio::test]
	async fn test_stages_run_in_order_regardless_of_insertion() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = PluginChain::new(context());
		chain.add(Tagger::new("dest", PluginStage::Destination, &log)).await;
		chain.add(Tagger::new("on", PluginStage::OnProcess, &log)).await;
		chain.add(Tagger::new("pre-1", PluginStage::PreProcess, &log)).await;
		chain.add(Tagger::new("pre-2", PluginStage::PreProcess, &log)).await;
		chain.add(Tagger::new("after", PluginStage::After, &log)).await;

		let out = chain
			.process(Event::track("x", JsonMap::new()))
			.await
			.unwrap()
			.unwrap();

		assert_eq!(*log.lock().unwrap(), vec!["pre-1", "pre-2", "on", "dest"]);
		for key in ["pre-1", "pre-2", "on", "dest"] {
			assert_eq!(out.context[key], true);
		}
		assert!(out.context.get("after").is_none());
	}

	#[tokio::test]
	async fn test_drop_stops_chain() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = PluginChain::new(context());
		chain.add(Arc::new(Dropper)).await;
		chain.add(Tagger::new("dest", PluginStage::Destination, &log)).await;

		assert!(chain.process(Event::identify()).await.unwrap().is_none());
		assert!(log.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_plugin_error_propagates() {
		let chain = PluginChain::new(context());
		chain.add(Arc::new(Failing)).await;
		let err = chain.process(Event::identify()).await.unwrap_err();
		assert_eq!(err.key, "failing");
	}

	#[tokio::test]
	async fn test_opt_out_short_circuits() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = PluginChain::new(context());
		chain.add(Tagger::new("pre", PluginStage::PreProcess, &log)).await;
		chain.set_opt_out(true);

		assert!(chain.process(Event::identify()).await.unwrap().is_none());
		assert!(log.lock().unwrap().is_empty());

		chain.set_opt_out(false);
		assert!(chain.process(Event::identify()).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn test_remove_tears_down_once_and_find() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let chain = PluginChain::new(context());
		let plugin = Tagger::new("tagger", PluginStage::OnProcess, &log);
		chain.add(plugin.clone()).await;

		assert!(chain.find("tagger").is_some());
		assert!(chain.remove("tagger").await);
		assert!(!chain.remove("tagger").await);
		assert!(chain.find("tagger").is_none());
		assert_eq!(plugin.teardowns.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_interactor_passes_returned_value_forward() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let interactor = PluginInteractor::new();
		interactor.add(Tagger::new("a", PluginStage::OnProcess, &log));
		interactor.add(Tagger::new("b", PluginStage::OnProcess, &log));
		assert_eq!(interactor.len(), 2);

		let out = interactor
			.execute(Event::identify())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(out.context["a"], true);
		assert_eq!(out.context["b"], true);
	}
}
