// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The client facade.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use loom_telemetry_core::{
	Event, EventOptions, IdentityAction, JsonMap, ResetEntries, SourceConfig, State, UserIdentity,
};

use crate::backoff::BackoffPolicy;
use crate::config::Configuration;
use crate::error::{Result, TelemetryError};
use crate::network::{HttpClient, NetworkClient};
use crate::plugin::{Plugin, PluginChain, PluginContext};
use crate::plugins::{DataplanePlugin, LibraryInfoPlugin};
use crate::policy::FlushPolicies;
use crate::queue::EventQueue;
use crate::source_config::SourceConfigManager;
use crate::storage::{FileStorage, Storage, StorageKey, StorageValue};

enum Command {
	Process(Box<Event>),
	PersistIdentity(UserIdentity),
	Flush,
	Reset,
	OptOut(bool),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builder for [`Analytics`].
pub struct AnalyticsBuilder {
	config: Configuration,
	storage: Option<Arc<dyn Storage>>,
	client: Option<Arc<dyn NetworkClient>>,
	backoff: Option<Box<dyn BackoffPolicy>>,
	plugins: Vec<Arc<dyn Plugin>>,
}

impl AnalyticsBuilder {
	pub fn new(config: Configuration) -> Self {
		Self {
			config,
			storage: None,
			client: None,
			backoff: None,
			plugins: Vec::new(),
		}
	}

	/// Replaces the file storage under `config.storage_dir`.
	pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
		self.storage = Some(storage);
		self
	}

	/// Replaces the HTTP client built from the configuration.
	pub fn network_client(mut self, client: Arc<dyn NetworkClient>) -> Self {
		self.client = Some(client);
		self
	}

	/// Replaces the upload backoff built from `config.backoff`.
	pub fn backoff(mut self, backoff: Box<dyn BackoffPolicy>) -> Self {
		self.backoff = Some(backoff);
		self
	}

	/// Adds a plugin after the built-in ones.
	pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
		self.plugins.push(plugin);
		self
	}

	/// Opens storage, restores the persisted identity and starts the pipeline.
	///
	/// Must be called from within a tokio runtime.
	pub async fn build(self) -> Result<Analytics> {
		let config = self.config;

		let storage: Arc<dyn Storage> = match self.storage {
			Some(storage) => storage,
			None => Arc::new(FileStorage::open(&config.storage_dir, &config.write_key).await?),
		};
		let client: Arc<dyn NetworkClient> = match self.client {
			Some(client) => client,
			None => Arc::new(
				HttpClient::builder()
					.write_key(&config.write_key)
					.data_plane_url(&config.data_plane_url)
					.control_plane_url(&config.control_plane_url)
					.gzip(config.gzip)
					.request_timeout(config.request_timeout)
					.build()?,
			),
		};

		let identity = Arc::new(State::new(load_identity(storage.as_ref()).await));
		persist_identity(storage.as_ref(), &identity.value()).await;

		let source_config = Arc::new(State::new(SourceConfig::default()));
		let manager = SourceConfigManager::new(
			Arc::clone(&client),
			Arc::clone(&storage),
			Arc::clone(&source_config),
		);
		manager.load_cached().await;

		let backoff: Box<dyn BackoffPolicy> = match self.backoff {
			Some(backoff) => backoff,
			None => Box::new(config.backoff.build()),
		};
		let queue = Arc::new(EventQueue::with_source_config(
			Arc::clone(&storage),
			Arc::clone(&client),
			FlushPolicies::from_config(&config.flush_policies),
			backoff,
			Arc::clone(&source_config),
		));

		let chain = Arc::new(PluginChain::new(PluginContext {
			write_key: config.write_key.clone(),
			identity: Arc::clone(&identity),
			source_config: Arc::clone(&source_config),
		}));
		if config.track_library_info {
			chain.add(Arc::new(LibraryInfoPlugin::new())).await;
		}
		chain
			.add(Arc::new(DataplanePlugin::new(Arc::clone(&queue))))
			.await;
		for plugin in self.plugins {
			chain.add(plugin).await;
		}

		let config_fetch = config.fetch_source_config.then(|| {
			tokio::spawn(async move {
				if let Err(e) = manager.refresh().await {
					warn!(error = %e, "source config unavailable, using cached copy");
				}
			})
		});

		let (commands, command_rx) = mpsc::unbounded_channel();
		let processor = tokio::spawn(run_processor(
			Arc::clone(&chain),
			Arc::clone(&storage),
			command_rx,
		));

		info!(
			anonymous_id = %identity.value().anonymous_id,
			policies = config.flush_policies.len(),
			"analytics client started"
		);

		Ok(Analytics {
			inner: Arc::new(AnalyticsInner {
				storage,
				identity,
				source_config,
				chain,
				queue,
				commands: Mutex::new(Some(commands)),
				processor: Mutex::new(Some(processor)),
				config_fetch: Mutex::new(config_fetch),
				opted_out: AtomicBool::new(false),
				closed: AtomicBool::new(false),
			}),
		})
	}
}

struct AnalyticsInner {
	storage: Arc<dyn Storage>,
	identity: Arc<State<UserIdentity>>,
	source_config: Arc<State<SourceConfig>>,
	chain: Arc<PluginChain>,
	queue: Arc<EventQueue>,
	commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
	processor: Mutex<Option<JoinHandle<()>>>,
	config_fetch: Mutex<Option<JoinHandle<()>>>,
	opted_out: AtomicBool,
	closed: AtomicBool,
}

/// Records events for one write key.
///
/// Calls never block on I/O: events are stamped with the current identity,
/// then handed to a background task that runs the plugin chain. The
/// dataplane plugin at the end of the chain persists them and uploads in
/// batches.
///
/// ```no_run
/// use loom_telemetry::{Analytics, Configuration, EventOptions, Properties};
///
/// # async fn run() -> loom_telemetry::Result<()> {
/// let config = Configuration::builder("WRITE_KEY", "https://hosted.rudderlabs.com").build()?;
/// let analytics = Analytics::new(config).await?;
///
/// analytics.identify("user-1", Properties::new().insert("plan", "pro"), EventOptions::new())?;
/// analytics.track("Thread Created", Properties::new().insert("model", "opus"), EventOptions::new())?;
///
/// analytics.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Analytics {
	inner: Arc<AnalyticsInner>,
}

impl Analytics {
	pub fn builder(config: Configuration) -> AnalyticsBuilder {
		AnalyticsBuilder::new(config)
	}

	pub async fn new(config: Configuration) -> Result<Self> {
		AnalyticsBuilder::new(config).build().await
	}

	pub fn track(
		&self,
		name: impl Into<String>,
		properties: impl Into<JsonMap>,
		options: EventOptions,
	) -> Result<()> {
		self.enqueue(Event::track(name, properties.into()).with_options(options))
	}

	/// Records a screen view. `name` and a non-empty `category` are added to
	/// the properties unless already present.
	pub fn screen(
		&self,
		name: impl Into<String>,
		category: &str,
		properties: impl Into<JsonMap>,
		options: EventOptions,
	) -> Result<()> {
		self.enqueue(Event::screen(name, category, properties.into()).with_options(options))
	}

	pub fn group(
		&self,
		group_id: impl Into<String>,
		traits: impl Into<JsonMap>,
		options: EventOptions,
	) -> Result<()> {
		self.enqueue(Event::group(group_id, traits.into()).with_options(options))
	}

	/// Sets the user. Identifying the current user again merges traits and
	/// external ids; a different user replaces them.
	pub fn identify(
		&self,
		user_id: impl Into<String>,
		traits: impl Into<JsonMap>,
		options: EventOptions,
	) -> Result<()> {
		self.check_closed()?;
		let identity = self.inner.identity.dispatch(IdentityAction::set_user(
			user_id,
			traits.into(),
			options.external_ids.clone(),
		));
		self.send(Command::PersistIdentity(identity))?;
		self.enqueue(Event::identify().with_options(options))
	}

	/// Links `new_id` to a previous identity.
	///
	/// Without an explicit `previous_id` the current user id is used, or the
	/// anonymous id when no user is identified.
	pub fn alias(
		&self,
		new_id: impl Into<String>,
		previous_id: Option<&str>,
		options: EventOptions,
	) -> Result<()> {
		self.check_closed()?;
		let current = self.inner.identity.value();
		let previous_id = match previous_id {
			Some(id) if !id.is_empty() => id.to_string(),
			_ if !current.user_id.is_empty() => current.user_id,
			_ => current.anonymous_id,
		};

		let identity = self
			.inner
			.identity
			.dispatch(IdentityAction::SetUserIdForAlias(new_id.into()));
		self.send(Command::PersistIdentity(identity))?;
		self.enqueue(Event::alias(previous_id).with_options(options))
	}

	/// Requests an upload of everything recorded so far.
	pub fn flush(&self) -> Result<()> {
		self.check_closed()?;
		self.send(Command::Flush)
	}

	/// Clears the selected identity fields and notifies every plugin.
	pub fn reset(&self, entries: ResetEntries) -> Result<()> {
		self.check_closed()?;
		let identity = self.inner.identity.dispatch(IdentityAction::Reset(entries));
		debug!(anonymous_id = %identity.anonymous_id, "identity reset");
		self.send(Command::PersistIdentity(identity))?;
		self.send(Command::Reset)
	}

	pub fn anonymous_id(&self) -> String {
		self.inner.identity.value().anonymous_id
	}

	/// Replaces the anonymous id. An empty id generates a new one.
	pub fn set_anonymous_id(&self, anonymous_id: impl Into<String>) -> Result<()> {
		self.check_closed()?;
		let identity = self
			.inner
			.identity
			.dispatch(IdentityAction::SetAnonymousId(anonymous_id.into()));
		self.send(Command::PersistIdentity(identity))
	}

	pub fn user_id(&self) -> String {
		self.inner.identity.value().user_id
	}

	pub fn traits(&self) -> JsonMap {
		self.inner.identity.value().traits
	}

	pub fn identity(&self) -> UserIdentity {
		self.inner.identity.value()
	}

	/// The most recent source configuration, cached or fetched.
	pub fn source_config(&self) -> SourceConfig {
		self.inner.source_config.value()
	}

	/// Drops every subsequent event before any plugin sees it.
	///
	/// The change is queued behind events already recorded, so those are
	/// still processed with the previous setting.
	pub fn opt_out(&self, opted_out: bool) -> Result<()> {
		self.send(Command::OptOut(opted_out))?;
		self.inner.opted_out.store(opted_out, Ordering::SeqCst);
		info!(opted_out, "opt-out changed");
		Ok(())
	}

	pub fn is_opted_out(&self) -> bool {
		self.inner.opted_out.load(Ordering::SeqCst)
	}

	/// True once the data plane rejected the write key.
	pub fn is_upload_disabled(&self) -> bool {
		self.inner.queue.is_upload_disabled()
	}

	pub async fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
		self.check_closed()?;
		self.inner.chain.add(plugin).await;
		Ok(())
	}

	/// Removes and tears down the plugins registered under `key`.
	pub async fn remove_plugin(&self, key: &str) -> bool {
		self.inner.chain.remove(key).await
	}

	pub fn find_plugin(&self, key: &str) -> Option<Arc<dyn Plugin>> {
		self.inner.chain.find(key)
	}

	/// Processes every event already recorded, tears down all plugins and
	/// closes storage. Later calls fail with [`TelemetryError::ClientShutdown`].
	pub async fn shutdown(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		if let Some(fetch) = lock(&self.inner.config_fetch).take() {
			fetch.abort();
		}

		drop(lock(&self.inner.commands).take());
		let processor = lock(&self.inner.processor).take();
		if let Some(processor) = processor {
			if let Err(e) = processor.await {
				warn!(error = %e, "event processor ended abnormally");
			}
		}

		self.inner.chain.remove_all().await;
		self.inner.storage.close().await?;
		info!("analytics client shut down");
		Ok(())
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			return Err(TelemetryError::ClientShutdown);
		}
		Ok(())
	}

	fn enqueue(&self, mut event: Event) -> Result<()> {
		self.check_closed()?;
		event.prepare(&self.inner.identity.value());
		self.send(Command::Process(Box::new(event)))
	}

	fn send(&self, command: Command) -> Result<()> {
		let commands = lock(&self.inner.commands);
		let Some(commands) = commands.as_ref() else {
			return Err(TelemetryError::ClientShutdown);
		};
		commands
			.send(command)
			.map_err(|_| TelemetryError::ClientShutdown)
	}
}

async fn run_processor(
	chain: Arc<PluginChain>,
	storage: Arc<dyn Storage>,
	mut commands: mpsc::UnboundedReceiver<Command>,
) {
	while let Some(command) = commands.recv().await {
		match command {
			Command::Process(event) => process_event(&chain, *event).await,
			Command::PersistIdentity(identity) => persist_identity(storage.as_ref(), &identity).await,
			Command::Flush => chain.flush().await,
			Command::Reset => chain.reset().await,
			Command::OptOut(opted_out) => chain.set_opt_out(opted_out),
		}
	}
	debug!("event processor finished");
}

/// Runs one event through the chain. Plugin errors and panics drop the event.
async fn process_event(chain: &PluginChain, event: Event) {
	let message_id = event.message_id.clone();
	let event_type = event.event_type();

	match AssertUnwindSafe(chain.process(event)).catch_unwind().await {
		Ok(Ok(Some(_))) => debug!(%message_id, event_type, "processed event"),
		Ok(Ok(None)) => debug!(%message_id, event_type, "event dropped by plugin chain"),
		Ok(Err(e)) => {
			error!(%message_id, event_type, plugin = %e.key, error = %e.message, "plugin failed, event dropped");
		}
		Err(_) => error!(%message_id, event_type, "plugin panicked, event dropped"),
	}
}

async fn load_identity(storage: &dyn Storage) -> UserIdentity {
	let mut identity =
		UserIdentity::with_anonymous_id(storage.read_string(StorageKey::AnonymousId, "").await);
	identity.user_id = storage.read_string(StorageKey::UserId, "").await;
	identity.traits = read_json(storage, StorageKey::Traits).await.unwrap_or_default();
	identity.external_ids = read_json(storage, StorageKey::ExternalIds)
		.await
		.unwrap_or_default();
	identity
}

async fn read_json<T: DeserializeOwned>(storage: &dyn Storage, key: StorageKey) -> Option<T> {
	let raw = storage.read_string(key, "").await;
	if raw.is_empty() {
		return None;
	}
	match serde_json::from_str(&raw) {
		Ok(value) => Some(value),
		Err(e) => {
			warn!(key = key.as_str(), error = %e, "ignoring unreadable stored value");
			None
		}
	}
}

fn identity_entries(identity: &UserIdentity) -> serde_json::Result<[(StorageKey, StorageValue); 4]> {
	Ok([
		(StorageKey::AnonymousId, identity.anonymous_id.as_str().into()),
		(StorageKey::UserId, identity.user_id.as_str().into()),
		(StorageKey::Traits, serde_json::to_string(&identity.traits)?.into()),
		(
			StorageKey::ExternalIds,
			serde_json::to_string(&identity.external_ids)?.into(),
		),
	])
}

async fn persist_identity(storage: &dyn Storage, identity: &UserIdentity) {
	let entries = match identity_entries(identity) {
		Ok(entries) => entries,
		Err(e) => {
			error!(error = %e, "failed to serialize identity");
			return;
		}
	};
	for (key, value) in entries {
		if let Err(e) = storage.write(key, value).await {
			warn!(key = key.as_str(), error = %e, "failed to persist identity");
		}
	}
}
