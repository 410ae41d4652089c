// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests: facade, plugin chain, batch files and uploads.

use std::collections::VecDeque;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::Value;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loom_telemetry::{
	Analytics, BackoffPolicy, Configuration, ErrorStatus, EventOptions, FlushPolicyConfig, JsonMap,
	NetworkClient, NetworkError, NetworkResult, Properties, ResetEntries,
};

const WRITE_KEY: &str = "wk";

struct NoDelay;

impl BackoffPolicy for NoDelay {
	fn next_delay_in_millis(&mut self) -> u64 {
		0
	}

	fn reset_backoff(&mut self) {}
}

/// Records uploads and answers from a script, then with success.
#[derive(Default)]
struct RecordingClient {
	responses: Mutex<VecDeque<NetworkResult>>,
	bodies: Mutex<Vec<String>>,
	headers: Mutex<Vec<String>>,
}

impl RecordingClient {
	fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn scripted(responses: Vec<NetworkResult>) -> Arc<Self> {
		Arc::new(Self {
			responses: Mutex::new(responses.into()),
			..Self::default()
		})
	}

	fn sends(&self) -> usize {
		self.bodies.lock().unwrap().len()
	}

	fn uploaded_batches(&self) -> Vec<Vec<Value>> {
		self.bodies
			.lock()
			.unwrap()
			.iter()
			.map(|body| {
				let batch: Value = serde_json::from_str(body).unwrap();
				assert!(batch["sentAt"].is_string());
				batch["batch"].as_array().unwrap().clone()
			})
			.collect()
	}
}

#[async_trait]
impl NetworkClient for RecordingClient {
	async fn get_data(&self) -> NetworkResult {
		Err(NetworkError::new(ErrorStatus::GeneralError, "no control plane"))
	}

	async fn send_data(&self, body: String) -> NetworkResult {
		self.bodies.lock().unwrap().push(body);
		self.responses
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or_else(|| Ok("OK".to_string()))
	}

	fn update_anonymous_id_header(&self, anonymous_id: &str) {
		self.headers.lock().unwrap().push(anonymous_id.to_string());
	}
}

fn config(dir: &Path, policies: Vec<FlushPolicyConfig>) -> Configuration {
	Configuration::builder(WRITE_KEY, "https://dp.example.com")
		.storage_dir(dir)
		.flush_policies(policies)
		.fetch_source_config(false)
		.build()
		.unwrap()
}

async fn start(dir: &Path, client: &Arc<RecordingClient>, policies: Vec<FlushPolicyConfig>) -> Analytics {
	Analytics::builder(config(dir, policies))
		.network_client(client.clone())
		.backoff(Box::new(NoDelay))
		.build()
		.await
		.unwrap()
}

fn batch_files(dir: &Path, temporary: bool) -> Vec<PathBuf> {
	let Ok(entries) = std::fs::read_dir(dir.join(WRITE_KEY)) else {
		return Vec::new();
	};
	entries
		.map(|entry| entry.unwrap().path())
		.filter(|path| {
			let name = path.file_name().unwrap().to_string_lossy().into_owned();
			name.starts_with(&format!("{WRITE_KEY}-")) && name.ends_with(".tmp") == temporary
		})
		.collect()
}

fn sealed_files(dir: &Path) -> Vec<PathBuf> {
	batch_files(dir, false)
}

async fn eventually(condition: impl Fn() -> bool) {
	for _ in 0..500 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not met in time");
}

async fn eventually_async<F, Fut>(condition: F)
where
	F: Fn() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..500 {
		if condition().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not met in time");
}

fn track(analytics: &Analytics, name: &str) {
	analytics
		.track(name, Properties::new().insert("source", "test"), EventOptions::new())
		.unwrap();
}

#[tokio::test]
async fn count_policy_uploads_once_threshold_is_reached() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::new();
	let analytics = start(dir.path(), &client, vec![FlushPolicyConfig::Count { threshold: 5 }]).await;

	for i in 0..5 {
		track(&analytics, &format!("Event {i}"));
	}

	eventually(|| client.sends() == 1).await;
	eventually(|| sealed_files(dir.path()).is_empty()).await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(client.sends(), 1);

	let batches = client.uploaded_batches();
	let names: Vec<_> = batches[0].iter().map(|e| e["event"].clone()).collect();
	assert_eq!(names, (0..5).map(|i| Value::String(format!("Event {i}"))).collect::<Vec<_>>());
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn retryable_failure_keeps_batch_for_next_flush() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::scripted(vec![Err(NetworkError::new(ErrorStatus::ServerError, "HTTP 503"))]);
	let analytics = start(dir.path(), &client, Vec::new()).await;

	track(&analytics, "Kept");
	analytics.flush().unwrap();
	eventually(|| client.sends() == 1).await;
	assert_eq!(sealed_files(dir.path()).len(), 1);

	analytics.flush().unwrap();
	eventually(|| client.sends() == 2).await;
	eventually(|| sealed_files(dir.path()).is_empty()).await;

	let batches = client.uploaded_batches();
	assert_eq!(batches[0][0]["messageId"], batches[1][0]["messageId"]);
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_batch_is_deleted_without_retry() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::scripted(vec![Err(NetworkError::new(ErrorStatus::BadRequest, "HTTP 400"))]);
	let analytics = start(dir.path(), &client, Vec::new()).await;

	track(&analytics, "Malformed");
	analytics.flush().unwrap();
	eventually(|| client.sends() == 1).await;
	eventually(|| sealed_files(dir.path()).is_empty()).await;

	analytics.flush().unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(client.sends(), 1);
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn open_batches_are_never_uploaded() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::new();
	let analytics = start(dir.path(), &client, Vec::new()).await;

	let stray = dir.path().join(WRITE_KEY).join(format!("{WRITE_KEY}-99.tmp"));
	std::fs::write(&stray, r#"{"batch":[{"event":"stray"}"#).unwrap();

	track(&analytics, "Pending");
	let open = dir.path().join(WRITE_KEY).join(format!("{WRITE_KEY}-0.tmp"));
	eventually(|| open.exists()).await;
	assert_eq!(batch_files(dir.path(), true).len(), 2);
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(client.sends(), 0);

	analytics.flush().unwrap();
	eventually(|| client.sends() == 1).await;
	let batches = client.uploaded_batches();
	assert_eq!(batches[0].len(), 1);
	assert_eq!(batches[0][0]["event"], "Pending");
	assert!(stray.exists());
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_source_disables_it() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::scripted(vec![Err(NetworkError::new(ErrorStatus::ResourceNotFound, "HTTP 404"))]);
	let analytics = start(dir.path(), &client, Vec::new()).await;
	assert!(analytics.source_config().is_enabled());

	track(&analytics, "Orphan");
	analytics.flush().unwrap();
	eventually(|| !analytics.source_config().is_enabled()).await;
	eventually(|| sealed_files(dir.path()).is_empty()).await;
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_write_key_stops_uploads() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::scripted(vec![Err(NetworkError::new(ErrorStatus::InvalidWriteKey, "HTTP 401"))]);
	let analytics = start(dir.path(), &client, Vec::new()).await;

	track(&analytics, "Unauthorized");
	analytics.flush().unwrap();
	eventually(|| analytics.is_upload_disabled()).await;
	eventually(|| sealed_files(dir.path()).is_empty()).await;

	track(&analytics, "Later");
	analytics.flush().unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(client.sends(), 1);
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn anonymous_id_change_uploads_separate_batches() {
	let dir = tempdir().unwrap();
	let client = RecordingClient::new();
	let analytics = start(dir.path(), &client, Vec::new()).await;

	let first = analytics.anonymous_id();
	track(&analytics, "Before reset");
	analytics.reset(ResetEntries::default()).unwrap();
	let second = analytics.anonymous_id();
	track(&analytics, "After reset");
	analytics.flush().unwrap();

	eventually(|| client.sends() == 2).await;
	assert_eq!(*client.headers.lock().unwrap(), vec![first.clone(), second.clone()]);
	let batches = client.uploaded_batches();
	assert_eq!(batches[0][0]["anonymousId"], first);
	assert_eq!(batches[1][0]["anonymousId"], second);
	analytics.shutdown().await.unwrap();
}

#[tokio::test]
async fn events_survive_restart_and_startup_policy_uploads_them() {
	let dir = tempdir().unwrap();
	let offline = RecordingClient::new();
	let first = start(dir.path(), &offline, Vec::new()).await;
	for i in 0..3 {
		track(&first, &format!("Offline {i}"));
	}
	first.shutdown().await.unwrap();
	assert_eq!(offline.sends(), 0);
	assert_eq!(sealed_files(dir.path()).len(), 1);

	let client = RecordingClient::new();
	let second = start(dir.path(), &client, vec![FlushPolicyConfig::Startup]).await;
	track(&second, "Online");

	eventually(|| client.sends() == 2).await;
	let total: usize = client.uploaded_batches().iter().map(Vec::len).sum();
	assert_eq!(total, 4);
	eventually(|| sealed_files(dir.path()).is_empty()).await;
	second.shutdown().await.unwrap();
}

#[tokio::test]
async fn uploads_gzipped_batches_over_http() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/batch"))
		.and(header("Content-Encoding", "gzip"))
		.and(header("Authorization", "Basic d2s6"))
		.respond_with(ResponseTemplate::new(200).set_body_string("OK"))
		.mount(&server)
		.await;

	let dir = tempdir().unwrap();
	let config = Configuration::builder(WRITE_KEY, server.uri())
		.storage_dir(dir.path())
		.flush_policies(vec![FlushPolicyConfig::Count { threshold: 2 }])
		.fetch_source_config(false)
		.build()
		.unwrap();
	let analytics = Analytics::new(config).await.unwrap();

	analytics
		.identify("user-1", JsonMap::new(), EventOptions::new())
		.unwrap();
	track(&analytics, "Checkout");

	let server_ref = &server;
	eventually_async(move || async move {
		server_ref
			.received_requests()
			.await
			.is_some_and(|requests| requests.len() == 1)
	})
	.await;
	let requests = server.received_requests().await.unwrap();
	let mut decoded = String::new();
	GzDecoder::new(requests[0].body.as_slice())
		.read_to_string(&mut decoded)
		.unwrap();
	let body: Value = serde_json::from_str(&decoded).unwrap();
	let events = body["batch"].as_array().unwrap();
	assert_eq!(events.len(), 2);
	assert_eq!(events[0]["type"], "identify");
	assert_eq!(events[1]["userId"], "user-1");
	assert!(requests[0].headers.get("AnonymousId").is_some());

	eventually(|| sealed_files(dir.path()).is_empty()).await;
	analytics.shutdown().await.unwrap();
}
