// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Network access for batch uploads and source-config fetches.
//!
//! [`NetworkClient`] is the seam the event queue and the source-config manager
//! talk to. [`HttpClient`] is the reqwest implementation:
//!
//! - `POST {data_plane}/v1/batch` with basic auth, an optional gzip body and
//!   an `AnonymousId` header carrying the base64 anonymous id of the batch.
//! - `GET {control_plane}/sourceConfig?p=rust&v=<version>` with basic auth.
//!
//! Failures are classified by [`ErrorStatus::from_status_code`].

use std::io::Write;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Result, TelemetryError};

/// SDK version for identification.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
/// SDK name for identification.
pub const SDK_NAME: &str = "loom-telemetry";

const BATCH_PATH: &str = "v1/batch";
const SOURCE_CONFIG_PATH: &str = "sourceConfig";
const PLATFORM: &str = "rust";
const ANONYMOUS_ID_HEADER: &str = "AnonymousId";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
	BadRequest,
	InvalidWriteKey,
	ResourceNotFound,
	PayloadTooLarge,
	TooManyRequests,
	ServerError,
	NetworkTimeout,
	RetryError,
	GeneralError,
}

impl ErrorStatus {
	/// Maps a non-2xx HTTP status to its classification.
	///
	/// | status            | classification     | retried |
	/// |-------------------|--------------------|---------|
	/// | 400               | `BadRequest`       | no      |
	/// | 401, 403          | `InvalidWriteKey`  | no      |
	/// | 404               | `ResourceNotFound` | no      |
	/// | 408               | `NetworkTimeout`   | yes     |
	/// | 413               | `PayloadTooLarge`  | no      |
	/// | 429               | `TooManyRequests`  | yes     |
	/// | other 4xx         | `BadRequest`       | no      |
	/// | 5xx               | `ServerError`      | yes     |
	/// | anything else     | `RetryError`       | yes     |
	pub fn from_status_code(status: u16) -> Self {
		match status {
			400 => ErrorStatus::BadRequest,
			401 | 403 => ErrorStatus::InvalidWriteKey,
			404 => ErrorStatus::ResourceNotFound,
			408 => ErrorStatus::NetworkTimeout,
			413 => ErrorStatus::PayloadTooLarge,
			429 => ErrorStatus::TooManyRequests,
			400..=499 => ErrorStatus::BadRequest,
			500..=599 => ErrorStatus::ServerError,
			_ => ErrorStatus::RetryError,
		}
	}

	/// Retryable failures leave the batch on disk for the next attempt.
	pub fn is_retryable(self) -> bool {
		matches!(
			self,
			ErrorStatus::TooManyRequests
				| ErrorStatus::ServerError
				| ErrorStatus::NetworkTimeout
				| ErrorStatus::RetryError
				| ErrorStatus::GeneralError
		)
	}
}

/// A failed request together with its classification.
#[derive(Debug, Clone, Error)]
#[error("{status:?}: {message}")]
pub struct NetworkError {
	pub status: ErrorStatus,
	pub message: String,
}

impl NetworkError {
	pub fn new(status: ErrorStatus, message: impl Into<String>) -> Self {
		Self {
			status,
			message: message.into(),
		}
	}
}

/// Response body on success, classified error on failure.
pub type NetworkResult = std::result::Result<String, NetworkError>;

/// Transport used by the upload stage and the source-config manager.
#[async_trait]
pub trait NetworkClient: Send + Sync {
	/// Fetches the source configuration.
	async fn get_data(&self) -> NetworkResult;

	/// Uploads one sealed batch.
	async fn send_data(&self, body: String) -> NetworkResult;

	/// Sets the anonymous id sent with subsequent uploads.
	fn update_anonymous_id_header(&self, anonymous_id: &str);
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
	write_key: Option<String>,
	data_plane_url: Option<String>,
	control_plane_url: Option<String>,
	gzip: bool,
	request_timeout: Duration,
}

impl HttpClientBuilder {
	pub fn new() -> Self {
		Self {
			write_key: None,
			data_plane_url: None,
			control_plane_url: None,
			gzip: true,
			request_timeout: Duration::from_secs(30),
		}
	}

	pub fn write_key(mut self, write_key: impl Into<String>) -> Self {
		self.write_key = Some(write_key.into());
		self
	}

	/// Example: `https://hosted.rudderlabs.com`
	pub fn data_plane_url(mut self, url: impl Into<String>) -> Self {
		self.data_plane_url = Some(url.into());
		self
	}

	/// Example: `https://api.rudderlabs.com`
	pub fn control_plane_url(mut self, url: impl Into<String>) -> Self {
		self.control_plane_url = Some(url.into());
		self
	}

	pub fn gzip(mut self, enabled: bool) -> Self {
		self.gzip = enabled;
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	pub fn build(self) -> Result<HttpClient> {
		let write_key = self
			.write_key
			.filter(|k| !k.is_empty())
			.ok_or(TelemetryError::InvalidWriteKey)?;
		let data_plane_url = self
			.data_plane_url
			.ok_or_else(|| TelemetryError::InvalidBaseUrl("missing data plane URL".to_string()))?;
		let control_plane_url = self
			.control_plane_url
			.unwrap_or_else(|| crate::config::DEFAULT_CONTROL_PLANE_URL.to_string());

		let batch_url = join_url(&data_plane_url, BATCH_PATH)?;
		let mut source_config_url = join_url(&control_plane_url, SOURCE_CONFIG_PATH)?;
		source_config_url
			.query_pairs_mut()
			.append_pair("p", PLATFORM)
			.append_pair("v", SDK_VERSION);

		let client = Client::builder()
			.user_agent(user_agent())
			.connect_timeout(CONNECT_TIMEOUT)
			.timeout(self.request_timeout)
			.build()?;

		debug!(
			batch_url = %batch_url,
			source_config_url = %source_config_url,
			gzip = self.gzip,
			"built telemetry HTTP client"
		);

		Ok(HttpClient {
			client,
			write_key,
			batch_url,
			source_config_url,
			gzip: self.gzip,
			anonymous_id_header: RwLock::new(None),
		})
	}
}

impl Default for HttpClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn join_url(base: &str, path: &str) -> Result<Url> {
	let base = format!("{}/", base.trim_end_matches('/'));
	Url::parse(&base)
		.and_then(|url| url.join(path))
		.map_err(|e| TelemetryError::InvalidBaseUrl(format!("{base}: {e}")))
}

/// The `User-Agent` sent with every request.
pub fn user_agent() -> String {
	format!(
		"{SDK_NAME}/{SDK_VERSION} ({}-{})",
		std::env::consts::OS,
		std::env::consts::ARCH
	)
}

/// reqwest-backed [`NetworkClient`].
pub struct HttpClient {
	client: Client,
	write_key: String,
	batch_url: Url,
	source_config_url: Url,
	gzip: bool,
	anonymous_id_header: RwLock<Option<String>>,
}

impl HttpClient {
	pub fn builder() -> HttpClientBuilder {
		HttpClientBuilder::new()
	}

	pub fn batch_url(&self) -> &Url {
		&self.batch_url
	}

	pub fn source_config_url(&self) -> &Url {
		&self.source_config_url
	}

	fn anonymous_id_header(&self) -> Option<String> {
		self
			.anonymous_id_header
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}

	async fn finish(&self, request: reqwest::RequestBuilder) -> NetworkResult {
		let response = request.send().await.map_err(classify_transport_error)?;
		let status = response.status();
		let body = response.text().await.map_err(classify_transport_error)?;

		if status.is_success() {
			Ok(body)
		} else {
			let error_status = ErrorStatus::from_status_code(status.as_u16());
			warn!(status = status.as_u16(), classification = ?error_status, "request rejected");
			Err(NetworkError::new(
				error_status,
				format!("HTTP {}: {body}", status.as_u16()),
			))
		}
	}
}

fn classify_transport_error(e: reqwest::Error) -> NetworkError {
	if e.is_timeout() {
		NetworkError::new(ErrorStatus::NetworkTimeout, e.to_string())
	} else {
		NetworkError::new(ErrorStatus::GeneralError, e.to_string())
	}
}

fn gzip(body: &str) -> std::io::Result<Vec<u8>> {
	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	encoder.write_all(body.as_bytes())?;
	encoder.finish()
}

#[async_trait]
impl NetworkClient for HttpClient {
	async fn get_data(&self) -> NetworkResult {
		debug!(url = %self.source_config_url, "fetching source config");
		let request = self
			.client
			.get(self.source_config_url.clone())
			.basic_auth(&self.write_key, Some(""));
		self.finish(request).await
	}

	async fn send_data(&self, body: String) -> NetworkResult {
		let mut request = self
			.client
			.post(self.batch_url.clone())
			.basic_auth(&self.write_key, Some(""))
			.header(CONTENT_TYPE, "application/json");

		if let Some(anonymous_id) = self.anonymous_id_header() {
			request = request.header(ANONYMOUS_ID_HEADER, anonymous_id);
		}

		request = if self.gzip {
			let compressed = gzip(&body)
				.map_err(|e| NetworkError::new(ErrorStatus::GeneralError, e.to_string()))?;
			request.header(CONTENT_ENCODING, "gzip").body(compressed)
		} else {
			request.body(body)
		};

		self.finish(request).await
	}

	fn update_anonymous_id_header(&self, anonymous_id: &str) {
		let encoded = BASE64.encode(anonymous_id.as_bytes());
		*self
			.anonymous_id_header
			.write()
			.unwrap_or_else(|e| e.into_inner()) = Some(encoded);
	}
}
