// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.
//!
//! Configuration is either built in code with [`Configuration::builder`] or
//! loaded from layered sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. a TOML file (`$XDG_CONFIG_HOME/loom/telemetry.toml` by default)
//! 3. `LOOM_TELEMETRY_*` environment variables
//!
//! ```toml
//! write_key = "2AbC..."
//! data_plane_url = "https://hosted.rudderlabs.com"
//! gzip = true
//!
//! [[flush_policies]]
//! kind = "count"
//! threshold = 20
//!
//! [[flush_policies]]
//! kind = "frequency"
//! interval_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;
use crate::policy::{FlushPolicyConfig, DEFAULT_FLUSH_AT, DEFAULT_FLUSH_INTERVAL_MS};

/// Control plane used when none is configured.
pub const DEFAULT_CONTROL_PLANE_URL: &str = "https://api.rudderlabs.com";

const ENV_PREFIX: &str = "LOOM_TELEMETRY_";
const CONFIG_FILE_NAME: &str = "telemetry.toml";

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
	pub write_key: String,
	pub data_plane_url: String,
	pub control_plane_url: String,
	/// Compress upload bodies with gzip.
	pub gzip: bool,
	pub flush_policies: Vec<FlushPolicyConfig>,
	/// Directory holding one sub-directory per write key.
	pub storage_dir: PathBuf,
	pub request_timeout: Duration,
	pub backoff: BackoffConfig,
	/// Add `context.library` to every event.
	pub track_library_info: bool,
	/// Fetch the source configuration on startup.
	pub fetch_source_config: bool,
}

impl Configuration {
	pub fn builder(
		write_key: impl Into<String>,
		data_plane_url: impl Into<String>,
	) -> ConfigurationBuilder {
		ConfigurationBuilder::new(write_key, data_plane_url)
	}
}

/// Builder for [`Configuration`].
pub struct ConfigurationBuilder {
	layer: ConfigLayer,
	flush_policies: Option<Vec<FlushPolicyConfig>>,
	backoff: Option<BackoffConfig>,
}

impl ConfigurationBuilder {
	pub fn new(write_key: impl Into<String>, data_plane_url: impl Into<String>) -> Self {
		Self {
			layer: ConfigLayer {
				write_key: Some(write_key.into()),
				data_plane_url: Some(data_plane_url.into()),
				..ConfigLayer::default()
			},
			flush_policies: None,
			backoff: None,
		}
	}

	pub fn control_plane_url(mut self, url: impl Into<String>) -> Self {
		self.layer.control_plane_url = Some(url.into());
		self
	}

	pub fn gzip(mut self, enabled: bool) -> Self {
		self.layer.gzip = Some(enabled);
		self
	}

	pub fn flush_policies(mut self, policies: Vec<FlushPolicyConfig>) -> Self {
		self.flush_policies = Some(policies);
		self
	}

	pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.layer.storage_dir = Some(dir.into());
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.layer.request_timeout_secs = Some(timeout.as_secs().max(1));
		self
	}

	pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
		self.backoff = Some(backoff);
		self
	}

	pub fn track_library_info(mut self, enabled: bool) -> Self {
		self.layer.track_library_info = Some(enabled);
		self
	}

	pub fn fetch_source_config(mut self, enabled: bool) -> Self {
		self.layer.fetch_source_config = Some(enabled);
		self
	}

	pub fn build(self) -> Result<Configuration, ConfigError> {
		let mut config = self.layer.finalize()?;
		if let Some(policies) = self.flush_policies {
			config.flush_policies = policies;
		}
		if let Some(backoff) = self.backoff {
			config.backoff = backoff;
		}
		Ok(config)
	}
}

/// A partial configuration from one source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
	pub write_key: Option<String>,
	pub data_plane_url: Option<String>,
	pub control_plane_url: Option<String>,
	pub gzip: Option<bool>,
	pub flush_at: Option<usize>,
	pub flush_interval_ms: Option<u64>,
	pub flush_policies: Option<Vec<FlushPolicyConfig>>,
	pub storage_dir: Option<PathBuf>,
	pub request_timeout_secs: Option<u64>,
	pub backoff_interval_ms: Option<u64>,
	pub backoff_base: Option<f64>,
	pub max_attempts: Option<u32>,
	pub cool_off_secs: Option<u64>,
	pub track_library_info: Option<bool>,
	pub fetch_source_config: Option<bool>,
}

impl ConfigLayer {
	/// Overlays `other` on top of `self`.
	pub fn merge(&mut self, other: ConfigLayer) {
		macro_rules! take {
			($($field:ident),* $(,)?) => {
				$(if other.$field.is_some() {
					self.$field = other.$field;
				})*
			};
		}
		take!(
			write_key,
			data_plane_url,
			control_plane_url,
			gzip,
			flush_at,
			flush_interval_ms,
			flush_policies,
			storage_dir,
			request_timeout_secs,
			backoff_interval_ms,
			backoff_base,
			max_attempts,
			cool_off_secs,
			track_library_info,
			fetch_source_config,
		);
	}

	/// Loads a layer from a TOML file. A missing file yields an empty layer.
	pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			debug!(path = %path.display(), "config file not found, skipping");
			return Ok(Self::default());
		}

		debug!(path = %path.display(), "loading config file");
		let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
			path: path.to_path_buf(),
			source: e,
		})?;
		toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source: e,
		})
	}

	/// Loads a layer from `LOOM_TELEMETRY_*` variables.
	pub fn from_env() -> Result<Self, ConfigError> {
		debug!("loading environment variables");
		Ok(Self {
			write_key: env_var("WRITE_KEY"),
			data_plane_url: env_var("DATA_PLANE_URL"),
			control_plane_url: env_var("CONTROL_PLANE_URL"),
			gzip: env_bool("GZIP"),
			flush_at: env_parse("FLUSH_AT")?,
			flush_interval_ms: env_parse("FLUSH_INTERVAL_MS")?,
			flush_policies: None,
			storage_dir: env_var("STORAGE_DIR").map(PathBuf::from),
			request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS")?,
			backoff_interval_ms: env_parse("BACKOFF_INTERVAL_MS")?,
			backoff_base: env_parse("BACKOFF_BASE")?,
			max_attempts: env_parse("MAX_ATTEMPTS")?,
			cool_off_secs: env_parse("COOL_OFF_SECS")?,
			track_library_info: env_bool("TRACK_LIBRARY_INFO"),
			fetch_source_config: env_bool("FETCH_SOURCE_CONFIG"),
		})
	}

	/// Applies defaults and validates required fields.
	pub fn finalize(self) -> Result<Configuration, ConfigError> {
		let write_key = self
			.write_key
			.filter(|k| !k.trim().is_empty())
			.ok_or_else(|| ConfigError::MissingField("write_key".to_string()))?;
		let data_plane_url = self
			.data_plane_url
			.filter(|u| !u.trim().is_empty())
			.ok_or_else(|| ConfigError::MissingField("data_plane_url".to_string()))?;

		let flush_policies = match self.flush_policies {
			Some(policies) => policies,
			None if self.flush_at.is_some() || self.flush_interval_ms.is_some() => vec![
				FlushPolicyConfig::Count {
					threshold: self.flush_at.unwrap_or(DEFAULT_FLUSH_AT),
				},
				FlushPolicyConfig::Frequency {
					interval_ms: self.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
				},
			],
			None => FlushPolicyConfig::defaults(),
		};

		let storage_dir = match self.storage_dir {
			Some(dir) => dir,
			None => default_storage_dir()?,
		};

		let defaults = BackoffConfig::default();
		let backoff = BackoffConfig {
			interval_ms: self.backoff_interval_ms.unwrap_or(defaults.interval_ms),
			base: self.backoff_base.unwrap_or(defaults.base),
			max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
			cool_off: self
				.cool_off_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.cool_off),
		};

		Ok(Configuration {
			write_key,
			data_plane_url,
			control_plane_url: self
				.control_plane_url
				.unwrap_or_else(|| DEFAULT_CONTROL_PLANE_URL.to_string()),
			gzip: self.gzip.unwrap_or(true),
			flush_policies,
			storage_dir,
			request_timeout: Duration::from_secs(self.request_timeout_secs.unwrap_or(30)),
			backoff,
			track_library_info: self.track_library_info.unwrap_or(true),
			fetch_source_config: self.fetch_source_config.unwrap_or(true),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(format!("{ENV_PREFIX}{name}"))
		.ok()
		.filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: format!("{ENV_PREFIX}{name}"),
			message: format!("invalid value '{v}'"),
		}),
		None => Ok(None),
	}
}

/// `$XDG_CONFIG_HOME/loom/telemetry.toml`, if a config directory exists.
pub fn default_config_file() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("loom").join(CONFIG_FILE_NAME))
}

/// `$XDG_DATA_HOME/loom/telemetry`.
pub fn default_storage_dir() -> Result<PathBuf, ConfigError> {
	dirs::data_dir()
		.map(|dir| dir.join("loom").join("telemetry"))
		.ok_or(ConfigError::DataDirNotFound)
}

/// Loads configuration from the default file and the environment.
pub fn load_config() -> Result<Configuration, ConfigError> {
	let mut merged = ConfigLayer::default();
	if let Some(path) = default_config_file() {
		merged.merge(ConfigLayer::from_toml_file(&path)?);
	}
	merged.merge(ConfigLayer::from_env()?);
	merged.finalize()
}

/// Loads configuration from `path` and the environment.
pub fn load_config_with_file(path: impl AsRef<Path>) -> Result<Configuration, ConfigError> {
	let mut merged = ConfigLayer::from_toml_file(path.as_ref())?;
	merged.merge(ConfigLayer::from_env()?);
	merged.finalize()
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn test_builder_defaults() {
		let config = Configuration::builder("wk", "https://dp.example.com")
			.storage_dir("/tmp/telemetry")
			.build()
			.unwrap();
		assert_eq!(config.control_plane_url, DEFAULT_CONTROL_PLANE_URL);
		assert!(config.gzip);
		assert_eq!(config.flush_policies, FlushPolicyConfig::defaults());
		assert_eq!(config.request_timeout, Duration::from_secs(30));
		assert_eq!(config.backoff, BackoffConfig::default());
		assert!(config.track_library_info);
		assert!(config.fetch_source_config);
	}

	#[test]
	fn test_builder_rejects_empty_write_key() {
		let err = Configuration::builder("  ", "https://dp.example.com")
			.storage_dir("/tmp")
			.build()
			.unwrap_err();
		assert!(matches!(err, ConfigError::MissingField(ref f) if f == "write_key"));
	}

	#[test]
	fn test_toml_layer() {
		let dir = tempdir().unwrap();
		let path = dir.path().join(CONFIG_FILE_NAME);
		std::fs::write(
			&path,
			r#"
write_key = "from-file"
data_plane_url = "https://file.example.com"
gzip = false
storage_dir = "/var/lib/telemetry"

[[flush_policies]]
kind = "startup"
"#,
		)
		.unwrap();

		let config = ConfigLayer::from_toml_file(&path).unwrap().finalize().unwrap();
		assert_eq!(config.write_key, "from-file");
		assert!(!config.gzip);
		assert_eq!(config.flush_policies, vec![FlushPolicyConfig::Startup]);
		assert_eq!(config.storage_dir, PathBuf::from("/var/lib/telemetry"));
	}

	#[test]
	fn test_missing_toml_file_is_empty_layer() {
		let layer = ConfigLayer::from_toml_file(Path::new("/nonexistent/telemetry.toml")).unwrap();
		assert!(layer.write_key.is_none());
	}

	#[test]
	fn test_invalid_toml_reports_path() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("bad.toml");
		std::fs::write(&path, "write_key = ").unwrap();
		let err = ConfigLayer::from_toml_file(&path).unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}

	#[test]
	fn test_merge_later_layer_wins() {
		let mut base = ConfigLayer {
			write_key: Some("base".to_string()),
			gzip: Some(true),
			..ConfigLayer::default()
		};
		base.merge(ConfigLayer {
			write_key: Some("override".to_string()),
			..ConfigLayer::default()
		});
		assert_eq!(base.write_key.as_deref(), Some("override"));
		assert_eq!(base.gzip, Some(true));
	}

	#[test]
	fn test_flush_at_builds_count_and_frequency() {
		let config = ConfigLayer {
			write_key: Some("wk".to_string()),
			data_plane_url: Some("https://dp".to_string()),
			flush_at: Some(5),
			storage_dir: Some(PathBuf::from("/tmp")),
			..ConfigLayer::default()
		}
		.finalize()
		.unwrap();
		assert_eq!(config.flush_policies, vec![
			FlushPolicyConfig::Count { threshold: 5 },
			FlushPolicyConfig::Frequency {
				interval_ms: DEFAULT_FLUSH_INTERVAL_MS
			},
		]);
	}
}
