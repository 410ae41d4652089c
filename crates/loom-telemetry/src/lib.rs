// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable client-side event pipeline for Loom telemetry.
//!
//! Events recorded through [`Analytics`] are stamped with the current user
//! identity, run through a staged [`PluginChain`], appended to on-disk batch
//! files and uploaded to the data plane when a flush policy fires.
//!
//! # Architecture
//!
//! ```text
//! Analytics::track ─▶ processor ─▶ PluginChain ─▶ DataplanePlugin ─▶ EventQueue
//!                                  PreProcess        (Destination)    write stage ─▶ batch files
//!                                  OnProcess                          upload stage ─▶ NetworkClient
//! ```
//!
//! - Batches live under `{storage_dir}/{write_key}/` as `{write_key}-{n}`
//!   once sealed and `{write_key}-{n}.tmp` while open, so events survive
//!   restarts.
//! - A batch is sealed before it grows past 500 KB, and whenever the
//!   anonymous id of consecutive events changes.
//! - Failed uploads are retried with exponential backoff. Rejected batches
//!   are deleted.
//!
//! # Example
//!
//! ```no_run
//! use loom_telemetry::{Analytics, Configuration, EventOptions, FlushPolicyConfig, Properties};
//!
//! # async fn run() -> loom_telemetry::Result<()> {
//! let config = Configuration::builder("WRITE_KEY", "https://hosted.rudderlabs.com")
//!     .flush_policies(vec![FlushPolicyConfig::Count { threshold: 20 }])
//!     .build()?;
//! let analytics = Analytics::new(config).await?;
//!
//! analytics.track("Session Started", Properties::new().insert("editor", "vscode"), EventOptions::new())?;
//! analytics.flush()?;
//! analytics.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod backoff;
pub mod config;
pub mod error;
pub mod network;
pub mod plugin;
pub mod plugins;
pub mod policy;
pub mod queue;
pub mod source_config;
pub mod storage;

pub use analytics::{Analytics, AnalyticsBuilder};
pub use backoff::{BackoffConfig, BackoffPolicy, ExponentialBackoff, MaxAttemptsExponentialBackoff};
pub use config::{load_config, load_config_with_file, Configuration, ConfigurationBuilder};
pub use error::{ConfigError, Result, TelemetryError};
pub use network::{ErrorStatus, HttpClient, HttpClientBuilder, NetworkClient, NetworkError, NetworkResult};
pub use plugin::{Plugin, PluginChain, PluginContext, PluginError, PluginStage};
pub use policy::{FlushPolicies, FlushPolicy, FlushPolicyConfig};
pub use queue::EventQueue;
pub use source_config::SourceConfigManager;
pub use storage::{FileStorage, Storage, StorageKey, StorageValue};

pub use loom_telemetry_core::{
	Event, EventKind, EventOptions, ExternalId, JsonMap, Properties, ResetEntries, SourceConfig,
	UserIdentity,
};
