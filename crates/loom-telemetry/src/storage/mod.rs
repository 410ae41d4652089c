// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local persistence for the telemetry pipeline.
//!
//! [`Storage`] is the contract the event queue and the analytics facade depend
//! on: a small typed key-value area plus the batch file operations. The
//! default implementation is [`FileStorage`], which keeps both under one
//! directory per write key.

mod batch;
mod file;
mod properties;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

pub use batch::{BatchFileStore, MAX_BATCH_SIZE, MAX_EVENT_SIZE};
pub use file::FileStorage;
pub use properties::PropertiesStore;

/// Keys of the persisted key-value area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	AnonymousId,
	UserId,
	Traits,
	ExternalIds,
	SourceConfigPayload,
	SourceIsEnabled,
	FileIndex,
	LastEventAnonymousId,
	AppVersion,
	AppBuild,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::AnonymousId => "anonymous_id",
			StorageKey::UserId => "user_id",
			StorageKey::Traits => "traits",
			StorageKey::ExternalIds => "external_ids",
			StorageKey::SourceConfigPayload => "source_config_payload",
			StorageKey::SourceIsEnabled => "source_is_enabled",
			StorageKey::FileIndex => "file_index",
			StorageKey::LastEventAnonymousId => "last_event_anonymous_id",
			StorageKey::AppVersion => "app_version",
			StorageKey::AppBuild => "app_build",
		}
	}
}

/// A value in the key-value area.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageValue {
	Bool(bool),
	Int(i32),
	Long(i64),
	String(String),
}

impl From<bool> for StorageValue {
	fn from(value: bool) -> Self {
		StorageValue::Bool(value)
	}
}

impl From<i32> for StorageValue {
	fn from(value: i32) -> Self {
		StorageValue::Int(value)
	}
}

impl From<i64> for StorageValue {
	fn from(value: i64) -> Self {
		StorageValue::Long(value)
	}
}

impl From<String> for StorageValue {
	fn from(value: String) -> Self {
		StorageValue::String(value)
	}
}

impl From<&str> for StorageValue {
	fn from(value: &str) -> Self {
		StorageValue::String(value.to_string())
	}
}

/// Persistence used by the event queue and the analytics facade.
#[async_trait]
pub trait Storage: Send + Sync {
	async fn write(&self, key: StorageKey, value: StorageValue) -> Result<()>;
	async fn remove(&self, key: StorageKey) -> Result<()>;

	async fn read_string(&self, key: StorageKey, default: &str) -> String;
	async fn read_int(&self, key: StorageKey, default: i32) -> i32;
	async fn read_long(&self, key: StorageKey, default: i64) -> i64;
	async fn read_boolean(&self, key: StorageKey, default: bool) -> bool;

	/// Appends one serialized event to the open batch.
	async fn append_event(&self, payload: &str) -> Result<()>;

	/// Lists sealed batch files, oldest first.
	async fn read_file_list(&self) -> Result<Vec<PathBuf>>;

	/// Deletes a batch file. Returns false if it did not exist.
	async fn remove_file(&self, path: &std::path::Path) -> bool;

	/// Seals the open batch, if any, so it shows up in `read_file_list`.
	async fn rollover(&self) -> Result<()>;

	/// Seals the open batch and releases file handles.
	async fn close(&self) -> Result<()>;

	/// Removes every batch file and stored value.
	async fn delete(&self) -> Result<()>;
}
